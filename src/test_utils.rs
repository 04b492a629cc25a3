#![allow(dead_code)] // used by lib and test suites individually

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use opentelemetry_sdk::{
    error::OTelSdkResult,
    metrics::{
        InstrumentKind, ManualReader, Pipeline, Temporality,
        data::{AggregatedMetrics, MetricData, ResourceMetrics},
        reader::MetricReader,
    },
};
use service_metrics::{BackendClient, BackendKind, ErrorReporter, MetricsError, TagSet};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleKind {
    Count,
    Timing,
    Gauge,
}

/// A sample captured by [`RecordingClient`].
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedSample {
    pub kind: SampleKind,
    pub name: String,
    pub value: f64,
    pub tags: TagSet,
}

/// Backend which keeps every sample in memory.
#[derive(Clone, Debug, Default)]
pub struct RecordingClient {
    samples: Arc<Mutex<Vec<RecordedSample>>>,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> Vec<RecordedSample> {
        self.samples.lock().unwrap().clone()
    }

    pub fn samples_named(&self, name: &str) -> Vec<RecordedSample> {
        self.samples()
            .into_iter()
            .filter(|sample| sample.name == name)
            .collect()
    }

    /// Poll until at least `count` samples named `name` exist, or `timeout` elapses.
    pub fn wait_for(&self, name: &str, count: usize, timeout: Duration) -> Vec<RecordedSample> {
        let deadline = Instant::now() + timeout;
        loop {
            let samples = self.samples_named(name);
            if samples.len() >= count || Instant::now() >= deadline {
                return samples;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn push(&self, kind: SampleKind, name: &str, value: f64, tags: &TagSet) {
        self.samples.lock().unwrap().push(RecordedSample {
            kind,
            name: name.to_string(),
            value,
            tags: tags.clone(),
        });
    }
}

impl BackendClient for RecordingClient {
    #[expect(clippy::cast_precision_loss)]
    fn emit_count(&self, name: &str, delta: u64, tags: &TagSet) {
        self.push(SampleKind::Count, name, delta as f64, tags);
    }

    fn emit_timing(&self, name: &str, duration_ms: f64, tags: &TagSet) {
        self.push(SampleKind::Timing, name, duration_ms, tags);
    }

    fn emit_gauge_sample(&self, name: &str, value: f64, tags: &TagSet) {
        self.push(SampleKind::Gauge, name, value, tags);
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Custom
    }
}

/// Error reporter which keeps `(error, context)` pairs in memory.
#[derive(Clone, Debug, Default)]
pub struct RecordingReporter {
    reports: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<(String, String)> {
        self.reports.lock().unwrap().clone()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, error: &MetricsError, context: &str) {
        self.reports
            .lock()
            .unwrap()
            .push((error.to_string(), context.to_string()));
    }
}

/// A `ManualReader` which can be handed to a meter provider and still collected from the test.
#[derive(Clone, Debug)]
pub struct SharedManualReader {
    reader: Arc<ManualReader>,
}

impl SharedManualReader {
    pub fn new(reader: ManualReader) -> Self {
        Self {
            reader: Arc::new(reader),
        }
    }

    pub fn collect(&self) -> ResourceMetrics {
        let mut metrics = ResourceMetrics::default();
        self.reader.collect(&mut metrics).unwrap();
        metrics
    }
}

impl MetricReader for SharedManualReader {
    fn register_pipeline(&self, pipeline: std::sync::Weak<Pipeline>) {
        self.reader.register_pipeline(pipeline);
    }

    fn collect(&self, rm: &mut ResourceMetrics) -> OTelSdkResult {
        self.reader.collect(rm)
    }

    fn force_flush(&self) -> OTelSdkResult {
        self.reader.force_flush()
    }

    fn shutdown(&self) -> OTelSdkResult {
        self.reader.shutdown()
    }

    fn shutdown_with_timeout(&self, timeout: Duration) -> OTelSdkResult {
        self.reader.shutdown_with_timeout(timeout)
    }

    fn temporality(&self, kind: InstrumentKind) -> Temporality {
        self.reader.temporality(kind)
    }
}

/// A reader whose shutdown blocks for a fixed time, like one flushing to an unreachable collector.
#[derive(Debug)]
pub struct SlowShutdownReader {
    reader: ManualReader,
    delay: Duration,
}

impl SlowShutdownReader {
    pub fn new(delay: Duration) -> Self {
        Self {
            reader: ManualReader::builder().build(),
            delay,
        }
    }
}

impl MetricReader for SlowShutdownReader {
    fn register_pipeline(&self, pipeline: std::sync::Weak<Pipeline>) {
        self.reader.register_pipeline(pipeline);
    }

    fn collect(&self, rm: &mut ResourceMetrics) -> OTelSdkResult {
        self.reader.collect(rm)
    }

    fn force_flush(&self) -> OTelSdkResult {
        self.reader.force_flush()
    }

    fn shutdown(&self) -> OTelSdkResult {
        std::thread::sleep(self.delay);
        self.reader.shutdown()
    }

    fn shutdown_with_timeout(&self, timeout: Duration) -> OTelSdkResult {
        std::thread::sleep(self.delay);
        self.reader.shutdown_with_timeout(timeout)
    }

    fn temporality(&self, kind: InstrumentKind) -> Temporality {
        self.reader.temporality(kind)
    }
}

/// One `f64` gauge data point, narrowed to what the tests compare. Attributes are sorted by key.
#[derive(Debug, PartialEq)]
pub struct GaugePoint {
    pub name: String,
    pub value: f64,
    pub attributes: Vec<(String, String)>,
}

pub fn collect_gauge_points(reader: &SharedManualReader) -> Vec<GaugePoint> {
    let metrics = reader.collect();
    let mut points = Vec::new();
    for scope in metrics.scope_metrics() {
        for metric in scope.metrics() {
            if let AggregatedMetrics::F64(MetricData::Gauge(gauge)) = metric.data() {
                for dp in gauge.data_points() {
                    let mut attributes: Vec<(String, String)> = dp
                        .attributes()
                        .map(|kv| (kv.key.as_str().to_string(), kv.value.as_str().to_string()))
                        .collect();
                    attributes.sort();
                    points.push(GaugePoint {
                        name: metric.name().to_string(),
                        value: dp.value(),
                        attributes,
                    });
                }
            }
        }
    }
    points
}

pub fn collect_sums(reader: &SharedManualReader) -> Vec<(String, u64)> {
    let metrics = reader.collect();
    let mut sums = Vec::new();
    for scope in metrics.scope_metrics() {
        for metric in scope.metrics() {
            if let AggregatedMetrics::U64(MetricData::Sum(sum)) = metric.data() {
                sums.push((
                    metric.name().to_string(),
                    sum.data_points().map(|dp| dp.value()).sum(),
                ));
            }
        }
    }
    sums
}
