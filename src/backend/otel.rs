use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
    time::Duration,
};

use opentelemetry::{
    KeyValue,
    metrics::{Counter, Gauge, Histogram, Meter, MeterProvider as _},
};
use crossbeam_channel::RecvTimeoutError;
use opentelemetry_sdk::{error::OTelSdkError, metrics::SdkMeterProvider};

use crate::{
    ShutdownError, TagSet,
    backend::{BackendClient, BackendKind},
};

const METER_NAME: &str = "service-metrics";
const SHUTDOWN_THREAD_NAME: &str = "service-metrics-otel-shutdown";

/// Records samples into an OpenTelemetry [`SdkMeterProvider`].
///
/// This is the periodic gauge backend: the gauge scheduler records the latest sampled value of
/// each gauge, and the provider's readers export them on their own interval. Counts and timings
/// are supported too (as a `u64` counter and an `f64` histogram in milliseconds), so the client
/// can also be injected as the sampling backend.
///
/// Instruments are created on first use and cached by name.
pub struct OtelGaugeClient {
    meter_provider: SdkMeterProvider,
    meter: Meter,
    gauges: RwLock<HashMap<String, Gauge<f64>>>,
    counters: RwLock<HashMap<String, Counter<u64>>>,
    histograms: RwLock<HashMap<String, Histogram<f64>>>,
}

impl OtelGaugeClient {
    /// Create a client recording into `meter_provider`.
    #[must_use]
    pub fn new(meter_provider: SdkMeterProvider) -> Self {
        let meter = meter_provider.meter(METER_NAME);
        Self {
            meter_provider,
            meter,
            gauges: RwLock::default(),
            counters: RwLock::default(),
            histograms: RwLock::default(),
        }
    }

    /// The provider this client records into.
    #[must_use]
    pub fn meter_provider(&self) -> &SdkMeterProvider {
        &self.meter_provider
    }
}

impl std::fmt::Debug for OtelGaugeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtelGaugeClient")
            .field("meter_provider", &self.meter_provider)
            .finish_non_exhaustive()
    }
}

fn cached<I: Clone>(
    cache: &RwLock<HashMap<String, I>>,
    name: &str,
    build: impl FnOnce(String) -> I,
) -> I {
    if let Some(instrument) = cache
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(name)
    {
        return instrument.clone();
    }
    cache
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .entry(name.to_owned())
        .or_insert_with_key(|name| build(name.clone()))
        .clone()
}

fn attributes(tags: &TagSet) -> Vec<KeyValue> {
    tags.iter()
        .map(|(key, value)| KeyValue::new(key.to_owned(), value.to_owned()))
        .collect()
}

impl BackendClient for OtelGaugeClient {
    fn emit_count(&self, name: &str, delta: u64, tags: &TagSet) {
        cached(&self.counters, name, |name| self.meter.u64_counter(name).build())
            .add(delta, &attributes(tags));
    }

    fn emit_timing(&self, name: &str, duration_ms: f64, tags: &TagSet) {
        if !duration_ms.is_finite() || duration_ms < 0.0 {
            tracing::debug!(name, duration_ms, "dropping invalid timing");
            return;
        }
        cached(&self.histograms, name, |name| {
            self.meter.f64_histogram(name).with_unit("ms").build()
        })
        .record(duration_ms, &attributes(tags));
    }

    fn emit_gauge_sample(&self, name: &str, value: f64, tags: &TagSet) {
        if !value.is_finite() {
            tracing::debug!(name, value, "dropping non-finite gauge sample");
            return;
        }
        cached(&self.gauges, name, |name| self.meter.f64_gauge(name).build())
            .record(value, &attributes(tags));
    }

    fn kind(&self) -> BackendKind {
        BackendKind::OpenTelemetry
    }

    /// Shut down the meter provider, waiting at most `timeout`.
    ///
    /// The provider flushes its readers on shutdown without a bound of its own, so it runs on a
    /// helper thread. On timeout that thread is left to finish and
    /// `OTelSdkError::Timeout` is returned.
    fn shutdown(&self, timeout: Duration) -> Result<(), ShutdownError> {
        let meter_provider = self.meter_provider.clone();
        let (done_tx, done) = crossbeam_channel::bounded(1);
        std::thread::Builder::new()
            .name(SHUTDOWN_THREAD_NAME.to_string())
            .spawn(move || {
                let _ = done_tx.send(meter_provider.shutdown());
            })
            .map_err(|e| OTelSdkError::InternalFailure(e.to_string()))?;

        match done.recv_timeout(timeout) {
            Ok(result) => Ok(result?),
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(?timeout, "meter provider did not shut down in time");
                Err(OTelSdkError::Timeout(timeout).into())
            }
            Err(RecvTimeoutError::Disconnected) => Err(OTelSdkError::InternalFailure(
                "meter provider shutdown panicked".to_string(),
            )
            .into()),
        }
    }
}
