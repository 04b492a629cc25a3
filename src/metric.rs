use std::{
    fmt::Debug,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use crate::{BackendClient, TagSet};

/// The error type a periodic gauge's sample function may return.
pub type SampleError = Box<dyn std::error::Error + Send + Sync>;

pub(crate) type SampleFn = Arc<dyn Fn() -> Result<f64, SampleError> + Send + Sync>;

/// Name, tags and backend shared by every metric kind.
#[derive(Clone, Debug)]
pub(crate) struct MetricCore {
    /// `{service}.{metric}`
    pub(crate) name: Arc<str>,
    /// base tags merged with the tags declared on the metric
    pub(crate) tags: TagSet,
    pub(crate) backend: Arc<dyn BackendClient>,
}

impl MetricCore {
    fn tags_with(&self, per_call: &TagSet) -> TagSet {
        if per_call.is_empty() {
            self.tags.clone()
        } else {
            self.tags.merge(per_call)
        }
    }
}

/// A monotonically increasing count, dispatched to the backend on every call.
///
/// Created with [`MetricsManager::counter`][crate::MetricsManager::counter].
#[derive(Clone, Debug)]
pub struct Counter {
    pub(crate) core: MetricCore,
}

impl Counter {
    /// Increment by one.
    pub fn increment(&self) {
        self.increment_by(1);
    }

    /// Increment by `delta`.
    pub fn increment_by(&self, delta: u64) {
        self.core
            .backend
            .emit_count(&self.core.name, delta, &self.core.tags);
    }

    /// Increment by `delta`, adding `tags` to this sample only.
    pub fn increment_with(&self, delta: u64, tags: &TagSet) {
        self.core
            .backend
            .emit_count(&self.core.name, delta, &self.core.tags_with(tags));
    }

    /// The fully qualified metric name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.name
    }
}

/// Records durations, in milliseconds.
///
/// Created with [`MetricsManager::timer`][crate::MetricsManager::timer].
#[derive(Clone, Debug)]
pub struct Timer {
    pub(crate) core: MetricCore,
}

impl Timer {
    /// Record `duration`.
    pub fn record(&self, duration: Duration) {
        self.record_ms(duration_ms(duration));
    }

    /// Record a duration given in milliseconds. Negative and non-finite values are dropped.
    pub fn record_ms(&self, duration_ms: f64) {
        self.dispatch(duration_ms, &self.core.tags);
    }

    /// Record `duration`, adding `tags` to this sample only.
    pub fn record_with(&self, duration: Duration, tags: &TagSet) {
        self.dispatch(duration_ms(duration), &self.core.tags_with(tags));
    }

    /// Start timing; the elapsed time is recorded when the returned guard is dropped or
    /// [stopped](TimerGuard::stop).
    ///
    /// The guard also records while unwinding from a panic, so a timed block is measured
    /// exactly once however it exits.
    pub fn start(&self) -> TimerGuard<'_> {
        TimerGuard {
            timer: self,
            started: Instant::now(),
            tags: None,
            recorded: false,
        }
    }

    /// Time `f`, returning its result.
    ///
    /// The duration is recorded before an error result is returned or a panic continues to
    /// unwind.
    pub fn time<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.start();
        f()
    }

    /// The fully qualified metric name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.name
    }

    fn dispatch(&self, duration_ms: f64, tags: &TagSet) {
        if !duration_ms.is_finite() || duration_ms < 0.0 {
            tracing::debug!(name = %self.core.name, duration_ms, "dropping invalid timing");
            return;
        }
        self.core
            .backend
            .emit_timing(&self.core.name, duration_ms, tags);
    }
}

fn duration_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Scoped timing started by [`Timer::start`].
#[must_use = "the duration is recorded when the guard is dropped"]
pub struct TimerGuard<'a> {
    timer: &'a Timer,
    started: Instant,
    tags: Option<TagSet>,
    recorded: bool,
}

impl TimerGuard<'_> {
    /// Add `tags` to the sample recorded by this guard.
    pub fn with_tags(mut self, tags: TagSet) -> Self {
        self.tags = Some(tags);
        self
    }

    /// Time elapsed since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Record now instead of on drop, returning the recorded duration.
    pub fn stop(mut self) -> Duration {
        self.finish()
    }

    fn finish(&mut self) -> Duration {
        let elapsed = self.started.elapsed();
        if !self.recorded {
            self.recorded = true;
            match self.tags.take() {
                Some(tags) => self.timer.record_with(elapsed, &tags),
                None => self.timer.record(elapsed),
            }
        }
        elapsed
    }
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

impl Debug for TimerGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerGuard")
            .field("timer", &self.timer.name())
            .field("started", &self.started)
            .field("recorded", &self.recorded)
            .finish()
    }
}

/// A gauge set directly by application code.
///
/// Unlike counters and timers, gauges only carry the tags declared when they were defined.
///
/// Created with [`MetricsManager::gauge`][crate::MetricsManager::gauge].
#[derive(Clone, Debug)]
pub struct Gauge {
    pub(crate) core: MetricCore,
}

impl Gauge {
    /// Report `value` as the gauge's current value.
    pub fn set(&self, value: f64) {
        self.core
            .backend
            .emit_gauge_sample(&self.core.name, value, &self.core.tags);
    }

    /// The fully qualified metric name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.name
    }
}

/// Latest value sampled for a periodic gauge, shared between the handle and the scheduler.
#[derive(Debug)]
pub(crate) struct LastValue(AtomicU64);

// NaN is never stored as a sample, so it marks "not sampled yet"
const NOT_SAMPLED: u64 = 0x7ff8_0000_0000_0000;

impl LastValue {
    pub(crate) fn new() -> Self {
        Self(AtomicU64::new(NOT_SAMPLED))
    }

    pub(crate) fn store(&self, value: f64) {
        if value.is_finite() {
            self.0.store(value.to_bits(), Ordering::Relaxed);
        }
    }

    pub(crate) fn load(&self) -> Option<f64> {
        Some(f64::from_bits(self.0.load(Ordering::Relaxed))).filter(|v| !v.is_nan())
    }
}

/// Everything the scheduler needs to sample and report one periodic gauge.
#[derive(Clone)]
pub(crate) struct GaugeRegistration {
    pub(crate) name: Arc<str>,
    pub(crate) sample_fn: SampleFn,
    pub(crate) interval: Duration,
    pub(crate) tags: TagSet,
    pub(crate) last_value: Arc<LastValue>,
}

impl Debug for GaugeRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GaugeRegistration")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

/// A gauge sampled by the background scheduler on its own interval.
///
/// Created with [`MetricsManager::periodic_gauge`][crate::MetricsManager::periodic_gauge].
/// Defining another periodic gauge with the same name replaces this one's registration.
#[derive(Clone, Debug)]
pub struct PeriodicGauge {
    pub(crate) name: Arc<str>,
    pub(crate) interval: Duration,
    pub(crate) last_value: Arc<LastValue>,
    pub(crate) registered: bool,
}

impl PeriodicGauge {
    /// The fully qualified metric name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// How often the gauge is sampled.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// The most recent successfully sampled value, if any.
    #[must_use]
    pub fn last_value(&self) -> Option<f64> {
        self.last_value.load()
    }

    /// Whether the scheduler accepted this gauge. Registration is rejected once the manager has
    /// begun shutting down.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.registered
    }
}
