use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use opentelemetry_sdk::{
    Resource,
    error::OTelSdkError,
    metrics::{PeriodicReader, SdkMeterProvider},
};

use crate::{
    BackendClient, BackendKind, ConfigureError, Counter, EnvironmentFacts, ErrorReporter, Gauge,
    MetricsError, PeriodicGauge, SampleError, ShutdownError, TagSet, Timer, TracingErrorReporter,
    backend::{BackendSelection, NoopClient, OtelGaugeClient, UdpSampleClient, select_backend},
    config::{MetricsConfigBuilder, PeriodicGaugeOptions, SERVICE_METRICS_SERVICE_NAME},
    metric::{GaugeRegistration, LastValue, MetricCore},
    scheduler::PeriodicGaugeScheduler,
};

/// Smallest interval a periodic gauge is sampled at.
const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(1);

/// Largest interval a periodic gauge is sampled at.
pub const MAX_SAMPLE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// The per-service composition root: owns the base tags, the backends and the periodic gauge
/// scheduler, and hands out metric handles bound to them.
///
/// This instance is created by calling [`service_metrics::configure()`][crate::configure]. It is
/// cheap to clone; all clones share the same backends.
#[derive(Clone)]
pub struct MetricsManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    service_name: String,
    base_tags: TagSet,
    enabled: bool,
    client: Arc<dyn BackendClient>,
    periodic_client: Arc<dyn BackendClient>,
    scheduler: PeriodicGaugeScheduler,
    reporter: Arc<dyn ErrorReporter>,
    shutdown_timeout: Duration,
    scheduler_stop_timeout: Duration,
    shut_down: AtomicBool,
}

impl MetricsManager {
    /// Define a counter named `{service}.{name}`.
    ///
    /// Every sample carries the base tags, then `tags`, then any per-call tags; a later tag
    /// with the same key replaces the earlier value.
    pub fn counter(&self, name: &str, tags: TagSet) -> Counter {
        Counter {
            core: self.core(name, &tags, &self.inner.client),
        }
    }

    /// Define a timer named `{service}.{name}`, reporting milliseconds.
    pub fn timer(&self, name: &str, tags: TagSet) -> Timer {
        Timer {
            core: self.core(name, &tags, &self.inner.client),
        }
    }

    /// Define a gauge named `{service}.{name}`, set directly by the caller.
    pub fn gauge(&self, name: &str, tags: TagSet) -> Gauge {
        Gauge {
            core: self.core(name, &tags, &self.inner.client),
        }
    }

    /// Define a gauge named `{service}.{name}` whose value is pulled from `sample_fn` every
    /// `interval` by the background scheduler.
    ///
    /// Nothing is sampled until the first interval (less a small random jitter) has elapsed.
    /// `interval` is clamped to between 1 ms and [`MAX_SAMPLE_INTERVAL`] (one day).
    /// Defining the same name again replaces the earlier registration. An error returned (or a
    /// panic raised) by `sample_fn` skips that tick and is passed to the error reporter; the gauge
    /// stays registered.
    ///
    /// After [`shutdown`](Self::shutdown) has begun, and while metrics are disabled, the gauge is
    /// not registered and `sample_fn` is never called; see [`PeriodicGauge::is_registered`].
    pub fn periodic_gauge<F>(
        &self,
        name: &str,
        sample_fn: F,
        interval: Duration,
        tags: TagSet,
    ) -> PeriodicGauge
    where
        F: Fn() -> Result<f64, SampleError> + Send + Sync + 'static,
    {
        let name = self.full_name(name);
        let interval = if interval < MIN_SAMPLE_INTERVAL {
            tracing::warn!(%name, ?interval, "periodic gauge interval too small, using 1ms");
            MIN_SAMPLE_INTERVAL
        } else if interval > MAX_SAMPLE_INTERVAL {
            tracing::warn!(%name, ?interval, "periodic gauge interval too large, using one day");
            MAX_SAMPLE_INTERVAL
        } else {
            interval
        };
        let last_value = Arc::new(LastValue::new());

        let registered = if self.inner.enabled {
            let registration = GaugeRegistration {
                name: name.clone(),
                sample_fn: Arc::new(sample_fn),
                interval,
                tags: self.inner.base_tags.merge(&tags),
                last_value: last_value.clone(),
            };
            match self.inner.scheduler.register(registration) {
                Ok(()) => true,
                Err(error) => {
                    tracing::warn!(%error, "periodic gauge rejected");
                    self.inner
                        .reporter
                        .report(&error, "registering periodic gauge");
                    false
                }
            }
        } else {
            false
        };

        PeriodicGauge {
            name,
            interval,
            last_value,
            registered,
        }
    }

    /// The service name every metric is prefixed with.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    /// Tags added to every sample.
    #[must_use]
    pub fn base_tags(&self) -> &TagSet {
        &self.inner.base_tags
    }

    /// Which backend counters, timers and gauges are bound to.
    #[must_use]
    pub fn backend_kind(&self) -> BackendKind {
        self.inner.client.kind()
    }

    /// Which backend periodic gauge samples are reported to.
    #[must_use]
    pub fn periodic_backend_kind(&self) -> BackendKind {
        self.inner.periodic_client.kind()
    }

    /// Create a shutdown guard that will automatically shut down the manager when dropped.
    ///
    /// # Example
    ///
    /// ```rust
    /// fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let metrics = service_metrics::configure()
    ///         .with_service_name("billing")
    ///         .finish()?;
    ///
    ///     let guard = metrics.clone().shutdown_guard();
    ///
    ///     metrics.counter("Invoices", Default::default()).increment();
    ///
    ///     guard.shutdown()?;
    ///     Ok(())
    /// }
    /// ```
    pub fn shutdown_guard(self) -> ShutdownGuard {
        ShutdownGuard {
            manager: Some(self),
        }
    }

    /// Stop the periodic gauge scheduler, then release the backends.
    ///
    /// Blocks for at most the configured shutdown timeout. A scheduler or periodic gauge backend
    /// which does not stop in time is abandoned and reported. Calling this again is a no-op.
    ///
    /// Metric handles stay usable afterwards; their samples are dropped.
    ///
    /// # Errors
    ///
    /// Returns the first error raised while releasing a backend.
    pub fn shutdown(&self) -> Result<(), ShutdownError> {
        let inner = &self.inner;
        if inner.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // a timeout too large to add to `now` is effectively unbounded
        let deadline = Instant::now().checked_add(inner.shutdown_timeout);
        let remaining = || {
            deadline.map_or(Duration::MAX, |deadline| {
                deadline.saturating_duration_since(Instant::now())
            })
        };

        if let Err(error) = inner
            .scheduler
            .stop(inner.scheduler_stop_timeout.min(remaining()))
        {
            inner.reporter.report(&error, "stopping periodic gauge scheduler");
        }

        let mut result = match inner.periodic_client.shutdown(remaining()) {
            Err(ShutdownError::OtelError(OTelSdkError::Timeout(timeout))) => {
                let error = MetricsError::ShutdownTimeout {
                    component: "periodic gauge backend",
                    timeout,
                };
                tracing::warn!(%error, "abandoning periodic gauge backend shutdown");
                inner.reporter.report(&error, "shutting down periodic gauge backend");
                Ok(())
            }
            result => result,
        };
        if !Arc::ptr_eq(&inner.client, &inner.periodic_client) {
            result = result.and(inner.client.shutdown(remaining()));
        }

        tracing::debug!(service = %inner.service_name, "metrics manager shut down");
        result
    }

    fn full_name(&self, name: &str) -> Arc<str> {
        if name.is_empty() {
            tracing::warn!("metric defined with an empty name, using `unnamed`");
            return format!("{}.unnamed", self.inner.service_name).into();
        }
        format!("{}.{name}", self.inner.service_name).into()
    }

    fn core(&self, name: &str, tags: &TagSet, backend: &Arc<dyn BackendClient>) -> MetricCore {
        MetricCore {
            name: self.full_name(name),
            tags: self.inner.base_tags.merge(tags),
            backend: backend.clone(),
        }
    }

    /// Called by `MetricsConfigBuilder::finish()`.
    pub(crate) fn from_config_builder(
        config: MetricsConfigBuilder,
        env: Option<&HashMap<String, String>>,
    ) -> Result<MetricsManager, ConfigureError> {
        let ManagerParts {
            service_name,
            base_tags,
            enabled,
            client,
            periodic_client,
            reporter,
            shutdown_timeout,
            scheduler_stop_timeout,
        } = Self::build_parts(config, env)?;

        let scheduler = PeriodicGaugeScheduler::new(periodic_client.clone(), reporter.clone());
        if enabled {
            scheduler.start();
        }

        tracing::info!(
            service = %service_name,
            backend = %client.kind(),
            periodic_backend = %periodic_client.kind(),
            "metrics configured"
        );

        Ok(MetricsManager {
            inner: Arc::new(ManagerInner {
                service_name,
                base_tags,
                enabled,
                client,
                periodic_client,
                scheduler,
                reporter,
                shutdown_timeout,
                scheduler_stop_timeout,
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    fn build_parts(
        config: MetricsConfigBuilder,
        env: Option<&HashMap<String, String>>,
    ) -> Result<ManagerParts, ConfigureError> {
        let service_name = SERVICE_METRICS_SERVICE_NAME
            .resolve(config.service_name, env)?
            .filter(|name| !name.trim().is_empty())
            .ok_or(ConfigureError::ServiceNameRequired)?;

        let reporter = config
            .error_reporter
            .unwrap_or_else(|| Arc::new(TracingErrorReporter));
        let advanced = config.advanced.unwrap_or_default();

        let (facts, tags_complete) = match config.environment_facts {
            Some(facts) => (facts, true),
            None => {
                let resolved = EnvironmentFacts::resolve_each(env);
                for e in resolved.errors {
                    let error = MetricsError::Environment(e);
                    tracing::warn!(%error, "environment fact unavailable");
                    reporter.report(&error, "resolving environment facts");
                }
                (resolved.facts, resolved.tags_complete)
            }
        };

        let enabled = config.enabled.unwrap_or(facts.enabled);

        let base_tags = if tags_complete {
            TagSet::new()
                .with_optional("env", facts.env.clone())
                .with_optional("region", facts.region.clone())
                .with_optional("container", facts.container_id.clone())
                .with("service", service_name.clone())
        } else {
            tracing::warn!("base tags unavailable, metrics will carry only their own tags");
            TagSet::new()
        };

        let client: Arc<dyn BackendClient> = match advanced.client {
            Some(client) if enabled => client,
            _ => sampling_client(enabled, &facts, &*reporter),
        };

        let periodic_client = match config.periodic_gauges {
            Some(options) if enabled => periodic_gauge_client(
                options,
                facts.otlp_endpoint.as_deref(),
                &service_name,
                advanced.resources,
                env,
                &*reporter,
            ),
            _ => None,
        }
        .unwrap_or_else(|| client.clone());

        Ok(ManagerParts {
            service_name,
            base_tags,
            enabled,
            client,
            periodic_client,
            reporter,
            shutdown_timeout: advanced.shutdown_timeout,
            scheduler_stop_timeout: advanced.scheduler_stop_timeout,
        })
    }
}

fn sampling_client(
    enabled: bool,
    facts: &EnvironmentFacts,
    reporter: &dyn ErrorReporter,
) -> Arc<dyn BackendClient> {
    let missing = match select_backend(
        enabled,
        facts.backend_host.as_deref(),
        facts.backend_port,
    ) {
        BackendSelection::Disabled => {
            tracing::debug!("metrics disabled, samples will be dropped");
            return Arc::new(NoopClient);
        }
        BackendSelection::Active { host, port } => {
            return match UdpSampleClient::connect(host, port, facts.connect_timeout) {
                Ok(client) => Arc::new(client),
                Err(error) => {
                    tracing::warn!(%error, "falling back to no-op sampling backend");
                    reporter.report(&error, "connecting sampling backend");
                    Arc::new(NoopClient)
                }
            };
        }
        BackendSelection::MissingHost => "STATSD_HOST",
        BackendSelection::MissingPort => "STATSD_PORT",
    };

    let error = MetricsError::ConfigurationIncomplete { missing };
    tracing::warn!(%error, "falling back to no-op sampling backend");
    reporter.report(&error, "selecting sampling backend");
    Arc::new(NoopClient)
}

/// Build the OpenTelemetry backend for periodic gauges, or `None` if it has nowhere to export to.
fn periodic_gauge_client(
    options: PeriodicGaugeOptions,
    otlp_endpoint: Option<&str>,
    service_name: &str,
    resources: Vec<Resource>,
    env: Option<&HashMap<String, String>>,
    reporter: &dyn ErrorReporter,
) -> Option<Arc<dyn BackendClient>> {
    let mut meter_provider_builder = SdkMeterProvider::builder();
    let mut has_reader = false;

    if let Some(endpoint) = otlp_endpoint {
        match crate::exporters::metric_exporter_with_env(endpoint, None, env) {
            Ok(exporter) => {
                let mut reader = PeriodicReader::builder(exporter);
                if let Some(interval) = options.export_interval {
                    reader = reader.with_interval(interval);
                }
                meter_provider_builder = meter_provider_builder.with_reader(reader.build());
                has_reader = true;
            }
            Err(e) => {
                let error = MetricsError::TransportConstructionFailed {
                    address: endpoint.to_string(),
                    source: e.into(),
                };
                tracing::warn!(%error, "periodic gauge exporter unavailable");
                reporter.report(&error, "building periodic gauge exporter");
            }
        }
    }

    for reader in options.additional_readers {
        meter_provider_builder = meter_provider_builder.with_reader(reader);
        has_reader = true;
    }

    if !has_reader {
        tracing::warn!("no periodic gauge exporter configured, using the sampling backend");
        return None;
    }

    meter_provider_builder = meter_provider_builder.with_resource(
        Resource::builder()
            .with_service_name(service_name.to_string())
            .build(),
    );
    for resource in resources {
        meter_provider_builder = meter_provider_builder.with_resource(resource);
    }

    Some(Arc::new(OtelGaugeClient::new(meter_provider_builder.build())))
}

/// A guard that automatically shuts down the metrics manager when dropped.
///
/// Create this guard by calling [`MetricsManager::shutdown_guard()`].
#[must_use = "this should be kept alive until metrics should be stopped"]
pub struct ShutdownGuard {
    manager: Option<MetricsManager>,
}

impl ShutdownGuard {
    /// Shut down the metrics manager now.
    ///
    /// # Errors
    ///
    /// See [`ShutdownError`] for possible errors.
    pub fn shutdown(mut self) -> Result<(), ShutdownError> {
        self.shutdown_inner()
    }

    fn shutdown_inner(&mut self) -> Result<(), ShutdownError> {
        if let Some(manager) = self.manager.take() {
            manager.shutdown()?;
        }
        Ok(())
    }
}

#[allow(clippy::print_stderr)]
impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        if let Err(error) = self.shutdown_inner() {
            eprintln!("failed to shut down metrics cleanly: {error:#?}");
        }
    }
}

impl std::fmt::Debug for MetricsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsManager")
            .field("service_name", &self.inner.service_name)
            .field("base_tags", &self.inner.base_tags)
            .field("client", &self.inner.client)
            .field("periodic_client", &self.inner.periodic_client)
            .finish_non_exhaustive()
    }
}

struct ManagerParts {
    service_name: String,
    base_tags: TagSet,
    enabled: bool,
    client: Arc<dyn BackendClient>,
    periodic_client: Arc<dyn BackendClient>,
    reporter: Arc<dyn ErrorReporter>,
    shutdown_timeout: Duration,
    scheduler_stop_timeout: Duration,
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        net::UdpSocket,
        sync::{
            Arc,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
        time::{Duration, Instant},
    };

    use opentelemetry_sdk::metrics::ManualReader;

    use super::{MAX_SAMPLE_INTERVAL, MetricsManager};
    use crate::{
        BackendClient, BackendKind, ConfigureError, EnvironmentFacts, ShutdownError, TagSet,
        config::{AdvancedOptions, MetricsConfigBuilder, PeriodicGaugeOptions},
        configure,
        test_utils::{
            RecordingClient, RecordingReporter, SampleKind, SharedManualReader,
            SlowShutdownReader, collect_gauge_points,
        },
    };

    fn env(vars: &[(&str, &str)]) -> HashMap<String, String> {
        vars.iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn build(config: MetricsConfigBuilder, vars: &[(&str, &str)]) -> MetricsManager {
        MetricsManager::from_config_builder(config, Some(&env(vars)))
            .expect("failed to configure metrics")
    }

    #[test]
    fn test_backend_selection_from_env() {
        let listener = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port().to_string();

        for (vars, expected, reports) in [
            (
                vec![("SERVICE_METRICS_ENABLED", "false"), ("STATSD_HOST", "127.0.0.1")],
                BackendKind::Noop,
                0,
            ),
            (vec![("STATSD_PORT", port.as_str())], BackendKind::Noop, 1),
            (vec![("STATSD_HOST", "127.0.0.1")], BackendKind::Noop, 1),
            (
                vec![("STATSD_HOST", "127.0.0.1"), ("STATSD_PORT", port.as_str())],
                BackendKind::Udp,
                0,
            ),
        ] {
            let reporter = RecordingReporter::new();
            let manager = build(
                configure()
                    .with_service_name("svc")
                    .with_error_reporter(reporter.clone()),
                &vars,
            );
            assert_eq!(manager.backend_kind(), expected, "{vars:?}");
            assert_eq!(manager.periodic_backend_kind(), expected, "{vars:?}");
            assert_eq!(reporter.reports().len(), reports, "{vars:?}");
            manager.shutdown().unwrap();
        }
    }

    #[test]
    fn test_service_name_required() {
        for config in [configure(), configure().with_service_name("  ")] {
            let result = MetricsManager::from_config_builder(config, Some(&env(&[])));
            assert!(matches!(result, Err(ConfigureError::ServiceNameRequired)));
        }

        let manager = build(configure(), &[("OTEL_SERVICE_NAME", "from-env")]);
        assert_eq!(manager.service_name(), "from-env");
    }

    #[test]
    fn test_unparsable_port_counts_as_missing() {
        let reporter = RecordingReporter::new();
        let manager = build(
            configure()
                .with_service_name("svc")
                .with_error_reporter(reporter.clone()),
            &[
                ("SERVICE_METRICS_ENV", "prod"),
                ("STATSD_HOST", "127.0.0.1"),
                ("STATSD_PORT", "not-a-port"),
            ],
        );

        assert_eq!(manager.backend_kind(), BackendKind::Noop);
        assert_eq!(manager.base_tags().serialize(), "env=prod,service=svc");
        assert_eq!(
            reporter.reports(),
            vec![
                (
                    "failed to resolve environment facts: Invalid configuration value for STATSD_PORT: not-a-port"
                        .to_string(),
                    "resolving environment facts".to_string()
                ),
                (
                    "metrics backend enabled but `STATSD_PORT` is not configured; samples will be dropped"
                        .to_string(),
                    "selecting sampling backend".to_string()
                ),
            ]
        );
        manager.shutdown().unwrap();
    }

    #[test]
    fn test_unparsable_connect_timeout_keeps_backend() {
        let listener = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port().to_string();
        let reporter = RecordingReporter::new();
        let manager = build(
            configure()
                .with_service_name("svc")
                .with_error_reporter(reporter.clone()),
            &[
                ("STATSD_HOST", "127.0.0.1"),
                ("STATSD_PORT", port.as_str()),
                ("SERVICE_METRICS_CONNECT_TIMEOUT_MS", "1s"),
            ],
        );

        assert_eq!(manager.backend_kind(), BackendKind::Udp);
        assert_eq!(manager.base_tags().serialize(), "service=svc");
        let reports = reporter.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(
            reports[0].0,
            "failed to resolve environment facts: Invalid configuration value for SERVICE_METRICS_CONNECT_TIMEOUT_MS: 1s"
        );
        manager.shutdown().unwrap();
    }

    #[test]
    fn test_base_tags_and_composition() {
        let client = RecordingClient::new();
        let manager = build(
            configure()
                .with_service_name("checkout")
                .with_environment_facts(
                    EnvironmentFacts::default()
                        .with_env("prod")
                        .with_container_id("abc123"),
                )
                .with_advanced_options(AdvancedOptions::default().with_client(client.clone())),
            &[],
        );

        assert_eq!(
            manager.base_tags().serialize(),
            "env=prod,container=abc123,service=checkout"
        );

        let requests = manager.counter("Requests", TagSet::from_iter([("region", "eu")]));
        assert_eq!(requests.name(), "checkout.Requests");
        requests.increment();

        let samples = client.samples();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].kind, SampleKind::Count);
        assert_eq!(samples[0].name, "checkout.Requests");
        assert_eq!(
            samples[0].tags.serialize(),
            "env=prod,container=abc123,service=checkout,region=eu"
        );

        manager.shutdown().unwrap();
    }

    #[test]
    fn test_disabled_overrides_custom_client() {
        let client = RecordingClient::new();
        let manager = build(
            configure()
                .with_service_name("svc")
                .with_metrics_enabled(false)
                .with_advanced_options(AdvancedOptions::default().with_client(client.clone())),
            &[],
        );

        assert_eq!(manager.backend_kind(), BackendKind::Noop);
        manager.counter("Requests", TagSet::new()).increment();
        manager.timer("Latency", TagSet::new()).record(Duration::from_millis(3));
        assert!(client.samples().is_empty());
    }

    #[test]
    fn test_periodic_gauges_use_otel_reader() {
        let reader = SharedManualReader::new(ManualReader::builder().build());
        let manager = build(
            configure()
                .with_service_name("svc")
                .with_environment_facts(EnvironmentFacts::default().with_env("test"))
                .with_periodic_gauges(Some(
                    PeriodicGaugeOptions::default().with_additional_reader(reader.clone()),
                )),
            &[],
        );
        assert_eq!(manager.periodic_backend_kind(), BackendKind::OpenTelemetry);
        assert_eq!(manager.backend_kind(), BackendKind::Noop);

        let gauge = manager.periodic_gauge(
            "QueueDepth",
            || Ok(12.0),
            Duration::from_millis(20),
            TagSet::from_iter([("queue", "orders")]),
        );
        assert!(gauge.is_registered());
        assert_eq!(gauge.name(), "svc.QueueDepth");

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        let mut points = collect_gauge_points(&reader);
        while points.is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
            points = collect_gauge_points(&reader);
        }
        assert_eq!(gauge.last_value(), Some(12.0));

        assert_eq!(points.len(), 1);
        assert_eq!(points[0].name, "svc.QueueDepth");
        assert!((points[0].value - 12.0).abs() < f64::EPSILON);
        assert_eq!(
            points[0].attributes,
            vec![
                ("env".to_string(), "test".to_string()),
                ("queue".to_string(), "orders".to_string()),
                ("service".to_string(), "svc".to_string()),
            ]
        );

        manager.shutdown().unwrap();
    }

    #[test]
    fn test_periodic_gauge_interval_is_clamped() {
        let manager = build(
            configure()
                .with_service_name("svc")
                .with_environment_facts(EnvironmentFacts::default())
                .with_periodic_gauges(None)
                .with_advanced_options(AdvancedOptions::default().with_client(RecordingClient::new())),
            &[],
        );

        let slow = manager.periodic_gauge("Yearly", || Ok(1.0), Duration::MAX, TagSet::new());
        assert!(slow.is_registered());
        assert_eq!(slow.interval(), MAX_SAMPLE_INTERVAL);

        let fast = manager.periodic_gauge("Busy", || Ok(1.0), Duration::ZERO, TagSet::new());
        assert_eq!(fast.interval(), Duration::from_millis(1));

        manager.shutdown().unwrap();
    }

    #[test]
    fn test_unbounded_shutdown_timeout() {
        let manager = build(
            configure()
                .with_service_name("svc")
                .with_environment_facts(EnvironmentFacts::default())
                .with_advanced_options(
                    AdvancedOptions::default()
                        .with_client(RecordingClient::new())
                        .with_shutdown_timeout(Duration::MAX),
                ),
            &[],
        );
        manager.shutdown().unwrap();
    }

    #[test]
    fn test_forced_scheduler_stop_is_reported() {
        let client = RecordingClient::new();
        let reporter = RecordingReporter::new();
        let manager = build(
            configure()
                .with_service_name("svc")
                .with_environment_facts(EnvironmentFacts::default())
                .with_error_reporter(reporter.clone())
                .with_periodic_gauges(None)
                .with_advanced_options(
                    AdvancedOptions::default()
                        .with_client(client.clone())
                        .with_scheduler_stop_timeout(Duration::from_millis(50)),
                ),
            &[],
        );

        let (entered_tx, entered_rx) = crossbeam_channel::bounded(1);
        let _stuck = manager.periodic_gauge(
            "Stuck",
            move || {
                let _ = entered_tx.try_send(());
                std::thread::sleep(Duration::from_millis(500));
                Ok(1.0)
            },
            Duration::from_millis(10),
            TagSet::new(),
        );
        entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        let started = Instant::now();
        manager.shutdown().unwrap();
        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(
            reporter.reports(),
            vec![(
                "periodic gauge scheduler did not shut down within 50ms".to_string(),
                "stopping periodic gauge scheduler".to_string()
            )]
        );
    }

    #[test]
    fn test_slow_periodic_backend_shutdown_is_bounded() {
        let reporter = RecordingReporter::new();
        let manager = build(
            configure()
                .with_service_name("svc")
                .with_environment_facts(EnvironmentFacts::default())
                .with_error_reporter(reporter.clone())
                .with_periodic_gauges(Some(
                    PeriodicGaugeOptions::default()
                        .with_additional_reader(SlowShutdownReader::new(Duration::from_secs(2))),
                ))
                .with_advanced_options(
                    AdvancedOptions::default()
                        .with_client(RecordingClient::new())
                        .with_shutdown_timeout(Duration::from_millis(200)),
                ),
            &[],
        );
        assert_eq!(manager.periodic_backend_kind(), BackendKind::OpenTelemetry);

        let started = Instant::now();
        manager.shutdown().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        let reports = reporter.reports();
        assert_eq!(reports.len(), 1);
        assert!(
            reports[0]
                .0
                .starts_with("periodic gauge backend did not shut down within"),
            "{reports:?}"
        );
        assert_eq!(reports[0].1, "shutting down periodic gauge backend");
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = ShutdownCountingClient {
            calls: calls.clone(),
        };
        let manager = build(
            configure()
                .with_service_name("svc")
                .with_environment_facts(EnvironmentFacts::default())
                .with_periodic_gauges(None)
                .with_advanced_options(AdvancedOptions::default().with_client(client)),
            &[],
        );

        manager.shutdown().unwrap();
        manager.shutdown().unwrap();
        manager.clone().shutdown().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_periodic_gauge_after_shutdown_is_rejected() {
        let reporter = RecordingReporter::new();
        let manager = build(
            configure()
                .with_service_name("svc")
                .with_environment_facts(EnvironmentFacts::default())
                .with_error_reporter(reporter.clone())
                .with_advanced_options(
                    AdvancedOptions::default().with_client(RecordingClient::new()),
                ),
            &[],
        );
        manager.shutdown().unwrap();

        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        let gauge = manager.periodic_gauge(
            "Late",
            move || {
                flag.store(true, Ordering::SeqCst);
                Ok(1.0)
            },
            Duration::from_millis(5),
            TagSet::new(),
        );

        assert!(!gauge.is_registered());
        std::thread::sleep(Duration::from_millis(30));
        assert!(!called.load(Ordering::SeqCst));
        assert_eq!(
            reporter.reports(),
            vec![(
                "periodic gauge `svc.Late` registered after shutdown; it will never be sampled"
                    .to_string(),
                "registering periodic gauge".to_string()
            )]
        );
    }

    #[test]
    fn test_shutdown_guard_drop() {
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let manager = build(
                configure()
                    .with_service_name("svc")
                    .with_environment_facts(EnvironmentFacts::default())
                    .with_advanced_options(AdvancedOptions::default().with_client(
                        ShutdownCountingClient {
                            calls: calls.clone(),
                        },
                    )),
                &[],
            );

            let _guard1 = manager.clone().shutdown_guard();
            let _guard2 = manager.shutdown_guard();
            assert_eq!(calls.load(Ordering::SeqCst), 0);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[derive(Debug)]
    struct ShutdownCountingClient {
        calls: Arc<AtomicUsize>,
    }

    impl BackendClient for ShutdownCountingClient {
        fn emit_count(&self, _: &str, _: u64, _: &TagSet) {}

        fn emit_timing(&self, _: &str, _: f64, _: &TagSet) {}

        fn emit_gauge_sample(&self, _: &str, _: f64, _: &TagSet) {}

        fn shutdown(&self, _: Duration) -> Result<(), ShutdownError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
