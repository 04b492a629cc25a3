//! Configuration options for the metrics manager.
//!
//! See [`MetricsConfigBuilder`] for documentation of all these options, and
//! [`EnvironmentFacts`] for the environment variables consulted when an option is not set.

use std::{collections::HashMap, marker::PhantomData, str::FromStr, sync::Arc, time::Duration};

use opentelemetry_sdk::metrics::reader::MetricReader;

use crate::{
    BackendClient, ConfigureError, ErrorReporter, internal::env::get_optional_env,
    manager::MetricsManager,
};

/// Builder for metrics configuration, returned from [`service_metrics::configure()`][crate::configure].
#[must_use = "call `.finish()` to complete metrics configuration."]
pub struct MetricsConfigBuilder {
    pub(crate) service_name: Option<String>,
    pub(crate) environment_facts: Option<EnvironmentFacts>,
    pub(crate) enabled: Option<bool>,
    pub(crate) error_reporter: Option<Arc<dyn ErrorReporter>>,
    pub(crate) periodic_gauges: Option<PeriodicGaugeOptions>,
    pub(crate) advanced: Option<AdvancedOptions>,
}

impl Default for MetricsConfigBuilder {
    fn default() -> Self {
        Self {
            service_name: None,
            environment_facts: None,
            enabled: None,
            error_reporter: None,
            periodic_gauges: Some(PeriodicGaugeOptions::default()),
            advanced: None,
        }
    }
}

impl MetricsConfigBuilder {
    /// Set the service name, used as the prefix of every metric name and as the `service` tag.
    ///
    /// Defaults to the value of `SERVICE_METRICS_SERVICE_NAME` or `OTEL_SERVICE_NAME`.
    pub fn with_service_name<T: Into<String>>(mut self, service_name: T) -> Self {
        self.service_name = Some(service_name.into());
        self
    }

    /// Supply the environment facts directly instead of reading them from the process
    /// environment.
    pub fn with_environment_facts(mut self, facts: EnvironmentFacts) -> Self {
        self.environment_facts = Some(facts);
        self
    }

    /// Override whether metrics are collected at all.
    ///
    /// Defaults to the enable flag of the environment facts.
    pub fn with_metrics_enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Set the sink for failures inside the metrics core.
    ///
    /// Defaults to [`TracingErrorReporter`][crate::TracingErrorReporter].
    pub fn with_error_reporter<T: ErrorReporter + 'static>(mut self, reporter: T) -> Self {
        self.error_reporter = Some(Arc::new(reporter));
        self
    }

    /// Configure [periodic gauge options](crate::config::PeriodicGaugeOptions).
    ///
    /// Set to `None` to disable the OpenTelemetry backend; periodic gauges are then reported
    /// through the sampling backend.
    pub fn with_periodic_gauges(mut self, options: Option<PeriodicGaugeOptions>) -> Self {
        self.periodic_gauges = options;
        self
    }

    /// Configure [advanced options](crate::config::AdvancedOptions).
    pub fn with_advanced_options(mut self, advanced: AdvancedOptions) -> Self {
        self.advanced = Some(advanced);
        self
    }

    /// Finish configuring the metrics manager.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigureError::ServiceNameRequired`] if no service name is available. Any
    /// problem with the environment or the backends is reported and degraded instead.
    pub fn finish(self) -> Result<MetricsManager, ConfigureError> {
        MetricsManager::from_config_builder(self, None)
    }
}

/// Facts about the running environment, consumed once when the manager is built.
///
/// Unset fields are read from the environment by [`EnvironmentFacts::from_env`]:
///
/// | field | environment variables | default |
/// |---|---|---|
/// | `enabled` | `SERVICE_METRICS_ENABLED` | `true` |
/// | `env` | `SERVICE_METRICS_ENV`, `DEPLOYMENT_ENVIRONMENT` | unset |
/// | `region` | `SERVICE_METRICS_REGION`, `AWS_REGION` | unset |
/// | `container_id` | `SERVICE_METRICS_CONTAINER_ID`, `HOSTNAME` | unset |
/// | `backend_host` | `STATSD_HOST` | unset |
/// | `backend_port` | `STATSD_PORT` | unset |
/// | `connect_timeout` | `SERVICE_METRICS_CONNECT_TIMEOUT_MS` | 1 second |
/// | `otlp_endpoint` | `OTEL_EXPORTER_OTLP_METRICS_ENDPOINT`, `OTEL_EXPORTER_OTLP_ENDPOINT` | unset |
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EnvironmentFacts {
    /// Whether metrics are collected at all.
    pub enabled: bool,
    /// Deployment environment, e.g. `prod`.
    pub env: Option<String>,
    /// Region the instance runs in.
    pub region: Option<String>,
    /// Container or host identifier.
    pub container_id: Option<String>,
    /// Host of the sampling backend agent.
    pub backend_host: Option<String>,
    /// Port of the sampling backend agent.
    pub backend_port: Option<u16>,
    /// How long to wait for the sampling backend host to resolve.
    pub connect_timeout: Duration,
    /// Base URL of the OTLP collector for the periodic gauge backend.
    pub otlp_endpoint: Option<String>,
}

impl Default for EnvironmentFacts {
    fn default() -> Self {
        Self {
            enabled: true,
            env: None,
            region: None,
            container_id: None,
            backend_host: None,
            backend_port: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            otlp_endpoint: None,
        }
    }
}

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

impl EnvironmentFacts {
    /// Read the facts from the process environment, or from `env` if provided.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to a value which cannot be parsed, or is not valid
    /// UTF-8.
    pub fn from_env(env: Option<&HashMap<String, String>>) -> Result<Self, ConfigureError> {
        Ok(Self {
            enabled: SERVICE_METRICS_ENABLED.resolve(None, env)?.0,
            env: SERVICE_METRICS_ENV.resolve(None, env)?,
            region: SERVICE_METRICS_REGION.resolve(None, env)?,
            container_id: SERVICE_METRICS_CONTAINER_ID.resolve(None, env)?,
            backend_host: STATSD_HOST.resolve(None, env)?,
            backend_port: STATSD_PORT.resolve(None, env)?,
            connect_timeout: Duration::from_millis(
                SERVICE_METRICS_CONNECT_TIMEOUT_MS.resolve(None, env)?,
            ),
            otlp_endpoint: OTLP_METRICS_ENDPOINT.resolve(None, env)?,
        })
    }

    /// Read each fact on its own, so one bad variable does not take the others down with it.
    ///
    /// A fact that fails to resolve falls back to its default (absent, for the optional ones)
    /// and its error is collected in [`ResolvedFacts::errors`].
    pub(crate) fn resolve_each(env: Option<&HashMap<String, String>>) -> ResolvedFacts {
        let mut errors = Vec::new();
        let defaults = Self::default();

        let enabled = or_default(
            SERVICE_METRICS_ENABLED.resolve(None, env).map(|flag| flag.0),
            defaults.enabled,
            &mut errors,
        );

        let before_tags = errors.len();
        let deployment_env = or_default(SERVICE_METRICS_ENV.resolve(None, env), None, &mut errors);
        let region = or_default(SERVICE_METRICS_REGION.resolve(None, env), None, &mut errors);
        let container_id = or_default(
            SERVICE_METRICS_CONTAINER_ID.resolve(None, env),
            None,
            &mut errors,
        );
        let tags_complete = errors.len() == before_tags;

        let backend_host = or_default(STATSD_HOST.resolve(None, env), None, &mut errors);
        let backend_port = or_default(STATSD_PORT.resolve(None, env), None, &mut errors);
        let connect_timeout = or_default(
            SERVICE_METRICS_CONNECT_TIMEOUT_MS
                .resolve(None, env)
                .map(Duration::from_millis),
            defaults.connect_timeout,
            &mut errors,
        );
        let otlp_endpoint = or_default(OTLP_METRICS_ENDPOINT.resolve(None, env), None, &mut errors);

        ResolvedFacts {
            facts: Self {
                enabled,
                env: deployment_env,
                region,
                container_id,
                backend_host,
                backend_port,
                connect_timeout,
                otlp_endpoint,
            },
            tags_complete,
            errors,
        }
    }

    /// Set whether metrics are collected.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the deployment environment.
    #[must_use]
    pub fn with_env<T: Into<String>>(mut self, env: T) -> Self {
        self.env = Some(env.into());
        self
    }

    /// Set the region.
    #[must_use]
    pub fn with_region<T: Into<String>>(mut self, region: T) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Set the container identifier.
    #[must_use]
    pub fn with_container_id<T: Into<String>>(mut self, container_id: T) -> Self {
        self.container_id = Some(container_id.into());
        self
    }

    /// Set the sampling backend address.
    #[must_use]
    pub fn with_backend<T: Into<String>>(mut self, host: T, port: u16) -> Self {
        self.backend_host = Some(host.into());
        self.backend_port = Some(port);
        self
    }

    /// Set how long to wait for the sampling backend host to resolve.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the OTLP collector base URL.
    #[must_use]
    pub fn with_otlp_endpoint<T: Into<String>>(mut self, endpoint: T) -> Self {
        self.otlp_endpoint = Some(endpoint.into());
        self
    }
}

/// Facts read by [`EnvironmentFacts::resolve_each`].
pub(crate) struct ResolvedFacts {
    pub(crate) facts: EnvironmentFacts,
    /// `false` if a fact feeding the base tags could not be resolved.
    pub(crate) tags_complete: bool,
    pub(crate) errors: Vec<ConfigureError>,
}

fn or_default<T>(result: Result<T, ConfigureError>, default: T, errors: &mut Vec<ConfigureError>) -> T {
    result.unwrap_or_else(|e| {
        errors.push(e);
        default
    })
}

/// Configuration of the periodic gauge backend.
#[derive(Default)]
pub struct PeriodicGaugeOptions {
    /// Metric readers used in addition to the OTLP exporter (if an endpoint is configured).
    pub(crate) additional_readers: Vec<BoxedMetricReader>,
    pub(crate) export_interval: Option<Duration>,
}

impl PeriodicGaugeOptions {
    /// Add a metric reader to the list of additional readers.
    #[must_use]
    pub fn with_additional_reader<T: MetricReader>(mut self, reader: T) -> Self {
        self.additional_readers
            .push(BoxedMetricReader::new(Box::new(reader)));
        self
    }

    /// How often the OTLP exporter pushes the recorded gauge values.
    ///
    /// Defaults to the OpenTelemetry SDK's periodic reader interval.
    #[must_use]
    pub fn with_export_interval(mut self, interval: Duration) -> Self {
        self.export_interval = Some(interval);
        self
    }
}

/// Options used for fine-grained control over the metrics manager.
pub struct AdvancedOptions {
    pub(crate) client: Option<Arc<dyn BackendClient>>,
    pub(crate) shutdown_timeout: Duration,
    pub(crate) scheduler_stop_timeout: Duration,
    pub(crate) resources: Vec<opentelemetry_sdk::Resource>,
}

impl Default for AdvancedOptions {
    fn default() -> Self {
        Self {
            client: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            scheduler_stop_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            resources: Vec::new(),
        }
    }
}

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

impl AdvancedOptions {
    /// Use `client` as the sampling backend, bypassing backend selection.
    ///
    /// The client is still replaced by a no-op client when metrics are disabled.
    #[must_use]
    pub fn with_client<T: BackendClient + 'static>(mut self, client: T) -> Self {
        self.client = Some(Arc::new(client));
        self
    }

    /// Upper bound on the whole of [`MetricsManager::shutdown`].
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// How long to wait for an in-flight gauge sample when stopping the scheduler.
    #[must_use]
    pub fn with_scheduler_stop_timeout(mut self, timeout: Duration) -> Self {
        self.scheduler_stop_timeout = timeout;
        self
    }

    /// Add a [`Resource`](opentelemetry_sdk::Resource) to the meter provider of the periodic
    /// gauge backend.
    #[must_use]
    pub fn with_resource(mut self, resource: opentelemetry_sdk::Resource) -> Self {
        self.resources.push(resource);
        self
    }
}

/// Wrapper around a `MetricReader` to use in `additional_readers`.
#[derive(Debug)]
pub(crate) struct BoxedMetricReader(Box<dyn MetricReader>);

impl BoxedMetricReader {
    pub fn new(reader: Box<dyn MetricReader>) -> Self {
        BoxedMetricReader(reader)
    }
}

impl MetricReader for BoxedMetricReader {
    fn register_pipeline(&self, pipeline: std::sync::Weak<opentelemetry_sdk::metrics::Pipeline>) {
        self.0.register_pipeline(pipeline);
    }

    fn collect(
        &self,
        rm: &mut opentelemetry_sdk::metrics::data::ResourceMetrics,
    ) -> opentelemetry_sdk::error::OTelSdkResult {
        self.0.collect(rm)
    }

    fn force_flush(&self) -> opentelemetry_sdk::error::OTelSdkResult {
        self.0.force_flush()
    }

    fn shutdown(&self) -> opentelemetry_sdk::error::OTelSdkResult {
        self.0.shutdown()
    }

    fn shutdown_with_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> opentelemetry_sdk::error::OTelSdkResult {
        self.0.shutdown_with_timeout(timeout)
    }

    fn temporality(
        &self,
        kind: opentelemetry_sdk::metrics::InstrumentKind,
    ) -> opentelemetry_sdk::metrics::Temporality {
        self.0.temporality(kind)
    }
}

/// A boolean switch accepting `true/false`, `yes/no`, `on/off` and `1/0`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Flag(pub(crate) bool);

impl FromStr for Flag {
    type Err = ConfigureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(Flag(true)),
            "false" | "no" | "off" | "0" => Ok(Flag(false)),
            _ => Err(ConfigureError::InvalidConfigurationValue {
                parameter: "SERVICE_METRICS_ENABLED",
                value: s.to_owned(),
            }),
        }
    }
}

pub(crate) trait ParseConfigValue: Sized {
    fn parse_config_value(s: &str) -> Option<Self>;
}

impl<T: FromStr> ParseConfigValue for T {
    fn parse_config_value(s: &str) -> Option<Self> {
        s.trim().parse().ok()
    }
}

pub(crate) struct ConfigValue<T> {
    env_vars: &'static [&'static str],
    default_value: fn() -> T,
}

impl<T> ConfigValue<T> {
    const fn new(env_vars: &'static [&'static str], default_value: fn() -> T) -> Self {
        Self {
            env_vars,
            default_value,
        }
    }
}

impl<T: ParseConfigValue> ConfigValue<T> {
    /// Resolves a config value, using the provided value if present, otherwise falling back to the environment variable or the default.
    pub(crate) fn resolve(
        &self,
        value: Option<T>,
        env: Option<&HashMap<String, String>>,
    ) -> Result<T, ConfigureError> {
        if let Some(v) = try_resolve_from_env(value, self.env_vars, env)? {
            return Ok(v);
        }

        Ok((self.default_value)())
    }
}

pub(crate) struct OptionalConfigValue<T> {
    env_vars: &'static [&'static str],
    default_value: PhantomData<Option<T>>,
}

impl<T> OptionalConfigValue<T> {
    const fn new(env_vars: &'static [&'static str]) -> Self {
        Self {
            env_vars,
            default_value: PhantomData,
        }
    }
}

impl<T: ParseConfigValue> OptionalConfigValue<T> {
    /// Resolves an optional config value, using the provided value if present, otherwise falling back to the environment variable or `None`.
    pub(crate) fn resolve(
        &self,
        value: Option<T>,
        env: Option<&HashMap<String, String>>,
    ) -> Result<Option<T>, ConfigureError> {
        try_resolve_from_env(value, self.env_vars, env)
    }
}

fn try_resolve_from_env<T>(
    value: Option<T>,
    env_vars: &'static [&'static str],
    env: Option<&HashMap<String, String>>,
) -> Result<Option<T>, ConfigureError>
where
    T: ParseConfigValue,
{
    if let Some(v) = value {
        return Ok(Some(v));
    }

    for var in env_vars {
        if let Some(s) = get_optional_env(var, env)? {
            return match T::parse_config_value(&s) {
                Some(v) => Ok(Some(v)),
                None => Err(ConfigureError::InvalidConfigurationValue {
                    parameter: *var,
                    value: s,
                }),
            };
        }
    }

    Ok(None)
}

pub(crate) static SERVICE_METRICS_ENABLED: ConfigValue<Flag> =
    ConfigValue::new(&["SERVICE_METRICS_ENABLED"], || Flag(true));

pub(crate) static SERVICE_METRICS_SERVICE_NAME: OptionalConfigValue<String> =
    OptionalConfigValue::new(&["SERVICE_METRICS_SERVICE_NAME", "OTEL_SERVICE_NAME"]);

pub(crate) static SERVICE_METRICS_ENV: OptionalConfigValue<String> =
    OptionalConfigValue::new(&["SERVICE_METRICS_ENV", "DEPLOYMENT_ENVIRONMENT"]);

pub(crate) static SERVICE_METRICS_REGION: OptionalConfigValue<String> =
    OptionalConfigValue::new(&["SERVICE_METRICS_REGION", "AWS_REGION"]);

pub(crate) static SERVICE_METRICS_CONTAINER_ID: OptionalConfigValue<String> =
    OptionalConfigValue::new(&["SERVICE_METRICS_CONTAINER_ID", "HOSTNAME"]);

pub(crate) static STATSD_HOST: OptionalConfigValue<String> =
    OptionalConfigValue::new(&["STATSD_HOST"]);

pub(crate) static STATSD_PORT: OptionalConfigValue<u16> = OptionalConfigValue::new(&["STATSD_PORT"]);

pub(crate) static SERVICE_METRICS_CONNECT_TIMEOUT_MS: ConfigValue<u64> =
    ConfigValue::new(&["SERVICE_METRICS_CONNECT_TIMEOUT_MS"], || 1000);

pub(crate) static OTLP_METRICS_ENDPOINT: OptionalConfigValue<String> = OptionalConfigValue::new(&[
    "OTEL_EXPORTER_OTLP_METRICS_ENDPOINT",
    "OTEL_EXPORTER_OTLP_ENDPOINT",
]);
