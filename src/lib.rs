//! # Per-service metrics facade
//!
//! `service-metrics` lets application code declare named counters, timers and gauges, tags every
//! emitted measurement with a consistent set of environment/instance identifiers, and routes the
//! measurements to pluggable backends:
//!   - a push-based sampling backend, which receives one UDP datagram per recorded value, and
//!   - a periodic gauge backend built on the OpenTelemetry metrics SDK, fed by a background
//!     scheduler which samples registered gauges on their own cadence.
//!
//! The most important API is [`service_metrics::configure()`][configure], which resolves the
//! environment once, picks the backends and returns a [`MetricsManager`]. Metric handles are
//! obtained from the manager and are cheap to clone and share across threads.
//!
//! Misconfiguration never fails the host application: missing connection parameters, an
//! unreachable backend or a failing gauge callback all degrade to dropping samples, with a
//! warning logged through `tracing` and the failure passed to the configured
//! [`ErrorReporter`].
//!
//! # Usage
//!
//! ```rust
//! use std::time::Duration;
//!
//! use service_metrics::{EnvironmentFacts, TagSet};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let metrics = service_metrics::configure()
//!         .with_service_name("checkout")
//!         .with_environment_facts(EnvironmentFacts::default().with_env("prod"))
//!         .finish()?;
//!
//!     let _guard = metrics.clone().shutdown_guard();
//!
//!     let requests = metrics.counter("Requests", TagSet::from_iter([("region", "eu")]));
//!     requests.increment();
//!
//!     let latency = metrics.timer("Latency", TagSet::new());
//!     let result = latency.time(|| 6 * 7);
//!     assert_eq!(result, 42);
//!
//!     let _queue = metrics.periodic_gauge(
//!         "QueueDepth",
//!         || Ok(3.0),
//!         Duration::from_secs(10),
//!         TagSet::new(),
//!     );
//!
//!     // Guard automatically shuts down the manager when it goes out of scope
//!     Ok(())
//! }
//! ```
//!
//! # Configuration
//!
//! Every option can be set on the builder; anything left unset is read from the environment.
//! The most important variables are `STATSD_HOST` / `STATSD_PORT` for the sampling backend,
//! `OTEL_EXPORTER_OTLP_METRICS_ENDPOINT` for the periodic gauge backend and
//! `SERVICE_METRICS_ENABLED` to switch collection off entirely. See [`EnvironmentFacts`] for the
//! full list.
//!
//! The [usage guide][usage] describes backend selection, tag composition and the datagram format
//! in more detail.

use std::time::Duration;

use thiserror::Error;

use crate::config::MetricsConfigBuilder;

pub mod backend;
pub mod config;
pub mod exporters;
mod internal;
mod manager;
mod metric;
mod reporter;
mod scheduler;
mod tags;
pub mod usage;

pub use crate::backend::{BackendClient, BackendKind};
pub use crate::config::EnvironmentFacts;
pub use crate::manager::{MAX_SAMPLE_INTERVAL, MetricsManager, ShutdownGuard};
pub use crate::metric::{Counter, Gauge, PeriodicGauge, SampleError, Timer, TimerGuard};
pub use crate::reporter::{ErrorReporter, TracingErrorReporter};
pub use crate::tags::TagSet;

/// An error which may arise when configuring the metrics manager.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigureError {
    /// No service name was provided.
    #[error(
        "A service name is required from either `service_metrics::configure().with_service_name()` or the `SERVICE_METRICS_SERVICE_NAME` environment variable"
    )]
    ServiceNameRequired,

    /// A configuration value (from environment) was invalid.
    #[error("Invalid configuration value for {parameter}: {value}")]
    InvalidConfigurationValue {
        /// The name of the configuration parameter.
        parameter: &'static str,
        /// The invalid value passed for the parameter.
        value: String,
    },

    /// A Rust feature needs to be enabled in the `Cargo.toml`.
    #[error("Rust feature required: `{feature_name}` feature must be enabled for {functionality}")]
    FeatureRequired {
        /// The feature which is required.
        feature_name: &'static str,
        /// The functionality which was attempted to be used.
        functionality: String,
    },

    /// OpenTelemetry exporter failed to build
    #[error("Error building the OpenTelemetry exporter: {0}")]
    ExporterBuildError(#[from] opentelemetry_otlp::ExporterBuildError),

    /// Any other error.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Runtime failures inside the metrics core.
///
/// None of these are ever returned to code recording a metric; they are handed to the configured
/// [`ErrorReporter`] instead.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MetricsError {
    /// Metrics are enabled but a connection parameter is missing.
    #[error("metrics backend enabled but `{missing}` is not configured; samples will be dropped")]
    ConfigurationIncomplete {
        /// The missing parameter.
        missing: &'static str,
    },

    /// An environment fact could not be resolved; it falls back to its default.
    #[error("failed to resolve environment facts: {0}")]
    Environment(#[from] ConfigureError),

    /// The transport to a backend could not be constructed.
    #[error("failed to construct transport to {address}: {source}")]
    TransportConstructionFailed {
        /// The backend address (or endpoint) which was being connected.
        address: String,
        /// The underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A periodic gauge's sample function returned an error.
    #[error("sample function for `{metric}` failed: {source}")]
    SampleFunctionFailed {
        /// The fully qualified metric name.
        metric: String,
        /// The error returned by the sample function.
        #[source]
        source: SampleError,
    },

    /// A periodic gauge's sample function panicked.
    #[error("sample function for `{metric}` panicked: {message}")]
    SampleFunctionPanicked {
        /// The fully qualified metric name.
        metric: String,
        /// The panic payload, if it was a string.
        message: String,
    },

    /// A component did not shut down in time and was abandoned.
    #[error("{component} did not shut down within {timeout:?}")]
    ShutdownTimeout {
        /// The component which timed out.
        component: &'static str,
        /// The timeout which elapsed.
        timeout: Duration,
    },

    /// A periodic gauge was registered after the scheduler began shutting down.
    #[error("periodic gauge `{metric}` registered after shutdown; it will never be sampled")]
    SchedulerStopped {
        /// The fully qualified metric name.
        metric: String,
    },
}

/// An error which may arise when shutting down the metrics manager.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ShutdownError {
    /// The opentelemetry SDK failed to shut down.
    #[error("Failed to shutdown Otel SDK: {0}")]
    OtelError(#[from] opentelemetry_sdk::error::OTelSdkError),
}

/// Main entry point to configure service metrics.
///
/// This should be called once per service at the start of the program.
///
/// See [`MetricsConfigBuilder`] for the full set of configuration options.
///
/// # Example
///
/// ```rust
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let metrics = service_metrics::configure()
///         .with_service_name("billing")
///         .finish()?;
///
///     metrics.counter("Invoices", Default::default()).increment();
///
///     metrics.shutdown()?;
///     Ok(())
/// }
/// ```
pub fn configure() -> MetricsConfigBuilder {
    MetricsConfigBuilder::default()
}

// lets `test_utils` name the crate the same way from unit and integration tests
#[cfg(test)]
extern crate self as service_metrics;

#[cfg(test)]
mod test_utils;
