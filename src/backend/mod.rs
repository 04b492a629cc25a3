//! Backends receiving the samples recorded through metric handles.
//!
//! A [`BackendClient`] is bound to every metric at definition time. The crate ships three:
//!   - [`NoopClient`], which discards everything,
//!   - [`UdpSampleClient`], which sends one datagram per sample to a sampling-protocol agent,
//!   - [`OtelGaugeClient`], which records into an OpenTelemetry meter and is used for periodic
//!     gauges.
//!
//! Custom clients can be supplied with
//! [`AdvancedOptions::with_client`][crate::config::AdvancedOptions::with_client].

use std::{fmt::Display, time::Duration};

use crate::{ShutdownError, TagSet};

mod otel;
mod udp;

pub use otel::OtelGaugeClient;
pub use udp::UdpSampleClient;

/// Capability shared by every backend.
///
/// All methods are fire-and-forget: they must not block on I/O and must not panic. `name` is
/// the fully qualified metric name, `{service}.{metric}`.
pub trait BackendClient: Send + Sync + std::fmt::Debug {
    /// Record a counter increment.
    fn emit_count(&self, name: &str, delta: u64, tags: &TagSet);

    /// Record a duration, in milliseconds.
    fn emit_timing(&self, name: &str, duration_ms: f64, tags: &TagSet);

    /// Record the current value of a gauge.
    fn emit_gauge_sample(&self, name: &str, value: f64, tags: &TagSet);

    /// Which kind of backend this is, for diagnostics.
    fn kind(&self) -> BackendKind {
        BackendKind::Custom
    }

    /// Release the transport. Called once, from [`MetricsManager::shutdown`][crate::MetricsManager::shutdown].
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying SDK fails to flush.
    fn shutdown(&self, _timeout: Duration) -> Result<(), ShutdownError> {
        Ok(())
    }
}

/// The kind of a [`BackendClient`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum BackendKind {
    /// Samples are discarded.
    Noop,
    /// Samples are sent as UDP datagrams.
    Udp,
    /// Samples are recorded into an OpenTelemetry meter.
    OpenTelemetry,
    /// A user-supplied client.
    Custom,
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Noop => write!(f, "noop"),
            BackendKind::Udp => write!(f, "udp"),
            BackendKind::OpenTelemetry => write!(f, "opentelemetry"),
            BackendKind::Custom => write!(f, "custom"),
        }
    }
}

/// A backend which discards every sample.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopClient;

impl BackendClient for NoopClient {
    fn emit_count(&self, _name: &str, _delta: u64, _tags: &TagSet) {}

    fn emit_timing(&self, _name: &str, _duration_ms: f64, _tags: &TagSet) {}

    fn emit_gauge_sample(&self, _name: &str, _value: f64, _tags: &TagSet) {}

    fn kind(&self) -> BackendKind {
        BackendKind::Noop
    }
}

/// Outcome of [`select_backend`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendSelection<'a> {
    /// Metrics collection is switched off.
    Disabled,
    /// Enabled, but no host is configured.
    MissingHost,
    /// Enabled, but no port is configured.
    MissingPort,
    /// Connect to the sampling backend at `host:port`.
    Active {
        /// Backend host name or address.
        host: &'a str,
        /// Backend port.
        port: u16,
    },
}

impl BackendSelection<'_> {
    /// Whether this selection results in a live transport.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, BackendSelection::Active { .. })
    }
}

/// Decide which sampling backend to bind.
///
/// | enabled | host | port | selection |
/// |---|---|---|---|
/// | false | any | any | `Disabled` |
/// | true | absent | any | `MissingHost` |
/// | true | present | absent | `MissingPort` |
/// | true | present | present | `Active` |
///
/// An empty host string counts as absent.
#[must_use]
pub fn select_backend(enabled: bool, host: Option<&str>, port: Option<u16>) -> BackendSelection<'_> {
    if !enabled {
        return BackendSelection::Disabled;
    }
    match (host.filter(|h| !h.is_empty()), port) {
        (None, _) => BackendSelection::MissingHost,
        (Some(_), None) => BackendSelection::MissingPort,
        (Some(host), Some(port)) => BackendSelection::Active { host, port },
    }
}
