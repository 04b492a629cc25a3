//! # Usage Guide
//!
//! This section of the documentation collects guide material on instrumenting a service with
//! `service-metrics`.
//!
//! # Architecture
//!
//! A [`MetricsManager`][crate::MetricsManager] is built once per service. While being built it
//! resolves the [`EnvironmentFacts`][crate::EnvironmentFacts], composes the base tags and binds two
//! backends:
//!
//! | backend | used by | selected when |
//! |---|---|---|
//! | sampling (UDP) | counters, timers, gauges | enabled, and both `STATSD_HOST` and `STATSD_PORT` are set |
//! | periodic gauge (OpenTelemetry) | periodic gauges | enabled, and an OTLP endpoint or an additional reader is configured |
//!
//! Any backend which cannot be selected is replaced by a no-op backend (the periodic gauge backend
//! falls back to the sampling backend instead). Nothing about this is fatal: the failure is logged
//! and passed to the [`ErrorReporter`][crate::ErrorReporter].
//!
//! ## With `tracing`
//!
//! This crate logs its own diagnostics through `tracing`: backend selection at `info`, degraded
//! configuration at `warn`, and dropped samples at `debug` or `trace`. Install any `tracing`
//! subscriber to see them.
//!
//! ## With `opentelemetry`
//!
//! The periodic gauge backend records into its own `SdkMeterProvider`. It does not touch the
//! global `opentelemetry` state, so it can live alongside an application's own OpenTelemetry
//! setup. To read the values in-process, pass a reader:
//!
//! ```rust
//! use std::time::Duration;
//!
//! use opentelemetry_sdk::metrics::ManualReader;
//! use service_metrics::{EnvironmentFacts, TagSet, config::PeriodicGaugeOptions};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let metrics = service_metrics::configure()
//!     .with_service_name("inventory")
//!     .with_environment_facts(EnvironmentFacts::default())
//!     .with_periodic_gauges(Some(
//!         PeriodicGaugeOptions::default().with_additional_reader(ManualReader::builder().build()),
//!     ))
//!     .finish()?;
//!
//! let _stock = metrics.periodic_gauge(
//!     "Stock",
//!     || Ok(17.0),
//!     Duration::from_secs(30),
//!     TagSet::from_iter([("warehouse", "north")]),
//! );
//!
//! metrics.shutdown()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Tags
//!
//! Every sample carries, in this order:
//!
//! 1. the base tags `env`, `region`, `container` (each only if known) and `service`,
//! 2. the tags declared when the metric was defined,
//! 3. for counters and timers, the tags passed to the recording call.
//!
//! A later tag with the same key replaces the earlier value but keeps its position.
//!
//! # Wire format
//!
//! The sampling backend sends one datagram per sample:
//!
//! ```text
//! checkout.Requests#env=prod,service=checkout,region=eu:1|c
//! checkout.Latency#env=prod,service=checkout:12.5|ms
//! checkout.QueueDepth:3|g
//! ```
//!
//! Characters outside `[A-Za-z0-9_.-]` in names, and any of `,=#|:` or whitespace in tags, are
//! replaced with `_`.
//!
//! # Handling panics
//!
//! A panic inside a periodic gauge's sample function is caught and reported; the gauge stays
//! registered. A panic inside a block passed to [`Timer::time`][crate::Timer::time] still records
//! the duration before unwinding continues.
//!
//! When the application itself unwinds and exits, ensure a
//! [`ShutdownGuard`][crate::ShutdownGuard] lives on the main stack frame so the scheduler is
//! stopped and the exporters are flushed.
