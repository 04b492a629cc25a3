use crate::MetricsError;

/// Sink for failures inside the metrics core, typically wired to the host's crash reporter.
///
/// Implementations must not block and must not panic; they are called from the gauge scheduler
/// thread and from metric construction paths.
pub trait ErrorReporter: Send + Sync {
    /// Report `error`; `context` names the operation that failed.
    fn report(&self, error: &MetricsError, context: &str);
}

impl<F> ErrorReporter for F
where
    F: Fn(&MetricsError, &str) + Send + Sync,
{
    fn report(&self, error: &MetricsError, context: &str) {
        self(error, context);
    }
}

/// The default reporter, which logs each failure at `error` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn report(&self, error: &MetricsError, context: &str) {
        tracing::error!(%error, context, "service metrics error");
    }
}
