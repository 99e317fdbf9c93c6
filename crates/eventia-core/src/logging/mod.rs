//! Logging contract for storage engines.
//!
//! Engines never reach for a global logger to report anomalies. They receive an
//! `Arc<dyn Logger>` at construction and report through it; [`TracingLogger`]
//! forwards those reports to `tracing`. Internal lifecycle chatter (connections,
//! cursors, migrations) still goes straight to `tracing` macros.
//!
//! Binaries call [`init_subscriber`] once; tests use [`capture_logs`].

pub mod test_utils;

pub use test_utils::{CapturedLogs, capture_logs};

/// Sink for anomaly reports.
pub trait Logger: Send + Sync {
    /// Diagnostic detail.
    fn debug(&self, message: &str);
    /// Notable, expected event.
    fn info(&self, message: &str);
    /// Recoverable oddity.
    fn warn(&self, message: &str);
    /// Misuse or failure that did not abort the operation.
    fn error(&self, message: &str);
}

/// [`Logger`] that forwards to `tracing` with a `component` field.
#[derive(Clone, Debug)]
pub struct TracingLogger {
    component: String,
}

impl TracingLogger {
    /// Create a logger tagged with `component`.
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    /// Component this logger reports for.
    pub fn component(&self) -> &str {
        &self.component
    }
}

impl Default for TracingLogger {
    fn default() -> Self {
        Self::new("eventia")
    }
}

impl Logger for TracingLogger {
    fn debug(&self, message: &str) {
        tracing::debug!(component = %self.component, "{message}");
    }

    fn info(&self, message: &str) {
        tracing::info!(component = %self.component, "{message}");
    }

    fn warn(&self, message: &str) {
        tracing::warn!(component = %self.component, "{message}");
    }

    fn error(&self, message: &str) {
        tracing::error!(component = %self.component, "{message}");
    }
}

/// Install a compact stderr subscriber filtered at `level`, unless `RUST_LOG`
/// says otherwise. Only the first call in a process takes effect.
pub fn init_subscriber(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .compact()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
