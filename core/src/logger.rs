//! Leveled logger seam for exceptional internal conditions
//!
//! The core logs routine activity through `tracing` directly. The `Logger`
//! trait is the narrow interface an embedding application can replace to
//! capture conditions such as a panicking callback.

use std::sync::Arc;

/// Leveled logger used for exceptional internal conditions
pub trait Logger: Send + Sync {
    fn debug(&self, message: &str);
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
}

/// Default logger forwarding to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn debug(&self, message: &str) {
        tracing::debug!(target: "sysmon_core", "{message}");
    }

    fn info(&self, message: &str) {
        tracing::info!(target: "sysmon_core", "{message}");
    }

    fn warn(&self, message: &str) {
        tracing::warn!(target: "sysmon_core", "{message}");
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "sysmon_core", "{message}");
    }
}

pub(crate) fn default_logger() -> Arc<dyn Logger> {
    Arc::new(TracingLogger)
}
