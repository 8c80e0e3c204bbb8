//! Lifecycle events and the handler traits that receive them

use std::fmt;

use chrono::{DateTime, Utc};

use crate::correlation::CorrelationId;
use crate::errors::LifecycleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Started,
    Stopped,
    ConfigReloaded,
    Error,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Started => "started",
            EventKind::Stopped => "stopped",
            EventKind::ConfigReloaded => "config_reloaded",
            EventKind::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that happened to an instance
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Run that produced the event; `None` before the first start
    pub correlation_id: Option<CorrelationId>,
}

impl Event {
    pub(crate) fn new(
        kind: EventKind,
        message: impl Into<String>,
        correlation_id: Option<CorrelationId>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            timestamp: Utc::now(),
            correlation_id,
        }
    }
}

/// Receives every lifecycle event, on the callback dispatcher thread
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &Event);
}

impl<F> EventHandler for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        self(event)
    }
}

/// Receives operational errors, on the callback dispatcher thread
pub trait ErrorHandler: Send + Sync {
    fn on_error(&self, error: &LifecycleError);
}

impl<F> ErrorHandler for F
where
    F: Fn(&LifecycleError) + Send + Sync,
{
    fn on_error(&self, error: &LifecycleError) {
        self(error)
    }
}
