//! Categorized errors: the unit of record for the [`ErrorTracker`](crate::ErrorTracker)

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::correlation::{CORRELATION_KEY, CorrelationId};
use crate::errors::SharedError;

/// Domain area an error originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ErrorCategory {
    /// Matches every category when used as an alert filter
    #[default]
    Unknown,
    Config,
    Script,
    Render,
    Monitor,
    Remote,
    Io,
    Network,
}

impl ErrorCategory {
    pub const COUNT: usize = 8;

    pub const ALL: [ErrorCategory; Self::COUNT] = [
        ErrorCategory::Unknown,
        ErrorCategory::Config,
        ErrorCategory::Script,
        ErrorCategory::Render,
        ErrorCategory::Monitor,
        ErrorCategory::Remote,
        ErrorCategory::Io,
        ErrorCategory::Network,
    ];

    /// Position in [`ErrorCategory::ALL`]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Bounds-checked reverse of [`index`](Self::index)
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Unknown => "unknown",
            ErrorCategory::Config => "config",
            ErrorCategory::Script => "script",
            ErrorCategory::Render => "render",
            ErrorCategory::Monitor => "monitor",
            ErrorCategory::Remote => "remote",
            ErrorCategory::Io => "io",
            ErrorCategory::Network => "network",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How serious an error is; ordered `Info < Warning < Error < Critical`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ErrorSeverity {
    Info,
    Warning,
    #[default]
    Error,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorSeverity::Info => "info",
            ErrorSeverity::Warning => "warning",
            ErrorSeverity::Error => "error",
            ErrorSeverity::Critical => "critical",
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error tagged with category, severity, time and free-form context.
///
/// Values are independent: cloning deep-copies the context map, and the
/// tracker only ever hands out clones, so mutating a returned value never
/// changes tracker state.
#[derive(Debug, Clone)]
pub struct CategorizedError {
    pub message: String,
    pub source: Option<SharedError>,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub timestamp: DateTime<Utc>,
    pub context: HashMap<String, String>,
}

impl CategorizedError {
    /// Create an error stamped with the current time
    pub fn new(
        category: ErrorCategory,
        severity: ErrorSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            source: None,
            category,
            severity,
            timestamp: Utc::now(),
            context: HashMap::new(),
        }
    }

    /// Wrap an existing error, using its display text as the message
    pub fn wrap<E>(category: ErrorCategory, severity: ErrorSeverity, error: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        let mut categorized = Self::new(category, severity, error.to_string());
        categorized.source = Some(Arc::new(error));
        categorized
    }

    /// Wrap an already shared error
    pub fn wrap_shared(
        category: ErrorCategory,
        severity: ErrorSeverity,
        error: SharedError,
    ) -> Self {
        let mut categorized = Self::new(category, severity, error.to_string());
        categorized.source = Some(error);
        categorized
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_correlation(self, id: CorrelationId) -> Self {
        self.with_context(CORRELATION_KEY, id.to_string())
    }

    /// Attach the caller's current correlation id, if a scope is active
    pub fn with_current_correlation(self) -> Self {
        match CorrelationId::current() {
            Some(id) => self.with_correlation(id),
            None => self,
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.context.get(CORRELATION_KEY).map(String::as_str)
    }
}

impl fmt::Display for CategorizedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}] {}", self.category, self.severity, self.message)
    }
}

impl Error for CategorizedError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_index_round_trip() {
        for (i, category) in ErrorCategory::ALL.iter().enumerate() {
            assert_eq!(category.index(), i);
            assert_eq!(ErrorCategory::from_index(i), Some(*category));
        }
        assert_eq!(ErrorCategory::from_index(ErrorCategory::COUNT), None);
        assert_eq!(ErrorCategory::from_index(usize::MAX), None);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(ErrorSeverity::Info < ErrorSeverity::Warning);
        assert!(ErrorSeverity::Warning < ErrorSeverity::Error);
        assert!(ErrorSeverity::Error < ErrorSeverity::Critical);
    }

    #[test]
    fn test_clone_deep_copies_context() {
        let original =
            CategorizedError::new(ErrorCategory::Remote, ErrorSeverity::Error, "ssh timeout")
                .with_context("host", "db01");
        let mut copy = original.clone();
        copy.context.insert("host".to_string(), "mutated".to_string());

        assert_eq!(original.context["host"], "db01");
    }

    #[test]
    fn test_wrap_keeps_source_and_message() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing /proc/stat");
        let err = CategorizedError::wrap(ErrorCategory::Io, ErrorSeverity::Warning, io);

        assert_eq!(err.message, "missing /proc/stat");
        assert!(Error::source(&err).is_some());
        assert_eq!(err.to_string(), "[io/warning] missing /proc/stat");
    }

    #[test]
    fn test_current_correlation_is_attached() {
        let id = CorrelationId::new();
        let err = id.in_scope(|| {
            CategorizedError::new(ErrorCategory::Script, ErrorSeverity::Error, "nil index")
                .with_current_correlation()
        });
        assert_eq!(err.correlation_id(), Some(id.to_string().as_str()));
    }
}
