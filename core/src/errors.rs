//! Error types for breaker calls and lifecycle operations

use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Error type returned by external collaborators (workloads, config loaders)
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Shared form of a collaborator error, so one failure can be returned and forwarded
pub type SharedError = Arc<dyn Error + Send + Sync>;

/// Errors that can occur during circuit breaker operations
#[derive(Debug)]
pub enum CircuitError<E = BoxError> {
    /// Circuit is open, calls are being rejected
    Open { circuit: String, opened_at: f64 },
    /// Half-open probe limit has been reached
    HalfOpenLimitReached { circuit: String },
    /// Bulkhead is at capacity, cannot acquire permit
    BulkheadFull { circuit: String, limit: usize },
    /// The wrapped operation failed
    Execution(E),
}

impl<E> CircuitError<E> {
    /// True when the operation was never attempted.
    ///
    /// Rejections mean "not attempted", `Execution` means "attempt failed".
    pub fn is_rejected(&self) -> bool {
        !matches!(self, CircuitError::Execution(_))
    }

    /// The wrapped operation's error, if the operation ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            CircuitError::Execution(e) => Some(e),
            _ => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for CircuitError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitError::Open { circuit, opened_at } => {
                write!(f, "Circuit '{}' is open (opened at {:.3}s)", circuit, opened_at)
            }
            CircuitError::HalfOpenLimitReached { circuit } => {
                write!(f, "Circuit '{}' half-open probe limit reached", circuit)
            }
            CircuitError::BulkheadFull { circuit, limit } => {
                write!(
                    f,
                    "Circuit '{}' bulkhead is full (limit: {})",
                    circuit, limit
                )
            }
            CircuitError::Execution(e) => write!(f, "Circuit execution failed: {}", e),
        }
    }
}

impl<E: Error + 'static> Error for CircuitError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CircuitError::Execution(e) => Some(e),
            _ => None,
        }
    }
}

/// Errors returned by [`LifecycleManager`](crate::LifecycleManager) operations.
///
/// Structural errors describe a misuse of the manager and are only returned.
/// Operational errors are returned and also forwarded to the error handler.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LifecycleError {
    #[error("instance is already running")]
    AlreadyRunning,

    #[error("instance is not running")]
    NotRunning,

    #[error("no config loader configured")]
    NoConfigLoader,

    #[error("no configuration or config loader provided")]
    MissingConfiguration,

    /// The workload refused to start.
    #[error("workload '{workload}' failed to start: {source}")]
    WorkloadStart {
        workload: String,
        #[source]
        source: SharedError,
    },

    /// The workload's run loop returned an error.
    #[error("workload '{workload}' failed: {source}")]
    Workload {
        workload: String,
        #[source]
        source: SharedError,
    },

    #[error("failed to load configuration: {source}")]
    ConfigLoad {
        #[source]
        source: SharedError,
    },

    /// The supervised task did not finish within the shutdown bound.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout { timeout: Duration },

    #[error("failed to spawn supervisor thread: {reason}")]
    Spawn { reason: String },

    #[error("failed to build workload runtime: {reason}")]
    Runtime { reason: String },
}

impl LifecycleError {
    /// True for caller misuse, false for failures that happened while operating.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            LifecycleError::AlreadyRunning
                | LifecycleError::NotRunning
                | LifecycleError::NoConfigLoader
                | LifecycleError::MissingConfiguration
        )
    }

    pub(crate) fn config_load(err: BoxError) -> Self {
        LifecycleError::ConfigLoad {
            source: Arc::from(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejections_are_distinguishable_from_failures() {
        let open: CircuitError<&str> = CircuitError::Open {
            circuit: "ssh".to_string(),
            opened_at: 1.5,
        };
        let limited: CircuitError<&str> = CircuitError::HalfOpenLimitReached {
            circuit: "ssh".to_string(),
        };
        let failed: CircuitError<&str> = CircuitError::Execution("boom");

        assert!(open.is_rejected());
        assert!(limited.is_rejected());
        assert!(!failed.is_rejected());
        assert_eq!(failed.into_inner(), Some("boom"));
    }

    #[test]
    fn test_display_names_circuit() {
        let err: CircuitError<String> = CircuitError::BulkheadFull {
            circuit: "remote".to_string(),
            limit: 4,
        };
        assert_eq!(err.to_string(), "Circuit 'remote' bulkhead is full (limit: 4)");
    }

    #[test]
    fn test_lifecycle_error_classification() {
        assert!(LifecycleError::AlreadyRunning.is_structural());
        assert!(LifecycleError::NoConfigLoader.is_structural());
        assert!(
            !LifecycleError::ShutdownTimeout {
                timeout: Duration::from_secs(5)
            }
            .is_structural()
        );

        let err = LifecycleError::config_load("bad syntax".into());
        assert!(!err.is_structural());
        assert_eq!(err.to_string(), "failed to load configuration: bad syntax");
        assert!(err.source().is_some());
    }
}
