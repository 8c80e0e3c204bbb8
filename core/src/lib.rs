//! sysmon-core - resilience and lifecycle core for an embeddable system monitor
//!
//! This crate provides:
//! - A thread-safe circuit breaker (Closed → Open → HalfOpen) built on a state machine
//! - A categorized error tracker with a bounded window and threshold alerts
//! - Lock-free runtime metrics with an optional `metrics` facade exporter
//! - A lifecycle manager that supervises a workload with start/stop/restart/reload
//! - Correlation ids that tie logs, events and errors to one operation
//!
//! User callbacks (state changes, alerts, lifecycle events and errors) are
//! queued to a single dispatcher thread after internal locks are released and
//! run there in order. A panic inside one is logged instead of propagated.
//!
//! # Example
//!
//! ```rust
//! use sysmon_core::{CircuitBreaker, CircuitState};
//! use std::time::Duration;
//!
//! let circuit = CircuitBreaker::builder("remote_host")
//!     .failure_threshold(3)
//!     .timeout(Duration::from_secs(30))
//!     .success_threshold(2)
//!     .on_open(|name| eprintln!("circuit {name} opened"))
//!     .build();
//!
//! let result = circuit.call(|| Ok::<_, String>("uptime 42d"));
//! assert!(result.is_ok());
//!
//! if circuit.state() == CircuitState::Open {
//!     println!("remote host unavailable, skipping");
//! }
//! ```

pub mod builder;
pub mod bulkhead;
pub mod callbacks;
pub mod category;
pub mod circuit;
pub mod classifier;
pub mod correlation;
mod dispatch;
pub mod errors;
pub mod events;
pub mod health;
pub mod lifecycle;
pub mod logger;
pub mod metrics;
pub mod tracker;

pub use builder::CircuitBuilder;
pub use bulkhead::{BulkheadGuard, BulkheadSemaphore};
pub use category::{CategorizedError, ErrorCategory, ErrorSeverity};
pub use circuit::{BreakerStats, CircuitBreaker, CircuitState, Config};
pub use classifier::{
    DefaultClassifier, FailureClassifier, FailureContext, IgnoreType, PredicateClassifier,
};
pub use correlation::{CorrelationGuard, CorrelationId};
pub use crate::metrics::{Metrics, MetricsSnapshot};
pub use dispatch::callback_panics;
pub use errors::{BoxError, CircuitError, LifecycleError, SharedError};
pub use events::{ErrorHandler, Event, EventHandler, EventKind};
pub use health::{ComponentHealth, HealthCheck, HealthState};
pub use lifecycle::{
    ConfigLoader, Headless, LifecycleBuilder, LifecycleManager, LifecycleOptions, RunContext,
    Status, Workload,
};
pub use logger::{Logger, TracingLogger};
pub use tracker::{Alert, AlertCondition, AlertHandler, ErrorStats, ErrorTracker, TrackerConfig};
