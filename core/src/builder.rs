//! Builder API for ergonomic circuit breaker configuration

use std::sync::Arc;
use std::time::Duration;

use crate::bulkhead::BulkheadSemaphore;
use crate::callbacks::Callbacks;
use crate::category::ErrorCategory;
use crate::circuit::{BreakerParts, CircuitBreaker, CircuitState, Config};
use crate::classifier::FailureClassifier;
use crate::logger::{Logger, default_logger};
use crate::tracker::ErrorTracker;

/// Builder for creating circuit breakers with fluent API
pub struct CircuitBuilder {
    name: String,
    config: Config,
    failure_classifier: Option<Arc<dyn FailureClassifier>>,
    bulkhead: Option<Arc<BulkheadSemaphore>>,
    error_tracker: Option<(Arc<ErrorTracker>, ErrorCategory)>,
    callbacks: Callbacks,
    logger: Option<Arc<dyn Logger>>,
}

impl CircuitBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: Config::default(),
            failure_classifier: None,
            bulkhead: None,
            error_tracker: None,
            callbacks: Callbacks::new(),
            logger: None,
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Consecutive failures needed to open the circuit
    pub fn failure_threshold(mut self, threshold: usize) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    /// Successful probes needed to close from half-open
    pub fn success_threshold(mut self, threshold: usize) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    /// How long the circuit stays open before admitting probes
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn max_half_open_requests(mut self, limit: usize) -> Self {
        self.config.max_half_open_requests = limit;
        self
    }

    /// Set the jitter factor (0.0 = no jitter, 1.0 = full jitter)
    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.config.jitter_factor = factor;
        self
    }

    /// Decide which errors count toward opening the circuit
    ///
    /// # Examples
    ///
    /// ```rust
    /// use sysmon_core::{CircuitBreaker, PredicateClassifier};
    /// use std::sync::Arc;
    /// use std::time::Duration;
    ///
    /// let circuit = CircuitBreaker::builder("remote")
    ///     .failure_classifier(Arc::new(PredicateClassifier::new(|ctx| {
    ///         ctx.duration > Duration::from_secs(1)
    ///     })))
    ///     .build();
    /// # assert!(circuit.is_closed());
    /// ```
    pub fn failure_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.failure_classifier = Some(classifier);
        self
    }

    /// Reject calls with `BulkheadFull` once `limit` calls are in flight.
    /// A limit of 0 disables the bulkhead.
    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.bulkhead = (limit > 0).then(|| Arc::new(BulkheadSemaphore::new(limit)));
        self
    }

    /// Forward counted failures to `tracker` under `category`
    pub fn error_tracker(mut self, tracker: Arc<ErrorTracker>, category: ErrorCategory) -> Self {
        self.error_tracker = Some((tracker, category));
        self
    }

    /// Called with the circuit name and the `from`/`to` states on every transition
    pub fn on_state_change<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.callbacks.on_state_change = Some(Arc::new(f));
        self
    }

    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_open = Some(Arc::new(f));
        self
    }

    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_close = Some(Arc::new(f));
        self
    }

    pub fn on_half_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_half_open = Some(Arc::new(f));
        self
    }

    /// Logger used to report panicking callbacks
    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn build(self) -> CircuitBreaker {
        CircuitBreaker::from_parts(BreakerParts {
            name: self.name,
            config: self.config,
            bulkhead: self.bulkhead,
            failure_classifier: self.failure_classifier,
            error_tracker: self.error_tracker,
            callbacks: self.callbacks,
            logger: self.logger.unwrap_or_else(default_logger),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::mpsc;

    #[test]
    fn test_builder_defaults() {
        let circuit = CircuitBuilder::new("test").build();

        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(circuit.name(), "test");
        assert_eq!(circuit.config().failure_threshold, 5);
    }

    #[test]
    fn test_builder_custom_config() {
        let circuit = CircuitBuilder::new("test")
            .failure_threshold(10)
            .timeout(Duration::from_secs(60))
            .success_threshold(3)
            .max_half_open_requests(2)
            .build();

        let config = circuit.config();
        assert_eq!(config.failure_threshold, 10);
        assert_eq!(config.success_threshold, 3);
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.max_half_open_requests, 2);
    }

    #[test]
    fn test_jitter_factor_is_clamped() {
        let circuit = CircuitBuilder::new("jitter").jitter_factor(3.0).build();
        assert_eq!(circuit.config().jitter_factor, 1.0);
    }

    #[test]
    fn test_builder_with_open_callback() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);

        let circuit = CircuitBuilder::new("test")
            .failure_threshold(2)
            .on_open(move |name| {
                let _ = tx.lock().unwrap().send(name.to_string());
            })
            .build();

        let _ = circuit.call(|| Err::<(), _>("error 1"));
        let _ = circuit.call(|| Err::<(), _>("error 2"));

        assert_eq!(
            rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap(),
            "test"
        );
    }

    #[test]
    fn test_zero_concurrency_disables_bulkhead() {
        let circuit = CircuitBuilder::new("test").max_concurrency(0).build();
        assert!(circuit.call(|| Ok::<_, &str>(1)).is_ok());
    }
}
