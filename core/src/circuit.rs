//! Circuit breaker built on a dynamic state machine
//!
//! All breaker state lives behind one mutex. Protected operations run
//! outside it: a call is admitted under the lock, executed unlocked, and its
//! outcome is applied under the lock again, but only if the breaker has not
//! changed state in between. State-change callbacks and error forwarding
//! happen after the lock is released.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use state_machines::state_machine;

use crate::bulkhead::{BulkheadGuard, BulkheadSemaphore};
use crate::callbacks::Callbacks;
use crate::category::{CategorizedError, ErrorCategory, ErrorSeverity};
use crate::classifier::{FailureClassifier, FailureContext};
use crate::errors::CircuitError;
use crate::logger::Logger;
use crate::tracker::ErrorTracker;

/// Circuit breaker configuration
///
/// Zero values are replaced by the defaults when the breaker is built.
#[derive(Debug, Clone)]
pub struct Config {
    /// Consecutive counted failures that open the circuit
    pub failure_threshold: usize,

    /// Successful probes needed in HalfOpen to close the circuit
    pub success_threshold: usize,

    /// Time spent Open before probes are admitted
    pub timeout: Duration,

    /// Concurrent probes admitted while HalfOpen
    pub max_half_open_requests: usize,

    /// Jitter applied to `timeout` (0.0 = none, 1.0 = full)
    /// Uses chrono-machines formula: timeout * (1 - jitter + rand * jitter)
    pub jitter_factor: f64,
}

impl Config {
    pub const DEFAULT_FAILURE_THRESHOLD: usize = 5;
    pub const DEFAULT_SUCCESS_THRESHOLD: usize = 2;
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_MAX_HALF_OPEN_REQUESTS: usize = 1;

    /// Replace zero values with the defaults
    pub fn normalized(mut self) -> Self {
        if self.failure_threshold == 0 {
            self.failure_threshold = Self::DEFAULT_FAILURE_THRESHOLD;
        }
        if self.success_threshold == 0 {
            self.success_threshold = Self::DEFAULT_SUCCESS_THRESHOLD;
        }
        if self.timeout.is_zero() {
            self.timeout = Self::DEFAULT_TIMEOUT;
        }
        if self.max_half_open_requests == 0 {
            self.max_half_open_requests = Self::DEFAULT_MAX_HALF_OPEN_REQUESTS;
        }
        self.jitter_factor = self.jitter_factor.clamp(0.0, 1.0);
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            failure_threshold: Self::DEFAULT_FAILURE_THRESHOLD,
            success_threshold: Self::DEFAULT_SUCCESS_THRESHOLD,
            timeout: Self::DEFAULT_TIMEOUT,
            max_half_open_requests: Self::DEFAULT_MAX_HALF_OPEN_REQUESTS,
            jitter_factor: 0.0,
        }
    }
}

/// Logical breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn from_machine(name: &str) -> Self {
        match name {
            "Open" => CircuitState::Open,
            "HalfOpen" => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters shared between the breaker and the state machine guards
#[derive(Debug, Default)]
pub struct BreakerCounters {
    consecutive_failures: AtomicUsize,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
}

impl BreakerCounters {
    fn zero(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.total_successes.store(0, Ordering::Relaxed);
        self.total_failures.store(0, Ordering::Relaxed);
        self.total_rejections.store(0, Ordering::Relaxed);
    }
}

/// Circuit breaker context - shared data across all states
#[derive(Debug, Clone)]
pub struct CircuitContext {
    pub(crate) name: String,
    pub(crate) config: Config,
    pub(crate) counters: Arc<BreakerCounters>,
    pub(crate) epoch: Instant,
}

impl CircuitContext {
    /// Monotonic seconds since the breaker was created
    fn now_secs(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// Open-state timeout for one opening, jittered when configured
    fn sample_timeout_secs(&self) -> f64 {
        let timeout_ms = self.config.timeout.as_millis().min(u64::MAX as u128) as u64;
        if self.config.jitter_factor > 0.0 {
            let policy = chrono_machines::Policy {
                max_attempts: 1,
                base_delay_ms: timeout_ms,
                multiplier: 1.0,
                max_delay_ms: timeout_ms,
            };
            (policy.calculate_delay(1, self.config.jitter_factor) as f64) / 1000.0
        } else {
            self.config.timeout.as_secs_f64()
        }
    }
}

impl Default for CircuitContext {
    fn default() -> Self {
        Self {
            name: String::new(),
            config: Config::default(),
            counters: Arc::new(BreakerCounters::default()),
            epoch: Instant::now(),
        }
    }
}

/// Data specific to the Open state
#[derive(Debug, Clone, Default)]
pub struct OpenData {
    /// Seconds since breaker creation at the moment it opened
    pub opened_at: f64,
    /// Timeout sampled for this opening
    pub timeout_secs: f64,
}

/// Data specific to the HalfOpen state
#[derive(Debug, Clone, Default)]
pub struct HalfOpenData {
    pub consecutive_successes: usize,
}

state_machine! {
    name: Circuit,
    context: CircuitContext,
    dynamic: true,

    initial: Closed,
    states: [
        Closed,
        Open(OpenData),
        HalfOpen(HalfOpenData),
    ],
    events {
        trip {
            guards: [should_open],
            transition: { from: [Closed, HalfOpen], to: Open }
        }
        attempt_reset {
            guards: [timeout_elapsed],
            transition: { from: Open, to: HalfOpen }
        }
        close {
            guards: [should_close],
            transition: { from: HalfOpen, to: Closed }
        }
    }
}

impl Circuit<Closed> {
    fn should_open(&self, ctx: &CircuitContext) -> bool {
        ctx.counters.consecutive_failures.load(Ordering::Acquire) >= ctx.config.failure_threshold
    }
}

impl Circuit<HalfOpen> {
    /// Any failed probe reopens the circuit
    fn should_open(&self, _ctx: &CircuitContext) -> bool {
        true
    }

    fn should_close(&self, ctx: &CircuitContext) -> bool {
        self.state_data_half_open()
            .map(|data| data.consecutive_successes >= ctx.config.success_threshold)
            .unwrap_or(false)
    }
}

impl Circuit<Open> {
    fn timeout_elapsed(&self, ctx: &CircuitContext) -> bool {
        self.state_data_open()
            .map(|data| ctx.now_secs() - data.opened_at >= data.timeout_secs)
            .unwrap_or(false)
    }
}

/// Read-only view of the breaker counters
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub consecutive_failures: usize,
    pub half_open_successes: usize,
    pub half_open_in_flight: usize,
    pub since_last_change: Duration,
}

type Transition = (CircuitState, CircuitState);

struct Inner {
    machine: DynamicCircuit,
    /// Bumped on every transition; outcomes admitted under an older value are stale
    generation: u64,
    last_change: Instant,
}

struct Admission {
    generation: u64,
    state: CircuitState,
    _probe: Option<BulkheadGuard>,
}

/// Thread-safe circuit breaker
pub struct CircuitBreaker {
    context: CircuitContext,
    inner: Mutex<Inner>,
    probes: Arc<BulkheadSemaphore>,
    bulkhead: Option<Arc<BulkheadSemaphore>>,
    failure_classifier: Option<Arc<dyn FailureClassifier>>,
    error_tracker: Option<(Arc<ErrorTracker>, ErrorCategory)>,
    callbacks: Callbacks,
    logger: Arc<dyn Logger>,
}

pub(crate) struct BreakerParts {
    pub name: String,
    pub config: Config,
    pub bulkhead: Option<Arc<BulkheadSemaphore>>,
    pub failure_classifier: Option<Arc<dyn FailureClassifier>>,
    pub error_tracker: Option<(Arc<ErrorTracker>, ErrorCategory)>,
    pub callbacks: Callbacks,
    pub logger: Arc<dyn Logger>,
}

impl CircuitBreaker {
    /// Create a breaker with no callbacks (use builder() for more options)
    pub fn new(name: impl Into<String>, config: Config) -> Self {
        Self::builder(name).config(config).build()
    }

    pub fn builder(name: impl Into<String>) -> crate::builder::CircuitBuilder {
        crate::builder::CircuitBuilder::new(name)
    }

    pub(crate) fn from_parts(parts: BreakerParts) -> Self {
        let config = parts.config.normalized();
        let context = CircuitContext {
            name: parts.name,
            config,
            counters: Arc::new(BreakerCounters::default()),
            epoch: Instant::now(),
        };
        let machine = DynamicCircuit::new(context.clone());

        Self {
            probes: Arc::new(BulkheadSemaphore::new(context.config.max_half_open_requests)),
            inner: Mutex::new(Inner {
                machine,
                generation: 0,
                last_change: Instant::now(),
            }),
            context,
            bulkhead: parts.bulkhead,
            failure_classifier: parts.failure_classifier,
            error_tracker: parts.error_tracker,
            callbacks: parts.callbacks,
            logger: parts.logger,
        }
    }

    pub fn name(&self) -> &str {
        &self.context.name
    }

    pub fn config(&self) -> &Config {
        &self.context.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` if the breaker admits it.
    ///
    /// Rejected calls (`Open`, `HalfOpenLimitReached`, `BulkheadFull`) never
    /// invoke `f`. The breaker does not retry.
    pub fn call<T, E, F>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Result<T, E>,
        E: fmt::Display + 'static,
    {
        let _bulkhead = match &self.bulkhead {
            Some(bulkhead) => match bulkhead.try_acquire() {
                Some(guard) => Some(guard),
                None => {
                    self.context
                        .counters
                        .total_rejections
                        .fetch_add(1, Ordering::Relaxed);
                    return Err(CircuitError::BulkheadFull {
                        circuit: self.context.name.clone(),
                        limit: bulkhead.limit(),
                    });
                }
            },
            None => None,
        };

        let admission = self.admit()?;

        let started = Instant::now();
        match f() {
            Ok(value) => {
                self.on_success(&admission);
                Ok(value)
            }
            Err(e) => {
                self.on_failure(&admission, &e, started.elapsed());
                Err(CircuitError::Execution(e))
            }
        }
    }

    fn admit<E>(&self) -> Result<Admission, CircuitError<E>> {
        let mut transitions = Vec::new();
        let admitted = {
            let mut inner = self.lock();
            self.refresh(&mut inner, &mut transitions);

            let state = CircuitState::from_machine(inner.machine.current_state());
            match state {
                CircuitState::Open => {
                    let opened_at = inner.machine.open_data().map(|d| d.opened_at).unwrap_or(0.0);
                    Err(CircuitError::Open {
                        circuit: self.context.name.clone(),
                        opened_at,
                    })
                }
                CircuitState::HalfOpen => match self.probes.try_acquire() {
                    Some(probe) => Ok(Admission {
                        generation: inner.generation,
                        state,
                        _probe: Some(probe),
                    }),
                    None => Err(CircuitError::HalfOpenLimitReached {
                        circuit: self.context.name.clone(),
                    }),
                },
                CircuitState::Closed => Ok(Admission {
                    generation: inner.generation,
                    state,
                    _probe: None,
                }),
            }
        };

        if admitted.is_err() {
            self.context
                .counters
                .total_rejections
                .fetch_add(1, Ordering::Relaxed);
        }
        self.notify(transitions);
        admitted
    }

    /// Open -> HalfOpen once the sampled timeout has elapsed
    fn refresh(&self, inner: &mut Inner, transitions: &mut Vec<Transition>) {
        if inner.machine.current_state() == "Open"
            && inner.machine.handle(CircuitEvent::AttemptReset).is_ok()
        {
            Self::mark_changed(inner);
            transitions.push((CircuitState::Open, CircuitState::HalfOpen));
        }
    }

    fn on_success(&self, admission: &Admission) {
        let counters = &self.context.counters;
        counters.total_successes.fetch_add(1, Ordering::Relaxed);

        let mut transitions = Vec::new();
        {
            let mut inner = self.lock();
            if inner.generation != admission.generation {
                return;
            }
            match admission.state {
                CircuitState::Closed => {
                    counters.consecutive_failures.store(0, Ordering::Release);
                }
                CircuitState::HalfOpen => {
                    if let Some(data) = inner.machine.half_open_data_mut() {
                        data.consecutive_successes += 1;
                    }
                    if inner.machine.handle(CircuitEvent::Close).is_ok() {
                        counters.consecutive_failures.store(0, Ordering::Release);
                        Self::mark_changed(&mut inner);
                        transitions.push((CircuitState::HalfOpen, CircuitState::Closed));
                    }
                }
                CircuitState::Open => {}
            }
        }
        self.notify(transitions);
    }

    fn on_failure<E>(&self, admission: &Admission, error: &E, duration: Duration)
    where
        E: fmt::Display + 'static,
    {
        let counted = self
            .failure_classifier
            .as_ref()
            .map(|classifier| {
                classifier.should_trip(&FailureContext {
                    circuit_name: &self.context.name,
                    error: error as &dyn std::any::Any,
                    duration,
                    state: admission.state,
                })
            })
            .unwrap_or(true);
        if !counted {
            return;
        }

        let counters = &self.context.counters;
        counters.total_failures.fetch_add(1, Ordering::Relaxed);

        let mut transitions = Vec::new();
        {
            let mut inner = self.lock();
            if inner.generation == admission.generation {
                if admission.state == CircuitState::Closed {
                    counters.consecutive_failures.fetch_add(1, Ordering::AcqRel);
                }
                if inner.machine.handle(CircuitEvent::Trip).is_ok() {
                    self.mark_open(&mut inner);
                    transitions.push((admission.state, CircuitState::Open));
                }
            }
        }
        self.notify(transitions);

        if let Some((tracker, category)) = &self.error_tracker {
            tracker.record(
                CategorizedError::new(
                    *category,
                    ErrorSeverity::Error,
                    format!("circuit {}: {error}", self.context.name),
                )
                .with_context("circuit", self.context.name.clone())
                .with_current_correlation(),
            );
        }
    }

    fn mark_open(&self, inner: &mut Inner) {
        let opened_at = self.context.now_secs();
        let timeout_secs = self.context.sample_timeout_secs();
        if let Some(data) = inner.machine.open_data_mut() {
            data.opened_at = opened_at;
            data.timeout_secs = timeout_secs;
        }
        Self::mark_changed(inner);
    }

    fn mark_changed(inner: &mut Inner) {
        inner.generation = inner.generation.wrapping_add(1);
        inner.last_change = Instant::now();
    }

    fn notify(&self, transitions: Vec<Transition>) {
        for (from, to) in transitions {
            match to {
                CircuitState::Open => tracing::warn!(
                    circuit = %self.context.name,
                    from = %from,
                    consecutive_failures =
                        self.context.counters.consecutive_failures.load(Ordering::Relaxed),
                    "circuit opened"
                ),
                _ => tracing::info!(
                    circuit = %self.context.name,
                    from = %from,
                    to = %to,
                    "circuit state changed"
                ),
            }
            self.callbacks
                .dispatch(&self.logger, &self.context.name, from, to);
        }
    }

    /// Current state; an expired Open interval is turned into HalfOpen here
    pub fn state(&self) -> CircuitState {
        let mut transitions = Vec::new();
        let state = {
            let mut inner = self.lock();
            self.refresh(&mut inner, &mut transitions);
            CircuitState::from_machine(inner.machine.current_state())
        };
        self.notify(transitions);
        state
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    pub fn stats(&self) -> BreakerStats {
        let mut transitions = Vec::new();
        let stats = {
            let mut inner = self.lock();
            self.refresh(&mut inner, &mut transitions);
            let counters = &self.context.counters;
            BreakerStats {
                state: CircuitState::from_machine(inner.machine.current_state()),
                total_successes: counters.total_successes.load(Ordering::Relaxed),
                total_failures: counters.total_failures.load(Ordering::Relaxed),
                total_rejections: counters.total_rejections.load(Ordering::Relaxed),
                consecutive_failures: counters.consecutive_failures.load(Ordering::Acquire),
                half_open_successes: inner
                    .machine
                    .half_open_data()
                    .map(|d| d.consecutive_successes)
                    .unwrap_or(0),
                half_open_in_flight: self.probes.acquired(),
                since_last_change: inner.last_change.elapsed(),
            }
        };
        self.notify(transitions);
        stats
    }

    /// Force Closed and zero every counter
    pub fn reset(&self) {
        let previous = {
            let mut inner = self.lock();
            let previous = CircuitState::from_machine(inner.machine.current_state());
            inner.machine = DynamicCircuit::new(self.context.clone());
            self.context.counters.zero();
            Self::mark_changed(&mut inner);
            previous
        };

        tracing::debug!(circuit = %self.context.name, "circuit reset");
        if previous != CircuitState::Closed {
            self.notify(vec![(previous, CircuitState::Closed)]);
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.context.name)
            .field("config", &self.context.config)
            .field("bulkhead", &self.bulkhead)
            .field("failure_classifier", &self.failure_classifier)
            .field("callbacks", &self.callbacks)
            .finish()
    }
}
