//! Error tracking with a bounded, time-retained window and threshold alerts
//!
//! The tracker keeps two views of recorded errors:
//! - a windowed view (at most `max_errors` entries, pruned by `retention` on
//!   every record) used for rates, stats and alert evaluation
//! - lifetime per-category counters that survive window pruning and
//!   [`ErrorTracker::clear`]
//!
//! Alert handlers are invoked off the recording thread, after the tracker
//! lock is released, with panics recovered.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};

use crate::category::{CategorizedError, ErrorCategory, ErrorSeverity};
use crate::dispatch;
use crate::logger::{Logger, default_logger};

/// Maximum number of example errors handed to an alert handler
pub const MAX_ALERT_EXAMPLES: usize = 10;

/// Tracker configuration
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Upper bound on windowed entries; oldest are evicted first
    pub max_errors: usize,
    /// Entries older than this are pruned on every record
    pub retention: Duration,
    /// Minimum time between two firings of the same condition
    pub alert_cooldown: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_errors: 1000,
            retention: Duration::from_secs(60 * 60),
            alert_cooldown: Duration::from_secs(5 * 60),
        }
    }
}

/// Fires when at least `threshold` matching errors were recorded within `window`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertCondition {
    /// `ErrorCategory::Unknown` matches every category
    pub category: ErrorCategory,
    pub min_severity: ErrorSeverity,
    pub threshold: usize,
    pub window: Duration,
}

impl AlertCondition {
    pub fn new(
        category: ErrorCategory,
        min_severity: ErrorSeverity,
        threshold: usize,
        window: Duration,
    ) -> Self {
        Self {
            category,
            min_severity,
            threshold,
            window,
        }
    }

    fn matches(&self, err: &CategorizedError, cutoff: DateTime<Utc>) -> bool {
        err.timestamp >= cutoff
            && (self.category == ErrorCategory::Unknown || self.category == err.category)
            && err.severity >= self.min_severity
    }
}

/// What an alert handler receives
#[derive(Debug, Clone)]
pub struct Alert {
    pub condition: AlertCondition,
    pub error_count: usize,
    /// The most recent matching errors, oldest first, at most [`MAX_ALERT_EXAMPLES`]
    pub examples: Vec<CategorizedError>,
    pub fired_at: DateTime<Utc>,
}

/// Receives alerts when a condition crosses its threshold
pub trait AlertHandler: Send + Sync {
    fn on_alert(&self, alert: &Alert);
}

impl<F> AlertHandler for F
where
    F: Fn(&Alert) + Send + Sync,
{
    fn on_alert(&self, alert: &Alert) {
        self(alert)
    }
}

/// Point-in-time counts from the tracker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorStats {
    /// Entries currently in the window
    pub window_total: usize,
    pub by_category: BTreeMap<ErrorCategory, usize>,
    pub by_severity: BTreeMap<ErrorSeverity, usize>,
    /// Every record ever made, per category, unaffected by pruning and `clear`
    pub lifetime_by_category: BTreeMap<ErrorCategory, u64>,
    pub lifetime_total: u64,
}

struct RegisteredCondition {
    condition: AlertCondition,
    last_fired: Option<Instant>,
}

#[derive(Default)]
struct TrackerState {
    errors: VecDeque<CategorizedError>,
    conditions: Vec<RegisteredCondition>,
    handlers: Vec<Arc<dyn AlertHandler>>,
}

/// Records categorized errors and raises threshold alerts
pub struct ErrorTracker {
    config: TrackerConfig,
    state: Mutex<TrackerState>,
    lifetime: [AtomicU64; ErrorCategory::COUNT],
    logger: Arc<dyn Logger>,
}

impl ErrorTracker {
    pub fn new() -> Self {
        Self::with_config(TrackerConfig::default())
    }

    pub fn with_config(config: TrackerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(TrackerState::default()),
            lifetime: std::array::from_fn(|_| AtomicU64::new(0)),
            logger: default_logger(),
        }
    }

    /// Replace the logger used to report panicking alert handlers
    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// Process-wide tracker, created on first access
    pub fn global() -> Arc<ErrorTracker> {
        static GLOBAL: OnceLock<Arc<ErrorTracker>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(ErrorTracker::new())))
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record an error, prune the window and evaluate alert conditions
    pub fn record(&self, err: CategorizedError) {
        self.lifetime[err.category.index()].fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            category = %err.category,
            severity = %err.severity,
            message = %err.message,
            "error recorded"
        );

        let now = Utc::now();
        let (alerts, handlers) = {
            let mut state = self.lock();
            state.errors.push_back(err);
            self.prune(&mut state, now);
            let alerts = self.evaluate(&mut state, now);
            let handlers = if alerts.is_empty() {
                Vec::new()
            } else {
                state.handlers.clone()
            };
            (alerts, handlers)
        };

        for alert in alerts {
            tracing::warn!(
                category = %alert.condition.category,
                min_severity = %alert.condition.min_severity,
                threshold = alert.condition.threshold,
                error_count = alert.error_count,
                "error alert fired"
            );
            let alert = Arc::new(alert);
            for handler in &handlers {
                let handler = Arc::clone(handler);
                let alert = Arc::clone(&alert);
                dispatch::enqueue(&self.logger, "alert", move || handler.on_alert(&alert));
            }
        }
    }

    fn prune(&self, state: &mut TrackerState, now: DateTime<Utc>) {
        while state.errors.len() > self.config.max_errors {
            state.errors.pop_front();
        }
        let cutoff = now - delta(self.config.retention);
        state.errors.retain(|e| e.timestamp >= cutoff);
    }

    fn evaluate(&self, state: &mut TrackerState, now: DateTime<Utc>) -> Vec<Alert> {
        let TrackerState {
            errors, conditions, ..
        } = state;
        let cooldown = self.config.alert_cooldown;
        let mut fired = Vec::new();

        for registered in conditions.iter_mut() {
            let condition = &registered.condition;
            let cutoff = now - delta(condition.window);
            let matching: Vec<&CategorizedError> =
                errors.iter().filter(|e| condition.matches(e, cutoff)).collect();

            if matching.len() < condition.threshold.max(1) {
                continue;
            }
            if registered.last_fired.is_some_and(|last| last.elapsed() < cooldown) {
                continue;
            }

            registered.last_fired = Some(Instant::now());
            let skip = matching.len().saturating_sub(MAX_ALERT_EXAMPLES);
            fired.push(Alert {
                condition: condition.clone(),
                error_count: matching.len(),
                examples: matching[skip..].iter().map(|e| (*e).clone()).collect(),
                fired_at: now,
            });
        }

        fired
    }

    pub fn add_condition(&self, condition: AlertCondition) {
        self.lock().conditions.push(RegisteredCondition {
            condition,
            last_fired: None,
        });
    }

    /// Register an additional alert handler
    pub fn add_alert_handler(&self, handler: Arc<dyn AlertHandler>) {
        self.lock().handlers.push(handler);
    }

    /// Replace every registered alert handler with `handler`
    pub fn set_alert_handler(&self, handler: Arc<dyn AlertHandler>) {
        let mut state = self.lock();
        state.handlers.clear();
        state.handlers.push(handler);
    }

    /// Errors per second over the trailing `window`
    pub fn error_rate(&self, window: Duration) -> f64 {
        self.rate(window, None)
    }

    /// Errors per second of one category over the trailing `window`
    pub fn error_rate_by_category(&self, category: ErrorCategory, window: Duration) -> f64 {
        self.rate(window, Some(category))
    }

    fn rate(&self, window: Duration, category: Option<ErrorCategory>) -> f64 {
        if window.is_zero() {
            return 0.0;
        }
        let cutoff = Utc::now() - delta(window);
        let count = self
            .lock()
            .errors
            .iter()
            .filter(|e| e.timestamp > cutoff)
            .filter(|e| category.is_none_or(|c| c == e.category))
            .count();
        count as f64 / window.as_secs_f64()
    }

    pub fn stats(&self) -> ErrorStats {
        let mut stats = ErrorStats::default();
        {
            let state = self.lock();
            stats.window_total = state.errors.len();
            for err in &state.errors {
                *stats.by_category.entry(err.category).or_default() += 1;
                *stats.by_severity.entry(err.severity).or_default() += 1;
            }
        }
        for category in ErrorCategory::ALL {
            let count = self.lifetime_count(category);
            stats.lifetime_total += count;
            if count > 0 {
                stats.lifetime_by_category.insert(category, count);
            }
        }
        stats
    }

    /// Number of errors ever recorded for `category`
    pub fn lifetime_count(&self, category: ErrorCategory) -> u64 {
        self.lifetime[category.index()].load(Ordering::Relaxed)
    }

    /// Copies of the `limit` most recent errors, oldest first
    pub fn recent_errors(&self, limit: usize) -> Vec<CategorizedError> {
        if limit == 0 {
            return Vec::new();
        }
        let state = self.lock();
        let skip = state.errors.len().saturating_sub(limit);
        state.errors.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty the window and forget alert cooldowns; lifetime counters are kept
    pub fn clear(&self) {
        let mut state = self.lock();
        state.errors.clear();
        for registered in &mut state.conditions {
            registered.last_fired = None;
        }
    }

    /// [`clear`](Self::clear) and also zero the lifetime counters
    pub fn clear_all(&self) {
        self.clear();
        for counter in &self.lifetime {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for ErrorTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ErrorTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorTracker")
            .field("config", &self.config)
            .field("window_len", &self.len())
            .finish()
    }
}

fn delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}
