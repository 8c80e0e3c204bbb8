//! End-to-end breaker behavior: a remote host goes down, the breaker sheds
//! load, the tracker alerts, and the host recovers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use sysmon_core::{
    Alert, AlertCondition, CircuitBreaker, CircuitError, CircuitState, ErrorCategory,
    ErrorSeverity, ErrorTracker,
};

const WAIT: Duration = Duration::from_secs(5);

/// Fake remote host whose availability the test flips
struct Host {
    up: AtomicBool,
    calls: AtomicUsize,
}

impl Host {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            up: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        })
    }

    fn uptime(&self) -> Result<u64, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.up.load(Ordering::SeqCst) {
            Ok(42)
        } else {
            Err("ssh: connection refused".to_string())
        }
    }
}

#[test]
fn test_outage_and_recovery() {
    let host = Host::new();
    let tracker = Arc::new(ErrorTracker::new());
    tracker.add_condition(AlertCondition::new(
        ErrorCategory::Remote,
        ErrorSeverity::Warning,
        3,
        Duration::from_secs(60),
    ));
    let (alert_tx, alerts) = mpsc::channel();
    let alert_tx = Mutex::new(alert_tx);
    tracker.add_alert_handler(Arc::new(move |alert: &Alert| {
        let _ = alert_tx.lock().unwrap().send(alert.error_count);
    }));

    let (change_tx, changes) = mpsc::channel();
    let change_tx = Mutex::new(change_tx);
    let breaker = CircuitBreaker::builder("web01")
        .failure_threshold(3)
        .success_threshold(2)
        .timeout(Duration::from_millis(100))
        .error_tracker(Arc::clone(&tracker), ErrorCategory::Remote)
        .on_state_change(move |_, from, to| {
            let _ = change_tx.lock().unwrap().send((from, to));
        })
        .build();

    assert_eq!(breaker.call(|| host.uptime()).unwrap(), 42);

    host.up.store(false, Ordering::SeqCst);
    for _ in 0..3 {
        let err = breaker.call(|| host.uptime()).unwrap_err();
        assert!(!err.is_rejected());
    }
    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(
        changes.recv_timeout(WAIT).unwrap(),
        (CircuitState::Closed, CircuitState::Open)
    );
    assert_eq!(alerts.recv_timeout(WAIT).unwrap(), 3);

    // shed load while open: the host is not contacted
    let calls_before = host.calls.load(Ordering::SeqCst);
    let rejected = breaker.call(|| host.uptime());
    assert!(matches!(rejected, Err(CircuitError::Open { .. })));
    assert_eq!(host.calls.load(Ordering::SeqCst), calls_before);

    host.up.store(true, Ordering::SeqCst);
    thread::sleep(Duration::from_millis(150));
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    breaker.call(|| host.uptime()).unwrap();
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    breaker.call(|| host.uptime()).unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);

    let stats = breaker.stats();
    assert_eq!(stats.total_failures, 3);
    assert_eq!(stats.total_successes, 3);
    assert_eq!(stats.total_rejections, 1);
    assert_eq!(stats.consecutive_failures, 0);

    assert_eq!(tracker.lifetime_count(ErrorCategory::Remote), 3);
    let recent = tracker.recent_errors(1);
    assert!(recent[0].message.contains("connection refused"));
}

#[test]
fn test_probe_failure_reopens() {
    let host = Host::new();
    let breaker = CircuitBreaker::builder("db01")
        .failure_threshold(1)
        .timeout(Duration::from_millis(50))
        .build();

    host.up.store(false, Ordering::SeqCst);
    let _ = breaker.call(|| host.uptime());
    assert!(breaker.is_open());

    thread::sleep(Duration::from_millis(80));
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    let _ = breaker.call(|| host.uptime());
    assert_eq!(breaker.state(), CircuitState::Open);
}

#[test]
fn test_breakers_are_independent() {
    let down = Host::new();
    down.up.store(false, Ordering::SeqCst);
    let up = Host::new();

    let a = CircuitBreaker::builder("a").failure_threshold(2).build();
    let b = CircuitBreaker::builder("b").failure_threshold(2).build();

    for _ in 0..2 {
        let _ = a.call(|| down.uptime());
        b.call(|| up.uptime()).unwrap();
    }
    assert!(a.is_open());
    assert!(b.is_closed());
}

#[test]
fn test_concurrent_callers_keep_exact_counts() {
    let breaker = Arc::new(
        CircuitBreaker::builder("shared")
            .failure_threshold(1_000_000)
            .build(),
    );

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let breaker = Arc::clone(&breaker);
            thread::spawn(move || {
                for n in 0..250 {
                    let fail = (i + n) % 2 == 0;
                    let _ = breaker.call(|| if fail { Err("x") } else { Ok(()) });
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = breaker.stats();
    assert_eq!(stats.total_successes + stats.total_failures, 2000);
    assert_eq!(stats.total_failures, 1000);
    assert_eq!(stats.state, CircuitState::Closed);
}
