//! Embedding the monitor core: a polling workload behind a circuit breaker,
//! with error alerts and lifecycle events printed to stdout.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sysmon_core::{
    Alert, AlertCondition, BoxError, CircuitBreaker, ErrorCategory, ErrorSeverity, ErrorTracker,
    Event, LifecycleError, LifecycleManager, RunContext, Workload,
};

#[derive(Debug)]
struct MonitorConfig {
    poll_interval: Duration,
    host: String,
}

/// Polls a flaky remote host through a circuit breaker
struct RemotePoller {
    breaker: CircuitBreaker,
    polls: AtomicU32,
    config: Mutex<Option<Arc<MonitorConfig>>>,
}

impl RemotePoller {
    fn current_config(&self) -> Option<Arc<MonitorConfig>> {
        self.config.lock().ok().and_then(|c| c.clone())
    }

    fn poll_once(&self, host: &str) -> Result<String, String> {
        let n = self.polls.fetch_add(1, Ordering::Relaxed);
        // fails on polls 3..=6 to show the breaker opening and recovering
        if (3..=6).contains(&n) {
            Err(format!("{host}: connection refused"))
        } else {
            Ok(format!("{host}: load 0.{n}"))
        }
    }
}

#[async_trait]
impl Workload<MonitorConfig> for RemotePoller {
    fn name(&self) -> &str {
        "remote-poller"
    }

    fn start(&self, config: &Arc<MonitorConfig>) -> Result<(), BoxError> {
        self.apply_config(config);
        Ok(())
    }

    fn apply_config(&self, config: &Arc<MonitorConfig>) {
        if let Ok(mut current) = self.config.lock() {
            *current = Some(Arc::clone(config));
        }
    }

    async fn run(&self, ctx: RunContext) -> Result<(), BoxError> {
        while !ctx.is_cancelled() {
            let config = self.current_config().ok_or("no configuration applied")?;
            let started = Instant::now();
            match self.breaker.call(|| self.poll_once(&config.host)) {
                Ok(sample) => println!("  sample  {sample}"),
                Err(e) if e.is_rejected() => println!("  skipped {e}"),
                Err(e) => println!("  failed  {e}"),
            }
            ctx.record_update(started.elapsed());

            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = tokio::time::sleep(config.poll_interval) => {}
            }
        }
        Ok(())
    }
}

fn main() -> Result<(), LifecycleError> {
    println!("=== sysmon-core embedding example ===\n");

    let tracker = Arc::new(ErrorTracker::new());
    tracker.add_condition(AlertCondition::new(
        ErrorCategory::Remote,
        ErrorSeverity::Error,
        3,
        Duration::from_secs(60),
    ));
    tracker.add_alert_handler(Arc::new(|alert: &Alert| {
        println!(
            "  ALERT   {} {} errors in {:?}",
            alert.error_count, alert.condition.category, alert.condition.window
        );
    }));

    let breaker = CircuitBreaker::builder("db01")
        .failure_threshold(3)
        .timeout(Duration::from_millis(400))
        .success_threshold(1)
        .error_tracker(Arc::clone(&tracker), ErrorCategory::Remote)
        .on_state_change(|name, from, to| println!("  circuit {name}: {from} -> {to}"))
        .build();

    let manager = LifecycleManager::builder(RemotePoller {
        breaker,
        polls: AtomicU32::new(0),
        config: Mutex::new(None),
    })
    .name("example")
    .config(
        MonitorConfig {
            poll_interval: Duration::from_millis(150),
            host: "db01".to_string(),
        },
        "inline",
    )
    .error_tracker(Arc::clone(&tracker))
    .event_handler(|event: &Event| println!("  event   {} ({})", event.kind, event.message))
    .build()?;

    if let Some(config) = manager.config() {
        println!("Polling {} every {:?}\n", config.host, config.poll_interval);
    }

    manager.start()?;
    std::thread::sleep(Duration::from_secs(2));
    manager.stop()?;

    let status = manager.status();
    let snapshot = manager.metrics().snapshot();
    println!("\n--- Summary ---");
    println!("update cycles: {}", status.update_count);
    println!("avg update latency: {:?}", snapshot.avg_update_latency);
    println!("events emitted: {}", snapshot.events_emitted);
    println!(
        "remote errors recorded: {}",
        tracker.lifetime_count(ErrorCategory::Remote)
    );
    println!("health: {}", manager.health().status);

    Ok(())
}
