//! Atomic counters, gauges and latency accumulators
//!
//! Every update is a single atomic operation, so a [`Metrics`] value can be
//! shared freely between threads without a lock. Once
//! [`register_exporter`](Metrics::register_exporter) has been called the
//! updates are mirrored into the process-wide `metrics` facade.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CounterKind {
    Starts,
    Stops,
    Restarts,
    ConfigReloads,
    UpdateCycles,
    ErrorsTotal,
    EventsEmitted,
    ScriptCalls,
    ScriptErrors,
    RemoteCommands,
    RemoteErrors,
}

impl CounterKind {
    const COUNT: usize = 11;

    const ALL: [CounterKind; Self::COUNT] = [
        CounterKind::Starts,
        CounterKind::Stops,
        CounterKind::Restarts,
        CounterKind::ConfigReloads,
        CounterKind::UpdateCycles,
        CounterKind::ErrorsTotal,
        CounterKind::EventsEmitted,
        CounterKind::ScriptCalls,
        CounterKind::ScriptErrors,
        CounterKind::RemoteCommands,
        CounterKind::RemoteErrors,
    ];

    fn metric_name(self) -> &'static str {
        match self {
            CounterKind::Starts => "sysmon_starts_total",
            CounterKind::Stops => "sysmon_stops_total",
            CounterKind::Restarts => "sysmon_restarts_total",
            CounterKind::ConfigReloads => "sysmon_config_reloads_total",
            CounterKind::UpdateCycles => "sysmon_update_cycles_total",
            CounterKind::ErrorsTotal => "sysmon_errors_total",
            CounterKind::EventsEmitted => "sysmon_events_emitted_total",
            CounterKind::ScriptCalls => "sysmon_script_calls_total",
            CounterKind::ScriptErrors => "sysmon_script_errors_total",
            CounterKind::RemoteCommands => "sysmon_remote_commands_total",
            CounterKind::RemoteErrors => "sysmon_remote_errors_total",
        }
    }

    fn description(self) -> &'static str {
        match self {
            CounterKind::Starts => "Number of successful instance starts",
            CounterKind::Stops => "Number of completed instance stops",
            CounterKind::Restarts => "Number of completed instance restarts",
            CounterKind::ConfigReloads => "Number of configuration reloads",
            CounterKind::UpdateCycles => "Number of workload update cycles",
            CounterKind::ErrorsTotal => "Number of errors reported by the instance",
            CounterKind::EventsEmitted => "Number of lifecycle events emitted",
            CounterKind::ScriptCalls => "Number of script invocations",
            CounterKind::ScriptErrors => "Number of failed script invocations",
            CounterKind::RemoteCommands => "Number of remote commands executed",
            CounterKind::RemoteErrors => "Number of failed remote commands",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LatencyKind {
    Update,
    Script,
    Render,
}

impl LatencyKind {
    const COUNT: usize = 3;

    const ALL: [LatencyKind; Self::COUNT] =
        [LatencyKind::Update, LatencyKind::Script, LatencyKind::Render];

    fn metric_name(self) -> &'static str {
        match self {
            LatencyKind::Update => "sysmon_update_latency_seconds",
            LatencyKind::Script => "sysmon_script_latency_seconds",
            LatencyKind::Render => "sysmon_render_latency_seconds",
        }
    }
}

const RUNNING_GAUGE: &str = "sysmon_running";
const ACTIVE_MONITORS_GAUGE: &str = "sysmon_active_monitors";

#[derive(Debug, Default)]
struct LatencyAccumulator {
    sum_nanos: AtomicU64,
    count: AtomicU64,
}

impl LatencyAccumulator {
    fn record(&self, d: Duration) {
        let nanos = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
        self.sum_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn average(&self) -> Duration {
        let sum = self.sum_nanos.load(Ordering::Relaxed);
        let count = self.count.load(Ordering::Relaxed);
        Duration::from_nanos(safe_divide(sum, count))
    }

    fn reset(&self) {
        self.sum_nanos.store(0, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
    }
}

fn safe_divide(sum: u64, count: u64) -> u64 {
    if count == 0 { 0 } else { sum / count }
}

/// Lock-free runtime metrics for one instance (or the whole process via [`Metrics::global`])
#[derive(Debug)]
pub struct Metrics {
    counters: [AtomicU64; CounterKind::COUNT],
    running: AtomicBool,
    active_monitors: AtomicI64,
    latencies: [LatencyAccumulator; LatencyKind::COUNT],
    exporting: AtomicBool,
}

/// Immutable point-in-time copy of a [`Metrics`] value
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub starts: u64,
    pub stops: u64,
    pub restarts: u64,
    pub config_reloads: u64,
    pub update_cycles: u64,
    pub errors_total: u64,
    pub events_emitted: u64,
    pub script_calls: u64,
    pub script_errors: u64,
    pub remote_commands: u64,
    pub remote_errors: u64,
    pub running: bool,
    pub active_monitors: i64,
    pub avg_update_latency: Duration,
    pub avg_script_latency: Duration,
    pub avg_render_latency: Duration,
    pub captured_at: DateTime<Utc>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
            running: AtomicBool::new(false),
            active_monitors: AtomicI64::new(0),
            latencies: std::array::from_fn(|_| LatencyAccumulator::default()),
            exporting: AtomicBool::new(false),
        }
    }

    /// Process-wide collector, created on first access
    pub fn global() -> Arc<Metrics> {
        static GLOBAL: OnceLock<Arc<Metrics>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Metrics::new())))
    }

    fn exporting(&self) -> bool {
        self.exporting.load(Ordering::Relaxed)
    }

    fn counter(&self, kind: CounterKind) -> u64 {
        self.counters[kind as usize].load(Ordering::Relaxed)
    }

    fn increment(&self, kind: CounterKind) {
        self.counters[kind as usize].fetch_add(1, Ordering::Relaxed);
        if self.exporting() {
            metrics::counter!(kind.metric_name()).increment(1);
        }
    }

    fn record_latency(&self, kind: LatencyKind, d: Duration) {
        self.latencies[kind as usize].record(d);
        if self.exporting() {
            metrics::histogram!(kind.metric_name()).record(d.as_secs_f64());
        }
    }

    pub fn increment_starts(&self) {
        self.increment(CounterKind::Starts);
    }

    pub fn increment_stops(&self) {
        self.increment(CounterKind::Stops);
    }

    pub fn increment_restarts(&self) {
        self.increment(CounterKind::Restarts);
    }

    pub fn increment_config_reloads(&self) {
        self.increment(CounterKind::ConfigReloads);
    }

    pub fn increment_update_cycles(&self) {
        self.increment(CounterKind::UpdateCycles);
    }

    pub fn increment_errors(&self) {
        self.increment(CounterKind::ErrorsTotal);
    }

    pub fn increment_events_emitted(&self) {
        self.increment(CounterKind::EventsEmitted);
    }

    pub fn increment_script_calls(&self) {
        self.increment(CounterKind::ScriptCalls);
    }

    pub fn increment_script_errors(&self) {
        self.increment(CounterKind::ScriptErrors);
    }

    pub fn increment_remote_commands(&self) {
        self.increment(CounterKind::RemoteCommands);
    }

    pub fn increment_remote_errors(&self) {
        self.increment(CounterKind::RemoteErrors);
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Relaxed);
        if self.exporting() {
            metrics::gauge!(RUNNING_GAUGE).set(if running { 1.0 } else { 0.0 });
        }
    }

    pub fn set_active_monitors(&self, count: i64) {
        self.active_monitors.store(count, Ordering::Relaxed);
        if self.exporting() {
            metrics::gauge!(ACTIVE_MONITORS_GAUGE).set(count as f64);
        }
    }

    pub fn record_update_latency(&self, d: Duration) {
        self.record_latency(LatencyKind::Update, d);
    }

    pub fn record_script_latency(&self, d: Duration) {
        self.record_latency(LatencyKind::Script, d);
    }

    pub fn record_render_latency(&self, d: Duration) {
        self.record_latency(LatencyKind::Render, d);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            starts: self.counter(CounterKind::Starts),
            stops: self.counter(CounterKind::Stops),
            restarts: self.counter(CounterKind::Restarts),
            config_reloads: self.counter(CounterKind::ConfigReloads),
            update_cycles: self.counter(CounterKind::UpdateCycles),
            errors_total: self.counter(CounterKind::ErrorsTotal),
            events_emitted: self.counter(CounterKind::EventsEmitted),
            script_calls: self.counter(CounterKind::ScriptCalls),
            script_errors: self.counter(CounterKind::ScriptErrors),
            remote_commands: self.counter(CounterKind::RemoteCommands),
            remote_errors: self.counter(CounterKind::RemoteErrors),
            running: self.running.load(Ordering::Relaxed),
            active_monitors: self.active_monitors.load(Ordering::Relaxed),
            avg_update_latency: self.latencies[LatencyKind::Update as usize].average(),
            avg_script_latency: self.latencies[LatencyKind::Script as usize].average(),
            avg_render_latency: self.latencies[LatencyKind::Render as usize].average(),
            captured_at: Utc::now(),
        }
    }

    /// Zero every counter, gauge and latency accumulator
    pub fn reset(&self) {
        for counter in &self.counters {
            counter.store(0, Ordering::Relaxed);
        }
        self.running.store(false, Ordering::Relaxed);
        self.active_monitors.store(0, Ordering::Relaxed);
        for latency in &self.latencies {
            latency.reset();
        }
    }

    /// Publish this collector through the `metrics` facade.
    ///
    /// The first call describes every metric, publishes the current values
    /// and turns on mirroring of later updates. Returns `false` if the
    /// collector was already registered; repeated calls change nothing.
    pub fn register_exporter(&self) -> bool {
        if self.exporting.swap(true, Ordering::AcqRel) {
            return false;
        }

        for kind in CounterKind::ALL {
            metrics::describe_counter!(kind.metric_name(), kind.description());
            metrics::counter!(kind.metric_name()).absolute(self.counter(kind));
        }
        for kind in LatencyKind::ALL {
            metrics::describe_histogram!(
                kind.metric_name(),
                metrics::Unit::Seconds,
                "Observed latency per operation"
            );
        }
        metrics::describe_gauge!(RUNNING_GAUGE, "1 while the instance is running");
        metrics::describe_gauge!(ACTIVE_MONITORS_GAUGE, "Number of active monitors");

        let running = self.running.load(Ordering::Relaxed);
        metrics::gauge!(RUNNING_GAUGE).set(if running { 1.0 } else { 0.0 });
        metrics::gauge!(ACTIVE_MONITORS_GAUGE)
            .set(self.active_monitors.load(Ordering::Relaxed) as f64);

        tracing::debug!("metrics exporter registered");
        true
    }

    pub fn is_exporting(&self) -> bool {
        self.exporting()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};
    use std::thread;

    #[test]
    fn test_counters_and_gauges() {
        let metrics = Metrics::new();
        metrics.increment_starts();
        metrics.increment_starts();
        metrics.increment_remote_errors();
        metrics.set_running(true);
        metrics.set_active_monitors(4);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.starts, 2);
        assert_eq!(snapshot.remote_errors, 1);
        assert_eq!(snapshot.stops, 0);
        assert!(snapshot.running);
        assert_eq!(snapshot.active_monitors, 4);
    }

    #[test]
    fn test_average_latency_is_arithmetic_mean() {
        let metrics = Metrics::new();
        for ms in [10, 20, 30, 40] {
            metrics.record_update_latency(Duration::from_millis(ms));
        }
        metrics.record_script_latency(Duration::from_micros(250));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.avg_update_latency, Duration::from_millis(25));
        assert_eq!(snapshot.avg_script_latency, Duration::from_micros(250));
    }

    #[test]
    fn test_average_without_samples_is_zero() {
        let snapshot = Metrics::new().snapshot();
        assert_eq!(snapshot.avg_update_latency, Duration::ZERO);
        assert_eq!(snapshot.avg_script_latency, Duration::ZERO);
        assert_eq!(snapshot.avg_render_latency, Duration::ZERO);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let metrics = Metrics::new();
        metrics.increment_errors();
        let before = metrics.snapshot();
        metrics.increment_errors();

        assert_eq!(before.errors_total, 1);
        assert_eq!(metrics.snapshot().errors_total, 2);
    }

    #[test]
    fn test_reset_zeroes_everything() {
        let metrics = Metrics::new();
        metrics.increment_update_cycles();
        metrics.set_running(true);
        metrics.set_active_monitors(2);
        metrics.record_render_latency(Duration::from_millis(5));

        metrics.reset();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.update_cycles, 0);
        assert!(!snapshot.running);
        assert_eq!(snapshot.active_monitors, 0);
        assert_eq!(snapshot.avg_render_latency, Duration::ZERO);
    }

    #[test]
    fn test_concurrent_increments_are_exact() {
        let metrics = Arc::new(Metrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.increment_events_emitted();
                        metrics.record_update_latency(Duration::from_micros(100));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.events_emitted, 8000);
        assert_eq!(snapshot.avg_update_latency, Duration::from_micros(100));
    }

    #[test]
    fn test_register_exporter_is_idempotent_and_mirrors_updates() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let metrics = Metrics::new();
        metrics.increment_starts();

        metrics::with_local_recorder(&recorder, || {
            assert!(metrics.register_exporter());
            assert!(!metrics.register_exporter());
            metrics.increment_starts();
            metrics.set_active_monitors(3);
            metrics.record_update_latency(Duration::from_millis(500));
        });

        let values = snapshotter.snapshot().into_vec();
        let find = |name: &str| {
            values
                .iter()
                .find(|(key, _, _, _)| key.key().name() == name)
                .map(|(_, _, _, value)| value.clone())
        };

        assert_eq!(find("sysmon_starts_total"), Some(&DebugValue::Counter(2)));
        match find("sysmon_active_monitors") {
            Some(DebugValue::Gauge(v)) => assert_eq!(v.into_inner(), 3.0),
            other => panic!("unexpected gauge value: {other:?}"),
        }
        match find("sysmon_update_latency_seconds") {
            Some(DebugValue::Histogram(samples)) => {
                assert_eq!(samples.len(), 1);
                assert_eq!(samples[0].into_inner(), 0.5);
            }
            other => panic!("unexpected histogram value: {other:?}"),
        }
        assert!(metrics.is_exporting());
    }

    #[test]
    fn test_global_is_shared() {
        assert!(Arc::ptr_eq(&Metrics::global(), &Metrics::global()));
    }
}
