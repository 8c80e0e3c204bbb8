//! Supervised instance lifecycle: start, stop, restart and hot reload
//!
//! A [`LifecycleManager`] owns one injected [`Workload`]. `start` launches a
//! dedicated supervisor thread running a current-thread tokio runtime that
//! drives the workload until it returns or the run's [`CancellationToken`]
//! fires. `stop` cancels the token and waits for the supervisor with a bound;
//! shutdown is cooperative only.
//!
//! Failures are returned to the caller and, unless they are caller misuse,
//! also stored as the last error, recorded in the [`ErrorTracker`], counted in
//! [`Metrics`] and forwarded to the error handler. Handlers always run on
//! the callback dispatcher thread, after the manager lock is released. The
//! Started event of a run is always delivered before its Stopped event.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::category::{CategorizedError, ErrorCategory, ErrorSeverity};
use crate::correlation::CorrelationId;
use crate::dispatch;
use crate::errors::{BoxError, LifecycleError};
use crate::events::{ErrorHandler, Event, EventHandler, EventKind};
use crate::health::{ComponentHealth, HealthCheck, HealthState};
use crate::logger::{Logger, default_logger};
use crate::metrics::Metrics;
use crate::tracker::ErrorTracker;

/// The long-running job a [`LifecycleManager`] supervises.
///
/// Only `run` is async; it executes on the supervisor thread. The default
/// `run` waits for cancellation, which is the headless mode.
#[async_trait]
pub trait Workload<C>: Send + Sync + 'static
where
    C: Send + Sync + 'static,
{
    fn name(&self) -> &str {
        "workload"
    }

    /// Prepare for a run. Called on the caller's thread by `start`.
    fn start(&self, _config: &Arc<C>) -> Result<(), BoxError> {
        Ok(())
    }

    /// Run until done or until `ctx` is cancelled
    async fn run(&self, ctx: RunContext) -> Result<(), BoxError> {
        ctx.cancelled().await;
        Ok(())
    }

    /// New configuration while running; the workload keeps running
    fn apply_config(&self, _config: &Arc<C>) {}

    fn is_healthy(&self) -> bool {
        true
    }
}

/// Workload that does nothing until stopped
#[derive(Debug, Clone, Copy, Default)]
pub struct Headless;

#[async_trait]
impl<C> Workload<C> for Headless
where
    C: Send + Sync + 'static,
{
    fn name(&self) -> &str {
        "headless"
    }
}

/// Source of application configuration for restart and reload
pub trait ConfigLoader<C>: Send + Sync {
    fn load(&self) -> Result<C, BoxError>;

    /// Human-readable origin reported in [`Status::config_source`]
    fn source(&self) -> String {
        "loader".to_string()
    }
}

impl<C, F> ConfigLoader<C> for F
where
    F: Fn() -> Result<C, BoxError> + Send + Sync,
{
    fn load(&self) -> Result<C, BoxError> {
        self()
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Instance name used in logs and thread names
    pub name: String,
    /// Upper bound on how long `stop` waits for the supervisor
    pub shutdown_timeout: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            name: "sysmon".to_string(),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Point-in-time view of an instance
#[derive(Debug, Clone)]
pub struct Status {
    pub running: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub uptime: Duration,
    pub update_count: u64,
    pub last_error: Option<LifecycleError>,
    pub config_source: String,
}

#[derive(Debug)]
struct ErrorRecord {
    error: LifecycleError,
    at: DateTime<Utc>,
}

/// State shared with the supervisor thread and run contexts
struct Core {
    name: String,
    workload_name: String,
    running: AtomicBool,
    update_count: AtomicU64,
    last_error: ArcSwapOption<ErrorRecord>,
    run_id: ArcSwapOption<CorrelationId>,
    error_handler: ArcSwapOption<Box<dyn ErrorHandler>>,
    event_handler: ArcSwapOption<Box<dyn EventHandler>>,
    tracker: Arc<ErrorTracker>,
    metrics: Arc<Metrics>,
    logger: Arc<dyn Logger>,
}

impl Core {
    fn current_run(&self) -> Option<CorrelationId> {
        self.run_id.load_full().map(|id| *id)
    }

    fn notify_error(&self, error: LifecycleError) {
        self.last_error.store(Some(Arc::new(ErrorRecord {
            error: error.clone(),
            at: Utc::now(),
        })));
        self.metrics.increment_errors();

        let (category, severity) = classify(&error);
        tracing::error!(instance = %self.name, error = %error, "instance error");

        let mut categorized = CategorizedError::wrap(category, severity, error.clone())
            .with_context("instance", self.name.clone());
        if let Some(id) = self.current_run() {
            categorized = categorized.with_correlation(id);
        }
        self.tracker.record(categorized);

        let message = error.to_string();
        if let Some(handler) = self.error_handler.load_full() {
            dispatch::enqueue(&self.logger, "error_handler", move || {
                handler.on_error(&error)
            });
        }
        self.emit(EventKind::Error, message);
    }

    fn emit(&self, kind: EventKind, message: impl Into<String>) {
        let event = Event::new(kind, message, self.current_run());
        self.metrics.increment_events_emitted();
        tracing::debug!(instance = %self.name, event = %kind, "{}", event.message);

        if let Some(handler) = self.event_handler.load_full() {
            dispatch::enqueue(&self.logger, "event_handler", move || {
                handler.on_event(&event)
            });
        }
    }
}

fn classify(error: &LifecycleError) -> (ErrorCategory, ErrorSeverity) {
    match error {
        LifecycleError::ConfigLoad { .. } => (ErrorCategory::Config, ErrorSeverity::Error),
        LifecycleError::Workload { .. } => (ErrorCategory::Monitor, ErrorSeverity::Error),
        LifecycleError::WorkloadStart { .. } => (ErrorCategory::Monitor, ErrorSeverity::Critical),
        LifecycleError::ShutdownTimeout { .. } => (ErrorCategory::Unknown, ErrorSeverity::Warning),
        LifecycleError::Spawn { .. } | LifecycleError::Runtime { .. } => {
            (ErrorCategory::Unknown, ErrorSeverity::Critical)
        }
        _ => (ErrorCategory::Unknown, ErrorSeverity::Error),
    }
}

/// Handed to [`Workload::run`]
#[derive(Clone)]
pub struct RunContext {
    token: CancellationToken,
    core: Arc<Core>,
    correlation_id: CorrelationId,
}

impl RunContext {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once stop has been requested
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Count one completed update cycle and its latency
    pub fn record_update(&self, latency: Duration) {
        self.core.update_count.fetch_add(1, Ordering::Relaxed);
        self.core.metrics.increment_update_cycles();
        self.core.metrics.record_update_latency(latency);
    }

    /// Report a non-fatal error; the run continues
    pub fn report_error(&self, error: impl Into<BoxError>) {
        self.core.notify_error(LifecycleError::Workload {
            workload: self.core.workload_name.clone(),
            source: Arc::from(error.into()),
        });
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.core.metrics
    }

    pub fn tracker(&self) -> &Arc<ErrorTracker> {
        &self.core.tracker
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }
}

struct Supervisor {
    done: mpsc::Receiver<()>,
    handle: JoinHandle<()>,
}

struct State<C> {
    /// A `start` is between claiming the instance and launching the supervisor
    starting: bool,
    config: Option<Arc<C>>,
    config_source: String,
    token: Option<CancellationToken>,
    supervisor: Option<Supervisor>,
    start_time: Option<DateTime<Utc>>,
    started_at: Option<Instant>,
}

/// Owns one supervised workload and its configuration
pub struct LifecycleManager<C>
where
    C: Send + Sync + 'static,
{
    core: Arc<Core>,
    options: LifecycleOptions,
    workload: Arc<dyn Workload<C>>,
    loader: Option<Arc<dyn ConfigLoader<C>>>,
    state: Mutex<State<C>>,
}

impl<C> LifecycleManager<C>
where
    C: Send + Sync + 'static,
{
    pub fn builder<W>(workload: W) -> LifecycleBuilder<C>
    where
        W: Workload<C>,
    {
        LifecycleBuilder::new(workload)
    }

    fn lock(&self) -> MutexGuard<'_, State<C>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::Acquire)
    }

    /// Configuration currently in effect
    pub fn config(&self) -> Option<Arc<C>> {
        self.lock().config.clone()
    }

    pub fn tracker(&self) -> &Arc<ErrorTracker> {
        &self.core.tracker
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.core.metrics
    }

    pub fn set_error_handler<H>(&self, handler: H)
    where
        H: ErrorHandler + 'static,
    {
        let handler: Box<dyn ErrorHandler> = Box::new(handler);
        self.core.error_handler.store(Some(Arc::new(handler)));
    }

    pub fn set_event_handler<H>(&self, handler: H)
    where
        H: EventHandler + 'static,
    {
        let handler: Box<dyn EventHandler> = Box::new(handler);
        self.core.event_handler.store(Some(Arc::new(handler)));
    }

    /// Start the workload on a fresh supervisor thread. Returns once it is launched.
    ///
    /// The config loader and [`Workload::start`] run without the manager lock
    /// held. The Started event is queued before the supervisor may queue
    /// Stopped.
    pub fn start(&self) -> Result<(), LifecycleError> {
        let result = self.launch();
        match &result {
            Err(e) if !e.is_structural() => self.core.notify_error(e.clone()),
            _ => {}
        }
        result
    }

    fn launch(&self) -> Result<(), LifecycleError> {
        let current = {
            let mut state = self.lock();
            if state.starting || self.is_running() {
                return Err(LifecycleError::AlreadyRunning);
            }
            if let Some(previous) = state.supervisor.take() {
                let _ = previous.handle.join();
            }
            state.starting = true;
            state.config.clone()
        };

        let run_id = CorrelationId::new();
        self.core.run_id.store(Some(Arc::new(run_id)));

        let prepared = catch_unwind(AssertUnwindSafe(|| self.prepare(current)))
            .unwrap_or_else(|payload| {
                Err(LifecycleError::WorkloadStart {
                    workload: self.workload.name().to_string(),
                    source: Arc::from(BoxError::from(format!(
                        "panicked during start: {}",
                        dispatch::panic_message(payload.as_ref())
                    ))),
                })
            });
        let (config, loaded_from) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.lock().starting = false;
                return Err(e);
            }
        };

        let token = CancellationToken::new();
        let (release, gate) = mpsc::sync_channel(1);
        {
            let mut state = self.lock();
            state.starting = false;
            if let Some(source) = loaded_from {
                state.config = Some(config);
                state.config_source = source;
            }

            self.core.running.store(true, Ordering::Release);
            self.core.metrics.set_running(true);
            let supervisor = match self.spawn_supervisor(token.clone(), run_id, gate) {
                Ok(supervisor) => supervisor,
                Err(e) => {
                    self.core.metrics.set_running(false);
                    self.core.running.store(false, Ordering::Release);
                    return Err(e);
                }
            };

            state.token = Some(token);
            state.supervisor = Some(supervisor);
            state.start_time = Some(Utc::now());
            state.started_at = Some(Instant::now());
        }

        self.core.metrics.increment_starts();
        tracing::info!(instance = %self.options.name, run_id = %run_id, "instance started");
        self.core.emit(EventKind::Started, "instance started");
        let _ = release.send(());
        Ok(())
    }

    /// Configuration for the next run, loaded first when none is held yet,
    /// handed to the workload's `start` hook. The source is `Some` when the
    /// loader was consulted.
    fn prepare(
        &self,
        current: Option<Arc<C>>,
    ) -> Result<(Arc<C>, Option<String>), LifecycleError> {
        let (config, loaded_from) = match current {
            Some(config) => (config, None),
            None => {
                let loader = self
                    .loader
                    .as_ref()
                    .ok_or(LifecycleError::MissingConfiguration)?;
                let config = Arc::new(loader.load().map_err(LifecycleError::config_load)?);
                (config, Some(loader.source()))
            }
        };

        self.workload
            .start(&config)
            .map_err(|e| LifecycleError::WorkloadStart {
                workload: self.workload.name().to_string(),
                source: Arc::from(e),
            })?;
        Ok((config, loaded_from))
    }

    fn spawn_supervisor(
        &self,
        token: CancellationToken,
        run_id: CorrelationId,
        gate: mpsc::Receiver<()>,
    ) -> Result<Supervisor, LifecycleError> {
        let core = Arc::clone(&self.core);
        let workload = Arc::clone(&self.workload);
        let (done_tx, done_rx) = mpsc::sync_channel(1);

        let handle = thread::Builder::new()
            .name(format!("{}-supervisor", self.options.name))
            .spawn(move || {
                // held until Started is queued
                let _ = gate.recv();

                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    supervise(&core, workload, token, run_id)
                }))
                .unwrap_or_else(|payload| {
                    Err(LifecycleError::Workload {
                        workload: core.workload_name.clone(),
                        source: Arc::from(BoxError::from(format!(
                            "workload panicked: {}",
                            dispatch::panic_message(payload.as_ref())
                        ))),
                    })
                });

                core.metrics.set_running(false);
                core.running.store(false, Ordering::Release);
                core.metrics.increment_stops();
                if let Err(e) = outcome {
                    core.notify_error(e);
                }
                tracing::info!(instance = %core.name, run_id = %run_id, "instance stopped");
                core.emit(EventKind::Stopped, "instance stopped");
                let _ = done_tx.send(());
            })
            .map_err(|e| LifecycleError::Spawn {
                reason: e.to_string(),
            })?;

        Ok(Supervisor {
            done: done_rx,
            handle,
        })
    }

    /// Cancel the run and wait for the supervisor, at most `shutdown_timeout`.
    ///
    /// A no-op when not running. On timeout the supervisor keeps running and a
    /// later `stop` waits for it again.
    pub fn stop(&self) -> Result<(), LifecycleError> {
        let supervisor = {
            let mut state = self.lock();
            if !self.is_running() {
                if let Some(finished) = state.supervisor.take() {
                    let _ = finished.handle.join();
                }
                return Ok(());
            }
            if let Some(token) = state.token.take() {
                token.cancel();
            }
            state.supervisor.take()
        };

        let Some(supervisor) = supervisor else {
            return Ok(());
        };

        let timeout = self.options.shutdown_timeout;
        match supervisor.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = supervisor.handle.join();
                let mut state = self.lock();
                state.start_time = None;
                state.started_at = None;
            }
            Err(RecvTimeoutError::Timeout) => {
                self.lock().supervisor = Some(supervisor);
                tracing::warn!(instance = %self.options.name, ?timeout, "shutdown timed out");
                let error = LifecycleError::ShutdownTimeout { timeout };
                self.core.notify_error(error.clone());
                return Err(error);
            }
        }

        Ok(())
    }

    /// Stop, reload configuration when a loader is present, then start again
    pub fn restart(&self) -> Result<(), LifecycleError> {
        self.stop()?;

        if let Some(loader) = &self.loader {
            let config = match loader.load() {
                Ok(config) => Arc::new(config),
                Err(e) => {
                    let error = LifecycleError::config_load(e);
                    self.core.notify_error(error.clone());
                    return Err(error);
                }
            };
            {
                let mut state = self.lock();
                state.config = Some(config);
                state.config_source = loader.source();
            }
            self.core.metrics.increment_config_reloads();
            self.core
                .emit(EventKind::ConfigReloaded, "configuration reloaded for restart");
        }

        self.start()?;
        self.core.metrics.increment_restarts();
        tracing::info!(instance = %self.options.name, "instance restarted");
        Ok(())
    }

    /// Load new configuration and hand it to the running workload
    pub fn reload_config(&self) -> Result<(), LifecycleError> {
        if !self.is_running() {
            return Err(LifecycleError::NotRunning);
        }
        let loader = self.loader.as_ref().ok_or(LifecycleError::NoConfigLoader)?;

        let config = match loader.load() {
            Ok(config) => Arc::new(config),
            Err(e) => {
                let error = LifecycleError::config_load(e);
                self.core.notify_error(error.clone());
                return Err(error);
            }
        };

        {
            let mut state = self.lock();
            if !self.is_running() {
                return Err(LifecycleError::NotRunning);
            }
            state.config = Some(Arc::clone(&config));
            state.config_source = loader.source();
        }

        let workload = Arc::clone(&self.workload);
        let applied = dispatch::run_isolated(&self.core.logger, "apply_config", || {
            workload.apply_config(&config)
        });
        if !applied {
            self.core.notify_error(LifecycleError::Workload {
                workload: self.workload.name().to_string(),
                source: Arc::from(BoxError::from("apply_config panicked")),
            });
        }

        self.core.metrics.increment_config_reloads();
        tracing::info!(
            instance = %self.options.name,
            source = %loader.source(),
            "configuration reloaded"
        );
        self.core.emit(EventKind::ConfigReloaded, "configuration reloaded");
        Ok(())
    }

    pub fn status(&self) -> Status {
        let state = self.lock();
        let running = self.is_running();
        Status {
            running,
            start_time: state.start_time,
            uptime: match (running, state.started_at) {
                (true, Some(at)) => at.elapsed(),
                _ => Duration::ZERO,
            },
            update_count: self.core.update_count.load(Ordering::Relaxed),
            last_error: self.last_error(),
            config_source: state.config_source.clone(),
        }
    }

    pub fn last_error(&self) -> Option<LifecycleError> {
        self.core.last_error.load_full().map(|r| r.error.clone())
    }

    /// Forget the last error so health can return to `Ok`
    pub fn clear_last_error(&self) {
        self.core.last_error.store(None);
    }

    /// Health derived from the running flag, the workload and the last error
    pub fn health(&self) -> HealthCheck {
        let running = self.is_running();
        let start_time = self.lock().start_time;
        let now = Utc::now();
        let mut components = std::collections::BTreeMap::new();

        let instance = if running {
            ComponentHealth::new(HealthState::Ok, "running")
        } else {
            ComponentHealth::new(HealthState::Unhealthy, "not running")
        };
        components.insert(
            "instance".to_string(),
            instance.with_last_updated(start_time.unwrap_or(now)),
        );

        let workload_healthy = running && self.workload.is_healthy();
        let workload = match (running, workload_healthy) {
            (false, _) => ComponentHealth::new(HealthState::Unhealthy, "stopped"),
            (true, true) => ComponentHealth::new(HealthState::Ok, "healthy"),
            (true, false) => ComponentHealth::new(HealthState::Degraded, "reports unhealthy"),
        };
        components.insert("workload".to_string(), workload);

        let last_error = self.core.last_error.load_full();
        let errors = match &last_error {
            Some(record) => ComponentHealth::new(HealthState::Degraded, record.error.to_string())
                .with_last_updated(record.at),
            None => ComponentHealth::new(HealthState::Ok, "no errors"),
        };
        components.insert("errors".to_string(), errors);

        let status = if !running {
            HealthState::Unhealthy
        } else if last_error.is_some() || !workload_healthy {
            HealthState::Degraded
        } else {
            HealthState::Ok
        };

        HealthCheck {
            status,
            components,
            checked_at: now,
        }
    }
}

fn supervise<C>(
    core: &Arc<Core>,
    workload: Arc<dyn Workload<C>>,
    token: CancellationToken,
    run_id: CorrelationId,
) -> Result<(), LifecycleError>
where
    C: Send + Sync + 'static,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| LifecycleError::Runtime {
            reason: e.to_string(),
        })?;

    let ctx = RunContext {
        token: token.clone(),
        core: Arc::clone(core),
        correlation_id: run_id,
    };
    let workload_name = workload.name().to_string();

    runtime.block_on(
        run_id
            .scope_async(async move {
                tokio::select! {
                    result = workload.run(ctx) => result.map_err(|e| LifecycleError::Workload {
                        workload: workload_name,
                        source: Arc::from(e),
                    }),
                    _ = token.cancelled() => Ok(()),
                }
            })
            .instrument(run_id.span()),
    )
}

impl<C> Drop for LifecycleManager<C>
where
    C: Send + Sync + 'static,
{
    fn drop(&mut self) {
        if let Some(token) = self.lock().token.take() {
            token.cancel();
        }
    }
}

/// Builder for [`LifecycleManager`]
pub struct LifecycleBuilder<C>
where
    C: Send + Sync + 'static,
{
    options: LifecycleOptions,
    workload: Arc<dyn Workload<C>>,
    config: Option<(C, String)>,
    loader: Option<Arc<dyn ConfigLoader<C>>>,
    tracker: Option<Arc<ErrorTracker>>,
    metrics: Option<Arc<Metrics>>,
    logger: Option<Arc<dyn Logger>>,
    error_handler: Option<Box<dyn ErrorHandler>>,
    event_handler: Option<Box<dyn EventHandler>>,
}

impl<C> LifecycleBuilder<C>
where
    C: Send + Sync + 'static,
{
    pub fn new<W>(workload: W) -> Self
    where
        W: Workload<C>,
    {
        Self {
            options: LifecycleOptions::default(),
            workload: Arc::new(workload),
            config: None,
            loader: None,
            tracker: None,
            metrics: None,
            logger: None,
            error_handler: None,
            event_handler: None,
        }
    }

    pub fn options(mut self, options: LifecycleOptions) -> Self {
        self.options = options;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.options.name = name.into();
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.options.shutdown_timeout = timeout;
        self
    }

    /// Initial configuration and a label describing where it came from
    pub fn config(mut self, config: C, source: impl Into<String>) -> Self {
        self.config = Some((config, source.into()));
        self
    }

    pub fn config_loader<L>(mut self, loader: L) -> Self
    where
        L: ConfigLoader<C> + 'static,
    {
        self.loader = Some(Arc::new(loader));
        self
    }

    /// Share a tracker instead of creating one per instance
    pub fn error_tracker(mut self, tracker: Arc<ErrorTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Share a metrics collector instead of creating one per instance
    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn error_handler<H>(mut self, handler: H) -> Self
    where
        H: ErrorHandler + 'static,
    {
        self.error_handler = Some(Box::new(handler));
        self
    }

    pub fn event_handler<H>(mut self, handler: H) -> Self
    where
        H: EventHandler + 'static,
    {
        self.event_handler = Some(Box::new(handler));
        self
    }

    /// Fails with `MissingConfiguration` when neither a config nor a loader was given
    pub fn build(self) -> Result<LifecycleManager<C>, LifecycleError> {
        if self.config.is_none() && self.loader.is_none() {
            return Err(LifecycleError::MissingConfiguration);
        }

        let (config, config_source) = match self.config {
            Some((config, source)) => (Some(Arc::new(config)), source),
            None => (None, String::new()),
        };

        let core = Arc::new(Core {
            name: self.options.name.clone(),
            workload_name: self.workload.name().to_string(),
            running: AtomicBool::new(false),
            update_count: AtomicU64::new(0),
            last_error: ArcSwapOption::empty(),
            run_id: ArcSwapOption::empty(),
            error_handler: ArcSwapOption::new(self.error_handler.map(Arc::new)),
            event_handler: ArcSwapOption::new(self.event_handler.map(Arc::new)),
            tracker: self
                .tracker
                .unwrap_or_else(|| Arc::new(ErrorTracker::new())),
            metrics: self.metrics.unwrap_or_else(|| Arc::new(Metrics::new())),
            logger: self.logger.unwrap_or_else(default_logger),
        });

        Ok(LifecycleManager {
            core,
            options: self.options,
            workload: self.workload,
            loader: self.loader,
            state: Mutex::new(State {
                starting: false,
                config,
                config_source,
                token: None,
                supervisor: None,
                start_time: None,
                started_at: None,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct AppConfig {
        interval_ms: u64,
    }

    fn headless() -> LifecycleManager<AppConfig> {
        LifecycleManager::builder(Headless)
            .config(AppConfig { interval_ms: 100 }, "inline")
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_requires_config_or_loader() {
        let result = LifecycleBuilder::<AppConfig>::new(Headless).build();
        assert!(matches!(result, Err(LifecycleError::MissingConfiguration)));
    }

    #[test]
    fn test_start_stop_cycle() {
        let manager = headless();
        assert!(!manager.is_running());

        manager.start().unwrap();
        assert!(manager.is_running());
        assert_eq!(manager.status().config_source, "inline");

        manager.stop().unwrap();
        assert!(!manager.is_running());

        let snapshot = manager.metrics().snapshot();
        assert_eq!(snapshot.starts, 1);
        assert_eq!(snapshot.stops, 1);
        assert!(!snapshot.running);
    }

    #[test]
    fn test_tokens_are_fresh_per_start() {
        let manager = headless();
        manager.start().unwrap();
        let first = manager.lock().token.clone().unwrap();
        manager.stop().unwrap();
        assert!(first.is_cancelled());

        manager.start().unwrap();
        let second = manager.lock().token.clone().unwrap();
        assert!(!second.is_cancelled());
        manager.stop().unwrap();
    }

    #[test]
    fn test_health_follows_running_and_errors() {
        let manager = headless();
        assert_eq!(manager.health().status, HealthState::Unhealthy);

        manager.start().unwrap();
        let health = manager.health();
        assert_eq!(health.status, HealthState::Ok);
        assert_eq!(health.component("instance").unwrap().status, HealthState::Ok);

        manager.core.notify_error(LifecycleError::config_load("bad key".into()));
        let health = manager.health();
        assert_eq!(health.status, HealthState::Degraded);
        assert_eq!(health.component("errors").unwrap().status, HealthState::Degraded);
        assert_eq!(health.component("instance").unwrap().status, HealthState::Ok);

        manager.clear_last_error();
        assert!(manager.health().is_ok());
        manager.stop().unwrap();
    }

    #[test]
    fn test_notify_error_records_in_tracker() {
        let manager = headless();
        manager.start().unwrap();
        manager.core.notify_error(LifecycleError::config_load("parse failure".into()));

        let recent = manager.tracker().recent_errors(1);
        assert_eq!(recent[0].category, ErrorCategory::Config);
        assert!(recent[0].correlation_id().is_some());
        assert_eq!(manager.metrics().snapshot().errors_total, 1);
        manager.stop().unwrap();
    }
}
