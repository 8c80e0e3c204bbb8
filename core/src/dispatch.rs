//! Panic-isolated dispatch of user callbacks
//!
//! User-supplied callbacks are queued to one long-lived dispatcher thread and
//! run there inside `catch_unwind`, outside any core lock. Callbacks queued by
//! one thread run in the order they were queued. A panicking callback is
//! reported to the [`Logger`] and never reaches the caller that triggered it.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, mpsc};
use std::thread;

use crate::logger::Logger;

type Job = Box<dyn FnOnce() + Send + 'static>;

static CALLBACK_PANICS: AtomicU64 = AtomicU64::new(0);

static DISPATCHER: OnceLock<Option<mpsc::Sender<Job>>> = OnceLock::new();

/// Number of callback panics recovered since process start
pub fn callback_panics() -> u64 {
    CALLBACK_PANICS.load(Ordering::Relaxed)
}

fn dispatcher() -> Option<&'static mpsc::Sender<Job>> {
    DISPATCHER
        .get_or_init(|| {
            let (queue, jobs) = mpsc::channel::<Job>();
            let spawned = thread::Builder::new()
                .name("sysmon-dispatch".to_string())
                .spawn(move || {
                    for job in jobs {
                        job();
                    }
                });
            match spawned {
                Ok(_) => Some(queue),
                Err(e) => {
                    tracing::error!(error = %e, "failed to spawn callback dispatcher");
                    None
                }
            }
        })
        .as_ref()
}

/// Queue `f` for the dispatcher thread, recovering any panic.
///
/// `label` appears in the log line if `f` panics. Without a dispatcher thread
/// `f` runs inline, so callers must not hold a core lock.
pub(crate) fn enqueue<F>(logger: &Arc<dyn Logger>, label: &'static str, f: F)
where
    F: FnOnce() + Send + 'static,
{
    let job_logger = Arc::clone(logger);
    let job: Job = Box::new(move || {
        run_isolated(&job_logger, label, f);
    });

    let unsent = match dispatcher() {
        Some(queue) => queue.send(job).err().map(|returned| returned.0),
        None => Some(job),
    };
    if let Some(job) = unsent {
        logger.warn(&format!("callback dispatcher unavailable, running {label} inline"));
        job();
    }
}

/// Run `f` on the current thread, recovering any panic. Returns false if `f` panicked.
pub(crate) fn run_isolated<F>(logger: &Arc<dyn Logger>, label: &str, f: F) -> bool
where
    F: FnOnce(),
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            CALLBACK_PANICS.fetch_add(1, Ordering::Relaxed);
            logger.error(&format!(
                "{label} callback panicked: {}",
                panic_message(payload.as_ref())
            ));
            false
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingLogger {
        errors: Mutex<Vec<String>>,
    }

    impl Logger for RecordingLogger {
        fn debug(&self, _message: &str) {}
        fn info(&self, _message: &str) {}
        fn warn(&self, _message: &str) {}
        fn error(&self, message: &str) {
            self.errors.lock().unwrap().push(message.to_string());
        }
    }

    #[test]
    fn test_run_isolated_recovers_panic() {
        let recorder = Arc::new(RecordingLogger::default());
        let logger: Arc<dyn Logger> = recorder.clone();

        let completed = run_isolated(&logger, "alert", || panic!("handler exploded"));

        assert!(!completed);
        let errors = recorder.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("alert callback panicked: handler exploded"));
    }

    #[test]
    fn test_run_isolated_passes_through_normal_callbacks() {
        let logger: Arc<dyn Logger> = Arc::new(RecordingLogger::default());
        let mut ran = false;
        assert!(run_isolated(&logger, "event", || ran = true));
        assert!(ran);
    }

    #[test]
    fn test_enqueue_runs_off_thread_in_order() {
        let logger: Arc<dyn Logger> = Arc::new(RecordingLogger::default());
        let caller = thread::current().id();
        let (tx, rx) = mpsc::channel();

        for n in 0..20 {
            let tx = tx.clone();
            enqueue(&logger, "event", move || {
                tx.send((n, thread::current().id())).unwrap();
            });
        }

        let received: Vec<_> = (0..20)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert!(received.iter().all(|(_, id)| *id != caller));
        let order: Vec<_> = received.iter().map(|(n, _)| *n).collect();
        assert_eq!(order, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_dispatcher_survives_panicking_callback() {
        let recorder = Arc::new(RecordingLogger::default());
        let logger: Arc<dyn Logger> = recorder.clone();
        let (tx, rx) = mpsc::channel();

        enqueue(&logger, "alert", || panic!("alert handler bug"));
        enqueue(&logger, "alert", move || tx.send("delivered").unwrap());

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "delivered");
        let errors = recorder.errors.lock().unwrap();
        assert!(errors.iter().any(|e| e.contains("alert handler bug")));
    }

    #[test]
    fn test_formatted_panic_payload_is_reported() {
        let recorder = Arc::new(RecordingLogger::default());
        let logger: Arc<dyn Logger> = recorder.clone();
        let before = callback_panics();

        run_isolated(&logger, "state_change", || panic!("code {}", 7));

        assert!(callback_panics() > before);
        assert!(recorder.errors.lock().unwrap()[0].contains("code 7"));
    }
}
