//! Lock-free permit counter used for concurrency limiting
//!
//! The circuit breaker uses one semaphore to cap concurrent half-open probes
//! and, when `max_concurrency` is configured, a second one as a bulkhead in
//! front of every call.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Non-blocking counting semaphore
#[derive(Debug)]
pub struct BulkheadSemaphore {
    limit: usize,
    acquired: AtomicUsize,
}

impl BulkheadSemaphore {
    /// Create a semaphore with `limit` permits; a limit of 0 is raised to 1
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            acquired: AtomicUsize::new(0),
        }
    }

    /// Take a permit if one is free. The permit is returned when the guard drops.
    pub fn try_acquire(self: &Arc<Self>) -> Option<BulkheadGuard> {
        self.acquired
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.limit).then_some(current + 1)
            })
            .ok()
            .map(|_| BulkheadGuard {
                semaphore: Arc::clone(self),
            })
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn available(&self) -> usize {
        self.limit.saturating_sub(self.acquired())
    }

    fn release(&self) {
        self.acquired.fetch_sub(1, Ordering::Release);
    }
}

/// Releases its permit on drop, including during unwinding
#[derive(Debug)]
#[must_use = "the permit is released as soon as the guard is dropped"]
pub struct BulkheadGuard {
    semaphore: Arc<BulkheadSemaphore>,
}

impl Drop for BulkheadGuard {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn test_acquire_and_release() {
        let semaphore = Arc::new(BulkheadSemaphore::new(2));

        let first = semaphore.try_acquire();
        let second = semaphore.try_acquire();
        assert!(first.is_some() && second.is_some());
        assert_eq!(semaphore.available(), 0);
        assert!(semaphore.try_acquire().is_none());

        drop(first);
        assert_eq!(semaphore.acquired(), 1);
        assert!(semaphore.try_acquire().is_some());
    }

    #[test]
    fn test_zero_limit_is_raised_to_one() {
        let semaphore = Arc::new(BulkheadSemaphore::new(0));
        assert_eq!(semaphore.limit(), 1);
        let _permit = semaphore.try_acquire().unwrap();
        assert!(semaphore.try_acquire().is_none());
    }

    #[test]
    fn test_concurrent_acquire_never_exceeds_limit() {
        let semaphore = Arc::new(BulkheadSemaphore::new(3));
        let barrier = Arc::new(Barrier::new(12));

        let handles: Vec<_> = (0..12)
            .map(|_| {
                let semaphore = Arc::clone(&semaphore);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let permit = semaphore.try_acquire();
                    let held = permit.is_some();
                    assert!(semaphore.acquired() <= 3);
                    barrier.wait();
                    held
                })
            })
            .collect();

        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|held| *held)
            .count();

        assert_eq!(granted, 3);
        assert_eq!(semaphore.acquired(), 0);
    }

    #[test]
    fn test_guard_releases_on_panic() {
        let semaphore = Arc::new(BulkheadSemaphore::new(1));
        let inner = Arc::clone(&semaphore);

        let result = std::panic::catch_unwind(move || {
            let _permit = inner.try_acquire().unwrap();
            panic!("probe blew up");
        });

        assert!(result.is_err());
        assert_eq!(semaphore.acquired(), 0);
    }
}
