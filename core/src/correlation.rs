//! Correlation identifiers threaded through a logical operation
//!
//! A [`CorrelationId`] ties together log lines, lifecycle events and
//! categorized errors produced by the same operation. The innermost scope
//! wins: a tokio task-local scope is consulted first, then the thread-local
//! scope entered with [`CorrelationId::enter`].

use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::str::FromStr;

use uuid::Uuid;

/// Context key under which categorized errors carry their correlation id
pub const CORRELATION_KEY: &str = "correlation_id";

thread_local! {
    static CURRENT: Cell<Option<CorrelationId>> = const { Cell::new(None) };
}

tokio::task_local! {
    static TASK_CURRENT: CorrelationId;
}

/// Opaque identifier for one logical operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generate a fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The id of the innermost enclosing scope, if any
    pub fn current() -> Option<Self> {
        TASK_CURRENT
            .try_with(|id| *id)
            .ok()
            .or_else(|| CURRENT.with(Cell::get))
    }

    /// The current id, or a fresh one when no scope is active
    pub fn current_or_new() -> Self {
        Self::current().unwrap_or_default()
    }

    /// Make this id current on this thread until the guard is dropped
    pub fn enter(self) -> CorrelationGuard {
        let previous = CURRENT.with(|c| c.replace(Some(self)));
        CorrelationGuard { previous }
    }

    /// Run `f` with this id current on this thread
    pub fn in_scope<R>(self, f: impl FnOnce() -> R) -> R {
        let _guard = self.enter();
        f()
    }

    /// Run `fut` with this id current for the task
    pub async fn scope_async<F: Future>(self, fut: F) -> F::Output {
        TASK_CURRENT.scope(self, fut).await
    }

    /// A tracing span carrying this id
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!("correlated", correlation_id = %self)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for CorrelationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for CorrelationId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

/// Restores the previously current id when dropped
#[derive(Debug)]
#[must_use = "the id is only current while the guard is alive"]
pub struct CorrelationGuard {
    previous: Option<CorrelationId>,
}

impl Drop for CorrelationGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| c.set(self.previous));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_scope_means_no_current_id() {
        std::thread::spawn(|| assert!(CorrelationId::current().is_none()))
            .join()
            .unwrap();
    }

    #[test]
    fn test_nested_scopes_restore_outer_id() {
        let outer = CorrelationId::new();
        let inner = CorrelationId::new();

        let _outer_guard = outer.enter();
        assert_eq!(CorrelationId::current(), Some(outer));

        inner.in_scope(|| {
            assert_eq!(CorrelationId::current(), Some(inner));
        });

        assert_eq!(CorrelationId::current(), Some(outer));
    }

    #[test]
    fn test_current_or_new_reuses_active_scope() {
        let id = CorrelationId::new();
        id.in_scope(|| assert_eq!(CorrelationId::current_or_new(), id));
    }

    #[test]
    fn test_display_round_trips_through_from_str() {
        let id = CorrelationId::new();
        let text = id.to_string();
        assert_eq!(text.len(), 32);
        assert_eq!(text.parse::<CorrelationId>().unwrap(), id);
    }

    #[test]
    fn test_task_scope_takes_precedence() {
        let thread_id = CorrelationId::new();
        let task_id = CorrelationId::new();
        let _guard = thread_id.enter();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let seen = runtime.block_on(task_id.scope_async(async { CorrelationId::current() }));

        assert_eq!(seen, Some(task_id));
        assert_eq!(CorrelationId::current(), Some(thread_id));
    }
}
