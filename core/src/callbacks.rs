//! Callback system for circuit breaker state transitions

use std::sync::Arc;

use crate::circuit::CircuitState;
use crate::dispatch;
use crate::logger::Logger;

pub type StateChangeFn = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;
pub type TransitionFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Callbacks for circuit breaker events
///
/// Callbacks run on the dispatcher thread after the breaker lock has been
/// released; a panicking callback is logged and otherwise ignored.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_state_change: Option<StateChangeFn>,
    pub on_open: Option<TransitionFn>,
    pub on_close: Option<TransitionFn>,
    pub on_half_open: Option<TransitionFn>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn dispatch(
        &self,
        logger: &Arc<dyn Logger>,
        circuit: &str,
        from: CircuitState,
        to: CircuitState,
    ) {
        if let Some(callback) = &self.on_state_change {
            let callback = Arc::clone(callback);
            let circuit = circuit.to_string();
            dispatch::enqueue(logger, "state_change", move || {
                callback(&circuit, from, to)
            });
        }

        let specific = match to {
            CircuitState::Open => &self.on_open,
            CircuitState::Closed => &self.on_close,
            CircuitState::HalfOpen => &self.on_half_open,
        };
        if let Some(callback) = specific {
            let callback = Arc::clone(callback);
            let circuit = circuit.to_string();
            dispatch::enqueue(logger, "transition", move || callback(&circuit));
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_state_change", &self.on_state_change.is_some())
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_half_open", &self.on_half_open.is_some())
            .finish()
    }
}
