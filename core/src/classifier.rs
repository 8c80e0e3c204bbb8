//! Failure classification
//!
//! A classifier decides whether an error returned by a protected call counts
//! toward opening the circuit. Errors it rejects are still returned to the
//! caller but leave the breaker counters untouched.

use std::any::Any;
use std::marker::PhantomData;
use std::time::Duration;

use crate::circuit::CircuitState;

/// What a classifier gets to look at
#[derive(Debug)]
pub struct FailureContext<'a> {
    pub circuit_name: &'a str,
    /// The returned error; downcast to inspect concrete types
    pub error: &'a dyn Any,
    pub duration: Duration,
    /// State the call was admitted in
    pub state: CircuitState,
}

/// Decides whether a failure should trip the circuit
///
/// ```rust
/// use sysmon_core::{FailureClassifier, FailureContext};
///
/// #[derive(Debug)]
/// struct SlowOnly;
///
/// impl FailureClassifier for SlowOnly {
///     fn should_trip(&self, ctx: &FailureContext<'_>) -> bool {
///         ctx.duration.as_millis() > 500
///     }
/// }
/// ```
pub trait FailureClassifier: Send + Sync + std::fmt::Debug {
    fn should_trip(&self, ctx: &FailureContext<'_>) -> bool;
}

/// Counts every error
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl FailureClassifier for DefaultClassifier {
    fn should_trip(&self, _ctx: &FailureContext<'_>) -> bool {
        true
    }
}

/// Classifier backed by a closure
pub struct PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    predicate: F,
}

impl<F> PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> FailureClassifier for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn should_trip(&self, ctx: &FailureContext<'_>) -> bool {
        (self.predicate)(ctx)
    }
}

/// Counts every error except those of concrete type `T`
pub struct IgnoreType<T>(PhantomData<fn() -> T>);

impl<T: Any> IgnoreType<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T: Any> Default for IgnoreType<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Any> FailureClassifier for IgnoreType<T> {
    fn should_trip(&self, ctx: &FailureContext<'_>) -> bool {
        !ctx.error.is::<T>()
    }
}

impl<T> std::fmt::Debug for IgnoreType<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("IgnoreType")
            .field(&std::any::type_name::<T>())
            .finish()
    }
}

impl<F> std::fmt::Debug for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateClassifier")
            .field("predicate", &"<closure>")
            .finish()
    }
}
