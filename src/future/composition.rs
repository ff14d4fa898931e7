//! Listeners that derive one deferred result from another.
//!
//! A [`Composition`] runs a mapper that returns a new [`Deferred`] and
//! subscribes a [`Forward`] listener to it. Nothing keeps the composition
//! alive once the mapper has run: the forwarding listener is owned by the
//! intermediate result and dropped after it settles.

use super::context::catch_panic;
use super::deferred::Deferred;
use super::listener::{Listener, Outcome};
use crate::base::neterror::NetError;

pub(crate) struct Composition<U, S, F> {
    success: S,
    failure: F,
    downstream: Deferred<U>,
}

impl<U, S, F> Composition<U, S, F> {
    pub(crate) fn new(success: S, failure: F, downstream: Deferred<U>) -> Self {
        Self {
            success,
            failure,
            downstream,
        }
    }
}

impl<T, U, S, F> Listener<T> for Composition<U, S, F>
where
    T: Send + 'static,
    U: Clone + Send + 'static,
    S: FnOnce(T) -> Deferred<U> + Send + 'static,
    F: FnOnce(NetError) -> Deferred<U> + Send + 'static,
{
    fn on_success(self: Box<Self>, value: T) {
        let Composition {
            success,
            downstream,
            ..
        } = *self;
        chain(catch_panic(move || success(value)), downstream);
    }

    fn on_failure(self: Box<Self>, error: NetError) {
        let Composition {
            failure,
            downstream,
            ..
        } = *self;
        chain(catch_panic(move || failure(error)), downstream);
    }
}

fn chain<U: Clone + Send + 'static>(next: Result<Deferred<U>, NetError>, downstream: Deferred<U>) {
    match next {
        Ok(next) => next.add_listener(Forward { downstream }),
        Err(e) => {
            tracing::debug!(error = %e, "composition mapper panicked");
            downstream.fail(e);
        }
    }
}

/// Copies an outcome into another result.
pub(crate) struct Forward<U> {
    downstream: Deferred<U>,
}

impl<U> Forward<U> {
    pub(crate) fn new(downstream: Deferred<U>) -> Self {
        Self { downstream }
    }
}

impl<U: Clone + Send + 'static> Listener<U> for Forward<U> {
    fn on_success(self: Box<Self>, value: U) {
        self.downstream.complete(value);
    }

    fn on_failure(self: Box<Self>, error: NetError) {
        self.downstream.fail(error);
    }
}

/// Synchronous transform of the whole outcome.
pub(crate) struct Mapping<U, M> {
    mapper: M,
    downstream: Deferred<U>,
}

impl<U, M> Mapping<U, M> {
    pub(crate) fn new(mapper: M, downstream: Deferred<U>) -> Self {
        Self { mapper, downstream }
    }
}

impl<T, U, M> Listener<T> for Mapping<U, M>
where
    T: Send + 'static,
    U: Clone + Send + 'static,
    M: FnOnce(Outcome<T>) -> Outcome<U> + Send + 'static,
{
    fn on_success(self: Box<Self>, value: T) {
        self.on_outcome(Ok(value))
    }

    fn on_failure(self: Box<Self>, error: NetError) {
        self.on_outcome(Err(error))
    }

    fn on_outcome(self: Box<Self>, outcome: Outcome<T>) {
        let Mapping { mapper, downstream } = *self;
        let mapped = catch_panic(move || mapper(outcome)).and_then(|r| r);
        downstream.settle(mapped);
    }
}
