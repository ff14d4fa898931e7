use super::composition::{Composition, Forward, Mapping};
use super::context::{catch_panic, lock, Context};
use super::listener::{Listener, OnComplete, Outcome};
use crate::base::neterror::NetError;
use futures::future::BoxFuture;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

enum State<T> {
    Pending(Vec<Box<dyn Listener<T>>>),
    Done(Outcome<T>),
}

struct Shared<T> {
    context: Context,
    state: Mutex<State<T>>,
}

/// Single-assignment result cell with listener continuations.
///
/// The first of [`complete`](Self::complete), [`fail`](Self::fail) or
/// [`settle`](Self::settle) wins; later attempts return `false`. Listeners
/// run once each, in registration order, as tasks on the cell's
/// [`Context`]. Clones share the same cell.
pub struct Deferred<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Deferred<T> {
    pub fn new(context: &Context) -> Self {
        Self::with_state(context, State::Pending(Vec::new()))
    }

    pub fn succeeded(context: &Context, value: T) -> Self {
        Self::with_state(context, State::Done(Ok(value)))
    }

    pub fn failed(context: &Context, error: NetError) -> Self {
        Self::with_state(context, State::Done(Err(error)))
    }

    fn with_state(context: &Context, state: State<T>) -> Self {
        Self {
            shared: Arc::new(Shared {
                context: context.clone(),
                state: Mutex::new(state),
            }),
        }
    }

    /// Settle from an async computation running on the current tokio
    /// runtime.
    pub fn spawn<F>(context: &Context, future: F) -> Self
    where
        F: Future<Output = Outcome<T>> + Send + 'static,
    {
        let deferred = Self::new(context);
        let settle = deferred.clone();
        tokio::spawn(async move {
            settle.settle(future.await);
        });
        deferred
    }

    pub fn context(&self) -> &Context {
        &self.shared.context
    }

    pub fn complete(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    pub fn fail(&self, error: NetError) -> bool {
        self.settle(Err(error))
    }

    /// Transition to the terminal state. Returns `false` if already settled.
    pub fn settle(&self, outcome: Outcome<T>) -> bool {
        {
            let mut state = lock(&self.shared.state);
            let listeners = match &mut *state {
                State::Done(_) => {
                    tracing::trace!(context = self.shared.context.id(), "result already settled");
                    return false;
                }
                State::Pending(listeners) => std::mem::take(listeners),
            };
            *state = State::Done(outcome.clone());
            // Queued under the lock so a listener added right after
            // cannot be delivered ahead of these.
            if !listeners.is_empty() {
                self.shared
                    .context
                    .submit(Box::new(move || deliver_all(listeners, outcome)));
            }
        }
        self.shared.context.flush();
        true
    }

    pub fn is_complete(&self) -> bool {
        matches!(*lock(&self.shared.state), State::Done(_))
    }

    /// The terminal outcome, if settled.
    pub fn outcome(&self) -> Option<Outcome<T>> {
        match &*lock(&self.shared.state) {
            State::Done(outcome) => Some(outcome.clone()),
            State::Pending(_) => None,
        }
    }

    pub fn add_listener<L: Listener<T>>(&self, listener: L) {
        self.add_boxed(Box::new(listener));
    }

    fn add_boxed(&self, listener: Box<dyn Listener<T>>) {
        {
            let mut state = lock(&self.shared.state);
            match &mut *state {
                State::Pending(listeners) => {
                    listeners.push(listener);
                    return;
                }
                State::Done(outcome) => {
                    let outcome = outcome.clone();
                    self.shared
                        .context
                        .submit(Box::new(move || deliver(listener, outcome)));
                }
            }
        }
        self.shared.context.flush();
    }

    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        self.add_listener(OnComplete(f));
    }

    pub fn on_success<F>(&self, f: F)
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.on_complete(move |outcome| {
            if let Ok(value) = outcome {
                f(value)
            }
        });
    }

    pub fn on_failure<F>(&self, f: F)
    where
        F: FnOnce(NetError) + Send + 'static,
    {
        self.on_complete(move |outcome| {
            if let Err(error) = outcome {
                f(error)
            }
        });
    }

    /// Derive a result by transforming the success value.
    pub fn map<U, F>(&self, f: F) -> Deferred<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.transform(move |outcome| outcome.map(f))
    }

    /// Like [`map`](Self::map) for a fallible transform.
    pub fn try_map<U, F>(&self, f: F) -> Deferred<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Outcome<U> + Send + 'static,
    {
        self.transform(move |outcome| outcome.and_then(f))
    }

    /// Derive a result by transforming the failure. The mapper may recover
    /// with a value or replace the error.
    pub fn map_failure<F>(&self, f: F) -> Deferred<T>
    where
        F: FnOnce(NetError) -> Outcome<T> + Send + 'static,
    {
        self.transform(move |outcome| outcome.or_else(f))
    }

    fn transform<U, M>(&self, mapper: M) -> Deferred<U>
    where
        U: Clone + Send + 'static,
        M: FnOnce(Outcome<T>) -> Outcome<U> + Send + 'static,
    {
        let downstream = Deferred::new(&self.shared.context);
        self.add_listener(Mapping::new(mapper, downstream.clone()));
        downstream
    }

    /// Sequence an asynchronous step after this one. Each mapper returns the
    /// result of the next step; its outcome becomes the derived outcome.
    pub fn compose<U, S, F>(&self, success: S, failure: F) -> Deferred<U>
    where
        U: Clone + Send + 'static,
        S: FnOnce(T) -> Deferred<U> + Send + 'static,
        F: FnOnce(NetError) -> Deferred<U> + Send + 'static,
    {
        let downstream = Deferred::new(&self.shared.context);
        self.add_listener(Composition::new(success, failure, downstream.clone()));
        downstream
    }

    /// [`compose`](Self::compose) with failures passed through unchanged.
    pub fn flat_map<U, S>(&self, success: S) -> Deferred<U>
    where
        U: Clone + Send + 'static,
        S: FnOnce(T) -> Deferred<U> + Send + 'static,
    {
        let context = self.shared.context.clone();
        self.compose(success, move |e| Deferred::failed(&context, e))
    }

    /// Copy this result's outcome into `other` once settled.
    pub fn forward_to(&self, other: &Deferred<T>) {
        self.add_listener(Forward::new(other.clone()));
    }
}

fn deliver_all<T: Clone + 'static>(listeners: Vec<Box<dyn Listener<T>>>, outcome: Outcome<T>) {
    let mut listeners = listeners.into_iter().peekable();
    while let Some(listener) = listeners.next() {
        if listeners.peek().is_none() {
            deliver(listener, outcome);
            return;
        }
        deliver(listener, outcome.clone());
    }
}

fn deliver<T: 'static>(listener: Box<dyn Listener<T>>, outcome: Outcome<T>) {
    if let Err(e) = catch_panic(move || listener.on_outcome(outcome)) {
        tracing::error!(error = %e, "listener panicked");
    }
}

impl<T: Clone + Send + 'static> IntoFuture for Deferred<T> {
    type Output = Outcome<T>;
    type IntoFuture = BoxFuture<'static, Outcome<T>>;

    fn into_future(self) -> Self::IntoFuture {
        let (tx, rx) = oneshot::channel();
        self.on_complete(move |outcome| {
            let _ = tx.send(outcome);
        });
        Box::pin(async move { rx.await.unwrap_or(Err(NetError::ConnectionAborted)) })
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*lock(&self.shared.state) {
            State::Pending(listeners) => format!("Pending({} listeners)", listeners.len()),
            State::Done(Ok(_)) => "Succeeded".to_string(),
            State::Done(Err(e)) => format!("Failed({e})"),
        };
        f.debug_struct("Deferred")
            .field("context", &self.shared.context.id())
            .field("state", &state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_complete_once() {
        let ctx = Context::serial();
        let d = Deferred::new(&ctx);
        assert!(d.complete(1));
        assert!(!d.complete(2));
        assert!(!d.fail(NetError::ConnectionFailed));
        assert!(matches!(d.outcome(), Some(Ok(1))));
    }

    #[test]
    fn test_listeners_in_registration_order() {
        let ctx = Context::serial();
        let d = Deferred::<u32>::new(&ctx);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            d.on_success(move |_| order.lock().unwrap().push(i));
        }
        d.complete(7);
        let late = order.clone();
        d.on_success(move |_| late.lock().unwrap().push(5));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let ctx = Context::serial();
        let d = Deferred::<u32>::new(&ctx);
        let hits = Arc::new(AtomicUsize::new(0));
        d.on_success(|_| panic!("listener"));
        let h = hits.clone();
        d.on_success(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        d.complete(1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_debug_shows_state() {
        let ctx = Context::serial();
        let d = Deferred::<u32>::failed(&ctx, NetError::PoolClosed);
        assert!(format!("{d:?}").contains("Failed"));
    }
}
