use crate::base::neterror::NetError;

/// Outcome carried by a settled [`Deferred`](super::Deferred).
pub type Outcome<T> = Result<T, NetError>;

/// Continuation registered on a [`Deferred`](super::Deferred).
///
/// Exactly one of the two methods is called, once, on the result's context.
pub trait Listener<T>: Send + 'static {
    fn on_success(self: Box<Self>, value: T);

    fn on_failure(self: Box<Self>, error: NetError);

    fn on_outcome(self: Box<Self>, outcome: Outcome<T>) {
        match outcome {
            Ok(value) => self.on_success(value),
            Err(error) => self.on_failure(error),
        }
    }
}

/// Adapts a closure taking the whole outcome.
pub(crate) struct OnComplete<F>(pub(crate) F);

impl<T, F> Listener<T> for OnComplete<F>
where
    F: FnOnce(Outcome<T>) + Send + 'static,
{
    fn on_success(self: Box<Self>, value: T) {
        (self.0)(Ok(value))
    }

    fn on_failure(self: Box<Self>, error: NetError) {
        (self.0)(Err(error))
    }
}
