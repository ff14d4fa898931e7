//! Deferred results and execution contexts.
//!
//! - [`Deferred`]: single-assignment result cell with composable continuations
//! - [`Context`]: task queue on which a result's listeners are delivered
//! - [`Listener`]: success/failure continuation

mod composition;
pub mod context;
pub mod deferred;
pub mod listener;

pub use context::{Context, Executor, SerialExecutor, Task, TokioExecutor};
pub use deferred::Deferred;
pub use listener::{Listener, Outcome};
