//! Execution contexts.
//!
//! A [`Context`] owns a task queue. Every listener delivery of a
//! [`Deferred`](super::Deferred) is posted to the queue of the result's
//! context instead of being called in place, so chains of any length settle
//! with constant stack depth.

use crate::base::neterror::NetError;
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks submitted by a [`Context`].
///
/// `submit` may be called while the caller holds a lock, so it must only
/// enqueue. `flush` is called after the lock is released and may run tasks.
pub trait Executor: Send + Sync + 'static {
    fn submit(&self, task: Task);

    fn flush(&self) {}
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to an execution context. Cheap to clone.
#[derive(Clone)]
pub struct Context {
    id: u64,
    executor: Arc<dyn Executor>,
}

impl Context {
    pub fn with_executor(executor: Arc<dyn Executor>) -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            executor,
        }
    }

    /// A context backed by a fresh [`SerialExecutor`].
    pub fn serial() -> Self {
        Self::with_executor(Arc::new(SerialExecutor::new()))
    }

    /// A context whose tasks run on a dedicated task of the current tokio
    /// runtime.
    ///
    /// # Panics
    /// Panics when called outside a tokio runtime.
    pub fn event_loop() -> Self {
        Self::on_runtime(&Handle::current())
    }

    /// A context whose tasks run on a dedicated task spawned on `handle`.
    pub fn on_runtime(handle: &Handle) -> Self {
        Self::with_executor(Arc::new(TokioExecutor::spawn(handle)))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Post `f` to this context and run the queue if nobody else is.
    pub fn dispatch<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.executor.submit(Box::new(f));
        self.executor.flush();
    }

    pub(crate) fn submit(&self, task: Task) {
        self.executor.submit(task);
    }

    pub(crate) fn flush(&self) {
        self.executor.flush();
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::serial()
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Context {}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context").field("id", &self.id).finish()
    }
}

/// Trampolined run queue.
///
/// The first thread that flushes an idle executor drains the queue; tasks
/// submitted meanwhile (from that thread or any other) are appended and run
/// by the draining thread in submission order. At most one task runs at a
/// time.
pub struct SerialExecutor {
    queue: Mutex<VecDeque<Task>>,
    running: AtomicBool,
}

impl SerialExecutor {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(false),
        }
    }

    fn pop(&self) -> Option<Task> {
        lock(&self.queue).pop_front()
    }

    pub fn pending(&self) -> usize {
        lock(&self.queue).len()
    }
}

impl Default for SerialExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for SerialExecutor {
    fn submit(&self, task: Task) {
        lock(&self.queue).push_back(task);
    }

    fn flush(&self) {
        loop {
            if self
                .running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }
            while let Some(task) = self.pop() {
                run_task(task);
            }
            self.running.store(false, Ordering::SeqCst);
            // A submitter may have lost the race against the store above.
            if lock(&self.queue).is_empty() {
                return;
            }
        }
    }
}

/// Event-loop executor: a tokio task draining an unbounded channel.
pub struct TokioExecutor {
    tx: mpsc::UnboundedSender<Task>,
}

impl TokioExecutor {
    pub fn spawn(handle: &Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        handle.spawn(async move {
            while let Some(task) = rx.recv().await {
                run_task(task);
            }
        });
        Self { tx }
    }
}

impl Executor for TokioExecutor {
    fn submit(&self, task: Task) {
        if self.tx.send(task).is_err() {
            tracing::warn!("event loop stopped, dropping task");
        }
    }
}

fn run_task(task: Task) {
    if let Err(e) = catch_panic(task) {
        tracing::error!(error = %e, "task panicked");
    }
}

/// Run `f`, turning a panic into [`NetError::CallbackPanicked`].
pub(crate) fn catch_panic<R>(f: impl FnOnce() -> R) -> Result<R, NetError> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| NetError::CallbackPanicked {
        message: panic_message(payload.as_ref()),
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Lock a std mutex, ignoring poisoning. Callbacks never run under these
/// locks, so a poisoned guard still protects consistent data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
