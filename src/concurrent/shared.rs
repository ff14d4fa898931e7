//! Atomically published [`CyclicSequence`].

use super::cyclic::CyclicSequence;
use arc_swap::ArcSwap;
use std::fmt;
use std::sync::Arc;

/// The current sequence of a pool or broker.
///
/// Readers load the published instance without locking and advance its
/// cursor in place. [`add`](Self::add) and [`remove`](Self::remove) build
/// the successor from the instance they loaded and swap it in; if another
/// writer published first, the successor is rebuilt from the newer one.
pub struct SharedSequence<T> {
    current: ArcSwap<CyclicSequence<T>>,
}

impl<T> SharedSequence<T> {
    pub fn new(sequence: CyclicSequence<T>) -> Self {
        Self {
            current: ArcSwap::from_pointee(sequence),
        }
    }

    /// The published instance. Later swaps do not affect it.
    pub fn load(&self) -> Arc<CyclicSequence<T>> {
        self.current.load_full()
    }

    /// Replace the published instance outright.
    pub fn store(&self, sequence: CyclicSequence<T>) {
        self.current.store(Arc::new(sequence));
    }

    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.load().is_empty()
    }
}

impl<T: Clone> SharedSequence<T> {
    /// Advance the published instance and return the element now under
    /// its cursor.
    pub fn next(&self) -> Option<T> {
        self.current.load().next().cloned()
    }

    /// Publish a successor with `element` appended.
    pub fn add(&self, element: T) {
        self.current.rcu(|current| current.add(element.clone()));
    }
}

impl<T: Clone + PartialEq> SharedSequence<T> {
    /// Publish a successor without the first element equal to `element`.
    /// Returns whether an element was removed.
    pub fn remove(&self, element: &T) -> bool {
        let mut removed = false;
        self.current.rcu(|current| {
            let next = current.remove(element);
            removed = next.len() < current.len();
            next
        });
        removed
    }
}

impl<T> Default for SharedSequence<T> {
    fn default() -> Self {
        Self::new(CyclicSequence::new())
    }
}

impl<T> From<CyclicSequence<T>> for SharedSequence<T> {
    fn from(sequence: CyclicSequence<T>) -> Self {
        Self::new(sequence)
    }
}

impl<T: fmt::Debug> fmt::Debug for SharedSequence<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SharedSequence")
            .field(&*self.current.load())
            .finish()
    }
}
