//! Copy-on-write round-robin sequence.
//!
//! A [`CyclicSequence`] is an immutable list of elements plus an atomic
//! cursor. Structural changes ([`add`](CyclicSequence::add),
//! [`remove`](CyclicSequence::remove)) return a new sequence and never
//! touch the receiver, so readers and iterators need no locking. The cursor
//! is the only mutable state and is advanced with a single atomic
//! read-modify-write, wrapping modulo the length seen by the advancing
//! instance.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Returned by [`Iter::try_next`] once every element has been yielded.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("cyclic sequence iterator exhausted")]
pub struct Exhausted;

pub struct CyclicSequence<T> {
    elements: Arc<[T]>,
    cursor: AtomicUsize,
}

impl<T> CyclicSequence<T> {
    pub fn new() -> Self {
        Self::from_parts(Arc::from(Vec::new()), 0)
    }

    fn from_parts(elements: Arc<[T]>, position: usize) -> Self {
        let position = if elements.is_empty() {
            0
        } else {
            position % elements.len()
        };
        Self {
            elements,
            cursor: AtomicUsize::new(position),
        }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Current cursor position, always `< max(1, len)`.
    pub fn index(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    /// Element under the cursor, without advancing.
    pub fn first(&self) -> Option<&T> {
        self.elements.get(self.index())
    }

    /// Advance the cursor by one (wrapping) and return the element now
    /// under it. `None` on an empty sequence, where the cursor stays at 0.
    pub fn next(&self) -> Option<&T> {
        let len = self.elements.len();
        if len == 0 {
            return None;
        }
        let previous = self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| Some((p + 1) % len))
            .unwrap_or_else(|p| p);
        self.elements.get((previous + 1) % len)
    }

    /// Elements in insertion order.
    pub fn as_slice(&self) -> &[T] {
        &self.elements
    }

    /// Snapshot iterator over every element exactly once, starting at index
    /// 0 or at the current cursor and wrapping around.
    pub fn iter_from(&self, from_current: bool) -> Iter<T> {
        let start = if from_current { self.index() } else { 0 };
        Iter {
            elements: self.elements.clone(),
            start,
            yielded: 0,
        }
    }
}

impl<T: Clone> CyclicSequence<T> {
    /// New sequence with `element` appended. The cursor position carries
    /// over.
    pub fn add(&self, element: T) -> Self {
        let mut elements = Vec::with_capacity(self.elements.len() + 1);
        elements.extend_from_slice(&self.elements);
        elements.push(element);
        Self::from_parts(elements.into(), self.index())
    }
}

impl<T: Clone + PartialEq> CyclicSequence<T> {
    /// New sequence with the first element equal to `element` removed.
    /// Storage is shared with `self` when nothing matches.
    pub fn remove(&self, element: &T) -> Self {
        match self.elements.iter().position(|e| e == element) {
            Some(at) => {
                let mut elements = Vec::with_capacity(self.elements.len() - 1);
                elements.extend_from_slice(&self.elements[..at]);
                elements.extend_from_slice(&self.elements[at + 1..]);
                Self::from_parts(elements.into(), self.index())
            }
            None => Self::from_parts(self.elements.clone(), self.index()),
        }
    }
}

impl<T> Default for CyclicSequence<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for CyclicSequence<T> {
    /// Shares the elements; the clone gets its own cursor at the same
    /// position.
    fn clone(&self) -> Self {
        Self::from_parts(self.elements.clone(), self.index())
    }
}

impl<T> From<Vec<T>> for CyclicSequence<T> {
    fn from(elements: Vec<T>) -> Self {
        Self::from_parts(elements.into(), 0)
    }
}

impl<T> FromIterator<T> for CyclicSequence<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        iter.into_iter().collect::<Vec<_>>().into()
    }
}

impl<T: Clone> IntoIterator for &CyclicSequence<T> {
    type Item = T;
    type IntoIter = Iter<T>;

    fn into_iter(self) -> Iter<T> {
        self.iter_from(false)
    }
}

impl<T: fmt::Debug> fmt::Debug for CyclicSequence<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CyclicSequence")
            .field("elements", &&*self.elements)
            .field("index", &self.index())
            .finish()
    }
}

/// Finite snapshot iterator produced by [`CyclicSequence::iter_from`].
pub struct Iter<T> {
    elements: Arc<[T]>,
    start: usize,
    yielded: usize,
}

impl<T: Clone> Iter<T> {
    /// Like [`Iterator::next`], but reports exhaustion as an error so it
    /// cannot be confused with an empty sequence.
    pub fn try_next(&mut self) -> Result<T, Exhausted> {
        let len = self.elements.len();
        if self.yielded >= len {
            return Err(Exhausted);
        }
        let element = self.elements[(self.start + self.yielded) % len].clone();
        self.yielded += 1;
        Ok(element)
    }

    pub fn has_next(&self) -> bool {
        self.yielded < self.elements.len()
    }
}

impl<T: Clone> Iterator for Iter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.try_next().ok()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.elements.len() - self.yielded;
        (remaining, Some(remaining))
    }
}

impl<T: Clone> ExactSizeIterator for Iter<T> {}
