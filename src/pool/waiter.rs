//! Waiters and the FIFO wait queue.
//!
//! The queue is an arena of slots linked through `prev`/`next` indices.
//! Handles carry a generation so a stale [`WaiterId`] never unlinks a slot
//! that has since been reused.

use crate::future::Context;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Observability hooks for queued acquisitions. Both default to no-ops.
pub trait WaiterListener: Send + Sync + 'static {
    /// The waiter was parked without starting a connection for it.
    fn on_enqueue(&self, _waiter: &Waiter) {}

    /// A connection attempt was started on behalf of the waiter.
    fn on_connect(&self, _waiter: &Waiter) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl WaiterListener for NoopListener {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaiterId {
    index: u32,
    generation: u32,
}

#[derive(Default)]
struct WaiterFlags {
    queued: AtomicBool,
    disposed: AtomicBool,
}

/// Caller-side identity of a pending acquisition.
///
/// Holding a `Waiter` does not keep it queued; it is only used to cancel
/// and to inspect state.
#[derive(Clone)]
pub struct Waiter {
    pool_id: u64,
    id: Option<WaiterId>,
    context: Context,
    capacity: u32,
    flags: Arc<WaiterFlags>,
}

impl Waiter {
    pub(crate) fn new(pool_id: u64, context: Context, capacity: u32) -> Self {
        Self {
            pool_id,
            id: None,
            context,
            capacity,
            flags: Arc::new(WaiterFlags::default()),
        }
    }

    pub fn id(&self) -> Option<WaiterId> {
        self.id
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Requested weight.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Still linked in the wait queue.
    pub fn is_queued(&self) -> bool {
        self.flags.queued.load(Ordering::Acquire)
    }

    /// Cancelled, granted or failed. A disposed waiter never receives
    /// another completion.
    pub fn is_disposed(&self) -> bool {
        self.flags.disposed.load(Ordering::Acquire)
    }

    pub(crate) fn pool_id(&self) -> u64 {
        self.pool_id
    }

    pub(crate) fn set_id(&mut self, id: WaiterId) {
        self.id = Some(id);
        self.flags.queued.store(true, Ordering::Release);
    }

    pub(crate) fn dispose(&self) {
        self.flags.queued.store(false, Ordering::Release);
        self.flags.disposed.store(true, Ordering::Release);
    }
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("queued", &self.is_queued())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

struct Node<H> {
    value: H,
    prev: Option<u32>,
    next: Option<u32>,
}

struct Entry<H> {
    generation: u32,
    node: Option<Node<H>>,
}

/// Doubly-linked FIFO over an index arena. O(1) push, pop and unlink.
pub struct WaitQueue<H> {
    entries: Vec<Entry<H>>,
    free: Vec<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

impl<H> WaitQueue<H> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push_back(&mut self, value: H) -> WaiterId {
        let node = Node {
            value,
            prev: self.tail,
            next: None,
        };
        let index = match self.free.pop() {
            Some(index) => {
                let entry = &mut self.entries[index as usize];
                assert!(entry.node.is_none(), "wait queue free list points at a live slot");
                entry.node = Some(node);
                index
            }
            None => {
                let index = u32::try_from(self.entries.len()).expect("wait queue index overflow");
                self.entries.push(Entry {
                    generation: 0,
                    node: Some(node),
                });
                index
            }
        };
        match self.tail {
            Some(tail) => self.node_mut(tail).next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;
        WaiterId {
            index,
            generation: self.entries[index as usize].generation,
        }
    }

    fn node_mut(&mut self, index: u32) -> &mut Node<H> {
        self.entries[index as usize]
            .node
            .as_mut()
            .expect("wait queue link points at a vacant slot")
    }

    fn live(&self, id: WaiterId) -> bool {
        self.entries
            .get(id.index as usize)
            .is_some_and(|e| e.generation == id.generation && e.node.is_some())
    }

    pub fn contains(&self, id: WaiterId) -> bool {
        self.live(id)
    }

    pub fn get(&self, id: WaiterId) -> Option<&H> {
        if !self.live(id) {
            return None;
        }
        self.entries[id.index as usize].node.as_ref().map(|n| &n.value)
    }

    pub fn get_mut(&mut self, id: WaiterId) -> Option<&mut H> {
        if !self.live(id) {
            return None;
        }
        self.entries[id.index as usize].node.as_mut().map(|n| &mut n.value)
    }

    /// Unlink `id`. Returns `None` for stale or unknown ids.
    pub fn remove(&mut self, id: WaiterId) -> Option<H> {
        if !self.live(id) {
            return None;
        }
        let entry = &mut self.entries[id.index as usize];
        let node = entry.node.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(id.index);

        match node.prev {
            Some(prev) => {
                let prev = self.node_mut(prev);
                assert_eq!(prev.next, Some(id.index), "wait queue links corrupted");
                prev.next = node.next;
            }
            None => {
                assert_eq!(self.head, Some(id.index), "wait queue head corrupted");
                self.head = node.next;
            }
        }
        match node.next {
            Some(next) => {
                let next = self.node_mut(next);
                assert_eq!(next.prev, Some(id.index), "wait queue links corrupted");
                next.prev = node.prev;
            }
            None => {
                assert_eq!(self.tail, Some(id.index), "wait queue tail corrupted");
                self.tail = node.prev;
            }
        }
        self.len -= 1;
        Some(node.value)
    }

    pub fn front(&self) -> Option<(WaiterId, &H)> {
        let index = self.head?;
        let entry = &self.entries[index as usize];
        let node = entry.node.as_ref()?;
        Some((
            WaiterId {
                index,
                generation: entry.generation,
            },
            &node.value,
        ))
    }

    pub fn pop_front(&mut self) -> Option<H> {
        let (id, _) = self.front()?;
        self.remove(id)
    }

    /// Iterate from head to tail.
    pub fn iter(&self) -> QueueIter<'_, H> {
        QueueIter {
            queue: self,
            cursor: self.head,
        }
    }
}

impl<H> Default for WaitQueue<H> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct QueueIter<'a, H> {
    queue: &'a WaitQueue<H>,
    cursor: Option<u32>,
}

impl<'a, H> Iterator for QueueIter<'a, H> {
    type Item = (WaiterId, &'a H);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let entry = &self.queue.entries[index as usize];
        let node = entry.node.as_ref()?;
        self.cursor = node.next;
        Some((
            WaiterId {
                index,
                generation: entry.generation,
            },
            &node.value,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(queue: &WaitQueue<&'static str>) -> Vec<&'static str> {
        queue.iter().map(|(_, v)| *v).collect()
    }

    #[test]
    fn test_fifo_order() {
        let mut q = WaitQueue::new();
        q.push_back("a");
        q.push_back("b");
        q.push_back("c");
        assert_eq!(drain(&q), vec!["a", "b", "c"]);
        assert_eq!(q.pop_front(), Some("a"));
        assert_eq!(q.pop_front(), Some("b"));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_remove_middle_head_tail() {
        let mut q = WaitQueue::new();
        let a = q.push_back("a");
        let b = q.push_back("b");
        let c = q.push_back("c");
        let d = q.push_back("d");

        assert_eq!(q.remove(b), Some("b"));
        assert_eq!(drain(&q), vec!["a", "c", "d"]);
        assert_eq!(q.remove(a), Some("a"));
        assert_eq!(q.remove(d), Some("d"));
        assert_eq!(drain(&q), vec!["c"]);
        assert_eq!(q.front().map(|(id, _)| id), Some(c));
    }

    #[test]
    fn test_stale_id_is_ignored() {
        let mut q = WaitQueue::new();
        let a = q.push_back("a");
        assert_eq!(q.remove(a), Some("a"));
        assert_eq!(q.remove(a), None);

        // Slot is reused with a new generation.
        let b = q.push_back("b");
        assert_ne!(a, b);
        assert_eq!(q.remove(a), None);
        assert!(q.contains(b));
        assert_eq!(drain(&q), vec!["b"]);
    }

    #[test]
    fn test_empty_queue() {
        let mut q: WaitQueue<&str> = WaitQueue::new();
        assert!(q.is_empty());
        assert!(q.front().is_none());
        assert!(q.pop_front().is_none());
    }
}
