use super::connection_pool::ConnectionId;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Where a lease returns its weight.
pub(crate) trait Recycle: Send + Sync + 'static {
    fn release(&self, slot: ConnectionId, weight: u32);
}

/// A granted borrow of `weight` units of one pooled connection.
///
/// Clones share the borrow. It is returned to the pool exactly once: by
/// [`recycle`](Lease::recycle) or when the last clone is dropped. If the
/// connection was removed from the pool meanwhile, returning it is a no-op.
pub struct Lease<C> {
    inner: Arc<LeaseInner<C>>,
}

struct LeaseInner<C> {
    pool: Arc<dyn Recycle>,
    connection: C,
    slot: ConnectionId,
    weight: u32,
    recycled: AtomicBool,
}

impl<C: Clone + Send + Sync + 'static> Lease<C> {
    pub(crate) fn new(pool: Arc<dyn Recycle>, connection: C, slot: ConnectionId, weight: u32) -> Self {
        Self {
            inner: Arc::new(LeaseInner {
                pool,
                connection,
                slot,
                weight,
                recycled: AtomicBool::new(false),
            }),
        }
    }

    pub fn get(&self) -> &C {
        &self.inner.connection
    }

    pub fn weight(&self) -> u32 {
        self.inner.weight
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.inner.slot
    }

    /// Return the borrowed weight to the pool. Returns `false` if this lease
    /// was already recycled.
    pub fn recycle(&self) -> bool {
        self.inner.recycle()
    }

    pub fn is_recycled(&self) -> bool {
        self.inner.recycled.load(Ordering::Acquire)
    }
}

impl<C> LeaseInner<C> {
    fn recycle(&self) -> bool {
        if self.recycled.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.pool.release(self.slot, self.weight);
        true
    }
}

impl<C> Drop for LeaseInner<C> {
    fn drop(&mut self) {
        self.recycle();
    }
}

impl<C> Clone for Lease<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C> fmt::Debug for Lease<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("connection", &self.inner.slot)
            .field("weight", &self.inner.weight)
            .field("recycled", &self.inner.recycled.load(Ordering::Relaxed))
            .finish()
    }
}
