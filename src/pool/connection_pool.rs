use super::lease::{Lease, Recycle};
use super::waiter::{NoopListener, WaitQueue, Waiter, WaiterId, WaiterListener};
use crate::base::neterror::NetError;
use crate::future::context::{catch_panic, lock};
use crate::future::{Context, Deferred, Outcome};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::IntoFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

/// Stable handle to a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    index: u32,
    generation: u32,
}

/// A freshly established connection and the number of concurrent leases
/// it supports (e.g. the negotiated stream limit).
#[derive(Debug, Clone)]
pub struct Connected<C> {
    pub connection: C,
    pub concurrency: u32,
}

/// Opens and closes the physical connections of a [`Pool`].
pub trait Connector<C>: Send + Sync + 'static {
    fn connect(&self, context: &Context) -> Deferred<Connected<C>>;

    fn close(&self, _connection: C) {}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Physical connections, including those still connecting.
    pub max_connections: usize,
    /// Waiters allowed to park without a connection attempt. `None` is
    /// unbounded.
    pub max_wait_queue: Option<usize>,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 6,
            max_wait_queue: None,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

impl PoolConfig {
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_max_wait_queue(mut self, max: usize) -> Self {
        self.max_wait_queue = Some(max);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub connections: usize,
    pub connecting: usize,
    pub active: usize,
    pub closing: usize,
    pub idle: usize,
    pub capacity: u64,
    pub leased: u64,
    pub waiters: usize,
    pub parked: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotStatus {
    Connecting,
    Active,
    Closing,
}

struct Slot<C> {
    status: SlotStatus,
    connection: Option<C>,
    concurrency: u32,
    leased: u32,
    /// Waiter this connection attempt was started for.
    assigned: Option<WaiterId>,
    idle_since: Option<Instant>,
}

impl<C> Slot<C> {
    fn available(&self) -> u32 {
        match self.status {
            SlotStatus::Active => self.concurrency.saturating_sub(self.leased),
            _ => 0,
        }
    }

    /// A lowered concurrency only takes effect as leases come back.
    fn capacity(&self) -> u32 {
        self.concurrency.max(self.leased)
    }
}

struct SlotEntry<C> {
    generation: u32,
    slot: Option<Slot<C>>,
}

struct Queued<C> {
    waiter: Waiter,
    result: Deferred<Lease<C>>,
    listener: Arc<dyn WaiterListener>,
    /// A connection attempt is in flight on this waiter's behalf.
    covered: bool,
}

enum Hook {
    Enqueue,
    Connect,
}

enum Action<C> {
    Grant {
        queued: Queued<C>,
        connection: C,
        slot: ConnectionId,
        weight: u32,
    },
    Fail {
        queued: Queued<C>,
        error: NetError,
    },
    Connect {
        slot: ConnectionId,
        context: Context,
    },
    Close(C),
    Hook {
        hook: Hook,
        listener: Arc<dyn WaiterListener>,
        waiter: Waiter,
    },
}

struct PoolState<C> {
    slots: Vec<SlotEntry<C>>,
    free_slots: Vec<u32>,
    live: usize,
    queue: WaitQueue<Queued<C>>,
    uncovered: usize,
    closed: bool,
}

impl<C: Clone> PoolState<C> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            live: 0,
            queue: WaitQueue::new(),
            uncovered: 0,
            closed: false,
        }
    }

    fn slot_mut(&mut self, id: ConnectionId) -> Option<&mut Slot<C>> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|e| e.generation == id.generation)
            .and_then(|e| e.slot.as_mut())
    }

    fn open_slot(&mut self, assigned: Option<WaiterId>) -> ConnectionId {
        let slot = Slot {
            status: SlotStatus::Connecting,
            connection: None,
            concurrency: 0,
            leased: 0,
            assigned,
            idle_since: None,
        };
        self.live += 1;
        match self.free_slots.pop() {
            Some(index) => {
                let entry = &mut self.slots[index as usize];
                entry.slot = Some(slot);
                ConnectionId {
                    index,
                    generation: entry.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(SlotEntry {
                    generation: 0,
                    slot: Some(slot),
                });
                ConnectionId {
                    index,
                    generation: 0,
                }
            }
        }
    }

    fn free_slot(&mut self, id: ConnectionId) -> Option<Slot<C>> {
        let entry = self
            .slots
            .get_mut(id.index as usize)
            .filter(|e| e.generation == id.generation)?;
        let slot = entry.slot.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free_slots.push(id.index);
        self.live -= 1;
        if let Some(waiter) = slot.assigned {
            self.uncover(waiter);
        }
        Some(slot)
    }

    fn slot_ids(&self) -> Vec<ConnectionId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, e)| e.slot.is_some())
            .map(|(index, e)| ConnectionId {
                index: index as u32,
                generation: e.generation,
            })
            .collect()
    }

    fn enqueue(&mut self, queued: Queued<C>) -> WaiterId {
        let id = self.queue.push_back(queued);
        self.uncovered += 1;
        if let Some(queued) = self.queue.get_mut(id) {
            queued.waiter.set_id(id);
        }
        id
    }

    fn dequeue(&mut self, id: WaiterId) -> Option<Queued<C>> {
        let queued = self.queue.remove(id)?;
        if !queued.covered {
            self.uncovered -= 1;
        }
        queued.waiter.dispose();
        Some(queued)
    }

    fn uncover(&mut self, id: WaiterId) {
        if let Some(queued) = self.queue.get_mut(id) {
            if queued.covered {
                queued.covered = false;
                self.uncovered += 1;
            }
        }
    }

    /// First active connection with room for `weight`.
    fn find_fit(&self, weight: u32) -> Option<ConnectionId> {
        self.slots.iter().enumerate().find_map(|(index, e)| {
            let slot = e.slot.as_ref()?;
            (slot.available() >= weight).then_some(ConnectionId {
                index: index as u32,
                generation: e.generation,
            })
        })
    }

    /// Serve the queue head while it fits, then start connections for
    /// waiters nobody is connecting for. The head is never bypassed.
    fn pump(&mut self, max_connections: usize, actions: &mut Vec<Action<C>>) {
        if self.closed {
            return;
        }
        while let Some((id, head)) = self.queue.front() {
            let weight = head.waiter.capacity();
            let Some(slot_id) = self.find_fit(weight) else {
                break;
            };
            let Some(connection) = self.slot_mut(slot_id).and_then(|s| s.connection.clone()) else {
                break;
            };
            let Some(queued) = self.dequeue(id) else {
                break;
            };
            if let Some(slot) = self.slot_mut(slot_id) {
                slot.leased += weight;
                slot.idle_since = None;
            }
            actions.push(Action::Grant {
                queued,
                connection,
                slot: slot_id,
                weight,
            });
        }

        if self.uncovered == 0 || self.live >= max_connections {
            return;
        }
        let uncovered: Vec<WaiterId> = self
            .queue
            .iter()
            .filter(|(_, q)| !q.covered)
            .map(|(id, _)| id)
            .collect();
        for id in uncovered {
            if self.live >= max_connections {
                break;
            }
            let slot = self.open_slot(Some(id));
            let Some(queued) = self.queue.get_mut(id) else {
                continue;
            };
            queued.covered = true;
            let (waiter, listener) = (queued.waiter.clone(), queued.listener.clone());
            self.uncovered -= 1;
            actions.push(Action::Hook {
                hook: Hook::Connect,
                listener,
                waiter: waiter.clone(),
            });
            actions.push(Action::Connect {
                slot,
                context: waiter.context().clone(),
            });
        }
    }

    fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            waiters: self.queue.len(),
            parked: self.uncovered,
            ..PoolStats::default()
        };
        for slot in self.slots.iter().filter_map(|e| e.slot.as_ref()) {
            stats.connections += 1;
            match slot.status {
                SlotStatus::Connecting => stats.connecting += 1,
                SlotStatus::Active => {
                    stats.active += 1;
                    if slot.leased == 0 {
                        stats.idle += 1;
                    }
                }
                SlotStatus::Closing => stats.closing += 1,
            }
            stats.capacity += u64::from(slot.capacity());
            stats.leased += u64::from(slot.leased);
        }
        stats
    }
}

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct PoolShared<C> {
    id: u64,
    config: PoolConfig,
    connector: Arc<dyn Connector<C>>,
    state: Mutex<PoolState<C>>,
    me: Weak<PoolShared<C>>,
}

impl<C: Clone + Send + Sync + 'static> PoolShared<C> {
    fn run(&self, actions: Vec<Action<C>>) {
        for action in actions {
            match action {
                Action::Grant {
                    queued,
                    connection,
                    slot,
                    weight,
                } => match self.me.upgrade() {
                    Some(pool) => {
                        let lease = Lease::new(pool, connection, slot, weight);
                        tracing::trace!(pool = self.id, ?slot, weight, "lease granted");
                        // A refused lease is dropped here and recycles itself.
                        queued.result.complete(lease);
                    }
                    None => {
                        queued.result.fail(NetError::PoolClosed);
                    }
                },
                Action::Fail { queued, error } => {
                    queued.result.fail(error);
                }
                Action::Connect { slot, context } => self.start_connect(slot, context),
                Action::Close(connection) => {
                    let connector = self.connector.clone();
                    if let Err(e) = catch_panic(move || connector.close(connection)) {
                        tracing::error!(pool = self.id, error = %e, "connector close panicked");
                    }
                }
                Action::Hook {
                    hook,
                    listener,
                    waiter,
                } => {
                    let result = catch_panic(|| match hook {
                        Hook::Enqueue => listener.on_enqueue(&waiter),
                        Hook::Connect => listener.on_connect(&waiter),
                    });
                    if let Err(e) = result {
                        tracing::error!(pool = self.id, error = %e, "waiter listener panicked");
                    }
                }
            }
        }
    }

    fn start_connect(&self, slot: ConnectionId, context: Context) {
        tracing::debug!(pool = self.id, ?slot, "opening connection");
        let connector = self.connector.clone();
        let attempt = catch_panic(|| connector.connect(&context))
            .unwrap_or_else(|e| Deferred::failed(&context, e));
        let pool = self.me.clone();
        attempt.on_complete(move |outcome| match pool.upgrade() {
            Some(pool) => pool.connected(slot, outcome),
            None => {
                if let Ok(connected) = outcome {
                    connector.close(connected.connection);
                }
            }
        });
    }

    fn connected(&self, id: ConnectionId, outcome: Outcome<Connected<C>>) {
        let actions = {
            let mut state = lock(&self.state);
            let mut actions = Vec::new();
            match outcome {
                Ok(Connected {
                    connection,
                    concurrency,
                }) => {
                    let status = state.slot_mut(id).map(|s| s.status);
                    match status {
                        Some(SlotStatus::Connecting) => {
                            let assigned = state.slot_mut(id).and_then(|slot| {
                                slot.status = SlotStatus::Active;
                                slot.connection = Some(connection);
                                slot.concurrency = concurrency.max(1);
                                slot.idle_since = Some(Instant::now());
                                slot.assigned.take()
                            });
                            if let Some(waiter) = assigned {
                                state.uncover(waiter);
                            }
                            tracing::debug!(pool = self.id, ?id, concurrency, "connection established");
                        }
                        Some(_) => {
                            state.free_slot(id);
                            actions.push(Action::Close(connection));
                        }
                        None => {
                            tracing::debug!(pool = self.id, ?id, "connection arrived after removal");
                            actions.push(Action::Close(connection));
                        }
                    }
                }
                Err(error) => {
                    tracing::debug!(pool = self.id, ?id, error = %error, "connection attempt failed");
                    if let Some(slot) = state.free_slot(id) {
                        if let Some(queued) = slot.assigned.and_then(|w| state.dequeue(w)) {
                            actions.push(Action::Fail { queued, error });
                        }
                    }
                }
            }
            state.pump(self.config.max_connections, &mut actions);
            actions
        };
        self.run(actions);
    }
}

impl<C: Clone + Send + Sync + 'static> Recycle for PoolShared<C> {
    fn release(&self, id: ConnectionId, weight: u32) {
        let actions = {
            let mut state = lock(&self.state);
            let mut actions = Vec::new();
            let Some(slot) = state.slot_mut(id) else {
                tracing::trace!(pool = self.id, ?id, "lease returned for a removed connection");
                return;
            };
            debug_assert!(slot.leased >= weight, "lease weight exceeds leased total");
            slot.leased = slot.leased.saturating_sub(weight);
            if slot.leased == 0 {
                match slot.status {
                    SlotStatus::Closing => {
                        if let Some(connection) = state.free_slot(id).and_then(|s| s.connection) {
                            actions.push(Action::Close(connection));
                        }
                    }
                    _ => slot.idle_since = Some(Instant::now()),
                }
            }
            state.pump(self.config.max_connections, &mut actions);
            actions
        };
        self.run(actions);
    }
}

/// Bounded connection pool with a strict FIFO wait queue.
///
/// Waiters are served in arrival order. When the head's requested weight
/// does not fit anywhere, everyone behind it waits too, even if they would
/// fit. A waiter asking for more than any connection can ever offer blocks
/// the queue until it is cancelled.
pub struct Pool<C> {
    shared: Arc<PoolShared<C>>,
}

impl<C> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Clone + Send + Sync + 'static> Pool<C> {
    pub fn new<K: Connector<C>>(config: PoolConfig, connector: K) -> Self {
        Self::with_connector(config, Arc::new(connector))
    }

    pub fn with_connector(config: PoolConfig, connector: Arc<dyn Connector<C>>) -> Self {
        let shared = Arc::new_cyclic(|me| PoolShared {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            config,
            connector,
            state: Mutex::new(PoolState::new()),
            me: me.clone(),
        });
        Self { shared }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn acquire(&self, context: &Context, capacity: u32) -> Acquire<C> {
        self.acquire_with(context, capacity, Arc::new(NoopListener))
    }

    /// Request `capacity` units of one connection.
    ///
    /// The lease is granted synchronously when the queue is empty and a
    /// connection has room; otherwise the waiter joins the queue tail.
    pub fn acquire_with(
        &self,
        context: &Context,
        capacity: u32,
        listener: Arc<dyn WaiterListener>,
    ) -> Acquire<C> {
        let mut waiter = Waiter::new(self.shared.id, context.clone(), capacity);
        let result = Deferred::new(context);
        if capacity == 0 {
            waiter.dispose();
            result.fail(NetError::InvalidArgument("requested capacity must be positive"));
            return Acquire { waiter, result };
        }

        let actions = {
            let mut state = lock(&self.shared.state);
            let mut actions = Vec::new();
            if state.closed {
                waiter.dispose();
                actions.push(Action::Fail {
                    queued: Queued {
                        waiter: waiter.clone(),
                        result: result.clone(),
                        listener,
                        covered: false,
                    },
                    error: NetError::PoolClosed,
                });
            } else {
                let id = state.enqueue(Queued {
                    waiter: waiter.clone(),
                    result: result.clone(),
                    listener: listener.clone(),
                    covered: false,
                });
                waiter.set_id(id);
                state.pump(self.shared.config.max_connections, &mut actions);

                let parked = state.queue.get(id).is_some_and(|q| !q.covered);
                if parked {
                    match self.shared.config.max_wait_queue {
                        Some(max) if state.uncovered > max => {
                            if let Some(queued) = state.dequeue(id) {
                                tracing::debug!(pool = self.shared.id, max, "wait queue full");
                                actions.push(Action::Fail {
                                    queued,
                                    error: NetError::WaitQueueFull { max },
                                });
                            }
                        }
                        _ => actions.push(Action::Hook {
                            hook: Hook::Enqueue,
                            listener,
                            waiter: waiter.clone(),
                        }),
                    }
                }
            }
            actions
        };
        self.shared.run(actions);
        Acquire { waiter, result }
    }

    /// Withdraw a queued waiter. Idempotent; returns `false` if the waiter
    /// was already granted, failed or cancelled. No completion is ever
    /// delivered to a cancelled waiter.
    pub fn cancel(&self, waiter: &Waiter) -> bool {
        let Some(id) = waiter.id() else {
            return false;
        };
        if waiter.pool_id() != self.shared.id {
            return false;
        }
        let (removed, actions) = {
            let mut state = lock(&self.shared.state);
            let removed = state.dequeue(id);
            let mut actions = Vec::new();
            if removed.is_some() {
                state.pump(self.shared.config.max_connections, &mut actions);
            }
            (removed, actions)
        };
        self.shared.run(actions);
        let cancelled = removed.is_some();
        if cancelled {
            tracing::trace!(pool = self.shared.id, ?id, "waiter cancelled");
        }
        cancelled
    }

    /// Set the concurrency of an active connection. Raising it serves
    /// queued waiters; lowering it below the leased weight takes effect as
    /// leases come back.
    pub fn update_concurrency(&self, id: ConnectionId, concurrency: u32) -> bool {
        self.mutate(id, |state, _| match state.slot_mut(id) {
            Some(slot) if slot.status == SlotStatus::Active => {
                slot.concurrency = concurrency;
                true
            }
            _ => false,
        })
    }

    /// Stop granting on a connection and close it once its leases are back.
    pub fn retire(&self, id: ConnectionId) -> bool {
        self.mutate(id, |state, actions| {
            let Some(slot) = state.slot_mut(id) else {
                return false;
            };
            let drained = slot.status == SlotStatus::Active && slot.leased == 0;
            slot.status = SlotStatus::Closing;
            if drained {
                if let Some(connection) = state.free_slot(id).and_then(|s| s.connection) {
                    actions.push(Action::Close(connection));
                }
            }
            true
        })
    }

    /// Drop a connection immediately. Its outstanding leases become inert.
    pub fn remove(&self, id: ConnectionId) -> bool {
        self.mutate(id, |state, actions| match state.free_slot(id) {
            Some(slot) => {
                if let Some(connection) = slot.connection {
                    actions.push(Action::Close(connection));
                }
                true
            }
            None => false,
        })
    }

    fn mutate<F>(&self, id: ConnectionId, f: F) -> bool
    where
        F: FnOnce(&mut PoolState<C>, &mut Vec<Action<C>>) -> bool,
    {
        let (changed, actions) = {
            let mut state = lock(&self.shared.state);
            let mut actions = Vec::new();
            let changed = f(&mut state, &mut actions);
            if changed {
                state.pump(self.shared.config.max_connections, &mut actions);
            }
            (changed, actions)
        };
        if changed {
            tracing::trace!(pool = self.shared.id, ?id, "connection updated");
        }
        self.shared.run(actions);
        changed
    }

    /// Fail every queued waiter with [`NetError::PoolClosed`], close idle
    /// connections and let the rest drain. Later acquisitions fail.
    pub fn close(&self) {
        let actions = {
            let mut state = lock(&self.shared.state);
            if state.closed {
                return;
            }
            state.closed = true;
            let mut actions = Vec::new();
            while let Some((id, _)) = state.queue.front() {
                match state.dequeue(id) {
                    Some(queued) => actions.push(Action::Fail {
                        queued,
                        error: NetError::PoolClosed,
                    }),
                    None => break,
                }
            }
            for id in state.slot_ids() {
                let Some(slot) = state.slot_mut(id) else {
                    continue;
                };
                let drained = slot.status == SlotStatus::Active && slot.leased == 0;
                slot.status = SlotStatus::Closing;
                if drained {
                    if let Some(connection) = state.free_slot(id).and_then(|s| s.connection) {
                        actions.push(Action::Close(connection));
                    }
                }
            }
            actions
        };
        tracing::debug!(pool = self.shared.id, "pool closed");
        self.shared.run(actions);
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.shared.state).closed
    }

    /// Close connections idle for at least the configured timeout. Returns
    /// how many were closed.
    pub fn cleanup_idle(&self) -> usize {
        let now = Instant::now();
        let timeout = self.shared.config.idle_timeout;
        let (closed, actions) = {
            let mut state = lock(&self.shared.state);
            let mut actions = Vec::new();
            for id in state.slot_ids() {
                let expired = state.slot_mut(id).is_some_and(|slot| {
                    slot.status == SlotStatus::Active
                        && slot.leased == 0
                        && slot
                            .idle_since
                            .is_some_and(|since| now.saturating_duration_since(since) >= timeout)
                });
                if expired {
                    if let Some(connection) = state.free_slot(id).and_then(|s| s.connection) {
                        actions.push(Action::Close(connection));
                    }
                }
            }
            let closed = actions.len();
            state.pump(self.shared.config.max_connections, &mut actions);
            (closed, actions)
        };
        if closed > 0 {
            tracing::debug!(pool = self.shared.id, closed, "closed idle connections");
        }
        self.shared.run(actions);
        closed
    }

    pub fn stats(&self) -> PoolStats {
        lock(&self.shared.state).stats()
    }
}

impl<C> fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.shared.id)
            .field("config", &self.shared.config)
            .finish()
    }
}

/// A pending or granted acquisition.
pub struct Acquire<C> {
    waiter: Waiter,
    result: Deferred<Lease<C>>,
}

impl<C: Clone + Send + Sync + 'static> Acquire<C> {
    /// Handle for [`Pool::cancel`].
    pub fn waiter(&self) -> &Waiter {
        &self.waiter
    }

    pub fn result(&self) -> &Deferred<Lease<C>> {
        &self.result
    }

    pub fn into_parts(self) -> (Waiter, Deferred<Lease<C>>) {
        (self.waiter, self.result)
    }
}

impl<C: Clone + Send + Sync + 'static> IntoFuture for Acquire<C> {
    type Output = Outcome<Lease<C>>;
    type IntoFuture = BoxFuture<'static, Outcome<Lease<C>>>;

    fn into_future(self) -> Self::IntoFuture {
        self.result.into_future()
    }
}

impl<C> fmt::Debug for Acquire<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acquire").field("waiter", &self.waiter).finish()
    }
}
