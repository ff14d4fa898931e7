//! Connection pooling.
//!
//! A [`Pool`] owns a bounded set of physical connections opened through a
//! [`Connector`]. Requests for capacity are served from a strict FIFO
//! [`WaitQueue`]; each grant is a [`Lease`] that returns its weight to the
//! pool when recycled.

pub mod connection_pool;
pub mod lease;
pub mod waiter;

pub use connection_pool::{
    Acquire, Connected, ConnectionId, Connector, Pool, PoolConfig, PoolStats,
};
pub use lease::Lease;
pub use waiter::{NoopListener, WaitQueue, Waiter, WaiterId, WaiterListener};
