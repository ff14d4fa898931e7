//! # relaynet
//!
//! Connection establishment and pooling core for event-driven networking.
//!
//! `relaynet` composes deferred results without stack growth, shares a
//! bounded set of connections between many requesters in strict FIFO order,
//! drives proxy and TLS handshakes over raw channels, and provides a
//! lock-free round-robin sequence.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use relaynet::future::Context;
//! use relaynet::socket::{ClientSocketPool, TokioTransport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), relaynet::NetError> {
//!     let pool = ClientSocketPool::builder(TokioTransport::new()).build();
//!     let url = url::Url::parse("http://127.0.0.1:8080/").unwrap();
//!     let lease = pool.request_socket(&Context::event_loop(), &url)?.await?;
//!     println!("leased {:?}", lease.connection_id());
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`base`] - Error type and IO error context
//! - [`concurrent`] - Copy-on-write round-robin sequence and its published holder
//! - [`dns`] - Pluggable host name resolution
//! - [`future`] - Deferred results, listeners and execution contexts
//! - [`pool`] - Strict FIFO connection pool with leases
//! - [`socket`] - Transport, proxy and TLS handshakes, per-endpoint pools

pub mod base;
pub mod concurrent;
pub mod dns;
pub mod future;
pub mod pool;
pub mod socket;

pub use base::neterror::NetError;
pub use concurrent::{CyclicSequence, SharedSequence};
pub use future::{Context, Deferred};
pub use pool::{Lease, Pool, PoolConfig};
