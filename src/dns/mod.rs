//! Host name resolution.
//!
//! The [`Resolve`] trait is the seam the transport uses to turn a host name
//! into addresses. [`GaiResolver`] asks the operating system through
//! `getaddrinfo` on the blocking pool; [`StaticResolver`] answers from a
//! fixed table and falls back to another resolver.
//!
//! ```rust,ignore
//! use relaynet::dns::{GaiResolver, Name, Resolve};
//!
//! let addrs = GaiResolver::new().resolve(Name::new("localhost")).await?;
//! for ip in addrs {
//!     println!("{ip}");
//! }
//! ```

mod gai;
mod resolve;

pub use gai::{parse_ip_literal, GaiResolver};
pub use resolve::{Addrs, Name, Resolve, Resolving, StaticResolver};
