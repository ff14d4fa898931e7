//! Base types and error handling.
//!
//! - [`NetError`](neterror::NetError): error values carried through deferred results
//! - [`IoResultExt`](context::IoResultExt): IO error context helpers

pub mod context;
pub mod neterror;

#[cfg(test)]
mod tests;
