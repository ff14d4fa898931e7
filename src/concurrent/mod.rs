//! Lock-free concurrency primitives.

pub mod cyclic;
pub mod shared;

pub use cyclic::{CyclicSequence, Exhausted, Iter};
pub use shared::SharedSequence;
