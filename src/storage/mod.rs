//! Storage abstraction
//!
//! Plans run against [`Transaction`] handles obtained from a [`Database`].
//! The store is an ordered key-value space with snapshot reads inside a
//! transaction, buffered writes applied at commit, and a bounded
//! transaction lifetime. An in-memory implementation backs tests and
//! embedded use.

mod memory;
mod traits;

pub use memory::{MemoryDatabase, MemoryTransaction};
pub use traits::{Database, KeyValue, Transaction, TxOption};
