//! BurrowDB - a document database layer for ordered key-value stores
//!
//! The core of the crate is a streaming query executor: compiled plan
//! trees of scan, filter, projection, set-algebra, mutation, and control
//! operators drive documents from the store to a client through bounded,
//! credit-controlled streams. Long-running queries survive the store's
//! per-transaction deadline by checkpointing scan positions and resuming
//! in fresh transactions without losing or repeating documents.
//!
//! Features:
//! - Pipelined operator execution with cooperative cancellation
//! - Checkpoint/split-key protocol for multi-transaction queries
//! - Predicate push-down into index scans and primary-key lookups
//! - Secondary index maintenance, builds, and catalog management

pub mod checkpoint;
pub mod cursor;
pub mod document;
pub mod encoding;
pub mod error;
pub mod knobs;
pub mod metadata;
pub mod plan;
pub mod query;
pub mod storage;
pub mod stream;
