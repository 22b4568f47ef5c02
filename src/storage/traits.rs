//! Transaction and database trait definitions

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::QueryResult;
use crate::stream::{FlowControlLock, StreamReceiver};

/// A key-value pair read from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Typed transaction options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOption {
    /// Hard deadline on all reads and the commit
    Timeout(Duration),
    /// Budget for `on_error` retries before it gives up
    RetryLimit(i64),
    /// Reads may be served without confirming the leader's lease
    CausalReadRisky,
}

/// A transaction against the ordered key-value store
///
/// Reads see a snapshot taken when the transaction began. Writes are
/// buffered and applied atomically by `commit`. The store bounds the
/// lifetime of a transaction; reads and commits past the deadline fail
/// with a retryable error.
#[async_trait]
pub trait Transaction: Send + Sync {
    /// Point read
    async fn get(&self, key: &[u8]) -> QueryResult<Option<Vec<u8>>>;

    /// Read the full `[begin, end)` range at once
    async fn get_range(&self, begin: &[u8], end: &[u8]) -> QueryResult<Vec<KeyValue>>;

    /// Stream the `[begin, end)` range in key order, acquiring one credit
    /// from `lock` per delivered pair. The consumer releases credits as it
    /// processes pairs, which is what paces the read.
    fn get_descendants(
        &self,
        begin: &[u8],
        end: &[u8],
        lock: Arc<FlowControlLock>,
    ) -> StreamReceiver<KeyValue>;

    /// Buffer a write
    fn set(&self, key: &[u8], value: &[u8]);

    /// Buffer a deletion
    fn clear(&self, key: &[u8]);

    /// Atomically apply all buffered writes
    async fn commit(&self) -> QueryResult<()>;

    /// Decide whether `error` is recoverable; on `Ok(())` the transaction
    /// has been reset and may be retried
    async fn on_error(&self, error: crate::error::QueryError) -> QueryResult<()>;

    /// Apply a transaction option
    fn set_option(&self, option: TxOption);

    /// Abandon index reads triggered by buffered mutations, so a commit
    /// cannot race them
    fn cancel_ongoing_index_reads(&self);
}

/// Factory for transactions
pub trait Database: Send + Sync {
    fn create_transaction(&self) -> Arc<dyn Transaction>;
}
