//! Error taxonomy for query execution
//!
//! Streams terminate with either `EndOfStream` (the happy-path exit of every
//! operator) or a real error. Cancellation is delivered through operator stop
//! tokens; `OperationCancelled` is what the terminal output stream reports
//! after a checkpoint has been stopped.

use thiserror::Error;

/// Result type for query execution operations
pub type QueryResult<T> = Result<T, QueryError>;

/// Errors surfaced by plans, streams, and the storage layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// Normal stream termination; every operator exits with this
    #[error("end of stream")]
    EndOfStream,

    /// The plan's checkpoint was stopped while the stream was open
    #[error("operation cancelled")]
    OperationCancelled,

    /// The collection's directory keys changed under a non-isolated plan
    #[error("collection metadata changed")]
    CollectionMetadataChanged,

    /// The metadata version changed and the subplan cannot tolerate it
    #[error("metadata changed during non-isolated execution")]
    MetadataChangedNonIsolated,

    /// An index with the same key specification already exists
    #[error("index already exists")]
    IndexAlreadyExists,

    /// An index with the same name but a different key specification exists
    #[error("index name taken")]
    IndexNameTaken,

    /// The index build id does not match the expected one
    #[error("index has wrong build id")]
    IndexWrongBuildId,

    /// The commit may or may not have been applied; the caller must decide
    #[error("commit result unknown")]
    CommitUnknownResult,

    /// The requested operation is not supported
    #[error("unsupported operation")]
    UnsupportedOperation,

    /// The transaction exceeded its lifetime and must be retried
    #[error("transaction is too old to perform reads or be committed")]
    TransactionTooOld,

    /// The transaction conflicted with another commit and must be retried
    #[error("transaction not committed due to conflict with another transaction")]
    NotCommitted,

    /// The transaction's retry limit was exhausted
    #[error("retry limit exceeded")]
    RetryLimitExceeded,

    /// Document or key bytes could not be decoded
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Internal invariant violation
    #[error("internal error: {0}")]
    Internal(String),
}

impl QueryError {
    /// Whether a transaction retry loop may recover from this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueryError::TransactionTooOld | QueryError::NotCommitted)
    }
}
