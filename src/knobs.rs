//! Tunable execution parameters
//!
//! Collected in one struct so tests and embedders can shrink timeouts and
//! buffer sizes without touching plan construction sites.

use std::time::Duration;

/// Execution knobs shared by checkpoints and wrapper plans
#[derive(Debug, Clone)]
pub struct Knobs {
    /// Permits on each checkpoint's document-finished lock
    pub flow_control_lock_permits: usize,

    /// How long a non-isolated round may wait for its first document
    pub nonisolated_first_response_timeout: Duration,

    /// Per-round timeout after the first document has arrived
    pub nonisolated_internal_timeout: Duration,

    /// Committed-but-unemitted document ceiling in a read-write round
    pub nonisolated_rw_internal_buffer_max: usize,

    /// Per-round timeout while find-and-modify searches for its document
    pub find_and_modify_round_timeout: Duration,

    /// Hard timeout installed on every transaction a wrapper opens
    pub transaction_timeout: Duration,

    /// Retry budget for single-transaction retry plans
    pub transaction_retry_limit: i64,

    /// Idle lifetime of a registered cursor before pruning
    pub cursor_expiry: Duration,
}

impl Default for Knobs {
    fn default() -> Self {
        Knobs {
            flow_control_lock_permits: 100,
            nonisolated_first_response_timeout: Duration::from_secs(3),
            nonisolated_internal_timeout: Duration::from_secs(1),
            nonisolated_rw_internal_buffer_max: 100,
            find_and_modify_round_timeout: Duration::from_secs(1),
            transaction_timeout: Duration::from_secs(5),
            transaction_retry_limit: 5,
            cursor_expiry: Duration::from_secs(600),
        }
    }
}
