//! In-memory ordered store
//!
//! A `BTreeMap` behind a mutex, with snapshot-per-transaction reads and
//! buffered writes. Transactions honor `TxOption::Timeout` by failing reads
//! and commits past the deadline with a retryable error, which is enough to
//! exercise the wrapper plans' restart machinery. Commit faults can be
//! injected for retry tests.

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{QueryError, QueryResult};
use crate::stream::{stream_channel, FlowControlLock, StreamReceiver};

use super::traits::{Database, KeyValue, Transaction, TxOption};

type Map = BTreeMap<Vec<u8>, Vec<u8>>;

/// In-memory database: ordered key space shared by all transactions
pub struct MemoryDatabase {
    data: Arc<Mutex<Map>>,
    commit_faults: Arc<Mutex<VecDeque<QueryError>>>,
}

impl MemoryDatabase {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryDatabase {
            data: Arc::new(Mutex::new(BTreeMap::new())),
            commit_faults: Arc::new(Mutex::new(VecDeque::new())),
        })
    }

    /// Queue an error to be returned by the next commit
    pub fn inject_commit_fault(&self, error: QueryError) {
        self.commit_faults.lock().push_back(error);
    }

    /// Number of keys currently stored
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }
}

impl Database for MemoryDatabase {
    fn create_transaction(&self) -> Arc<dyn Transaction> {
        Arc::new(MemoryTransaction {
            db: self.data.clone(),
            commit_faults: self.commit_faults.clone(),
            state: Mutex::new(TxState {
                snapshot: self.data.lock().clone(),
                writes: BTreeMap::new(),
                deadline: None,
                timeout: None,
                retries_left: None,
                committed: false,
            }),
        })
    }
}

struct TxState {
    snapshot: Map,
    /// Buffered mutations; `None` marks a deletion
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
    retries_left: Option<i64>,
    committed: bool,
}

/// Transaction over the in-memory store
pub struct MemoryTransaction {
    db: Arc<Mutex<Map>>,
    commit_faults: Arc<Mutex<VecDeque<QueryError>>>,
    state: Mutex<TxState>,
}

impl MemoryTransaction {
    fn check_deadline(state: &TxState) -> QueryResult<()> {
        if let Some(deadline) = state.deadline {
            if Instant::now() >= deadline {
                return Err(QueryError::TransactionTooOld);
            }
        }
        Ok(())
    }

    fn read_merged(state: &TxState, begin: &[u8], end: &[u8]) -> Vec<KeyValue> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = state
            .snapshot
            .range::<[u8], _>((Bound::Included(begin), Bound::Excluded(end)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (k, w) in state
            .writes
            .range::<[u8], _>((Bound::Included(begin), Bound::Excluded(end)))
        {
            match w {
                Some(v) => {
                    merged.insert(k.clone(), v.clone());
                }
                None => {
                    merged.remove(k);
                }
            }
        }
        merged
            .into_iter()
            .map(|(key, value)| KeyValue { key, value })
            .collect()
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn get(&self, key: &[u8]) -> QueryResult<Option<Vec<u8>>> {
        let state = self.state.lock();
        Self::check_deadline(&state)?;
        if let Some(write) = state.writes.get(key) {
            return Ok(write.clone());
        }
        Ok(state.snapshot.get(key).cloned())
    }

    async fn get_range(&self, begin: &[u8], end: &[u8]) -> QueryResult<Vec<KeyValue>> {
        let state = self.state.lock();
        Self::check_deadline(&state)?;
        Ok(Self::read_merged(&state, begin, end))
    }

    fn get_descendants(
        &self,
        begin: &[u8],
        end: &[u8],
        lock: Arc<FlowControlLock>,
    ) -> StreamReceiver<KeyValue> {
        let (tx, rx) = stream_channel();
        let (pairs, deadline) = {
            let state = self.state.lock();
            (Self::read_merged(&state, begin, end), state.deadline)
        };
        tokio::spawn(async move {
            for kv in pairs {
                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        tx.send_error(QueryError::TransactionTooOld);
                        return;
                    }
                }
                lock.take(1).await;
                if !tx.send(kv) {
                    return;
                }
            }
        });
        rx
    }

    fn set(&self, key: &[u8], value: &[u8]) {
        self.state
            .lock()
            .writes
            .insert(key.to_vec(), Some(value.to_vec()));
    }

    fn clear(&self, key: &[u8]) {
        self.state.lock().writes.insert(key.to_vec(), None);
    }

    async fn commit(&self) -> QueryResult<()> {
        if let Some(fault) = self.commit_faults.lock().pop_front() {
            return Err(fault);
        }
        let writes = {
            let mut state = self.state.lock();
            Self::check_deadline(&state)?;
            if state.committed {
                return Err(QueryError::Internal(
                    "transaction already committed".to_string(),
                ));
            }
            state.committed = true;
            std::mem::take(&mut state.writes)
        };
        let mut db = self.db.lock();
        for (key, write) in writes {
            match write {
                Some(value) => {
                    db.insert(key, value);
                }
                None => {
                    db.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn on_error(&self, error: QueryError) -> QueryResult<()> {
        if !error.is_retryable() {
            return Err(error);
        }
        {
            let mut state = self.state.lock();
            if let Some(left) = state.retries_left.as_mut() {
                if *left <= 0 {
                    return Err(QueryError::RetryLimitExceeded);
                }
                *left -= 1;
            }
            state.snapshot = self.db.lock().clone();
            state.writes.clear();
            state.committed = false;
            state.deadline = state.timeout.map(|t| Instant::now() + t);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(())
    }

    fn set_option(&self, option: TxOption) {
        let mut state = self.state.lock();
        match option {
            TxOption::Timeout(timeout) => {
                state.timeout = Some(timeout);
                state.deadline = Some(Instant::now() + timeout);
            }
            TxOption::RetryLimit(limit) => {
                state.retries_left = Some(limit);
            }
            TxOption::CausalReadRisky => {}
        }
    }

    fn cancel_ongoing_index_reads(&self) {
        // Index maintenance in this store performs its reads inline during
        // commit_changes, so there is nothing in flight to cancel.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(k: &[u8], v: &[u8]) -> KeyValue {
        KeyValue {
            key: k.to_vec(),
            value: v.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_snapshot_isolation() {
        let db = MemoryDatabase::new();
        let tx1 = db.create_transaction();
        tx1.set(b"a", b"1");
        tx1.commit().await.unwrap();

        let reader = db.create_transaction();
        let writer = db.create_transaction();
        writer.set(b"a", b"2");
        writer.commit().await.unwrap();

        // Reader's snapshot predates the second commit
        assert_eq!(reader.get(b"a").await.unwrap(), Some(b"1".to_vec()));
        let fresh = db.create_transaction();
        assert_eq!(fresh.get(b"a").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn test_writes_visible_within_transaction() {
        let db = MemoryDatabase::new();
        let tx = db.create_transaction();
        tx.set(b"k1", b"v1");
        tx.set(b"k2", b"v2");
        tx.clear(b"k1");
        assert_eq!(tx.get(b"k1").await.unwrap(), None);
        assert_eq!(
            tx.get_range(b"k", b"l").await.unwrap(),
            vec![kv(b"k2", b"v2")]
        );
    }

    #[tokio::test]
    async fn test_descendants_stream_respects_flow_lock() {
        let db = MemoryDatabase::new();
        let setup = db.create_transaction();
        for i in 0..5u8 {
            setup.set(&[b'k', i], &[i]);
        }
        setup.commit().await.unwrap();

        let tx = db.create_transaction();
        let lock = Arc::new(FlowControlLock::new(1));
        let mut kvs = tx.get_descendants(b"k", b"l", lock.clone());
        for i in 0..5u8 {
            let kv = kvs.next().await.unwrap();
            lock.release(1);
            assert_eq!(kv.key, vec![b'k', i]);
        }
        assert_eq!(kvs.next().await.unwrap_err(), QueryError::EndOfStream);
    }

    #[tokio::test]
    async fn test_expired_transaction_is_retryable() {
        let db = MemoryDatabase::new();
        let tx = db.create_transaction();
        tx.set_option(TxOption::Timeout(Duration::from_millis(1)));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let err = tx.get(b"x").await.unwrap_err();
        assert_eq!(err, QueryError::TransactionTooOld);
        assert!(err.is_retryable());
        tx.on_error(err).await.unwrap();
        assert_eq!(tx.get(b"x").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_commit_fault_injection() {
        let db = MemoryDatabase::new();
        db.inject_commit_fault(QueryError::NotCommitted);
        let tx = db.create_transaction();
        tx.set(b"a", b"1");
        assert_eq!(tx.commit().await.unwrap_err(), QueryError::NotCommitted);
        tx.on_error(QueryError::NotCommitted).await.unwrap();
        tx.set(b"a", b"1");
        tx.commit().await.unwrap();
        let check = db.create_transaction();
        assert_eq!(check.get(b"a").await.unwrap(), Some(b"1".to_vec()));
    }
}
