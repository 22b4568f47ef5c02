//! Cursor registry
//!
//! A cursor pairs a running plan's checkpoint with its output stream so a
//! client can consume results across multiple round trips. Cursors are
//! registered in a shared map, refreshed on use, and pruned once their
//! expiry passes; plucking a cursor stops its checkpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::checkpoint::PlanCheckpoint;
use crate::document::DocRef;
use crate::error::QueryResult;
use crate::stream::StreamReceiver;

/// A registered query result stream
pub struct Cursor {
    id: i64,
    checkpoint: Arc<PlanCheckpoint>,
    stream: tokio::sync::Mutex<StreamReceiver<DocRef>>,
    lifetime: Duration,
    expiry: Mutex<Instant>,
}

impl Cursor {
    pub fn new(
        id: i64,
        checkpoint: Arc<PlanCheckpoint>,
        stream: StreamReceiver<DocRef>,
        lifetime: Duration,
    ) -> Arc<Self> {
        Arc::new(Cursor {
            id,
            checkpoint,
            stream: tokio::sync::Mutex::new(stream),
            lifetime,
            expiry: Mutex::new(Instant::now() + lifetime),
        })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn checkpoint(&self) -> &Arc<PlanCheckpoint> {
        &self.checkpoint
    }

    /// Pull the next document, refreshing the cursor's expiry
    pub async fn next(&self) -> QueryResult<DocRef> {
        *self.expiry.lock() = Instant::now() + self.lifetime;
        let doc = self.stream.lock().await.next().await?;
        self.checkpoint.document_finished_lock().release(1);
        Ok(doc)
    }

    fn expired(&self, now: Instant) -> bool {
        now >= *self.expiry.lock()
    }
}

/// Shared map of live cursors
pub struct CursorRegistry {
    cursors: Mutex<HashMap<i64, Arc<Cursor>>>,
    next_id: AtomicI64,
}

impl CursorRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(CursorRegistry {
            cursors: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        })
    }

    /// Allocate a cursor id
    pub fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a cursor
    pub fn add(&self, cursor: Arc<Cursor>) -> Arc<Cursor> {
        self.cursors.lock().insert(cursor.id, cursor.clone());
        cursor
    }

    pub fn get(&self, id: i64) -> Option<Arc<Cursor>> {
        self.cursors.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.cursors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.lock().is_empty()
    }

    /// Remove a cursor and stop its checkpoint
    pub async fn pluck(&self, id: i64) -> bool {
        let cursor = self.cursors.lock().remove(&id);
        match cursor {
            Some(cursor) => {
                cursor.checkpoint.stop().await;
                true
            }
            None => false,
        }
    }

    /// Remove every expired cursor, returning how many were pruned
    pub async fn prune(&self) -> u32 {
        let now = Instant::now();
        let expired: Vec<i64> = self
            .cursors
            .lock()
            .values()
            .filter(|c| c.expired(now))
            .map(|c| c.id)
            .collect();
        let mut pruned = 0;
        for id in expired {
            if self.pluck(id).await {
                pruned += 1;
            }
        }
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::stream_channel;

    #[tokio::test]
    async fn test_add_get_pluck() {
        let registry = CursorRegistry::new();
        let (_tx, rx) = stream_channel();
        let id = registry.allocate_id();
        let cursor = Cursor::new(id, PlanCheckpoint::new(), rx, Duration::from_secs(60));
        registry.add(cursor);
        assert!(registry.get(id).is_some());
        assert!(registry.pluck(id).await);
        assert!(registry.get(id).is_none());
        assert!(!registry.pluck(id).await);
    }

    #[tokio::test]
    async fn test_prune_removes_only_expired() {
        let registry = CursorRegistry::new();
        let (_tx1, rx1) = stream_channel();
        let (_tx2, rx2) = stream_channel();
        let fresh = Cursor::new(
            registry.allocate_id(),
            PlanCheckpoint::new(),
            rx1,
            Duration::from_secs(600),
        );
        let stale = Cursor::new(
            registry.allocate_id(),
            PlanCheckpoint::new(),
            rx2,
            Duration::from_millis(0),
        );
        let stale_id = stale.id();
        registry.add(fresh.clone());
        registry.add(stale);
        assert_eq!(registry.prune().await, 1);
        assert!(registry.get(fresh.id()).is_some());
        assert!(registry.get(stale_id).is_none());
    }
}
