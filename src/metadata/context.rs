//! Collection contexts and store-backed document contexts
//!
//! Key layout: collection data lives under `d <db> <coll>`, index entries
//! under `i <db> <coll> <index>`, and collection metadata (the version
//! counter) under `m <db> <coll>`. All path components are encoded key
//! parts, so directories never collide and never begin with `0xff`.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::document::{path_get, path_remove, path_set, DocumentContext};
use crate::encoding::encode_key_part;
use crate::error::{QueryError, QueryResult};
use crate::storage::{KeyValue, Transaction};
use crate::stream::{FlowControlLock, StreamReceiver};

use super::{IndexInfo, Namespace};

const DATA_PREFIX: u8 = b'd';
const INDEX_PREFIX: u8 = b'i';
const METADATA_PREFIX: u8 = b'm';

/// Suffix of the metadata version key within the metadata directory
const VERSION_SUFFIX: u8 = 0x01;

fn namespace_dir(prefix: u8, ns: &Namespace) -> Vec<u8> {
    let mut dir = vec![prefix];
    dir.extend_from_slice(&encode_key_part(&Value::String(ns.db.clone())));
    dir.extend_from_slice(&encode_key_part(&Value::String(ns.collection.clone())));
    dir
}

/// A collection's metadata, not yet bound to a transaction
#[derive(Debug)]
pub struct UnboundCollectionContext {
    ns: Namespace,
    collection_dir: Vec<u8>,
    metadata_dir: Vec<u8>,
    known_indexes: Vec<IndexInfo>,
}

impl UnboundCollectionContext {
    pub fn new(ns: Namespace, known_indexes: Vec<IndexInfo>) -> Self {
        let collection_dir = namespace_dir(DATA_PREFIX, &ns);
        let metadata_dir = namespace_dir(METADATA_PREFIX, &ns);
        UnboundCollectionContext {
            ns,
            collection_dir,
            metadata_dir,
            known_indexes,
        }
    }

    pub fn ns(&self) -> &Namespace {
        &self.ns
    }

    /// Key prefix under which this collection's documents live
    pub fn collection_directory(&self) -> &[u8] {
        &self.collection_dir
    }

    /// Key prefix under which this collection's metadata lives
    pub fn metadata_directory(&self) -> &[u8] {
        &self.metadata_dir
    }

    pub fn known_indexes(&self) -> &[IndexInfo] {
        &self.known_indexes
    }

    /// Key prefix of one index's entries
    pub fn index_directory(&self, index: &IndexInfo) -> Vec<u8> {
        let mut dir = namespace_dir(INDEX_PREFIX, &self.ns);
        dir.extend_from_slice(&encode_key_part(&Value::String(index.name.clone())));
        dir
    }

    /// A ready single-field index over `field`, if one exists
    pub fn get_simple_index(&self, field: &str) -> Option<IndexInfo> {
        self.known_indexes
            .iter()
            .find(|index| {
                index.status == super::IndexStatus::Ready
                    && index.size() == 1
                    && index.keys[0].0 == field
            })
            .cloned()
    }

    /// A ready index whose keys are `prefix`'s keys followed by `field`
    pub fn get_compound_index(&self, prefix: &IndexInfo, field: &str) -> Option<IndexInfo> {
        self.known_indexes
            .iter()
            .find(|index| {
                index.status == super::IndexStatus::Ready
                    && index.size() == prefix.size() + 1
                    && index.keys[..prefix.size()] == prefix.keys[..]
                    && index.keys[prefix.size()].0 == field
            })
            .cloned()
    }

    /// Bind to a transaction
    pub fn bind(self: &Arc<Self>, tx: &Arc<dyn Transaction>) -> CollectionContext {
        CollectionContext {
            unbound: self.clone(),
            tx: tx.clone(),
        }
    }
}

/// A collection bound to one transaction
#[derive(Clone)]
pub struct CollectionContext {
    unbound: Arc<UnboundCollectionContext>,
    tx: Arc<dyn Transaction>,
}

impl CollectionContext {
    pub fn unbound(&self) -> &Arc<UnboundCollectionContext> {
        &self.unbound
    }

    pub fn transaction(&self) -> &Arc<dyn Transaction> {
        &self.tx
    }

    /// Storage key of the document with the given primary key part
    pub fn doc_key(&self, pk_part: &[u8]) -> Vec<u8> {
        let mut key = self.unbound.collection_dir.clone();
        key.extend_from_slice(pk_part);
        key
    }

    fn version_key(&self) -> Vec<u8> {
        let mut key = self.unbound.metadata_dir.clone();
        key.push(VERSION_SUFFIX);
        key
    }

    /// Current metadata version (0 when unset)
    pub async fn get_metadata_version(&self) -> QueryResult<u64> {
        match self.tx.get(&self.version_key()).await? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| QueryError::Encoding("bad metadata version".to_string()))?;
                Ok(u64::from_le_bytes(arr))
            }
            None => Ok(0),
        }
    }

    /// Buffer a metadata version bump into the transaction
    pub async fn bump_metadata_version(&self) -> QueryResult<()> {
        let next = self.get_metadata_version().await? + 1;
        self.tx.set(&self.version_key(), &next.to_le_bytes());
        Ok(())
    }

    /// Stream document key-values in `[begin, end)` relative to the
    /// collection directory; delivered keys are absolute
    pub fn descendants(
        &self,
        rel_begin: &[u8],
        rel_end: &[u8],
        lock: Arc<FlowControlLock>,
    ) -> StreamReceiver<KeyValue> {
        let mut begin = self.unbound.collection_dir.clone();
        begin.extend_from_slice(rel_begin);
        let mut end = self.unbound.collection_dir.clone();
        end.extend_from_slice(rel_end);
        self.tx.get_descendants(&begin, &end, lock)
    }

    /// Stream one index's entries in `[begin, end)` relative to the index
    /// directory
    pub fn index_descendants(
        &self,
        index: &IndexInfo,
        rel_begin: &[u8],
        rel_end: &[u8],
        lock: Arc<FlowControlLock>,
    ) -> StreamReceiver<KeyValue> {
        let dir = self.unbound.index_directory(index);
        let mut begin = dir.clone();
        begin.extend_from_slice(rel_begin);
        let mut end = dir;
        end.extend_from_slice(rel_end);
        self.tx.get_descendants(&begin, &end, lock)
    }

    /// A writable context for the document with the given primary key part
    pub fn doc_context(&self, pk_part: Vec<u8>) -> Arc<StoreDocumentContext> {
        Arc::new(StoreDocumentContext {
            collection: self.clone(),
            pk_part,
            pending: Mutex::new(Vec::new()),
        })
    }
}

#[derive(Debug, Clone)]
enum PendingWrite {
    Set(String, Value),
    Clear(String),
    Replace(Value),
    Delete,
}

/// Store-backed document context with deferred writes
///
/// `commit_changes` re-reads the stored document, applies the buffered
/// writes, and maintains the entries of every known index (including ones
/// still building) before writing the document back — all through the
/// transaction's write buffer.
pub struct StoreDocumentContext {
    collection: CollectionContext,
    pk_part: Vec<u8>,
    pending: Mutex<Vec<PendingWrite>>,
}

impl StoreDocumentContext {
    pub fn primary_key_part(&self) -> &[u8] {
        &self.pk_part
    }

    async fn stored_value(&self) -> QueryResult<Option<Value>> {
        let key = self.collection.doc_key(&self.pk_part);
        match self.collection.transaction().get(&key).await? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| QueryError::Encoding(format!("bad document: {e}")))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

fn apply_writes(base: Option<Value>, writes: &[PendingWrite]) -> Option<Value> {
    let mut current = base;
    for write in writes {
        match write {
            PendingWrite::Set(path, value) => {
                let mut doc = current.take().unwrap_or(Value::Object(Default::default()));
                path_set(&mut doc, path, value.clone());
                current = Some(doc);
            }
            PendingWrite::Clear(path) => {
                if let Some(doc) = current.as_mut() {
                    path_remove(doc, path);
                }
            }
            PendingWrite::Replace(value) => {
                current = Some(value.clone());
            }
            PendingWrite::Delete => {
                current = None;
            }
        }
    }
    current
}

#[async_trait]
impl DocumentContext for StoreDocumentContext {
    async fn value(&self) -> QueryResult<Value> {
        let stored = self.stored_value().await?;
        let pending = self.pending.lock().clone();
        Ok(apply_writes(stored, &pending).unwrap_or(Value::Null))
    }

    async fn get(&self, path: &str) -> QueryResult<Option<Value>> {
        Ok(path_get(&self.value().await?, path).cloned())
    }

    fn set(&self, path: &str, value: Value) {
        self.pending
            .lock()
            .push(PendingWrite::Set(path.to_string(), value));
    }

    fn clear(&self, path: &str) {
        self.pending.lock().push(PendingWrite::Clear(path.to_string()));
    }

    fn replace(&self, value: Value) {
        self.pending.lock().push(PendingWrite::Replace(value));
    }

    fn delete(&self) {
        self.pending.lock().push(PendingWrite::Delete);
    }

    async fn commit_changes(&self) -> QueryResult<()> {
        let writes = std::mem::take(&mut *self.pending.lock());
        if writes.is_empty() {
            return Ok(());
        }
        let tx = self.collection.transaction().clone();
        let stored = self.stored_value().await?;
        let updated = apply_writes(stored.clone(), &writes);

        for index in self.collection.unbound().known_indexes() {
            let dir = self.collection.unbound().index_directory(index);
            let old_entries = stored
                .as_ref()
                .map(|doc| index.entries_for(doc, &self.pk_part))
                .unwrap_or_default();
            let new_entries = updated
                .as_ref()
                .map(|doc| index.entries_for(doc, &self.pk_part))
                .unwrap_or_default();
            for entry in &old_entries {
                if !new_entries.contains(entry) {
                    let mut key = dir.clone();
                    key.extend_from_slice(entry);
                    tx.clear(&key);
                }
            }
            for entry in &new_entries {
                let mut key = dir.clone();
                key.extend_from_slice(entry);
                tx.set(&key, b"");
            }
        }

        let doc_key = self.collection.doc_key(&self.pk_part);
        match updated {
            Some(value) => {
                let bytes = serde_json::to_vec(&value)
                    .map_err(|e| QueryError::Encoding(format!("bad document: {e}")))?;
                tx.set(&doc_key, &bytes);
            }
            None => tx.clear(&doc_key),
        }
        Ok(())
    }
}
