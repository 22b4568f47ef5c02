//! Document references and contexts
//!
//! A [`DocRef`] is the unit transiting every operator stream: an opaque
//! handle to a document plus the identity of the scan that produced it and
//! the monotonic scan key marking its position within that scan. Documents
//! created by mutation operators (inserts, projections) carry no scan
//! position.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::QueryResult;

/// Handle exposing read and deferred-write methods against a document
///
/// Writes (`set`/`clear`/`delete`) are buffered on the context and applied
/// by `commit_changes`, which also maintains secondary index entries for
/// store-backed documents.
#[async_trait]
pub trait DocumentContext: Send + Sync {
    /// The document's full current value, including uncommitted changes
    async fn value(&self) -> QueryResult<Value>;

    /// The value at a dot-separated field path, if present
    async fn get(&self, path: &str) -> QueryResult<Option<Value>>;

    /// Buffer a field write
    fn set(&self, path: &str, value: Value);

    /// Buffer a field removal
    fn clear(&self, path: &str);

    /// Buffer replacement of the whole document
    fn replace(&self, value: Value);

    /// Buffer deletion of the whole document
    fn delete(&self);

    /// Flush buffered writes through to the owning transaction
    async fn commit_changes(&self) -> QueryResult<()>;
}

/// A document reference produced by a scan or mutation operator
#[derive(Clone)]
pub struct DocRef {
    context: Arc<dyn DocumentContext>,
    scan_id: Option<usize>,
    scan_key: Vec<u8>,
}

impl DocRef {
    /// Wrap a context produced by the scan with the given id and key
    pub fn new(context: Arc<dyn DocumentContext>, scan_id: usize, scan_key: Vec<u8>) -> Self {
        DocRef {
            context,
            scan_id: Some(scan_id),
            scan_key,
        }
    }

    /// A document that did not originate from a scan
    pub fn unscanned(context: Arc<dyn DocumentContext>) -> Self {
        DocRef {
            context,
            scan_id: None,
            scan_key: Vec::new(),
        }
    }

    /// A free-standing document holding `value`, carrying the scan position
    /// of the document it was derived from (if any)
    pub fn synthetic(value: Value, scan_id: Option<usize>, scan_key: Vec<u8>) -> Self {
        DocRef {
            context: Arc::new(ValueContext::new(value)),
            scan_id,
            scan_key,
        }
    }

    /// Identity of the originating scan, if the document came from one
    pub fn scan_id(&self) -> Option<usize> {
        self.scan_id
    }

    /// Position of this document within its scan's ordering
    pub fn scan_key(&self) -> &[u8] {
        &self.scan_key
    }

    /// The underlying document context
    pub fn context(&self) -> &Arc<dyn DocumentContext> {
        &self.context
    }

    /// Read the document's full value
    pub async fn value(&self) -> QueryResult<Value> {
        self.context.value().await
    }

    /// Read one field
    pub async fn get(&self, path: &str) -> QueryResult<Option<Value>> {
        self.context.get(path).await
    }

    /// Flush this document's buffered writes
    pub async fn commit_changes(&self) -> QueryResult<()> {
        self.context.commit_changes().await
    }
}

impl std::fmt::Debug for DocRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocRef")
            .field("scan_id", &self.scan_id)
            .field("scan_key", &self.scan_key)
            .finish()
    }
}

/// Context over a free-standing value, used for projection results and other
/// documents with no storage backing
pub struct ValueContext {
    value: Mutex<Value>,
}

impl ValueContext {
    pub fn new(value: Value) -> Self {
        ValueContext {
            value: Mutex::new(value),
        }
    }
}

#[async_trait]
impl DocumentContext for ValueContext {
    async fn value(&self) -> QueryResult<Value> {
        Ok(self.value.lock().clone())
    }

    async fn get(&self, path: &str) -> QueryResult<Option<Value>> {
        Ok(path_get(&self.value.lock(), path).cloned())
    }

    fn set(&self, path: &str, value: Value) {
        path_set(&mut self.value.lock(), path, value);
    }

    fn clear(&self, path: &str) {
        path_remove(&mut self.value.lock(), path);
    }

    fn replace(&self, value: Value) {
        *self.value.lock() = value;
    }

    fn delete(&self) {
        *self.value.lock() = Value::Null;
    }

    async fn commit_changes(&self) -> QueryResult<()> {
        Ok(())
    }
}

/// Read the value at a dot-separated path, descending through objects only
pub fn path_get<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Write `new` at a dot-separated path, creating intermediate objects
pub fn path_set(value: &mut Value, path: &str, new: Value) {
    if !value.is_object() {
        *value = Value::Object(serde_json::Map::new());
    }
    let mut current = value;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        let Some(map) = current.as_object_mut() else {
            return;
        };
        if i + 1 == segments.len() {
            map.insert(segment.to_string(), new);
            return;
        }
        let entry = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(serde_json::Map::new());
        }
        current = entry;
    }
}

/// Remove the value at a dot-separated path, if present
pub fn path_remove(value: &mut Value, path: &str) {
    let mut current = value;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        let Some(map) = current.as_object_mut() else {
            return;
        };
        if i + 1 == segments.len() {
            map.remove(*segment);
            return;
        }
        match map.get_mut(*segment) {
            Some(next) => current = next,
            None => return,
        }
    }
}
