//! Collection metadata: namespaces, the index catalog, and collection
//! contexts
//!
//! Index descriptors live as ordinary documents in a per-database
//! `system.indexes` collection, keyed by index name. A collection's
//! metadata version is a counter under its metadata directory; schema and
//! index changes bump it, and non-isolated plans compare it across
//! transactions to detect races.

mod context;
mod index;

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::QueryResult;
use crate::storage::Transaction;

pub use context::{CollectionContext, StoreDocumentContext, UnboundCollectionContext};
pub use index::{IndexDirection, IndexInfo, IndexStatus};

/// The collection that holds index descriptors for a database
pub const INDEXES_COLLECTION: &str = "system.indexes";

/// A database/collection pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub db: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, collection: impl Into<String>) -> Self {
        Namespace {
            db: db.into(),
            collection: collection.into(),
        }
    }

    /// The index catalog namespace for `db`
    pub fn indexes(db: impl Into<String>) -> Self {
        Namespace::new(db, INDEXES_COLLECTION)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.collection)
    }
}

/// Reads collection metadata and builds collection contexts
pub struct MetadataManager;

impl MetadataManager {
    pub fn new() -> Arc<Self> {
        Arc::new(MetadataManager)
    }

    /// Build an unbound context for `ns`, loading its index catalog
    pub async fn get_unbound_collection_context(
        &self,
        tx: &Arc<dyn Transaction>,
        ns: &Namespace,
    ) -> QueryResult<Arc<UnboundCollectionContext>> {
        if ns.collection == INDEXES_COLLECTION {
            // The catalog does not index itself
            return Ok(Arc::new(UnboundCollectionContext::new(ns.clone(), Vec::new())));
        }
        let catalog = UnboundCollectionContext::new(Namespace::indexes(ns.db.clone()), Vec::new());
        let begin = catalog.collection_directory().to_vec();
        let mut end = begin.clone();
        end.push(0xff);
        let target = ns.to_string();
        let mut indexes = Vec::new();
        for kv in tx.get_range(&begin, &end).await? {
            let Ok(doc) = serde_json::from_slice::<Value>(&kv.value) else {
                continue;
            };
            if doc.get("ns").and_then(Value::as_str) != Some(target.as_str()) {
                continue;
            }
            if let Some(info) = IndexInfo::from_document(&doc) {
                indexes.push(info);
            }
        }
        Ok(Arc::new(UnboundCollectionContext::new(ns.clone(), indexes)))
    }

    /// Unbound context for the index catalog of `db`
    pub async fn indexes_collection(
        &self,
        tx: &Arc<dyn Transaction>,
        db: &str,
    ) -> QueryResult<Arc<UnboundCollectionContext>> {
        self.get_unbound_collection_context(tx, &Namespace::indexes(db))
            .await
    }

    /// Re-read the catalog for an existing context's namespace
    pub async fn refresh_unbound_collection_context(
        &self,
        cx: &Arc<UnboundCollectionContext>,
        tx: &Arc<dyn Transaction>,
    ) -> QueryResult<Arc<UnboundCollectionContext>> {
        self.get_unbound_collection_context(tx, cx.ns()).await
    }
}
