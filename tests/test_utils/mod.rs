//! Shared fixtures for integration tests
#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{json, Value};

use burrowdb::knobs::Knobs;
use burrowdb::metadata::{
    IndexDirection, IndexInfo, MetadataManager, Namespace, UnboundCollectionContext,
};
use burrowdb::query::InsertDocument;
use burrowdb::query::InsertOp;
use burrowdb::storage::{Database, MemoryDatabase, Transaction};

/// An in-memory database plus the collaborators plans need
pub struct TestDb {
    pub db: Arc<MemoryDatabase>,
    pub mm: Arc<MetadataManager>,
    pub knobs: Arc<Knobs>,
}

pub fn setup() -> TestDb {
    TestDb {
        db: MemoryDatabase::new(),
        mm: MetadataManager::new(),
        knobs: Arc::new(Knobs::default()),
    }
}

impl TestDb {
    pub fn transaction(&self) -> Arc<dyn Transaction> {
        self.db.create_transaction()
    }

    /// Load the current unbound context for a namespace
    pub async fn collection(&self, ns: &Namespace) -> Arc<UnboundCollectionContext> {
        let tx = self.transaction();
        self.mm
            .get_unbound_collection_context(&tx, ns)
            .await
            .unwrap()
    }

    /// Insert documents directly, maintaining entries for the indexes the
    /// given context knows about
    pub async fn insert_docs(&self, cx: &Arc<UnboundCollectionContext>, docs: Vec<Value>) {
        let tx = self.transaction();
        let bound = cx.bind(&tx);
        for value in docs {
            let context = InsertDocument::new(value).insert(&bound).await.unwrap();
            context.commit_changes().await.unwrap();
        }
        tx.commit().await.unwrap();
    }

    /// Write a ready index into the catalog and bump the collection's
    /// metadata version
    pub async fn create_ready_index(&self, ns: &Namespace, name: &str, fields: &[&str]) {
        let index = IndexInfo::new(
            name,
            fields
                .iter()
                .map(|f| (f.to_string(), IndexDirection::Ascending))
                .collect(),
        );
        let tx = self.transaction();
        let catalog = self.mm.indexes_collection(&tx, &ns.db).await.unwrap();
        let context = InsertDocument::new(index.to_document(ns))
            .insert(&catalog.bind(&tx))
            .await
            .unwrap();
        context.commit_changes().await.unwrap();
        let target = self
            .mm
            .get_unbound_collection_context(&tx, ns)
            .await
            .unwrap();
        target.bind(&tx).bump_metadata_version().await.unwrap();
        tx.commit().await.unwrap();
    }
}

/// The `_id` fields of a value list
pub fn ids_of(values: &[Value]) -> Vec<Value> {
    values.iter().map(|v| v["_id"].clone()).collect()
}

/// Documents `{_id: "0000"..., n: i}` with zero-padded string ids, so the
/// primary-key order matches the numeric order
pub fn numbered_docs(count: usize) -> Vec<Value> {
    (0..count)
        .map(|i| json!({"_id": format!("{i:04}"), "n": i}))
        .collect()
}
