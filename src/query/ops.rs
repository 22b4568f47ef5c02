//! Document mutation operations
//!
//! Update and insert ops buffer their writes on document contexts; the
//! plan tree decides when those buffers flush (FlushChanges, the retry and
//! non-isolated wrappers, or find-and-modify).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::document::{DocRef, DocumentContext};
use crate::encoding::encode_key_part;
use crate::error::{QueryError, QueryResult};
use crate::metadata::CollectionContext;

/// Asynchronous mutation applied to one document
#[async_trait]
pub trait UpdateOp: Send + Sync {
    async fn update(&self, doc: &DocRef) -> QueryResult<()>;

    fn describe(&self) -> String;
}

/// Asynchronous creation of one document in a collection
#[async_trait]
pub trait InsertOp: Send + Sync {
    async fn insert(&self, cx: &CollectionContext) -> QueryResult<Arc<dyn DocumentContext>>;

    fn describe(&self) -> String;
}

/// Set the listed fields
pub struct SetFields {
    fields: Vec<(String, Value)>,
}

impl SetFields {
    pub fn new(fields: Vec<(String, Value)>) -> Arc<Self> {
        Arc::new(SetFields { fields })
    }
}

#[async_trait]
impl UpdateOp for SetFields {
    async fn update(&self, doc: &DocRef) -> QueryResult<()> {
        for (path, value) in &self.fields {
            doc.context().set(path, value.clone());
        }
        Ok(())
    }

    fn describe(&self) -> String {
        let paths: Vec<&str> = self.fields.iter().map(|(p, _)| p.as_str()).collect();
        format!("set({})", paths.join(", "))
    }
}

/// Remove the listed fields
pub struct UnsetFields {
    fields: Vec<String>,
}

impl UnsetFields {
    pub fn new(fields: Vec<String>) -> Arc<Self> {
        Arc::new(UnsetFields { fields })
    }
}

#[async_trait]
impl UpdateOp for UnsetFields {
    async fn update(&self, doc: &DocRef) -> QueryResult<()> {
        for path in &self.fields {
            doc.context().clear(path);
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("unset({})", self.fields.join(", "))
    }
}

/// Delete the document
pub struct DeleteDocument;

impl DeleteDocument {
    pub fn new() -> Arc<Self> {
        Arc::new(DeleteDocument)
    }
}

#[async_trait]
impl UpdateOp for DeleteDocument {
    async fn update(&self, doc: &DocRef) -> QueryResult<()> {
        doc.context().delete();
        Ok(())
    }

    fn describe(&self) -> String {
        "delete".to_string()
    }
}

/// Insert a document, generating an `_id` when the value lacks one
pub struct InsertDocument {
    value: Value,
}

impl InsertDocument {
    pub fn new(value: Value) -> Arc<Self> {
        Arc::new(InsertDocument { value })
    }
}

#[async_trait]
impl InsertOp for InsertDocument {
    async fn insert(&self, cx: &CollectionContext) -> QueryResult<Arc<dyn DocumentContext>> {
        let mut value = self.value.clone();
        if !value.is_object() {
            return Err(QueryError::UnsupportedOperation);
        }
        let id = match value.get("_id") {
            Some(id) => id.clone(),
            None => {
                let id = json!(Uuid::new_v4().to_string());
                value["_id"] = id.clone();
                id
            }
        };
        let context = cx.doc_context(encode_key_part(&id));
        context.replace(value);
        Ok(context)
    }

    fn describe(&self) -> String {
        "insert".to_string()
    }
}
