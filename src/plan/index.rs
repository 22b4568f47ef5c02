//! Index maintenance plans: create an index, update its status, and build
//! its entries from existing documents

use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::checkpoint::{deposit_split_bounds, stop_pair, PlanCheckpoint, StopToken};
use crate::document::{DocRef, DocumentContext};
use crate::encoding::decode_key_part;
use crate::error::{QueryError, QueryResult};
use crate::metadata::{IndexInfo, IndexStatus, MetadataManager, Namespace};
use crate::query::{InsertDocument, InsertOp, Predicate, ValueTest};
use crate::storage::Transaction;
use crate::stream::{stream_channel, StreamReceiver, StreamSender};

use super::{collect_documents, next_pending, FilterPlan, Pending, Plan, TableScanPlan};

/// Insert an index descriptor into the catalog
///
/// Creating an index whose key specification already exists reports
/// success with no output, matching the client-facing protocol; a name
/// collision with a different key specification is an error.
pub struct IndexInsertPlan {
    index_doc: Value,
    ns: Namespace,
    mm: Arc<MetadataManager>,
}

impl IndexInsertPlan {
    pub fn new(index_doc: Value, ns: Namespace, mm: Arc<MetadataManager>) -> Self {
        IndexInsertPlan { index_doc, ns, mm }
    }
}

impl Plan for IndexInsertPlan {
    fn execute(
        &self,
        checkpoint: &Arc<PlanCheckpoint>,
        tx: &Arc<dyn Transaction>,
    ) -> StreamReceiver<DocRef> {
        let (output, rx) = stream_channel();
        let (stop_handle, stop) = stop_pair();
        let task_checkpoint = checkpoint.clone();
        let tx = tx.clone();
        let index_doc = self.index_doc.clone();
        let ns = self.ns.clone();
        let mm = self.mm.clone();
        let task_output = output.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {}
                result = run_index_insert(task_checkpoint, tx, index_doc, ns, mm, task_output.clone()) => {
                    task_output.send_error(match result {
                        Ok(()) => QueryError::EndOfStream,
                        Err(e) => e,
                    });
                }
            }
        });
        checkpoint.add_operation(stop_handle, handle, output);
        rx
    }

    fn describe(&self) -> String {
        format!("index_insert({})", self.ns)
    }
}

async fn run_index_insert(
    checkpoint: Arc<PlanCheckpoint>,
    tx: Arc<dyn Transaction>,
    index_doc: Value,
    ns: Namespace,
    mm: Arc<MetadataManager>,
    output: StreamSender<DocRef>,
) -> QueryResult<()> {
    checkpoint.document_finished_lock().take(1).await;
    let target_cx = mm.get_unbound_collection_context(&tx, &ns).await?;
    let catalog_cx = mm.indexes_collection(&tx, &ns.db).await?;

    let list_plan = FilterPlan::construct(
        &catalog_cx,
        TableScanPlan::new(catalog_cx.clone()),
        Predicate::field("ns", ValueTest::Eq(json!(ns.to_string()))),
    );
    let existing = collect_documents(&list_plan, &tx).await?;
    match check_index_conflicts(&existing, &index_doc) {
        // The client-facing protocol treats re-creating an identical
        // index as success.
        Err(QueryError::IndexAlreadyExists) => return Ok(()),
        other => other?,
    }

    let inserted = InsertDocument::new(index_doc)
        .insert(&catalog_cx.bind(&tx))
        .await?;
    target_cx.bind(&tx).bump_metadata_version().await?;
    output.send(DocRef::unscanned(inserted));
    Ok(())
}

/// Reject an index document that collides with an existing descriptor
fn check_index_conflicts(existing: &[Value], index_doc: &Value) -> QueryResult<()> {
    for doc in existing {
        if doc.get("key") == index_doc.get("key") {
            return Err(QueryError::IndexAlreadyExists);
        }
        if doc.get("name") == index_doc.get("name") {
            return Err(QueryError::IndexNameTaken);
        }
    }
    Ok(())
}

/// Conditionally rewrite an index descriptor's status field
pub struct UpdateIndexStatusPlan {
    ns: Namespace,
    index_pk: Vec<u8>,
    new_status: IndexStatus,
    build_id: Option<Uuid>,
    mm: Arc<MetadataManager>,
}

impl UpdateIndexStatusPlan {
    pub fn new(
        ns: Namespace,
        index_pk: Vec<u8>,
        new_status: IndexStatus,
        build_id: Option<Uuid>,
        mm: Arc<MetadataManager>,
    ) -> Self {
        UpdateIndexStatusPlan {
            ns,
            index_pk,
            new_status,
            build_id,
            mm,
        }
    }
}

impl Plan for UpdateIndexStatusPlan {
    fn execute(
        &self,
        checkpoint: &Arc<PlanCheckpoint>,
        tx: &Arc<dyn Transaction>,
    ) -> StreamReceiver<DocRef> {
        let (output, rx) = stream_channel();
        let (stop_handle, stop) = stop_pair();
        let task_checkpoint = checkpoint.clone();
        let tx = tx.clone();
        let ns = self.ns.clone();
        let index_pk = self.index_pk.clone();
        let new_status = self.new_status;
        let build_id = self.build_id;
        let mm = self.mm.clone();
        let task_output = output.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {}
                result = run_update_index_status(
                    task_checkpoint,
                    tx,
                    ns,
                    index_pk,
                    new_status,
                    build_id,
                    mm,
                    task_output.clone(),
                ) => {
                    task_output.send_error(match result {
                        Ok(()) => QueryError::EndOfStream,
                        Err(e) => e,
                    });
                }
            }
        });
        checkpoint.add_operation(stop_handle, handle, output);
        rx
    }

    fn describe(&self) -> String {
        format!(
            "update_index_status({}, {})",
            self.ns,
            self.new_status.as_str()
        )
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_update_index_status(
    checkpoint: Arc<PlanCheckpoint>,
    tx: Arc<dyn Transaction>,
    ns: Namespace,
    index_pk: Vec<u8>,
    new_status: IndexStatus,
    build_id: Option<Uuid>,
    mm: Arc<MetadataManager>,
    output: StreamSender<DocRef>,
) -> QueryResult<()> {
    let catalog_cx = mm.indexes_collection(&tx, &ns.db).await?;
    let index_doc = catalog_cx.bind(&tx).doc_context(index_pk);
    let target = mm.get_unbound_collection_context(&tx, &ns).await?.bind(&tx);

    let okay = match build_id {
        Some(expected) => match index_doc.get("build id").await? {
            Some(Value::String(s)) => Uuid::parse_str(&s).ok() == Some(expected),
            _ => false,
        },
        None => true,
    };
    if !okay {
        return Err(QueryError::IndexWrongBuildId);
    }

    checkpoint.document_finished_lock().take(1).await;
    index_doc.set("status", json!(new_status.as_str()));
    index_doc.clear("currently processing document");
    index_doc.clear("build id");
    target.bump_metadata_version().await?;
    output.send(DocRef::unscanned(index_doc));
    Ok(())
}

/// Rebuild index entries for every document an inner scan produces
///
/// Rewriting the indexed field through the document context is enough for
/// compound indexes too: dirtying one component makes commit_changes
/// recompute the whole entry set.
pub struct BuildIndexPlan {
    scan: Arc<dyn Plan>,
    index: IndexInfo,
    db: String,
    index_pk: Vec<u8>,
    mm: Arc<MetadataManager>,
}

impl BuildIndexPlan {
    pub fn new(
        scan: Arc<dyn Plan>,
        index: IndexInfo,
        db: impl Into<String>,
        index_pk: Vec<u8>,
        mm: Arc<MetadataManager>,
    ) -> Self {
        BuildIndexPlan {
            scan,
            index,
            db: db.into(),
            index_pk,
            mm,
        }
    }
}

impl Plan for BuildIndexPlan {
    fn execute(
        &self,
        checkpoint: &Arc<PlanCheckpoint>,
        tx: &Arc<dyn Transaction>,
    ) -> StreamReceiver<DocRef> {
        let input = self.scan.execute(checkpoint, tx);
        let (resume_key, _) = checkpoint.bounds(0);
        let (output, rx) = stream_channel();
        let (stop_handle, stop) = stop_pair();
        let handle = tokio::spawn(scan_and_build_index(
            checkpoint.clone(),
            stop,
            tx.clone(),
            self.index.clone(),
            self.db.clone(),
            self.index_pk.clone(),
            self.mm.clone(),
            resume_key,
            input,
            output.clone(),
        ));
        checkpoint.add_operation(stop_handle, handle, output);
        rx
    }

    fn was_metadata_change_okay(&self, new_cx: &Arc<crate::metadata::UnboundCollectionContext>) -> bool {
        for index in new_cx.known_indexes() {
            if index.name == self.index.name
                && index.status == IndexStatus::Building
                && index.build_id == self.index.build_id
            {
                return self.scan.was_metadata_change_okay(new_cx);
            }
        }
        false
    }

    fn describe(&self) -> String {
        format!("build_index({}, {})", self.db, self.index.name)
    }
}

#[allow(clippy::too_many_arguments)]
async fn scan_and_build_index(
    checkpoint: Arc<PlanCheckpoint>,
    stop: StopToken,
    tx: Arc<dyn Transaction>,
    index: IndexInfo,
    db: String,
    index_pk: Vec<u8>,
    mm: Arc<MetadataManager>,
    resume_key: Vec<u8>,
    mut input: StreamReceiver<DocRef>,
    output: StreamSender<DocRef>,
) {
    // Record where a resumed build is picking up, so operators can report
    // progress on the index document.
    if !resume_key.is_empty() {
        if let Err(e) = write_progress_marker(&tx, &db, &index_pk, &mm, &resume_key).await {
            output.send_error(e);
            return;
        }
    }

    let mut pending: Pending<()> = Pending::new();
    let mut input_open = true;
    loop {
        if !input_open && pending.is_empty() {
            output.send_error(QueryError::EndOfStream);
            return;
        }
        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                super::deposit_channel_docs(&checkpoint, &mut input);
                deposit_split_bounds(&checkpoint, pending.iter().rev().map(|(doc, _)| doc));
                return;
            }
            next = input.next(), if input_open => match next {
                Ok(doc) => {
                    let fut_doc = doc.clone();
                    let fut_index = index.clone();
                    pending.push_back((
                        doc,
                        Box::pin(async move { build_index_entry(&fut_doc, &fut_index).await }),
                    ));
                }
                Err(QueryError::EndOfStream) => input_open = false,
                Err(e) => {
                    output.send_error(e);
                    return;
                }
            },
            built = next_pending(&mut pending), if !pending.is_empty() => {
                let Some((doc, _)) = pending.pop_front() else {
                    continue;
                };
                match built {
                    Ok(()) => {
                        if !output.send(doc) {
                            return;
                        }
                    }
                    Err(e) => {
                        output.send_error(e);
                        return;
                    }
                }
            }
        }
    }
}

async fn write_progress_marker(
    tx: &Arc<dyn Transaction>,
    db: &str,
    index_pk: &[u8],
    mm: &Arc<MetadataManager>,
    resume_key: &[u8],
) -> QueryResult<()> {
    let catalog_cx = mm.indexes_collection(tx, db).await?;
    let index_doc = catalog_cx.bind(tx).doc_context(index_pk.to_vec());
    // The resume key is an incremented primary key part and may not decode
    // back to a value.
    let marker = match decode_key_part(resume_key) {
        Ok((value, _)) => value.to_string(),
        Err(_) => "unknown".to_string(),
    };
    index_doc.set("currently processing document", json!(marker));
    index_doc.commit_changes().await
}

/// Re-write the indexed field so commit_changes regenerates the entry
async fn build_index_entry(doc: &DocRef, index: &IndexInfo) -> QueryResult<()> {
    let field = &index.keys[0].0;
    match doc.get(field).await? {
        Some(value) => doc.context().set(field, value),
        None => doc.context().clear(field),
    }
    Ok(())
}
