//! Find-and-modify plans
//!
//! `ProjectAndUpdatePlan` takes at most one document from its subplan,
//! optionally projects the pre-image, applies the update (or upsert when
//! nothing arrived), commits the document's changes, optionally projects
//! the post-image, and emits the projection. `FindAndModifyPlan` wraps the
//! same semantics in a transaction family: the search for the first
//! document restarts across transactions, but the mutation happens in a
//! single transaction together with the read that found the document.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::sleep;

use crate::checkpoint::{deposit_split_bounds, or_stop, stop_pair, PlanCheckpoint, StopToken};
use crate::document::DocRef;
use crate::error::{QueryError, QueryResult};
use crate::knobs::Knobs;
use crate::metadata::{MetadataManager, UnboundCollectionContext};
use crate::query::{project_document, InsertOp, Projection, SortSpec, UpdateOp};
use crate::storage::{Database, Transaction};
use crate::stream::{stream_channel, StreamReceiver, StreamSender};

use super::{check_metadata_version, NonIsolatedPlan, Plan};

/// Shared configuration of the two find-and-modify shapes
struct ModifySpec {
    update_op: Arc<dyn UpdateOp>,
    upsert_op: Option<Arc<dyn InsertOp>>,
    projection: Arc<Projection>,
    ordering: Option<SortSpec>,
    project_new: bool,
    cx: Arc<UnboundCollectionContext>,
}

impl ModifySpec {
    async fn project(&self, doc: &DocRef) -> QueryResult<Value> {
        let value = doc.value().await?;
        Ok(project_document(
            &value,
            &self.projection,
            self.ordering.as_ref(),
        ))
    }
}

/// Update (or upsert) a single document and emit its projection
pub struct ProjectAndUpdatePlan {
    sub: Arc<dyn Plan>,
    spec: Arc<ModifySpec>,
}

impl ProjectAndUpdatePlan {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sub: Arc<dyn Plan>,
        update_op: Arc<dyn UpdateOp>,
        upsert_op: Option<Arc<dyn InsertOp>>,
        projection: Projection,
        ordering: Option<SortSpec>,
        project_new: bool,
        cx: Arc<UnboundCollectionContext>,
    ) -> Self {
        ProjectAndUpdatePlan {
            sub,
            spec: Arc::new(ModifySpec {
                update_op,
                upsert_op,
                projection: Arc::new(projection),
                ordering,
                project_new,
                cx,
            }),
        }
    }
}

impl Plan for ProjectAndUpdatePlan {
    fn execute(
        &self,
        checkpoint: &Arc<PlanCheckpoint>,
        tx: &Arc<dyn Transaction>,
    ) -> StreamReceiver<DocRef> {
        let input = self.sub.execute(checkpoint, tx);
        let (output, rx) = stream_channel();
        let (stop_handle, stop) = stop_pair();
        let handle = tokio::spawn(project_and_update(
            checkpoint.clone(),
            stop,
            tx.clone(),
            input,
            output.clone(),
            self.spec.clone(),
        ));
        checkpoint.add_operation(stop_handle, handle, output);
        rx
    }

    fn was_metadata_change_okay(&self, new_cx: &Arc<UnboundCollectionContext>) -> bool {
        self.sub.was_metadata_change_okay(new_cx)
    }

    fn describe(&self) -> String {
        format!("project_and_update({})", self.sub.describe())
    }
}

async fn project_and_update(
    checkpoint: Arc<PlanCheckpoint>,
    stop: StopToken,
    tx: Arc<dyn Transaction>,
    mut input: StreamReceiver<DocRef>,
    output: StreamSender<DocRef>,
    spec: Arc<ModifySpec>,
) {
    let lock = checkpoint.document_finished_lock().clone();
    let mut first_doc: Option<DocRef> = None;
    let mut any = false;

    // Deposits the held document's position when cancelled before the
    // projection is emitted.
    macro_rules! run {
        ($fut:expr) => {
            match or_stop(&stop, $fut).await {
                Some(Ok(v)) => v,
                Some(Err(e)) => {
                    output.send_error(e);
                    return;
                }
                None => {
                    if any {
                        if let Some(doc) = &first_doc {
                            deposit_split_bounds(&checkpoint, [doc]);
                        }
                    }
                    return;
                }
            }
        };
    }

    match or_stop(&stop, input.next()).await {
        Some(Ok(doc)) => {
            first_doc = Some(doc);
            any = true;
        }
        Some(Err(QueryError::EndOfStream)) => {}
        Some(Err(e)) => {
            output.send_error(e);
            return;
        }
        None => return,
    }

    let mut projected = Value::Null;
    if !spec.project_new && any {
        if let Some(doc) = first_doc.clone() {
            projected = run!(spec.project(&doc));
        }
    }

    if any {
        if let Some(doc) = first_doc.clone() {
            run!(spec.update_op.update(&doc));
        }
    } else if let Some(upsert) = &spec.upsert_op {
        // Nothing is held yet, so cancellation here deposits no bounds.
        if or_stop(&stop, lock.take(1)).await.is_none() {
            return;
        }
        let collection = spec.cx.bind(&tx);
        let context = run!(upsert.insert(&collection));
        first_doc = Some(DocRef::unscanned(context));
    }

    let upserting = spec.upsert_op.is_some();
    if any || upserting {
        if let Some(doc) = first_doc.clone() {
            run!(doc.commit_changes());
        }
    }

    if spec.project_new && (any || upserting) {
        if let Some(doc) = first_doc.clone() {
            projected = run!(spec.project(&doc));
        }
    }

    if any || (spec.project_new && upserting) {
        if let Some(doc) = first_doc {
            output.send(DocRef::synthetic(
                projected,
                doc.scan_id(),
                doc.scan_key().to_vec(),
            ));
        }
    }
    output.send_error(QueryError::EndOfStream);
}

/// Find one document across transactions, then mutate it transactionally
pub struct FindAndModifyPlan {
    sub: Arc<dyn Plan>,
    spec: Arc<ModifySpec>,
    database: Arc<dyn Database>,
    mm: Arc<MetadataManager>,
    knobs: Arc<Knobs>,
}

impl FindAndModifyPlan {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sub: Arc<dyn Plan>,
        update_op: Arc<dyn UpdateOp>,
        upsert_op: Option<Arc<dyn InsertOp>>,
        projection: Projection,
        ordering: Option<SortSpec>,
        project_new: bool,
        cx: Arc<UnboundCollectionContext>,
        database: Arc<dyn Database>,
        mm: Arc<MetadataManager>,
        knobs: Arc<Knobs>,
    ) -> Self {
        FindAndModifyPlan {
            sub,
            spec: Arc::new(ModifySpec {
                update_op,
                upsert_op,
                projection: Arc::new(projection),
                ordering,
                project_new,
                cx,
            }),
            database,
            mm,
            knobs,
        }
    }
}

impl Plan for FindAndModifyPlan {
    fn execute(
        &self,
        checkpoint: &Arc<PlanCheckpoint>,
        tx: &Arc<dyn Transaction>,
    ) -> StreamReceiver<DocRef> {
        let (output, rx) = stream_channel();
        let (stop_handle, stop) = stop_pair();
        let slot = Arc::new(Mutex::new(PlanCheckpoint::with_permits(
            self.knobs.flow_control_lock_permits,
        )));
        let outer = checkpoint.clone();
        let sub = self.sub.clone();
        let spec = self.spec.clone();
        let database = self.database.clone();
        let mm = self.mm.clone();
        let knobs = self.knobs.clone();
        let tx = tx.clone();
        let task_output = output.clone();
        let task_slot = slot.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    let inner = task_slot.lock().clone();
                    inner.stop().await;
                }
                result = run_find_and_modify(
                    task_slot.clone(),
                    outer,
                    sub,
                    spec,
                    database,
                    mm,
                    knobs,
                    tx,
                    task_output.clone(),
                ) => {
                    let inner = task_slot.lock().clone();
                    inner.stop().await;
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

    fn was_metadata_change_okay(&self, new_cx: &Arc<UnboundCollectionContext>) -> bool {
        self.sub.was_metadata_change_okay(new_cx)
    }

    fn describe(&self) -> String {
        format!("find_and_modify({})", self.sub.describe())
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_find_and_modify(
    slot: Arc<Mutex<Arc<PlanCheckpoint>>>,
    outer: Arc<PlanCheckpoint>,
    sub: Arc<dyn Plan>,
    spec: Arc<ModifySpec>,
    database: Arc<dyn Database>,
    mm: Arc<MetadataManager>,
    knobs: Arc<Knobs>,
    mut tx: Arc<dyn Transaction>,
    output: StreamSender<DocRef>,
) -> QueryResult<()> {
    let outer_lock = outer.document_finished_lock().clone();
    let mut inner = slot.lock().clone();
    let mut metadata_version = spec.cx.bind(&tx).get_metadata_version().await?;

    // Search rounds: restart the subplan in fresh transactions until a
    // document arrives or the stream ends.
    let mut first_doc: Option<DocRef> = None;
    let mut any = false;
    loop {
        let mut docs = sub.execute(&inner, &tx);
        let inner_lock = inner.document_finished_lock().clone();
        let mut timeout = Box::pin(sleep(knobs.find_and_modify_round_timeout));
        let mut done = false;
        tokio::select! {
            next = docs.next() => match next {
                Ok(doc) => {
                    inner_lock.release(1);
                    first_doc = Some(doc);
                    any = true;
                    done = true;
                }
                Err(QueryError::EndOfStream) => done = true,
                Err(e) => return Err(e),
            },
            _ = &mut timeout => {}
        }
        if !done {
            // The round timed out; check whether a document or a terminal
            // slipped into the stream before stopping the attempt.
            match docs.try_next() {
                Some(Ok(doc)) => {
                    inner_lock.release(1);
                    first_doc = Some(doc);
                    any = true;
                    done = true;
                }
                Some(Err(QueryError::EndOfStream)) => done = true,
                Some(Err(e)) => return Err(e),
                None => {}
            }
        }
        if done {
            break;
        }

        let next_checkpoint = inner.stop_and_checkpoint().await;
        *slot.lock() = next_checkpoint.clone();
        inner = next_checkpoint;
        tx = NonIsolatedPlan::new_transaction(&database, &knobs);
        check_metadata_version(&mm, &spec.cx, &sub, &tx, &mut metadata_version).await?;
    }

    // Everything from here happens in the transaction that found the
    // document. Discard any ongoing subplan work first.
    inner.stop().await;

    let mut projected = Value::Null;
    if !spec.project_new && any {
        if let Some(doc) = first_doc.clone() {
            projected = spec.project(&doc).await?;
        }
    }

    if any {
        if let Some(doc) = first_doc.clone() {
            spec.update_op.update(&doc).await?;
        }
    } else if let Some(upsert) = &spec.upsert_op {
        let collection = spec.cx.bind(&tx);
        let context = upsert.insert(&collection).await?;
        first_doc = Some(DocRef::unscanned(context));
    }

    let upserting = spec.upsert_op.is_some();
    if any || upserting {
        if let Some(doc) = first_doc.clone() {
            doc.commit_changes().await?;
        }
    }

    if spec.project_new && (any || upserting) {
        if let Some(doc) = first_doc.clone() {
            projected = spec.project(&doc).await?;
        }
    }

    tx.commit().await?;

    if any || (spec.project_new && upserting) {
        if let Some(doc) = first_doc {
            outer_lock.take(1).await;
            output.send(DocRef::synthetic(
                projected,
                doc.scan_id(),
                doc.scan_key().to_vec(),
            ));
        }
    }
    Ok(())
}
