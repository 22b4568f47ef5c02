//! Update and insert plans
//!
//! Update applies a mutation op to each input document up to a limit,
//! keeping the applied count in checkpoint int state so a resumed
//! execution honors the remaining budget. If no document arrived and an
//! upsert op is present, it inserts instead. Insert fans a batch of
//! insert ops against one collection, admitting one op per flow-control
//! credit.

use std::sync::Arc;

use crate::checkpoint::{deposit_split_bounds, or_stop, stop_pair, IntState, PlanCheckpoint, StopToken};
use crate::document::DocRef;
use crate::error::QueryError;
use crate::metadata::{CollectionContext, MetadataManager, Namespace, UnboundCollectionContext};
use crate::query::{InsertOp, UpdateOp};
use crate::storage::Transaction;
use crate::stream::{stream_channel, StreamReceiver, StreamSender};

use super::{next_pending, next_queued, FutureQueue, Pending, Plan};

/// Apply an update op to each input document, upserting when none arrive
pub struct UpdatePlan {
    sub: Arc<dyn Plan>,
    update_op: Arc<dyn UpdateOp>,
    upsert_op: Option<Arc<dyn InsertOp>>,
    limit: i64,
    cx: Arc<UnboundCollectionContext>,
}

impl UpdatePlan {
    pub fn new(
        sub: Arc<dyn Plan>,
        update_op: Arc<dyn UpdateOp>,
        upsert_op: Option<Arc<dyn InsertOp>>,
        limit: i64,
        cx: Arc<UnboundCollectionContext>,
    ) -> Self {
        UpdatePlan {
            sub,
            update_op,
            upsert_op,
            limit,
            cx,
        }
    }
}

impl Plan for UpdatePlan {
    fn execute(
        &self,
        checkpoint: &Arc<PlanCheckpoint>,
        tx: &Arc<dyn Transaction>,
    ) -> StreamReceiver<DocRef> {
        let input = self.sub.execute(checkpoint, tx);
        let count = checkpoint.int_state(0);
        let collection = self.cx.bind(tx);
        let (output, rx) = stream_channel();
        let (stop_handle, stop) = stop_pair();
        let handle = tokio::spawn(do_update(
            checkpoint.clone(),
            stop,
            input,
            output.clone(),
            self.update_op.clone(),
            self.upsert_op.clone(),
            self.limit,
            count,
            collection,
        ));
        checkpoint.add_operation(stop_handle, handle, output);
        rx
    }

    fn was_metadata_change_okay(&self, new_cx: &Arc<UnboundCollectionContext>) -> bool {
        self.sub.was_metadata_change_okay(new_cx)
    }

    fn describe(&self) -> String {
        format!(
            "update({}, {}, limit={})",
            self.sub.describe(),
            self.update_op.describe(),
            self.limit
        )
    }
}

#[allow(clippy::too_many_arguments)]
async fn do_update(
    checkpoint: Arc<PlanCheckpoint>,
    stop: StopToken,
    mut input: StreamReceiver<DocRef>,
    output: StreamSender<DocRef>,
    update_op: Arc<dyn UpdateOp>,
    upsert_op: Option<Arc<dyn InsertOp>>,
    limit: i64,
    count: IntState,
    collection: CollectionContext,
) {
    let lock = checkpoint.document_finished_lock().clone();
    let mut pending: Pending<()> = Pending::new();
    let mut input_open = true;
    loop {
        if !input_open && pending.is_empty() {
            break;
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
                    let fut_op = update_op.clone();
                    let fut_doc = doc.clone();
                    pending.push_back((
                        doc,
                        Box::pin(async move { fut_op.update(&fut_doc).await }),
                    ));
                    if count.add(1) >= limit {
                        input_open = false;
                    }
                }
                Err(QueryError::EndOfStream) => input_open = false,
                Err(e) => {
                    output.send_error(e);
                    return;
                }
            },
            updated = next_pending(&mut pending), if !pending.is_empty() => {
                let Some((doc, _)) = pending.pop_front() else {
                    continue;
                };
                match updated {
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

    if let Some(upsert) = upsert_op {
        if count.get() == 0 {
            if or_stop(&stop, lock.take(1)).await.is_none() {
                return;
            }
            match or_stop(&stop, upsert.insert(&collection)).await {
                None => return,
                Some(Ok(context)) => {
                    if !output.send(DocRef::unscanned(context)) {
                        return;
                    }
                }
                Some(Err(e)) => {
                    output.send_error(e);
                    return;
                }
            }
        }
    }

    output.send_error(QueryError::EndOfStream);
}

/// Insert a batch of documents into one collection
pub struct InsertPlan {
    inserts: Vec<Arc<dyn InsertOp>>,
    ns: Namespace,
    mm: Arc<MetadataManager>,
}

impl InsertPlan {
    pub fn new(inserts: Vec<Arc<dyn InsertOp>>, ns: Namespace, mm: Arc<MetadataManager>) -> Self {
        InsertPlan { inserts, ns, mm }
    }
}

impl Plan for InsertPlan {
    fn execute(
        &self,
        checkpoint: &Arc<PlanCheckpoint>,
        tx: &Arc<dyn Transaction>,
    ) -> StreamReceiver<DocRef> {
        let (output, rx) = stream_channel();
        let (stop_handle, stop) = stop_pair();
        let handle = tokio::spawn(do_insert(
            checkpoint.clone(),
            stop,
            tx.clone(),
            self.inserts.clone(),
            self.ns.clone(),
            self.mm.clone(),
            output.clone(),
        ));
        checkpoint.add_operation(stop_handle, handle, output);
        rx
    }

    fn describe(&self) -> String {
        format!("insert({}, {} docs)", self.ns, self.inserts.len())
    }
}

async fn do_insert(
    checkpoint: Arc<PlanCheckpoint>,
    stop: StopToken,
    tx: Arc<dyn Transaction>,
    inserts: Vec<Arc<dyn InsertOp>>,
    ns: Namespace,
    mm: Arc<MetadataManager>,
    output: StreamSender<DocRef>,
) {
    let lock = checkpoint.document_finished_lock().clone();
    let unbound = match or_stop(&stop, mm.get_unbound_collection_context(&tx, &ns)).await {
        None => return,
        Some(Ok(unbound)) => unbound,
        Some(Err(e)) => {
            output.send_error(e);
            return;
        }
    };
    let collection = unbound.bind(&tx);

    let mut queue: FutureQueue<Arc<dyn crate::document::DocumentContext>> = FutureQueue::new();
    let mut started = 0;
    loop {
        if started >= inserts.len() && queue.is_empty() {
            break;
        }
        tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            _ = lock.take(1), if started < inserts.len() => {
                let fut_op = inserts[started].clone();
                let fut_collection = collection.clone();
                queue.push_back(Box::pin(async move {
                    fut_op.insert(&fut_collection).await
                }));
                started += 1;
            }
            inserted = next_queued(&mut queue), if !queue.is_empty() => {
                queue.pop_front();
                match inserted {
                    Ok(context) => {
                        if !output.send(DocRef::unscanned(context)) {
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
    output.send_error(QueryError::EndOfStream);
}
