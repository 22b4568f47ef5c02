//! Plan trees and their streaming execution
//!
//! # The `Plan::execute` contract
//!
//! - The operator tasks implementing a plan are created synchronously
//!   (during the call to `execute`, without awaiting) and registered with
//!   [`PlanCheckpoint::add_operation`] in topological sort order. A plan
//!   may spawn additional short-lived futures to process individual
//!   documents, but the tasks operating on document streams must all be
//!   registered.
//! - `execute` calls `execute` on its subplans synchronously and in a
//!   consistent order, so that `add_scan` assigns ids reproducibly across
//!   re-executions.
//! - An operator with an input stream must always be awaiting that stream
//!   (racing it against other futures is fine); documents must never
//!   accumulate unobserved in a channel.
//! - Scan operators (those producing documents they do not receive from a
//!   subplan) must obtain a scan id with `add_scan`, stamp every output
//!   with that id and a monotonically increasing scan key below `0xff`,
//!   restrict themselves to `PlanCheckpoint::bounds`, and on cancellation
//!   with `split_bound_wanted` deposit a split key greater than the last
//!   document output and at most the next producible one.
//! - Operators that may emit documents later than they receive them must,
//!   on cancellation with `split_bound_wanted`, walk their pending
//!   documents in reverse output order and deposit each one's scan key.
//!   Because channels buffer (where the original cooperative model handed
//!   documents off synchronously), every document-consuming operator also
//!   drains its input channel's ready items on cancellation and deposits
//!   them, in reverse arrival order, before its own pending queue.
//! - Every operator takes one credit from the checkpoint's
//!   document-finished lock before emitting a document, and filtering
//!   operators release one credit per document they discard.

mod filter;
mod find_modify;
mod flush;
mod index;
mod non_isolated;
mod project;
mod retry;
mod scan;
mod skip;
mod sort;
mod union;
mod update;

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::checkpoint::{stop_pair, PlanCheckpoint};
use crate::document::DocRef;
use crate::error::{QueryError, QueryResult};
use crate::metadata::{MetadataManager, UnboundCollectionContext};
use crate::query::{DeleteDocument, Predicate};
use crate::storage::Transaction;
use crate::stream::{stream_channel, StreamReceiver};

pub use filter::FilterPlan;
pub use find_modify::{FindAndModifyPlan, ProjectAndUpdatePlan};
pub use flush::FlushChangesPlan;
pub use index::{BuildIndexPlan, IndexInsertPlan, UpdateIndexStatusPlan};
pub use non_isolated::NonIsolatedPlan;
pub use project::ProjectionPlan;
pub use retry::RetryPlan;
pub use scan::{IndexScanPlan, PrimaryKeyLookupPlan, TableScanPlan};
pub use skip::SkipPlan;
pub use sort::SortPlan;
pub use union::UnionPlan;
pub use update::{InsertPlan, UpdatePlan};

/// A node of a compiled query plan
pub trait Plan: Send + Sync {
    /// Wire up this plan's operators against `checkpoint` and return the
    /// stream of documents they will produce
    fn execute(
        &self,
        checkpoint: &Arc<PlanCheckpoint>,
        tx: &Arc<dyn Transaction>,
    ) -> StreamReceiver<DocRef>;

    /// Attempt to absorb `predicate` into this plan, returning the
    /// rewritten plan on success
    fn push_down(
        &self,
        cx: &Arc<UnboundCollectionContext>,
        predicate: &Predicate,
    ) -> Option<Arc<dyn Plan>> {
        let _ = (cx, predicate);
        None
    }

    /// Whether this plan can keep running after the collection's metadata
    /// version changed to the state described by `new_cx`
    fn was_metadata_change_okay(&self, new_cx: &Arc<UnboundCollectionContext>) -> bool {
        let _ = new_cx;
        true
    }

    /// Human-readable plan description for traces
    fn describe(&self) -> String;
}

/// A plan producing no documents
pub struct EmptyPlan;

impl EmptyPlan {
    pub fn new() -> Arc<Self> {
        Arc::new(EmptyPlan)
    }
}

impl Plan for EmptyPlan {
    fn execute(
        &self,
        checkpoint: &Arc<PlanCheckpoint>,
        _tx: &Arc<dyn Transaction>,
    ) -> StreamReceiver<DocRef> {
        let (output, rx) = stream_channel();
        let (stop_handle, _stop) = stop_pair();
        let task_output = output.clone();
        let handle = tokio::spawn(async move {
            task_output.send_error(QueryError::EndOfStream);
        });
        checkpoint.add_operation(stop_handle, handle, output);
        rx
    }

    fn describe(&self) -> String {
        "empty".to_string()
    }
}

/// A pending per-document future inside an operator
pub(crate) type DocFuture<T> = Pin<Box<dyn Future<Output = QueryResult<T>> + Send>>;

/// FIFO of documents whose per-document futures are still outstanding
pub(crate) type Pending<T> = VecDeque<(DocRef, DocFuture<T>)>;

/// Await the front of a pending queue; never resolves when it is empty,
/// so it can be raced against the operator's input stream
pub(crate) async fn next_pending<T>(pending: &mut Pending<T>) -> QueryResult<T> {
    match pending.front_mut() {
        Some((_, fut)) => fut.as_mut().await,
        None => std::future::pending().await,
    }
}

/// Like [`next_pending`] for queues without attached documents
pub(crate) type FutureQueue<T> = VecDeque<DocFuture<T>>;

pub(crate) async fn next_queued<T>(queue: &mut FutureQueue<T>) -> QueryResult<T> {
    match queue.front_mut() {
        Some(fut) => fut.as_mut().await,
        None => std::future::pending().await,
    }
}

/// Deposit split keys for documents still buffered in an input channel,
/// in reverse arrival order. Called from cancellation paths before the
/// operator deposits its own pending documents.
pub(crate) fn deposit_channel_docs(
    checkpoint: &PlanCheckpoint,
    input: &mut StreamReceiver<DocRef>,
) {
    if !checkpoint.split_bound_wanted() {
        return;
    }
    let mut buffered = Vec::new();
    while let Some(Ok(doc)) = input.try_next() {
        buffered.push(doc);
    }
    crate::checkpoint::deposit_split_bounds(checkpoint, buffered.iter().rev());
}

/// Compare the collection's metadata version in a fresh transaction with
/// the one recorded when a non-isolated plan started, failing if the
/// collection moved or the subplan cannot tolerate the change
pub(crate) async fn check_metadata_version(
    mm: &Arc<MetadataManager>,
    cx: &Arc<UnboundCollectionContext>,
    sub: &Arc<dyn Plan>,
    tx: &Arc<dyn Transaction>,
    current: &mut u64,
) -> QueryResult<()> {
    let new_version = cx.bind(tx).get_metadata_version().await?;
    if new_version != *current {
        let new_cx = mm.refresh_unbound_collection_context(cx, tx).await?;
        if new_cx.collection_directory() != cx.collection_directory()
            || new_cx.metadata_directory() != cx.metadata_directory()
        {
            return Err(QueryError::CollectionMetadataChanged);
        }
        if sub.was_metadata_change_okay(&new_cx) {
            *current = new_version;
        } else {
            return Err(QueryError::MetadataChangedNonIsolated);
        }
    }
    Ok(())
}

/// Run a plan to completion in one transaction, returning the number of
/// documents it produced
pub async fn execute_until_completion(
    plan: &Arc<dyn Plan>,
    tx: &Arc<dyn Transaction>,
) -> QueryResult<i64> {
    let (count, _) = execute_until_completion_and_return_last(plan, tx).await?;
    Ok(count)
}

/// Run a plan to completion, returning the count and the last document
pub async fn execute_until_completion_and_return_last(
    plan: &Arc<dyn Plan>,
    tx: &Arc<dyn Transaction>,
) -> QueryResult<(i64, Option<DocRef>)> {
    let checkpoint = PlanCheckpoint::new();
    let mut stream = plan.execute(&checkpoint, tx);
    let lock = checkpoint.document_finished_lock().clone();
    let mut count = 0;
    let mut last = None;
    let terminal = loop {
        match stream.next().await {
            Ok(doc) => {
                last = Some(doc);
                lock.release(1);
                count += 1;
            }
            Err(e) => break e,
        }
    };
    checkpoint.stop().await;
    match terminal {
        QueryError::EndOfStream => Ok((count, last)),
        other => Err(other),
    }
}

/// Run a plan to completion and collect the produced document values
pub async fn collect_documents(
    plan: &Arc<dyn Plan>,
    tx: &Arc<dyn Transaction>,
) -> QueryResult<Vec<Value>> {
    let checkpoint = PlanCheckpoint::new();
    let mut stream = plan.execute(&checkpoint, tx);
    let lock = checkpoint.document_finished_lock().clone();
    let mut values = Vec::new();
    let terminal = loop {
        match stream.next().await {
            Ok(doc) => match doc.value().await {
                Ok(value) => {
                    values.push(value);
                    lock.release(1);
                }
                Err(e) => break e,
            },
            Err(e) => break e,
        }
    };
    checkpoint.stop().await;
    match terminal {
        QueryError::EndOfStream => Ok(values),
        other => Err(other),
    }
}

/// Deletion expressed as an update plan with a delete op
pub fn delete_plan(
    sub: Arc<dyn Plan>,
    cx: Arc<UnboundCollectionContext>,
    limit: i64,
) -> Arc<dyn Plan> {
    Arc::new(UpdatePlan::new(sub, DeleteDocument::new(), None, limit, cx))
}

/// Wrap a plan so every document's buffered writes are committed before it
/// is emitted
pub fn flush_changes(sub: Arc<dyn Plan>) -> Arc<dyn Plan> {
    Arc::new(FlushChangesPlan::new(sub))
}
