//! Non-isolated wrapper plans
//!
//! Re-execute a subplan across a family of transactions so a long
//! operation is not killed by the store's per-transaction deadline. Each
//! round runs the subplan in a child checkpoint until a timeout fires,
//! then stops-and-checkpoints it, opens a fresh transaction, verifies the
//! collection's metadata version, and resumes from the recorded split
//! keys. The read-write variant commits every document's buffered writes
//! and the transaction itself before emitting anything from that round.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::sleep;

use crate::checkpoint::{stop_pair, PlanCheckpoint};
use crate::document::DocRef;
use crate::error::{QueryError, QueryResult};
use crate::knobs::Knobs;
use crate::metadata::{MetadataManager, UnboundCollectionContext};
use crate::storage::{Database, Transaction, TxOption};
use crate::stream::{stream_channel, FlowControlLock, StreamReceiver, StreamSender};

use super::{check_metadata_version, next_pending, Pending, Plan};

type CheckpointSlot = Arc<Mutex<Arc<PlanCheckpoint>>>;

/// Execute a subplan across multiple transactions
pub struct NonIsolatedPlan {
    sub: Arc<dyn Plan>,
    read_only: bool,
    cx: Arc<UnboundCollectionContext>,
    database: Arc<dyn Database>,
    mm: Arc<MetadataManager>,
    knobs: Arc<Knobs>,
}

impl NonIsolatedPlan {
    pub fn read_only(
        sub: Arc<dyn Plan>,
        cx: Arc<UnboundCollectionContext>,
        database: Arc<dyn Database>,
        mm: Arc<MetadataManager>,
        knobs: Arc<Knobs>,
    ) -> Self {
        NonIsolatedPlan {
            sub,
            read_only: true,
            cx,
            database,
            mm,
            knobs,
        }
    }

    pub fn read_write(
        sub: Arc<dyn Plan>,
        cx: Arc<UnboundCollectionContext>,
        database: Arc<dyn Database>,
        mm: Arc<MetadataManager>,
        knobs: Arc<Knobs>,
    ) -> Self {
        NonIsolatedPlan {
            sub,
            read_only: false,
            cx,
            database,
            mm,
            knobs,
        }
    }

    /// A fresh transaction configured the way wrapper rounds need
    pub(crate) fn new_transaction(
        database: &Arc<dyn Database>,
        knobs: &Knobs,
    ) -> Arc<dyn Transaction> {
        let tx = database.create_transaction();
        tx.set_option(TxOption::Timeout(knobs.transaction_timeout));
        tx.set_option(TxOption::CausalReadRisky);
        tx
    }
}

impl Plan for NonIsolatedPlan {
    fn execute(
        &self,
        checkpoint: &Arc<PlanCheckpoint>,
        tx: &Arc<dyn Transaction>,
    ) -> StreamReceiver<DocRef> {
        let (output, rx) = stream_channel();
        let (stop_handle, stop) = stop_pair();
        let slot: CheckpointSlot = Arc::new(Mutex::new(PlanCheckpoint::with_permits(
            self.knobs.flow_control_lock_permits,
        )));
        let args = RoundArgs {
            slot: slot.clone(),
            outer_lock: checkpoint.document_finished_lock().clone(),
            output: output.clone(),
            sub: self.sub.clone(),
            cx: self.cx.clone(),
            database: self.database.clone(),
            mm: self.mm.clone(),
            knobs: self.knobs.clone(),
        };
        let read_only = self.read_only;
        let tx = tx.clone();
        let task_output = output.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    let inner = slot.lock().clone();
                    inner.stop().await;
                }
                terminal = async {
                    let result = if read_only {
                        run_read_only(&args, tx).await
                    } else {
                        run_read_write(&args, tx).await
                    };
                    match result {
                        Err(e) => e,
                        Ok(()) => QueryError::Internal(
                            "non-isolated loop ended without a terminal".to_string(),
                        ),
                    }
                } => {
                    let inner = slot.lock().clone();
                    inner.stop().await;
                    task_output.send_error(terminal);
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
        let mode = if self.read_only { "ro" } else { "rw" };
        format!("non_isolated_{}({})", mode, self.sub.describe())
    }
}

struct RoundArgs {
    slot: CheckpointSlot,
    outer_lock: Arc<FlowControlLock>,
    output: StreamSender<DocRef>,
    sub: Arc<dyn Plan>,
    cx: Arc<UnboundCollectionContext>,
    database: Arc<dyn Database>,
    mm: Arc<MetadataManager>,
    knobs: Arc<Knobs>,
}

async fn run_read_only(args: &RoundArgs, mut tx: Arc<dyn Transaction>) -> QueryResult<()> {
    let mut inner = args.slot.lock().clone();
    let mut transactions: u64 = 0;
    let mut results: u64 = 0;
    let mut metadata_version = args.cx.bind(&tx).get_metadata_version().await?;
    loop {
        let mut docs = args.sub.execute(&inner, &tx);
        let inner_lock = inner.document_finished_lock().clone();
        let mut first = true;
        let mut timeout = Box::pin(sleep(args.knobs.nonisolated_first_response_timeout));
        loop {
            tokio::select! {
                next = docs.next() => match next {
                    Ok(doc) => {
                        args.outer_lock.take(1).await;
                        inner_lock.release(1);
                        if !args.output.send(doc) {
                            return Err(QueryError::OperationCancelled);
                        }
                        results += 1;
                        if first {
                            timeout =
                                Box::pin(sleep(args.knobs.nonisolated_internal_timeout));
                            first = false;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(
                            transactions,
                            results,
                            error = %e,
                            "non-isolated read finished"
                        );
                        return Err(e);
                    }
                },
                _ = &mut timeout => break,
            }
        }

        let next_checkpoint = inner.stop_and_checkpoint().await;
        // Forward documents the subplan had already emitted when it was
        // stopped; the recorded split keys account for them. A terminal
        // error the subplan hit before the stop still surfaces.
        while let Some(item) = docs.try_next() {
            match item {
                Ok(doc) => {
                    args.outer_lock.take(1).await;
                    if !args.output.send(doc) {
                        return Err(QueryError::OperationCancelled);
                    }
                    results += 1;
                }
                Err(QueryError::EndOfStream) | Err(QueryError::OperationCancelled) => break,
                Err(e) => return Err(e),
            }
        }
        *args.slot.lock() = next_checkpoint.clone();
        inner = next_checkpoint;

        tx = NonIsolatedPlan::new_transaction(&args.database, &args.knobs);
        check_metadata_version(&args.mm, &args.cx, &args.sub, &tx, &mut metadata_version).await?;
        transactions += 1;
    }
}

async fn run_read_write(args: &RoundArgs, mut tx: Arc<dyn Transaction>) -> QueryResult<()> {
    let mut inner = args.slot.lock().clone();
    let mut metadata_version = args.cx.bind(&tx).get_metadata_version().await?;
    loop {
        match read_write_round(args, &mut inner, &tx).await {
            Ok(true) => return Err(QueryError::EndOfStream),
            Ok(false) => {}
            Err(e) => {
                tx.on_error(e).await?;
                // Reset operator and scan allocation before re-executing
                // against the same bounds.
                inner.stop().await;
            }
        }
        tx = NonIsolatedPlan::new_transaction(&args.database, &args.knobs);
        check_metadata_version(&args.mm, &args.cx, &args.sub, &tx, &mut metadata_version).await?;
    }
}

/// One read-write round: collect and commit documents until the timeout
/// or buffer ceiling, commit the transaction, then emit. Returns whether
/// the subplan finished.
async fn read_write_round(
    args: &RoundArgs,
    inner: &mut Arc<PlanCheckpoint>,
    tx: &Arc<dyn Transaction>,
) -> QueryResult<bool> {
    let mut docs = args.sub.execute(inner, tx);
    let inner_lock = inner.document_finished_lock().clone();
    let mut committing: Pending<()> = Pending::new();
    let mut buffered: VecDeque<DocRef> = VecDeque::new();
    let mut first = true;
    let mut finished = false;
    let mut timeout = Box::pin(sleep(args.knobs.nonisolated_first_response_timeout));
    loop {
        // The ceiling bounds memory and forces a checkpoint swap; breaking
        // here keeps the subplan's operators off our call path when they
        // are cancelled below.
        if committing.len() + buffered.len() >= args.knobs.nonisolated_rw_internal_buffer_max {
            break;
        }
        tokio::select! {
            next = docs.next() => match next {
                Ok(doc) => {
                    let fut_doc = doc.clone();
                    committing.push_back((
                        doc,
                        Box::pin(async move { fut_doc.commit_changes().await }),
                    ));
                    if first {
                        timeout = Box::pin(sleep(args.knobs.nonisolated_internal_timeout));
                        first = false;
                    }
                }
                Err(QueryError::EndOfStream) => {
                    finished = true;
                    break;
                }
                Err(e) => return Err(e),
            },
            committed = next_pending(&mut committing), if !committing.is_empty() => {
                committed?;
                if let Some((doc, _)) = committing.pop_front() {
                    buffered.push_back(doc);
                    inner_lock.release(1);
                }
            }
            _ = &mut timeout => break,
        }
    }

    // Cancel all ongoing work in the lower levels of the plan. Documents
    // that never reached the commit queue wait for the next transaction.
    let next_checkpoint = inner.stop_and_checkpoint().await;

    // Adopt documents the subplan had already emitted when it was stopped.
    // A terminal error it hit before the stop fails the round instead of
    // being committed over.
    while let Some(item) = docs.try_next() {
        match item {
            Ok(doc) => {
                let fut_doc = doc.clone();
                committing.push_back((
                    doc,
                    Box::pin(async move { fut_doc.commit_changes().await }),
                ));
            }
            Err(QueryError::EndOfStream) | Err(QueryError::OperationCancelled) => break,
            Err(e) => return Err(e),
        }
    }

    // These must finish before index reads are cancelled: the documents
    // they belong to count as committed.
    while let Some((doc, mut fut)) = committing.pop_front() {
        fut.as_mut().await?;
        buffered.push_back(doc);
    }

    // Buffered mutations have not reached the store yet, so the indexes
    // are consistent when these reads are abandoned.
    tx.cancel_ongoing_index_reads();
    tx.commit().await?;

    // Commit succeeded; the next round picks up after this one's split.
    *inner = next_checkpoint.clone();
    *args.slot.lock() = next_checkpoint;

    while let Some(doc) = buffered.pop_front() {
        args.outer_lock.take(1).await;
        if !args.output.send(doc) {
            return Err(QueryError::OperationCancelled);
        }
    }
    Ok(finished)
}
