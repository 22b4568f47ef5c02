//! Retry wrapper plan
//!
//! Runs a subplan inside a single transaction, committing document changes
//! as they arrive and the transaction at end-of-stream. Recoverable errors
//! restart the whole attempt in a fresh transaction via the transaction's
//! retry policy; `commit_unknown_result` surfaces immediately because the
//! caller must decide what an unknown outcome means.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::checkpoint::{stop_pair, PlanCheckpoint};
use crate::document::DocRef;
use crate::error::{QueryError, QueryResult};
use crate::knobs::Knobs;
use crate::storage::{Database, Transaction, TxOption};
use crate::stream::{stream_channel, FlowControlLock, StreamReceiver, StreamSender};

use super::{next_pending, Pending, Plan};

/// Execute a subplan transactionally with retries
pub struct RetryPlan {
    sub: Arc<dyn Plan>,
    database: Arc<dyn Database>,
    knobs: Arc<Knobs>,
}

impl RetryPlan {
    pub fn new(sub: Arc<dyn Plan>, database: Arc<dyn Database>, knobs: Arc<Knobs>) -> Self {
        RetryPlan {
            sub,
            database,
            knobs,
        }
    }

    fn new_transaction(database: &Arc<dyn Database>, knobs: &Knobs) -> Arc<dyn Transaction> {
        let tx = database.create_transaction();
        tx.set_option(TxOption::CausalReadRisky);
        tx.set_option(TxOption::RetryLimit(knobs.transaction_retry_limit));
        tx.set_option(TxOption::Timeout(knobs.transaction_timeout));
        tx
    }
}

impl Plan for RetryPlan {
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
        let sub = self.sub.clone();
        let database = self.database.clone();
        let knobs = self.knobs.clone();
        let outer_lock = checkpoint.document_finished_lock().clone();
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
                terminal = run_retry(
                    task_slot.clone(),
                    sub,
                    database,
                    knobs,
                    outer_lock,
                    task_output.clone(),
                    tx,
                ) => {
                    task_output.send_error(terminal);
                }
            }
        });
        checkpoint.add_operation(stop_handle, handle, output);
        rx
    }

    fn was_metadata_change_okay(&self, new_cx: &Arc<crate::metadata::UnboundCollectionContext>) -> bool {
        self.sub.was_metadata_change_okay(new_cx)
    }

    fn describe(&self) -> String {
        format!("retry({})", self.sub.describe())
    }
}

async fn run_retry(
    slot: Arc<Mutex<Arc<PlanCheckpoint>>>,
    sub: Arc<dyn Plan>,
    database: Arc<dyn Database>,
    knobs: Arc<Knobs>,
    outer_lock: Arc<FlowControlLock>,
    output: StreamSender<DocRef>,
    mut tx: Arc<dyn Transaction>,
) -> QueryError {
    loop {
        match attempt(&slot, &sub, &knobs, &tx).await {
            Ok(committed) => {
                for doc in committed {
                    outer_lock.take(1).await;
                    if !output.send(doc) {
                        return QueryError::OperationCancelled;
                    }
                }
                return QueryError::EndOfStream;
            }
            Err(e @ QueryError::CommitUnknownResult) => return e,
            Err(e) => {
                if let Err(fatal) = tx.on_error(e).await {
                    return fatal;
                }
                tx = RetryPlan::new_transaction(&database, &knobs);
            }
        }
    }
}

/// One transactional attempt: run the subplan to completion, committing
/// each document's changes, then commit the transaction
async fn attempt(
    slot: &Arc<Mutex<Arc<PlanCheckpoint>>>,
    sub: &Arc<dyn Plan>,
    knobs: &Knobs,
    tx: &Arc<dyn Transaction>,
) -> QueryResult<Vec<DocRef>> {
    let inner = PlanCheckpoint::with_permits(knobs.flow_control_lock_permits);
    *slot.lock() = inner.clone();
    let mut docs = sub.execute(&inner, tx);
    let inner_lock = inner.document_finished_lock().clone();

    let mut committing: Pending<()> = Pending::new();
    let mut committed = Vec::new();
    let collect: QueryResult<()> = loop {
        tokio::select! {
            next = docs.next() => match next {
                Ok(doc) => {
                    let fut_doc = doc.clone();
                    committing.push_back((
                        doc,
                        Box::pin(async move { fut_doc.commit_changes().await }),
                    ));
                }
                Err(QueryError::EndOfStream) => break Ok(()),
                Err(e) => break Err(e),
            },
            done = next_pending(&mut committing), if !committing.is_empty() => match done {
                Ok(()) => {
                    if let Some((doc, _)) = committing.pop_front() {
                        committed.push(doc);
                        inner_lock.release(1);
                    }
                }
                Err(e) => break Err(e),
            },
        }
    };
    inner.stop().await;
    collect?;

    while let Some((doc, mut fut)) = committing.pop_front() {
        fut.as_mut().await?;
        committed.push(doc);
        inner_lock.release(1);
    }

    tx.commit().await?;
    Ok(committed)
}
