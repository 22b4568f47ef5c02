//! Filter plan
//!
//! Evaluates a predicate against each input document asynchronously,
//! preserving input order through a FIFO of pending evaluations. Dropped
//! documents release their flow-control credit.

use std::sync::Arc;

use crate::checkpoint::{deposit_split_bounds, stop_pair, PlanCheckpoint, StopToken};
use crate::document::DocRef;
use crate::error::QueryError;
use crate::metadata::UnboundCollectionContext;
use crate::query::Predicate;
use crate::storage::Transaction;
use crate::stream::{stream_channel, StreamReceiver, StreamSender};

use super::{next_pending, Pending, Plan};

/// Filter a subplan's output by a predicate
pub struct FilterPlan {
    source: Arc<dyn Plan>,
    predicate: Arc<Predicate>,
}

impl FilterPlan {
    /// Build a filtered plan, absorbing the predicate into the source when
    /// the planner can rewrite it
    pub fn construct(
        cx: &Arc<UnboundCollectionContext>,
        source: Arc<dyn Plan>,
        predicate: Predicate,
    ) -> Arc<dyn Plan> {
        if matches!(predicate, Predicate::All) {
            return source;
        }
        if let Some(rewritten) = source.push_down(cx, &predicate) {
            tracing::debug!(
                source = %source.describe(),
                pushed_down_into = %rewritten.describe(),
                "filter predicate pushed down"
            );
            return rewritten;
        }
        Arc::new(FilterPlan {
            source,
            predicate: Arc::new(predicate),
        })
    }
}

impl Plan for FilterPlan {
    fn execute(
        &self,
        checkpoint: &Arc<PlanCheckpoint>,
        tx: &Arc<dyn Transaction>,
    ) -> StreamReceiver<DocRef> {
        let input = self.source.execute(checkpoint, tx);
        let (output, rx) = stream_channel();
        let (stop_handle, stop) = stop_pair();
        let handle = tokio::spawn(do_filter(
            checkpoint.clone(),
            stop,
            input,
            output.clone(),
            self.predicate.clone(),
        ));
        checkpoint.add_operation(stop_handle, handle, output);
        rx
    }

    fn push_down(
        &self,
        _cx: &Arc<UnboundCollectionContext>,
        predicate: &Predicate,
    ) -> Option<Arc<dyn Plan>> {
        let combined = Predicate::And(vec![
            self.predicate.as_ref().clone(),
            predicate.clone(),
        ])
        .simplify();
        Some(Arc::new(FilterPlan {
            source: self.source.clone(),
            predicate: Arc::new(combined),
        }))
    }

    fn was_metadata_change_okay(&self, new_cx: &Arc<UnboundCollectionContext>) -> bool {
        self.source.was_metadata_change_okay(new_cx)
    }

    fn describe(&self) -> String {
        format!("filter({}, {})", self.source.describe(), self.predicate)
    }
}

async fn do_filter(
    checkpoint: Arc<PlanCheckpoint>,
    stop: StopToken,
    mut input: StreamReceiver<DocRef>,
    output: StreamSender<DocRef>,
    predicate: Arc<Predicate>,
) {
    let lock = checkpoint.document_finished_lock().clone();
    let mut pending: Pending<bool> = Pending::new();
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
                    let fut_predicate = predicate.clone();
                    let fut_doc = doc.clone();
                    pending.push_back((
                        doc,
                        Box::pin(async move { fut_predicate.evaluate(&fut_doc).await }),
                    ));
                }
                Err(QueryError::EndOfStream) => input_open = false,
                Err(e) => {
                    output.send_error(e);
                    return;
                }
            },
            verdict = next_pending(&mut pending), if !pending.is_empty() => {
                let Some((doc, _)) = pending.pop_front() else {
                    continue;
                };
                match verdict {
                    Ok(true) => {
                        if !output.send(doc) {
                            return;
                        }
                    }
                    Ok(false) => lock.release(1),
                    Err(e) => {
                        output.send_error(e);
                        return;
                    }
                }
            }
        }
    }
}
