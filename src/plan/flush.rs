//! Flush-changes plan
//!
//! Commits each document's buffered writes before forwarding it,
//! preserving order. Commits are pipelined; the document-finished lock
//! bounds how many are in flight at once.

use std::sync::Arc;

use crate::checkpoint::{deposit_split_bounds, stop_pair, PlanCheckpoint, StopToken};
use crate::document::DocRef;
use crate::error::QueryError;
use crate::metadata::UnboundCollectionContext;
use crate::storage::Transaction;
use crate::stream::{stream_channel, StreamReceiver, StreamSender};

use super::{next_pending, Pending, Plan};

/// Commit buffered document writes as they flow past
pub struct FlushChangesPlan {
    sub: Arc<dyn Plan>,
}

impl FlushChangesPlan {
    pub fn new(sub: Arc<dyn Plan>) -> Self {
        FlushChangesPlan { sub }
    }
}

impl Plan for FlushChangesPlan {
    fn execute(
        &self,
        checkpoint: &Arc<PlanCheckpoint>,
        tx: &Arc<dyn Transaction>,
    ) -> StreamReceiver<DocRef> {
        let input = self.sub.execute(checkpoint, tx);
        let (output, rx) = stream_channel();
        let (stop_handle, stop) = stop_pair();
        let handle = tokio::spawn(do_flush_changes(
            checkpoint.clone(),
            stop,
            input,
            output.clone(),
        ));
        checkpoint.add_operation(stop_handle, handle, output);
        rx
    }

    fn was_metadata_change_okay(&self, new_cx: &Arc<UnboundCollectionContext>) -> bool {
        self.sub.was_metadata_change_okay(new_cx)
    }

    fn describe(&self) -> String {
        format!("flush_changes({})", self.sub.describe())
    }
}

async fn do_flush_changes(
    checkpoint: Arc<PlanCheckpoint>,
    stop: StopToken,
    mut input: StreamReceiver<DocRef>,
    output: StreamSender<DocRef>,
) {
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
                    pending.push_back((
                        doc,
                        Box::pin(async move { fut_doc.commit_changes().await }),
                    ));
                }
                Err(QueryError::EndOfStream) => input_open = false,
                Err(e) => {
                    output.send_error(e);
                    return;
                }
            },
            committed = next_pending(&mut pending), if !pending.is_empty() => {
                let Some((doc, _)) = pending.pop_front() else {
                    continue;
                };
                match committed {
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
