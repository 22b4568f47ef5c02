//! Union plan
//!
//! Forwards documents from two inputs as they arrive, in nondeterministic
//! arrival order. Terminates when both inputs end; a real error from
//! either input ends the stream immediately.

use std::sync::Arc;

use crate::checkpoint::{stop_pair, PlanCheckpoint, StopToken};
use crate::document::DocRef;
use crate::error::QueryError;
use crate::metadata::UnboundCollectionContext;
use crate::storage::Transaction;
use crate::stream::{stream_channel, StreamReceiver, StreamSender};

use super::Plan;

/// Merge two subplans' outputs
pub struct UnionPlan {
    left: Arc<dyn Plan>,
    right: Arc<dyn Plan>,
}

impl UnionPlan {
    pub fn new(left: Arc<dyn Plan>, right: Arc<dyn Plan>) -> Self {
        UnionPlan { left, right }
    }
}

impl Plan for UnionPlan {
    fn execute(
        &self,
        checkpoint: &Arc<PlanCheckpoint>,
        tx: &Arc<dyn Transaction>,
    ) -> StreamReceiver<DocRef> {
        let left = self.left.execute(checkpoint, tx);
        let right = self.right.execute(checkpoint, tx);
        let (output, rx) = stream_channel();
        let (stop_handle, stop) = stop_pair();
        let handle = tokio::spawn(do_union(
            checkpoint.clone(),
            stop,
            left,
            right,
            output.clone(),
        ));
        checkpoint.add_operation(stop_handle, handle, output);
        rx
    }

    fn was_metadata_change_okay(&self, new_cx: &Arc<UnboundCollectionContext>) -> bool {
        self.left.was_metadata_change_okay(new_cx) && self.right.was_metadata_change_okay(new_cx)
    }

    fn describe(&self) -> String {
        format!("union({}, {})", self.left.describe(), self.right.describe())
    }
}

async fn do_union(
    checkpoint: Arc<PlanCheckpoint>,
    stop: StopToken,
    mut left: StreamReceiver<DocRef>,
    mut right: StreamReceiver<DocRef>,
    output: StreamSender<DocRef>,
) {
    let mut left_open = true;
    let mut right_open = true;
    loop {
        if !left_open && !right_open {
            output.send_error(QueryError::EndOfStream);
            return;
        }
        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                super::deposit_channel_docs(&checkpoint, &mut left);
                super::deposit_channel_docs(&checkpoint, &mut right);
                return;
            }
            next = left.next(), if left_open => match next {
                Ok(doc) => {
                    if !output.send(doc) {
                        return;
                    }
                }
                Err(QueryError::EndOfStream) => left_open = false,
                Err(e) => {
                    output.send_error(e);
                    return;
                }
            },
            next = right.next(), if right_open => match next {
                Ok(doc) => {
                    if !output.send(doc) {
                        return;
                    }
                }
                Err(QueryError::EndOfStream) => right_open = false,
                Err(e) => {
                    output.send_error(e);
                    return;
                }
            },
        }
    }
}
