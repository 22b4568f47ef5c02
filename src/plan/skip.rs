//! Skip plan
//!
//! Consumes and releases the first `skip` documents, then passes the rest
//! through. The remaining count lives in checkpoint int state so a
//! resumed execution does not skip again.

use std::sync::Arc;

use crate::checkpoint::{stop_pair, IntState, PlanCheckpoint, StopToken};
use crate::document::DocRef;
use crate::metadata::UnboundCollectionContext;
use crate::storage::Transaction;
use crate::stream::{stream_channel, StreamReceiver, StreamSender};

use super::Plan;

/// Skip the first `skip` documents of a subplan
pub struct SkipPlan {
    sub: Arc<dyn Plan>,
    skip: i64,
}

impl SkipPlan {
    pub fn new(sub: Arc<dyn Plan>, skip: i64) -> Self {
        SkipPlan { sub, skip }
    }
}

impl Plan for SkipPlan {
    fn execute(
        &self,
        checkpoint: &Arc<PlanCheckpoint>,
        tx: &Arc<dyn Transaction>,
    ) -> StreamReceiver<DocRef> {
        let input = self.sub.execute(checkpoint, tx);
        let left_to_skip = checkpoint.int_state(self.skip);
        let (output, rx) = stream_channel();
        let (stop_handle, stop) = stop_pair();
        let handle = tokio::spawn(do_skip(
            checkpoint.clone(),
            stop,
            input,
            output.clone(),
            left_to_skip,
        ));
        checkpoint.add_operation(stop_handle, handle, output);
        rx
    }

    fn was_metadata_change_okay(&self, new_cx: &Arc<UnboundCollectionContext>) -> bool {
        self.sub.was_metadata_change_okay(new_cx)
    }

    fn describe(&self) -> String {
        format!("skip({}, {})", self.sub.describe(), self.skip)
    }
}

async fn do_skip(
    checkpoint: Arc<PlanCheckpoint>,
    stop: StopToken,
    mut input: StreamReceiver<DocRef>,
    output: StreamSender<DocRef>,
    left_to_skip: IntState,
) {
    let lock = checkpoint.document_finished_lock().clone();
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                super::deposit_channel_docs(&checkpoint, &mut input);
                return;
            }
            _ = output.closed() => return,
            next = input.next() => match next {
                Ok(doc) => {
                    if left_to_skip.get() != 0 {
                        lock.release(1);
                        left_to_skip.add(-1);
                    } else if !output.send(doc) {
                        return;
                    }
                }
                Err(e) => {
                    output.send_error(e);
                    return;
                }
            },
        }
    }
}
