//! Projection plan
//!
//! Projects each document asynchronously and re-wraps the result as a
//! free-standing document that keeps the source's scan id and scan key, so
//! split-bound deposits above a projection still point at the right scan
//! position.

use std::sync::Arc;

use crate::checkpoint::{deposit_split_bounds, stop_pair, PlanCheckpoint, StopToken};
use crate::document::DocRef;
use crate::error::QueryError;
use crate::metadata::UnboundCollectionContext;
use crate::query::{project_document, Projection, SortSpec};
use crate::storage::Transaction;
use crate::stream::{stream_channel, StreamReceiver, StreamSender};

use super::{next_pending, Pending, Plan};

/// Project a subplan's documents
pub struct ProjectionPlan {
    sub: Arc<dyn Plan>,
    projection: Arc<Projection>,
    ordering: Option<SortSpec>,
}

impl ProjectionPlan {
    pub fn new(sub: Arc<dyn Plan>, projection: Projection, ordering: Option<SortSpec>) -> Self {
        ProjectionPlan {
            sub,
            projection: Arc::new(projection),
            ordering,
        }
    }
}

impl Plan for ProjectionPlan {
    fn execute(
        &self,
        checkpoint: &Arc<PlanCheckpoint>,
        tx: &Arc<dyn Transaction>,
    ) -> StreamReceiver<DocRef> {
        let input = self.sub.execute(checkpoint, tx);
        let (output, rx) = stream_channel();
        let (stop_handle, stop) = stop_pair();
        let handle = tokio::spawn(do_project(
            checkpoint.clone(),
            stop,
            input,
            output.clone(),
            self.projection.clone(),
            self.ordering.clone(),
        ));
        checkpoint.add_operation(stop_handle, handle, output);
        rx
    }

    fn was_metadata_change_okay(&self, new_cx: &Arc<UnboundCollectionContext>) -> bool {
        self.sub.was_metadata_change_okay(new_cx)
    }

    fn describe(&self) -> String {
        format!("{}({})", self.projection.describe(), self.sub.describe())
    }
}

async fn do_project(
    checkpoint: Arc<PlanCheckpoint>,
    stop: StopToken,
    mut input: StreamReceiver<DocRef>,
    output: StreamSender<DocRef>,
    projection: Arc<Projection>,
    ordering: Option<SortSpec>,
) {
    let mut pending: Pending<serde_json::Value> = Pending::new();
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
                    let fut_projection = projection.clone();
                    let fut_ordering = ordering.clone();
                    pending.push_back((
                        doc,
                        Box::pin(async move {
                            let value = fut_doc.value().await?;
                            Ok(project_document(
                                &value,
                                &fut_projection,
                                fut_ordering.as_ref(),
                            ))
                        }),
                    ));
                }
                Err(QueryError::EndOfStream) => input_open = false,
                Err(e) => {
                    output.send_error(e);
                    return;
                }
            },
            projected = next_pending(&mut pending), if !pending.is_empty() => {
                let Some((doc, _)) = pending.pop_front() else {
                    continue;
                };
                match projected {
                    Ok(value) => {
                        let wrapped = DocRef::synthetic(
                            value,
                            doc.scan_id(),
                            doc.scan_key().to_vec(),
                        );
                        if !output.send(wrapped) {
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
