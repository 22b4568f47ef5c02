//! Sort plan
//!
//! Buffers the entire subplan output inside a child checkpoint, sorts by
//! the `sortKey` field its projection attached, then emits the inner
//! `doc` values as free-standing documents. A restarted execution re-sorts
//! from scratch; sorted output carries no scan position.

use std::sync::Arc;

use serde_json::Value;

use crate::checkpoint::{stop_pair, PlanCheckpoint, StopToken};
use crate::document::DocRef;
use crate::error::{QueryError, QueryResult};
use crate::metadata::UnboundCollectionContext;
use crate::query::SortSpec;
use crate::storage::Transaction;
use crate::stream::{stream_channel, StreamReceiver, StreamSender};

use super::Plan;

/// Sort a subplan's output
pub struct SortPlan {
    sub: Arc<dyn Plan>,
    ordering: SortSpec,
}

impl SortPlan {
    pub fn new(sub: Arc<dyn Plan>, ordering: SortSpec) -> Self {
        SortPlan { sub, ordering }
    }
}

impl Plan for SortPlan {
    fn execute(
        &self,
        checkpoint: &Arc<PlanCheckpoint>,
        tx: &Arc<dyn Transaction>,
    ) -> StreamReceiver<DocRef> {
        let (output, rx) = stream_channel();
        let (stop_handle, stop) = stop_pair();
        let handle = tokio::spawn(do_sort(
            checkpoint.clone(),
            stop,
            tx.clone(),
            self.sub.clone(),
            self.ordering.clone(),
            output.clone(),
        ));
        checkpoint.add_operation(stop_handle, handle, output);
        rx
    }

    fn was_metadata_change_okay(&self, new_cx: &Arc<UnboundCollectionContext>) -> bool {
        self.sub.was_metadata_change_okay(new_cx)
    }

    fn describe(&self) -> String {
        format!("{}({})", self.ordering.describe(), self.sub.describe())
    }
}

async fn do_sort(
    checkpoint: Arc<PlanCheckpoint>,
    stop: StopToken,
    tx: Arc<dyn Transaction>,
    sub: Arc<dyn Plan>,
    ordering: SortSpec,
    output: StreamSender<DocRef>,
) {
    let inner = PlanCheckpoint::with_permits(checkpoint.document_finished_lock().permits());
    tokio::select! {
        biased;
        _ = stop.cancelled() => {
            inner.stop().await;
        }
        result = run_sort(
            checkpoint.clone(),
            inner.clone(),
            tx,
            sub,
            ordering,
            output.clone(),
        ) => {
            inner.stop().await;
            match result {
                Ok(()) => {
                    output.send_error(QueryError::EndOfStream);
                }
                Err(e) => {
                    tracing::error!(error = %e, "sort failed");
                    output.send_error(e);
                }
            }
        }
    }
}

async fn run_sort(
    outer: Arc<PlanCheckpoint>,
    inner: Arc<PlanCheckpoint>,
    tx: Arc<dyn Transaction>,
    sub: Arc<dyn Plan>,
    ordering: SortSpec,
    output: StreamSender<DocRef>,
) -> QueryResult<()> {
    let mut docs = sub.execute(&inner, &tx);
    let inner_lock = inner.document_finished_lock().clone();
    let outer_lock = outer.document_finished_lock().clone();

    let mut buffered: Vec<Value> = Vec::new();
    loop {
        match docs.next().await {
            Ok(doc) => {
                buffered.push(doc.value().await?);
                inner_lock.release(1);
            }
            Err(QueryError::EndOfStream) => break,
            Err(e) => return Err(e),
        }
    }

    buffered.sort_by(|a, b| ordering.compare_wrapped(a, b));

    for value in buffered {
        outer_lock.take(1).await;
        let doc_value = value.get("doc").cloned().unwrap_or(Value::Null);
        if !output.send(DocRef::synthetic(doc_value, None, Vec::new())) {
            return Ok(());
        }
    }
    Ok(())
}
