//! Scan plans: table scan, primary-key lookup, and index scan
//!
//! Scans read the store through a descendants stream paced by a private
//! single-credit lock, translate raw key-values into document references,
//! and stamp each with a monotonically increasing scan key. The index scan
//! additionally deduplicates entries fanned out by array fields: a
//! document is emitted only on the last of its entries falling inside the
//! current scan window.

use std::cmp::{max, min};
use std::sync::Arc;

use serde_json::Value;

use crate::checkpoint::{deposit_split_bounds, or_stop, stop_pair, PlanCheckpoint, StopToken};
use crate::document::DocRef;
use crate::encoding::{
    encode_key_part, first_key_part, increment, key_after, last_key_part,
};
use crate::error::{QueryError, QueryResult};
use crate::metadata::{CollectionContext, IndexInfo, IndexStatus, UnboundCollectionContext};
use crate::query::Predicate;
use crate::storage::{KeyValue, Transaction};
use crate::stream::{stream_channel, FlowControlLock, StreamReceiver, StreamSender};

use super::{next_pending, FilterPlan, Pending, Plan, UnionPlan};

/// Scan every document in a collection in primary-key order
pub struct TableScanPlan {
    cx: Arc<UnboundCollectionContext>,
}

impl TableScanPlan {
    pub fn new(cx: Arc<UnboundCollectionContext>) -> Arc<Self> {
        Arc::new(TableScanPlan { cx })
    }
}

impl Plan for TableScanPlan {
    fn execute(
        &self,
        checkpoint: &Arc<PlanCheckpoint>,
        tx: &Arc<dyn Transaction>,
    ) -> StreamReceiver<DocRef> {
        let collection = self.cx.bind(tx);
        let scan_id = checkpoint.add_scan();
        let (bounds_begin, bounds_end) = checkpoint.bounds(scan_id);
        let begin = max(vec![0x00], bounds_begin);
        let end = max(begin.clone(), min(vec![0xff], bounds_end));

        let input_lock = Arc::new(FlowControlLock::new(1));
        let kvs = collection.descendants(&begin, &end, input_lock.clone());
        let (output, rx) = stream_channel();
        let (stop_handle, stop) = stop_pair();
        let handle = tokio::spawn(do_pk_scan(
            checkpoint.clone(),
            stop,
            collection,
            scan_id,
            begin,
            kvs,
            output.clone(),
            input_lock,
        ));
        checkpoint.add_operation(stop_handle, handle, output);
        rx
    }

    fn push_down(
        &self,
        cx: &Arc<UnboundCollectionContext>,
        predicate: &Predicate,
    ) -> Option<Arc<dyn Plan>> {
        match predicate {
            Predicate::Any { expr, test } => {
                let field = expr.index_key()?;
                let (value_begin, value_end) = test.range();
                if value_begin.is_none() && value_end.is_none() {
                    return None;
                }
                if field == "_id" {
                    let lookup: Arc<dyn Plan> = Arc::new(PrimaryKeyLookupPlan::new(
                        cx.clone(),
                        value_begin,
                        value_end,
                    ));
                    if test.range_is_tight() {
                        Some(lookup)
                    } else {
                        Some(FilterPlan::construct(cx, lookup, predicate.clone()))
                    }
                } else {
                    let index = cx.get_simple_index(field)?;
                    let scan: Arc<dyn Plan> = Arc::new(IndexScanPlan::new(
                        cx.clone(),
                        index,
                        value_begin.map(|v| encode_key_part(&v)),
                        value_end.map(|v| encode_key_part(&v)),
                    ));
                    if test.range_is_tight() {
                        Some(scan)
                    } else {
                        Some(FilterPlan::construct(cx, scan, predicate.clone()))
                    }
                }
            }
            Predicate::Or(terms) => {
                let last = terms.last()?.clone();
                let last_plan = self.push_down(cx, &last)?;
                let remainder = Predicate::And(vec![
                    Predicate::Or(terms[..terms.len() - 1].to_vec()),
                    Predicate::Not(Box::new(last)),
                ])
                .simplify();
                let remainder_plan = self.push_down(cx, &remainder)?;
                Some(Arc::new(UnionPlan::new(remainder_plan, last_plan)))
            }
            Predicate::And(terms) => {
                for (i, term) in terms.iter().enumerate() {
                    if let Some(pushed) = self.push_down(cx, term) {
                        let mut others = terms.clone();
                        others.remove(i);
                        // TODO: try every conjunct and keep the cheapest
                        // rewrite instead of the first one
                        return Some(FilterPlan::construct(
                            cx,
                            pushed,
                            Predicate::And(others).simplify(),
                        ));
                    }
                }
                None
            }
            Predicate::None => Some(super::EmptyPlan::new()),
            _ => None,
        }
    }

    fn describe(&self) -> String {
        format!("table_scan({})", self.cx.ns())
    }
}

/// Emit documents from raw collection key-values, suppressing consecutive
/// keys that share a primary key
async fn do_pk_scan(
    checkpoint: Arc<PlanCheckpoint>,
    stop: StopToken,
    collection: CollectionContext,
    scan_id: usize,
    round_begin: Vec<u8>,
    mut kvs: StreamReceiver<KeyValue>,
    output: StreamSender<DocRef>,
    input_lock: Arc<FlowControlLock>,
) {
    let output_lock = checkpoint.document_finished_lock().clone();
    let prefix_len = collection.unbound().collection_directory().len();
    let mut last_pk: Vec<u8> = Vec::new();
    let mut last_key: Vec<u8> = Vec::new();
    loop {
        let kv = tokio::select! {
            biased;
            _ = stop.cancelled() => {
                deposit_pk_split(&checkpoint, scan_id, &round_begin, &last_key);
                return;
            }
            _ = output.closed() => return,
            next = kvs.next() => match next {
                Ok(kv) => kv,
                Err(e) => {
                    output.send_error(e);
                    return;
                }
            },
        };
        input_lock.release(1);
        let rel_key = kv.key[prefix_len..].to_vec();
        let current_pk = match first_key_part(&rel_key) {
            Ok(pk) => pk.to_vec(),
            Err(e) => {
                output.send_error(e);
                return;
            }
        };
        if current_pk != last_pk {
            last_pk = current_pk.clone();
            let took = tokio::select! {
                biased;
                _ = stop.cancelled() => false,
                _ = output_lock.take(1) => true,
            };
            if !took {
                deposit_pk_split(&checkpoint, scan_id, &round_begin, &last_key);
                return;
            }
            let doc = DocRef::new(collection.doc_context(current_pk), scan_id, rel_key.clone());
            if !output.send(doc) {
                return;
            }
        }
        // Updated only after the document is out, so a cancellation while
        // waiting for the lock resumes at this key rather than after it.
        last_key = rel_key;
    }
}

fn deposit_pk_split(
    checkpoint: &PlanCheckpoint,
    scan_id: usize,
    round_begin: &[u8],
    last_key: &[u8],
) {
    if !checkpoint.split_bound_wanted() {
        return;
    }
    if last_key.is_empty() {
        checkpoint.set_split_bound(scan_id, round_begin.to_vec());
        return;
    }
    match first_key_part(last_key) {
        Ok(pk) => checkpoint.set_split_bound(scan_id, increment(pk)),
        Err(_) => checkpoint.set_split_bound(scan_id, key_after(last_key)),
    }
}

/// Point or range lookup on `_id`
pub struct PrimaryKeyLookupPlan {
    cx: Arc<UnboundCollectionContext>,
    begin: Option<Value>,
    end: Option<Value>,
}

impl PrimaryKeyLookupPlan {
    pub fn new(
        cx: Arc<UnboundCollectionContext>,
        begin: Option<Value>,
        end: Option<Value>,
    ) -> Self {
        PrimaryKeyLookupPlan { cx, begin, end }
    }

    fn point_key(&self) -> Option<&Value> {
        match (&self.begin, &self.end) {
            (Some(begin), Some(end)) if begin == end => Some(begin),
            _ => None,
        }
    }
}

impl Plan for PrimaryKeyLookupPlan {
    fn execute(
        &self,
        checkpoint: &Arc<PlanCheckpoint>,
        tx: &Arc<dyn Transaction>,
    ) -> StreamReceiver<DocRef> {
        let collection = self.cx.bind(tx);
        let scan_id = checkpoint.add_scan();
        if let Some(point) = self.point_key() {
            let key_part = encode_key_part(point);
            let bounds = checkpoint.bounds(scan_id);
            let output_lock = checkpoint.document_finished_lock().clone();
            let (output, rx) = stream_channel();
            let (stop_handle, stop) = stop_pair();
            let task_output = output.clone();
            let handle = tokio::spawn(async move {
                let run = single_pk_lookup(
                    &collection,
                    scan_id,
                    key_part,
                    bounds,
                    output_lock,
                    &task_output,
                );
                match or_stop(&stop, run).await {
                    Some(Ok(())) => {
                        task_output.send_error(QueryError::EndOfStream);
                    }
                    Some(Err(e)) => {
                        task_output.send_error(e);
                    }
                    None => {}
                }
            });
            checkpoint.add_operation(stop_handle, handle, output);
            return rx;
        }

        let (bounds_begin, bounds_end) = checkpoint.bounds(scan_id);
        let begin = max(
            self.begin
                .as_ref()
                .map(encode_key_part)
                .unwrap_or_else(|| vec![0x00]),
            bounds_begin,
        );
        let end = max(
            begin.clone(),
            min(
                self.end
                    .as_ref()
                    .map(|v| increment(&encode_key_part(v)))
                    .unwrap_or_else(|| vec![0xff]),
                bounds_end,
            ),
        );
        let input_lock = Arc::new(FlowControlLock::new(1));
        let kvs = collection.descendants(&begin, &end, input_lock.clone());
        let (output, rx) = stream_channel();
        let (stop_handle, stop) = stop_pair();
        let handle = tokio::spawn(do_pk_scan(
            checkpoint.clone(),
            stop,
            collection,
            scan_id,
            begin,
            kvs,
            output.clone(),
            input_lock,
        ));
        checkpoint.add_operation(stop_handle, handle, output);
        rx
    }

    fn describe(&self) -> String {
        format!(
            "primary_key_lookup({}, {:?}..{:?})",
            self.cx.ns(),
            self.begin,
            self.end
        )
    }
}

/// Point read of one document, restricted to the checkpoint bounds
async fn single_pk_lookup(
    collection: &CollectionContext,
    scan_id: usize,
    key_part: Vec<u8>,
    bounds: (Vec<u8>, Vec<u8>),
    output_lock: Arc<FlowControlLock>,
    output: &StreamSender<DocRef>,
) -> QueryResult<()> {
    let (bounds_begin, bounds_end) = bounds;
    if key_part >= bounds_begin && key_part < bounds_end {
        let doc_key = collection.doc_key(&key_part);
        if collection.transaction().get(&doc_key).await?.is_some() {
            output_lock.take(1).await;
            output.send(DocRef::new(
                collection.doc_context(key_part.clone()),
                scan_id,
                key_part,
            ));
        }
    }
    Ok(())
}

/// Range scan over a secondary index
///
/// `begin` and `end` are encoded key-part prefixes; `end` is inclusive as
/// a prefix (the effective upper bound is its increment), which is what a
/// point scan over an equality value needs.
pub struct IndexScanPlan {
    cx: Arc<UnboundCollectionContext>,
    index: IndexInfo,
    begin: Option<Vec<u8>>,
    end: Option<Vec<u8>>,
}

impl IndexScanPlan {
    pub fn new(
        cx: Arc<UnboundCollectionContext>,
        index: IndexInfo,
        begin: Option<Vec<u8>>,
        end: Option<Vec<u8>>,
    ) -> Self {
        IndexScanPlan {
            cx,
            index,
            begin,
            end,
        }
    }

    fn is_point(&self) -> bool {
        matches!((&self.begin, &self.end), (Some(b), Some(e)) if b == e)
    }
}

impl Plan for IndexScanPlan {
    fn execute(
        &self,
        checkpoint: &Arc<PlanCheckpoint>,
        tx: &Arc<dyn Transaction>,
    ) -> StreamReceiver<DocRef> {
        let collection = self.cx.bind(tx);
        let scan_id = checkpoint.add_scan();
        let (bounds_begin, bounds_end) = checkpoint.bounds(scan_id);
        let lower = max(self.begin.clone().unwrap_or_else(|| vec![0x00]), bounds_begin);
        let upper = max(
            lower.clone(),
            min(
                self.end
                    .as_ref()
                    .map(|e| increment(e))
                    .unwrap_or_else(|| vec![0xff]),
                bounds_end,
            ),
        );

        let input_lock = Arc::new(FlowControlLock::new(1));
        let kvs = collection.index_descendants(&self.index, &lower, &upper, input_lock.clone());
        let prefix_len = self.cx.index_directory(&self.index).len();
        let (entries_tx, entries_rx) = stream_channel();
        let (stop_handle, stop) = stop_pair();
        let handle = tokio::spawn(to_doc_info(
            checkpoint.clone(),
            stop,
            collection,
            scan_id,
            prefix_len,
            lower,
            kvs,
            entries_tx.clone(),
            input_lock,
        ));
        checkpoint.add_operation(stop_handle, handle, entries_tx);

        // A point read on a single-key index cannot produce the same
        // document twice, so the deduplication stage is skipped.
        if self.is_point() && self.index.size() == 1 {
            return entries_rx;
        }

        let (deduped_tx, deduped_rx) = stream_channel();
        let (stop_handle, stop) = stop_pair();
        let handle = tokio::spawn(deduplicate_index_stream(
            checkpoint.clone(),
            stop,
            self.index.clone(),
            upper,
            entries_rx,
            deduped_tx.clone(),
        ));
        checkpoint.add_operation(stop_handle, handle, deduped_tx);
        deduped_rx
    }

    fn push_down(
        &self,
        cx: &Arc<UnboundCollectionContext>,
        predicate: &Predicate,
    ) -> Option<Arc<dyn Plan>> {
        if !self.is_point() {
            return None;
        }
        match predicate {
            Predicate::Any { expr, test } => {
                let field = expr.index_key()?;
                let compound = cx.get_compound_index(&self.index, field)?;
                let (value_begin, value_end) = test.range();
                if value_begin.is_none() && value_end.is_none() {
                    return None;
                }
                let begin_suffix = value_begin
                    .map(|v| encode_key_part(&v))
                    .unwrap_or_else(|| vec![0x00]);
                let end_suffix = value_end
                    .map(|v| encode_key_part(&v))
                    .unwrap_or_else(|| vec![0xff]);
                let begin = self
                    .begin
                    .as_ref()
                    .map(|b| [b.as_slice(), &begin_suffix].concat());
                let end = self
                    .end
                    .as_ref()
                    .map(|e| [e.as_slice(), &end_suffix].concat());
                let scan: Arc<dyn Plan> =
                    Arc::new(IndexScanPlan::new(cx.clone(), compound, begin, end));
                if test.range_is_tight() {
                    Some(scan)
                } else {
                    Some(FilterPlan::construct(cx, scan, predicate.clone()))
                }
            }
            Predicate::And(terms) => {
                for (i, term) in terms.iter().enumerate() {
                    if let Some(pushed) = self.push_down(cx, term) {
                        let mut others = terms.clone();
                        others.remove(i);
                        // TODO: try every conjunct and keep the cheapest
                        // rewrite instead of the first one
                        return Some(FilterPlan::construct(
                            cx,
                            pushed,
                            Predicate::And(others).simplify(),
                        ));
                    }
                }
                None
            }
            _ => None,
        }
    }

    fn was_metadata_change_okay(&self, new_cx: &Arc<UnboundCollectionContext>) -> bool {
        new_cx.known_indexes().iter().any(|index| {
            index.name == self.index.name
                && index.keys == self.index.keys
                && index.status == IndexStatus::Ready
        })
    }

    fn describe(&self) -> String {
        format!("index_scan({}, {})", self.cx.ns(), self.index.name)
    }
}

/// Resolve index entries to document references. Each entry's terminal key
/// part is the owning document's primary key.
#[allow(clippy::too_many_arguments)]
async fn to_doc_info(
    checkpoint: Arc<PlanCheckpoint>,
    stop: StopToken,
    collection: CollectionContext,
    scan_id: usize,
    prefix_len: usize,
    round_begin: Vec<u8>,
    mut kvs: StreamReceiver<KeyValue>,
    output: StreamSender<DocRef>,
    input_lock: Arc<FlowControlLock>,
) {
    let output_lock = checkpoint.document_finished_lock().clone();
    let mut last_key: Vec<u8> = Vec::new();
    let deposit = |last_key: &[u8]| {
        if !checkpoint.split_bound_wanted() {
            return;
        }
        if last_key.is_empty() {
            checkpoint.set_split_bound(scan_id, round_begin.clone());
        } else {
            checkpoint.set_split_bound(scan_id, key_after(last_key));
        }
    };
    loop {
        let kv = tokio::select! {
            biased;
            _ = stop.cancelled() => {
                deposit(&last_key);
                return;
            }
            _ = output.closed() => return,
            next = kvs.next() => match next {
                Ok(kv) => kv,
                Err(QueryError::EndOfStream) => {
                    output.send_error(QueryError::EndOfStream);
                    return;
                }
                Err(e) => {
                    tracing::error!(error = %e, "index entry scan failed");
                    output.send_error(e);
                    return;
                }
            },
        };
        input_lock.release(1);
        let took = tokio::select! {
            biased;
            _ = stop.cancelled() => false,
            _ = output_lock.take(1) => true,
        };
        if !took {
            deposit(&last_key);
            return;
        }
        last_key = kv.key[prefix_len..].to_vec();
        let pk = match last_key_part(&last_key) {
            Ok(pk) => pk.to_vec(),
            Err(e) => {
                output.send_error(e);
                return;
            }
        };
        let doc = DocRef::new(collection.doc_context(pk), scan_id, last_key.clone());
        if !output.send(doc) {
            return;
        }
    }
}

/// Emit each document only on the last of its index entries inside the
/// scan window, so array fan-out cannot produce duplicates
async fn deduplicate_index_stream(
    checkpoint: Arc<PlanCheckpoint>,
    stop: StopToken,
    index: IndexInfo,
    upper_bound: Vec<u8>,
    mut input: StreamReceiver<DocRef>,
    output: StreamSender<DocRef>,
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
                    let fut_doc = doc.clone();
                    let fut_index = index.clone();
                    let fut_upper = upper_bound.clone();
                    pending.push_back((
                        doc,
                        Box::pin(async move {
                            would_be_last(&fut_doc, &fut_index, &fut_upper).await
                        }),
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

/// Would this entry be the document's greatest one below the scan's upper
/// bound? Re-evaluates the indexed expressions against the document.
async fn would_be_last(doc: &DocRef, index: &IndexInfo, upper_bound: &[u8]) -> QueryResult<bool> {
    let value = doc.value().await?;
    let mut parts = index.entry_value_parts(&value);
    if parts.len() == 1 {
        return Ok(true);
    }
    parts.sort();
    let last = parts
        .into_iter()
        .rev()
        .find(|part| part.as_slice() < upper_bound);
    Ok(match last {
        Some(last) => doc.scan_key().starts_with(&last),
        None => true,
    })
}
