//! Checkpoint, split-bound, and wrapper-plan integration tests

mod test_utils;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use burrowdb::checkpoint::PlanCheckpoint;
use burrowdb::document::DocRef;
use burrowdb::encoding::increment;
use burrowdb::error::QueryError;
use burrowdb::knobs::Knobs;
use burrowdb::metadata::Namespace;
use burrowdb::plan::{
    collect_documents, FilterPlan, NonIsolatedPlan, Plan, SkipPlan, TableScanPlan, UpdatePlan,
};
use burrowdb::query::{Predicate, SetFields, ValueTest};
use burrowdb::storage::Database;
use burrowdb::stream::StreamReceiver;

use test_utils::{numbered_docs, setup};

/// Consume up to `n` documents, recording ids and scan keys
async fn consume(
    stream: &mut StreamReceiver<DocRef>,
    checkpoint: &Arc<PlanCheckpoint>,
    n: usize,
    ids: &mut Vec<Value>,
    last_scan_key: &mut Vec<u8>,
) {
    for _ in 0..n {
        let doc = stream.next().await.unwrap();
        ids.push(doc.value().await.unwrap()["_id"].clone());
        *last_scan_key = doc.scan_key().to_vec();
        checkpoint.document_finished_lock().release(1);
    }
}

/// Drain documents the plan emitted before it was stopped
async fn drain(
    stream: &mut StreamReceiver<DocRef>,
    ids: &mut Vec<Value>,
    last_scan_key: &mut Vec<u8>,
) {
    while let Some(item) = stream.try_next() {
        match item {
            Ok(doc) => {
                ids.push(doc.value().await.unwrap()["_id"].clone());
                *last_scan_key = doc.scan_key().to_vec();
            }
            Err(_) => break,
        }
    }
}

#[tokio::test]
async fn test_table_scan_resumes_exactly_after_split() {
    let t = setup();
    let ns = Namespace::new("app", "bulk");
    let cx = t.collection(&ns).await;
    t.insert_docs(&cx, numbered_docs(300)).await;

    let plan: Arc<dyn Plan> = TableScanPlan::new(cx.clone());
    let checkpoint = PlanCheckpoint::new();
    let tx = t.transaction();
    let mut stream = plan.execute(&checkpoint, &tx);

    let mut ids = Vec::new();
    let mut last_scan_key = Vec::new();
    consume(&mut stream, &checkpoint, 137, &mut ids, &mut last_scan_key).await;

    tokio::task::yield_now().await;
    let resumed = checkpoint.stop_and_checkpoint().await;
    drain(&mut stream, &mut ids, &mut last_scan_key).await;

    // The resume point is just past the last delivered document
    let (begin, end) = resumed.bounds(0);
    assert_eq!(begin, increment(&last_scan_key));
    assert_eq!(end, vec![0xff]);

    // The second segment produces exactly the rest, in order
    let tx2 = t.transaction();
    let mut stream2 = plan.execute(&resumed, &tx2);
    loop {
        match stream2.next().await {
            Ok(doc) => {
                ids.push(doc.value().await.unwrap()["_id"].clone());
                resumed.document_finished_lock().release(1);
            }
            Err(QueryError::EndOfStream) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    resumed.stop().await;

    let expected: Vec<Value> = (0..300).map(|i| json!(format!("{i:04}"))).collect();
    assert_eq!(ids, expected, "no duplicates, no losses, order preserved");
}

#[tokio::test]
async fn test_scan_keys_strictly_increase() {
    let t = setup();
    let ns = Namespace::new("app", "bulk");
    let cx = t.collection(&ns).await;
    t.insert_docs(&cx, numbered_docs(50)).await;

    let plan: Arc<dyn Plan> = TableScanPlan::new(cx.clone());
    let checkpoint = PlanCheckpoint::new();
    let tx = t.transaction();
    let mut stream = plan.execute(&checkpoint, &tx);

    let mut previous: Option<Vec<u8>> = None;
    loop {
        match stream.next().await {
            Ok(doc) => {
                let key = doc.scan_key().to_vec();
                assert!(key < vec![0xff]);
                if let Some(prev) = &previous {
                    assert!(key > *prev, "scan keys must strictly increase");
                }
                previous = Some(key);
                checkpoint.document_finished_lock().release(1);
            }
            Err(QueryError::EndOfStream) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    checkpoint.stop().await;
}

#[tokio::test]
async fn test_flow_control_credits_balance_at_completion() {
    let t = setup();
    let ns = Namespace::new("app", "bulk");
    let cx = t.collection(&ns).await;
    t.insert_docs(&cx, numbered_docs(40)).await;

    // A residual filter drops half the documents, releasing their credits
    let plan = FilterPlan::construct(
        &cx,
        TableScanPlan::new(cx.clone()),
        Predicate::field("n", ValueTest::Ge(json!(20))),
    );
    let checkpoint = PlanCheckpoint::new();
    let tx = t.transaction();
    let mut stream = plan.execute(&checkpoint, &tx);

    let permits = checkpoint.document_finished_lock().permits();
    let mut emitted = 0;
    loop {
        match stream.next().await {
            Ok(_) => {
                emitted += 1;
                checkpoint.document_finished_lock().release(1);
            }
            Err(QueryError::EndOfStream) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(emitted, 20);
    assert_eq!(
        checkpoint.document_finished_lock().available(),
        permits,
        "every taken credit was released or surfaced"
    );
    checkpoint.stop().await;
}

#[tokio::test]
async fn test_skip_count_survives_checkpoint() {
    let t = setup();
    let ns = Namespace::new("app", "bulk");
    let cx = t.collection(&ns).await;
    t.insert_docs(&cx, numbered_docs(20)).await;

    let plan: Arc<dyn Plan> = Arc::new(SkipPlan::new(TableScanPlan::new(cx.clone()), 5));
    let checkpoint = PlanCheckpoint::new();
    let tx = t.transaction();
    let mut stream = plan.execute(&checkpoint, &tx);

    let mut ids = Vec::new();
    let mut last_scan_key = Vec::new();
    consume(&mut stream, &checkpoint, 3, &mut ids, &mut last_scan_key).await;

    tokio::task::yield_now().await;
    let resumed = checkpoint.stop_and_checkpoint().await;
    drain(&mut stream, &mut ids, &mut last_scan_key).await;

    let tx2 = t.transaction();
    let mut stream2 = plan.execute(&resumed, &tx2);
    loop {
        match stream2.next().await {
            Ok(doc) => {
                ids.push(doc.value().await.unwrap()["_id"].clone());
                resumed.document_finished_lock().release(1);
            }
            Err(QueryError::EndOfStream) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    resumed.stop().await;

    // Documents 5..19 exactly once: the skip count was not re-applied
    let expected: Vec<Value> = (5..20).map(|i| json!(format!("{i:04}"))).collect();
    assert_eq!(ids, expected);
}

fn quick_knobs() -> Arc<Knobs> {
    Arc::new(Knobs {
        flow_control_lock_permits: 4,
        nonisolated_first_response_timeout: Duration::from_millis(40),
        nonisolated_internal_timeout: Duration::from_millis(25),
        nonisolated_rw_internal_buffer_max: 8,
        ..Knobs::default()
    })
}

#[tokio::test]
async fn test_non_isolated_read_spans_transactions() {
    let t = setup();
    let ns = Namespace::new("app", "bulk");
    let cx = t.collection(&ns).await;
    t.insert_docs(&cx, numbered_docs(100)).await;

    let knobs = quick_knobs();
    let plan: Arc<dyn Plan> = Arc::new(NonIsolatedPlan::read_only(
        TableScanPlan::new(cx.clone()),
        cx.clone(),
        t.db.clone() as Arc<dyn Database>,
        t.mm.clone(),
        knobs.clone(),
    ));

    let checkpoint = PlanCheckpoint::with_permits(knobs.flow_control_lock_permits);
    let tx = t.transaction();
    let mut stream = plan.execute(&checkpoint, &tx);

    let mut ids = Vec::new();
    loop {
        match stream.next().await {
            Ok(doc) => {
                ids.push(doc.value().await.unwrap()["_id"].clone());
                checkpoint.document_finished_lock().release(1);
                // Slow consumption forces the internal timeout to fire and
                // the wrapper to restart in fresh transactions
                tokio::time::sleep(Duration::from_millis(3)).await;
            }
            Err(QueryError::EndOfStream) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    checkpoint.stop().await;

    let expected: Vec<Value> = (0..100).map(|i| json!(format!("{i:04}"))).collect();
    assert_eq!(ids, expected, "all documents in order, exactly once");
}

#[tokio::test]
async fn test_non_isolated_read_write_commits_in_rounds() {
    let t = setup();
    let ns = Namespace::new("app", "bulk");
    let cx = t.collection(&ns).await;
    t.insert_docs(&cx, numbered_docs(60)).await;

    let knobs = quick_knobs();
    let update: Arc<dyn Plan> = Arc::new(UpdatePlan::new(
        TableScanPlan::new(cx.clone()),
        SetFields::new(vec![("done".to_string(), json!(true))]),
        None,
        i64::MAX,
        cx.clone(),
    ));
    let plan: Arc<dyn Plan> = Arc::new(NonIsolatedPlan::read_write(
        update,
        cx.clone(),
        t.db.clone() as Arc<dyn Database>,
        t.mm.clone(),
        knobs.clone(),
    ));

    let checkpoint = PlanCheckpoint::with_permits(knobs.flow_control_lock_permits);
    let tx = t.transaction();
    let mut stream = plan.execute(&checkpoint, &tx);

    let mut ids = Vec::new();
    loop {
        match stream.next().await {
            Ok(doc) => {
                ids.push(doc.value().await.unwrap()["_id"].clone());
                checkpoint.document_finished_lock().release(1);
            }
            Err(QueryError::EndOfStream) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    checkpoint.stop().await;

    let mut sorted = ids.clone();
    sorted.sort_by_key(|v| v.to_string());
    sorted.dedup();
    assert_eq!(sorted.len(), 60, "each document updated exactly once");

    let check = t.transaction();
    let all = collect_documents(
        &(TableScanPlan::new(cx.clone()) as Arc<dyn Plan>),
        &check,
    )
    .await
    .unwrap();
    assert_eq!(all.len(), 60);
    assert!(all.iter().all(|d| d["done"] == json!(true)));
}

#[tokio::test]
async fn test_stop_reports_operation_cancelled() {
    let t = setup();
    let ns = Namespace::new("app", "bulk");
    let cx = t.collection(&ns).await;
    t.insert_docs(&cx, numbered_docs(10)).await;

    let plan: Arc<dyn Plan> = TableScanPlan::new(cx.clone());
    let checkpoint = PlanCheckpoint::new();
    let tx = t.transaction();
    let mut stream = plan.execute(&checkpoint, &tx);

    let first = stream.next().await.unwrap();
    drop(first);
    checkpoint.document_finished_lock().release(1);
    checkpoint.stop().await;

    // Buffered documents may precede the terminal error
    let terminal = loop {
        match stream.next().await {
            Ok(_) => continue,
            Err(e) => break e,
        }
    };
    assert_eq!(terminal, QueryError::OperationCancelled);
}
