//! Operator integration tests

mod test_utils;

use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;

use burrowdb::document::DocumentContext;
use burrowdb::encoding::encode_key_part;
use burrowdb::error::QueryError;
use burrowdb::metadata::{IndexDirection, IndexInfo, IndexStatus, Namespace};
use burrowdb::plan::{
    collect_documents, delete_plan, flush_changes, BuildIndexPlan, FilterPlan, FindAndModifyPlan,
    IndexInsertPlan, InsertPlan, Plan, ProjectAndUpdatePlan, ProjectionPlan, RetryPlan, SkipPlan,
    SortPlan, TableScanPlan, UpdateIndexStatusPlan, UpdatePlan,
};
use burrowdb::query::{
    InsertDocument, InsertOp, Predicate, Projection, SetFields, SortOrder, SortSpec, ValueTest,
};
use burrowdb::storage::Database;

use test_utils::{ids_of, numbered_docs, setup};

#[tokio::test]
async fn test_index_scan_deduplicates_array_entries() {
    let t = setup();
    let ns = Namespace::new("app", "things");
    t.create_ready_index(&ns, "t_1", &["t"]).await;
    let cx = t.collection(&ns).await;
    t.insert_docs(
        &cx,
        vec![
            json!({"_id": 1, "t": [1, 2, 3]}),
            json!({"_id": 2, "t": [2, 3]}),
        ],
    )
    .await;

    let index = cx.get_simple_index("t").unwrap();
    let plan: Arc<dyn Plan> = Arc::new(burrowdb::plan::IndexScanPlan::new(
        cx.clone(),
        index,
        Some(encode_key_part(&json!(1))),
        Some(encode_key_part(&json!(4))),
    ));
    let tx = t.transaction();
    let results = collect_documents(&plan, &tx).await.unwrap();
    let mut ids = ids_of(&results);
    ids.sort_by_key(|v| v.to_string());
    assert_eq!(ids, vec![json!(1), json!(2)], "each document exactly once");
}

#[tokio::test]
async fn test_skip_drops_prefix() {
    let t = setup();
    let ns = Namespace::new("app", "things");
    let cx = t.collection(&ns).await;
    t.insert_docs(&cx, numbered_docs(10)).await;

    let plan: Arc<dyn Plan> = Arc::new(SkipPlan::new(TableScanPlan::new(cx.clone()), 3));
    let tx = t.transaction();
    let results = collect_documents(&plan, &tx).await.unwrap();
    assert_eq!(results.len(), 7);
    assert_eq!(results[0]["_id"], json!("0003"));
}

#[tokio::test]
async fn test_sort_orders_by_sort_key() {
    let t = setup();
    let ns = Namespace::new("app", "things");
    let cx = t.collection(&ns).await;
    t.insert_docs(
        &cx,
        vec![
            json!({"_id": "a", "n": 2}),
            json!({"_id": "b", "n": 9}),
            json!({"_id": "c", "n": 5}),
        ],
    )
    .await;

    let spec = SortSpec::new(vec![("n".to_string(), SortOrder::Descending)]);
    let plan: Arc<dyn Plan> = Arc::new(SortPlan::new(
        Arc::new(ProjectionPlan::new(
            TableScanPlan::new(cx.clone()),
            Projection::identity(),
            Some(spec.clone()),
        )),
        spec,
    ));
    let tx = t.transaction();
    let results = collect_documents(&plan, &tx).await.unwrap();
    let ns_order: Vec<Value> = results.iter().map(|v| v["n"].clone()).collect();
    assert_eq!(ns_order, vec![json!(9), json!(5), json!(2)]);
}

#[tokio::test]
async fn test_projection_keeps_requested_fields() {
    let t = setup();
    let ns = Namespace::new("app", "things");
    let cx = t.collection(&ns).await;
    t.insert_docs(&cx, vec![json!({"_id": 1, "keep": "yes", "drop": "no"})])
        .await;

    let plan: Arc<dyn Plan> = Arc::new(ProjectionPlan::new(
        TableScanPlan::new(cx.clone()),
        Projection::fields(vec!["keep".to_string()]),
        None,
    ));
    let tx = t.transaction();
    let results = collect_documents(&plan, &tx).await.unwrap();
    assert_eq!(results, vec![json!({"_id": 1, "keep": "yes"})]);
}

#[tokio::test]
async fn test_update_with_upsert_inserts_missing_document() {
    let t = setup();
    let ns = Namespace::new("app", "things");
    let cx = t.collection(&ns).await;
    t.insert_docs(&cx, vec![json!({"_id": "a", "v": 1})]).await;

    let filtered = FilterPlan::construct(
        &cx,
        TableScanPlan::new(cx.clone()),
        Predicate::field("_id", ValueTest::Eq(json!("z"))),
    );
    let plan = flush_changes(Arc::new(UpdatePlan::new(
        filtered,
        SetFields::new(vec![("v".to_string(), json!(2))]),
        Some(InsertDocument::new(json!({"_id": "z", "v": 2}))),
        1,
        cx.clone(),
    )));

    let tx = t.transaction();
    let results = collect_documents(&plan, &tx).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["_id"], json!("z"));

    let check = t.transaction();
    let doc = cx
        .bind(&check)
        .doc_context(encode_key_part(&json!("z")));
    assert_eq!(doc.get("v").await.unwrap(), Some(json!(2)));
}

#[tokio::test]
async fn test_update_applies_to_matching_documents() {
    let t = setup();
    let ns = Namespace::new("app", "things");
    let cx = t.collection(&ns).await;
    t.insert_docs(&cx, numbered_docs(5)).await;

    let plan = flush_changes(Arc::new(UpdatePlan::new(
        TableScanPlan::new(cx.clone()),
        SetFields::new(vec![("touched".to_string(), json!(true))]),
        None,
        i64::MAX,
        cx.clone(),
    )));
    let tx = t.transaction();
    let results = collect_documents(&plan, &tx).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(results.len(), 5);

    let check = t.transaction();
    let all = collect_documents(
        &(TableScanPlan::new(cx.clone()) as Arc<dyn Plan>),
        &check,
    )
    .await
    .unwrap();
    assert!(all.iter().all(|d| d["touched"] == json!(true)));
}

#[tokio::test]
async fn test_delete_plan_honors_limit() {
    let t = setup();
    let ns = Namespace::new("app", "things");
    let cx = t.collection(&ns).await;
    t.insert_docs(&cx, numbered_docs(5)).await;

    let plan = flush_changes(delete_plan(
        TableScanPlan::new(cx.clone()),
        cx.clone(),
        2,
    ));
    let tx = t.transaction();
    let deleted = collect_documents(&plan, &tx).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(deleted.len(), 2);

    let check = t.transaction();
    let remaining = collect_documents(
        &(TableScanPlan::new(cx.clone()) as Arc<dyn Plan>),
        &check,
    )
    .await
    .unwrap();
    assert_eq!(remaining.len(), 3);
}

#[tokio::test]
async fn test_insert_plan_through_retry() {
    let t = setup();
    let ns = Namespace::new("app", "things");
    let inserts: Vec<Arc<dyn InsertOp>> = (0..3)
        .map(|i| InsertDocument::new(json!({"_id": i, "v": i})) as Arc<dyn InsertOp>)
        .collect();
    let plan: Arc<dyn Plan> = Arc::new(RetryPlan::new(
        Arc::new(InsertPlan::new(inserts, ns.clone(), t.mm.clone())),
        t.db.clone() as Arc<dyn Database>,
        t.knobs.clone(),
    ));

    let tx = t.transaction();
    let results = collect_documents(&plan, &tx).await.unwrap();
    assert_eq!(results.len(), 3);

    let cx = t.collection(&ns).await;
    let check = t.transaction();
    let all = collect_documents(&(TableScanPlan::new(cx) as Arc<dyn Plan>), &check)
        .await
        .unwrap();
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn test_retry_recovers_from_transient_commit_failure() {
    let t = setup();
    let ns = Namespace::new("app", "things");
    t.db.inject_commit_fault(QueryError::NotCommitted);

    let inserts: Vec<Arc<dyn InsertOp>> =
        vec![InsertDocument::new(json!({"_id": "only"})) as Arc<dyn InsertOp>];
    let plan: Arc<dyn Plan> = Arc::new(RetryPlan::new(
        Arc::new(InsertPlan::new(inserts, ns.clone(), t.mm.clone())),
        t.db.clone() as Arc<dyn Database>,
        t.knobs.clone(),
    ));

    let tx = t.transaction();
    let results = collect_documents(&plan, &tx).await.unwrap();
    assert_eq!(results.len(), 1);

    let cx = t.collection(&ns).await;
    let check = t.transaction();
    let all = collect_documents(&(TableScanPlan::new(cx) as Arc<dyn Plan>), &check)
        .await
        .unwrap();
    assert_eq!(ids_of(&all), vec![json!("only")]);
}

#[tokio::test]
async fn test_retry_surfaces_commit_unknown_result() {
    let t = setup();
    let ns = Namespace::new("app", "things");
    t.db.inject_commit_fault(QueryError::CommitUnknownResult);

    let inserts: Vec<Arc<dyn InsertOp>> =
        vec![InsertDocument::new(json!({"_id": "x"})) as Arc<dyn InsertOp>];
    let plan: Arc<dyn Plan> = Arc::new(RetryPlan::new(
        Arc::new(InsertPlan::new(inserts, ns, t.mm.clone())),
        t.db.clone() as Arc<dyn Database>,
        t.knobs.clone(),
    ));

    let tx = t.transaction();
    let err = collect_documents(&plan, &tx).await.unwrap_err();
    assert_eq!(err, QueryError::CommitUnknownResult);
}

#[tokio::test]
async fn test_find_and_modify_returns_post_image() {
    let t = setup();
    let ns = Namespace::new("app", "things");
    let cx = t.collection(&ns).await;
    t.insert_docs(&cx, vec![json!({"_id": "k", "v": 1})]).await;

    let filtered = FilterPlan::construct(
        &cx,
        TableScanPlan::new(cx.clone()),
        Predicate::field("_id", ValueTest::Eq(json!("k"))),
    );
    let plan: Arc<dyn Plan> = Arc::new(FindAndModifyPlan::new(
        filtered,
        SetFields::new(vec![("v".to_string(), json!(2))]),
        None,
        Projection::identity(),
        None,
        true,
        cx.clone(),
        t.db.clone() as Arc<dyn Database>,
        t.mm.clone(),
        t.knobs.clone(),
    ));

    let tx = t.transaction();
    let results = collect_documents(&plan, &tx).await.unwrap();
    assert_eq!(results, vec![json!({"_id": "k", "v": 2})]);

    let check = t.transaction();
    let doc = cx.bind(&check).doc_context(encode_key_part(&json!("k")));
    assert_eq!(doc.get("v").await.unwrap(), Some(json!(2)));
}

#[tokio::test]
async fn test_find_and_modify_upserts_when_empty() {
    let t = setup();
    let ns = Namespace::new("app", "things");
    let cx = t.collection(&ns).await;

    let filtered = FilterPlan::construct(
        &cx,
        TableScanPlan::new(cx.clone()),
        Predicate::field("_id", ValueTest::Eq(json!("missing"))),
    );
    let plan: Arc<dyn Plan> = Arc::new(FindAndModifyPlan::new(
        filtered,
        SetFields::new(vec![("v".to_string(), json!(1))]),
        Some(InsertDocument::new(json!({"_id": "missing", "v": 1}))),
        Projection::identity(),
        None,
        true,
        cx.clone(),
        t.db.clone() as Arc<dyn Database>,
        t.mm.clone(),
        t.knobs.clone(),
    ));

    let tx = t.transaction();
    let results = collect_documents(&plan, &tx).await.unwrap();
    assert_eq!(results, vec![json!({"_id": "missing", "v": 1})]);

    let check = t.transaction();
    let doc = cx
        .bind(&check)
        .doc_context(encode_key_part(&json!("missing")));
    assert_eq!(doc.get("v").await.unwrap(), Some(json!(1)));
}

#[tokio::test]
async fn test_project_and_update_emits_pre_image() {
    let t = setup();
    let ns = Namespace::new("app", "things");
    let cx = t.collection(&ns).await;
    t.insert_docs(&cx, vec![json!({"_id": "p", "v": 1})]).await;

    let filtered = FilterPlan::construct(
        &cx,
        TableScanPlan::new(cx.clone()),
        Predicate::field("_id", ValueTest::Eq(json!("p"))),
    );
    let plan: Arc<dyn Plan> = Arc::new(RetryPlan::new(
        Arc::new(ProjectAndUpdatePlan::new(
            filtered,
            SetFields::new(vec![("v".to_string(), json!(2))]),
            None,
            Projection::identity(),
            None,
            false,
            cx.clone(),
        )),
        t.db.clone() as Arc<dyn Database>,
        t.knobs.clone(),
    ));

    let tx = t.transaction();
    let results = collect_documents(&plan, &tx).await.unwrap();
    assert_eq!(results, vec![json!({"_id": "p", "v": 1})], "pre-image");

    let check = t.transaction();
    let doc = cx.bind(&check).doc_context(encode_key_part(&json!("p")));
    assert_eq!(doc.get("v").await.unwrap(), Some(json!(2)));
}

#[tokio::test]
async fn test_index_insert_conflicts() {
    let t = setup();
    let ns = Namespace::new("app", "things");
    let index = IndexInfo::new("x_1", vec![("x".to_string(), IndexDirection::Ascending)]);

    let create = |doc: Value| -> Arc<dyn Plan> {
        Arc::new(RetryPlan::new(
            Arc::new(IndexInsertPlan::new(doc, ns.clone(), t.mm.clone())),
            t.db.clone() as Arc<dyn Database>,
            t.knobs.clone(),
        ))
    };

    let tx = t.transaction();
    let created = collect_documents(&create(index.to_document(&ns)), &tx)
        .await
        .unwrap();
    assert_eq!(created.len(), 1);

    // Same key specification under another name: reported as success with
    // no output
    let same_key = IndexInfo::new("other", vec![("x".to_string(), IndexDirection::Ascending)]);
    let tx = t.transaction();
    let results = collect_documents(&create(same_key.to_document(&ns)), &tx)
        .await
        .unwrap();
    assert!(results.is_empty());

    // Same name with a different key specification: an error
    let clash = IndexInfo::new("x_1", vec![("y".to_string(), IndexDirection::Ascending)]);
    let tx = t.transaction();
    let err = collect_documents(&create(clash.to_document(&ns)), &tx)
        .await
        .unwrap_err();
    assert_eq!(err, QueryError::IndexNameTaken);
}

#[tokio::test]
async fn test_build_index_lifecycle() {
    let t = setup();
    let ns = Namespace::new("app", "things");
    let cx = t.collection(&ns).await;
    t.insert_docs(
        &cx,
        vec![
            json!({"_id": 1, "t": 10}),
            json!({"_id": 2, "t": [20, 30]}),
            json!({"_id": 3, "other": true}),
        ],
    )
    .await;

    // Register the index as building
    let build_id = Uuid::new_v4();
    let mut index = IndexInfo::new("t_1", vec![("t".to_string(), IndexDirection::Ascending)]);
    index.status = IndexStatus::Building;
    index.build_id = Some(build_id);
    let create: Arc<dyn Plan> = Arc::new(RetryPlan::new(
        Arc::new(IndexInsertPlan::new(
            index.to_document(&ns),
            ns.clone(),
            t.mm.clone(),
        )),
        t.db.clone() as Arc<dyn Database>,
        t.knobs.clone(),
    ));
    let tx = t.transaction();
    collect_documents(&create, &tx).await.unwrap();

    // Rewrite entries for existing documents
    let cx = t.collection(&ns).await;
    let index_pk = encode_key_part(&json!("t_1"));
    let build: Arc<dyn Plan> = Arc::new(RetryPlan::new(
        Arc::new(BuildIndexPlan::new(
            TableScanPlan::new(cx.clone()),
            index.clone(),
            ns.db.clone(),
            index_pk.clone(),
            t.mm.clone(),
        )),
        t.db.clone() as Arc<dyn Database>,
        t.knobs.clone(),
    ));
    let tx = t.transaction();
    let built = collect_documents(&build, &tx).await.unwrap();
    assert_eq!(built.len(), 3);

    // Wrong build id is rejected
    let wrong: Arc<dyn Plan> = Arc::new(RetryPlan::new(
        Arc::new(UpdateIndexStatusPlan::new(
            ns.clone(),
            index_pk.clone(),
            IndexStatus::Ready,
            Some(Uuid::new_v4()),
            t.mm.clone(),
        )),
        t.db.clone() as Arc<dyn Database>,
        t.knobs.clone(),
    ));
    let tx = t.transaction();
    assert_eq!(
        collect_documents(&wrong, &tx).await.unwrap_err(),
        QueryError::IndexWrongBuildId
    );

    // Correct build id flips the index to ready
    let flip: Arc<dyn Plan> = Arc::new(RetryPlan::new(
        Arc::new(UpdateIndexStatusPlan::new(
            ns.clone(),
            index_pk,
            IndexStatus::Ready,
            Some(build_id),
            t.mm.clone(),
        )),
        t.db.clone() as Arc<dyn Database>,
        t.knobs.clone(),
    ));
    let tx = t.transaction();
    collect_documents(&flip, &tx).await.unwrap();

    // The ready index now serves queries through push-down
    let cx = t.collection(&ns).await;
    assert!(cx.get_simple_index("t").is_some());
    let predicate = Predicate::field("t", ValueTest::Eq(json!(20)));
    let plan = FilterPlan::construct(&cx, TableScanPlan::new(cx.clone()), predicate);
    assert!(plan.describe().starts_with("index_scan"));
    let tx = t.transaction();
    let found = collect_documents(&plan, &tx).await.unwrap();
    assert_eq!(ids_of(&found), vec![json!(2)]);
}
