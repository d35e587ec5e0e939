//! Prepared-plan lifecycle: PREPARE caches the plan, EXECUTE reuses it
//! without replanning, and schema drift forces a replan.

use std::sync::Arc;

use serde_json::json;

use quarry::algebra::{
    AggregateCall, AggregateKind, KeyspaceRef, Prepare, Select, Statement,
};
use quarry::core::{EngineConfig, ErrorCode};
use quarry::datastore::{Keyspace, MemCatalog};
use quarry::engine::QueryEngine;
use quarry::expression::Expr;
use quarry::planner::PlannerOptions;

fn setup() -> (Arc<MemCatalog>, QueryEngine) {
    let catalog = Arc::new(MemCatalog::new());
    let ks = catalog.create_keyspace("t");
    ks.upsert(vec![
        ("k1".into(), json!({"a": 1})),
        ("k2".into(), json!({"a": 2})),
        ("k3".into(), json!({"a": 3})),
    ]);
    let engine = QueryEngine::new(
        Arc::clone(&catalog) as Arc<dyn quarry::datastore::Catalog>,
        EngineConfig::default(),
    );
    (catalog, engine)
}

fn prepare_count(name: &str) -> Statement {
    Statement::Prepare(Prepare {
        name: name.into(),
        statement: Box::new(Statement::Select(
            Select::new(KeyspaceRef::new("t")).with_aggregates(vec![AggregateCall::new(
                AggregateKind::Count,
                Expr::path("t.a"),
                "n",
            )]),
        )),
    })
}

#[tokio::test]
async fn prepare_returns_encoded_plan_and_caches_it() {
    let (_, engine) = setup();
    let results = engine
        .execute(&prepare_count("p1"), PlannerOptions::default())
        .await
        .unwrap();

    // the PREPARE result row is the JSON form of the inner plan
    assert_eq!(results.rows.len(), 1);
    assert_eq!(results.rows[0]["#operator"], "Sequence");

    assert_eq!(engine.prepared().len(), 1);
    assert!(engine.prepared().get("p1").is_some());
}

#[tokio::test]
async fn execute_prepared_runs_without_replanning() {
    let (_, engine) = setup();
    engine
        .execute(&prepare_count("p1"), PlannerOptions::default())
        .await
        .unwrap();

    let results = engine.execute_prepared("p1").await.unwrap();
    assert_eq!(results.rows.len(), 1);
    assert_eq!(results.rows[0]["n"], json!(3));
}

#[tokio::test]
async fn missing_prepared_name_is_an_error() {
    let (_, engine) = setup();
    let err = engine.execute_prepared("ghost").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::PreparedNotFound);
}

#[tokio::test]
async fn dropping_the_keyspace_invalidates_the_plan() {
    let (catalog, engine) = setup();
    engine
        .execute(&prepare_count("p1"), PlannerOptions::default())
        .await
        .unwrap();

    catalog.drop_keyspace("t");
    let err = engine.execute_prepared("p1").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::PreparedVerify);

    // the stale entry was evicted, so the next miss reads as not-found
    let err = engine.execute_prepared("p1").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::PreparedNotFound);
}

#[tokio::test]
async fn index_drift_invalidates_plans_that_reference_it() {
    let (catalog, engine) = setup();
    let ks = catalog.get("t").unwrap();
    ks.create_index("by_a", "a");

    use quarry::planner::{IndexHint, ScanChoice, ScanCombine};
    let options = PlannerOptions::default().with_scan_choice(
        "t",
        ScanChoice {
            combine: ScanCombine::Intersect,
            hints: vec![IndexHint {
                index: "by_a".into(),
                span: quarry::datastore::IndexSpan::Eq(json!(1)),
                covering: false,
                estimate: Default::default(),
            }],
        },
    );
    let results = engine
        .execute(
            &Statement::Prepare(Prepare {
                name: "by_index".into(),
                statement: Box::new(Statement::Select(
                    Select::new(KeyspaceRef::new("t"))
                        .with_filter(Expr::path("t.a").eq(Expr::literal(1))),
                )),
            }),
            options,
        )
        .await
        .unwrap();
    assert_eq!(results.rows.len(), 1);

    ks.drop_index("by_a");
    let err = engine.execute_prepared("by_index").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::PreparedVerify);
}
