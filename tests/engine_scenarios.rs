//! End-to-end pipelines through the engine: intersect scans, grouped
//! aggregates, DML statements, set operations, and cooperative stop.

use std::sync::Arc;

use serde_json::json;

use quarry::algebra::{
    AggregateCall, AggregateKind, Delete, KeyspaceRef, ProjectionTerm, Select, SetOpKind,
    Statement, Update,
};
use quarry::core::{EngineConfig, QueryContext};
use quarry::datastore::{IndexSpan, Keyspace, MemCatalog};
use quarry::engine::QueryEngine;
use quarry::execution::{build_exec, item_channel, join_operator, spawn_operator, BuildEnv};
use quarry::expression::Expr;
use quarry::plan::PlanOp;
use quarry::planner::{IndexHint, PlannerOptions, ScanChoice, ScanCombine};

fn engine_over(catalog: Arc<MemCatalog>) -> QueryEngine {
    QueryEngine::new(
        catalog as Arc<dyn quarry::datastore::Catalog>,
        EngineConfig::default(),
    )
}

fn two_index_catalog() -> Arc<MemCatalog> {
    let catalog = Arc::new(MemCatalog::new());
    let ks = catalog.create_keyspace("t");
    ks.upsert(vec![
        ("k1".into(), json!({"a": 10, "b": 1, "c": 2})),
        ("k2".into(), json!({"a": 20, "b": 1, "c": 9})),
        ("k3".into(), json!({"a": 30, "b": 1, "c": 2})),
        ("k4".into(), json!({"a": 40, "b": 5, "c": 2})),
    ]);
    ks.create_index("by_b", "b");
    ks.create_index("by_c", "c");
    catalog
}

fn intersect_options() -> PlannerOptions {
    PlannerOptions::default().with_scan_choice(
        "t",
        ScanChoice {
            combine: ScanCombine::Intersect,
            hints: vec![
                IndexHint {
                    index: "by_b".into(),
                    span: IndexSpan::Eq(json!(1)),
                    covering: false,
                    estimate: Default::default(),
                },
                IndexHint {
                    index: "by_c".into(),
                    span: IndexSpan::Eq(json!(2)),
                    covering: false,
                    estimate: Default::default(),
                },
            ],
        },
    )
}

#[tokio::test]
async fn intersect_scan_streams_keys_matching_both_predicates() {
    let engine = engine_over(two_index_catalog());
    let stmt = Statement::Select(
        Select::new(KeyspaceRef::new("t"))
            .with_projection(vec![ProjectionTerm::expr(Expr::path("t.a"), "a")])
            .with_filter(
                Expr::path("t.b")
                    .eq(Expr::literal(1))
                    .and(Expr::path("t.c").eq(Expr::literal(2))),
            ),
    );

    let plan = engine.plan(&stmt, intersect_options()).unwrap();
    let PlanOp::Sequence(seq) = &plan else {
        panic!("sequence root");
    };
    assert!(matches!(seq.children[0], PlanOp::IntersectScan(_)));

    let mut results = engine.execute(&stmt, intersect_options()).await.unwrap();
    // keys k1 and k3 satisfy b=1 AND c=2; order across scans is not
    // guaranteed
    results
        .rows
        .sort_by_key(|r| r["a"].as_i64().unwrap_or(i64::MAX));
    assert_eq!(results.rows, vec![json!({"a": 10}), json!({"a": 30})]);
}

#[tokio::test]
async fn stddev_aggregate_matches_sample_definition() {
    let catalog = Arc::new(MemCatalog::new());
    let ks = catalog.create_keyspace("t");
    let values = [2, 4, 4, 4, 5, 5, 7, 9];
    ks.upsert(
        values
            .iter()
            .enumerate()
            .map(|(i, x)| (format!("k{}", i), json!({ "x": x })))
            .collect(),
    );
    let engine = engine_over(catalog);

    let stmt = Statement::Select(Select::new(KeyspaceRef::new("t")).with_aggregates(vec![
        AggregateCall::new(AggregateKind::Stddev, Expr::path("t.x"), "sd"),
    ]));
    let results = engine.execute(&stmt, PlannerOptions::default()).await.unwrap();
    assert_eq!(results.rows.len(), 1);
    let sd = results.rows[0]["sd"].as_f64().unwrap();
    assert!((sd - 2.1380899352993947).abs() < 1e-9, "got {}", sd);
}

#[tokio::test]
async fn stddev_over_empty_input_is_null_and_single_value_zero() {
    let catalog = Arc::new(MemCatalog::new());
    catalog.create_keyspace("empty");
    let single = catalog.create_keyspace("single");
    single.upsert(vec![("k0".into(), json!({"x": 4}))]);
    let engine = engine_over(catalog);

    let stddev_of = |ks: &str| {
        Statement::Select(Select::new(KeyspaceRef::new(ks)).with_aggregates(vec![
            AggregateCall::new(AggregateKind::Stddev, Expr::path(&format!("{}.x", ks)), "sd"),
        ]))
    };

    let results = engine
        .execute(&stddev_of("empty"), PlannerOptions::default())
        .await
        .unwrap();
    assert_eq!(results.rows[0]["sd"], json!(null));

    let results = engine
        .execute(&stddev_of("single"), PlannerOptions::default())
        .await
        .unwrap();
    assert_eq!(results.rows[0]["sd"], json!(0.0));
}

#[tokio::test]
async fn stop_after_three_items_delivers_at_most_three() {
    let catalog = Arc::new(MemCatalog::new());
    let ks = catalog.create_keyspace("t");
    ks.upsert(
        (0..100)
            .map(|i| (format!("k{:03}", i), json!({"a": i})))
            .collect(),
    );
    let engine = engine_over(Arc::clone(&catalog));

    let stmt = Statement::Select(Select::new(KeyspaceRef::new("t")).with_limit(Expr::literal(10)));
    let plan = engine.plan(&stmt, PlannerOptions::default()).unwrap();

    // drive the tree by hand so the stop can land mid-stream
    let env = BuildEnv::new(
        Arc::clone(&catalog) as Arc<dyn quarry::datastore::Catalog>,
        EngineConfig::default(),
    );
    let mut stops = Vec::new();
    let mut root = build_exec(&plan, &env, &mut stops).unwrap();
    let (tx, mut rx) = item_channel(4);
    root.base_mut().set_output(tx);
    let ctx = Arc::new(QueryContext::new(true));
    let handle = spawn_operator(root, &ctx);

    let mut delivered = 0;
    while delivered < 3 {
        match rx.recv().await {
            Some(_) => delivered += 1,
            None => break,
        }
    }
    assert_eq!(delivered, 3);

    // stop every operator and kill the context; the tree must wind
    // down and the root task join cleanly
    for stop in &stops {
        stop.send_stop();
    }
    ctx.kill();
    while rx.recv().await.is_some() {}

    let mut root = tokio::time::timeout(std::time::Duration::from_secs(5), join_operator(handle))
        .await
        .expect("operators must exit after stop")
        .expect("root task must not be cancelled");
    root.done().await;
    assert!(ctx.first_fatal().is_none());
}

#[tokio::test]
async fn union_all_combines_both_branches() {
    let catalog = Arc::new(MemCatalog::new());
    let t = catalog.create_keyspace("t");
    t.upsert(vec![("t1".into(), json!({"v": 1}))]);
    let u = catalog.create_keyspace("u");
    u.upsert(vec![("u1".into(), json!({"v": 2})), ("u2".into(), json!({"v": 3}))]);
    let engine = engine_over(catalog);

    let stmt = Statement::Select(
        Select::new(KeyspaceRef::new("t"))
            .with_set_op(SetOpKind::UnionAll, Select::new(KeyspaceRef::new("u"))),
    );
    let mut results = engine.execute(&stmt, PlannerOptions::default()).await.unwrap();
    results
        .rows
        .sort_by_key(|r| r["v"].as_i64().unwrap_or(i64::MAX));
    assert_eq!(
        results.rows,
        vec![json!({"v": 1}), json!({"v": 2}), json!({"v": 3})]
    );
}

#[tokio::test]
async fn update_statement_rewrites_matching_documents() {
    let catalog = Arc::new(MemCatalog::new());
    let ks = catalog.create_keyspace("t");
    ks.upsert(vec![
        ("k1".into(), json!({"a": 1, "keep": true})),
        ("k2".into(), json!({"a": 2, "keep": true})),
    ]);
    let engine = engine_over(Arc::clone(&catalog));

    let stmt = Statement::Update(Update {
        keyspace: KeyspaceRef::new("t"),
        filter: Some(Expr::path("t.a").eq(Expr::literal(1))),
        set: vec![(Expr::ident("a"), Expr::literal(99))],
        unset: vec![Expr::ident("keep")],
        limit: None,
        returning: None,
    });
    let results = engine.execute(&stmt, PlannerOptions::default()).await.unwrap();
    assert_eq!(results.mutation_count, 1);

    let ks = catalog.get("t").unwrap();
    let (found, _) = ks.fetch(&["k1".into()]);
    assert_eq!(found[0].1, json!({"a": 99}));
    let (found, _) = ks.fetch(&["k2".into()]);
    assert_eq!(found[0].1, json!({"a": 2, "keep": true}));
}

#[tokio::test]
async fn delete_statement_respects_limit() {
    let catalog = Arc::new(MemCatalog::new());
    let ks = catalog.create_keyspace("t");
    ks.upsert(
        (0..10)
            .map(|i| (format!("k{}", i), json!({"a": i})))
            .collect(),
    );
    let engine = engine_over(Arc::clone(&catalog));

    let stmt = Statement::Delete(Delete {
        keyspace: KeyspaceRef::new("t"),
        filter: None,
        limit: Some(Expr::literal(4)),
        returning: None,
    });
    let results = engine.execute(&stmt, PlannerOptions::default()).await.unwrap();
    assert_eq!(results.mutation_count, 4);
    assert_eq!(catalog.get("t").unwrap().count(), 6);
}

#[tokio::test]
async fn upsert_statement_inserts_and_replaces() {
    use quarry::algebra::Insert;

    let catalog = Arc::new(MemCatalog::new());
    let ks = catalog.create_keyspace("t");
    ks.upsert(vec![("k1".into(), json!({"a": 1}))]);
    let engine = engine_over(Arc::clone(&catalog));

    let stmt = Statement::Upsert(Insert {
        keyspace: KeyspaceRef::new("t"),
        values: vec![
            (Expr::literal("k1"), Expr::literal(json!({"a": 100}))),
            (Expr::literal("k2"), Expr::literal(json!({"a": 2}))),
        ],
        limit: None,
        returning: None,
    });
    let results = engine.execute(&stmt, PlannerOptions::default()).await.unwrap();
    assert_eq!(results.mutation_count, 2);

    let ks = catalog.get("t").unwrap();
    let (found, _) = ks.fetch(&["k1".into()]);
    assert_eq!(found[0].1, json!({"a": 100}), "existing key is replaced");
    assert_eq!(ks.count(), 2);
}

#[tokio::test]
async fn create_function_registers_and_conflicts() {
    use quarry::algebra::CreateFunction;
    use quarry::core::ErrorCode;

    let catalog = Arc::new(MemCatalog::new());
    catalog.create_keyspace("t");
    let engine = engine_over(catalog);

    let stmt = Statement::CreateFunction(CreateFunction {
        name: "double".into(),
        body: json!({"args": ["x"], "expr": "x * 2"}),
        replace: false,
    });
    let results = engine.execute(&stmt, PlannerOptions::default()).await.unwrap();
    assert!(results.errors.is_empty());
    assert!(engine.functions().get("double").is_ok());

    // a second CREATE without OR REPLACE reports a conflict
    let results = engine.execute(&stmt, PlannerOptions::default()).await.unwrap();
    assert!(results
        .errors
        .iter()
        .any(|e| e.code() == ErrorCode::FunctionExists));
}

#[tokio::test]
async fn authorize_gate_rejects_unlisted_keyspace() {
    use quarry::core::{Credentials, ErrorCode};
    use quarry::plan::{Authorize, OptEstimate, PrimaryScan, Sequence, Stream};

    let catalog = Arc::new(MemCatalog::new());
    let ks = catalog.create_keyspace("t");
    ks.upsert(vec![("k1".into(), json!({"a": 1}))]);

    let inner = PlanOp::Sequence(Sequence::new(
        vec![
            PrimaryScan::new(
                quarry::plan::KeyspaceTerm::from_keyspace(ks.as_ref(), "t"),
                None,
                OptEstimate::unavailable(),
            )
            .into(),
            Stream::new(OptEstimate::unavailable()).into(),
        ],
        OptEstimate::unavailable(),
    ));
    let plan: PlanOp = Authorize::new("t", inner, OptEstimate::unavailable()).into();

    let engine = engine_over(Arc::clone(&catalog));
    let ctx = Arc::new(QueryContext::new(true).with_credentials(Credentials {
        user: Some("restricted".into()),
        allowed_keyspaces: vec!["other".into()],
    }));
    let results = engine.run(&plan, ctx).await.unwrap();
    assert!(results.rows.is_empty());
    assert!(results
        .errors
        .iter()
        .any(|e| e.code() == ErrorCode::Authorization));

    // the same plan under permissive credentials streams the rows
    let ctx = Arc::new(QueryContext::new(true));
    let results = engine.run(&plan, ctx).await.unwrap();
    assert_eq!(results.rows.len(), 1);
}

#[tokio::test]
async fn readonly_context_blocks_mutations() {
    let catalog = Arc::new(MemCatalog::new());
    let ks = catalog.create_keyspace("t");
    ks.upsert(vec![("k1".into(), json!({"a": 1}))]);
    let engine = engine_over(Arc::clone(&catalog));

    let stmt = Statement::Delete(Delete {
        keyspace: KeyspaceRef::new("t"),
        filter: None,
        limit: None,
        returning: None,
    });
    let plan = engine.plan(&stmt, PlannerOptions::default()).unwrap();
    let ctx = Arc::new(QueryContext::new(true));
    let results = engine.run(&plan, ctx).await.unwrap();
    assert_eq!(results.mutation_count, 0);
    assert_eq!(catalog.get("t").unwrap().count(), 1);
}
