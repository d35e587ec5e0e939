//! Plan-tree invariants: wire-format round-trips, scan rebalancing,
//! and limit ownership inside set-combining scans.

use serde_json::json;
use uuid::Uuid;

use quarry::datastore::IndexSpan;
use quarry::expression::Expr;
use quarry::plan::{
    IndexScan, IntersectScan, KeyspaceTerm, OptEstimate, PlanOp, UnionScan, MAX_SCAN_FANIN,
};

fn index_scan(index: &str) -> IndexScan {
    IndexScan::new(
        KeyspaceTerm::new("t", "t", Uuid::new_v4()),
        index,
        Uuid::new_v4(),
        IndexSpan::Eq(json!(1)),
        OptEstimate::new(2.0, 10.0, 16, 0.5),
    )
}

#[test]
fn intersect_flattens_nested_same_kind() {
    let inner = IntersectScan::new(
        None,
        OptEstimate::unavailable(),
        vec![index_scan("b").into(), index_scan("c").into()],
    );
    let outer = IntersectScan::new(
        None,
        OptEstimate::unavailable(),
        vec![index_scan("a").into(), inner.into(), index_scan("d").into()],
    );

    let names: Vec<&str> = outer
        .scans
        .iter()
        .map(|s| match s {
            PlanOp::IndexScan(s) => s.index.as_str(),
            other => panic!("unexpected nested {}", other.name()),
        })
        .collect();
    assert_eq!(names, vec!["a", "b", "c", "d"]);
}

#[test]
fn nested_scans_lose_limit_and_offset() {
    let mut child = index_scan("b");
    child.limit = Some(Expr::literal(7));
    child.offset = Some(Expr::literal(3));
    let scan = IntersectScan::new(
        Some(Expr::literal(7)),
        OptEstimate::unavailable(),
        vec![child.into(), index_scan("c").into()],
    );

    for child in &scan.scans {
        let PlanOp::IndexScan(child) = child else {
            panic!("expected index scans");
        };
        assert!(child.limit.is_none());
        assert!(child.offset.is_none());
    }
    assert!(scan.limit.is_some());
}

#[test]
fn over_wide_fanin_becomes_balanced_two_level_tree() {
    // seventy index choices rewritten via intersect: the constructor
    // yields a balanced binary tree with root arity 2
    let scans: Vec<PlanOp> = (0..70).map(|i| index_scan(&format!("i{}", i)).into()).collect();
    let scan = IntersectScan::new(
        Some(Expr::literal(5)),
        OptEstimate::new(70.0, 7.0, 8, 1.0),
        scans,
    );

    assert_eq!(scan.scans.len(), 2);
    for half in &scan.scans {
        let PlanOp::IntersectScan(half) = half else {
            panic!("expected intersect halves");
        };
        assert_eq!(half.scans.len(), 35);
        assert!(half.scans.len() <= MAX_SCAN_FANIN);
        assert!(half.limit.is_none());
    }
    assert!(scan.limit.is_some());
}

#[test]
fn union_rebalances_like_intersect() {
    let scans: Vec<PlanOp> = (0..130).map(|i| index_scan(&format!("i{}", i)).into()).collect();
    let scan = UnionScan::new(None, OptEstimate::unavailable(), scans);
    assert_eq!(scan.scans.len(), 2);
    let (PlanOp::UnionScan(a), PlanOp::UnionScan(b)) = (&scan.scans[0], &scan.scans[1]) else {
        panic!("expected union halves");
    };
    assert_eq!(a.scans.len() + b.scans.len(), 130);
}

#[test]
fn wire_format_round_trips_balanced_tree() {
    let scans: Vec<PlanOp> = (0..70).map(|i| index_scan(&format!("i{}", i)).into()).collect();
    let scan: PlanOp = IntersectScan::new(
        Some(Expr::literal(5)),
        OptEstimate::new(70.0, 7.0, 8, 1.0),
        scans,
    )
    .into();

    let text = scan.to_json_string().unwrap();
    assert!(text.starts_with("{\"#operator\":\"IntersectScan\""));
    let back = PlanOp::from_json_str(&text).unwrap();
    assert_eq!(back, scan);
}

#[test]
fn unknown_operator_fails_decode() {
    let err =
        PlanOp::from_json_str(r##"{"#operator":"FluxCapacitor","scans":[]}"##).unwrap_err();
    assert!(err.to_string().contains("FluxCapacitor"));
}
