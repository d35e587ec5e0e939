//! Scan plan nodes
//!
//! Primary, index, key, and value scans, the set-combining scans over
//! secondary scans, and the key-to-document Fetch stage.
//!
//! Set-combining scans own limit pushdown: a secondary scan nested in an
//! intersect or union has its limit and offset cleared at construction.
//! Fan-in wider than `MAX_SCAN_FANIN` is rebalanced into a two-level
//! composition of the same kind.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::datastore::{Catalog, IndexSpan};
use crate::expression::{opt_expr_serde, Expr};

use super::estimate::OptEstimate;
use super::{KeyspaceTerm, PlanOp};

/// Widest allowed fan-in for intersect/union scans.
pub const MAX_SCAN_FANIN: usize = 64;

/// Full keyspace scan in key order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimaryScan {
    pub keyspace: KeyspaceTerm,
    #[serde(with = "opt_expr_serde", default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<Expr>,
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl PrimaryScan {
    pub fn new(keyspace: KeyspaceTerm, limit: Option<Expr>, estimate: OptEstimate) -> Self {
        Self {
            keyspace,
            limit,
            estimate,
        }
    }

    pub fn verify(&self, catalog: &dyn Catalog) -> bool {
        self.keyspace.verify(catalog)
    }
}

/// Secondary index scan yielding keys and cover values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexScan {
    pub keyspace: KeyspaceTerm,
    pub index: String,
    pub index_fingerprint: Uuid,
    pub span: IndexSpan,
    #[serde(default)]
    pub covering: bool,
    #[serde(with = "opt_expr_serde", default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<Expr>,
    #[serde(with = "opt_expr_serde", default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<Expr>,
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl IndexScan {
    pub fn new(
        keyspace: KeyspaceTerm,
        index: &str,
        index_fingerprint: Uuid,
        span: IndexSpan,
        estimate: OptEstimate,
    ) -> Self {
        Self {
            keyspace,
            index: index.to_string(),
            index_fingerprint,
            span,
            covering: false,
            limit: None,
            offset: None,
            estimate,
        }
    }

    pub fn verify(&self, catalog: &dyn Catalog) -> bool {
        let Some(ks) = catalog.keyspace(&self.keyspace.keyspace) else {
            return false;
        };
        match ks.index(&self.index) {
            Some(idx) => idx.fingerprint() == self.index_fingerprint,
            None => false,
        }
    }
}

/// Scan of explicitly listed keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyScan {
    /// Evaluates to one key or an array of keys.
    #[serde(with = "crate::expression::expr_serde")]
    pub keys: Expr,
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl KeyScan {
    pub fn new(keys: Expr, estimate: OptEstimate) -> Self {
        Self { keys, estimate }
    }
}

/// One VALUES pair of an INSERT.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValuesPair {
    #[serde(with = "crate::expression::expr_serde")]
    pub key: Expr,
    #[serde(with = "crate::expression::expr_serde")]
    pub value: Expr,
}

/// Scan over literal VALUES pairs; feeds DML send operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueScan {
    pub values: Vec<ValuesPair>,
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl ValueScan {
    pub fn new(values: Vec<ValuesPair>, estimate: OptEstimate) -> Self {
        Self { values, estimate }
    }
}

/// Key-to-document fetch between a secondary scan and its consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fetch {
    pub keyspace: KeyspaceTerm,
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl Fetch {
    pub fn new(keyspace: KeyspaceTerm, estimate: OptEstimate) -> Self {
        Self { keyspace, estimate }
    }

    pub fn verify(&self, catalog: &dyn Catalog) -> bool {
        self.keyspace.verify(catalog)
    }
}

/// Intersection of several secondary scans; emits keys present in all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntersectScan {
    pub scans: Vec<PlanOp>,
    #[serde(with = "opt_expr_serde", default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<Expr>,
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl IntersectScan {
    pub fn new(limit: Option<Expr>, estimate: OptEstimate, mut scans: Vec<PlanOp>) -> Self {
        for scan in &mut scans {
            clear_limit_offset(scan);
        }

        let mut flat = Vec::with_capacity(scans.len() * 2);
        flatten_intersect(scans, &mut flat);

        let n = flat.len();
        if n > MAX_SCAN_FANIN {
            let right = flat.split_off(n / 2);
            let half = estimate.halve_cost();
            let lower_left = IntersectScan {
                scans: flat,
                limit: None,
                estimate: half,
            };
            let lower_right = IntersectScan {
                scans: right,
                limit: None,
                estimate: half,
            };
            return IntersectScan {
                scans: vec![lower_left.into(), lower_right.into()],
                limit,
                estimate,
            };
        }

        IntersectScan {
            scans: flat,
            limit,
            estimate,
        }
    }

    pub fn verify(&self, catalog: &dyn Catalog) -> bool {
        self.scans.iter().all(|s| s.verify(catalog))
    }
}

/// Intersection that preserves the order of its first scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderedIntersectScan {
    pub scans: Vec<PlanOp>,
    #[serde(with = "opt_expr_serde", default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<Expr>,
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl OrderedIntersectScan {
    pub fn new(limit: Option<Expr>, estimate: OptEstimate, mut scans: Vec<PlanOp>) -> Self {
        for scan in &mut scans {
            clear_limit_offset(scan);
        }
        Self {
            scans,
            limit,
            estimate,
        }
    }

    pub fn verify(&self, catalog: &dyn Catalog) -> bool {
        self.scans.iter().all(|s| s.verify(catalog))
    }
}

/// Union of several secondary scans; emits each key once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnionScan {
    pub scans: Vec<PlanOp>,
    #[serde(with = "opt_expr_serde", default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<Expr>,
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl UnionScan {
    pub fn new(limit: Option<Expr>, estimate: OptEstimate, mut scans: Vec<PlanOp>) -> Self {
        for scan in &mut scans {
            clear_limit_offset(scan);
        }

        let mut flat = Vec::with_capacity(scans.len() * 2);
        flatten_union(scans, &mut flat);

        let n = flat.len();
        if n > MAX_SCAN_FANIN {
            let right = flat.split_off(n / 2);
            let half = estimate.halve_cost();
            let lower_left = UnionScan {
                scans: flat,
                limit: None,
                estimate: half,
            };
            let lower_right = UnionScan {
                scans: right,
                limit: None,
                estimate: half,
            };
            return UnionScan {
                scans: vec![lower_left.into(), lower_right.into()],
                limit,
                estimate,
            };
        }

        UnionScan {
            scans: flat,
            limit,
            estimate,
        }
    }

    pub fn verify(&self, catalog: &dyn Catalog) -> bool {
        self.scans.iter().all(|s| s.verify(catalog))
    }
}

/// Clear limit and offset on a nested secondary scan; the enclosing set
/// operator owns limit pushdown.
pub(crate) fn clear_limit_offset(op: &mut PlanOp) {
    match op {
        PlanOp::PrimaryScan(s) => s.limit = None,
        PlanOp::IndexScan(s) => {
            s.limit = None;
            s.offset = None;
        }
        PlanOp::IntersectScan(s) => s.limit = None,
        PlanOp::OrderedIntersectScan(s) => s.limit = None,
        PlanOp::UnionScan(s) => s.limit = None,
        _ => {}
    }
}

fn flatten_intersect(scans: Vec<PlanOp>, buf: &mut Vec<PlanOp>) {
    for scan in scans {
        match scan {
            PlanOp::IntersectScan(inner) => flatten_intersect(inner.scans, buf),
            other => buf.push(other),
        }
    }
}

fn flatten_union(scans: Vec<PlanOp>, buf: &mut Vec<PlanOp>) {
    for scan in scans {
        match scan {
            PlanOp::UnionScan(inner) => flatten_union(inner.scans, buf),
            other => buf.push(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::tests::{index_scan, keyspace_term};

    #[test]
    fn test_intersect_clears_child_limits() {
        let mut child = index_scan("b");
        child.limit = Some(Expr::literal(10));
        child.offset = Some(Expr::literal(5));

        let scan = IntersectScan::new(
            Some(Expr::literal(10)),
            OptEstimate::unavailable(),
            vec![child.into(), index_scan("c").into()],
        );

        for s in &scan.scans {
            let PlanOp::IndexScan(s) = s else {
                panic!("expected index scan");
            };
            assert!(s.limit.is_none());
            assert!(s.offset.is_none());
        }
        assert!(scan.limit.is_some());
    }

    #[test]
    fn test_intersect_flattens_same_kind_children() {
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

        let fields: Vec<String> = outer
            .scans
            .iter()
            .map(|s| match s {
                PlanOp::IndexScan(s) => s.index.clone(),
                other => panic!("unexpected child {}", other.name()),
            })
            .collect();
        assert_eq!(fields, vec!["idx_a", "idx_b", "idx_c", "idx_d"]);
    }

    #[test]
    fn test_union_does_not_flatten_intersect_children() {
        let inner = IntersectScan::new(
            None,
            OptEstimate::unavailable(),
            vec![index_scan("b").into(), index_scan("c").into()],
        );
        let union = UnionScan::new(
            None,
            OptEstimate::unavailable(),
            vec![index_scan("a").into(), inner.into()],
        );
        assert_eq!(union.scans.len(), 2);
        assert!(matches!(union.scans[1], PlanOp::IntersectScan(_)));
    }

    #[test]
    fn test_wide_intersect_rebalanced_two_level() {
        let scans: Vec<PlanOp> = (0..70).map(|i| index_scan(&format!("f{}", i)).into()).collect();
        let scan = IntersectScan::new(
            Some(Expr::literal(10)),
            OptEstimate::new(100.0, 10.0, 8, 1.0),
            scans,
        );

        assert_eq!(scan.scans.len(), 2);
        let (PlanOp::IntersectScan(left), PlanOp::IntersectScan(right)) =
            (&scan.scans[0], &scan.scans[1])
        else {
            panic!("expected nested intersect scans");
        };
        assert_eq!(left.scans.len(), 35);
        assert_eq!(right.scans.len(), 35);
        // only the outer keeps the limit
        assert!(left.limit.is_none() && right.limit.is_none());
        assert!(scan.limit.is_some());
        assert_eq!(left.estimate.cost, 50.0);
    }

    #[test]
    fn test_primary_scan_keyspace_term() {
        let scan = PrimaryScan::new(keyspace_term("t"), None, OptEstimate::unavailable());
        assert_eq!(scan.keyspace.alias, "t");
    }
}
