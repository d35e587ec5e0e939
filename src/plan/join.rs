//! Join plan nodes

use serde::{Deserialize, Serialize};

use crate::datastore::Catalog;
use crate::expression::{expr_vec_serde, opt_expr_serde, Expr};

use super::estimate::OptEstimate;
use super::{KeyspaceTerm, PlanOp};

/// Lookup join: per input row, evaluate the key expression and fetch the
/// matching document from the target keyspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Join {
    pub keyspace: KeyspaceTerm,
    #[serde(with = "crate::expression::expr_serde")]
    pub on_keys: Expr,
    #[serde(default)]
    pub outer: bool,
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl Join {
    pub fn new(keyspace: KeyspaceTerm, on_keys: Expr, outer: bool, estimate: OptEstimate) -> Self {
        Self {
            keyspace,
            on_keys,
            outer,
            estimate,
        }
    }

    pub fn verify(&self, catalog: &dyn Catalog) -> bool {
        self.keyspace.verify(catalog)
    }
}

/// Nested-loop join: the right subtree is materialized once, then
/// matched against every left row with the ON clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NLJoin {
    pub right: Box<PlanOp>,
    #[serde(with = "crate::expression::expr_serde")]
    pub on_clause: Expr,
    #[serde(default)]
    pub outer: bool,
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl NLJoin {
    pub fn new(right: PlanOp, on_clause: Expr, outer: bool, estimate: OptEstimate) -> Self {
        Self {
            right: Box::new(right),
            on_clause,
            outer,
            estimate,
        }
    }

    pub fn verify(&self, catalog: &dyn Catalog) -> bool {
        self.right.verify(catalog)
    }
}

/// Hash join: build a table over the right subtree keyed by the build
/// expressions, probe with the left rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashJoin {
    pub right: Box<PlanOp>,
    #[serde(with = "expr_vec_serde")]
    pub build_exprs: Vec<Expr>,
    #[serde(with = "expr_vec_serde")]
    pub probe_exprs: Vec<Expr>,
    #[serde(with = "opt_expr_serde", default, skip_serializing_if = "Option::is_none")]
    pub on_clause: Option<Expr>,
    #[serde(default)]
    pub outer: bool,
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl HashJoin {
    pub fn new(
        right: PlanOp,
        build_exprs: Vec<Expr>,
        probe_exprs: Vec<Expr>,
        on_clause: Option<Expr>,
        outer: bool,
        estimate: OptEstimate,
    ) -> Self {
        Self {
            right: Box::new(right),
            build_exprs,
            probe_exprs,
            on_clause,
            outer,
            estimate,
        }
    }

    pub fn verify(&self, catalog: &dyn Catalog) -> bool {
        self.right.verify(catalog)
    }
}
