//! Filter, projection, grouping, and ordering plan nodes

use serde::{Deserialize, Serialize};

use crate::algebra::AggregateKind;
use crate::expression::{expr_vec_serde, opt_expr_serde, Expr};

use super::estimate::OptEstimate;

/// Predicate filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(with = "crate::expression::expr_serde")]
    pub condition: Expr,
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl Filter {
    pub fn new(condition: Expr, estimate: OptEstimate) -> Self {
        Self {
            condition,
            estimate,
        }
    }
}

/// One projection term of the wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionDef {
    #[serde(with = "opt_expr_serde", default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<Expr>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub alias: String,
    #[serde(default)]
    pub star: bool,
}

/// Row shaping: evaluates projection terms into result objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialProject {
    pub terms: Vec<ProjectionDef>,
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl InitialProject {
    pub fn new(terms: Vec<ProjectionDef>, estimate: OptEstimate) -> Self {
        Self { terms, estimate }
    }
}

/// Final projection: strips attachments and releases rows to the client
/// shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalProject {
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl FinalProject {
    pub fn new(estimate: OptEstimate) -> Self {
        Self { estimate }
    }
}

/// One aggregate of the wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateDef {
    pub kind: AggregateKind,
    #[serde(with = "crate::expression::expr_serde")]
    pub operand: Expr,
    pub alias: String,
}

/// First grouping phase: folds raw rows into per-group aggregate parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialGroup {
    #[serde(with = "expr_vec_serde")]
    pub keys: Vec<Expr>,
    pub aggregates: Vec<AggregateDef>,
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl InitialGroup {
    pub fn new(keys: Vec<Expr>, aggregates: Vec<AggregateDef>, estimate: OptEstimate) -> Self {
        Self {
            keys,
            aggregates,
            estimate,
        }
    }
}

/// Middle grouping phase: merges parts produced by parallel initial
/// groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntermediateGroup {
    #[serde(with = "expr_vec_serde")]
    pub keys: Vec<Expr>,
    pub aggregates: Vec<AggregateDef>,
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl IntermediateGroup {
    pub fn new(keys: Vec<Expr>, aggregates: Vec<AggregateDef>, estimate: OptEstimate) -> Self {
        Self {
            keys,
            aggregates,
            estimate,
        }
    }
}

/// Last grouping phase: computes final aggregate values per group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalGroup {
    #[serde(with = "expr_vec_serde")]
    pub keys: Vec<Expr>,
    pub aggregates: Vec<AggregateDef>,
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl FinalGroup {
    pub fn new(keys: Vec<Expr>, aggregates: Vec<AggregateDef>, estimate: OptEstimate) -> Self {
        Self {
            keys,
            aggregates,
            estimate,
        }
    }
}

/// Duplicate elimination over whole rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Distinct {
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl Distinct {
    pub fn new(estimate: OptEstimate) -> Self {
        Self { estimate }
    }
}

/// One sort term of the wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderDef {
    #[serde(with = "crate::expression::expr_serde")]
    pub expr: Expr,
    #[serde(default)]
    pub desc: bool,
}

/// Full sort of the input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub terms: Vec<OrderDef>,
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl Order {
    pub fn new(terms: Vec<OrderDef>, estimate: OptEstimate) -> Self {
        Self { terms, estimate }
    }
}

/// Row-count cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Limit {
    #[serde(with = "crate::expression::expr_serde")]
    pub expr: Expr,
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl Limit {
    pub fn new(expr: Expr, estimate: OptEstimate) -> Self {
        Self { expr, estimate }
    }
}

/// Leading-row skip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offset {
    #[serde(with = "crate::expression::expr_serde")]
    pub expr: Expr,
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl Offset {
    pub fn new(expr: Expr, estimate: OptEstimate) -> Self {
        Self { expr, estimate }
    }
}
