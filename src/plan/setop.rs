//! Set operator plan nodes

use serde::{Deserialize, Serialize};

use crate::datastore::Catalog;

use super::estimate::OptEstimate;
use super::PlanOp;

/// Concatenation of child pipelines, no duplicate elimination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnionAll {
    pub children: Vec<PlanOp>,
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl UnionAll {
    pub fn new(children: Vec<PlanOp>, estimate: OptEstimate) -> Self {
        Self { children, estimate }
    }

    pub fn verify(&self, catalog: &dyn Catalog) -> bool {
        self.children.iter().all(|c| c.verify(catalog))
    }
}

/// Rows of the first pipeline also produced by the second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntersectAll {
    pub first: Box<PlanOp>,
    pub second: Box<PlanOp>,
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl IntersectAll {
    pub fn new(first: PlanOp, second: PlanOp, estimate: OptEstimate) -> Self {
        Self {
            first: Box::new(first),
            second: Box::new(second),
            estimate,
        }
    }

    pub fn verify(&self, catalog: &dyn Catalog) -> bool {
        self.first.verify(catalog) && self.second.verify(catalog)
    }
}

/// Rows of the first pipeline not produced by the second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptAll {
    pub first: Box<PlanOp>,
    pub second: Box<PlanOp>,
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl ExceptAll {
    pub fn new(first: PlanOp, second: PlanOp, estimate: OptEstimate) -> Self {
        Self {
            first: Box::new(first),
            second: Box::new(second),
            estimate,
        }
    }

    pub fn verify(&self, catalog: &dyn Catalog) -> bool {
        self.first.verify(catalog) && self.second.verify(catalog)
    }
}
