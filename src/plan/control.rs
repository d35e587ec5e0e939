//! Composite and utility plan nodes

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::datastore::Catalog;

use super::estimate::OptEstimate;
use super::PlanOp;

/// Operators wired end to end; the sequence's input is the first
/// child's input and its output the last child's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    pub children: Vec<PlanOp>,
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl Sequence {
    pub fn new(children: Vec<PlanOp>, estimate: OptEstimate) -> Self {
        Self { children, estimate }
    }

    pub fn verify(&self, catalog: &dyn Catalog) -> bool {
        self.children.iter().all(|c| c.verify(catalog))
    }
}

/// Fan input out to copies of the child subtree; outputs fan back in
/// arbitrary order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parallel {
    pub child: Box<PlanOp>,
    pub max_parallelism: usize,
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl Parallel {
    pub fn new(child: PlanOp, max_parallelism: usize, estimate: OptEstimate) -> Self {
        Self {
            child: Box::new(child),
            max_parallelism: max_parallelism.max(1),
            estimate,
        }
    }

    pub fn verify(&self, catalog: &dyn Catalog) -> bool {
        self.child.verify(catalog)
    }
}

/// PREPARE result: carries the JSON form of the inner plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prepare {
    pub name: String,
    pub prepared: Value,
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl Prepare {
    pub fn new(name: &str, prepared: Value, estimate: OptEstimate) -> Self {
        Self {
            name: name.to_string(),
            prepared,
            estimate,
        }
    }
}

/// Swallow all input; terminal stage of RETURNING-less DML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discard {
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl Discard {
    pub fn new(estimate: OptEstimate) -> Self {
        Self { estimate }
    }
}

/// Relay rows to the client sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl Stream {
    pub fn new(estimate: OptEstimate) -> Self {
        Self { estimate }
    }
}

/// Buffer the whole input and expose it as one array value; used for
/// subquery results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collect {
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl Collect {
    pub fn new(estimate: OptEstimate) -> Self {
        Self { estimate }
    }
}

/// Credential check guarding a subtree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Authorize {
    pub keyspace: String,
    pub child: Box<PlanOp>,
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl Authorize {
    pub fn new(keyspace: &str, child: PlanOp, estimate: OptEstimate) -> Self {
        Self {
            keyspace: keyspace.to_string(),
            child: Box::new(child),
            estimate,
        }
    }

    pub fn verify(&self, catalog: &dyn Catalog) -> bool {
        self.child.verify(catalog)
    }
}

/// Register a named function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateFunction {
    pub name: String,
    pub body: Value,
    #[serde(default)]
    pub replace: bool,
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl CreateFunction {
    pub fn new(name: &str, body: Value, replace: bool, estimate: OptEstimate) -> Self {
        Self {
            name: name.to_string(),
            body,
            replace,
            estimate,
        }
    }
}
