//! DML plan nodes
//!
//! Send operators push batched mutations to the datastore. Clone, Set,
//! and Unset prepare the working copy an update writes back. Merge
//! multiplexes a match stream over up to three action subtrees.

use serde::{Deserialize, Serialize};

use crate::datastore::Catalog;
use crate::expression::{expr_vec_serde, opt_expr_serde, Expr};

use super::estimate::OptEstimate;
use super::{KeyspaceTerm, PlanOp};

/// Batched inserts into the target keyspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendInsert {
    pub keyspace: KeyspaceTerm,
    /// Key expression for MERGE-driven inserts; plain INSERT rows carry
    /// their key from the value scan.
    #[serde(with = "opt_expr_serde", default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Expr>,
    /// Value expression for MERGE-driven inserts.
    #[serde(with = "opt_expr_serde", default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Expr>,
    #[serde(with = "opt_expr_serde", default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<Expr>,
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl SendInsert {
    pub fn new(
        keyspace: KeyspaceTerm,
        key: Option<Expr>,
        value: Option<Expr>,
        limit: Option<Expr>,
        estimate: OptEstimate,
    ) -> Self {
        Self {
            keyspace,
            key,
            value,
            limit,
            estimate,
        }
    }

    pub fn verify(&self, catalog: &dyn Catalog) -> bool {
        self.keyspace.verify(catalog)
    }
}

/// Batched updates writing back the working copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendUpdate {
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

impl SendUpdate {
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

/// Batched deletes by document key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendDelete {
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

impl SendDelete {
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

/// Insert-or-replace by key and value expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upsert {
    pub keyspace: KeyspaceTerm,
    #[serde(with = "opt_expr_serde", default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Expr>,
    #[serde(with = "opt_expr_serde", default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Expr>,
    #[serde(with = "opt_expr_serde", default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<Expr>,
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl Upsert {
    pub fn new(
        keyspace: KeyspaceTerm,
        key: Option<Expr>,
        value: Option<Expr>,
        limit: Option<Expr>,
        estimate: OptEstimate,
    ) -> Self {
        Self {
            keyspace,
            key,
            value,
            limit,
            estimate,
        }
    }

    pub fn verify(&self, catalog: &dyn Catalog) -> bool {
        self.keyspace.verify(catalog)
    }
}

/// Copy the target document into the row's working-copy attachment so
/// Set and Unset mutate a private copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clone {
    pub alias: String,
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl Clone {
    pub fn new(alias: &str, estimate: OptEstimate) -> Self {
        Self {
            alias: alias.to_string(),
            estimate,
        }
    }
}

/// One SET term of the wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetTermDef {
    /// Field path relative to the working copy.
    #[serde(with = "crate::expression::expr_serde")]
    pub path: Expr,
    #[serde(with = "crate::expression::expr_serde")]
    pub value: Expr,
}

/// Apply SET terms to the working copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Set {
    pub terms: Vec<SetTermDef>,
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl Set {
    pub fn new(terms: Vec<SetTermDef>, estimate: OptEstimate) -> Self {
        Self { terms, estimate }
    }
}

/// Remove UNSET paths from the working copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unset {
    #[serde(with = "expr_vec_serde")]
    pub paths: Vec<Expr>,
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl Unset {
    pub fn new(paths: Vec<Expr>, estimate: OptEstimate) -> Self {
        Self { paths, estimate }
    }
}

/// MERGE: per source row, look up the target document by key and route
/// the row to the update/delete subtrees on a match, or the insert
/// subtree otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Merge {
    pub keyspace: KeyspaceTerm,
    /// Key expression of an ON KEY merge; join-driven merges thread the
    /// key through the row instead.
    #[serde(with = "opt_expr_serde", default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Expr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<Box<PlanOp>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete: Option<Box<PlanOp>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insert: Option<Box<PlanOp>>,
    #[serde(
        rename = "optimizer_estimates",
        default,
        skip_serializing_if = "OptEstimate::is_unavailable"
    )]
    pub estimate: OptEstimate,
}

impl Merge {
    pub fn new(
        keyspace: KeyspaceTerm,
        key: Option<Expr>,
        update: Option<PlanOp>,
        delete: Option<PlanOp>,
        insert: Option<PlanOp>,
        estimate: OptEstimate,
    ) -> Self {
        Self {
            keyspace,
            key,
            update: update.map(Box::new),
            delete: delete.map(Box::new),
            insert: insert.map(Box::new),
            estimate,
        }
    }

    pub fn verify(&self, catalog: &dyn Catalog) -> bool {
        if !self.keyspace.verify(catalog) {
            return false;
        }
        for child in [&self.update, &self.delete, &self.insert].into_iter().flatten() {
            if !child.verify(catalog) {
                return false;
            }
        }
        true
    }
}
