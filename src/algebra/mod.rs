//! Statement descriptions
//!
//! Parsed, semantically validated statements as the planner receives
//! them. Statements are built through constructors by the admission
//! layer; there is no SQL text handling here.

pub mod aggregates;

use crate::expression::Expr;

pub use aggregates::{AggregateCall, AggregateKind};

/// A keyspace reference with its statement alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyspaceRef {
    pub name: String,
    pub alias: String,
}

impl KeyspaceRef {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            alias: name.to_string(),
        }
    }

    pub fn with_alias(name: &str, alias: &str) -> Self {
        Self {
            name: name.to_string(),
            alias: alias.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Statement {
    Select(Select),
    Insert(Insert),
    /// INSERT-or-replace; same shape as Insert.
    Upsert(Insert),
    Update(Update),
    Delete(Delete),
    Merge(Merge),
    CreateFunction(CreateFunction),
    Prepare(Prepare),
}

impl Statement {
    /// Statements that never mutate the datastore.
    pub fn readonly(&self) -> bool {
        matches!(self, Statement::Select(_) | Statement::Prepare(_))
    }
}

/// A projection term: expression plus result alias. `star` projects the
/// whole bound document.
#[derive(Debug, Clone)]
pub struct ProjectionTerm {
    pub expr: Option<Expr>,
    pub alias: String,
    pub star: bool,
}

impl ProjectionTerm {
    pub fn expr(expr: Expr, alias: &str) -> Self {
        Self {
            expr: Some(expr),
            alias: alias.to_string(),
            star: false,
        }
    }

    pub fn star() -> Self {
        Self {
            expr: None,
            alias: String::new(),
            star: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub struct OrderTerm {
    pub expr: Expr,
    pub order: SortOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOpKind {
    UnionAll,
    Intersect,
    Except,
}

#[derive(Debug, Clone)]
pub struct Select {
    pub keyspace: KeyspaceRef,
    pub projection: Vec<ProjectionTerm>,
    pub filter: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub aggregates: Vec<AggregateCall>,
    pub order_by: Vec<OrderTerm>,
    pub limit: Option<Expr>,
    pub offset: Option<Expr>,
    pub distinct: bool,
    /// Trailing set operation combining with another select.
    pub set_op: Option<(SetOpKind, Box<Select>)>,
}

impl Select {
    pub fn new(keyspace: KeyspaceRef) -> Self {
        Self {
            keyspace,
            projection: vec![ProjectionTerm::star()],
            filter: None,
            group_by: Vec::new(),
            aggregates: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            distinct: false,
            set_op: None,
        }
    }

    pub fn with_projection(mut self, terms: Vec<ProjectionTerm>) -> Self {
        self.projection = terms;
        self
    }

    pub fn with_filter(mut self, filter: Expr) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_aggregates(mut self, aggs: Vec<AggregateCall>) -> Self {
        self.aggregates = aggs;
        self
    }

    pub fn with_group_by(mut self, keys: Vec<Expr>) -> Self {
        self.group_by = keys;
        self
    }

    pub fn with_order_by(mut self, terms: Vec<OrderTerm>) -> Self {
        self.order_by = terms;
        self
    }

    pub fn with_limit(mut self, limit: Expr) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: Expr) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_set_op(mut self, kind: SetOpKind, other: Select) -> Self {
        self.set_op = Some((kind, Box::new(other)));
        self
    }
}

/// INSERT INTO ks (KEY, VALUE) VALUES ...
#[derive(Debug, Clone)]
pub struct Insert {
    pub keyspace: KeyspaceRef,
    /// (key expression, value expression) pairs.
    pub values: Vec<(Expr, Expr)>,
    pub limit: Option<Expr>,
    pub returning: Option<Vec<ProjectionTerm>>,
}

#[derive(Debug, Clone)]
pub struct Update {
    pub keyspace: KeyspaceRef,
    pub filter: Option<Expr>,
    /// (field path under the alias, value expression).
    pub set: Vec<(Expr, Expr)>,
    pub unset: Vec<Expr>,
    pub limit: Option<Expr>,
    pub returning: Option<Vec<ProjectionTerm>>,
}

#[derive(Debug, Clone)]
pub struct Delete {
    pub keyspace: KeyspaceRef,
    pub filter: Option<Expr>,
    pub limit: Option<Expr>,
    pub returning: Option<Vec<ProjectionTerm>>,
}

/// The matching clause of a MERGE.
#[derive(Debug, Clone)]
pub enum MergeOn {
    /// ON KEY: the expression yields the target document key.
    Key(Expr),
    /// ON clause: a join predicate between source and target aliases.
    Clause(Expr),
}

#[derive(Debug, Clone)]
pub struct MergeUpdateAction {
    pub set: Vec<(Expr, Expr)>,
    pub unset: Vec<Expr>,
    pub filter: Option<Expr>,
}

#[derive(Debug, Clone)]
pub struct MergeDeleteAction {
    pub filter: Option<Expr>,
}

#[derive(Debug, Clone)]
pub struct MergeInsertAction {
    pub key: Option<Expr>,
    pub value: Expr,
    pub filter: Option<Expr>,
}

#[derive(Debug, Clone, Default)]
pub struct MergeActions {
    pub update: Option<MergeUpdateAction>,
    pub delete: Option<MergeDeleteAction>,
    pub insert: Option<MergeInsertAction>,
}

#[derive(Debug, Clone)]
pub struct Merge {
    pub target: KeyspaceRef,
    pub source: KeyspaceRef,
    pub on: MergeOn,
    pub actions: MergeActions,
    pub limit: Option<Expr>,
    pub returning: Option<Vec<ProjectionTerm>>,
}

impl Merge {
    pub fn is_on_key(&self) -> bool {
        matches!(self.on, MergeOn::Key(_))
    }

    pub fn on_expr(&self) -> &Expr {
        match &self.on {
            MergeOn::Key(e) | MergeOn::Clause(e) => e,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateFunction {
    pub name: String,
    pub body: serde_json::Value,
    pub replace: bool,
}

#[derive(Debug, Clone)]
pub struct Prepare {
    pub name: String,
    pub statement: Box<Statement>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::Expr;

    #[test]
    fn test_readonly_classification() {
        let sel = Statement::Select(Select::new(KeyspaceRef::new("t")));
        assert!(sel.readonly());

        let del = Statement::Delete(Delete {
            keyspace: KeyspaceRef::new("t"),
            filter: None,
            limit: None,
            returning: None,
        });
        assert!(!del.readonly());
    }

    #[test]
    fn test_merge_on_key() {
        let m = Merge {
            target: KeyspaceRef::with_alias("t", "t"),
            source: KeyspaceRef::with_alias("s", "src"),
            on: MergeOn::Key(Expr::path("src.id")),
            actions: MergeActions::default(),
            limit: None,
            returning: None,
        };
        assert!(m.is_on_key());
        assert_eq!(m.on_expr().to_string(), "src.id");
    }
}
