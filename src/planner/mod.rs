//! Plan builder
//!
//! Single-pass visitor over validated statements. The builder keeps two
//! accumulators: `children`, the operators of the final sequence, and
//! `sub_children`, operators that run per-row and are wrapped in a
//! Parallel fan-out when flushed. Index choices arrive as opaque hints
//! from the index advisor; the builder never ranks alternatives itself.

mod build_dml;
mod build_merge;
pub mod errors;

use std::collections::HashMap;
use std::sync::Arc;

use crate::algebra::{
    ProjectionTerm, Select, SetOpKind, Statement,
};
use crate::core::EngineConfig;
use crate::datastore::{Catalog, IndexSpan, Keyspace};
use crate::expression::Expr;
use crate::plan::{
    AggregateDef, Distinct, ExceptAll, Fetch, Filter, FinalGroup, FinalProject, IndexScan,
    InitialGroup, InitialProject, IntermediateGroup, IntersectAll, IntersectScan, KeyspaceTerm,
    Limit, Offset, OptEstimate, Order, OrderDef, OrderedIntersectScan, Parallel, PlanOp,
    PrimaryScan, ProjectionDef, Sequence, Stream, UnionAll, UnionScan,
};

pub use errors::{PlannerError, Result};

/// An index choice handed to the builder by the index advisor. Opaque:
/// the builder uses every hint it is given.
#[derive(Debug, Clone)]
pub struct IndexHint {
    pub index: String,
    pub span: IndexSpan,
    pub covering: bool,
    pub estimate: OptEstimate,
}

/// How multiple hints for one keyspace combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanCombine {
    #[default]
    Intersect,
    OrderedIntersect,
    Union,
}

#[derive(Debug, Clone, Default)]
pub struct ScanChoice {
    pub combine: ScanCombine,
    pub hints: Vec<IndexHint>,
}

/// Per-statement planner inputs.
#[derive(Debug, Clone, Default)]
pub struct PlannerOptions {
    pub use_cbo: bool,
    /// Scan choices per keyspace name.
    pub scan_choices: HashMap<String, ScanChoice>,
}

impl PlannerOptions {
    pub fn with_cbo(mut self) -> Self {
        self.use_cbo = true;
        self
    }

    pub fn with_scan_choice(mut self, keyspace: &str, choice: ScanChoice) -> Self {
        self.scan_choices.insert(keyspace.to_string(), choice);
        self
    }
}

/// Statement-to-plan builder.
pub struct Builder<'a> {
    catalog: &'a dyn Catalog,
    config: &'a EngineConfig,
    options: PlannerOptions,
    prepared: Option<&'a crate::prepared::PreparedCache>,

    children: Vec<PlanOp>,
    sub_children: Vec<PlanOp>,
    last_estimate: OptEstimate,
}

impl<'a> Builder<'a> {
    pub fn new(catalog: &'a dyn Catalog, config: &'a EngineConfig, options: PlannerOptions) -> Self {
        Self {
            catalog,
            config,
            options,
            prepared: None,
            children: Vec::with_capacity(8),
            sub_children: Vec::with_capacity(8),
            last_estimate: OptEstimate::unavailable(),
        }
    }

    /// PREPARE statements insert their inner plan here.
    pub fn with_prepared_cache(mut self, cache: &'a crate::prepared::PreparedCache) -> Self {
        self.prepared = Some(cache);
        self
    }

    pub fn use_cbo(&self) -> bool {
        self.options.use_cbo
    }

    /// Build a plan for `stmt`. The returned root is always a Sequence.
    pub fn build(&mut self, stmt: &Statement) -> Result<PlanOp> {
        self.children.clear();
        self.sub_children.clear();
        self.last_estimate = OptEstimate::unavailable();

        match stmt {
            Statement::Select(sel) => self.build_select(sel),
            Statement::Insert(ins) => self.build_insert(ins),
            Statement::Upsert(ups) => self.build_upsert(ups),
            Statement::Update(upd) => self.build_update(upd),
            Statement::Delete(del) => self.build_delete(del),
            Statement::Merge(merge) => self.build_merge(merge),
            Statement::CreateFunction(cf) => self.build_create_function(cf),
            Statement::Prepare(prep) => self.build_prepare(prep),
        }
    }

    // --- accumulator plumbing ---

    fn add_child(&mut self, op: impl Into<PlanOp>) {
        let op = op.into();
        self.last_estimate = *op.estimate();
        self.children.push(op);
    }

    fn add_sub_child(&mut self, op: impl Into<PlanOp>) {
        let op = op.into();
        self.last_estimate = *op.estimate();
        self.sub_children.push(op);
    }

    /// Wrap the accumulated per-row operators in a Parallel fan-out and
    /// append it to the main sequence.
    fn flush_parallel(&mut self) {
        self.flush_parallel_n(self.config.parallelism);
    }

    /// As `flush_parallel` with an explicit arity. DML with a LIMIT
    /// serializes the fan-out so a single send operator owns the cap.
    fn flush_parallel_n(&mut self, arity: usize) {
        if self.sub_children.is_empty() {
            return;
        }
        let sub = std::mem::take(&mut self.sub_children);
        let estimate = sub.last().map(|op| *op.estimate()).unwrap_or_default();
        let child = PlanOp::Sequence(Sequence::new(sub, estimate));
        self.children
            .push(Parallel::new(child, arity, estimate).into());
    }

    fn finish(&mut self) -> PlanOp {
        self.flush_parallel();
        let estimate = self.last_estimate;
        PlanOp::Sequence(Sequence::new(std::mem::take(&mut self.children), estimate))
    }

    fn keyspace(&self, name: &str) -> Result<Arc<dyn Keyspace>> {
        self.catalog
            .keyspace(name)
            .ok_or_else(|| PlannerError::KeyspaceNotFound(name.to_string()))
    }

    // --- scan planning ---

    /// Emit the scan stage for a keyspace into `children`, honoring the
    /// advisor's choices. Returns whether the chosen scan covers its
    /// consumers (no fetch needed).
    fn build_scan(
        &mut self,
        ks: &Arc<dyn Keyspace>,
        alias: &str,
        limit: Option<&Expr>,
    ) -> Result<bool> {
        let term = KeyspaceTerm::from_keyspace(ks.as_ref(), alias);
        let choice = self.options.scan_choices.get(ks.name()).cloned();

        let Some(choice) = choice.filter(|c| !c.hints.is_empty()) else {
            let estimate = self.scan_estimate(ks);
            self.add_child(PrimaryScan::new(term, limit.cloned(), estimate));
            return Ok(false);
        };

        let mut scans: Vec<PlanOp> = Vec::with_capacity(choice.hints.len());
        let mut covering = true;
        let mut combined = OptEstimate::unavailable();
        for hint in &choice.hints {
            let index = ks.index(&hint.index).ok_or_else(|| PlannerError::IndexNotFound {
                keyspace: ks.name().to_string(),
                index: hint.index.clone(),
            })?;
            covering &= hint.covering;
            combined = if scans.is_empty() {
                hint.estimate
            } else {
                combined.add(&hint.estimate)
            };
            let mut scan = IndexScan::new(
                term.clone(),
                &hint.index,
                index.fingerprint(),
                hint.span.clone(),
                hint.estimate,
            );
            scan.covering = hint.covering;
            scans.push(scan.into());
        }

        if scans.len() == 1 {
            let mut only = scans.remove(0);
            if let PlanOp::IndexScan(scan) = &mut only {
                scan.limit = limit.cloned();
            }
            self.last_estimate = *only.estimate();
            self.children.push(only);
            return Ok(covering);
        }

        let op: PlanOp = match choice.combine {
            ScanCombine::Intersect => {
                IntersectScan::new(limit.cloned(), combined, scans).into()
            }
            ScanCombine::OrderedIntersect => {
                OrderedIntersectScan::new(limit.cloned(), combined, scans).into()
            }
            ScanCombine::Union => UnionScan::new(limit.cloned(), combined, scans).into(),
        };
        self.last_estimate = *op.estimate();
        self.children.push(op);
        Ok(covering)
    }

    fn scan_estimate(&self, ks: &Arc<dyn Keyspace>) -> OptEstimate {
        if !self.use_cbo() {
            return OptEstimate::unavailable();
        }
        let card = ks.count() as f64;
        OptEstimate::new(card.max(1.0), card, 64, 1.0)
    }

    /// Rolling estimate for an operator appended after `last`: same
    /// cardinality, cost grows with the rows passing through.
    fn rolling_estimate(&self, cardinality: Option<f64>) -> OptEstimate {
        if !self.use_cbo() || self.last_estimate.is_unavailable() {
            return OptEstimate::unavailable();
        }
        let card = cardinality.unwrap_or(self.last_estimate.cardinality);
        OptEstimate::new(
            self.last_estimate.cost + card.max(0.0),
            card,
            self.last_estimate.size,
            self.last_estimate.fr_cost,
        )
    }

    // --- SELECT ---

    fn build_select(&mut self, sel: &Select) -> Result<PlanOp> {
        if let Some((kind, other)) = &sel.set_op {
            return self.build_set_op(sel, *kind, other);
        }

        let body = self.build_select_body(sel)?;
        self.children = match body {
            PlanOp::Sequence(seq) => seq.children,
            other => vec![other],
        };
        let estimate = self.last_estimate;
        self.add_child(Stream::new(estimate));
        Ok(self.finish())
    }

    /// SELECT pipeline without the trailing Stream, reusable as a set
    /// operation branch.
    fn build_select_body(&mut self, sel: &Select) -> Result<PlanOp> {
        let ks = self.keyspace(&sel.keyspace.name)?;
        let alias = sel.keyspace.alias.clone();

        // limit pushes down to the scan only when nothing between the
        // scan and the limit can drop rows
        let pushable_limit = if sel.filter.is_none()
            && sel.aggregates.is_empty()
            && sel.order_by.is_empty()
            && sel.offset.is_none()
            && !sel.distinct
        {
            sel.limit.as_ref()
        } else {
            None
        };

        let covering = self.build_scan(&ks, &alias, pushable_limit)?;

        if !covering {
            let term = KeyspaceTerm::from_keyspace(ks.as_ref(), &alias);
            let estimate = self.rolling_estimate(None);
            self.add_sub_child(Fetch::new(term, estimate));
        }

        if let Some(filter) = &sel.filter {
            let estimate = self.filter_estimate();
            self.add_sub_child(Filter::new(filter.clone(), estimate));
        }

        if sel.aggregates.is_empty() {
            let estimate = self.rolling_estimate(None);
            self.add_sub_child(InitialProject::new(
                projection_defs(&sel.projection),
                estimate,
            ));
        } else {
            let defs: Vec<AggregateDef> = sel
                .aggregates
                .iter()
                .map(|a| AggregateDef {
                    kind: a.kind,
                    operand: a.operand.clone(),
                    alias: a.alias.clone(),
                })
                .collect();
            let group_card = if sel.group_by.is_empty() { Some(1.0) } else { None };
            let estimate = self.rolling_estimate(group_card);
            self.add_sub_child(InitialGroup::new(sel.group_by.clone(), defs.clone(), estimate));
            self.flush_parallel();
            self.add_child(IntermediateGroup::new(sel.group_by.clone(), defs.clone(), estimate));
            self.add_child(FinalGroup::new(sel.group_by.clone(), defs, estimate));
        }

        if sel.distinct {
            let estimate = self.rolling_estimate(None);
            self.add_sub_child(Distinct::new(estimate));
        }

        self.flush_parallel();

        if !sel.order_by.is_empty() {
            let terms = sel
                .order_by
                .iter()
                .map(|t| OrderDef {
                    expr: t.expr.clone(),
                    desc: t.order == crate::algebra::SortOrder::Desc,
                })
                .collect();
            let estimate = self.rolling_estimate(None);
            self.add_child(Order::new(terms, estimate));
        }

        if let Some(offset) = &sel.offset {
            let estimate = self.rolling_estimate(None);
            self.add_child(Offset::new(offset.clone(), estimate));
        }

        if let Some(limit) = &sel.limit {
            let card = limit.as_static_i64().map(|n| n.max(0) as f64);
            let estimate = self.rolling_estimate(card);
            self.add_child(Limit::new(limit.clone(), estimate));
        }

        let estimate = self.last_estimate;
        self.add_child(FinalProject::new(estimate));

        Ok(self.finish())
    }

    fn build_set_op(&mut self, sel: &Select, kind: SetOpKind, other: &Select) -> Result<PlanOp> {
        // branches are planned as independent pipelines
        let mut stripped = sel.clone();
        stripped.set_op = None;
        stripped.order_by = Vec::new();
        stripped.limit = None;
        stripped.offset = None;

        let first = Builder::new(self.catalog, self.config, self.options.clone())
            .build_select_branch(&stripped)?;
        let second = Builder::new(self.catalog, self.config, self.options.clone())
            .build_select_branch(other)?;

        let estimate = first.estimate().add(second.estimate());
        let combined: PlanOp = match kind {
            SetOpKind::UnionAll => UnionAll::new(vec![first, second], estimate).into(),
            SetOpKind::Intersect => IntersectAll::new(first, second, estimate).into(),
            SetOpKind::Except => ExceptAll::new(first, second, estimate).into(),
        };

        self.children.clear();
        self.sub_children.clear();
        self.last_estimate = *combined.estimate();
        self.children.push(combined);

        if !sel.order_by.is_empty() {
            let terms = sel
                .order_by
                .iter()
                .map(|t| OrderDef {
                    expr: t.expr.clone(),
                    desc: t.order == crate::algebra::SortOrder::Desc,
                })
                .collect();
            let estimate = self.rolling_estimate(None);
            self.add_child(Order::new(terms, estimate));
        }
        if let Some(offset) = &sel.offset {
            let estimate = self.rolling_estimate(None);
            self.add_child(Offset::new(offset.clone(), estimate));
        }
        if let Some(limit) = &sel.limit {
            let estimate = self.rolling_estimate(limit.as_static_i64().map(|n| n.max(0) as f64));
            self.add_child(Limit::new(limit.clone(), estimate));
        }
        let estimate = self.last_estimate;
        self.add_child(Stream::new(estimate));
        Ok(self.finish())
    }

    fn build_select_branch(&mut self, sel: &Select) -> Result<PlanOp> {
        self.children.clear();
        self.sub_children.clear();
        self.last_estimate = OptEstimate::unavailable();
        self.build_select_body(sel)
    }

    fn filter_estimate(&self) -> OptEstimate {
        if !self.use_cbo() || self.last_estimate.is_unavailable() {
            return OptEstimate::unavailable();
        }
        // a filter halves the stream absent better information
        let card = (self.last_estimate.cardinality / 2.0).max(1.0);
        OptEstimate::new(
            self.last_estimate.cost + self.last_estimate.cardinality,
            card,
            self.last_estimate.size,
            self.last_estimate.fr_cost,
        )
    }
}

pub(crate) fn projection_defs(terms: &[ProjectionTerm]) -> Vec<ProjectionDef> {
    terms
        .iter()
        .map(|t| ProjectionDef {
            expr: t.expr.clone(),
            alias: t.alias.clone(),
            star: t.star,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::{AggregateCall, AggregateKind, KeyspaceRef};
    use crate::datastore::MemCatalog;
    use serde_json::json;

    fn setup() -> (MemCatalog, EngineConfig) {
        let catalog = MemCatalog::new();
        let ks = catalog.create_keyspace("t");
        ks.upsert(vec![
            ("k1".into(), json!({"a": 1, "b": 1, "c": 2})),
            ("k2".into(), json!({"a": 2, "b": 1, "c": 3})),
        ]);
        ks.create_index("idx_b", "b");
        ks.create_index("idx_c", "c");
        (catalog, EngineConfig::default())
    }

    fn hint(index: &str, val: i64) -> IndexHint {
        IndexHint {
            index: index.to_string(),
            span: IndexSpan::Eq(json!(val)),
            covering: false,
            estimate: OptEstimate::new(2.0, 1.0, 16, 0.5),
        }
    }

    fn sequence_children(plan: &PlanOp) -> &[PlanOp] {
        match plan {
            PlanOp::Sequence(seq) => &seq.children,
            other => panic!("expected sequence root, got {}", other.name()),
        }
    }

    #[test]
    fn test_select_with_two_hints_plans_intersect_scan() {
        let (catalog, config) = setup();
        let options = PlannerOptions::default().with_scan_choice(
            "t",
            ScanChoice {
                combine: ScanCombine::Intersect,
                hints: vec![hint("idx_b", 1), hint("idx_c", 2)],
            },
        );
        let stmt = Statement::Select(
            Select::new(KeyspaceRef::new("t"))
                .with_projection(vec![ProjectionTerm::expr(Expr::path("t.a"), "a")])
                .with_filter(
                    Expr::path("t.b")
                        .eq(Expr::literal(1))
                        .and(Expr::path("t.c").eq(Expr::literal(2))),
                ),
        );

        let plan = Builder::new(&catalog, &config, options).build(&stmt).unwrap();
        let children = sequence_children(&plan);
        let PlanOp::IntersectScan(scan) = &children[0] else {
            panic!("expected IntersectScan first, got {}", children[0].name());
        };
        assert_eq!(scan.scans.len(), 2);
        for child in &scan.scans {
            let PlanOp::IndexScan(child) = child else {
                panic!("expected IndexScan children");
            };
            assert!(child.limit.is_none());
            assert!(child.offset.is_none());
        }
        // per-row stages are wrapped in a Parallel fan-out
        assert!(children.iter().any(|c| matches!(c, PlanOp::Parallel(_))));
        assert!(matches!(children.last(), Some(PlanOp::Stream(_))));
    }

    #[test]
    fn test_select_without_hints_uses_primary_scan_with_limit_pushdown() {
        let (catalog, config) = setup();
        let stmt = Statement::Select(
            Select::new(KeyspaceRef::new("t")).with_limit(Expr::literal(10)),
        );
        let plan = Builder::new(&catalog, &config, PlannerOptions::default())
            .build(&stmt)
            .unwrap();
        let children = sequence_children(&plan);
        let PlanOp::PrimaryScan(scan) = &children[0] else {
            panic!("expected PrimaryScan");
        };
        assert_eq!(scan.limit.as_ref().and_then(|l| l.as_static_i64()), Some(10));
    }

    #[test]
    fn test_filtered_select_does_not_push_limit_into_scan() {
        let (catalog, config) = setup();
        let stmt = Statement::Select(
            Select::new(KeyspaceRef::new("t"))
                .with_filter(Expr::path("t.a").eq(Expr::literal(1)))
                .with_limit(Expr::literal(10)),
        );
        let plan = Builder::new(&catalog, &config, PlannerOptions::default())
            .build(&stmt)
            .unwrap();
        let children = sequence_children(&plan);
        let PlanOp::PrimaryScan(scan) = &children[0] else {
            panic!("expected PrimaryScan");
        };
        assert!(scan.limit.is_none());
        assert!(children.iter().any(|c| matches!(c, PlanOp::Limit(_))));
    }

    #[test]
    fn test_aggregate_select_plans_three_group_phases() {
        let (catalog, config) = setup();
        let stmt = Statement::Select(
            Select::new(KeyspaceRef::new("t")).with_aggregates(vec![AggregateCall::new(
                AggregateKind::Count,
                Expr::path("t.a"),
                "n",
            )]),
        );
        let plan = Builder::new(&catalog, &config, PlannerOptions::default())
            .build(&stmt)
            .unwrap();
        let children = sequence_children(&plan);
        assert!(children.iter().any(|c| matches!(c, PlanOp::IntermediateGroup(_))));
        assert!(children.iter().any(|c| matches!(c, PlanOp::FinalGroup(_))));
        // the initial group rides inside the parallel fan-out
        let par = children
            .iter()
            .find_map(|c| match c {
                PlanOp::Parallel(p) => Some(p),
                _ => None,
            })
            .expect("parallel stage");
        let PlanOp::Sequence(sub) = par.child.as_ref() else {
            panic!("parallel child must be a sequence");
        };
        assert!(sub.children.iter().any(|c| matches!(c, PlanOp::InitialGroup(_))));
    }

    #[test]
    fn test_union_all_combines_two_branches() {
        let (catalog, config) = setup();
        catalog.create_keyspace("u");
        let stmt = Statement::Select(
            Select::new(KeyspaceRef::new("t"))
                .with_set_op(SetOpKind::UnionAll, Select::new(KeyspaceRef::new("u"))),
        );
        let plan = Builder::new(&catalog, &config, PlannerOptions::default())
            .build(&stmt)
            .unwrap();
        let children = sequence_children(&plan);
        let PlanOp::UnionAll(u) = &children[0] else {
            panic!("expected UnionAll, got {}", children[0].name());
        };
        assert_eq!(u.children.len(), 2);
    }

    #[test]
    fn test_unknown_keyspace_is_planner_error() {
        let (catalog, config) = setup();
        let stmt = Statement::Select(Select::new(KeyspaceRef::new("missing")));
        let err = Builder::new(&catalog, &config, PlannerOptions::default())
            .build(&stmt)
            .unwrap_err();
        assert!(matches!(err, PlannerError::KeyspaceNotFound(_)));
    }
}
