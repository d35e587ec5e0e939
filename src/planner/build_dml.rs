//! DML, CREATE FUNCTION, and PREPARE planning

use serde_json::Value;

use crate::algebra::{CreateFunction, Delete, Insert, Prepare, ProjectionTerm, Statement, Update};
use crate::plan::{
    self, Discard, Fetch, Filter, FinalProject, InitialProject, KeyspaceTerm, Limit, OptEstimate,
    PlanOp, SendDelete, SendInsert, SendUpdate, Set, SetTermDef, Stream, Unset, ValueScan,
    ValuesPair,
};

use super::{projection_defs, Builder, PlannerError, Result};

impl<'a> Builder<'a> {
    pub(super) fn build_insert(&mut self, ins: &Insert) -> Result<PlanOp> {
        let ks = self.keyspace(&ins.keyspace.name)?;
        let term = KeyspaceTerm::from_keyspace(ks.as_ref(), &ins.keyspace.alias);

        let pairs: Vec<ValuesPair> = ins
            .values
            .iter()
            .map(|(key, value)| ValuesPair {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();
        let estimate = if self.use_cbo() {
            OptEstimate::new(pairs.len() as f64, pairs.len() as f64, 64, 1.0)
        } else {
            OptEstimate::unavailable()
        };
        self.add_child(ValueScan::new(pairs, estimate));

        let estimate = self.rolling_estimate(None);
        self.add_sub_child(SendInsert::new(
            term,
            None,
            None,
            ins.limit.clone(),
            estimate,
        ));

        self.finish_dml(ins.limit.as_ref(), ins.returning.as_deref())
    }

    pub(super) fn build_upsert(&mut self, ups: &Insert) -> Result<PlanOp> {
        let ks = self.keyspace(&ups.keyspace.name)?;
        let term = KeyspaceTerm::from_keyspace(ks.as_ref(), &ups.keyspace.alias);

        let pairs: Vec<ValuesPair> = ups
            .values
            .iter()
            .map(|(key, value)| ValuesPair {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();
        let estimate = if self.use_cbo() {
            OptEstimate::new(pairs.len() as f64, pairs.len() as f64, 64, 1.0)
        } else {
            OptEstimate::unavailable()
        };
        self.add_child(ValueScan::new(pairs, estimate));

        let estimate = self.rolling_estimate(None);
        self.add_sub_child(plan::Upsert::new(
            term,
            None,
            None,
            ups.limit.clone(),
            estimate,
        ));

        self.finish_dml(ups.limit.as_ref(), ups.returning.as_deref())
    }

    pub(super) fn build_update(&mut self, upd: &Update) -> Result<PlanOp> {
        let ks = self.keyspace(&upd.keyspace.name)?;
        let alias = upd.keyspace.alias.clone();
        let term = KeyspaceTerm::from_keyspace(ks.as_ref(), &alias);

        let covering = self.build_scan(&ks, &alias, None)?;
        if !covering {
            let estimate = self.rolling_estimate(None);
            self.add_sub_child(Fetch::new(term.clone(), estimate));
        }

        if let Some(filter) = &upd.filter {
            let estimate = self.filter_estimate();
            self.add_sub_child(Filter::new(filter.clone(), estimate));
        }

        let estimate = self.rolling_estimate(None);
        self.add_sub_child(plan::Clone::new(&alias, estimate));

        if !upd.set.is_empty() {
            let terms = upd
                .set
                .iter()
                .map(|(path, value)| SetTermDef {
                    path: path.clone(),
                    value: value.clone(),
                })
                .collect();
            let estimate = self.rolling_estimate(None);
            self.add_sub_child(Set::new(terms, estimate));
        }

        if !upd.unset.is_empty() {
            let estimate = self.rolling_estimate(None);
            self.add_sub_child(Unset::new(upd.unset.clone(), estimate));
        }

        let estimate = self.rolling_estimate(None);
        self.add_sub_child(SendUpdate::new(term, upd.limit.clone(), estimate));

        self.finish_dml(upd.limit.as_ref(), upd.returning.as_deref())
    }

    pub(super) fn build_delete(&mut self, del: &Delete) -> Result<PlanOp> {
        let ks = self.keyspace(&del.keyspace.name)?;
        let alias = del.keyspace.alias.clone();
        let term = KeyspaceTerm::from_keyspace(ks.as_ref(), &alias);

        let covering = self.build_scan(&ks, &alias, None)?;
        if !covering {
            let estimate = self.rolling_estimate(None);
            self.add_sub_child(Fetch::new(term.clone(), estimate));
        }

        if let Some(filter) = &del.filter {
            let estimate = self.filter_estimate();
            self.add_sub_child(Filter::new(filter.clone(), estimate));
        }

        let estimate = self.rolling_estimate(None);
        self.add_sub_child(SendDelete::new(term, del.limit.clone(), estimate));

        self.finish_dml(del.limit.as_ref(), del.returning.as_deref())
    }

    /// Shared DML tail: optional RETURNING projection inside the
    /// parallel stage, then limit, then Discard when nothing returns.
    pub(super) fn finish_dml(
        &mut self,
        limit: Option<&crate::expression::Expr>,
        returning: Option<&[ProjectionTerm]>,
    ) -> Result<PlanOp> {
        if let Some(terms) = returning {
            let estimate = self.rolling_estimate(None);
            self.add_sub_child(InitialProject::new(projection_defs(terms), estimate));
            let estimate = self.rolling_estimate(None);
            self.add_sub_child(FinalProject::new(estimate));
        }

        if limit.is_some() {
            self.flush_parallel_n(1);
        } else {
            self.flush_parallel();
        }

        if let Some(limit) = limit {
            let estimate = self.rolling_estimate(limit.as_static_i64().map(|n| n.max(0) as f64));
            self.add_child(Limit::new(limit.clone(), estimate));
        }

        if returning.is_some() {
            let estimate = self.last_estimate;
            self.add_child(Stream::new(estimate));
        } else {
            let estimate = self.last_estimate;
            self.add_child(Discard::new(estimate));
        }

        Ok(self.finish())
    }

    pub(super) fn build_create_function(&mut self, cf: &CreateFunction) -> Result<PlanOp> {
        self.add_child(plan::CreateFunction::new(
            &cf.name,
            cf.body.clone(),
            cf.replace,
            OptEstimate::unavailable(),
        ));
        Ok(self.finish())
    }

    /// PREPARE: plan the inner statement, hand it to the cache, and
    /// return a Prepare node carrying the JSON form of the inner plan.
    pub(super) fn build_prepare(&mut self, prep: &Prepare) -> Result<PlanOp> {
        if matches!(prep.statement.as_ref(), Statement::Prepare(_)) {
            return Err(PlannerError::Internal("nested PREPARE".to_string()));
        }

        let mut inner_builder = Builder::new(self.catalog, self.config, self.options.clone());
        let inner = inner_builder.build(prep.statement.as_ref())?;
        let encoded: Value = inner.to_value()?;

        if let Some(cache) = self.prepared {
            cache.add(&prep.name, inner, &encoded.to_string());
        }

        self.add_child(plan::Prepare::new(
            &prep.name,
            encoded,
            OptEstimate::unavailable(),
        ));
        let estimate = self.last_estimate;
        self.add_child(Stream::new(estimate));
        Ok(self.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::{KeyspaceRef, MergeOn, Select};
    use crate::core::EngineConfig;
    use crate::datastore::{Keyspace, MemCatalog};
    use crate::expression::Expr;
    use crate::planner::PlannerOptions;
    use serde_json::json;

    fn setup() -> (MemCatalog, EngineConfig) {
        let catalog = MemCatalog::new();
        let ks = catalog.create_keyspace("t");
        ks.upsert(vec![("k1".into(), json!({"a": 1}))]);
        (catalog, EngineConfig::default())
    }

    fn children(plan: &PlanOp) -> &[PlanOp] {
        match plan {
            PlanOp::Sequence(seq) => &seq.children,
            other => panic!("expected sequence, got {}", other.name()),
        }
    }

    fn parallel_sub(plan: &PlanOp) -> &[PlanOp] {
        children(plan)
            .iter()
            .find_map(|c| match c {
                PlanOp::Parallel(p) => match p.child.as_ref() {
                    PlanOp::Sequence(seq) => Some(seq.children.as_slice()),
                    _ => None,
                },
                _ => None,
            })
            .expect("parallel stage")
    }

    #[test]
    fn test_insert_plan_shape() {
        let (catalog, config) = setup();
        let stmt = Statement::Insert(Insert {
            keyspace: KeyspaceRef::new("t"),
            values: vec![(Expr::literal("k9"), Expr::literal(json!({"a": 9})))],
            limit: None,
            returning: None,
        });
        let plan = Builder::new(&catalog, &config, PlannerOptions::default())
            .build(&stmt)
            .unwrap();
        let ops = children(&plan);
        assert!(matches!(ops[0], PlanOp::ValueScan(_)));
        assert!(parallel_sub(&plan)
            .iter()
            .any(|c| matches!(c, PlanOp::SendInsert(_))));
        assert!(matches!(ops.last(), Some(PlanOp::Discard(_))));
    }

    #[test]
    fn test_update_plan_has_clone_before_set_before_send() {
        let (catalog, config) = setup();
        let stmt = Statement::Update(Update {
            keyspace: KeyspaceRef::new("t"),
            filter: Some(Expr::path("t.a").eq(Expr::literal(1))),
            set: vec![(Expr::ident("a"), Expr::literal(2))],
            unset: vec![],
            limit: None,
            returning: None,
        });
        let plan = Builder::new(&catalog, &config, PlannerOptions::default())
            .build(&stmt)
            .unwrap();
        let sub = parallel_sub(&plan);
        let pos = |pred: fn(&PlanOp) -> bool| sub.iter().position(pred).unwrap();
        let clone_at = pos(|c| matches!(c, PlanOp::Clone(_)));
        let set_at = pos(|c| matches!(c, PlanOp::Set(_)));
        let send_at = pos(|c| matches!(c, PlanOp::SendUpdate(_)));
        assert!(clone_at < set_at && set_at < send_at);
    }

    #[test]
    fn test_delete_with_returning_streams() {
        let (catalog, config) = setup();
        let stmt = Statement::Delete(Delete {
            keyspace: KeyspaceRef::new("t"),
            filter: None,
            limit: Some(Expr::literal(5)),
            returning: Some(vec![ProjectionTerm::expr(Expr::path("t.a"), "a")]),
        });
        let plan = Builder::new(&catalog, &config, PlannerOptions::default())
            .build(&stmt)
            .unwrap();
        let ops = children(&plan);
        assert!(ops.iter().any(|c| matches!(c, PlanOp::Limit(_))));
        assert!(matches!(ops.last(), Some(PlanOp::Stream(_))));
    }

    #[test]
    fn test_prepare_wraps_inner_plan_json() {
        let (catalog, config) = setup();
        let stmt = Statement::Prepare(Prepare {
            name: "p1".into(),
            statement: Box::new(Statement::Select(Select::new(KeyspaceRef::new("t")))),
        });
        let plan = Builder::new(&catalog, &config, PlannerOptions::default())
            .build(&stmt)
            .unwrap();
        let ops = children(&plan);
        let PlanOp::Prepare(prep) = &ops[0] else {
            panic!("expected Prepare, got {}", ops[0].name());
        };
        assert_eq!(prep.name, "p1");
        assert_eq!(prep.prepared["#operator"], "Sequence");
    }

    #[test]
    fn test_nested_prepare_rejected() {
        let (catalog, config) = setup();
        let inner = Statement::Prepare(Prepare {
            name: "inner".into(),
            statement: Box::new(Statement::Select(Select::new(KeyspaceRef::new("t")))),
        });
        let stmt = Statement::Prepare(Prepare {
            name: "outer".into(),
            statement: Box::new(inner),
        });
        assert!(Builder::new(&catalog, &config, PlannerOptions::default())
            .build(&stmt)
            .is_err());
    }

    #[test]
    fn test_merge_statement_compiles_via_builder() {
        let (catalog, config) = setup();
        catalog.create_keyspace("src");
        let stmt = Statement::Merge(crate::algebra::Merge {
            target: KeyspaceRef::new("t"),
            source: KeyspaceRef::with_alias("src", "src"),
            on: MergeOn::Key(Expr::path("src.id")),
            actions: crate::algebra::MergeActions {
                update: None,
                delete: Some(crate::algebra::MergeDeleteAction { filter: None }),
                insert: None,
            },
            limit: None,
            returning: None,
        });
        let plan = Builder::new(&catalog, &config, PlannerOptions::default())
            .build(&stmt)
            .unwrap();
        assert!(matches!(plan, PlanOp::Sequence(_)));
    }
}
