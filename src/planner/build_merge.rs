//! MERGE planning
//!
//! Builds the Merge operator and its up-to-three action subtrees over
//! the source pipeline. A keyed merge drives target lookups from the ON
//! KEY expression; an unkeyed merge joins source and target first and
//! routes on the join outcome. Each source row matches at most once, so
//! the join cardinality is clamped to the source cardinality.

use crate::algebra::{Merge as MergeStmt, MergeInsertAction};
use crate::expression::{BinaryOp, Expr};
use crate::plan::{
    self, Fetch, Filter, HashJoin, KeyspaceTerm, NLJoin, OptEstimate, PlanOp, PrimaryScan,
    SendDelete, SendInsert, SendUpdate, Sequence, Set, SetTermDef, Unset, CARD_NOT_AVAIL,
    COST_NOT_AVAIL, SIZE_NOT_AVAIL,
};

use super::{Builder, Result};

/// Source cardinality past which an unkeyed merge builds a hash table
/// instead of nested loops.
const HASH_JOIN_MIN_CARD: f64 = 64.0;

/// Floor cost for operators embedded in an action subtree; their cost
/// is accounted in the merge roll-up, not cumulatively.
fn opt_min_cost() -> f64 {
    0.1
}

impl<'a> Builder<'a> {
    pub(super) fn build_merge(&mut self, stmt: &MergeStmt) -> Result<PlanOp> {
        let source_ks = self.keyspace(&stmt.source.name)?;
        let target_ks = self.keyspace(&stmt.target.name)?;
        let target_term = KeyspaceTerm::from_keyspace(target_ks.as_ref(), &stmt.target.alias);

        // INSERT action means unmatched source rows survive the join
        let outer = stmt.actions.insert.is_some();

        let covering = self.build_scan(&source_ks, &stmt.source.alias, None)?;
        if !covering {
            let source_term = KeyspaceTerm::from_keyspace(source_ks.as_ref(), &stmt.source.alias);
            let estimate = self.rolling_estimate(None);
            self.add_sub_child(Fetch::new(source_term, estimate));
        }

        let left = self.last_estimate;
        let left_card = if self.use_cbo() {
            left.cardinality
        } else {
            CARD_NOT_AVAIL
        };

        let mut join_cost = COST_NOT_AVAIL;
        let mut join_card = CARD_NOT_AVAIL;
        let mut join_fr_cost = COST_NOT_AVAIL;

        if stmt.is_on_key() {
            if self.use_cbo() && left_card > 0.0 {
                join_cost = left.cost + left_card;
                join_card = left_card.min(target_ks.count() as f64);
                join_fr_cost = left.fr_cost + 1.0;
            }
        } else {
            let join = self.build_merge_join(stmt, &target_term, outer, left_card)?;
            if self.use_cbo() {
                join_cost = join.cost();
                join_card = join.cardinality();
                join_fr_cost = join.fr_cost();
            }
            match join {
                PlanOp::NLJoin(_) => self.add_sub_child(join),
                _ => {
                    self.flush_parallel();
                    self.add_child(join);
                }
            }
        }

        // each source row matches at most once; multiple matches are a
        // runtime error, not a fan-out
        if self.use_cbo() && left_card > 0.0 && join_card > 0.0 && join_card > left_card {
            join_card = left_card;
        }

        let mut match_card = CARD_NOT_AVAIL;
        let mut non_match_card = CARD_NOT_AVAIL;
        let mut target_size = SIZE_NOT_AVAIL;
        if self.use_cbo() && left_card > 0.0 && join_card > 0.0 {
            match_card = join_card;
            non_match_card = left_card - join_card;
            if non_match_card < 1.0 {
                // assume at least one insert
                non_match_card = 1.0;
                match_card = left_card - non_match_card;
            }
            target_size = 64;
        }

        let cbo_embedded = self.use_cbo() && join_cost > 0.0;
        let embedded = |card: f64| -> OptEstimate {
            if cbo_embedded && card > 0.0 {
                OptEstimate::new(opt_min_cost(), card, target_size, opt_min_cost())
            } else {
                OptEstimate::unavailable()
            }
        };

        let mut update_est = OptEstimate::unavailable();
        let update = stmt.actions.update.as_ref().map(|act| {
            let mut ops: Vec<PlanOp> = Vec::with_capacity(5);
            let mut est = embedded(match_card);
            if let Some(filter) = &act.filter {
                est = action_step(est);
                ops.push(Filter::new(filter.clone(), est).into());
            }
            est = action_step(est);
            ops.push(plan::Clone::new(&stmt.target.alias, est).into());
            if !act.set.is_empty() {
                let terms = act
                    .set
                    .iter()
                    .map(|(path, value)| SetTermDef {
                        path: path.clone(),
                        value: value.clone(),
                    })
                    .collect();
                est = action_step(est);
                ops.push(Set::new(terms, est).into());
            }
            if !act.unset.is_empty() {
                est = action_step(est);
                ops.push(Unset::new(act.unset.clone(), est).into());
            }
            est = action_step(est);
            ops.push(SendUpdate::new(target_term.clone(), stmt.limit.clone(), est).into());
            update_est = est;
            PlanOp::Sequence(Sequence::new(ops, est))
        });

        let mut delete_est = OptEstimate::unavailable();
        let delete = stmt.actions.delete.as_ref().map(|act| {
            let mut ops: Vec<PlanOp> = Vec::with_capacity(4);
            let mut est = embedded(match_card);
            if let Some(filter) = &act.filter {
                est = action_step(est);
                ops.push(Filter::new(filter.clone(), est).into());
            }
            est = action_step(est);
            ops.push(SendDelete::new(target_term.clone(), stmt.limit.clone(), est).into());
            delete_est = est;
            PlanOp::Sequence(Sequence::new(ops, est))
        });

        let mut insert_est = OptEstimate::unavailable();
        let insert = stmt.actions.insert.as_ref().map(|act| {
            let mut ops: Vec<PlanOp> = Vec::with_capacity(4);
            let mut est = embedded(non_match_card);
            if let Some(filter) = &act.filter {
                est = action_step(est);
                ops.push(Filter::new(filter.clone(), est).into());
            }
            let key = insert_key(stmt, act);
            est = action_step(est);
            ops.push(
                SendInsert::new(
                    target_term.clone(),
                    key,
                    Some(act.value.clone()),
                    stmt.limit.clone(),
                    est,
                )
                .into(),
            );
            insert_est = est;
            PlanOp::Sequence(Sequence::new(ops, est))
        });

        let merge_estimate = if self.use_cbo()
            && join_cost > 0.0
            && join_card > 0.0
            && target_size > 0
            && join_fr_cost > 0.0
        {
            let mut cost = join_cost;
            let mut cardinality = 0.0;
            let mut fr_cost = join_fr_cost;
            for est in [&update_est, &delete_est, &insert_est] {
                if est.is_available() {
                    cost += est.cost;
                    cardinality += est.cardinality;
                    fr_cost += est.fr_cost;
                }
            }
            OptEstimate::new(cost, cardinality, target_size, fr_cost)
        } else {
            OptEstimate::unavailable()
        };

        let merge_key = if stmt.is_on_key() {
            Some(stmt.on_expr().clone())
        } else {
            None
        };
        self.add_sub_child(plan::Merge::new(
            target_term,
            merge_key,
            update,
            delete,
            insert,
            merge_estimate,
        ));

        self.finish_dml(stmt.limit.as_ref(), stmt.returning.as_deref())
    }

    /// Join variant for an unkeyed merge: nested loops for small
    /// sources, hash join once the source is wide enough to pay for the
    /// build, nested loops again when the ON clause has no usable
    /// equi-key.
    fn build_merge_join(
        &mut self,
        stmt: &MergeStmt,
        target_term: &KeyspaceTerm,
        outer: bool,
        left_card: f64,
    ) -> Result<PlanOp> {
        let target_ks = self.keyspace(&stmt.target.name)?;
        let target_card = target_ks.count() as f64;
        let scan_est = if self.use_cbo() {
            OptEstimate::new(target_card.max(1.0), target_card, 64, 1.0)
        } else {
            OptEstimate::unavailable()
        };
        let right = PlanOp::Sequence(Sequence::new(
            vec![
                PrimaryScan::new(target_term.clone(), None, scan_est).into(),
                Fetch::new(target_term.clone(), scan_est).into(),
            ],
            scan_est,
        ));

        let join_est = if self.use_cbo() && left_card > 0.0 {
            let card = left_card.min(target_card.max(1.0));
            OptEstimate::new(
                self.last_estimate.cost + left_card + target_card,
                card,
                64,
                self.last_estimate.fr_cost + 1.0,
            )
        } else {
            OptEstimate::unavailable()
        };

        let equi = split_equi_join(stmt.on_expr(), &stmt.source.alias, &stmt.target.alias);
        let use_hash = self.use_cbo() && left_card >= HASH_JOIN_MIN_CARD;

        Ok(match (use_hash, equi) {
            (true, Some((probe, build))) => HashJoin::new(
                right,
                vec![build],
                vec![probe],
                Some(stmt.on_expr().clone()),
                outer,
                join_est,
            )
            .into(),
            _ => NLJoin::new(right, stmt.on_expr().clone(), outer, join_est).into(),
        })
    }
}

fn action_step(est: OptEstimate) -> OptEstimate {
    if est.is_unavailable() {
        return est;
    }
    OptEstimate::new(est.cost + est.cardinality, est.cardinality, est.size, est.fr_cost)
}

/// Key expression for the insert action: the ON KEY expression when the
/// merge is keyed, the action's own KEY clause otherwise.
fn insert_key(stmt: &MergeStmt, act: &MergeInsertAction) -> Option<Expr> {
    if stmt.is_on_key() {
        Some(stmt.on_expr().clone())
    } else {
        act.key.clone()
    }
}

/// Split `source.x = target.y` out of an ON clause, returning the
/// (probe, build) pair. Conjunctions use their first usable leg.
fn split_equi_join(on: &Expr, source_alias: &str, target_alias: &str) -> Option<(Expr, Expr)> {
    match on {
        Expr::Binary(BinaryOp::Eq, l, r) => {
            if l.depends_on(source_alias) && r.depends_on(target_alias) && !l.depends_on(target_alias)
            {
                Some((l.as_ref().clone(), r.as_ref().clone()))
            } else if r.depends_on(source_alias)
                && l.depends_on(target_alias)
                && !r.depends_on(target_alias)
            {
                Some((r.as_ref().clone(), l.as_ref().clone()))
            } else {
                None
            }
        }
        Expr::And(l, r) => split_equi_join(l, source_alias, target_alias)
            .or_else(|| split_equi_join(r, source_alias, target_alias)),
        _ => None,
    }
}
