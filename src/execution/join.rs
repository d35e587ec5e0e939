//! Join operators
//!
//! The lookup join fetches target documents per input row by key. The
//! nested-loop and hash joins materialize their right subtree once and
//! match left rows against it; on a match the target binding and its
//! document key are folded into the row.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::{Error, QueryContext, Result};
use crate::datastore::Keyspace;
use crate::plan;
use crate::value::{self, AnnotatedValue};

use super::base::{item_channel, join_operator, spawn_operator};
use super::{keys_from_value, run_consumer, ConsumerOperator, Operator, OperatorBase, Phase};

/// Materialize a child subtree into a row buffer.
async fn collect_rows(
    mut child: Box<dyn Operator>,
    cap: usize,
    ctx: &Arc<QueryContext>,
) -> (Vec<AnnotatedValue>, Box<dyn Operator>) {
    let (tx, mut rx) = item_channel(cap);
    child.base_mut().set_output(tx);
    let handle = spawn_operator(child, ctx);

    let mut rows = Vec::new();
    while let Some(row) = rx.recv().await {
        if ctx.stopped() {
            break;
        }
        rows.push(row);
    }
    drop(rx);
    let child = match join_operator(handle).await {
        Some(child) => child,
        None => Box::new(super::control::Discard::new(plan::Discard::new(
            Default::default(),
        ))) as Box<dyn Operator>,
    };
    (rows, child)
}

/// Fold a right-side row into a left row: bindings merge, and the
/// matched document key replaces the row key.
fn merge_rows(left: &AnnotatedValue, right: &AnnotatedValue) -> AnnotatedValue {
    let mut out = left.clone();
    if let Value::Object(bindings) = right.value() {
        for (alias, doc) in bindings {
            out.set_field(alias, doc.clone());
        }
    }
    if let Some(key) = right.key() {
        out.set_key(key);
    }
    out
}

/// Lookup join: per row, evaluate the key expression and fetch matching
/// documents from the target keyspace.
pub struct Join {
    base: OperatorBase,
    plan: plan::Join,
    keyspace: Arc<dyn Keyspace>,
}

impl Join {
    pub fn new(plan: plan::Join, keyspace: Arc<dyn Keyspace>) -> Self {
        Self {
            base: OperatorBase::new(),
            plan,
            keyspace,
        }
    }
}

#[async_trait]
impl Operator for Join {
    fn name(&self) -> &'static str {
        "Join"
    }

    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    async fn run(&mut self, ctx: &Arc<QueryContext>) -> Result<()> {
        run_consumer(self, ctx).await
    }
}

#[async_trait]
impl ConsumerOperator for Join {
    async fn process_item(
        &mut self,
        item: AnnotatedValue,
        ctx: &Arc<QueryContext>,
    ) -> Result<bool> {
        let keys = match self.plan.on_keys.evaluate(&item) {
            Ok(v) => keys_from_value(&v),
            Err(e) => {
                ctx.error(Error::evaluation("join ON KEYS", e));
                return Ok(true);
            }
        };

        let mut matched = false;
        if !keys.is_empty() {
            self.base.switch_phase(Phase::Serv);
            let (found, errs) = self.keyspace.fetch(&keys);
            self.base.switch_phase(Phase::Exec);
            let mut fatal = false;
            for e in errs {
                fatal |= e.is_fatal();
                ctx.error(e.into());
            }
            if fatal {
                return Ok(false);
            }
            for (key, doc) in found {
                matched = true;
                let mut out = item.clone();
                out.set_field(&self.plan.keyspace.alias, doc);
                out.set_key(&key);
                if !self.base.send_item(out).await {
                    return Ok(false);
                }
            }
        }

        if !matched && self.plan.outer {
            return Ok(self.base.send_item(item).await);
        }
        Ok(true)
    }
}

/// Nested-loop join over a materialized right side.
pub struct NLJoin {
    base: OperatorBase,
    plan: plan::NLJoin,
    right: Option<Box<dyn Operator>>,
    right_rows: Vec<AnnotatedValue>,
    channel_cap: usize,
}

impl NLJoin {
    pub fn new(plan: plan::NLJoin, right: Box<dyn Operator>, channel_cap: usize) -> Self {
        Self {
            base: OperatorBase::new(),
            plan,
            right: Some(right),
            right_rows: Vec::new(),
            channel_cap,
        }
    }
}

#[async_trait]
impl Operator for NLJoin {
    fn name(&self) -> &'static str {
        "NLJoin"
    }

    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    async fn run(&mut self, ctx: &Arc<QueryContext>) -> Result<()> {
        let Some(right) = self.right.take() else {
            return Err(Error::plan_internal("nested-loop join has no right side"));
        };
        self.base.switch_phase(Phase::Init);
        let (rows, right) = collect_rows(right, self.channel_cap, ctx).await;
        self.base.switch_phase(Phase::Exec);
        self.right_rows = rows;
        self.right = Some(right);

        run_consumer(self, ctx).await
    }

    async fn done(&mut self) {
        if let Some(right) = &mut self.right {
            right.done().await;
        }
        self.right = None;
        self.right_rows.clear();
    }
}

#[async_trait]
impl ConsumerOperator for NLJoin {
    async fn process_item(
        &mut self,
        item: AnnotatedValue,
        ctx: &Arc<QueryContext>,
    ) -> Result<bool> {
        let mut matched = false;
        for i in 0..self.right_rows.len() {
            let candidate = merge_rows(&item, &self.right_rows[i]);
            match self.plan.on_clause.evaluate(&candidate) {
                Ok(v) if value::is_truthy(&v) => {
                    matched = true;
                    if !self.base.send_item(candidate).await {
                        return Ok(false);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    ctx.error(Error::evaluation("join ON clause", e));
                }
            }
        }
        if !matched && self.plan.outer {
            return Ok(self.base.send_item(item).await);
        }
        Ok(true)
    }
}

/// Hash join: builds a table over the right side, probes with left
/// rows.
pub struct HashJoin {
    base: OperatorBase,
    plan: plan::HashJoin,
    right: Option<Box<dyn Operator>>,
    table: HashMap<String, Vec<AnnotatedValue>>,
    channel_cap: usize,
}

impl HashJoin {
    pub fn new(plan: plan::HashJoin, right: Box<dyn Operator>, channel_cap: usize) -> Self {
        Self {
            base: OperatorBase::new(),
            plan,
            right: Some(right),
            table: HashMap::new(),
            channel_cap,
        }
    }

    fn eval_key(
        exprs: &[crate::expression::Expr],
        row: &AnnotatedValue,
    ) -> std::result::Result<String, crate::expression::EvalError> {
        let mut keys = Vec::with_capacity(exprs.len());
        for e in exprs {
            keys.push(e.evaluate(row)?);
        }
        Ok(value::canonical_string(&Value::Array(keys)))
    }
}

#[async_trait]
impl Operator for HashJoin {
    fn name(&self) -> &'static str {
        "HashJoin"
    }

    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    async fn run(&mut self, ctx: &Arc<QueryContext>) -> Result<()> {
        let Some(right) = self.right.take() else {
            return Err(Error::plan_internal("hash join has no build side"));
        };
        self.base.switch_phase(Phase::Init);
        let (rows, right) = collect_rows(right, self.channel_cap, ctx).await;
        for row in rows {
            match Self::eval_key(&self.plan.build_exprs, &row) {
                Ok(key) => self.table.entry(key).or_default().push(row),
                Err(e) => ctx.error(Error::evaluation("hash join build key", e)),
            }
        }
        self.base.switch_phase(Phase::Exec);
        self.right = Some(right);

        run_consumer(self, ctx).await
    }

    async fn done(&mut self) {
        if let Some(right) = &mut self.right {
            right.done().await;
        }
        self.right = None;
        self.table.clear();
    }
}

#[async_trait]
impl ConsumerOperator for HashJoin {
    async fn process_item(
        &mut self,
        item: AnnotatedValue,
        ctx: &Arc<QueryContext>,
    ) -> Result<bool> {
        let probe = match Self::eval_key(&self.plan.probe_exprs, &item) {
            Ok(k) => k,
            Err(e) => {
                ctx.error(Error::evaluation("hash join probe key", e));
                return Ok(true);
            }
        };

        let mut matched = false;
        let candidates: Vec<AnnotatedValue> = self
            .table
            .get(&probe)
            .map(|rows| rows.iter().map(|r| merge_rows(&item, r)).collect())
            .unwrap_or_default();
        for candidate in candidates {
            let keep = match &self.plan.on_clause {
                Some(clause) => match clause.evaluate(&candidate) {
                    Ok(v) => value::is_truthy(&v),
                    Err(e) => {
                        ctx.error(Error::evaluation("join ON clause", e));
                        false
                    }
                },
                None => true,
            };
            if keep {
                matched = true;
                if !self.base.send_item(candidate).await {
                    return Ok(false);
                }
            }
        }

        if !matched && self.plan.outer {
            return Ok(self.base.send_item(item).await);
        }
        Ok(true)
    }
}
