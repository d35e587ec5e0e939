//! Filter, projection, grouping, sort, and limit operators

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::algebra::AggregateCall;
use crate::core::{Error, QueryContext, Result};
use crate::plan::{self, AggregateDef};
use crate::value::{self, AnnotatedValue, ATT_AGGREGATES};

use super::{eval_row_count, run_consumer, ConsumerOperator, Operator, OperatorBase, Phase};

/// Forward rows whose predicate evaluates truthy.
pub struct Filter {
    base: OperatorBase,
    plan: plan::Filter,
}

impl Filter {
    pub fn new(plan: plan::Filter) -> Self {
        Self {
            base: OperatorBase::new(),
            plan,
        }
    }
}

#[async_trait]
impl Operator for Filter {
    fn name(&self) -> &'static str {
        "Filter"
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
impl ConsumerOperator for Filter {
    async fn process_item(
        &mut self,
        item: AnnotatedValue,
        ctx: &Arc<QueryContext>,
    ) -> Result<bool> {
        match self.plan.condition.evaluate(&item) {
            Ok(v) if value::is_truthy(&v) => Ok(self.base.send_item(item).await),
            Ok(_) => Ok(true),
            Err(e) => {
                // a bad row is dropped, not the query
                ctx.error(Error::evaluation("filter predicate", e));
                Ok(true)
            }
        }
    }
}

/// Shape rows according to the projection terms.
pub struct InitialProject {
    base: OperatorBase,
    plan: plan::InitialProject,
}

impl InitialProject {
    pub fn new(plan: plan::InitialProject) -> Self {
        Self {
            base: OperatorBase::new(),
            plan,
        }
    }
}

#[async_trait]
impl Operator for InitialProject {
    fn name(&self) -> &'static str {
        "InitialProject"
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
impl ConsumerOperator for InitialProject {
    async fn process_item(
        &mut self,
        mut item: AnnotatedValue,
        ctx: &Arc<QueryContext>,
    ) -> Result<bool> {
        // a lone star projects the bound document itself
        if self.plan.terms.len() == 1 && self.plan.terms[0].star {
            let projected = match item.value() {
                Value::Object(map) if map.len() == 1 => {
                    map.values().next().cloned().unwrap_or(Value::Null)
                }
                other => other.clone(),
            };
            *item.value_mut() = projected;
            return Ok(self.base.send_item(item).await);
        }

        let mut out = serde_json::Map::new();
        for term in &self.plan.terms {
            if term.star {
                if let Value::Object(map) = item.value() {
                    for (_, doc) in map.iter() {
                        if let Value::Object(fields) = doc {
                            out.extend(fields.clone());
                        }
                    }
                }
                continue;
            }
            let Some(expr) = &term.expr else {
                continue;
            };
            match expr.evaluate(&item) {
                Ok(v) => {
                    out.insert(term.alias.clone(), v);
                }
                Err(e) => {
                    ctx.error(Error::evaluation("projection", e));
                    out.insert(term.alias.clone(), Value::Null);
                }
            }
        }
        *item.value_mut() = Value::Object(out);
        Ok(self.base.send_item(item).await)
    }
}

/// Strip attachments and release rows in client shape.
pub struct FinalProject {
    base: OperatorBase,
}

impl FinalProject {
    pub fn new(_plan: plan::FinalProject) -> Self {
        Self {
            base: OperatorBase::new(),
        }
    }
}

#[async_trait]
impl Operator for FinalProject {
    fn name(&self) -> &'static str {
        "FinalProject"
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
impl ConsumerOperator for FinalProject {
    async fn process_item(
        &mut self,
        item: AnnotatedValue,
        _ctx: &Arc<QueryContext>,
    ) -> Result<bool> {
        let bare = AnnotatedValue::new(item.into_value());
        Ok(self.base.send_item(bare).await)
    }
}

fn aggregate_calls(defs: &[AggregateDef]) -> Vec<AggregateCall> {
    defs.iter()
        .map(|d| AggregateCall::new(d.kind, d.operand.clone(), &d.alias))
        .collect()
}

struct GroupState {
    key_values: Vec<Value>,
    parts: Vec<Value>,
}

/// Grouping row shape between the group phases.
fn group_row(key: String, state: GroupState) -> AnnotatedValue {
    let mut obj = serde_json::Map::new();
    obj.insert("group_key".to_string(), Value::String(key));
    obj.insert("group_values".to_string(), Value::Array(state.key_values));
    let mut row = AnnotatedValue::new(Value::Object(obj));
    row.set_attachment(ATT_AGGREGATES, Value::Array(state.parts));
    row
}

/// First grouping phase: folds raw rows into per-group parts.
pub struct InitialGroup {
    base: OperatorBase,
    plan: plan::InitialGroup,
    calls: Vec<AggregateCall>,
    groups: HashMap<String, GroupState>,
}

impl InitialGroup {
    pub fn new(plan: plan::InitialGroup) -> Self {
        let calls = aggregate_calls(&plan.aggregates);
        Self {
            base: OperatorBase::new(),
            plan,
            calls,
            groups: HashMap::new(),
        }
    }
}

#[async_trait]
impl Operator for InitialGroup {
    fn name(&self) -> &'static str {
        "InitialGroup"
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
impl ConsumerOperator for InitialGroup {
    async fn process_item(
        &mut self,
        item: AnnotatedValue,
        ctx: &Arc<QueryContext>,
    ) -> Result<bool> {
        let mut key_values = Vec::with_capacity(self.plan.keys.len());
        for key_expr in &self.plan.keys {
            match key_expr.evaluate(&item) {
                Ok(v) => key_values.push(v),
                Err(e) => {
                    ctx.error(Error::evaluation("group key", e));
                    return Ok(true);
                }
            }
        }
        let key = value::canonical_string(&Value::Array(key_values.clone()));

        let state = self.groups.entry(key).or_insert_with(|| GroupState {
            key_values,
            parts: self.calls.iter().map(|c| c.default_part()).collect(),
        });
        for (i, call) in self.calls.iter().enumerate() {
            let cumulative = std::mem::replace(&mut state.parts[i], Value::Null);
            match call.cumulate_initial(&item, cumulative) {
                Ok(part) => state.parts[i] = part,
                Err(e) => {
                    ctx.error(Error::evaluation("aggregate", e));
                }
            }
        }
        Ok(true)
    }

    async fn flush(&mut self, _ctx: &Arc<QueryContext>) -> Result<()> {
        for (key, state) in std::mem::take(&mut self.groups) {
            if !self.base.send_item(group_row(key, state)).await {
                break;
            }
        }
        Ok(())
    }
}

/// Merge parts produced by parallel initial groups.
pub struct IntermediateGroup {
    base: OperatorBase,
    calls: Vec<AggregateCall>,
    groups: HashMap<String, GroupState>,
}

impl IntermediateGroup {
    pub fn new(plan: plan::IntermediateGroup) -> Self {
        let calls = aggregate_calls(&plan.aggregates);
        Self {
            base: OperatorBase::new(),
            calls,
            groups: HashMap::new(),
        }
    }
}

fn merge_group_item(
    groups: &mut HashMap<String, GroupState>,
    calls: &[AggregateCall],
    mut item: AnnotatedValue,
) -> Result<()> {
    let parts = match item.take_attachment(ATT_AGGREGATES) {
        Some(Value::Array(parts)) => parts,
        _ => {
            return Err(Error::plan_internal(
                "group input row carries no aggregate parts",
            ))
        }
    };
    let key = item
        .field("group_key")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::plan_internal("group input row carries no group key"))?;
    let key_values = match item.field("group_values") {
        Some(Value::Array(vs)) => vs.clone(),
        _ => Vec::new(),
    };

    match groups.entry(key) {
        std::collections::hash_map::Entry::Vacant(slot) => {
            slot.insert(GroupState { key_values, parts });
        }
        std::collections::hash_map::Entry::Occupied(mut slot) => {
            let state = slot.get_mut();
            for (i, call) in calls.iter().enumerate() {
                let cumulative = std::mem::replace(&mut state.parts[i], Value::Null);
                let part = parts.get(i).cloned().unwrap_or(Value::Null);
                state.parts[i] = call.cumulate_intermediate(part, cumulative);
            }
        }
    }
    Ok(())
}

#[async_trait]
impl Operator for IntermediateGroup {
    fn name(&self) -> &'static str {
        "IntermediateGroup"
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
impl ConsumerOperator for IntermediateGroup {
    async fn process_item(
        &mut self,
        item: AnnotatedValue,
        _ctx: &Arc<QueryContext>,
    ) -> Result<bool> {
        merge_group_item(&mut self.groups, &self.calls, item)?;
        Ok(true)
    }

    async fn flush(&mut self, _ctx: &Arc<QueryContext>) -> Result<()> {
        for (key, state) in std::mem::take(&mut self.groups) {
            if !self.base.send_item(group_row(key, state)).await {
                break;
            }
        }
        Ok(())
    }
}

/// Compute final aggregate values per group.
pub struct FinalGroup {
    base: OperatorBase,
    plan: plan::FinalGroup,
    calls: Vec<AggregateCall>,
    groups: HashMap<String, GroupState>,
}

impl FinalGroup {
    pub fn new(plan: plan::FinalGroup) -> Self {
        let calls = aggregate_calls(&plan.aggregates);
        Self {
            base: OperatorBase::new(),
            plan,
            calls,
            groups: HashMap::new(),
        }
    }
}

#[async_trait]
impl Operator for FinalGroup {
    fn name(&self) -> &'static str {
        "FinalGroup"
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
impl ConsumerOperator for FinalGroup {
    async fn process_item(
        &mut self,
        item: AnnotatedValue,
        _ctx: &Arc<QueryContext>,
    ) -> Result<bool> {
        merge_group_item(&mut self.groups, &self.calls, item)?;
        Ok(true)
    }

    async fn flush(&mut self, _ctx: &Arc<QueryContext>) -> Result<()> {
        // an ungrouped aggregate over empty input still produces a row
        if self.groups.is_empty() && self.plan.keys.is_empty() {
            self.groups.insert(
                String::from("[]"),
                GroupState {
                    key_values: Vec::new(),
                    parts: self.calls.iter().map(|c| c.default_part()).collect(),
                },
            );
        }

        for (_, state) in std::mem::take(&mut self.groups) {
            let mut out = serde_json::Map::new();
            for (expr, v) in self.plan.keys.iter().zip(state.key_values.iter()) {
                out.insert(expr.to_string(), v.clone());
            }
            for (call, part) in self.calls.iter().zip(state.parts.into_iter()) {
                out.insert(call.alias.clone(), call.compute_final(part));
            }
            if !self.base.send_item(AnnotatedValue::new(Value::Object(out))).await {
                break;
            }
        }
        Ok(())
    }
}

/// Duplicate elimination over whole rows.
pub struct Distinct {
    base: OperatorBase,
    seen: HashSet<String>,
}

impl Distinct {
    pub fn new(_plan: plan::Distinct) -> Self {
        Self {
            base: OperatorBase::new(),
            seen: HashSet::new(),
        }
    }
}

#[async_trait]
impl Operator for Distinct {
    fn name(&self) -> &'static str {
        "Distinct"
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
impl ConsumerOperator for Distinct {
    async fn process_item(
        &mut self,
        item: AnnotatedValue,
        _ctx: &Arc<QueryContext>,
    ) -> Result<bool> {
        if self.seen.insert(value::canonical_string(item.value())) {
            return Ok(self.base.send_item(item).await);
        }
        Ok(true)
    }
}

/// Full sort; buffers the input, sorts at end of stream.
pub struct Order {
    base: OperatorBase,
    plan: plan::Order,
    rows: Vec<AnnotatedValue>,
}

impl Order {
    pub fn new(plan: plan::Order) -> Self {
        Self {
            base: OperatorBase::new(),
            plan,
            rows: Vec::new(),
        }
    }
}

#[async_trait]
impl Operator for Order {
    fn name(&self) -> &'static str {
        "Order"
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
impl ConsumerOperator for Order {
    async fn process_item(
        &mut self,
        item: AnnotatedValue,
        _ctx: &Arc<QueryContext>,
    ) -> Result<bool> {
        self.rows.push(item);
        Ok(true)
    }

    async fn flush(&mut self, ctx: &Arc<QueryContext>) -> Result<()> {
        self.base.switch_phase(Phase::Sort);
        let mut keyed: Vec<(Vec<Value>, AnnotatedValue)> = std::mem::take(&mut self.rows)
            .into_iter()
            .map(|row| {
                let keys = self
                    .plan
                    .terms
                    .iter()
                    .map(|t| t.expr.evaluate(&row).unwrap_or(Value::Null))
                    .collect();
                (keys, row)
            })
            .collect();
        keyed.sort_by(|(a, _), (b, _)| {
            for (term, (ka, kb)) in self.plan.terms.iter().zip(a.iter().zip(b.iter())) {
                let ord = value::compare(ka, kb);
                let ord = if term.desc { ord.reverse() } else { ord };
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
            std::cmp::Ordering::Equal
        });
        self.base.switch_phase(Phase::Exec);

        for (_, row) in keyed {
            if ctx.stopped() {
                break;
            }
            if !self.base.send_item(row).await {
                break;
            }
        }
        Ok(())
    }
}

/// Row-count cap. Breaking the loop drops the input channel, which
/// cascades the stop upstream as failed sends.
pub struct Limit {
    base: OperatorBase,
    plan: plan::Limit,
    remaining: u64,
}

impl Limit {
    pub fn new(plan: plan::Limit) -> Self {
        Self {
            base: OperatorBase::new(),
            plan,
            remaining: 0,
        }
    }
}

#[async_trait]
impl Operator for Limit {
    fn name(&self) -> &'static str {
        "Limit"
    }

    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    async fn run(&mut self, ctx: &Arc<QueryContext>) -> Result<()> {
        self.base.switch_phase(Phase::Init);
        self.remaining =
            eval_row_count(&Some(self.plan.expr.clone()), "LIMIT")?.unwrap_or(0);
        self.base.switch_phase(Phase::Exec);
        run_consumer(self, ctx).await
    }
}

#[async_trait]
impl ConsumerOperator for Limit {
    async fn process_item(
        &mut self,
        item: AnnotatedValue,
        _ctx: &Arc<QueryContext>,
    ) -> Result<bool> {
        if self.remaining == 0 {
            return Ok(false);
        }
        self.remaining -= 1;
        let sent = self.base.send_item(item).await;
        Ok(sent && self.remaining > 0)
    }
}

/// Leading-row skip.
pub struct Offset {
    base: OperatorBase,
    plan: plan::Offset,
    to_skip: u64,
}

impl Offset {
    pub fn new(plan: plan::Offset) -> Self {
        Self {
            base: OperatorBase::new(),
            plan,
            to_skip: 0,
        }
    }
}

#[async_trait]
impl Operator for Offset {
    fn name(&self) -> &'static str {
        "Offset"
    }

    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    async fn run(&mut self, ctx: &Arc<QueryContext>) -> Result<()> {
        self.base.switch_phase(Phase::Init);
        self.to_skip = eval_row_count(&Some(self.plan.expr.clone()), "OFFSET")?.unwrap_or(0);
        self.base.switch_phase(Phase::Exec);
        run_consumer(self, ctx).await
    }
}

#[async_trait]
impl ConsumerOperator for Offset {
    async fn process_item(
        &mut self,
        item: AnnotatedValue,
        _ctx: &Arc<QueryContext>,
    ) -> Result<bool> {
        if self.to_skip > 0 {
            self.to_skip -= 1;
            return Ok(true);
        }
        Ok(self.base.send_item(item).await)
    }
}
