//! Scan operators
//!
//! Producers at the head of a pipeline. Key-yielding scans emit rows
//! whose document key rides in the key attachment; Fetch turns key rows
//! into document rows. Intersect and union scans drive their child
//! scans concurrently over a shared channel and combine keys.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::{Error, QueryContext, Result};
use crate::datastore::{Index, Keyspace};
use crate::plan;
use crate::value::{AnnotatedValue, ATT_COVERS};

use super::base::{item_channel, join_operator, spawn_operator, StopHandle};
use super::{
    eval_row_count, keys_from_value, run_consumer, ConsumerOperator, Operator, OperatorBase, Phase,
};

/// Full keyspace scan in key order.
pub struct PrimaryScan {
    base: OperatorBase,
    plan: plan::PrimaryScan,
    keyspace: Arc<dyn Keyspace>,
}

impl PrimaryScan {
    pub fn new(plan: plan::PrimaryScan, keyspace: Arc<dyn Keyspace>) -> Self {
        Self {
            base: OperatorBase::new(),
            plan,
            keyspace,
        }
    }
}

#[async_trait]
impl Operator for PrimaryScan {
    fn name(&self) -> &'static str {
        "PrimaryScan"
    }

    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    async fn run(&mut self, ctx: &Arc<QueryContext>) -> Result<()> {
        let limit = eval_row_count(&self.plan.limit, "scan limit")?;

        self.base.switch_phase(Phase::Serv);
        let rows = self.keyspace.primary_scan(limit).map_err(Error::from)?;
        self.base.switch_phase(Phase::Exec);

        let alias = self.plan.keyspace.alias.clone();
        for (key, doc) in rows {
            if ctx.stopped() || self.base.stop_requested() {
                break;
            }
            let mut row = AnnotatedValue::bind(&alias, doc);
            row.set_key(&key);
            if !self.base.send_item(row).await {
                break;
            }
        }
        Ok(())
    }
}

/// Secondary index scan emitting key rows with cover values.
pub struct IndexScan {
    base: OperatorBase,
    plan: plan::IndexScan,
    index: Arc<dyn Index>,
}

impl IndexScan {
    pub fn new(plan: plan::IndexScan, index: Arc<dyn Index>) -> Self {
        Self {
            base: OperatorBase::new(),
            plan,
            index,
        }
    }
}

#[async_trait]
impl Operator for IndexScan {
    fn name(&self) -> &'static str {
        "IndexScan"
    }

    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    async fn run(&mut self, ctx: &Arc<QueryContext>) -> Result<()> {
        let limit = eval_row_count(&self.plan.limit, "scan limit")?;
        let offset = eval_row_count(&self.plan.offset, "scan offset")?.unwrap_or(0);
        let fetch_cap = limit.map(|l| l + offset);

        self.base.switch_phase(Phase::Serv);
        let entries = self
            .index
            .scan(&self.plan.span, fetch_cap)
            .map_err(Error::from)?;
        self.base.switch_phase(Phase::Exec);

        let field = self.index.field().to_string();
        let alias = self.plan.keyspace.alias.clone();
        for entry in entries.into_iter().skip(offset as usize) {
            if ctx.stopped() || self.base.stop_requested() {
                break;
            }
            let value = if self.plan.covering {
                let mut doc = serde_json::Map::new();
                if let Some(cover) = entry.covers.first() {
                    doc.insert(field.clone(), cover.clone());
                }
                let mut row = serde_json::Map::new();
                row.insert(alias.clone(), Value::Object(doc));
                Value::Object(row)
            } else {
                Value::Null
            };
            let mut row = AnnotatedValue::new(value);
            row.set_key(&entry.key);
            row.set_attachment(ATT_COVERS, Value::Array(entry.covers));
            if !self.base.send_item(row).await {
                break;
            }
        }
        Ok(())
    }
}

/// Scan of explicitly listed keys.
pub struct KeyScan {
    base: OperatorBase,
    plan: plan::KeyScan,
}

impl KeyScan {
    pub fn new(plan: plan::KeyScan) -> Self {
        Self {
            base: OperatorBase::new(),
            plan,
        }
    }
}

#[async_trait]
impl Operator for KeyScan {
    fn name(&self) -> &'static str {
        "KeyScan"
    }

    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    async fn run(&mut self, ctx: &Arc<QueryContext>) -> Result<()> {
        let keys = self
            .plan
            .keys
            .evaluate(&AnnotatedValue::default())
            .map_err(|e| Error::evaluation("KEYS clause", e))?;
        for key in keys_from_value(&keys) {
            if ctx.stopped() || self.base.stop_requested() {
                break;
            }
            let mut row = AnnotatedValue::new(Value::Null);
            row.set_key(&key);
            if !self.base.send_item(row).await {
                break;
            }
        }
        Ok(())
    }
}

/// Scan over literal VALUES pairs.
pub struct ValueScan {
    base: OperatorBase,
    plan: plan::ValueScan,
}

impl ValueScan {
    pub fn new(plan: plan::ValueScan) -> Self {
        Self {
            base: OperatorBase::new(),
            plan,
        }
    }
}

#[async_trait]
impl Operator for ValueScan {
    fn name(&self) -> &'static str {
        "ValueScan"
    }

    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    async fn run(&mut self, ctx: &Arc<QueryContext>) -> Result<()> {
        let pairs = self.plan.values.clone();
        for pair in pairs {
            if ctx.stopped() || self.base.stop_requested() {
                break;
            }
            let empty = AnnotatedValue::default();
            let key = match pair.key.evaluate(&empty) {
                Ok(Value::String(k)) => k,
                Ok(other) => {
                    ctx.error(Error::invalid_value(format!(
                        "insert key must be a string, got {}",
                        other
                    )));
                    continue;
                }
                Err(e) => {
                    ctx.error(Error::evaluation("insert key", e));
                    continue;
                }
            };
            let value = match pair.value.evaluate(&empty) {
                Ok(v) => v,
                Err(e) => {
                    ctx.error(Error::evaluation("insert value", e));
                    continue;
                }
            };
            let mut row = AnnotatedValue::new(value);
            row.set_key(&key);
            if !self.base.send_item(row).await {
                break;
            }
        }
        Ok(())
    }
}

/// Key-to-document fetch; batches keys against the keyspace.
pub struct Fetch {
    base: OperatorBase,
    plan: plan::Fetch,
    keyspace: Arc<dyn Keyspace>,
    batch_size: usize,
    pending: Vec<String>,
}

impl Fetch {
    pub fn new(plan: plan::Fetch, keyspace: Arc<dyn Keyspace>, batch_size: usize) -> Self {
        Self {
            base: OperatorBase::new(),
            plan,
            keyspace,
            batch_size: batch_size.max(1),
            pending: Vec::new(),
        }
    }

    async fn flush_batch(&mut self, ctx: &Arc<QueryContext>) -> Result<bool> {
        if self.pending.is_empty() {
            return Ok(true);
        }
        let keys = std::mem::take(&mut self.pending);

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

        let mut docs: HashMap<String, Value> = found.into_iter().collect();
        let alias = self.plan.keyspace.alias.clone();
        for key in keys {
            // missing documents are skipped, not errors
            let Some(doc) = docs.remove(&key) else {
                continue;
            };
            let mut row = AnnotatedValue::bind(&alias, doc);
            row.set_key(&key);
            if !self.base.send_item(row).await {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl Operator for Fetch {
    fn name(&self) -> &'static str {
        "Fetch"
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
impl ConsumerOperator for Fetch {
    async fn process_item(
        &mut self,
        item: AnnotatedValue,
        ctx: &Arc<QueryContext>,
    ) -> Result<bool> {
        let Some(key) = item.key() else {
            ctx.error(Error::invalid_value("fetch input row has no document key"));
            return Ok(true);
        };
        self.pending.push(key.to_string());
        if self.pending.len() >= self.batch_size {
            return self.flush_batch(ctx).await;
        }
        Ok(true)
    }

    async fn flush(&mut self, ctx: &Arc<QueryContext>) -> Result<()> {
        self.flush_batch(ctx).await.map(|_| ())
    }
}

/// Shared harness for the key-combining scans: spawns children over one
/// internal channel and returns their stop handles and join handles.
struct ChildScans {
    stops: Vec<StopHandle>,
    handles: Vec<tokio::task::JoinHandle<Box<dyn Operator>>>,
}

fn start_children(
    children: Vec<Box<dyn Operator>>,
    tx: super::ItemSender,
    ctx: &Arc<QueryContext>,
) -> ChildScans {
    let mut stops = Vec::with_capacity(children.len());
    let mut handles = Vec::with_capacity(children.len());
    for mut child in children {
        child.base_mut().set_output(tx.clone());
        stops.push(child.base().stop_handle());
        handles.push(spawn_operator(child, ctx));
    }
    ChildScans { stops, handles }
}

impl ChildScans {
    fn stop_all(&self) {
        for stop in &self.stops {
            stop.send_stop();
        }
    }

    async fn join_into(self, out: &mut Vec<Box<dyn Operator>>) {
        for handle in self.handles {
            if let Some(child) = join_operator(handle).await {
                out.push(child);
            }
        }
    }
}

/// Intersection of child scans: emits keys seen by every child.
pub struct IntersectScan {
    base: OperatorBase,
    plan: plan::IntersectScan,
    children: Vec<Box<dyn Operator>>,
    channel_cap: usize,
}

impl IntersectScan {
    pub fn new(
        plan: plan::IntersectScan,
        children: Vec<Box<dyn Operator>>,
        channel_cap: usize,
    ) -> Self {
        Self {
            base: OperatorBase::new(),
            plan,
            children,
            channel_cap,
        }
    }
}

#[async_trait]
impl Operator for IntersectScan {
    fn name(&self) -> &'static str {
        "IntersectScan"
    }

    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    async fn run(&mut self, ctx: &Arc<QueryContext>) -> Result<()> {
        let limit = eval_row_count(&self.plan.limit, "scan limit")?;
        let n = self.children.len();
        let (tx, mut rx) = item_channel(self.channel_cap);
        let scans = start_children(std::mem::take(&mut self.children), tx, ctx);

        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut emitted = 0u64;
        let mut stop = self.base.stop_signal();

        loop {
            if stop.stop_requested() || ctx.stopped() {
                break;
            }
            self.base.switch_phase(Phase::Chan);
            let received = tokio::select! {
                biased;
                _ = stop.wait() => None,
                item = rx.recv() => item,
            };
            self.base.switch_phase(Phase::Exec);

            let Some(item) = received else {
                break;
            };
            self.base.add_in_docs(1);
            let Some(key) = item.key().map(str::to_string) else {
                continue;
            };
            let seen = counts.entry(key).or_insert(0);
            *seen += 1;
            if *seen == n {
                if !self.base.send_item(item).await {
                    break;
                }
                emitted += 1;
                if limit.is_some_and(|l| emitted >= l) {
                    break;
                }
            }
        }

        scans.stop_all();
        drop(rx);
        scans.join_into(&mut self.children).await;
        Ok(())
    }

    async fn done(&mut self) {
        for child in &mut self.children {
            child.done().await;
        }
        self.children.clear();
    }
}

/// Intersection preserving the order of the first child scan.
pub struct OrderedIntersectScan {
    base: OperatorBase,
    plan: plan::OrderedIntersectScan,
    children: Vec<Box<dyn Operator>>,
    channel_cap: usize,
}

impl OrderedIntersectScan {
    pub fn new(
        plan: plan::OrderedIntersectScan,
        children: Vec<Box<dyn Operator>>,
        channel_cap: usize,
    ) -> Self {
        Self {
            base: OperatorBase::new(),
            plan,
            children,
            channel_cap,
        }
    }
}

#[async_trait]
impl Operator for OrderedIntersectScan {
    fn name(&self) -> &'static str {
        "OrderedIntersectScan"
    }

    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    async fn run(&mut self, ctx: &Arc<QueryContext>) -> Result<()> {
        let limit = eval_row_count(&self.plan.limit, "scan limit")?;
        let mut children = std::mem::take(&mut self.children);
        if children.is_empty() {
            return Err(Error::plan_internal("ordered intersect with no scans"));
        }
        let first = children.remove(0);
        let n_rest = children.len();

        // the unordered children drain first; their keys gate the
        // ordered stream
        let (tx, mut rx) = item_channel(self.channel_cap);
        let rest = start_children(children, tx, ctx);
        let mut seen: HashMap<String, usize> = HashMap::new();
        self.base.switch_phase(Phase::Chan);
        while let Some(item) = rx.recv().await {
            if ctx.stopped() {
                break;
            }
            if let Some(key) = item.key() {
                *seen.entry(key.to_string()).or_insert(0) += 1;
            }
        }
        self.base.switch_phase(Phase::Exec);
        rest.join_into(&mut self.children).await;

        let (tx, mut rx) = item_channel(self.channel_cap);
        let lead = start_children(vec![first], tx, ctx);
        let mut emitted = 0u64;
        let mut stop = self.base.stop_signal();
        loop {
            if stop.stop_requested() || ctx.stopped() {
                break;
            }
            self.base.switch_phase(Phase::Chan);
            let received = tokio::select! {
                biased;
                _ = stop.wait() => None,
                item = rx.recv() => item,
            };
            self.base.switch_phase(Phase::Exec);
            let Some(item) = received else {
                break;
            };
            self.base.add_in_docs(1);
            let matched = item
                .key()
                .map(|k| seen.get(k).copied().unwrap_or(0) == n_rest)
                .unwrap_or(false);
            if matched {
                if !self.base.send_item(item).await {
                    break;
                }
                emitted += 1;
                if limit.is_some_and(|l| emitted >= l) {
                    break;
                }
            }
        }
        lead.stop_all();
        drop(rx);
        lead.join_into(&mut self.children).await;
        Ok(())
    }

    async fn done(&mut self) {
        for child in &mut self.children {
            child.done().await;
        }
        self.children.clear();
    }
}

/// Union of child scans: emits each key once, in arrival order.
pub struct UnionScan {
    base: OperatorBase,
    plan: plan::UnionScan,
    children: Vec<Box<dyn Operator>>,
    channel_cap: usize,
}

impl UnionScan {
    pub fn new(plan: plan::UnionScan, children: Vec<Box<dyn Operator>>, channel_cap: usize) -> Self {
        Self {
            base: OperatorBase::new(),
            plan,
            children,
            channel_cap,
        }
    }
}

#[async_trait]
impl Operator for UnionScan {
    fn name(&self) -> &'static str {
        "UnionScan"
    }

    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    async fn run(&mut self, ctx: &Arc<QueryContext>) -> Result<()> {
        let limit = eval_row_count(&self.plan.limit, "scan limit")?;
        let (tx, mut rx) = item_channel(self.channel_cap);
        let scans = start_children(std::mem::take(&mut self.children), tx, ctx);

        let mut seen: HashSet<String> = HashSet::new();
        let mut emitted = 0u64;
        let mut stop = self.base.stop_signal();

        loop {
            if stop.stop_requested() || ctx.stopped() {
                break;
            }
            self.base.switch_phase(Phase::Chan);
            let received = tokio::select! {
                biased;
                _ = stop.wait() => None,
                item = rx.recv() => item,
            };
            self.base.switch_phase(Phase::Exec);
            let Some(item) = received else {
                break;
            };
            self.base.add_in_docs(1);
            let Some(key) = item.key().map(str::to_string) else {
                continue;
            };
            if seen.insert(key) {
                if !self.base.send_item(item).await {
                    break;
                }
                emitted += 1;
                if limit.is_some_and(|l| emitted >= l) {
                    break;
                }
            }
        }

        scans.stop_all();
        drop(rx);
        scans.join_into(&mut self.children).await;
        Ok(())
    }

    async fn done(&mut self) {
        for child in &mut self.children {
            child.done().await;
        }
        self.children.clear();
    }
}
