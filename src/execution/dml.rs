//! DML operators
//!
//! Send operators batch mutations to the datastore, cap them with the
//! statement limit, surface per-document errors at the datastore's
//! severity, and emit the written rows for RETURNING consumers.
//! Clone/Set/Unset prepare the working copy an update writes back.
//! All of them are inert under a readonly context.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::{Error, QueryContext, Result};
use crate::datastore::Keyspace;
use crate::expression::Expr;
use crate::plan;
use crate::value::{AnnotatedValue, ATT_CLONE};

use super::{eval_row_count, run_consumer, ConsumerOperator, Operator, OperatorBase, Phase};

/// An identifier/field chain as a path, for SET/UNSET targets.
fn expr_to_path(expr: &Expr) -> Option<Vec<String>> {
    match expr {
        Expr::Identifier(name) => Some(vec![name.clone()]),
        Expr::Field(base, name) => {
            let mut path = expr_to_path(base)?;
            path.push(name.clone());
            Some(path)
        }
        _ => None,
    }
}

fn set_path(doc: &mut Value, path: &[String], value: Value) {
    let Some((first, rest)) = path.split_first() else {
        return;
    };
    if !doc.is_object() {
        *doc = Value::Object(serde_json::Map::new());
    }
    let Some(map) = doc.as_object_mut() else {
        return;
    };
    if rest.is_empty() {
        map.insert(first.clone(), value);
        return;
    }
    let slot = map.entry(first.clone()).or_insert(Value::Null);
    set_path(slot, rest, value);
}

fn unset_path(doc: &mut Value, path: &[String]) {
    let Some((first, rest)) = path.split_first() else {
        return;
    };
    let Some(map) = doc.as_object_mut() else {
        return;
    };
    if rest.is_empty() {
        map.remove(first);
        return;
    }
    if let Some(slot) = map.get_mut(first) {
        unset_path(slot, rest);
    }
}

/// Which datastore write a send operator performs.
enum SendKind {
    Insert,
    Upsert,
    Update,
}

/// Shared body of the three document-writing send operators.
struct SendBase {
    keyspace: Arc<dyn Keyspace>,
    alias: String,
    batch_size: usize,
    batch: Vec<(String, Value)>,
    remaining: Option<u64>,
}

impl SendBase {
    fn new(keyspace: Arc<dyn Keyspace>, alias: &str, batch_size: usize) -> Self {
        Self {
            keyspace,
            alias: alias.to_string(),
            batch_size: batch_size.max(1),
            batch: Vec::new(),
            remaining: None,
        }
    }

    fn consume_one(&mut self) -> bool {
        match &mut self.remaining {
            None => true,
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                true
            }
        }
    }

    async fn flush(
        &mut self,
        kind: &SendKind,
        base: &mut OperatorBase,
        ctx: &Arc<QueryContext>,
    ) -> Result<bool> {
        if self.batch.is_empty() {
            return Ok(true);
        }
        let pairs = std::mem::take(&mut self.batch);

        base.switch_phase(Phase::Serv);
        let (written, errs) = match kind {
            SendKind::Insert => self.keyspace.insert(pairs),
            SendKind::Upsert => self.keyspace.upsert(pairs),
            SendKind::Update => self.keyspace.update(pairs),
        };
        base.switch_phase(Phase::Exec);

        let mut fatal = false;
        for e in errs {
            fatal |= e.is_fatal();
            ctx.error(e.into());
        }
        if fatal {
            return Ok(false);
        }

        ctx.add_mutations(written.len() as u64);
        for (key, doc) in written {
            let mut row = AnnotatedValue::bind(&self.alias, doc);
            row.set_key(&key);
            if !base.send_item(row).await {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Batched inserts.
pub struct SendInsert {
    base: OperatorBase,
    plan: plan::SendInsert,
    send: SendBase,
}

impl SendInsert {
    pub fn new(plan: plan::SendInsert, keyspace: Arc<dyn Keyspace>, batch_size: usize) -> Self {
        let send = SendBase::new(keyspace, &plan.keyspace.alias, batch_size);
        Self {
            base: OperatorBase::new(),
            plan,
            send,
        }
    }

    fn row_pair(&self, item: &AnnotatedValue, ctx: &Arc<QueryContext>) -> Option<(String, Value)> {
        let key = match &self.plan.key {
            Some(expr) => match expr.evaluate(item) {
                Ok(Value::String(k)) => k,
                Ok(other) => {
                    ctx.error(Error::invalid_value(format!(
                        "insert key must be a string, got {}",
                        other
                    )));
                    return None;
                }
                Err(e) => {
                    ctx.error(Error::evaluation("insert key", e));
                    return None;
                }
            },
            None => match item.key() {
                Some(k) => k.to_string(),
                None => {
                    ctx.error(Error::invalid_value("insert row has no document key"));
                    return None;
                }
            },
        };
        let doc = match &self.plan.value {
            Some(expr) => match expr.evaluate(item) {
                Ok(v) => v,
                Err(e) => {
                    ctx.error(Error::evaluation("insert value", e));
                    return None;
                }
            },
            None => item.value().clone(),
        };
        Some((key, doc))
    }
}

#[async_trait]
impl Operator for SendInsert {
    fn name(&self) -> &'static str {
        "SendInsert"
    }

    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    async fn run(&mut self, ctx: &Arc<QueryContext>) -> Result<()> {
        if ctx.readonly() {
            return Ok(());
        }
        self.send.remaining = eval_row_count(&self.plan.limit, "LIMIT")?;
        run_consumer(self, ctx).await
    }
}

#[async_trait]
impl ConsumerOperator for SendInsert {
    async fn process_item(
        &mut self,
        item: AnnotatedValue,
        ctx: &Arc<QueryContext>,
    ) -> Result<bool> {
        if !self.send.consume_one() {
            return Ok(false);
        }
        if let Some(pair) = self.row_pair(&item, ctx) {
            self.send.batch.push(pair);
        }
        if self.send.batch.len() >= self.send.batch_size {
            return self.send.flush(&SendKind::Insert, &mut self.base, ctx).await;
        }
        Ok(true)
    }

    async fn flush(&mut self, ctx: &Arc<QueryContext>) -> Result<()> {
        self.send
            .flush(&SendKind::Insert, &mut self.base, ctx)
            .await
            .map(|_| ())
    }
}

/// Batched insert-or-replace.
pub struct Upsert {
    base: OperatorBase,
    plan: plan::Upsert,
    send: SendBase,
}

impl Upsert {
    pub fn new(plan: plan::Upsert, keyspace: Arc<dyn Keyspace>, batch_size: usize) -> Self {
        let send = SendBase::new(keyspace, &plan.keyspace.alias, batch_size);
        Self {
            base: OperatorBase::new(),
            plan,
            send,
        }
    }
}

#[async_trait]
impl Operator for Upsert {
    fn name(&self) -> &'static str {
        "Upsert"
    }

    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    async fn run(&mut self, ctx: &Arc<QueryContext>) -> Result<()> {
        if ctx.readonly() {
            return Ok(());
        }
        self.send.remaining = eval_row_count(&self.plan.limit, "LIMIT")?;
        run_consumer(self, ctx).await
    }
}

#[async_trait]
impl ConsumerOperator for Upsert {
    async fn process_item(
        &mut self,
        item: AnnotatedValue,
        ctx: &Arc<QueryContext>,
    ) -> Result<bool> {
        if !self.send.consume_one() {
            return Ok(false);
        }
        let key = match &self.plan.key {
            Some(expr) => match expr.evaluate(&item) {
                Ok(Value::String(k)) => Some(k),
                Ok(other) => {
                    ctx.error(Error::invalid_value(format!(
                        "upsert key must be a string, got {}",
                        other
                    )));
                    None
                }
                Err(e) => {
                    ctx.error(Error::evaluation("upsert key", e));
                    None
                }
            },
            None => item.key().map(str::to_string),
        };
        let Some(key) = key else {
            return Ok(true);
        };
        let doc = match &self.plan.value {
            Some(expr) => match expr.evaluate(&item) {
                Ok(v) => v,
                Err(e) => {
                    ctx.error(Error::evaluation("upsert value", e));
                    return Ok(true);
                }
            },
            None => item.value().clone(),
        };
        self.send.batch.push((key, doc));
        if self.send.batch.len() >= self.send.batch_size {
            return self.send.flush(&SendKind::Upsert, &mut self.base, ctx).await;
        }
        Ok(true)
    }

    async fn flush(&mut self, ctx: &Arc<QueryContext>) -> Result<()> {
        self.send
            .flush(&SendKind::Upsert, &mut self.base, ctx)
            .await
            .map(|_| ())
    }
}

/// Batched updates writing the working copy back.
pub struct SendUpdate {
    base: OperatorBase,
    plan: plan::SendUpdate,
    send: SendBase,
}

impl SendUpdate {
    pub fn new(plan: plan::SendUpdate, keyspace: Arc<dyn Keyspace>, batch_size: usize) -> Self {
        let send = SendBase::new(keyspace, &plan.keyspace.alias, batch_size);
        Self {
            base: OperatorBase::new(),
            plan,
            send,
        }
    }
}

#[async_trait]
impl Operator for SendUpdate {
    fn name(&self) -> &'static str {
        "SendUpdate"
    }

    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    async fn run(&mut self, ctx: &Arc<QueryContext>) -> Result<()> {
        if ctx.readonly() {
            return Ok(());
        }
        self.send.remaining = eval_row_count(&self.plan.limit, "LIMIT")?;
        run_consumer(self, ctx).await
    }
}

#[async_trait]
impl ConsumerOperator for SendUpdate {
    async fn process_item(
        &mut self,
        mut item: AnnotatedValue,
        ctx: &Arc<QueryContext>,
    ) -> Result<bool> {
        if !self.send.consume_one() {
            return Ok(false);
        }
        let Some(key) = item.key().map(str::to_string) else {
            ctx.error(Error::invalid_value("update row has no document key"));
            return Ok(true);
        };
        // prefer the working copy prepared by Clone/Set/Unset
        let doc = match item.take_attachment(ATT_CLONE) {
            Some(doc) => doc,
            None => match item.field(&self.plan.keyspace.alias) {
                Some(doc) => doc.clone(),
                None => {
                    ctx.error(Error::invalid_value("update row has no target document"));
                    return Ok(true);
                }
            },
        };
        self.send.batch.push((key, doc));
        if self.send.batch.len() >= self.send.batch_size {
            return self.send.flush(&SendKind::Update, &mut self.base, ctx).await;
        }
        Ok(true)
    }

    async fn flush(&mut self, ctx: &Arc<QueryContext>) -> Result<()> {
        self.send
            .flush(&SendKind::Update, &mut self.base, ctx)
            .await
            .map(|_| ())
    }
}

/// Batched deletes by document key.
pub struct SendDelete {
    base: OperatorBase,
    plan: plan::SendDelete,
    keyspace: Arc<dyn Keyspace>,
    batch_size: usize,
    batch: Vec<String>,
    rows: HashMap<String, AnnotatedValue>,
    remaining: Option<u64>,
}

impl SendDelete {
    pub fn new(plan: plan::SendDelete, keyspace: Arc<dyn Keyspace>, batch_size: usize) -> Self {
        Self {
            base: OperatorBase::new(),
            plan,
            keyspace,
            batch_size: batch_size.max(1),
            batch: Vec::new(),
            rows: HashMap::new(),
            remaining: None,
        }
    }

    async fn flush_batch(&mut self, ctx: &Arc<QueryContext>) -> Result<bool> {
        if self.batch.is_empty() {
            return Ok(true);
        }
        let keys = std::mem::take(&mut self.batch);

        self.base.switch_phase(Phase::Serv);
        let (deleted, errs) = self.keyspace.delete(&keys);
        self.base.switch_phase(Phase::Exec);

        let mut fatal = false;
        for e in errs {
            fatal |= e.is_fatal();
            ctx.error(e.into());
        }
        if fatal {
            return Ok(false);
        }

        ctx.add_mutations(deleted.len() as u64);
        for key in deleted {
            if let Some(row) = self.rows.remove(&key) {
                if !self.base.send_item(row).await {
                    return Ok(false);
                }
            }
        }
        self.rows.clear();
        Ok(true)
    }
}

#[async_trait]
impl Operator for SendDelete {
    fn name(&self) -> &'static str {
        "SendDelete"
    }

    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    async fn run(&mut self, ctx: &Arc<QueryContext>) -> Result<()> {
        if ctx.readonly() {
            return Ok(());
        }
        self.remaining = eval_row_count(&self.plan.limit, "LIMIT")?;
        run_consumer(self, ctx).await
    }
}

#[async_trait]
impl ConsumerOperator for SendDelete {
    async fn process_item(
        &mut self,
        item: AnnotatedValue,
        ctx: &Arc<QueryContext>,
    ) -> Result<bool> {
        match &mut self.remaining {
            Some(0) => return Ok(false),
            Some(n) => *n -= 1,
            None => {}
        }
        let Some(key) = item.key().map(str::to_string) else {
            ctx.error(Error::invalid_value("delete row has no document key"));
            return Ok(true);
        };
        self.batch.push(key.clone());
        self.rows.insert(key, item);
        if self.batch.len() >= self.batch_size {
            return self.flush_batch(ctx).await;
        }
        Ok(true)
    }

    async fn flush(&mut self, ctx: &Arc<QueryContext>) -> Result<()> {
        self.flush_batch(ctx).await.map(|_| ())
    }
}

/// Copy the target document into the working-copy attachment.
pub struct Clone {
    base: OperatorBase,
    plan: plan::Clone,
}

impl Clone {
    pub fn new(plan: plan::Clone) -> Self {
        Self {
            base: OperatorBase::new(),
            plan,
        }
    }
}

#[async_trait]
impl Operator for Clone {
    fn name(&self) -> &'static str {
        "Clone"
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
impl ConsumerOperator for Clone {
    async fn process_item(
        &mut self,
        mut item: AnnotatedValue,
        _ctx: &Arc<QueryContext>,
    ) -> Result<bool> {
        let copy = item
            .field(&self.plan.alias)
            .cloned()
            .unwrap_or(Value::Null);
        item.set_attachment(ATT_CLONE, copy);
        Ok(self.base.send_item(item).await)
    }
}

/// Apply SET terms to the working copy.
pub struct Set {
    base: OperatorBase,
    plan: plan::Set,
}

impl Set {
    pub fn new(plan: plan::Set) -> Self {
        Self {
            base: OperatorBase::new(),
            plan,
        }
    }
}

#[async_trait]
impl Operator for Set {
    fn name(&self) -> &'static str {
        "Set"
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
impl ConsumerOperator for Set {
    async fn process_item(
        &mut self,
        mut item: AnnotatedValue,
        ctx: &Arc<QueryContext>,
    ) -> Result<bool> {
        let Some(mut doc) = item.take_attachment(ATT_CLONE) else {
            ctx.error(Error::invalid_value("SET with no working copy"));
            return Ok(true);
        };
        for term in &self.plan.terms {
            let Some(path) = expr_to_path(&term.path) else {
                ctx.error(Error::invalid_value(format!(
                    "SET path `{}` is not a field path",
                    term.path
                )));
                continue;
            };
            match term.value.evaluate(&item) {
                Ok(v) => set_path(&mut doc, &path, v),
                Err(e) => ctx.error(Error::evaluation("SET value", e)),
            }
        }
        item.set_attachment(ATT_CLONE, doc);
        Ok(self.base.send_item(item).await)
    }
}

/// Remove UNSET paths from the working copy.
pub struct Unset {
    base: OperatorBase,
    plan: plan::Unset,
}

impl Unset {
    pub fn new(plan: plan::Unset) -> Self {
        Self {
            base: OperatorBase::new(),
            plan,
        }
    }
}

#[async_trait]
impl Operator for Unset {
    fn name(&self) -> &'static str {
        "Unset"
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
impl ConsumerOperator for Unset {
    async fn process_item(
        &mut self,
        mut item: AnnotatedValue,
        ctx: &Arc<QueryContext>,
    ) -> Result<bool> {
        let Some(mut doc) = item.take_attachment(ATT_CLONE) else {
            ctx.error(Error::invalid_value("UNSET with no working copy"));
            return Ok(true);
        };
        for path_expr in &self.plan.paths {
            let Some(path) = expr_to_path(path_expr) else {
                ctx.error(Error::invalid_value(format!(
                    "UNSET path `{}` is not a field path",
                    path_expr
                )));
                continue;
            };
            unset_path(&mut doc, &path);
        }
        item.set_attachment(ATT_CLONE, doc);
        Ok(self.base.send_item(item).await)
    }
}
