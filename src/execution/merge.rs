//! MERGE operator
//!
//! Routes each source row to up to three child DML pipelines over a
//! single match stream. A keyed merge evaluates the key expression and
//! fetches the target document; a join-driven merge reads the match
//! outcome off the row. Matched rows go to update then delete,
//! unmatched rows to insert, never both. Children share the merge's
//! output and are wound down by closing their input channels once the
//! source stream ends.

use std::sync::Arc;
use std::sync::LazyLock;

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::core::{Error, QueryContext, Result};
use crate::datastore::Keyspace;
use crate::plan;
use crate::value::AnnotatedValue;

use super::base::{item_channel, join_operator, spawn_operator, ChildReceiver};
use super::pool::{ChannelPool, OperatorPool};
use super::{ItemSender, Operator, OperatorBase, Phase};

static MERGE_OPERATOR_POOL: LazyLock<OperatorPool> = LazyLock::new(|| OperatorPool::new(3));
static MERGE_CHANNEL_POOL: LazyLock<ChannelPool> = LazyLock::new(|| ChannelPool::new(3));

/// A started child pipeline: its sole input sender and running task.
struct StartedChild {
    input: ItemSender,
    handle: JoinHandle<Box<dyn Operator>>,
}

pub struct Merge {
    base: OperatorBase,
    plan: plan::Merge,
    keyspace: Arc<dyn Keyspace>,
    update: Option<Box<dyn Operator>>,
    delete: Option<Box<dyn Operator>>,
    insert: Option<Box<dyn Operator>>,
    channel_cap: usize,
}

impl Merge {
    pub fn new(
        plan: plan::Merge,
        keyspace: Arc<dyn Keyspace>,
        update: Option<Box<dyn Operator>>,
        delete: Option<Box<dyn Operator>>,
        insert: Option<Box<dyn Operator>>,
        channel_cap: usize,
    ) -> Self {
        Self {
            base: OperatorBase::new(),
            plan,
            keyspace,
            update,
            delete,
            insert,
            channel_cap,
        }
    }

    /// Wire a child pipeline: fresh input channel, shared output, and a
    /// completion notification back to the merge.
    fn wrap_child(
        &self,
        child: Option<Box<dyn Operator>>,
        notify: &super::ChildSender,
        ctx: &Arc<QueryContext>,
    ) -> Option<StartedChild> {
        let mut child = child?;
        let (tx, rx) = item_channel(self.channel_cap);
        child.base_mut().set_input(rx);
        if let Some(output) = self.base.output() {
            child.base_mut().set_output(output);
        }
        child.base_mut().set_parent_notify(notify.clone());
        let handle = spawn_operator(child, ctx);
        Some(StartedChild { input: tx, handle })
    }

    /// Send a row to one child, racing the stop signal.
    async fn send_to_child(&mut self, child: &StartedChild, item: AnnotatedValue) -> bool {
        if self.base.stop_requested() {
            return false;
        }
        let mut stop = self.base.stop_signal();
        self.base.switch_phase(Phase::Chan);
        let sent = tokio::select! {
            biased;
            _ = stop.wait() => false,
            sent = child.input.send(item) => sent.is_ok(),
        };
        self.base.switch_phase(Phase::Exec);
        sent
    }

    /// Route one source row. Row-scoped failures (bad key type,
    /// evaluation errors) drop the row and keep the stream going;
    /// fatal datastore errors stop it.
    async fn process_match(
        &mut self,
        mut item: AnnotatedValue,
        ctx: &Arc<QueryContext>,
        update: &Option<StartedChild>,
        delete: &Option<StartedChild>,
        insert: &Option<StartedChild>,
    ) -> Result<bool> {
        let matched = match self.plan.key.clone() {
            Some(key_expr) => {
                let kv = match key_expr.evaluate(&item) {
                    Ok(v) => v,
                    Err(e) => {
                        ctx.error(Error::evaluation("MERGE key", e));
                        return Ok(true);
                    }
                };
                let Value::String(key) = kv else {
                    ctx.error(Error::invalid_value(format!(
                        "invalid MERGE key {}, expected a string",
                        kv
                    )));
                    return Ok(true);
                };

                self.base.switch_phase(Phase::Serv);
                let (found, errs) = self.keyspace.fetch(std::slice::from_ref(&key));
                self.base.switch_phase(Phase::Exec);

                let mut fatal = false;
                for e in errs {
                    fatal |= e.is_fatal();
                    ctx.error(e.into());
                }
                if fatal {
                    return Ok(false);
                }

                item.set_key(&key);
                match found.into_iter().next() {
                    Some((_, doc)) => {
                        item.set_field(&self.plan.keyspace.alias, doc);
                        true
                    }
                    None => false,
                }
            }
            // join-driven merge: the join already bound the target
            None => item.field(&self.plan.keyspace.alias).is_some(),
        };

        if matched {
            match (update, delete) {
                (Some(update_child), Some(delete_child)) => {
                    if !self.send_to_child(update_child, item.clone()).await {
                        return Ok(false);
                    }
                    if !self.send_to_child(delete_child, item).await {
                        return Ok(false);
                    }
                }
                (Some(update_child), None) => {
                    if !self.send_to_child(update_child, item).await {
                        return Ok(false);
                    }
                }
                (None, Some(delete_child)) => {
                    if !self.send_to_child(delete_child, item).await {
                        return Ok(false);
                    }
                }
                (None, None) => {}
            }
        } else if let Some(insert_child) = insert {
            if !self.send_to_child(insert_child, item).await {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn wait_children(&mut self, n: usize, child_rx: &mut ChildReceiver) {
        self.base.switch_phase(Phase::Chan);
        for _ in 0..n {
            if child_rx.recv().await.is_none() {
                break;
            }
        }
        self.base.switch_phase(Phase::Exec);
    }
}

#[async_trait]
impl Operator for Merge {
    fn name(&self) -> &'static str {
        "Merge"
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

        let Some(mut input) = self.base.take_input() else {
            return Err(Error::plan_internal("merge has no source stream"));
        };

        let (notify_tx, mut notify_rx) = tokio::sync::mpsc::channel(3);
        let has_update = self.update.is_some();
        let has_delete = self.delete.is_some();
        let has_insert = self.insert.is_some();
        let update_child = self.update.take();
        let update = self.wrap_child(update_child, &notify_tx, ctx);
        let delete_child = self.delete.take();
        let delete = self.wrap_child(delete_child, &notify_tx, ctx);
        let insert_child = self.insert.take();
        let insert = self.wrap_child(insert_child, &notify_tx, ctx);
        let n_children = [has_update, has_delete, has_insert]
            .iter()
            .filter(|p| **p)
            .count();

        let mut stop = self.base.stop_signal();
        loop {
            if stop.stop_requested() || ctx.stopped() {
                break;
            }
            self.base.switch_phase(Phase::Chan);
            let received = tokio::select! {
                biased;
                _ = stop.wait() => None,
                item = input.recv() => item,
            };
            self.base.switch_phase(Phase::Exec);
            let Some(item) = received else {
                break;
            };
            self.base.add_in_docs(1);
            if !self
                .process_match(item, ctx, &update, &delete, &insert)
                .await?
            {
                break;
            }
        }

        // close child inputs, signalling end of stream to the children
        let mut inputs = MERGE_CHANNEL_POOL.get();
        let mut handles = Vec::with_capacity(n_children);
        for child in [update, delete, insert].into_iter().flatten() {
            inputs.push(child.input);
            handles.push(child.handle);
        }
        MERGE_CHANNEL_POOL.put(inputs);

        self.wait_children(n_children, &mut notify_rx).await;

        // recover the children, in wiring order, for teardown
        let mut recovered = MERGE_OPERATOR_POOL.get();
        for handle in handles {
            if let Some(child) = join_operator(handle).await {
                recovered.push(child);
            }
        }
        let mut drained = recovered.drain(..);
        if has_update {
            self.update = drained.next();
        }
        if has_delete {
            self.delete = drained.next();
        }
        if has_insert {
            self.insert = drained.next();
        }
        drop(drained);
        MERGE_OPERATOR_POOL.put(recovered);

        Ok(())
    }

    async fn done(&mut self) {
        for slot in [&mut self.update, &mut self.delete, &mut self.insert] {
            if let Some(child) = slot {
                child.done().await;
            }
            *slot = None;
        }
    }
}
