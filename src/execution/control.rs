//! Composite and utility operators
//!
//! Sequence wires its children end to end; Parallel fans input out to
//! copies of a subtree built fresh from the plan. Stream, Discard,
//! Collect, Authorize, CreateFunction, and Prepare are the pipeline
//! endpoints.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::{Error, QueryContext, Result};
use crate::plan;
use crate::value::AnnotatedValue;

use super::base::{item_channel, join_operator, spawn_operator, StopHandle};
use super::build::{build_exec, BuildEnv};
use super::{run_consumer, ConsumerOperator, Operator, OperatorBase, Phase};

/// Children wired end to end; the sequence's input feeds the first
/// child and the last child feeds the sequence's output.
pub struct Sequence {
    base: OperatorBase,
    children: Vec<Box<dyn Operator>>,
    channel_cap: usize,
}

impl Sequence {
    pub fn new(_plan: plan::Sequence, children: Vec<Box<dyn Operator>>, channel_cap: usize) -> Self {
        Self {
            base: OperatorBase::new(),
            children,
            channel_cap,
        }
    }
}

#[async_trait]
impl Operator for Sequence {
    fn name(&self) -> &'static str {
        "Sequence"
    }

    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    async fn run(&mut self, ctx: &Arc<QueryContext>) -> Result<()> {
        let mut children = std::mem::take(&mut self.children);
        if children.is_empty() {
            return Ok(());
        }
        let n = children.len();

        if let Some(input) = self.base.take_input() {
            children[0].base_mut().set_input(input);
        }
        for i in 0..n - 1 {
            let (tx, rx) = item_channel(self.channel_cap);
            children[i].base_mut().set_output(tx);
            children[i + 1].base_mut().set_input(rx);
        }
        if let Some(output) = self.base.output() {
            children[n - 1].base_mut().set_output(output);
        }

        let (notify_tx, mut notify_rx) = tokio::sync::mpsc::channel(n);
        let mut handles = Vec::with_capacity(n);
        for mut child in children {
            child.base_mut().set_parent_notify(notify_tx.clone());
            handles.push(spawn_operator(child, ctx));
        }

        self.base.switch_phase(Phase::Chan);
        for _ in 0..n {
            if notify_rx.recv().await.is_none() {
                break;
            }
        }
        for handle in handles {
            if let Some(child) = join_operator(handle).await {
                self.children.push(child);
            }
        }
        self.base.switch_phase(Phase::Exec);
        Ok(())
    }

    async fn done(&mut self) {
        for child in &mut self.children {
            child.done().await;
        }
        self.children.clear();
    }
}

/// Fan input out to copies of the child subtree; outputs fan back into
/// the shared output in arbitrary order.
pub struct Parallel {
    base: OperatorBase,
    plan: plan::Parallel,
    env: Arc<BuildEnv>,
    copies: Vec<Box<dyn Operator>>,
}

impl Parallel {
    pub fn new(plan: plan::Parallel, env: Arc<BuildEnv>) -> Self {
        Self {
            base: OperatorBase::new(),
            plan,
            env,
            copies: Vec::new(),
        }
    }
}

#[async_trait]
impl Operator for Parallel {
    fn name(&self) -> &'static str {
        "Parallel"
    }

    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    async fn run(&mut self, ctx: &Arc<QueryContext>) -> Result<()> {
        let Some(mut input) = self.base.take_input() else {
            return Err(Error::plan_internal("parallel fan-out has no input"));
        };
        let n = self.plan.max_parallelism.max(1);

        self.base.switch_phase(Phase::Init);
        let mut copy_stops: Vec<StopHandle> = Vec::with_capacity(n);
        let mut inputs = Vec::with_capacity(n);
        let mut handles = Vec::with_capacity(n);
        let (notify_tx, mut notify_rx) = tokio::sync::mpsc::channel(n);
        for _ in 0..n {
            let mut copy = build_exec(&self.plan.child, &self.env, &mut copy_stops)?;
            let (tx, rx) = item_channel(self.env.config.pipeline_cap);
            copy.base_mut().set_input(rx);
            if let Some(output) = self.base.output() {
                copy.base_mut().set_output(output);
            }
            copy.base_mut().set_parent_notify(notify_tx.clone());
            inputs.push(tx);
            handles.push(spawn_operator(copy, ctx));
        }
        self.base.switch_phase(Phase::Exec);

        // round-robin distribution; order across copies is not
        // preserved downstream
        let mut next = 0usize;
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

            self.base.switch_phase(Phase::Chan);
            let sent = tokio::select! {
                biased;
                _ = stop.wait() => false,
                sent = inputs[next].send(item) => sent.is_ok(),
            };
            self.base.switch_phase(Phase::Exec);
            if !sent {
                break;
            }
            next = (next + 1) % inputs.len();
        }

        for stop_handle in &copy_stops {
            if self.base.stop_requested() || ctx.stopped() {
                stop_handle.send_stop();
            }
        }
        drop(inputs);

        self.base.switch_phase(Phase::Chan);
        for _ in 0..n {
            if notify_rx.recv().await.is_none() {
                break;
            }
        }
        self.base.switch_phase(Phase::Exec);

        for handle in handles {
            if let Some(copy) = join_operator(handle).await {
                // copies report their runtime back to the fan-out
                self.base.accrue_times(copy.base());
                self.copies.push(copy);
            }
        }
        Ok(())
    }

    async fn done(&mut self) {
        for copy in &mut self.copies {
            copy.done().await;
        }
        self.copies.clear();
    }
}

/// Swallow all input.
pub struct Discard {
    base: OperatorBase,
}

impl Discard {
    pub fn new(_plan: plan::Discard) -> Self {
        Self {
            base: OperatorBase::new(),
        }
    }
}

#[async_trait]
impl Operator for Discard {
    fn name(&self) -> &'static str {
        "Discard"
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
impl ConsumerOperator for Discard {
    async fn process_item(
        &mut self,
        _item: AnnotatedValue,
        _ctx: &Arc<QueryContext>,
    ) -> Result<bool> {
        Ok(true)
    }
}

/// Relay rows to the client sink.
pub struct Stream {
    base: OperatorBase,
}

impl Stream {
    pub fn new(_plan: plan::Stream) -> Self {
        Self {
            base: OperatorBase::new(),
        }
    }
}

#[async_trait]
impl Operator for Stream {
    fn name(&self) -> &'static str {
        "Stream"
    }

    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    async fn run(&mut self, ctx: &Arc<QueryContext>) -> Result<()> {
        self.base.switch_phase(Phase::Stream);
        run_consumer(self, ctx).await
    }
}

#[async_trait]
impl ConsumerOperator for Stream {
    async fn process_item(
        &mut self,
        item: AnnotatedValue,
        _ctx: &Arc<QueryContext>,
    ) -> Result<bool> {
        Ok(self.base.send_item(item).await)
    }
}

const COLLECT_CAP: usize = 64;

/// Buffer the whole input; expose it as one array value at end of
/// stream.
pub struct Collect {
    base: OperatorBase,
    values: Vec<Value>,
}

impl Collect {
    pub fn new(_plan: plan::Collect) -> Self {
        Self {
            base: OperatorBase::new(),
            values: Vec::with_capacity(COLLECT_CAP),
        }
    }

    /// The collected values, valid after the body has finished.
    pub fn values(&self) -> Value {
        Value::Array(self.values.clone())
    }
}

#[async_trait]
impl Operator for Collect {
    fn name(&self) -> &'static str {
        "Collect"
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
impl ConsumerOperator for Collect {
    async fn process_item(
        &mut self,
        item: AnnotatedValue,
        _ctx: &Arc<QueryContext>,
    ) -> Result<bool> {
        if self.values.len() == self.values.capacity() {
            self.values.reserve(self.values.len());
        }
        self.values.push(item.into_value());
        Ok(true)
    }

    async fn flush(&mut self, _ctx: &Arc<QueryContext>) -> Result<()> {
        let row = AnnotatedValue::new(Value::Array(self.values.clone()));
        self.base.send_item(row).await;
        Ok(())
    }
}

/// Credential gate over a subtree.
pub struct Authorize {
    base: OperatorBase,
    plan: plan::Authorize,
    child: Option<Box<dyn Operator>>,
}

impl Authorize {
    pub fn new(plan: plan::Authorize, child: Box<dyn Operator>) -> Self {
        Self {
            base: OperatorBase::new(),
            plan,
            child: Some(child),
        }
    }
}

#[async_trait]
impl Operator for Authorize {
    fn name(&self) -> &'static str {
        "Authorize"
    }

    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    async fn run(&mut self, ctx: &Arc<QueryContext>) -> Result<()> {
        self.base.switch_phase(Phase::Init);
        if !ctx.credentials().may_access(&self.plan.keyspace) {
            ctx.error(Error::authorization(&self.plan.keyspace));
            return Ok(());
        }
        self.base.switch_phase(Phase::Exec);

        let Some(mut child) = self.child.take() else {
            return Err(Error::plan_internal("authorize has no child"));
        };
        if let Some(input) = self.base.take_input() {
            child.base_mut().set_input(input);
        }
        if let Some(output) = self.base.output() {
            child.base_mut().set_output(output);
        }
        let handle = spawn_operator(child, ctx);
        self.base.switch_phase(Phase::Chan);
        self.child = join_operator(handle).await;
        self.base.switch_phase(Phase::Exec);
        Ok(())
    }

    async fn done(&mut self) {
        if let Some(child) = &mut self.child {
            child.done().await;
        }
        self.child = None;
    }
}

/// Register a named function.
pub struct CreateFunction {
    base: OperatorBase,
    plan: plan::CreateFunction,
}

impl CreateFunction {
    pub fn new(plan: plan::CreateFunction) -> Self {
        Self {
            base: OperatorBase::new(),
            plan,
        }
    }
}

#[async_trait]
impl Operator for CreateFunction {
    fn name(&self) -> &'static str {
        "CreateFunction"
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
        self.base.switch_phase(Phase::Serv);
        let result = ctx
            .functions()
            .add(&self.plan.name, self.plan.body.clone(), self.plan.replace);
        self.base.switch_phase(Phase::Exec);
        if let Err(e) = result {
            ctx.error(e);
        }
        Ok(())
    }
}

/// Emit the encoded prepared plan as a single row.
pub struct Prepare {
    base: OperatorBase,
    plan: plan::Prepare,
}

impl Prepare {
    pub fn new(plan: plan::Prepare) -> Self {
        Self {
            base: OperatorBase::new(),
            plan,
        }
    }
}

#[async_trait]
impl Operator for Prepare {
    fn name(&self) -> &'static str {
        "Prepare"
    }

    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    async fn run(&mut self, _ctx: &Arc<QueryContext>) -> Result<()> {
        let row = AnnotatedValue::new(self.plan.prepared.clone());
        self.base.send_item(row).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::QueryContext;
    use crate::execution::base::run_operator;
    use crate::plan::OptEstimate;
    use serde_json::json;

    async fn drive(op: &mut dyn Operator, inputs: Vec<AnnotatedValue>) -> Vec<AnnotatedValue> {
        let (in_tx, in_rx) = super::item_channel(64);
        let (out_tx, mut out_rx) = super::item_channel(64);
        op.base_mut().set_input(in_rx);
        op.base_mut().set_output(out_tx);
        for item in inputs {
            in_tx.send(item).await.unwrap();
        }
        drop(in_tx);

        let ctx = Arc::new(QueryContext::new(true));
        run_operator(op, &ctx).await;

        let mut out = Vec::new();
        while let Some(item) = out_rx.recv().await {
            out.push(item);
        }
        out
    }

    #[tokio::test]
    async fn test_collect_buffers_into_one_array() {
        let mut op = Collect::new(crate::plan::Collect::new(OptEstimate::unavailable()));
        let inputs = (0..3).map(|i| AnnotatedValue::new(json!(i))).collect();
        let out = drive(&mut op, inputs).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value(), &json!([0, 1, 2]));
        assert_eq!(op.values(), json!([0, 1, 2]));
    }

    #[tokio::test]
    async fn test_discard_swallows_everything() {
        let mut op = Discard::new(crate::plan::Discard::new(OptEstimate::unavailable()));
        let inputs = (0..5).map(|i| AnnotatedValue::new(json!(i))).collect();
        let out = drive(&mut op, inputs).await;
        assert!(out.is_empty());
        assert_eq!(op.base().in_docs(), 5);
    }

    #[tokio::test]
    async fn test_prepare_emits_the_encoded_plan_once() {
        let encoded = json!({"#operator": "Sequence", "children": []});
        let mut op = Prepare::new(crate::plan::Prepare::new(
            "p1",
            encoded.clone(),
            OptEstimate::unavailable(),
        ));
        let out = drive(&mut op, Vec::new()).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value(), &encoded);

        // the body is guarded: a second run does nothing
        let ctx = Arc::new(QueryContext::new(true));
        run_operator(&mut op, &ctx).await;
        assert!(op.base().started());
    }
}
