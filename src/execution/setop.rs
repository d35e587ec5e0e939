//! Set operators
//!
//! UnionAll concatenates child pipelines straight into the shared
//! output. IntersectAll and ExceptAll materialize the second pipeline
//! as a multiset of row identities and stream the first against it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{Error, QueryContext, Result};
use crate::plan;
use crate::value;

use super::base::{item_channel, join_operator, spawn_operator};
use super::{Operator, OperatorBase, Phase};

/// Concatenation of child pipelines, arbitrary interleaving.
pub struct UnionAll {
    base: OperatorBase,
    children: Vec<Box<dyn Operator>>,
}

impl UnionAll {
    pub fn new(_plan: plan::UnionAll, children: Vec<Box<dyn Operator>>) -> Self {
        Self {
            base: OperatorBase::new(),
            children,
        }
    }
}

#[async_trait]
impl Operator for UnionAll {
    fn name(&self) -> &'static str {
        "UnionAll"
    }

    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    async fn run(&mut self, ctx: &Arc<QueryContext>) -> Result<()> {
        let children = std::mem::take(&mut self.children);
        let mut handles = Vec::with_capacity(children.len());
        for mut child in children {
            if let Some(output) = self.base.output() {
                child.base_mut().set_output(output);
            }
            handles.push(spawn_operator(child, ctx));
        }
        self.base.switch_phase(Phase::Chan);
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

/// Multiset of row identities out of a materialized child pipeline.
async fn collect_identities(
    mut child: Box<dyn Operator>,
    cap: usize,
    ctx: &Arc<QueryContext>,
) -> (HashMap<String, u64>, Option<Box<dyn Operator>>) {
    let (tx, mut rx) = item_channel(cap);
    child.base_mut().set_output(tx);
    let handle = spawn_operator(child, ctx);

    let mut counts: HashMap<String, u64> = HashMap::new();
    while let Some(row) = rx.recv().await {
        if ctx.stopped() {
            break;
        }
        *counts
            .entry(value::canonical_string(row.value()))
            .or_insert(0) += 1;
    }
    drop(rx);
    (counts, join_operator(handle).await)
}

/// Stream the first child filtered by the second's multiset.
async fn run_filtered(
    base: &mut OperatorBase,
    first: Box<dyn Operator>,
    mut counts: HashMap<String, u64>,
    keep_present: bool,
    cap: usize,
    ctx: &Arc<QueryContext>,
) -> Option<Box<dyn Operator>> {
    let (tx, mut rx) = item_channel(cap);
    let mut first = first;
    first.base_mut().set_output(tx);
    let stop_child = first.base().stop_handle();
    let handle = spawn_operator(first, ctx);

    let mut stop = base.stop_signal();
    loop {
        if stop.stop_requested() || ctx.stopped() {
            break;
        }
        base.switch_phase(Phase::Chan);
        let received = tokio::select! {
            biased;
            _ = stop.wait() => None,
            item = rx.recv() => item,
        };
        base.switch_phase(Phase::Exec);
        let Some(item) = received else {
            break;
        };
        base.add_in_docs(1);

        let identity = value::canonical_string(item.value());
        let present = counts.get(&identity).copied().unwrap_or(0) > 0;
        let emit = if keep_present {
            // intersect: consume one occurrence per emitted row
            if present {
                if let Some(n) = counts.get_mut(&identity) {
                    *n -= 1;
                }
            }
            present
        } else {
            // except: suppress one occurrence per second-side row
            if present {
                if let Some(n) = counts.get_mut(&identity) {
                    *n -= 1;
                }
            }
            !present
        };
        if emit && !base.send_item(item).await {
            break;
        }
    }

    stop_child.send_stop();
    drop(rx);
    join_operator(handle).await
}

/// Rows of the first pipeline also produced by the second.
pub struct IntersectAll {
    base: OperatorBase,
    first: Option<Box<dyn Operator>>,
    second: Option<Box<dyn Operator>>,
    recovered: Vec<Box<dyn Operator>>,
    channel_cap: usize,
}

impl IntersectAll {
    pub fn new(
        _plan: plan::IntersectAll,
        first: Box<dyn Operator>,
        second: Box<dyn Operator>,
        channel_cap: usize,
    ) -> Self {
        Self {
            base: OperatorBase::new(),
            first: Some(first),
            second: Some(second),
            recovered: Vec::new(),
            channel_cap,
        }
    }
}

#[async_trait]
impl Operator for IntersectAll {
    fn name(&self) -> &'static str {
        "IntersectAll"
    }

    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    async fn run(&mut self, ctx: &Arc<QueryContext>) -> Result<()> {
        let (Some(first), Some(second)) = (self.first.take(), self.second.take()) else {
            return Err(Error::plan_internal("intersect with a missing branch"));
        };
        self.base.switch_phase(Phase::Init);
        let (counts, second) = collect_identities(second, self.channel_cap, ctx).await;
        self.base.switch_phase(Phase::Exec);
        if let Some(second) = second {
            self.recovered.push(second);
        }

        if let Some(first) =
            run_filtered(&mut self.base, first, counts, true, self.channel_cap, ctx).await
        {
            self.recovered.push(first);
        }
        Ok(())
    }

    async fn done(&mut self) {
        for child in &mut self.recovered {
            child.done().await;
        }
        self.recovered.clear();
    }
}

/// Rows of the first pipeline not produced by the second.
pub struct ExceptAll {
    base: OperatorBase,
    first: Option<Box<dyn Operator>>,
    second: Option<Box<dyn Operator>>,
    recovered: Vec<Box<dyn Operator>>,
    channel_cap: usize,
}

impl ExceptAll {
    pub fn new(
        _plan: plan::ExceptAll,
        first: Box<dyn Operator>,
        second: Box<dyn Operator>,
        channel_cap: usize,
    ) -> Self {
        Self {
            base: OperatorBase::new(),
            first: Some(first),
            second: Some(second),
            recovered: Vec::new(),
            channel_cap,
        }
    }
}

#[async_trait]
impl Operator for ExceptAll {
    fn name(&self) -> &'static str {
        "ExceptAll"
    }

    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    async fn run(&mut self, ctx: &Arc<QueryContext>) -> Result<()> {
        let (Some(first), Some(second)) = (self.first.take(), self.second.take()) else {
            return Err(Error::plan_internal("except with a missing branch"));
        };
        self.base.switch_phase(Phase::Init);
        let (counts, second) = collect_identities(second, self.channel_cap, ctx).await;
        self.base.switch_phase(Phase::Exec);
        if let Some(second) = second {
            self.recovered.push(second);
        }

        if let Some(first) =
            run_filtered(&mut self.base, first, counts, false, self.channel_cap, ctx).await
        {
            self.recovered.push(first);
        }
        Ok(())
    }

    async fn done(&mut self) {
        for child in &mut self.recovered {
            child.done().await;
        }
        self.recovered.clear();
    }
}
