//! Operator base
//!
//! The shared runtime state of every execution operator: the item
//! channels linking it to its neighbors, the stop signal, the
//! single-start guard, phase timers, and document counters. Also the
//! uniform body drivers: `run_operator` wraps a variant body with the
//! start guard, fault conversion, and teardown; `run_consumer` is the
//! standard poll-stop/select/process loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::core::{Error, QueryContext, Result};
use crate::value::AnnotatedValue;

use super::Operator;

/// Bounded item channel endpoints.
pub type ItemSender = mpsc::Sender<AnnotatedValue>;
pub type ItemReceiver = mpsc::Receiver<AnnotatedValue>;

/// Completion notifications from child operators to their composite
/// parent.
pub type ChildSender = mpsc::Sender<()>;
pub type ChildReceiver = mpsc::Receiver<()>;

pub fn item_channel(cap: usize) -> (ItemSender, ItemReceiver) {
    mpsc::channel(cap.max(1))
}

/// Sender half of an operator's stop signal. A send means "please
/// stop"; the signal is never closed.
#[derive(Clone, Debug)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

impl StopHandle {
    pub fn send_stop(&self) {
        let _ = self.tx.send(true);
    }
}

/// Receiver half of an operator's stop signal.
#[derive(Clone, Debug)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    /// Non-blocking poll.
    pub fn stop_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when a stop is requested.
    pub async fn wait(&mut self) {
        // an Err means the sender is gone, which only happens at
        // teardown; treat it as a stop
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }
}

/// Execution-time accounting phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Running operator code
    Exec,
    /// Waiting on an item channel
    Chan,
    /// Waiting on the datastore
    Serv,
    /// One-time setup
    Init,
    /// Sorting
    Sort,
    /// Relaying to the client sink
    Stream,
    /// Not accounted to any phase
    NoTime,
}

const PHASE_COUNT: usize = 7;

impl Phase {
    fn index(self) -> usize {
        match self {
            Phase::Exec => 0,
            Phase::Chan => 1,
            Phase::Serv => 2,
            Phase::Init => 3,
            Phase::Sort => 4,
            Phase::Stream => 5,
            Phase::NoTime => 6,
        }
    }
}

/// Per-operator phase timers.
#[derive(Debug, Clone)]
pub struct PhaseTimes {
    current: Phase,
    since: Instant,
    totals: [Duration; PHASE_COUNT],
}

impl PhaseTimes {
    pub fn new() -> Self {
        Self {
            current: Phase::NoTime,
            since: Instant::now(),
            totals: [Duration::ZERO; PHASE_COUNT],
        }
    }

    /// Accrue the elapsed time to the current phase and switch.
    pub fn switch(&mut self, phase: Phase) {
        let now = Instant::now();
        self.totals[self.current.index()] += now - self.since;
        self.current = phase;
        self.since = now;
    }

    pub fn total(&self, phase: Phase) -> Duration {
        self.totals[phase.index()]
    }

    /// Fold another operator's times into this one; used when a copied
    /// operator finishes and reports back to its template.
    pub fn accrue(&mut self, other: &PhaseTimes) {
        for i in 0..PHASE_COUNT {
            self.totals[i] += other.totals[i];
        }
    }
}

impl Default for PhaseTimes {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared runtime state of an execution operator.
#[derive(Debug)]
pub struct OperatorBase {
    input: Option<ItemReceiver>,
    output: Option<ItemSender>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    parent_notify: Option<ChildSender>,
    started: bool,
    active: bool,
    phases: PhaseTimes,
    in_docs: u64,
    out_docs: u64,
}

impl OperatorBase {
    pub fn new() -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            input: None,
            output: None,
            stop_tx,
            stop_rx,
            parent_notify: None,
            started: false,
            active: true,
            phases: PhaseTimes::new(),
            in_docs: 0,
            out_docs: 0,
        }
    }

    pub fn set_input(&mut self, input: ItemReceiver) {
        self.input = Some(input);
    }

    pub fn take_input(&mut self) -> Option<ItemReceiver> {
        self.input.take()
    }

    pub fn set_output(&mut self, output: ItemSender) {
        self.output = Some(output);
    }

    pub fn output(&self) -> Option<ItemSender> {
        self.output.clone()
    }

    pub fn set_parent_notify(&mut self, tx: ChildSender) {
        self.parent_notify = Some(tx);
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
        }
    }

    pub fn stop_signal(&self) -> StopSignal {
        StopSignal {
            rx: self.stop_rx.clone(),
        }
    }

    pub fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Mark the operator dead before start; the body will not run.
    pub fn deactivate(&mut self) {
        self.active = false;
    }

    /// Single-start guard. True exactly once, and only while active.
    pub fn begin(&mut self) -> bool {
        if self.started || !self.active {
            return false;
        }
        self.started = true;
        self.phases.switch(Phase::Exec);
        true
    }

    pub fn started(&self) -> bool {
        self.started
    }

    /// Teardown: closes the output channel (EOF downstream), drops any
    /// unread input (upstream sees the consumer go away), notifies the
    /// parent, and accrues the tail of the current phase.
    pub fn finish(&mut self) {
        self.output = None;
        self.input = None;
        self.phases.switch(Phase::NoTime);
        if let Some(tx) = self.parent_notify.take() {
            let _ = tx.try_send(());
        }
    }

    pub fn switch_phase(&mut self, phase: Phase) {
        self.phases.switch(phase);
    }

    pub fn phase_total(&self, phase: Phase) -> Duration {
        self.phases.total(phase)
    }

    pub fn phases(&self) -> &PhaseTimes {
        &self.phases
    }

    pub fn accrue_times(&mut self, other: &OperatorBase) {
        self.phases.accrue(&other.phases);
        self.in_docs += other.in_docs;
        self.out_docs += other.out_docs;
    }

    pub fn add_in_docs(&mut self, n: u64) {
        self.in_docs += n;
    }

    pub fn in_docs(&self) -> u64 {
        self.in_docs
    }

    pub fn out_docs(&self) -> u64 {
        self.out_docs
    }

    /// Push one item downstream, racing the stop signal. False means
    /// the operator should wind down: stop requested or the consumer is
    /// gone.
    pub async fn send_item(&mut self, item: AnnotatedValue) -> bool {
        if self.stop_requested() {
            return false;
        }
        let Some(output) = self.output.clone() else {
            return false;
        };
        let mut stop = self.stop_signal();
        self.phases.switch(Phase::Chan);
        let sent = tokio::select! {
            biased;
            _ = stop.wait() => false,
            sent = output.send(item) => sent.is_ok(),
        };
        self.phases.switch(Phase::Exec);
        if sent {
            self.out_docs += 1;
        }
        sent
    }
}

impl Default for OperatorBase {
    fn default() -> Self {
        Self::new()
    }
}

/// Drive an operator body once: start guard, fault conversion, and
/// teardown. Any error or panic out of the body becomes a context
/// error and a clean shutdown.
pub async fn run_operator(op: &mut dyn Operator, ctx: &Arc<QueryContext>) {
    if !op.base_mut().begin() {
        return;
    }
    let outcome = std::panic::AssertUnwindSafe(op.run(ctx)).catch_unwind().await;
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => ctx.error(e),
        Err(_) => ctx.error(Error::plan_internal(format!(
            "operator {} panicked",
            op.name()
        ))),
    }
    op.base_mut().finish();
}

/// Spawn an operator as its own task. The task returns the operator so
/// the parent can accrue times and tear it down.
pub fn spawn_operator(
    mut op: Box<dyn Operator>,
    ctx: &Arc<QueryContext>,
) -> JoinHandle<Box<dyn Operator>> {
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        run_operator(op.as_mut(), &ctx).await;
        op
    })
}

/// Join a spawned operator task back into a `Box<dyn Operator>`.
pub async fn join_operator(handle: JoinHandle<Box<dyn Operator>>) -> Option<Box<dyn Operator>> {
    handle.await.ok()
}

/// The standard consumer body: poll the stop signal, select between the
/// stop signal and the input channel, feed items to `process_item`, and
/// call `flush` at end of stream.
pub async fn run_consumer<T>(op: &mut T, ctx: &Arc<QueryContext>) -> Result<()>
where
    T: super::ConsumerOperator + ?Sized,
{
    let Some(mut input) = op.base_mut().take_input() else {
        return Err(Error::plan_internal(format!(
            "operator {} has no input",
            op.name()
        )));
    };
    let mut stop = op.base_mut().stop_signal();
    let mut eof = false;

    loop {
        if stop.stop_requested() || ctx.stopped() {
            break;
        }

        op.base_mut().switch_phase(Phase::Chan);
        let received = tokio::select! {
            biased;
            _ = stop.wait() => None,
            item = input.recv() => item,
        };
        op.base_mut().switch_phase(Phase::Exec);

        match received {
            Some(item) => {
                op.base_mut().add_in_docs(1);
                if !op.process_item(item, ctx).await? {
                    break;
                }
            }
            None => {
                eof = !stop.stop_requested();
                break;
            }
        }
    }

    if eof && !ctx.stopped() {
        op.flush(ctx).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_accrual() {
        let mut times = PhaseTimes::new();
        times.switch(Phase::Exec);
        std::thread::sleep(Duration::from_millis(5));
        times.switch(Phase::Chan);
        assert!(times.total(Phase::Exec) >= Duration::from_millis(5));
        assert_eq!(times.total(Phase::Sort), Duration::ZERO);
    }

    #[test]
    fn test_begin_runs_once() {
        let mut base = OperatorBase::new();
        assert!(base.begin());
        assert!(!base.begin());
    }

    #[test]
    fn test_inactive_never_begins() {
        let mut base = OperatorBase::new();
        base.deactivate();
        assert!(!base.begin());
    }

    #[test]
    fn test_stop_signal_polls() {
        let base = OperatorBase::new();
        let handle = base.stop_handle();
        let signal = base.stop_signal();
        assert!(!signal.stop_requested());
        handle.send_stop();
        assert!(signal.stop_requested());
    }

    #[tokio::test]
    async fn test_send_item_respects_stop() {
        let mut base = OperatorBase::new();
        let (tx, _rx) = item_channel(1);
        base.set_output(tx);
        base.stop_handle().send_stop();
        assert!(!base.send_item(AnnotatedValue::default()).await);
        assert_eq!(base.out_docs(), 0);
    }

    #[tokio::test]
    async fn test_send_item_delivers() {
        let mut base = OperatorBase::new();
        let (tx, mut rx) = item_channel(1);
        base.set_output(tx);
        assert!(base.send_item(AnnotatedValue::default()).await);
        assert_eq!(base.out_docs(), 1);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_finish_closes_output_and_notifies() {
        let mut base = OperatorBase::new();
        let (tx, mut rx) = item_channel(1);
        base.set_output(tx);
        let (child_tx, mut child_rx) = mpsc::channel(1);
        base.set_parent_notify(child_tx);

        base.finish();
        assert!(rx.recv().await.is_none(), "output must be closed");
        assert!(child_rx.recv().await.is_some(), "parent must be notified");
    }
}
