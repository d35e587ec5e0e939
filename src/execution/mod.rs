//! Operator execution runtime
//!
//! Runtime twins of the plan nodes: each operator is a cooperatively
//! scheduled task consuming annotated values from a bounded input
//! channel and producing them to a bounded output channel. End of
//! stream propagates by channel close; cancellation propagates by stop
//! signal and is polled between items and before datastore calls.
//! Faults never unwind across an operator boundary: they become
//! context errors and a clean shutdown.

pub mod base;
pub mod build;
pub mod control;
pub mod dml;
pub mod join;
pub mod merge;
pub mod pool;
pub mod query;
pub mod scan;
pub mod setop;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::{Error, QueryContext, Result};
use crate::expression::Expr;
use crate::value::AnnotatedValue;

pub use base::{
    item_channel, join_operator, run_consumer, run_operator, spawn_operator, ChildReceiver,
    ChildSender, ItemReceiver, ItemSender, OperatorBase, Phase, PhaseTimes, StopHandle,
    StopSignal,
};
pub use build::{build_exec, BuildEnv};
pub use pool::{ChannelPool, OperatorPool, SlicePool};

/// An execution operator: the runtime counterpart of one plan node.
///
/// The body runs at most once per instance; `run_operator` enforces the
/// guard and handles teardown. After the task joins, `done` releases
/// children and pooled buffers.
#[async_trait]
pub trait Operator: Send {
    fn name(&self) -> &'static str;

    fn base(&self) -> &OperatorBase;

    fn base_mut(&mut self) -> &mut OperatorBase;

    /// The variant body. Runs inside the uniform driver; errors are
    /// recorded in the context sink by the driver, not returned to the
    /// parent.
    async fn run(&mut self, ctx: &Arc<QueryContext>) -> Result<()>;

    /// Recursive teardown after the body has exited.
    async fn done(&mut self) {}
}

/// Operators with the standard consume-process-forward shape.
#[async_trait]
pub trait ConsumerOperator: Operator {
    /// Handle one input item. False stops the loop early.
    async fn process_item(&mut self, item: AnnotatedValue, ctx: &Arc<QueryContext>)
        -> Result<bool>;

    /// Called once at end of stream, not after an early stop.
    async fn flush(&mut self, _ctx: &Arc<QueryContext>) -> Result<()> {
        Ok(())
    }
}

/// Evaluate an optional limit/offset expression to a row count.
/// Non-numeric values are evaluation errors.
pub(crate) fn eval_row_count(expr: &Option<Expr>, what: &str) -> Result<Option<u64>> {
    let Some(expr) = expr else {
        return Ok(None);
    };
    let v = expr
        .evaluate(&AnnotatedValue::default())
        .map_err(|e| Error::evaluation(what, e))?;
    match v.as_i64() {
        Some(n) => Ok(Some(n.max(0) as u64)),
        None => Err(Error::invalid_value(format!(
            "{} must be a non-negative integer, got {}",
            what, v
        ))),
    }
}

/// Document keys out of an evaluated key expression: one string or an
/// array of strings.
pub(crate) fn keys_from_value(v: &Value) -> Vec<String> {
    match v {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|i| i.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_eval_row_count() {
        assert_eq!(eval_row_count(&None, "limit").unwrap(), None);
        assert_eq!(
            eval_row_count(&Some(Expr::literal(10)), "limit").unwrap(),
            Some(10)
        );
        assert!(eval_row_count(&Some(Expr::literal("x")), "limit").is_err());
    }

    #[test]
    fn test_keys_from_value() {
        assert_eq!(keys_from_value(&json!("k1")), vec!["k1"]);
        assert_eq!(keys_from_value(&json!(["a", "b", 3])), vec!["a", "b"]);
        assert!(keys_from_value(&json!(42)).is_empty());
    }
}
