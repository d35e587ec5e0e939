//! Aggregate functions
//!
//! Aggregates run in three phases so grouping can be split across a
//! parallel fan-out: cumulate-initial folds raw rows into a part,
//! cumulate-intermediate merges parts, compute-final produces the result.
//! Non-number inputs are ignored by the numeric aggregates.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::expression::{EvalError, Expr};
use crate::value::{self, AnnotatedValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateKind {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    Stddev,
}

impl AggregateKind {
    pub fn name(&self) -> &'static str {
        match self {
            AggregateKind::Count => "count",
            AggregateKind::Sum => "sum",
            AggregateKind::Avg => "avg",
            AggregateKind::Min => "min",
            AggregateKind::Max => "max",
            AggregateKind::Stddev => "stddev",
        }
    }
}

/// An aggregate call bound to its operand and result alias.
#[derive(Debug, Clone)]
pub struct AggregateCall {
    pub kind: AggregateKind,
    pub operand: Expr,
    pub alias: String,
}

impl AggregateCall {
    pub fn new(kind: AggregateKind, operand: Expr, alias: &str) -> Self {
        Self {
            kind,
            operand,
            alias: alias.to_string(),
        }
    }

    /// The cumulative part before any input.
    pub fn default_part(&self) -> Value {
        match self.kind {
            AggregateKind::Count => json!(0),
            _ => Value::Null,
        }
    }

    /// Fold one raw row into the cumulative part.
    pub fn cumulate_initial(
        &self,
        row: &AnnotatedValue,
        cumulative: Value,
    ) -> Result<Value, EvalError> {
        let item = self.operand.evaluate(row)?;
        Ok(match self.kind {
            AggregateKind::Count => {
                if item.is_null() {
                    cumulative
                } else {
                    json!(cumulative.as_i64().unwrap_or(0) + 1)
                }
            }
            AggregateKind::Sum => match item.as_f64() {
                Some(x) => json!(cumulative.as_f64().unwrap_or(0.0) + x),
                None => cumulative,
            },
            AggregateKind::Avg => match item.as_f64() {
                Some(x) => {
                    let (n, s) = avg_part(&cumulative);
                    json!({"count": n + 1, "sum": s + x})
                }
                None => cumulative,
            },
            AggregateKind::Min => min_max(cumulative, item, true),
            AggregateKind::Max => min_max(cumulative, item, false),
            AggregateKind::Stddev => match item.as_f64() {
                Some(x) => {
                    let (n, s, q) = stddev_part(&cumulative);
                    json!({"count": n + 1, "sum": s + x, "sumsq": q + x * x})
                }
                None => cumulative,
            },
        })
    }

    /// Merge an intermediate part into the cumulative part.
    pub fn cumulate_intermediate(&self, part: Value, cumulative: Value) -> Value {
        match self.kind {
            AggregateKind::Count => {
                json!(cumulative.as_i64().unwrap_or(0) + part.as_i64().unwrap_or(0))
            }
            AggregateKind::Sum => match (cumulative.as_f64(), part.as_f64()) {
                (None, None) => Value::Null,
                (c, p) => json!(c.unwrap_or(0.0) + p.unwrap_or(0.0)),
            },
            AggregateKind::Avg => {
                if part.is_null() {
                    return cumulative;
                }
                let (cn, cs) = avg_part(&cumulative);
                let (pn, ps) = avg_part(&part);
                json!({"count": cn + pn, "sum": cs + ps})
            }
            AggregateKind::Min => min_max(cumulative, part, true),
            AggregateKind::Max => min_max(cumulative, part, false),
            AggregateKind::Stddev => {
                if part.is_null() {
                    return cumulative;
                }
                let (cn, cs, cq) = stddev_part(&cumulative);
                let (pn, ps, pq) = stddev_part(&part);
                json!({"count": cn + pn, "sum": cs + ps, "sumsq": cq + pq})
            }
        }
    }

    /// Produce the final result from the cumulative part.
    ///
    /// Stddev is the sample standard deviation: null with no number
    /// inputs, 0 for a single input.
    pub fn compute_final(&self, cumulative: Value) -> Value {
        match self.kind {
            AggregateKind::Count => {
                if cumulative.is_null() {
                    json!(0)
                } else {
                    cumulative
                }
            }
            AggregateKind::Sum | AggregateKind::Min | AggregateKind::Max => cumulative,
            AggregateKind::Avg => {
                if cumulative.is_null() {
                    return Value::Null;
                }
                let (n, s) = avg_part(&cumulative);
                if n == 0 {
                    Value::Null
                } else {
                    json!(s / n as f64)
                }
            }
            AggregateKind::Stddev => {
                if cumulative.is_null() {
                    return Value::Null;
                }
                let (n, s, q) = stddev_part(&cumulative);
                match n {
                    0 => Value::Null,
                    1 => json!(0.0),
                    _ => {
                        let n = n as f64;
                        let variance = ((q - s * s / n) / (n - 1.0)).max(0.0);
                        json!(variance.sqrt())
                    }
                }
            }
        }
    }
}

fn min_max(cumulative: Value, item: Value, min: bool) -> Value {
    if item.is_null() {
        return cumulative;
    }
    if cumulative.is_null() {
        return item;
    }
    let keep_item = match value::compare(&item, &cumulative) {
        std::cmp::Ordering::Less => min,
        std::cmp::Ordering::Greater => !min,
        std::cmp::Ordering::Equal => false,
    };
    if keep_item {
        item
    } else {
        cumulative
    }
}

fn avg_part(v: &Value) -> (i64, f64) {
    match v.as_object() {
        Some(m) => (
            m.get("count").and_then(Value::as_i64).unwrap_or(0),
            m.get("sum").and_then(Value::as_f64).unwrap_or(0.0),
        ),
        None => (0, 0.0),
    }
}

fn stddev_part(v: &Value) -> (i64, f64, f64) {
    match v.as_object() {
        Some(m) => (
            m.get("count").and_then(Value::as_i64).unwrap_or(0),
            m.get("sum").and_then(Value::as_f64).unwrap_or(0.0),
            m.get("sumsq").and_then(Value::as_f64).unwrap_or(0.0),
        ),
        None => (0, 0.0, 0.0),
    }
}
