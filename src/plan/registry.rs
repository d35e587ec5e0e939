//! Operator registry
//!
//! Maps `#operator` discriminator strings to decode functions. Built
//! once before the first decode. Two operators may not share a
//! discriminator; a duplicate is a construction-time panic in debug
//! builds.

use std::collections::HashMap;
use std::sync::LazyLock;

use serde_json::Value;

use super::errors::{PlanError, Result};
use super::{registry_entries, PlanOp};

pub type DecodeFn = fn(Value) -> Result<PlanOp>;

static REGISTRY: LazyLock<HashMap<&'static str, DecodeFn>> = LazyLock::new(|| {
    let mut map = HashMap::new();
    for (name, decode) in registry_entries() {
        let previous = map.insert(name, decode);
        debug_assert!(
            previous.is_none(),
            "duplicate plan operator discriminator `{}`",
            name
        );
    }
    map
});

/// Decode a plan object already known to carry `#operator == name`.
pub fn decode(name: &str, body: Value) -> Result<PlanOp> {
    match REGISTRY.get(name) {
        Some(decode) => decode(body),
        None => Err(PlanError::UnknownOperator(name.to_string())),
    }
}

/// All registered discriminators, sorted.
pub fn operator_names() -> Vec<&'static str> {
    let mut names: Vec<_> = REGISTRY.keys().copied().collect();
    names.sort_unstable();
    names
}
