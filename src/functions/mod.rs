//! User function registry
//!
//! Named functions created by CREATE FUNCTION. Bodies are opaque values
//! owned by the function runtime; this registry only handles
//! registration, replacement, and lookup.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;

use crate::core::{Error, Result};

/// A registered function.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub body: Value,
}

/// Registry of named functions.
#[derive(Debug, Default)]
pub struct FunctionRegistry {
    by_name: RwLock<HashMap<String, Function>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function. Fails when the name exists and `replace` is
    /// not set.
    pub fn add(&self, name: &str, body: Value, replace: bool) -> Result<()> {
        let mut map = self
            .by_name
            .write()
            .map_err(|_| Error::plan_internal("function registry lock poisoned"))?;
        if !replace && map.contains_key(name) {
            return Err(Error::function_exists(name));
        }
        map.insert(
            name.to_string(),
            Function {
                name: name.to_string(),
                body,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Function> {
        let map = self
            .by_name
            .read()
            .map_err(|_| Error::plan_internal("function registry lock poisoned"))?;
        map.get(name)
            .cloned()
            .ok_or_else(|| Error::function_not_found(name))
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let mut map = self
            .by_name
            .write()
            .map_err(|_| Error::plan_internal("function registry lock poisoned"))?;
        map.remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::function_not_found(name))
    }

    pub fn len(&self) -> usize {
        self.by_name.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorCode;
    use serde_json::json;

    #[test]
    fn test_add_and_get() {
        let reg = FunctionRegistry::new();
        reg.add("double", json!({"args": ["x"], "expr": "x * 2"}), false)
            .unwrap();
        let f = reg.get("double").unwrap();
        assert_eq!(f.name, "double");
    }

    #[test]
    fn test_duplicate_without_replace_rejected() {
        let reg = FunctionRegistry::new();
        reg.add("f", json!(1), false).unwrap();
        let err = reg.add("f", json!(2), false).unwrap_err();
        assert_eq!(err.code(), ErrorCode::FunctionExists);
        // the original body is untouched
        assert_eq!(reg.get("f").unwrap().body, json!(1));
    }

    #[test]
    fn test_replace_swaps_body() {
        let reg = FunctionRegistry::new();
        reg.add("f", json!(1), false).unwrap();
        reg.add("f", json!(2), true).unwrap();
        assert_eq!(reg.get("f").unwrap().body, json!(2));
    }

    #[test]
    fn test_missing_function() {
        let reg = FunctionRegistry::new();
        assert_eq!(
            reg.get("nope").unwrap_err().code(),
            ErrorCode::FunctionNotFound
        );
        assert_eq!(
            reg.remove("nope").unwrap_err().code(),
            ErrorCode::FunctionNotFound
        );
    }
}
