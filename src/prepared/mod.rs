//! Prepared plan cache
//!
//! Compiled plans keyed by name, stored with their encoded wire text.
//! A cache hit is only served after the plan verifies against the live
//! catalog; verification failure evicts the entry and the caller
//! replans. Concurrent inserts under one name are idempotent: last
//! write wins.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::core::{Error, Result};
use crate::datastore::Catalog;
use crate::plan::PlanOp;

/// A cached prepared plan.
#[derive(Debug)]
pub struct Prepared {
    pub name: String,
    /// Wire text the plan was cached under.
    pub encoded: String,
    pub plan: PlanOp,
}

#[derive(Debug, Default)]
pub struct PreparedCache {
    entries: RwLock<HashMap<String, Arc<Prepared>>>,
}

impl PreparedCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, name: &str, plan: PlanOp, encoded: &str) {
        let entry = Arc::new(Prepared {
            name: name.to_string(),
            encoded: encoded.to_string(),
            plan,
        });
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(name.to_string(), entry);
        }
    }

    /// Fetch a plan for execution. Verifies the plan against the
    /// catalog first; on drift the entry is evicted and the caller must
    /// replan.
    pub fn get_verified(&self, name: &str, catalog: &dyn Catalog) -> Result<Arc<Prepared>> {
        let entry = {
            let entries = self
                .entries
                .read()
                .map_err(|_| Error::plan_internal("prepared cache lock poisoned"))?;
            entries.get(name).cloned()
        };
        let Some(entry) = entry else {
            return Err(Error::prepared_not_found(name));
        };

        if !entry.plan.verify(catalog) {
            self.remove(name);
            return Err(Error::prepared_verify(name));
        }
        Ok(entry)
    }

    /// Peek without verification.
    pub fn get(&self, name: &str) -> Option<Arc<Prepared>> {
        self.entries.read().ok()?.get(name).cloned()
    }

    pub fn remove(&self, name: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(name);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorCode;
    use crate::datastore::{Index, IndexSpan, MemCatalog};
    use crate::plan::{IndexScan, KeyspaceTerm, OptEstimate, PrimaryScan};
    use serde_json::json;

    fn scan_plan(catalog: &MemCatalog) -> PlanOp {
        let ks = catalog.get("t").unwrap();
        PrimaryScan::new(
            KeyspaceTerm::from_keyspace(ks.as_ref(), "t"),
            None,
            OptEstimate::unavailable(),
        )
        .into()
    }

    #[test]
    fn test_add_get_verified() {
        let catalog = MemCatalog::new();
        catalog.create_keyspace("t");
        let cache = PreparedCache::new();
        let plan = scan_plan(&catalog);
        cache.add("p1", plan.clone(), &plan.to_json_string().unwrap());

        let hit = cache.get_verified("p1", &catalog).unwrap();
        assert_eq!(hit.plan, plan);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_missing_name() {
        let catalog = MemCatalog::new();
        let cache = PreparedCache::new();
        let err = cache.get_verified("ghost", &catalog).unwrap_err();
        assert_eq!(err.code(), ErrorCode::PreparedNotFound);
    }

    #[test]
    fn test_schema_drift_evicts() {
        let catalog = MemCatalog::new();
        let ks = catalog.create_keyspace("t");
        let idx = ks.create_index("by_b", "b");
        let cache = PreparedCache::new();

        let plan: PlanOp = IndexScan::new(
            KeyspaceTerm::from_keyspace(ks.as_ref(), "t"),
            "by_b",
            idx.fingerprint(),
            IndexSpan::Eq(json!(1)),
            OptEstimate::unavailable(),
        )
        .into();
        cache.add("p1", plan.clone(), &plan.to_json_string().unwrap());
        assert!(cache.get_verified("p1", &catalog).is_ok());

        ks.drop_index("by_b");
        let err = cache.get_verified("p1", &catalog).unwrap_err();
        assert_eq!(err.code(), ErrorCode::PreparedVerify);
        // the stale entry is gone; the next miss forces a replan
        assert!(cache.get("p1").is_none());
    }

    #[test]
    fn test_last_write_wins() {
        let catalog = MemCatalog::new();
        catalog.create_keyspace("t");
        let cache = PreparedCache::new();
        let plan = scan_plan(&catalog);
        cache.add("p1", plan.clone(), "first");
        cache.add("p1", plan, "second");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("p1").unwrap().encoded, "second");
    }
}
