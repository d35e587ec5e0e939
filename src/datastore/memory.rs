//! In-memory datastore
//!
//! Reference implementation of the datastore traits for embedding and
//! tests. Documents live in a shared ordered map; secondary indexes
//! evaluate their field against the live map on every scan, so they are
//! never stale.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use uuid::Uuid;

use super::errors::{DatastoreError, Result};
use super::{Catalog, Index, IndexEntry, IndexSpan, Keyspace};
use crate::value;

type Docs = Arc<RwLock<BTreeMap<String, Value>>>;

/// In-memory catalog of keyspaces.
#[derive(Default)]
pub struct MemCatalog {
    keyspaces: RwLock<HashMap<String, Arc<MemKeyspace>>>,
}

impl MemCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_keyspace(&self, name: &str) -> Arc<MemKeyspace> {
        let ks = Arc::new(MemKeyspace::new(name));
        self.keyspaces
            .write()
            .expect("catalog lock")
            .insert(name.to_string(), Arc::clone(&ks));
        ks
    }

    pub fn drop_keyspace(&self, name: &str) -> bool {
        self.keyspaces
            .write()
            .expect("catalog lock")
            .remove(name)
            .is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<MemKeyspace>> {
        self.keyspaces.read().expect("catalog lock").get(name).cloned()
    }
}

impl Catalog for MemCatalog {
    fn keyspace(&self, name: &str) -> Option<Arc<dyn Keyspace>> {
        self.get(name).map(|ks| ks as Arc<dyn Keyspace>)
    }
}

/// In-memory keyspace.
pub struct MemKeyspace {
    name: String,
    docs: Docs,
    indexes: RwLock<HashMap<String, Arc<MemIndex>>>,
    fingerprint: RwLock<Uuid>,
    // keys that fail on access, for exercising error paths
    poisoned: RwLock<HashSet<String>>,
    poison_fatal: RwLock<bool>,
}

impl MemKeyspace {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            docs: Arc::new(RwLock::new(BTreeMap::new())),
            indexes: RwLock::new(HashMap::new()),
            fingerprint: RwLock::new(Uuid::new_v4()),
            poisoned: RwLock::new(HashSet::new()),
            poison_fatal: RwLock::new(false),
        }
    }

    /// Create a single-field index. Replacing an index of the same name
    /// gives it a fresh fingerprint.
    pub fn create_index(&self, index_name: &str, field: &str) -> Arc<MemIndex> {
        let idx = Arc::new(MemIndex {
            name: index_name.to_string(),
            field: field.to_string(),
            fingerprint: Uuid::new_v4(),
            docs: Arc::clone(&self.docs),
        });
        self.indexes
            .write()
            .expect("index lock")
            .insert(index_name.to_string(), Arc::clone(&idx));
        *self.fingerprint.write().expect("fingerprint lock") = Uuid::new_v4();
        idx
    }

    pub fn drop_index(&self, index_name: &str) -> bool {
        let removed = self
            .indexes
            .write()
            .expect("index lock")
            .remove(index_name)
            .is_some();
        if removed {
            *self.fingerprint.write().expect("fingerprint lock") = Uuid::new_v4();
        }
        removed
    }

    /// Make key accesses fail, for exercising error handling.
    pub fn poison_key(&self, key: &str, fatal: bool) {
        self.poisoned.write().expect("poison lock").insert(key.to_string());
        *self.poison_fatal.write().expect("poison lock") = fatal;
    }

    fn poison_error(&self, key: &str) -> Option<DatastoreError> {
        let poisoned = self.poisoned.read().expect("poison lock");
        if !poisoned.contains(key) {
            return None;
        }
        let fatal = *self.poison_fatal.read().expect("poison lock");
        let msg = format!("keyspace `{}`: key `{}` unavailable", self.name, key);
        Some(if fatal {
            DatastoreError::fatal(msg)
        } else {
            DatastoreError::new(msg)
        })
    }
}

impl Keyspace for MemKeyspace {
    fn name(&self) -> &str {
        &self.name
    }

    fn fingerprint(&self) -> Uuid {
        *self.fingerprint.read().expect("fingerprint lock")
    }

    fn count(&self) -> u64 {
        self.docs.read().expect("docs lock").len() as u64
    }

    fn fetch(&self, keys: &[String]) -> (Vec<(String, Value)>, Vec<DatastoreError>) {
        let docs = self.docs.read().expect("docs lock");
        let mut found = Vec::with_capacity(keys.len());
        let mut errs = Vec::new();
        for key in keys {
            if let Some(e) = self.poison_error(key) {
                errs.push(e);
                continue;
            }
            if let Some(doc) = docs.get(key) {
                found.push((key.clone(), doc.clone()));
            }
        }
        (found, errs)
    }

    fn insert(&self, pairs: Vec<(String, Value)>) -> (Vec<(String, Value)>, Vec<DatastoreError>) {
        let mut docs = self.docs.write().expect("docs lock");
        let mut written = Vec::with_capacity(pairs.len());
        let mut errs = Vec::new();
        for (key, doc) in pairs {
            if let Some(e) = self.poison_error(&key) {
                errs.push(e);
                continue;
            }
            if docs.contains_key(&key) {
                errs.push(DatastoreError::new(format!(
                    "keyspace `{}`: duplicate key `{}`",
                    self.name, key
                )));
                continue;
            }
            docs.insert(key.clone(), doc.clone());
            written.push((key, doc));
        }
        (written, errs)
    }

    fn update(&self, pairs: Vec<(String, Value)>) -> (Vec<(String, Value)>, Vec<DatastoreError>) {
        let mut docs = self.docs.write().expect("docs lock");
        let mut written = Vec::with_capacity(pairs.len());
        let mut errs = Vec::new();
        for (key, doc) in pairs {
            if let Some(e) = self.poison_error(&key) {
                errs.push(e);
                continue;
            }
            if !docs.contains_key(&key) {
                errs.push(DatastoreError::new(format!(
                    "keyspace `{}`: missing key `{}`",
                    self.name, key
                )));
                continue;
            }
            docs.insert(key.clone(), doc.clone());
            written.push((key, doc));
        }
        (written, errs)
    }

    fn upsert(&self, pairs: Vec<(String, Value)>) -> (Vec<(String, Value)>, Vec<DatastoreError>) {
        let mut docs = self.docs.write().expect("docs lock");
        let mut written = Vec::with_capacity(pairs.len());
        let mut errs = Vec::new();
        for (key, doc) in pairs {
            if let Some(e) = self.poison_error(&key) {
                errs.push(e);
                continue;
            }
            docs.insert(key.clone(), doc.clone());
            written.push((key, doc));
        }
        (written, errs)
    }

    fn delete(&self, keys: &[String]) -> (Vec<String>, Vec<DatastoreError>) {
        let mut docs = self.docs.write().expect("docs lock");
        let mut deleted = Vec::with_capacity(keys.len());
        let mut errs = Vec::new();
        for key in keys {
            if let Some(e) = self.poison_error(key) {
                errs.push(e);
                continue;
            }
            if docs.remove(key).is_some() {
                deleted.push(key.clone());
            } else {
                errs.push(DatastoreError::new(format!(
                    "keyspace `{}`: missing key `{}`",
                    self.name, key
                )));
            }
        }
        (deleted, errs)
    }

    fn primary_scan(&self, limit: Option<u64>) -> Result<Vec<(String, Value)>> {
        let docs = self.docs.read().expect("docs lock");
        let cap = limit.unwrap_or(u64::MAX) as usize;
        Ok(docs
            .iter()
            .take(cap)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn index(&self, name: &str) -> Option<Arc<dyn Index>> {
        self.indexes
            .read()
            .expect("index lock")
            .get(name)
            .map(|i| Arc::clone(i) as Arc<dyn Index>)
    }

    fn indexes(&self) -> Vec<Arc<dyn Index>> {
        self.indexes
            .read()
            .expect("index lock")
            .values()
            .map(|i| Arc::clone(i) as Arc<dyn Index>)
            .collect()
    }
}

/// Single-field index over a keyspace's live document map.
pub struct MemIndex {
    name: String,
    field: String,
    fingerprint: Uuid,
    docs: Docs,
}

impl Index for MemIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn field(&self) -> &str {
        &self.field
    }

    fn fingerprint(&self) -> Uuid {
        self.fingerprint
    }

    fn scan(&self, span: &IndexSpan, limit: Option<u64>) -> Result<Vec<IndexEntry>> {
        let docs = self.docs.read().expect("docs lock");
        let mut entries: Vec<(Value, String)> = Vec::new();

        for (key, doc) in docs.iter() {
            let Some(field_val) = doc.as_object().and_then(|m| m.get(&self.field)) else {
                continue;
            };
            let matched = match span {
                IndexSpan::Eq(v) => value::compare(field_val, v) == std::cmp::Ordering::Equal,
                IndexSpan::Range { low, high } => {
                    let above = low
                        .as_ref()
                        .map(|l| value::compare(field_val, l) != std::cmp::Ordering::Less)
                        .unwrap_or(true);
                    let below = high
                        .as_ref()
                        .map(|h| value::compare(field_val, h) != std::cmp::Ordering::Greater)
                        .unwrap_or(true);
                    above && below
                }
                IndexSpan::Full => true,
            };
            if matched {
                entries.push((field_val.clone(), key.clone()));
            }
        }

        // field-value order, key order breaking ties
        entries.sort_by(|(va, ka), (vb, kb)| value::compare(va, vb).then_with(|| ka.cmp(kb)));

        let cap = limit.unwrap_or(u64::MAX) as usize;
        Ok(entries
            .into_iter()
            .take(cap)
            .map(|(v, key)| IndexEntry {
                key,
                covers: vec![v],
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seeded() -> (MemCatalog, Arc<MemKeyspace>) {
        let cat = MemCatalog::new();
        let ks = cat.create_keyspace("users");
        ks.upsert(vec![
            ("u1".into(), json!({"age": 31, "city": "lyon"})),
            ("u2".into(), json!({"age": 25, "city": "oslo"})),
            ("u3".into(), json!({"age": 42, "city": "lyon"})),
        ]);
        (cat, ks)
    }

    #[test]
    fn test_fetch_skips_missing_keys() {
        let (_, ks) = seeded();
        let (found, errs) = ks.fetch(&["u1".into(), "nope".into()]);
        assert_eq!(found.len(), 1);
        assert!(errs.is_empty());
    }

    #[test]
    fn test_insert_duplicate_is_non_fatal_error() {
        let (_, ks) = seeded();
        let (written, errs) = ks.insert(vec![("u1".into(), json!({}))]);
        assert!(written.is_empty());
        assert_eq!(errs.len(), 1);
        assert!(!errs[0].is_fatal());
    }

    #[test]
    fn test_index_scan_eq_and_range() {
        let (_, ks) = seeded();
        let idx = ks.create_index("by_city", "city");
        let hits = idx.scan(&IndexSpan::Eq(json!("lyon")), None).unwrap();
        let keys: Vec<_> = hits.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["u1", "u3"]);

        let idx = ks.create_index("by_age", "age");
        let hits = idx
            .scan(
                &IndexSpan::Range {
                    low: Some(json!(26)),
                    high: None,
                },
                None,
            )
            .unwrap();
        let keys: Vec<_> = hits.iter().map(|e| e.key.as_str()).collect();
        // ordered by age: u1 (31), u3 (42)
        assert_eq!(keys, vec!["u1", "u3"]);
        assert_eq!(hits[0].covers, vec![json!(31)]);
    }

    #[test]
    fn test_index_ddl_bumps_keyspace_fingerprint() {
        let (_, ks) = seeded();
        let before = ks.fingerprint();
        ks.create_index("by_age", "age");
        let after_create = ks.fingerprint();
        assert_ne!(before, after_create);
        ks.drop_index("by_age");
        assert_ne!(after_create, ks.fingerprint());
    }

    #[test]
    fn test_recreated_index_has_new_fingerprint() {
        let (_, ks) = seeded();
        let first = ks.create_index("by_age", "age").fingerprint();
        ks.drop_index("by_age");
        let second = ks.create_index("by_age", "age").fingerprint();
        assert_ne!(first, second);
    }

    #[test]
    fn test_poisoned_key_severity() {
        let (_, ks) = seeded();
        ks.poison_key("u2", true);
        let (found, errs) = ks.fetch(&["u1".into(), "u2".into()]);
        assert_eq!(found.len(), 1);
        assert_eq!(errs.len(), 1);
        assert!(errs[0].is_fatal());
    }

    #[test]
    fn test_catalog_drop() {
        let (cat, _) = seeded();
        assert!(cat.keyspace("users").is_some());
        assert!(cat.drop_keyspace("users"));
        assert!(cat.keyspace("users").is_none());
    }
}
