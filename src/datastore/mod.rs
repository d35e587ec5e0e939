//! Datastore interface
//!
//! Trait seams between the execution runtime and the document store:
//! keyspaces (named collections of JSON documents), secondary indexes,
//! and the catalog resolving names. Each keyspace and index carries a
//! structural fingerprint; prepared plans record fingerprints at build
//! time and are only reusable while they still match.

pub mod errors;
pub mod memory;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use errors::DatastoreError;
pub use memory::{MemCatalog, MemKeyspace};

/// One row out of an index scan: the document key plus cover values for
/// the indexed fields.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub key: String,
    pub covers: Vec<Value>,
}

/// The span of an index scan. Serializes as part of the plan wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexSpan {
    /// Exact match on the indexed field.
    Eq(Value),
    /// Range over the indexed field, bounds inclusive.
    Range {
        low: Option<Value>,
        high: Option<Value>,
    },
    /// The whole index.
    Full,
}

/// A secondary index over a single field.
pub trait Index: Send + Sync {
    fn name(&self) -> &str;
    fn field(&self) -> &str;
    /// Changes whenever the index is dropped and recreated.
    fn fingerprint(&self) -> Uuid;
    /// Scan entries in field-value order. `limit` caps the entry count.
    fn scan(&self, span: &IndexSpan, limit: Option<u64>) -> errors::Result<Vec<IndexEntry>>;
}

/// A named collection of JSON documents.
pub trait Keyspace: Send + Sync {
    fn name(&self) -> &str;
    /// Changes on any structural change (index create/drop).
    fn fingerprint(&self) -> Uuid;
    fn count(&self) -> u64;

    /// Fetch documents by key. Missing keys are skipped, not errors.
    /// Per-key failures are returned alongside the found documents.
    fn fetch(&self, keys: &[String]) -> (Vec<(String, Value)>, Vec<DatastoreError>);

    /// Insert documents; existing keys produce non-fatal per-pair errors.
    /// Returns the pairs actually written.
    fn insert(&self, pairs: Vec<(String, Value)>) -> (Vec<(String, Value)>, Vec<DatastoreError>);

    /// Update documents; missing keys produce non-fatal per-pair errors.
    fn update(&self, pairs: Vec<(String, Value)>) -> (Vec<(String, Value)>, Vec<DatastoreError>);

    /// Insert-or-replace.
    fn upsert(&self, pairs: Vec<(String, Value)>) -> (Vec<(String, Value)>, Vec<DatastoreError>);

    /// Delete by key; missing keys produce non-fatal per-key errors.
    fn delete(&self, keys: &[String]) -> (Vec<String>, Vec<DatastoreError>);

    /// All documents in key order.
    fn primary_scan(&self, limit: Option<u64>) -> errors::Result<Vec<(String, Value)>>;

    fn index(&self, name: &str) -> Option<Arc<dyn Index>>;
    fn indexes(&self) -> Vec<Arc<dyn Index>>;
}

/// Name resolution for keyspaces.
pub trait Catalog: Send + Sync {
    fn keyspace(&self, name: &str) -> Option<Arc<dyn Keyspace>>;
}
