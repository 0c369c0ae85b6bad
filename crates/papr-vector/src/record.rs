//! Record, filter and log types shared by both tiers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Metadata key carrying the user context version a record was written under.
pub const VERSION_KEY: &str = "user_context_version";

/// Arbitrary JSON metadata, ordered for stable serialization.
pub type Metadata = BTreeMap<String, Value>;

/// One stored entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: Metadata,
    pub document: String,
}

/// On-disk form of a record; `key` links it to the HNSW index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct StoredRecord {
    pub key: u64,
    pub vector: Vec<f32>,
    pub metadata: Metadata,
    pub document: String,
}

impl StoredRecord {
    pub(crate) fn into_record(self, id: String) -> VectorRecord {
        VectorRecord {
            id,
            vector: self.vector,
            metadata: self.metadata,
            document: self.document,
        }
    }

    pub(crate) fn same_content(&self, vector: &[f32], metadata: &Metadata, document: &str) -> bool {
        self.vector == vector && &self.metadata == metadata && self.document == document
    }
}

/// A query hit.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryHit {
    pub id: String,
    /// Cosine distance in `[0, 2]`
    pub distance: f32,
    pub metadata: Metadata,
    pub document: String,
}

impl QueryHit {
    /// `1 - distance`, clamped to `[0, 1]`. NaN maps to 0.
    pub fn similarity(&self) -> f32 {
        similarity_from_distance(self.distance)
    }
}

pub fn similarity_from_distance(distance: f32) -> f32 {
    let s = 1.0 - distance;
    if s.is_nan() {
        0.0
    } else {
        s.clamp(0.0, 1.0)
    }
}

/// Conjunctive equality filter over metadata keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFilter {
    clauses: Vec<(String, Value)>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter on the user context version.
    pub fn version(version: u64) -> Self {
        Self::new().eq(VERSION_KEY, version)
    }

    pub fn eq(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push((key.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.clauses
            .iter()
            .all(|(key, value)| metadata.get(key) == Some(value))
    }
}

/// Kind of change recorded in the upsert log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOp {
    Upsert,
    Delete,
}

/// One upsert-log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub id: String,
    pub op: LogOp,
    pub at: DateTime<Utc>,
}

/// Result of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Identical record already stored; nothing written
    Unchanged,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_is_conjunctive() {
        let mut meta = Metadata::new();
        meta.insert(VERSION_KEY.to_string(), json!(3));
        meta.insert("workspace".to_string(), json!("w1"));

        assert!(MetadataFilter::version(3).matches(&meta));
        assert!(!MetadataFilter::version(4).matches(&meta));
        assert!(MetadataFilter::version(3).eq("workspace", "w1").matches(&meta));
        assert!(!MetadataFilter::version(3).eq("workspace", "w2").matches(&meta));
        assert!(MetadataFilter::new().matches(&meta));
    }

    #[test]
    fn test_missing_key_does_not_match() {
        assert!(!MetadataFilter::version(0).matches(&Metadata::new()));
    }

    #[test]
    fn test_similarity_clamped() {
        assert_eq!(similarity_from_distance(0.0), 1.0);
        assert_eq!(similarity_from_distance(1.5), 0.0);
        assert_eq!(similarity_from_distance(-0.0001), 1.0);
        assert_eq!(similarity_from_distance(f32::NAN), 0.0);
        assert!((similarity_from_distance(0.25) - 0.75).abs() < 1e-6);
    }
}
