//! Mapping between memories and vector-store metadata.

use serde_json::{json, Value};

use papr_types::{Memory, Tier};
use papr_vector::{Metadata, VERSION_KEY};

use crate::error::SyncError;

/// Metadata key holding the tier a record was placed in.
pub const TIER_KEY: &str = "tier";

/// Memory fields (minus embeddings) plus tier and context version.
pub fn memory_metadata(memory: &Memory, tier: Tier, version: u64) -> Result<Metadata, SyncError> {
    let mut metadata = match serde_json::to_value(memory.without_embeddings())? {
        Value::Object(map) => map.into_iter().collect(),
        _ => Metadata::new(),
    };
    metadata.insert(TIER_KEY.to_string(), json!(tier.as_str()));
    metadata.insert(VERSION_KEY.to_string(), json!(version));
    Ok(metadata)
}

/// Rebuild the memory a record was written from.
pub fn memory_from_metadata(metadata: &Metadata) -> Option<Memory> {
    let map = metadata
        .iter()
        .filter(|(k, _)| k.as_str() != TIER_KEY && k.as_str() != VERSION_KEY)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    serde_json::from_value(Value::Object(map)).ok()
}

/// True when `incoming` is strictly older than the stored copy.
pub fn is_older_than_stored(incoming: &Memory, stored: &Metadata) -> bool {
    let Some(incoming_at) = incoming.updated_at else {
        return false;
    };
    stored
        .get("updated_at")
        .and_then(|v| serde_json::from_value::<chrono::DateTime<chrono::Utc>>(v.clone()).ok())
        .is_some_and(|stored_at| incoming_at < stored_at)
}
