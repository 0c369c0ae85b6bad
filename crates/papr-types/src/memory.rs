//! Memory, tier, and route types.
//!
//! A `Memory` mirrors the remote service's memory item. Only the fields the
//! retrieval core reads are typed; everything else is ignored on decode.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PaprError;

/// Default embedding dimension for the on-device model.
pub const DEFAULT_EMBEDDING_DIM: usize = 2560;

/// Memory type as reported by the server.
///
/// Unknown types are preserved verbatim so they round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MemoryType {
    #[default]
    TextMemoryItem,
    DocumentMemoryItem,
    Goal,
    Okr,
    Other(String),
}

impl MemoryType {
    pub fn as_str(&self) -> &str {
        match self {
            MemoryType::TextMemoryItem => "TextMemoryItem",
            MemoryType::DocumentMemoryItem => "DocumentMemoryItem",
            MemoryType::Goal => "goal",
            MemoryType::Okr => "okr",
            MemoryType::Other(s) => s,
        }
    }

    /// Goal-like types are pinned into Tier-0.
    pub fn is_pinned(&self) -> bool {
        matches!(self, MemoryType::Goal | MemoryType::Okr)
    }
}

impl From<String> for MemoryType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "TextMemoryItem" | "text" => MemoryType::TextMemoryItem,
            "DocumentMemoryItem" | "document" => MemoryType::DocumentMemoryItem,
            "goal" | "Goal" => MemoryType::Goal,
            "okr" | "OKR" | "Okr" => MemoryType::Okr,
            _ => MemoryType::Other(s),
        }
    }
}

impl From<MemoryType> for String {
    fn from(t: MemoryType) -> Self {
        match t {
            MemoryType::Other(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

/// Read/write grant for one ACL principal (`user:…`, `workspace:…`, …).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AclGrant {
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub write: bool,
}

/// The unit of storage and retrieval.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,

    /// Owner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_user_id: Option<String>,

    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "type", default)]
    pub memory_type: MemoryType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub acl: BTreeMap<String, AclGrant>,

    /// Full-precision embedding, when sync requested float32.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// INT8-quantized embedding; `q` maps to `q / 127`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_int8: Option<Vec<i8>>,

    /// Server-side relevance, carried into hybrid ranking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relevance_score: Option<f32>,
}

impl Memory {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_type(mut self, memory_type: MemoryType) -> Self {
        self.memory_type = memory_type;
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_embedding_int8(mut self, embedding: Vec<i8>) -> Self {
        self.embedding_int8 = Some(embedding);
        self
    }

    pub fn with_relevance(mut self, score: f32) -> Self {
        self.relevance_score = Some(score);
        self
    }

    pub fn with_updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = Some(at);
        self
    }

    /// Resolve a server-provided embedding, dequantizing INT8 if needed.
    ///
    /// Float32 wins when both are present.
    pub fn server_embedding(&self) -> Option<Vec<f32>> {
        if let Some(v) = &self.embedding {
            return Some(v.clone());
        }
        self.embedding_int8.as_deref().map(dequantize_int8)
    }

    /// Copy without embedding payloads, for storing as record metadata.
    pub fn without_embeddings(&self) -> Self {
        Self {
            embedding: None,
            embedding_int8: None,
            ..self.clone()
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, PaprError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PaprError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Symmetric INT8 dequantization: `q / 127`.
pub fn dequantize_int8(values: &[i8]) -> Vec<f32> {
    values.iter().map(|&q| q as f32 / 127.0).collect()
}

/// One of the two local partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "TierRepr")]
pub enum Tier {
    /// Pinned goal/OKR items
    Tier0,
    /// Hot working set
    Tier1,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TierRepr {
    Num(u8),
    Text(String),
}

impl TryFrom<TierRepr> for Tier {
    type Error = String;

    fn try_from(repr: TierRepr) -> Result<Self, Self::Error> {
        match repr {
            TierRepr::Num(0) => Ok(Tier::Tier0),
            TierRepr::Num(1) => Ok(Tier::Tier1),
            TierRepr::Num(n) => Err(format!("unknown tier {}", n)),
            TierRepr::Text(s) => s.parse(),
        }
    }
}

impl Tier {
    pub const ALL: [Tier; 2] = [Tier::Tier0, Tier::Tier1];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Tier0 => "tier0",
            Tier::Tier1 => "tier1",
        }
    }

    /// Placement for items that arrive without an explicit tier.
    pub fn for_memory_type(memory_type: &MemoryType) -> Tier {
        if memory_type.is_pinned() {
            Tier::Tier0
        } else {
            Tier::Tier1
        }
    }

    pub fn other(&self) -> Tier {
        match self {
            Tier::Tier0 => Tier::Tier1,
            Tier::Tier1 => Tier::Tier0,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tier0" | "0" => Ok(Tier::Tier0),
            "tier1" | "1" => Ok(Tier::Tier1),
            other => Err(format!("unknown tier '{}'", other)),
        }
    }
}

/// Which path answered a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    Local,
    Remote,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Local => "local",
            Route::Remote => "remote",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire format the server uses for precomputed embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum EmbeddingFormat {
    #[default]
    Float32,
    Int8,
}

impl EmbeddingFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingFormat::Float32 => "float32",
            EmbeddingFormat::Int8 => "int8",
        }
    }
}

impl FromStr for EmbeddingFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "float32" | "f32" => Ok(EmbeddingFormat::Float32),
            "int8" | "i8" => Ok(EmbeddingFormat::Int8),
            other => Err(format!("unknown embedding format '{}'", other)),
        }
    }
}

impl TryFrom<String> for EmbeddingFormat {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dequantize_int8() {
        let v = dequantize_int8(&[127, -127, 0, 64]);
        assert!((v[0] - 1.0).abs() < 1e-6);
        assert!((v[1] + 1.0).abs() < 1e-6);
        assert_eq!(v[2], 0.0);
        assert!((v[3] - 64.0 / 127.0).abs() < 1e-6);
    }

    #[test]
    fn test_server_embedding_prefers_float32() {
        let m = Memory::new("m1", "x")
            .with_embedding(vec![0.5, 0.5])
            .with_embedding_int8(vec![127, 127]);
        assert_eq!(m.server_embedding(), Some(vec![0.5, 0.5]));

        let m = Memory::new("m2", "x").with_embedding_int8(vec![127, 0]);
        assert_eq!(m.server_embedding(), Some(vec![1.0, 0.0]));

        assert_eq!(Memory::new("m3", "x").server_embedding(), None);
    }

    #[test]
    fn test_memory_decodes_server_shape() {
        let json = r#"{
            "id": "m1",
            "user_id": "u1",
            "content": "buy milk",
            "type": "okr",
            "topics": ["errands"],
            "acl": {"user:u1": {"read": true, "write": true}},
            "updated_at": "2024-05-01T10:00:00Z",
            "relevance_score": 0.8,
            "unknown_field": 42
        }"#;
        let m: Memory = serde_json::from_str(json).unwrap();
        assert_eq!(m.memory_type, MemoryType::Okr);
        assert!(m.memory_type.is_pinned());
        assert_eq!(m.acl["user:u1"], AclGrant { read: true, write: true });
        assert_eq!(m.relevance_score, Some(0.8));
        assert!(m.updated_at.is_some());
    }

    #[test]
    fn test_unknown_memory_type_is_preserved() {
        let m: Memory = serde_json::from_str(r#"{"id":"x","type":"meeting_note"}"#).unwrap();
        assert_eq!(m.memory_type, MemoryType::Other("meeting_note".to_string()));
        let back = serde_json::to_value(&m).unwrap();
        assert_eq!(back["type"], "meeting_note");
    }

    #[test]
    fn test_without_embeddings() {
        let m = Memory::new("m1", "x").with_embedding(vec![1.0]);
        let stripped = m.without_embeddings();
        assert!(stripped.embedding.is_none());
        assert_eq!(stripped.content, "x");
        let bytes = stripped.to_bytes().unwrap();
        assert_eq!(Memory::from_bytes(&bytes).unwrap(), stripped);
    }

    #[test]
    fn test_tier_accepts_number_and_name() {
        assert_eq!(serde_json::from_str::<Tier>("0").unwrap(), Tier::Tier0);
        assert_eq!(serde_json::from_str::<Tier>("1").unwrap(), Tier::Tier1);
        assert_eq!(serde_json::from_str::<Tier>(r#""tier1""#).unwrap(), Tier::Tier1);
        assert!(serde_json::from_str::<Tier>("2").is_err());
        assert_eq!(serde_json::to_string(&Tier::Tier0).unwrap(), r#""tier0""#);
    }

    #[test]
    fn test_tier_placement_by_type() {
        assert_eq!(Tier::for_memory_type(&MemoryType::Goal), Tier::Tier0);
        assert_eq!(Tier::for_memory_type(&MemoryType::TextMemoryItem), Tier::Tier1);
        assert_eq!(Tier::Tier0.other(), Tier::Tier1);
    }

    #[test]
    fn test_embedding_format_parse() {
        assert_eq!("INT8".parse::<EmbeddingFormat>().unwrap(), EmbeddingFormat::Int8);
        assert_eq!(
            serde_json::from_str::<EmbeddingFormat>(r#""float32""#).unwrap(),
            EmbeddingFormat::Float32
        );
        assert!("bf16".parse::<EmbeddingFormat>().is_err());
    }
}
