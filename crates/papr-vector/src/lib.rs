//! # papr-vector
//!
//! Two persistent collections, `tier0` and `tier1`, keyed by memory id.
//!
//! ## Features
//! - usearch-powered HNSW index per tier (cosine metric on raw vectors)
//! - RocksDB records as the source of truth; the index self-heals from them
//! - Exact cosine rescoring with oversampling for filtered queries
//! - Conjunctive equality filters over metadata (e.g. `user_context_version`)
//! - Ordered per-tier upsert log
//! - Per-user directory with a manifest guarding dimension and context version

pub mod collection;
pub mod error;
pub mod hnsw;
pub mod record;
pub mod store;

pub use collection::{cosine_distance, TierCollection};
pub use error::VectorError;
pub use hnsw::{HnswConfig, HnswIndex};
pub use record::{
    similarity_from_distance, LogEntry, LogOp, Metadata, MetadataFilter, QueryHit, UpsertOutcome,
    VectorRecord, VERSION_KEY,
};
pub use store::{Manifest, StoreConfig, VectorStore, WipeReason, MANIFEST_FILE};
