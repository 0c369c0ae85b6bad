//! # papr-types
//!
//! Shared domain types for the Papr on-device retrieval core.
//!
//! This crate defines the data structures every other crate agrees on:
//! - Memories: the unit of storage and retrieval, with optional embeddings
//! - Tiers: the two local partitions (pinned goals vs. hot working set)
//! - User context: the identity a cache is scoped to, plus its version
//! - Settings: layered configuration (defaults, file, `PAPR_*` environment)
//!
//! ## Usage
//!
//! ```rust
//! use papr_types::{Memory, MemoryType, Tier};
//!
//! let memory = Memory::new("m1", "ship the Q3 OKR").with_type(MemoryType::Okr);
//! assert_eq!(Tier::for_memory_type(&memory.memory_type), Tier::Tier0);
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod flags;
pub mod memory;

pub use config::{ComputePreference, Settings, DEFAULT_BASE_URL};
pub use context::UserContext;
pub use error::{ErrorKind, PaprError};
pub use flags::parse_flag;
pub use memory::{
    dequantize_int8, AclGrant, EmbeddingFormat, Memory, MemoryType, Route, Tier,
    DEFAULT_EMBEDDING_DIM,
};
