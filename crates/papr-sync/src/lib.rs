//! # papr-sync
//!
//! Keeps the local tier collections aligned with the remote memory service.
//!
//! ## Features
//! - `MemoryApi` trait with a reqwest implementation (API-key header,
//!   bounded concurrency, per-request timeout)
//! - Full snapshot and cursor-based delta sync
//! - Float32, INT8 (`q / 127`) or locally computed embeddings
//! - Newer-wins, skip-unchanged upserts; a memory lives in exactly one tier
//! - Exponential backoff for transient failures, then a degraded state
//! - Observable `SyncStatus` over a `watch` channel

pub mod api;
pub mod coordinator;
pub mod cursor;
pub mod error;
pub mod metadata;
pub mod mock;
pub mod retry;
pub mod status;

pub use api::{
    ApiScope, DeltaItem, DeltaPage, HttpApiConfig, HttpMemoryApi, MemoryApi, RemoteSearchResult,
    SearchRequest, SyncDeltaRequest, SyncTiersRequest, TierSnapshot, MAX_CONCURRENT_REQUESTS,
};
pub use coordinator::{SyncConfig, SyncCoordinator, SyncReport, TierReport, MAX_DELTA_PAGES};
pub use cursor::{clear_cursor, load_cursor, save_cursor, SyncCursor, CURSOR_FILE};
pub use error::{ApiError, SyncError};
pub use metadata::{is_older_than_stored, memory_from_metadata, memory_metadata, TIER_KEY};
pub use mock::MockMemoryApi;
pub use retry::{retry_transient, RetryFailure, RetryPolicy};
pub use status::{SyncPhase, SyncStatus};
