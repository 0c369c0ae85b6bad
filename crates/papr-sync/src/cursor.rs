//! Delta-sync cursor persisted beside the user's vector store.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::SyncError;

pub const CURSOR_FILE: &str = "sync_cursor.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub cursor: String,
    /// Context version the cursor was committed under
    pub context_version: u64,
    pub committed_at: DateTime<Utc>,
}

impl SyncCursor {
    pub fn new(cursor: impl Into<String>, context_version: u64) -> Self {
        Self {
            cursor: cursor.into(),
            context_version,
            committed_at: Utc::now(),
        }
    }
}

pub fn cursor_path(store_root: &Path) -> PathBuf {
    store_root.join(CURSOR_FILE)
}

/// Read the cursor. Missing or unreadable files yield `None`.
pub fn load_cursor(store_root: &Path) -> Option<SyncCursor> {
    let path = cursor_path(store_root);
    let bytes = std::fs::read(&path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(cursor) => Some(cursor),
        Err(e) => {
            warn!(path = ?path, error = %e, "Ignoring unreadable sync cursor");
            None
        }
    }
}

/// Write the cursor atomically (temp file + rename).
pub fn save_cursor(store_root: &Path, cursor: &SyncCursor) -> Result<(), SyncError> {
    let path = cursor_path(store_root);
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(cursor)?)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

pub fn clear_cursor(store_root: &Path) -> Result<(), SyncError> {
    match std::fs::remove_file(cursor_path(store_root)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
