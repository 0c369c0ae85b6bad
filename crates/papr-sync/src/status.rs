//! Observable sync state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where the coordinator is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    #[default]
    Idle,
    Syncing,
    Ready,
    /// Retries exhausted; searches route remote until the next good cycle
    Degraded,
}

/// Snapshot of the coordinator, shared through a `watch` channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub initial_sync_complete: bool,
    pub last_error: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
    /// Records across both tiers after the last cycle
    pub memories_indexed: usize,
    /// Memories kept remote-only because no embedding was available
    pub remote_only: usize,
}

impl SyncStatus {
    pub fn is_degraded(&self) -> bool {
        self.phase == SyncPhase::Degraded
    }
}
