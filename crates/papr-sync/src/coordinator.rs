//! Sync coordinator: the single writer of the local tier collections.
//!
//! A cycle fetches a snapshot (or delta pages), resolves an embedding per
//! memory, and upserts it into its tier stamped with the user context
//! version. Embeddings come from the server (float32 or INT8) or, when an
//! embedder is attached, are computed locally; otherwise the memory stays
//! remote-only.
//!
//! Cycles for the same user are serialized. A cycle whose context version
//! is no longer current stops before its next write. Delta cycles start
//! from the cursor committed under the current context version; without
//! one they run a full snapshot instead.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use papr_embeddings::TextEmbedder;
use papr_types::{EmbeddingFormat, Memory, Settings, Tier, UserContext};
use papr_vector::{UpsertOutcome, VectorError, VectorStore};

use crate::api::{ApiScope, MemoryApi, SyncDeltaRequest, SyncTiersRequest};
use crate::cursor::{clear_cursor, load_cursor, save_cursor, SyncCursor};
use crate::error::SyncError;
use crate::metadata::{is_older_than_stored, memory_metadata};
use crate::retry::{retry_transient, RetryFailure, RetryPolicy};
use crate::status::{SyncPhase, SyncStatus};

/// Upper bound on delta pages fetched in one cycle.
pub const MAX_DELTA_PAGES: usize = 1000;

/// What a cycle asks the server for.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub include_embeddings: bool,
    pub embedding_format: EmbeddingFormat,
    pub embed_limit: usize,
    pub embed_model: String,
    pub max_tier0: usize,
    pub max_tier1: usize,
    /// Per-cycle deadline
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            include_embeddings: true,
            embedding_format: EmbeddingFormat::Float32,
            embed_limit: 200,
            embed_model: "Qwen4B".to_string(),
            max_tier0: 100,
            max_tier1: 500,
            timeout: Duration::from_secs(180),
            retry: RetryPolicy::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            include_embeddings: settings.include_server_embeddings,
            embedding_format: settings.embedding_format,
            embed_limit: settings.embed_limit,
            embed_model: settings.embed_model.clone(),
            max_tier0: settings.max_tier0,
            max_tier1: settings.max_tier1,
            timeout: settings.sync_timeout(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Per-tier counts for one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierReport {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Incoming copy older than the stored one
    pub skipped_older: usize,
    pub deleted: usize,
}

impl TierReport {
    pub fn writes(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}

/// Outcome of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub tier0: TierReport,
    pub tier1: TierReport,
    /// No embedding available; left for the remote path
    pub remote_only: usize,
    /// Vector of the wrong dimension or with non-finite values
    pub rejected: usize,
    /// Delta pages consumed (0 for a full snapshot)
    pub pages: usize,
}

impl SyncReport {
    pub fn tier(&self, tier: Tier) -> &TierReport {
        match tier {
            Tier::Tier0 => &self.tier0,
            Tier::Tier1 => &self.tier1,
        }
    }

    fn tier_mut(&mut self, tier: Tier) -> &mut TierReport {
        match tier {
            Tier::Tier0 => &mut self.tier0,
            Tier::Tier1 => &mut self.tier1,
        }
    }

    /// Total effective writes across both tiers.
    pub fn writes(&self) -> usize {
        self.tier0.writes() + self.tier1.writes()
    }
}

pub struct SyncCoordinator {
    api: Arc<dyn MemoryApi>,
    embedder: RwLock<Option<Arc<dyn TextEmbedder>>>,
    config: SyncConfig,
    context: watch::Receiver<UserContext>,
    status: watch::Sender<SyncStatus>,
    user_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SyncCoordinator {
    /// `context` tracks the live user context; cycles check it for staleness.
    pub fn new(
        api: Arc<dyn MemoryApi>,
        config: SyncConfig,
        context: watch::Receiver<UserContext>,
    ) -> Self {
        let (status, _) = watch::channel(SyncStatus::default());
        Self {
            api,
            embedder: RwLock::new(None),
            config,
            context,
            status,
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_embedder(self, embedder: Arc<dyn TextEmbedder>) -> Self {
        self.set_embedder(Some(embedder));
        self
    }

    /// Attach (or detach) the embedder used for memories without server embeddings.
    pub fn set_embedder(&self, embedder: Option<Arc<dyn TextEmbedder>>) {
        match self.embedder.write() {
            Ok(mut slot) => *slot = embedder,
            Err(poisoned) => *poisoned.into_inner() = embedder,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Forget progress, e.g. after a context switch.
    pub fn reset(&self) {
        self.status.send_replace(SyncStatus::default());
    }

    /// Incremental cycle once the initial snapshot landed, full otherwise.
    pub async fn sync(
        &self,
        store: &VectorStore,
        context: &UserContext,
    ) -> Result<SyncReport, SyncError> {
        if self.status.borrow().initial_sync_complete {
            self.sync_delta(store, context).await
        } else {
            self.sync_tiers(store, context).await
        }
    }

    /// Full snapshot of both tiers. Local ids absent from the snapshot are deleted.
    pub async fn sync_tiers(
        &self,
        store: &VectorStore,
        context: &UserContext,
    ) -> Result<SyncReport, SyncError> {
        self.run_cycle(store, context, self.full_cycle(store, context))
            .await
    }

    /// Pages of changes since the stored cursor.
    pub async fn sync_delta(
        &self,
        store: &VectorStore,
        context: &UserContext,
    ) -> Result<SyncReport, SyncError> {
        self.run_cycle(store, context, self.delta_cycle(store, context))
            .await
    }

    async fn run_cycle<F>(
        &self,
        store: &VectorStore,
        context: &UserContext,
        cycle: F,
    ) -> Result<SyncReport, SyncError>
    where
        F: Future<Output = Result<SyncReport, SyncError>>,
    {
        let key = context.user_key().ok_or(SyncError::NoContext)?;
        let lock = self.user_lock(&key);
        let _guard = lock.lock().await;

        self.ensure_current(context)?;
        self.status.send_modify(|s| s.phase = SyncPhase::Syncing);

        let result = match tokio::time::timeout(self.config.timeout, cycle).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout),
        };
        let result = result.and_then(|report| {
            store.flush()?;
            store.stamp_version(context.version)?;
            Ok(report)
        });

        match &result {
            Ok(report) => {
                let indexed = store.count(Tier::Tier0) + store.count(Tier::Tier1);
                info!(
                    user = %key,
                    version = context.version,
                    writes = report.writes(),
                    indexed,
                    remote_only = report.remote_only,
                    "Sync complete"
                );
                let remote_only = report.remote_only;
                self.status.send_modify(|s| {
                    s.phase = SyncPhase::Ready;
                    s.initial_sync_complete = true;
                    s.last_error = None;
                    s.last_success_at = Some(Utc::now());
                    s.memories_indexed = indexed;
                    s.remote_only = remote_only;
                });
            }
            Err(SyncError::StaleContext { expected, current }) => {
                info!(user = %key, expected, current, "Sync aborted, context changed");
                self.status.send_modify(|s| s.phase = SyncPhase::Idle);
            }
            Err(e) => {
                warn!(user = %key, error = %e, "Sync failed, marking degraded");
                let message = e.to_string();
                self.status.send_modify(|s| {
                    s.phase = SyncPhase::Degraded;
                    s.last_error = Some(message);
                });
            }
        }
        result
    }

    async fn full_cycle(
        &self,
        store: &VectorStore,
        context: &UserContext,
    ) -> Result<SyncReport, SyncError> {
        let request = SyncTiersRequest {
            include_embeddings: self.config.include_embeddings,
            embedding_format: self.config.embedding_format,
            embed_limit: self.config.embed_limit,
            embed_model: self.config.embed_model.clone(),
            max_tier0: self.config.max_tier0,
            max_tier1: self.config.max_tier1,
            scope: ApiScope::from(context),
        };
        let snapshot = retry_transient(&self.config.retry, "sync_tiers", || {
            self.api.sync_tiers(&request)
        })
        .await
        .map_err(degraded)?;
        self.ensure_current(context)?;
        debug!(
            tier0 = snapshot.tier0.len(),
            tier1 = snapshot.tier1.len(),
            "Fetched tier snapshot"
        );

        let mut report = SyncReport::default();
        for tier in Tier::ALL {
            for memory in snapshot.tier(tier) {
                self.place(store, tier, memory, context, &mut report).await?;
            }
        }

        for tier in Tier::ALL {
            let keep: HashSet<&str> = snapshot.tier(tier).iter().map(|m| m.id.as_str()).collect();
            let stale: Vec<String> = store
                .ids(tier)?
                .into_iter()
                .filter(|id| !keep.contains(id.as_str()))
                .collect();
            if !stale.is_empty() {
                self.ensure_current(context)?;
                let deleted = store.delete(tier, &stale)?;
                report.tier_mut(tier).deleted += deleted;
                debug!(tier = %tier, deleted, "Removed memories missing from snapshot");
            }
        }

        match &snapshot.cursor {
            Some(cursor) => {
                save_cursor(store.root(), &SyncCursor::new(cursor.clone(), context.version))?
            }
            None => clear_cursor(store.root())?,
        }
        Ok(report)
    }

    async fn delta_cycle(
        &self,
        store: &VectorStore,
        context: &UserContext,
    ) -> Result<SyncReport, SyncError> {
        let Some(start) = load_cursor(store.root())
            .filter(|c| c.context_version == context.version)
            .map(|c| c.cursor)
        else {
            info!(version = context.version, "No delta cursor for this context, running full sync");
            return self.full_cycle(store, context).await;
        };
        let mut cursor = Some(start);
        let mut report = SyncReport::default();

        loop {
            let request = SyncDeltaRequest {
                cursor: cursor.clone(),
                include_embeddings: self.config.include_embeddings,
                embedding_format: self.config.embedding_format,
                scope: ApiScope::from(context),
            };
            let page = retry_transient(&self.config.retry, "sync_delta", || {
                self.api.sync_delta(&request)
            })
            .await
            .map_err(degraded)?;
            self.ensure_current(context)?;
            report.pages += 1;

            for item in &page.upserts {
                self.place(store, item.resolved_tier(), &item.memory, context, &mut report)
                    .await?;
            }
            if !page.deletes.is_empty() {
                self.ensure_current(context)?;
                for tier in Tier::ALL {
                    let deleted = store.delete(tier, &page.deletes)?;
                    report.tier_mut(tier).deleted += deleted;
                }
            }
            if let Some(next) = &page.next_cursor {
                save_cursor(store.root(), &SyncCursor::new(next.clone(), context.version))?;
                cursor = Some(next.clone());
            }

            if !page.has_more {
                break;
            }
            if page.next_cursor.is_none() {
                warn!("Delta page has more data but no cursor, stopping");
                break;
            }
            if report.pages >= MAX_DELTA_PAGES {
                warn!(pages = report.pages, "Delta page limit reached");
                break;
            }
        }
        Ok(report)
    }

    /// Upsert one memory into `tier`, removing it from the other tier.
    async fn place(
        &self,
        store: &VectorStore,
        tier: Tier,
        memory: &Memory,
        context: &UserContext,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        if let Some(existing) = store.get(tier, &memory.id)? {
            if is_older_than_stored(memory, &existing.metadata) {
                debug!(id = %memory.id, tier = %tier, "Skipping older copy");
                report.tier_mut(tier).skipped_older += 1;
                return Ok(());
            }
        }

        let Some(vector) = self.resolve_vector(memory).await else {
            report.remote_only += 1;
            return Ok(());
        };
        if vector.len() != store.dimension() {
            warn!(
                id = %memory.id,
                expected = store.dimension(),
                actual = vector.len(),
                "Rejecting memory with wrong embedding dimension"
            );
            report.rejected += 1;
            return Ok(());
        }

        self.ensure_current(context)?;
        let other = tier.other();
        if store.get(other, &memory.id)?.is_some() {
            let deleted = store.delete(other, std::slice::from_ref(&memory.id))?;
            report.tier_mut(other).deleted += deleted;
        }

        let metadata = memory_metadata(memory, tier, context.version)?;
        match store.upsert(tier, &memory.id, &vector, metadata, &memory.content) {
            Ok(UpsertOutcome::Inserted) => report.tier_mut(tier).inserted += 1,
            Ok(UpsertOutcome::Updated) => report.tier_mut(tier).updated += 1,
            Ok(UpsertOutcome::Unchanged) => report.tier_mut(tier).unchanged += 1,
            Err(VectorError::InvalidVector(id)) => {
                warn!(id = %id, "Rejecting memory with non-finite embedding");
                report.rejected += 1;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn resolve_vector(&self, memory: &Memory) -> Option<Vec<f32>> {
        if let Some(vector) = memory.server_embedding() {
            return Some(vector);
        }
        let embedder = self.embedder()?;
        match embedder.embed(&memory.content).await {
            Ok(query) => Some(query.embedding.values),
            Err(e) => {
                warn!(id = %memory.id, error = %e, "Local embedding failed, keeping remote-only");
                None
            }
        }
    }

    fn embedder(&self) -> Option<Arc<dyn TextEmbedder>> {
        match self.embedder.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn ensure_current(&self, context: &UserContext) -> Result<(), SyncError> {
        let current = self.context.borrow().version;
        if current != context.version {
            return Err(SyncError::StaleContext {
                expected: context.version,
                current,
            });
        }
        Ok(())
    }

    fn user_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.user_locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(key.to_string()).or_default().clone()
    }
}

fn degraded(failure: RetryFailure) -> SyncError {
    if failure.error.is_transient() {
        SyncError::Degraded {
            attempts: failure.attempts,
            source: failure.error,
        }
    } else {
        SyncError::Api(failure.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{DeltaItem, DeltaPage};
    use crate::cursor::CURSOR_FILE;
    use crate::error::ApiError;
    use crate::mock::MockMemoryApi;
    use chrono::Duration as ChronoDuration;
    use papr_embeddings::MockEmbedder;
    use papr_types::MemoryType;
    use papr_vector::{MetadataFilter, StoreConfig, VERSION_KEY};
    use serde_json::json;
    use tempfile::TempDir;

    const DIM: usize = 4;

    struct Harness {
        _temp: TempDir,
        store: VectorStore,
        context: UserContext,
        context_tx: watch::Sender<UserContext>,
    }

    fn harness() -> Harness {
        let temp = TempDir::new().unwrap();
        let context = UserContext {
            user_id: Some("u1".into()),
            ..Default::default()
        };
        let store = VectorStore::open(
            &StoreConfig::new(temp.path(), DIM),
            &context.user_key().unwrap(),
            context.version,
        )
        .unwrap();
        let (context_tx, _) = watch::channel(context.clone());
        Harness {
            _temp: temp,
            store,
            context,
            context_tx,
        }
    }

    fn coordinator(h: &Harness, api: Arc<MockMemoryApi>) -> SyncCoordinator {
        SyncCoordinator::new(api, SyncConfig::default(), h.context_tx.subscribe())
    }

    fn goal(id: &str, vector: Vec<f32>) -> Memory {
        Memory::new(id, format!("goal {}", id))
            .with_type(MemoryType::Goal)
            .with_embedding(vector)
    }

    fn note(id: &str, vector: Vec<f32>) -> Memory {
        Memory::new(id, format!("note {}", id)).with_embedding(vector)
    }

    #[tokio::test]
    async fn test_full_sync_places_tiers() {
        let h = harness();
        let api = Arc::new(MockMemoryApi::new().with_tiers(
            vec![goal("g1", vec![1.0, 0.0, 0.0, 0.0])],
            vec![note("h1", vec![0.0, 1.0, 0.0, 0.0]), note("h2", vec![0.0, 0.0, 1.0, 0.0])],
        ));
        let sync = coordinator(&h, api.clone());

        let report = sync.sync_tiers(&h.store, &h.context).await.unwrap();
        assert_eq!(report.tier0.inserted, 1);
        assert_eq!(report.tier1.inserted, 2);
        assert_eq!(h.store.count(Tier::Tier0), 1);
        assert_eq!(h.store.count(Tier::Tier1), 2);

        let record = h.store.get(Tier::Tier0, "g1").unwrap().unwrap();
        assert_eq!(record.metadata[VERSION_KEY], json!(0));
        assert_eq!(record.document, "goal g1");

        let status = sync.status();
        assert_eq!(status.phase, SyncPhase::Ready);
        assert!(status.initial_sync_complete);
        assert_eq!(status.memories_indexed, 3);
        assert!(status.last_success_at.is_some());
    }

    #[tokio::test]
    async fn test_int8_embedding_is_dequantized() {
        let h = harness();
        let memory = Memory::new("q1", "quantized").with_embedding_int8(vec![127, -127, 0, 64]);
        let api = Arc::new(MockMemoryApi::new().with_tiers(vec![], vec![memory]));
        let sync = coordinator(&h, api);

        sync.sync_tiers(&h.store, &h.context).await.unwrap();

        let record = h.store.get(Tier::Tier1, "q1").unwrap().unwrap();
        let expected = [1.0, -1.0, 0.0, 64.0 / 127.0];
        for (got, want) in record.vector.iter().zip(expected) {
            assert!((got - want).abs() < 1e-6);
        }
        assert!(!record.metadata.contains_key("embedding_int8"));
    }

    #[tokio::test]
    async fn test_repeated_sync_writes_nothing() {
        let h = harness();
        let api = Arc::new(MockMemoryApi::new().with_tiers(
            vec![goal("g1", vec![1.0, 0.0, 0.0, 0.0])],
            vec![note("h1", vec![0.0, 1.0, 0.0, 0.0])],
        ));
        let sync = coordinator(&h, api);

        sync.sync_tiers(&h.store, &h.context).await.unwrap();
        let log_len = h.store.upsert_log(Tier::Tier0, 0).unwrap().len()
            + h.store.upsert_log(Tier::Tier1, 0).unwrap().len();

        let again = sync.sync_tiers(&h.store, &h.context).await.unwrap();
        assert_eq!(again.writes(), 0);
        assert_eq!(again.tier0.unchanged, 1);
        assert_eq!(again.tier1.unchanged, 1);
        let log_after = h.store.upsert_log(Tier::Tier0, 0).unwrap().len()
            + h.store.upsert_log(Tier::Tier1, 0).unwrap().len();
        assert_eq!(log_len, log_after);
    }

    #[tokio::test]
    async fn test_full_sync_deletes_missing_ids() {
        let h = harness();
        let api = Arc::new(MockMemoryApi::new().with_tiers(
            vec![],
            vec![note("h1", vec![0.0, 1.0, 0.0, 0.0]), note("h2", vec![0.0, 0.0, 1.0, 0.0])],
        ));
        let sync = coordinator(&h, api.clone());
        sync.sync_tiers(&h.store, &h.context).await.unwrap();

        api.set_tiers(vec![], vec![note("h2", vec![0.0, 0.0, 1.0, 0.0])]);
        let report = sync.sync_tiers(&h.store, &h.context).await.unwrap();

        assert_eq!(report.tier1.deleted, 1);
        assert_eq!(h.store.ids(Tier::Tier1).unwrap(), vec!["h2".to_string()]);

        let status = sync.status();
        assert_eq!(status.phase, SyncPhase::Ready);
        assert_eq!(status.memories_indexed, 1);
    }

    #[tokio::test]
    async fn test_tier_move_removes_from_other_tier() {
        let h = harness();
        let api = Arc::new(
            MockMemoryApi::new().with_tiers(vec![], vec![note("m1", vec![1.0, 1.0, 0.0, 0.0])]),
        );
        let sync = coordinator(&h, api.clone());
        sync.sync_tiers(&h.store, &h.context).await.unwrap();

        api.set_tiers(vec![goal("m1", vec![1.0, 1.0, 0.0, 0.0])], vec![]);
        sync.sync_tiers(&h.store, &h.context).await.unwrap();

        assert!(h.store.get(Tier::Tier0, "m1").unwrap().is_some());
        assert!(h.store.get(Tier::Tier1, "m1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_older_copy_is_skipped() {
        let h = harness();
        let now = Utc::now();
        let fresh = note("m1", vec![1.0, 0.0, 0.0, 0.0]).with_updated_at(now);
        let api = Arc::new(MockMemoryApi::new().with_tiers(vec![], vec![fresh]));
        let sync = coordinator(&h, api.clone());
        sync.sync_tiers(&h.store, &h.context).await.unwrap();

        let mut old = note("m1", vec![0.0, 1.0, 0.0, 0.0])
            .with_updated_at(now - ChronoDuration::seconds(60));
        old.content = "outdated".into();
        api.set_tiers(vec![], vec![old]);
        let report = sync.sync_tiers(&h.store, &h.context).await.unwrap();

        assert_eq!(report.tier1.skipped_older, 1);
        let record = h.store.get(Tier::Tier1, "m1").unwrap().unwrap();
        assert_eq!(record.vector, vec![1.0, 0.0, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn test_missing_embedding_without_embedder_is_remote_only() {
        let h = harness();
        let api = Arc::new(
            MockMemoryApi::new().with_tiers(vec![], vec![Memory::new("plain", "no vector")]),
        );
        let sync = coordinator(&h, api);

        let report = sync.sync_tiers(&h.store, &h.context).await.unwrap();
        assert_eq!(report.remote_only, 1);
        assert_eq!(h.store.count(Tier::Tier1), 0);
        assert_eq!(sync.status().remote_only, 1);
    }

    #[tokio::test]
    async fn test_missing_embedding_computed_locally() {
        let h = harness();
        let api = Arc::new(
            MockMemoryApi::new().with_tiers(vec![], vec![Memory::new("plain", "buy milk")]),
        );
        let embedder = Arc::new(MockEmbedder::new(DIM).with_vector("buy milk", vec![0.5; DIM]));
        let sync = coordinator(&h, api).with_embedder(embedder.clone());

        let report = sync.sync_tiers(&h.store, &h.context).await.unwrap();
        assert_eq!(report.remote_only, 0);
        assert_eq!(embedder.call_count(), 1);
        let record = h.store.get(Tier::Tier1, "plain").unwrap().unwrap();
        assert_eq!(record.vector, vec![0.5; DIM]);
    }

    #[tokio::test]
    async fn test_wrong_dimension_rejected() {
        let h = harness();
        let api = Arc::new(MockMemoryApi::new().with_tiers(
            vec![],
            vec![note("bad", vec![1.0, 0.0]), note("nan", vec![f32::NAN, 0.0, 0.0, 0.0])],
        ));
        let sync = coordinator(&h, api);

        let report = sync.sync_tiers(&h.store, &h.context).await.unwrap();
        assert_eq!(report.rejected, 2);
        assert_eq!(h.store.count(Tier::Tier1), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_then_success() {
        let h = harness();
        let api = Arc::new(
            MockMemoryApi::new().with_tiers(vec![], vec![note("h1", vec![0.0, 1.0, 0.0, 0.0])]),
        );
        api.push_failure(ApiError::Network("reset".into()));
        api.push_failure(ApiError::Http {
            status: 502,
            message: "bad gateway".into(),
        });
        let sync = coordinator(&h, api.clone());

        sync.sync_tiers(&h.store, &h.context).await.unwrap();
        assert_eq!(api.sync_tiers_calls(), 3);
        assert_eq!(sync.status().phase, SyncPhase::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_degrade_without_wiping() {
        let h = harness();
        let seed = Arc::new(
            MockMemoryApi::new().with_tiers(vec![], vec![note("h1", vec![0.0, 1.0, 0.0, 0.0])]),
        );
        coordinator(&h, seed)
            .sync_tiers(&h.store, &h.context)
            .await
            .unwrap();

        let api = Arc::new(
            MockMemoryApi::new().with_permanent_failure(ApiError::Network("offline".into())),
        );
        let sync = coordinator(&h, api.clone());
        let err = sync.sync_tiers(&h.store, &h.context).await.unwrap_err();

        assert!(matches!(err, SyncError::Degraded { attempts: 5, .. }));
        assert_eq!(api.sync_tiers_calls(), 5);
        let status = sync.status();
        assert!(status.is_degraded());
        assert!(status.last_error.is_some());
        assert_eq!(h.store.count(Tier::Tier1), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_timeout_degrades() {
        let h = harness();
        let api = Arc::new(
            MockMemoryApi::new().with_permanent_failure(ApiError::Network("offline".into())),
        );
        let config = SyncConfig {
            timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let sync = SyncCoordinator::new(api, config, h.context_tx.subscribe());

        let err = sync.sync_tiers(&h.store, &h.context).await.unwrap_err();
        assert!(matches!(err, SyncError::Timeout));
        assert!(sync.status().is_degraded());
    }

    #[tokio::test]
    async fn test_stale_context_aborts_without_writing() {
        let h = harness();
        let api = Arc::new(
            MockMemoryApi::new().with_tiers(vec![], vec![note("h1", vec![0.0, 1.0, 0.0, 0.0])]),
        );
        let sync = coordinator(&h, api);

        h.context_tx.send_modify(|c| c.version += 1);
        let err = sync.sync_tiers(&h.store, &h.context).await.unwrap_err();

        assert!(matches!(
            err,
            SyncError::StaleContext {
                expected: 0,
                current: 1
            }
        ));
        assert!(h.store.is_empty());
        assert_eq!(sync.status().phase, SyncPhase::Idle);
    }

    #[tokio::test]
    async fn test_unset_context_rejected() {
        let h = harness();
        let sync = coordinator(&h, Arc::new(MockMemoryApi::new()));
        let err = sync
            .sync_tiers(&h.store, &UserContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NoContext));
    }

    #[tokio::test]
    async fn test_delta_pages_and_cursor() {
        let h = harness();
        let pages = vec![
            DeltaPage {
                upserts: vec![DeltaItem {
                    tier: None,
                    memory: goal("g1", vec![1.0, 0.0, 0.0, 0.0]),
                }],
                deletes: vec![],
                next_cursor: Some("c1".into()),
                has_more: true,
            },
            DeltaPage {
                upserts: vec![DeltaItem {
                    tier: Some(Tier::Tier1),
                    memory: note("h1", vec![0.0, 1.0, 0.0, 0.0]),
                }],
                deletes: vec!["g1".into()],
                next_cursor: Some("c2".into()),
                has_more: false,
            },
        ];
        let api = Arc::new(MockMemoryApi::new().with_delta_pages(pages));
        let sync = coordinator(&h, api.clone());
        save_cursor(h.store.root(), &SyncCursor::new("c0", h.context.version)).unwrap();

        let report = sync.sync_delta(&h.store, &h.context).await.unwrap();
        assert_eq!(report.pages, 2);
        assert_eq!(report.tier0.inserted, 1);
        assert_eq!(report.tier0.deleted, 1);
        assert_eq!(h.store.ids(Tier::Tier0).unwrap(), Vec::<String>::new());
        assert_eq!(h.store.ids(Tier::Tier1).unwrap(), vec!["h1".to_string()]);
        assert!(h.store.root().join(CURSOR_FILE).exists());

        sync.sync_delta(&h.store, &h.context).await.unwrap();
        assert_eq!(api.last_delta().unwrap().cursor.as_deref(), Some("c2"));
    }

    #[tokio::test]
    async fn test_sync_switches_to_delta_after_initial() {
        let h = harness();
        let api = Arc::new(
            MockMemoryApi::new()
                .with_tiers(vec![], vec![note("h1", vec![0.0, 1.0, 0.0, 0.0])])
                .with_snapshot_cursor("s1"),
        );
        let sync = coordinator(&h, api.clone());

        sync.sync(&h.store, &h.context).await.unwrap();
        sync.sync(&h.store, &h.context).await.unwrap();

        assert_eq!(api.sync_tiers_calls(), 1);
        assert_eq!(api.sync_delta_calls(), 1);
        assert_eq!(api.last_delta().unwrap().cursor.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_delta_without_cursor_runs_full_sync() {
        let h = harness();
        let api = Arc::new(
            MockMemoryApi::new().with_tiers(vec![], vec![note("h1", vec![0.0, 1.0, 0.0, 0.0])]),
        );
        let sync = coordinator(&h, api.clone());

        sync.sync(&h.store, &h.context).await.unwrap();
        assert!(!h.store.root().join(CURSOR_FILE).exists());

        let report = sync.sync(&h.store, &h.context).await.unwrap();
        assert_eq!(api.sync_tiers_calls(), 2);
        assert_eq!(api.sync_delta_calls(), 0);
        assert_eq!(report.tier1.unchanged, 1);
        assert!(sync.status().initial_sync_complete);
    }

    #[tokio::test]
    async fn test_cursor_from_older_context_is_ignored() {
        let h = harness();
        let api = Arc::new(MockMemoryApi::new().with_snapshot_cursor("fresh"));
        let sync = coordinator(&h, api.clone());
        save_cursor(h.store.root(), &SyncCursor::new("old", h.context.version + 1)).unwrap();

        sync.sync_delta(&h.store, &h.context).await.unwrap();

        assert_eq!(api.sync_delta_calls(), 0);
        assert_eq!(api.sync_tiers_calls(), 1);
        assert_eq!(load_cursor(h.store.root()).unwrap().cursor, "fresh");
    }

    #[tokio::test]
    async fn test_records_filterable_by_version() {
        let h = harness();
        let api = Arc::new(
            MockMemoryApi::new().with_tiers(vec![goal("g1", vec![1.0, 0.0, 0.0, 0.0])], vec![]),
        );
        let sync = coordinator(&h, api);
        sync.sync_tiers(&h.store, &h.context).await.unwrap();

        let hits = h
            .store
            .query(Tier::Tier0, &[1.0, 0.0, 0.0, 0.0], 5, &MetadataFilter::version(0))
            .unwrap();
        assert_eq!(hits.len(), 1);
        let stale = h
            .store
            .query(Tier::Tier0, &[1.0, 0.0, 0.0, 0.0], 5, &MetadataFilter::version(1))
            .unwrap();
        assert!(stale.is_empty());
    }
}
