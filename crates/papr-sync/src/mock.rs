//! In-memory memory service for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use papr_types::Memory;

use crate::api::{
    DeltaPage, MemoryApi, RemoteSearchResult, SearchRequest, SyncDeltaRequest, SyncTiersRequest,
    TierSnapshot,
};
use crate::error::ApiError;

/// Fake [`MemoryApi`] serving a fixed snapshot and counting calls.
///
/// Queued failures are consumed one per sync call before the snapshot is
/// served; a permanent failure fails every sync call.
#[derive(Default)]
pub struct MockMemoryApi {
    tiers: Mutex<TierSnapshot>,
    delta_pages: Mutex<VecDeque<DeltaPage>>,
    search_result: Mutex<RemoteSearchResult>,
    search_failure: Mutex<Option<ApiError>>,
    search_delay: Option<Duration>,
    sync_failures: Mutex<VecDeque<ApiError>>,
    permanent_failure: Option<ApiError>,
    last_search: Mutex<Option<SearchRequest>>,
    last_delta: Mutex<Option<SyncDeltaRequest>>,
    search_calls: AtomicUsize,
    tiers_calls: AtomicUsize,
    delta_calls: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockMemoryApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tiers(self, tier0: Vec<Memory>, tier1: Vec<Memory>) -> Self {
        self.set_tiers(tier0, tier1);
        self
    }

    pub fn with_search_results(self, memories: Vec<Memory>) -> Self {
        lock(&self.search_result).memories = memories;
        self
    }

    pub fn with_search_delay(mut self, delay: Duration) -> Self {
        self.search_delay = Some(delay);
        self
    }

    pub fn with_delta_pages(self, pages: Vec<DeltaPage>) -> Self {
        lock(&self.delta_pages).extend(pages);
        self
    }

    /// Every sync call fails with `error`.
    pub fn with_permanent_failure(mut self, error: ApiError) -> Self {
        self.permanent_failure = Some(error);
        self
    }

    /// Delta cursor returned with every tier snapshot.
    pub fn with_snapshot_cursor(self, cursor: impl Into<String>) -> Self {
        lock(&self.tiers).cursor = Some(cursor.into());
        self
    }

    pub fn set_tiers(&self, tier0: Vec<Memory>, tier1: Vec<Memory>) {
        let mut tiers = lock(&self.tiers);
        tiers.tier0 = tier0;
        tiers.tier1 = tier1;
    }

    /// Fail the next sync call with `error`.
    pub fn push_failure(&self, error: ApiError) {
        lock(&self.sync_failures).push_back(error);
    }

    pub fn fail_search(&self, error: ApiError) {
        *lock(&self.search_failure) = Some(error);
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    pub fn sync_tiers_calls(&self) -> usize {
        self.tiers_calls.load(Ordering::SeqCst)
    }

    pub fn sync_delta_calls(&self) -> usize {
        self.delta_calls.load(Ordering::SeqCst)
    }

    pub fn last_search(&self) -> Option<SearchRequest> {
        lock(&self.last_search).clone()
    }

    pub fn last_delta(&self) -> Option<SyncDeltaRequest> {
        lock(&self.last_delta).clone()
    }

    fn next_sync_failure(&self) -> Option<ApiError> {
        if let Some(e) = &self.permanent_failure {
            return Some(e.clone());
        }
        lock(&self.sync_failures).pop_front()
    }
}

#[async_trait]
impl MemoryApi for MockMemoryApi {
    async fn search(&self, request: &SearchRequest) -> Result<RemoteSearchResult, ApiError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        *lock(&self.last_search) = Some(request.clone());

        if let Some(delay) = self.search_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(e) = lock(&self.search_failure).clone() {
            return Err(e);
        }

        let mut result = lock(&self.search_result).clone();
        result.memories.truncate(request.max_memories);
        Ok(result)
    }

    async fn sync_tiers(&self, _request: &SyncTiersRequest) -> Result<TierSnapshot, ApiError> {
        self.tiers_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.next_sync_failure() {
            return Err(e);
        }
        Ok(lock(&self.tiers).clone())
    }

    async fn sync_delta(&self, request: &SyncDeltaRequest) -> Result<DeltaPage, ApiError> {
        self.delta_calls.fetch_add(1, Ordering::SeqCst);
        *lock(&self.last_delta) = Some(request.clone());
        if let Some(e) = self.next_sync_failure() {
            return Err(e);
        }
        Ok(lock(&self.delta_pages).pop_front().unwrap_or_default())
    }

    async fn get_memory(&self, id: &str) -> Result<Memory, ApiError> {
        let tiers = lock(&self.tiers);
        tiers
            .tier0
            .iter()
            .chain(tiers.tier1.iter())
            .find(|m| m.id == id)
            .cloned()
            .ok_or_else(|| ApiError::Http {
                status: 404,
                message: format!("memory {} not found", id),
            })
    }
}
