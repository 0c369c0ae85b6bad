//! Public client facade.
//!
//! `PaprClient::builder().build()` returns immediately in `Configuring`; the
//! resource probe, model load and first sync run on a background task. Until
//! the engine and store are ready, searches route remote.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use papr_embeddings::{EmbeddingEngine, EngineConfig, TextEmbedder};
use papr_retrieval::{
    auto_configure, LocalIndex, Orchestrator, ProbeThresholds, ResourceProbe, ResourceSampler,
    RetrievalConfig, SearchEnv, SearchOptions, SearchResponse, TelemetryConfig, TelemetrySink,
    REMOTE_NOT_CONFIGURED,
};
use papr_sync::{
    clear_cursor, HttpApiConfig, HttpMemoryApi, MemoryApi, SyncConfig, SyncCoordinator,
    SyncPhase, SyncReport, SyncStatus,
};
use papr_types::{Memory, Settings, Tier, UserContext};
use papr_vector::{StoreConfig, VectorStore};

use crate::context::{resolve_context, UserContextManager};
use crate::error::ClientError;
use crate::state::InitState;

/// Builder for [`PaprClient`].
///
/// Explicit values override settings, which override `PAPR_*` environment.
#[derive(Default)]
pub struct PaprClientBuilder {
    settings: Option<Settings>,
    config_path: Option<String>,
    api_key: Option<String>,
    base_url: Option<String>,
    user_id: Option<String>,
    external_user_id: Option<String>,
    workspace_id: Option<String>,
    ondevice_processing: Option<bool>,
    data_dir: Option<PathBuf>,
    remote: Option<Arc<dyn MemoryApi>>,
    embedder: Option<Arc<dyn TextEmbedder>>,
    sampler: Option<Box<dyn ResourceSampler>>,
}

impl PaprClientBuilder {
    /// Use these settings instead of loading them.
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn config_path(mut self, path: impl Into<String>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn user_id(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }

    pub fn external_user_id(mut self, id: impl Into<String>) -> Self {
        self.external_user_id = Some(id.into());
        self
    }

    pub fn workspace_id(mut self, id: impl Into<String>) -> Self {
        self.workspace_id = Some(id.into());
        self
    }

    /// Skip the resource probe.
    pub fn ondevice_processing(mut self, enabled: bool) -> Self {
        self.ondevice_processing = Some(enabled);
        self
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Remote memory service; an HTTP client is built from settings otherwise.
    pub fn remote(mut self, api: Arc<dyn MemoryApi>) -> Self {
        self.remote = Some(api);
        self
    }

    /// Already-loaded embedder; the model is loaded from settings otherwise.
    pub fn embedder(mut self, embedder: Arc<dyn TextEmbedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn resource_sampler(mut self, sampler: Box<dyn ResourceSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// Build the client and start background initialization.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Result<PaprClient, ClientError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| ClientError::Task("PaprClient must be built inside a tokio runtime".into()))?;

        let mut settings = match self.settings {
            Some(settings) => settings,
            None => Settings::load(self.config_path.as_deref())?,
        };
        if let Some(key) = self.api_key {
            settings.memory_api_key = Some(key);
        }
        if let Some(url) = self.base_url {
            settings.base_url = url;
        }
        if let Some(enabled) = self.ondevice_processing {
            settings.ondevice_processing = Some(enabled);
        }
        if let Some(dir) = self.data_dir {
            settings.data_dir = dir;
        }
        settings.validate()?;

        let remote = match self.remote {
            Some(api) => Some(api),
            None => match HttpApiConfig::from_settings(&settings).and_then(HttpMemoryApi::new) {
                Ok(api) => {
                    info!(base_url = %api.base_url(), "Remote memory service configured");
                    Some(Arc::new(api) as Arc<dyn MemoryApi>)
                }
                Err(e) => {
                    warn!(error = %e, "Remote memory service disabled");
                    None
                }
            },
        };

        let context = UserContextManager::new(resolve_context(
            &settings,
            self.user_id,
            self.external_user_id,
            self.workspace_id,
        ));

        let sync = remote.as_ref().map(|api| {
            Arc::new(SyncCoordinator::new(
                api.clone(),
                SyncConfig::from_settings(&settings),
                context.subscribe(),
            ))
        });

        let mut orchestrator = Orchestrator::new(RetrievalConfig::from_settings(&settings));
        if let Some(api) = &remote {
            orchestrator = orchestrator.with_remote(api.clone());
        }
        if settings.enable_metrics {
            match TelemetrySink::new(TelemetryConfig::from_settings(&settings)) {
                Ok(sink) => orchestrator = orchestrator.with_telemetry(Arc::new(sink)),
                Err(e) => warn!(error = %e, "Telemetry disabled"),
            }
        }

        let probe = match self.sampler {
            Some(sampler) => ResourceProbe::new(ProbeThresholds::from_settings(&settings), sampler),
            None => ResourceProbe::system(&settings),
        };

        let (state, _) = watch::channel(InitState::Created);
        let shared = Arc::new(Shared {
            store_config: StoreConfig::new(settings.expanded_data_dir(), settings.embedding_dim),
            settings,
            context,
            orchestrator,
            remote,
            sync,
            local: RwLock::new(LocalSlots::default()),
            open_stores: Mutex::new(HashMap::new()),
            local_enabled: AtomicBool::new(false),
            state,
        });

        shared.set_state(InitState::Configuring);
        runtime.spawn(shared.clone().initialize(self.embedder, probe));

        Ok(PaprClient { shared })
    }
}

#[derive(Default)]
struct LocalSlots {
    embedder: Option<Arc<dyn TextEmbedder>>,
    store: Option<Arc<VectorStore>>,
}

struct Shared {
    settings: Settings,
    context: UserContextManager,
    orchestrator: Orchestrator,
    remote: Option<Arc<dyn MemoryApi>>,
    sync: Option<Arc<SyncCoordinator>>,
    store_config: StoreConfig,
    local: RwLock<LocalSlots>,
    /// Stores still referenced somewhere, by user key. RocksDB allows one
    /// open handle per directory, so a live store is reused, never reopened.
    open_stores: Mutex<HashMap<String, Weak<VectorStore>>>,
    local_enabled: AtomicBool,
    state: watch::Sender<InitState>,
}

impl Shared {
    fn set_state(&self, state: InitState) {
        debug!(state = %state, "Client state");
        self.state.send_replace(state);
    }

    async fn initialize(
        self: Arc<Self>,
        preset: Option<Arc<dyn TextEmbedder>>,
        probe: ResourceProbe,
    ) {
        let settings = self.settings.clone();
        let enabled =
            match tokio::task::spawn_blocking(move || auto_configure(&settings, &probe)).await {
                Ok(decision) => decision.enabled,
                Err(e) => {
                    warn!(error = %e, "Resource probe failed, on-device processing disabled");
                    false
                }
            };
        self.local_enabled.store(enabled, Ordering::SeqCst);

        self.set_state(InitState::LoadingModel);
        let embedder = if enabled {
            self.load_embedder(preset).await
        } else {
            None
        };
        if let Some(sync) = &self.sync {
            sync.set_embedder(embedder.clone());
        }

        // Holding the context lock keeps a concurrent switch from racing the open
        {
            let transition = self.context.begin().await;
            let mut slots = self.local.write().await;
            slots.embedder = embedder;
            if enabled && slots.store.is_none() {
                slots.store = self.open_store(transition.previous()).await;
            }
        }

        self.set_state(InitState::Syncing);
        if self.sync.is_some() && self.context.current().is_set() {
            match self.sync_current().await {
                Ok(report) => info!(
                    writes = report.writes(),
                    remote_only = report.remote_only,
                    "Initial sync finished"
                ),
                Err(e) => warn!(error = %e, kind = %e.kind(), "Initial sync failed"),
            }
        }

        self.set_state(InitState::Ready);
        info!(local_enabled = enabled, "Papr client ready");
    }

    async fn load_embedder(
        &self,
        preset: Option<Arc<dyn TextEmbedder>>,
    ) -> Option<Arc<dyn TextEmbedder>> {
        if let Some(embedder) = preset {
            return Some(embedder);
        }
        if !self.settings.enable_coreml {
            info!("Local embedding model disabled");
            return None;
        }

        let config = EngineConfig::from_settings(&self.settings);
        let started = Instant::now();
        match tokio::task::spawn_blocking(move || EmbeddingEngine::load(&config)).await {
            Ok(Ok(engine)) => {
                info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Embedding model loaded"
                );
                Some(Arc::new(engine))
            }
            Ok(Err(e)) => {
                warn!(error = %e, kind = %e.kind(), "Embedding model unavailable, local search disabled");
                None
            }
            Err(e) => {
                warn!(error = %e, "Model load task failed");
                None
            }
        }
    }

    /// Open the store for `context`, or reuse the live handle for that user.
    ///
    /// Callers hold the context lock, so opens never race each other.
    async fn open_store(&self, context: &UserContext) -> Option<Arc<VectorStore>> {
        let key = context.user_key()?;
        let version = context.version;
        let opened = match self.live_store(&key) {
            Some(store) => {
                debug!(user = %key, version, "Reusing open vector store");
                tokio::task::spawn_blocking(move || {
                    store.reset_to_version(version).map(|_| store)
                })
                .await
            }
            None => {
                let config = self.store_config.clone();
                let user_key = key.clone();
                tokio::task::spawn_blocking(move || {
                    VectorStore::open(&config, &user_key, version).map(Arc::new)
                })
                .await
            }
        };
        match opened {
            Ok(Ok(store)) => {
                self.lock_open_stores().insert(key, Arc::downgrade(&store));
                Some(store)
            }
            Ok(Err(e)) => {
                warn!(error = %e, kind = %e.kind(), "Failed to open local store");
                None
            }
            Err(e) => {
                warn!(error = %e, "Store open task failed");
                None
            }
        }
    }

    fn live_store(&self, key: &str) -> Option<Arc<VectorStore>> {
        let mut stores = self.lock_open_stores();
        stores.retain(|_, store| store.strong_count() > 0);
        stores.get(key).and_then(Weak::upgrade)
    }

    fn lock_open_stores(&self) -> MutexGuard<'_, HashMap<String, Weak<VectorStore>>> {
        self.open_stores
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn sync_current(&self) -> Result<SyncReport, ClientError> {
        let sync = self.sync.as_ref().ok_or_else(|| ClientError::RemoteHttp {
            status: None,
            message: REMOTE_NOT_CONFIGURED.to_string(),
        })?;
        let context = self.context.current();
        let store = self
            .local
            .read()
            .await
            .store
            .clone()
            .ok_or_else(|| ClientError::Config("local store is not open".into()))?;
        Ok(sync.sync(&store, &context).await?)
    }

    async fn search_env(&self) -> SearchEnv {
        let slots = self.local.read().await;
        // Read under the slot lock so context and store belong together
        let context = self.context.current();
        let local = match (&slots.embedder, &slots.store) {
            (Some(embedder), Some(store)) => Some(LocalIndex {
                embedder: embedder.clone(),
                store: store.clone(),
            }),
            _ => None,
        };
        let sync = match &self.sync {
            Some(sync) => sync.status(),
            // Without a remote the store is all there is
            None => SyncStatus {
                phase: SyncPhase::Ready,
                initial_sync_complete: true,
                ..Default::default()
            },
        };
        SearchEnv {
            context,
            local,
            sync,
            local_enabled: self.local_enabled.load(Ordering::SeqCst),
        }
    }
}

async fn clear_store(store: Arc<VectorStore>) -> Result<(), ClientError> {
    tokio::task::spawn_blocking(move || -> Result<(), ClientError> {
        store.drop_tier(Tier::Tier0)?;
        store.drop_tier(Tier::Tier1)?;
        clear_cursor(store.root())?;
        Ok(())
    })
    .await
    .map_err(|e| ClientError::Task(e.to_string()))?
}

/// Entry point of the on-device retrieval core.
#[derive(Clone)]
pub struct PaprClient {
    shared: Arc<Shared>,
}

impl PaprClient {
    pub fn builder() -> PaprClientBuilder {
        PaprClientBuilder::default()
    }

    /// Search the user's memories.
    ///
    /// Fails only with [`ClientError::SearchTimeout`] or
    /// [`ClientError::RemoteHttp`]. A context switch during the call yields
    /// an empty response flagged `stale_context`.
    pub async fn search(
        &self,
        query: &str,
        options: SearchOptions,
    ) -> Result<SearchResponse, ClientError> {
        let env = self.shared.search_env().await;
        let captured = env.context.version;

        let response = self
            .shared
            .orchestrator
            .search(query, &options, &env)
            .await?;

        if self.shared.context.version() != captured {
            debug!(
                captured,
                current = self.shared.context.version(),
                "User context changed during search, discarding results"
            );
            return Ok(SearchResponse::stale(response.route));
        }
        Ok(response)
    }

    /// Switch the active identity. Always bumps the context version.
    ///
    /// With `clear_cache`, both tiers are dropped before the new context is
    /// visible. With `resync`, a sync for the new context starts in the
    /// background.
    pub async fn set_user_context(
        &self,
        user_id: Option<String>,
        external_user_id: Option<String>,
        workspace_id: Option<String>,
        resync: bool,
        clear_cache: bool,
    ) -> Result<UserContext, ClientError> {
        let shared = &self.shared;
        let transition = shared.context.begin().await;
        let next = transition.propose(user_id, external_user_id, workspace_id);

        let mut slots = shared.local.write().await;
        if clear_cache {
            if let Some(store) = slots.store.clone() {
                clear_store(store).await?;
                info!("Local cache cleared");
            }
        }

        let same_store =
            slots.store.is_some() && transition.previous().user_key() == next.user_key();
        if !same_store {
            slots.store = None;
            if shared.local_enabled.load(Ordering::SeqCst) && next.is_set() {
                slots.store = shared.open_store(&next).await;
            }
        }
        if let Some(sync) = &shared.sync {
            sync.reset();
        }
        transition.commit(next.clone());
        drop(slots);

        if resync && next.is_set() && shared.sync.is_some() {
            self.spawn_sync();
        }
        Ok(next)
    }

    /// Forget the active identity.
    pub async fn clear_user_context(&self, clear_cache: bool) -> Result<UserContext, ClientError> {
        self.set_user_context(None, None, None, false, clear_cache)
            .await
    }

    /// Run one sync cycle now and wait for it.
    pub async fn sync_now(&self) -> Result<SyncReport, ClientError> {
        self.shared.sync_current().await
    }

    fn spawn_sync(&self) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            match shared.sync_current().await {
                Ok(report) => info!(writes = report.writes(), "Background sync finished"),
                Err(e) => warn!(error = %e, kind = %e.kind(), "Background sync failed"),
            }
        });
    }

    /// Fetch one memory from the remote service.
    pub async fn get_memory(&self, id: &str) -> Result<Memory, ClientError> {
        let api = self
            .shared
            .remote
            .as_ref()
            .ok_or_else(|| ClientError::RemoteHttp {
                status: None,
                message: REMOTE_NOT_CONFIGURED.to_string(),
            })?;
        Ok(api.get_memory(id).await?)
    }

    pub fn init_state(&self) -> InitState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<InitState> {
        self.shared.state.subscribe()
    }

    /// Wait for background initialization. `false` on timeout.
    pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.shared.state.subscribe();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(InitState::is_ready)).await,
            Ok(Ok(_))
        )
    }

    pub fn current_context(&self) -> UserContext {
        self.shared.context.current()
    }

    pub fn local_enabled(&self) -> bool {
        self.shared.local_enabled.load(Ordering::SeqCst)
    }

    pub fn sync_status(&self) -> Option<SyncStatus> {
        self.shared.sync.as_ref().map(|s| s.status())
    }

    /// The current user's local store, once open.
    pub async fn store(&self) -> Option<Arc<VectorStore>> {
        self.shared.local.read().await.store.clone()
    }

    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }
}
