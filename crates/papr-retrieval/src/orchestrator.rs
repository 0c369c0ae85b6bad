//! Retrieval orchestrator: route, embed once, query both tiers, rank.
//!
//! The local path embeds the query exactly once, then fans out one query per
//! tier on the blocking pool with the same vector. A tier that fails counts
//! as empty when the other tier found something. Low confidence, an empty
//! result or a local failure falls back to the remote service when one is
//! configured. The whole call runs under one deadline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Map;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use papr_embeddings::TextEmbedder;
use papr_sync::{memory_from_metadata, ApiScope, MemoryApi, SearchRequest, SyncStatus};
use papr_types::{Memory, Route, Settings, Tier, UserContext};
use papr_vector::{MetadataFilter, QueryHit, VectorError, VectorStore};

use crate::error::RetrievalError;
use crate::ranking::{rank, Candidate, DEFAULT_ALPHA};
use crate::response::{Latencies, MemoryScore, SearchOptions, SearchResponse};
use crate::routing::{decide, RemoteReason, RouteDecision, RoutingInputs};
use crate::telemetry::{FlushExtra, MetricsHandle, Phase, TelemetrySink, TierBreakdown};

#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalConfig {
    /// Local answers below this top hybrid score go remote
    pub similarity_threshold: f32,
    pub hybrid_alpha: f32,
    /// Query the two tiers concurrently
    pub parallel_search: bool,
    pub search_timeout: Duration,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.30,
            hybrid_alpha: DEFAULT_ALPHA,
            parallel_search: true,
            search_timeout: Duration::from_secs(120),
        }
    }
}

impl RetrievalConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            similarity_threshold: settings.ondevice_similarity_threshold,
            hybrid_alpha: settings.hybrid_alpha(),
            parallel_search: settings.enable_parallel_search,
            search_timeout: settings.search_timeout(),
        }
    }
}

/// Loaded embedder plus the current user's store.
#[derive(Clone)]
pub struct LocalIndex {
    pub embedder: Arc<dyn TextEmbedder>,
    pub store: Arc<VectorStore>,
}

/// Client state captured at the start of one call.
#[derive(Clone)]
pub struct SearchEnv {
    pub context: UserContext,
    /// `None` until the model is loaded and the store is open
    pub local: Option<LocalIndex>,
    pub sync: SyncStatus,
    pub local_enabled: bool,
}

type TierOutcome = Result<Vec<QueryHit>, String>;

pub struct Orchestrator {
    config: RetrievalConfig,
    remote: Option<Arc<dyn MemoryApi>>,
    telemetry: Option<Arc<TelemetrySink>>,
}

impl Orchestrator {
    pub fn new(config: RetrievalConfig) -> Self {
        Self {
            config,
            remote: None,
            telemetry: None,
        }
    }

    pub fn with_remote(mut self, remote: Arc<dyn MemoryApi>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<TelemetrySink>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Run one search. Fails only with `Timeout` or `RemoteHttp`.
    pub async fn search(
        &self,
        query: &str,
        options: &SearchOptions,
        env: &SearchEnv,
    ) -> Result<SearchResponse, RetrievalError> {
        if options.max_memories == 0 {
            debug!("max_memories is 0, nothing to retrieve");
            return Ok(SearchResponse::empty(Route::Local));
        }

        let deadline = options.timeout.unwrap_or(self.config.search_timeout);
        let mut metrics = MetricsHandle::begin(query);
        metrics.metrics.user_id = env.context.user_id.clone();
        metrics.metrics.workspace_id = env.context.workspace_id.clone();

        let outcome =
            tokio::time::timeout(deadline, self.route_and_search(query, options, env, &mut metrics))
                .await;
        let result = match outcome {
            Ok(result) => result.map_err(RetrievalError::into_user_facing),
            Err(_) => {
                warn!(timeout_ms = deadline.as_millis() as u64, "Search timed out");
                Err(RetrievalError::Timeout {
                    elapsed_ms: metrics.elapsed().as_millis() as u64,
                })
            }
        };

        metrics.mark(Phase::TotalEnd);
        let result = match result {
            Ok(mut response) => {
                response.latencies.total_ms = metrics.metrics.total_latency_ms.unwrap_or_default();
                record_response(&mut metrics, &response);
                Ok(response)
            }
            Err(e) => {
                metrics.record_error(match &e {
                    RetrievalError::Timeout { .. } => "Timeout".to_string(),
                    other => other.to_string(),
                });
                Err(e)
            }
        };

        if let Some(sink) = &self.telemetry {
            sink.spawn_flush(
                metrics,
                FlushExtra {
                    ranking_enabled: true,
                    enabled_agentic_graph: options.enable_agentic_graph,
                    fields: Map::new(),
                },
            );
        }
        result
    }

    async fn route_and_search(
        &self,
        query: &str,
        options: &SearchOptions,
        env: &SearchEnv,
        metrics: &mut MetricsHandle,
    ) -> Result<SearchResponse, RetrievalError> {
        let store_empty = match &env.local {
            Some(local) => local.store.is_empty(),
            None => true,
        };
        let inputs = RoutingInputs {
            context_set: env.context.is_set(),
            engine_ready: env.local.is_some(),
            initial_sync_complete: env.sync.initial_sync_complete,
            store_empty,
            local_enabled: env.local_enabled,
            sync_degraded: env.sync.is_degraded(),
            remote_available: self.remote.is_some(),
        };
        let decision = decide(&inputs);

        let (RouteDecision::Local, Some(local)) = (decision, env.local.as_ref()) else {
            let reason = match decision {
                RouteDecision::Remote(reason) => reason,
                RouteDecision::Local => RemoteReason::EngineNotReady,
            };
            debug!(reason = reason.as_str(), "Routing search remote");
            return self.search_remote(query, options, env, reason, None).await;
        };
        debug!("Routing search local");

        match self.search_local(query, options, env, local, metrics).await {
            Ok(response) => {
                let confident = response
                    .confidence
                    .is_some_and(|c| c >= self.config.similarity_threshold);
                if confident || self.remote.is_none() {
                    return Ok(response);
                }

                let reason = if response.memories.is_empty() {
                    RemoteReason::LocalUnavailable
                } else {
                    RemoteReason::LowConfidence
                };
                info!(
                    confidence = ?response.confidence,
                    threshold = self.config.similarity_threshold,
                    reason = reason.as_str(),
                    "Falling back to remote search"
                );
                match self
                    .search_remote(query, options, env, reason, Some(&response))
                    .await
                {
                    Ok(remote) => Ok(remote),
                    Err(e) if !response.memories.is_empty() => {
                        warn!(error = %e, "Remote fallback failed, returning local results");
                        Ok(response)
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => {
                warn!(error = %e, kind = %e.kind(), "Local search failed");
                if self.remote.is_some() {
                    self.search_remote(query, options, env, RemoteReason::LocalUnavailable, None)
                        .await
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn search_local(
        &self,
        query: &str,
        options: &SearchOptions,
        env: &SearchEnv,
        local: &LocalIndex,
        metrics: &mut MetricsHandle,
    ) -> Result<SearchResponse, RetrievalError> {
        metrics.mark(Phase::EmbedStart);
        let embedded = local.embedder.embed(query).await?;
        metrics.mark(Phase::EmbedEnd);

        let info = local.embedder.info();
        metrics.metrics.embedding_dimensions = Some(embedded.embedding.dimension());
        metrics.metrics.model_name = Some(info.name.clone());
        metrics.metrics.device_type = Some(info.device.clone());
        metrics.metrics.query_tokens = Some(embedded.active_tokens);

        let vector = Arc::new(embedded.embedding.values);
        let filter = MetadataFilter::version(env.context.version);

        metrics.mark(Phase::VectorStart);
        let outcomes = self
            .query_tiers(&local.store, vector, options.max_memories, filter)
            .await;
        metrics.mark(Phase::VectorEnd);

        let candidates = merge_tiers(outcomes, self.config.hybrid_alpha)?;
        let ranked = rank(candidates, options.max_memories);
        let confidence = ranked.first().map(|c| c.hybrid);

        let scores = ranked
            .iter()
            .map(|c| MemoryScore {
                id: c.id.clone(),
                tier: c.tier,
                similarity: c.similarity,
                hybrid: c.hybrid,
            })
            .collect();
        let memories = ranked.into_iter().map(candidate_memory).collect();

        Ok(SearchResponse {
            memories,
            nodes: Vec::new(),
            route: Route::Local,
            latencies: Latencies {
                embedding_ms: metrics.metrics.embedding_latency_ms,
                vector_search_ms: metrics.metrics.vector_search_latency_ms,
                remote_ms: None,
                total_ms: 0.0,
            },
            confidence,
            scores,
            from_partial_cache: !env.sync.initial_sync_complete,
            remote_reason: None,
            stale_context: false,
        })
    }

    /// Both tier queries, sharing one vector.
    async fn query_tiers(
        &self,
        store: &Arc<VectorStore>,
        vector: Arc<Vec<f32>>,
        k: usize,
        filter: MetadataFilter,
    ) -> [(Tier, TierOutcome); 2] {
        if self.config.parallel_search {
            let tier0 = spawn_query(store.clone(), Tier::Tier0, vector.clone(), k, filter.clone());
            let tier1 = spawn_query(store.clone(), Tier::Tier1, vector, k, filter);
            let (r0, r1) = tokio::join!(tier0, tier1);
            [(Tier::Tier0, flatten(r0)), (Tier::Tier1, flatten(r1))]
        } else {
            let r0 = spawn_query(store.clone(), Tier::Tier0, vector.clone(), k, filter.clone()).await;
            let r1 = spawn_query(store.clone(), Tier::Tier1, vector, k, filter).await;
            [(Tier::Tier0, flatten(r0)), (Tier::Tier1, flatten(r1))]
        }
    }

    async fn search_remote(
        &self,
        query: &str,
        options: &SearchOptions,
        env: &SearchEnv,
        reason: RemoteReason,
        local: Option<&SearchResponse>,
    ) -> Result<SearchResponse, RetrievalError> {
        let api = self
            .remote
            .as_ref()
            .ok_or_else(RetrievalError::remote_not_configured)?;

        let request = SearchRequest {
            query: query.to_string(),
            max_memories: options.max_memories,
            max_nodes: options.max_nodes,
            enable_agentic_graph: options.enable_agentic_graph,
            scope: ApiScope::from(&env.context),
        };
        let started = Instant::now();
        let result = api.search(&request).await?;
        let remote_ms = started.elapsed().as_secs_f64() * 1000.0;

        let mut memories = result.memories;
        memories.truncate(options.max_memories);

        Ok(SearchResponse {
            memories,
            nodes: result.nodes,
            route: Route::Remote,
            latencies: Latencies {
                embedding_ms: local.and_then(|l| l.latencies.embedding_ms),
                vector_search_ms: local.and_then(|l| l.latencies.vector_search_ms),
                remote_ms: Some(remote_ms),
                total_ms: 0.0,
            },
            confidence: local.and_then(|l| l.confidence),
            scores: Vec::new(),
            from_partial_cache: false,
            remote_reason: Some(reason),
            stale_context: false,
        })
    }
}

fn spawn_query(
    store: Arc<VectorStore>,
    tier: Tier,
    vector: Arc<Vec<f32>>,
    k: usize,
    filter: MetadataFilter,
) -> JoinHandle<Result<Vec<QueryHit>, VectorError>> {
    tokio::task::spawn_blocking(move || store.query(tier, &vector, k, &filter))
}

fn flatten(
    joined: Result<Result<Vec<QueryHit>, VectorError>, tokio::task::JoinError>,
) -> TierOutcome {
    match joined {
        Ok(Ok(hits)) => Ok(hits),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) => Err(e.to_string()),
    }
}

/// A failed tier counts as empty while the other tier has hits.
pub fn merge_tiers(
    outcomes: [(Tier, TierOutcome); 2],
    alpha: f32,
) -> Result<Vec<Candidate>, RetrievalError> {
    let mut candidates = Vec::new();
    let mut failures = Vec::new();
    for (tier, outcome) in outcomes {
        match outcome {
            Ok(hits) => {
                candidates.extend(hits.into_iter().map(|h| Candidate::from_hit(h, tier, alpha)))
            }
            Err(e) => {
                warn!(tier = %tier, error = %e, "Tier query failed");
                failures.push(format!("{}: {}", tier, e));
            }
        }
    }
    if !failures.is_empty() && candidates.is_empty() {
        return Err(RetrievalError::LocalFailed(failures.join("; ")));
    }
    Ok(candidates)
}

fn candidate_memory(candidate: Candidate) -> Memory {
    memory_from_metadata(&candidate.metadata)
        .unwrap_or_else(|| Memory::new(candidate.id, candidate.document))
}

fn record_response(metrics: &mut MetricsHandle, response: &SearchResponse) {
    let m = &mut metrics.metrics;
    m.route = Some(response.route);
    m.num_results = response.memories.len();
    m.confidence = response.confidence;
    m.tier_breakdown = response
        .scores
        .iter()
        .fold(TierBreakdown::default(), |mut acc, s| {
            match s.tier {
                Tier::Tier0 => acc.tier0 += 1,
                Tier::Tier1 => acc.tier1 += 1,
            }
            acc
        });
    m.retrieved_memory_tokens = response
        .memories
        .iter()
        .map(|mem| mem.content.split_whitespace().count())
        .sum();
    debug!(
        route = %response.route,
        results = response.memories.len(),
        total_ms = response.latencies.total_ms,
        "Search complete"
    );
}
