//! Typed surface of the remote memory service.
//!
//! Only the shapes the retrieval core depends on are modelled: search,
//! the two sync endpoints and single-memory fetch. Every response arrives
//! wrapped in a `{"data": …}` envelope.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::debug;

use papr_types::{EmbeddingFormat, Memory, Settings, Tier, UserContext};

use crate::error::ApiError;

/// Upper bound on in-flight requests per client.
pub const MAX_CONCURRENT_REQUESTS: usize = 16;

pub const SEARCH_PATH: &str = "/v1/memory/search";
pub const SYNC_TIERS_PATH: &str = "/v1/sync/tiers";
pub const SYNC_DELTA_PATH: &str = "/v1/sync/delta";
pub const MEMORY_PATH: &str = "/v1/memory";

/// Identity fields attached to every scoped request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiScope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
}

impl From<&UserContext> for ApiScope {
    fn from(ctx: &UserContext) -> Self {
        Self {
            user_id: ctx.user_id.clone(),
            external_user_id: ctx.external_user_id.clone(),
            workspace_id: ctx.workspace_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub max_memories: usize,
    pub max_nodes: usize,
    #[serde(default)]
    pub enable_agentic_graph: bool,
    #[serde(flatten)]
    pub scope: ApiScope,
}

/// Search results as returned by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteSearchResult {
    #[serde(default)]
    pub memories: Vec<Memory>,
    /// Graph nodes; passed through untouched
    #[serde(default)]
    pub nodes: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncTiersRequest {
    pub include_embeddings: bool,
    pub embedding_format: EmbeddingFormat,
    pub embed_limit: usize,
    pub embed_model: String,
    pub max_tier0: usize,
    pub max_tier1: usize,
    #[serde(flatten)]
    pub scope: ApiScope,
}

/// Full snapshot of both tiers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierSnapshot {
    #[serde(default)]
    pub tier0: Vec<Memory>,
    #[serde(default)]
    pub tier1: Vec<Memory>,
    /// Delta cursor positioned at this snapshot
    #[serde(default)]
    pub cursor: Option<String>,
}

impl TierSnapshot {
    pub fn tier(&self, tier: Tier) -> &[Memory] {
        match tier {
            Tier::Tier0 => &self.tier0,
            Tier::Tier1 => &self.tier1,
        }
    }

    pub fn len(&self) -> usize {
        self.tier0.len() + self.tier1.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncDeltaRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    pub include_embeddings: bool,
    pub embedding_format: EmbeddingFormat,
    #[serde(flatten)]
    pub scope: ApiScope,
}

/// One changed memory in a delta page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaItem {
    /// Target tier; derived from the memory type when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    pub memory: Memory,
}

impl DeltaItem {
    pub fn resolved_tier(&self) -> Tier {
        self.tier
            .unwrap_or_else(|| Tier::for_memory_type(&self.memory.memory_type))
    }
}

/// One page of incremental changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeltaPage {
    #[serde(default)]
    pub upserts: Vec<DeltaItem>,
    #[serde(default)]
    pub deletes: Vec<String>,
    #[serde(default)]
    pub next_cursor: Option<String>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

/// Remote memory service.
///
/// Implementations must be thread-safe (Send + Sync) for concurrent use.
#[async_trait]
pub trait MemoryApi: Send + Sync {
    /// Server-side search, used for the remote route.
    async fn search(&self, request: &SearchRequest) -> Result<RemoteSearchResult, ApiError>;

    /// Snapshot of both tiers.
    async fn sync_tiers(&self, request: &SyncTiersRequest) -> Result<TierSnapshot, ApiError>;

    /// Changes since a cursor.
    async fn sync_delta(&self, request: &SyncDeltaRequest) -> Result<DeltaPage, ApiError>;

    /// Fetch one memory by id.
    async fn get_memory(&self, id: &str) -> Result<Memory, ApiError>;
}

/// Configuration for [`HttpMemoryApi`].
#[derive(Debug, Clone)]
pub struct HttpApiConfig {
    /// e.g. "https://memory.papr.ai"
    pub base_url: String,
    pub api_key: SecretString,
    pub timeout: Duration,
    pub max_concurrent: usize,
}

impl HttpApiConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: SecretString::from(api_key.into()),
            timeout: Duration::from_secs(30),
            max_concurrent: MAX_CONCURRENT_REQUESTS,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Requires `memory_api_key`.
    pub fn from_settings(settings: &Settings) -> Result<Self, ApiError> {
        let key = settings
            .memory_api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ApiError::NotConfigured("PAPR_MEMORY_API_KEY is not set".into()))?;
        Ok(Self::new(settings.base_url.clone(), key).with_timeout(settings.http_timeout()))
    }
}

/// reqwest implementation of [`MemoryApi`].
pub struct HttpMemoryApi {
    client: Client,
    config: HttpApiConfig,
    permits: Arc<Semaphore>,
}

impl HttpMemoryApi {
    pub fn new(config: HttpApiConfig) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.max_concurrent)
            .build()
            .map_err(|e| ApiError::Client(e.to_string()))?;
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));

        Ok(Self {
            client,
            config,
            permits,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn request<B, R>(&self, method: Method, path: &str, body: Option<&B>) -> Result<R, ApiError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| ApiError::Client(e.to_string()))?;

        let url = self.url(path);
        debug!(method = %method, url = %url, "Calling memory service");

        let mut builder = self
            .client
            .request(method, &url)
            .header("X-API-Key", self.config.api_key.expose_secret())
            .header("Accept", "application/json");
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ApiError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let envelope: Envelope<R> = response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(envelope.data)
    }
}

#[async_trait]
impl MemoryApi for HttpMemoryApi {
    async fn search(&self, request: &SearchRequest) -> Result<RemoteSearchResult, ApiError> {
        self.request(Method::POST, SEARCH_PATH, Some(request)).await
    }

    async fn sync_tiers(&self, request: &SyncTiersRequest) -> Result<TierSnapshot, ApiError> {
        self.request(Method::POST, SYNC_TIERS_PATH, Some(request))
            .await
    }

    async fn sync_delta(&self, request: &SyncDeltaRequest) -> Result<DeltaPage, ApiError> {
        self.request(Method::POST, SYNC_DELTA_PATH, Some(request))
            .await
    }

    async fn get_memory(&self, id: &str) -> Result<Memory, ApiError> {
        let path = format!("{}/{}", MEMORY_PATH, id);
        self.request::<(), _>(Method::GET, &path, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use papr_types::MemoryType;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_api(base_url: &str) -> HttpMemoryApi {
        HttpMemoryApi::new(HttpApiConfig::new(base_url, "test-key")).unwrap()
    }

    fn scope() -> ApiScope {
        ApiScope {
            user_id: Some("u1".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_search_sends_key_and_parses_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(SEARCH_PATH))
            .and(header("X-API-Key", "test-key"))
            .and(body_partial_json(json!({"query": "hello", "user_id": "u1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "memories": [{"id": "m1", "content": "hello there", "type": "TextMemoryItem"}],
                    "nodes": [{"label": "Person"}]
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let api = test_api(&server.uri());
        let result = api
            .search(&SearchRequest {
                query: "hello".into(),
                max_memories: 5,
                max_nodes: 5,
                enable_agentic_graph: false,
                scope: scope(),
            })
            .await
            .unwrap();

        assert_eq!(result.memories.len(), 1);
        assert_eq!(result.memories[0].id, "m1");
        assert_eq!(result.nodes.len(), 1);
    }

    #[tokio::test]
    async fn test_sync_tiers_int8_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(SYNC_TIERS_PATH))
            .and(body_partial_json(json!({"include_embeddings": true, "embedding_format": "int8"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "tier0": [{"id": "g1", "content": "ship v2", "type": "goal", "embedding_int8": [127, -127, 0]}],
                    "tier1": []
                }
            })))
            .mount(&server)
            .await;

        let api = test_api(&server.uri());
        let snapshot = api
            .sync_tiers(&SyncTiersRequest {
                include_embeddings: true,
                embedding_format: EmbeddingFormat::Int8,
                embed_limit: 200,
                embed_model: "Qwen4B".into(),
                max_tier0: 100,
                max_tier1: 500,
                scope: scope(),
            })
            .await
            .unwrap();

        assert_eq!(snapshot.tier0.len(), 1);
        assert_eq!(snapshot.tier0[0].memory_type, MemoryType::Goal);
        assert_eq!(snapshot.tier0[0].embedding_int8, Some(vec![127, -127, 0]));
        assert!(snapshot.tier1.is_empty());
    }

    #[tokio::test]
    async fn test_delta_page_with_explicit_tier() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(SYNC_DELTA_PATH))
            .and(body_partial_json(json!({"cursor": "c1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "upserts": [
                        {"tier": 0, "memory": {"id": "a", "content": "x"}},
                        {"memory": {"id": "b", "content": "y", "type": "okr"}},
                        {"memory": {"id": "c", "content": "z"}}
                    ],
                    "deletes": ["old"],
                    "next_cursor": "c2",
                    "has_more": false
                }
            })))
            .mount(&server)
            .await;

        let api = test_api(&server.uri());
        let page = api
            .sync_delta(&SyncDeltaRequest {
                cursor: Some("c1".into()),
                include_embeddings: false,
                embedding_format: EmbeddingFormat::Float32,
                scope: scope(),
            })
            .await
            .unwrap();

        let tiers: Vec<Tier> = page.upserts.iter().map(|u| u.resolved_tier()).collect();
        assert_eq!(tiers, vec![Tier::Tier0, Tier::Tier0, Tier::Tier1]);
        assert_eq!(page.deletes, vec!["old".to_string()]);
        assert_eq!(page.next_cursor.as_deref(), Some("c2"));
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn test_http_error_carries_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/memory/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
            .mount(&server)
            .await;

        let api = test_api(&server.uri());
        let err = api.get_memory("missing").await.unwrap_err();
        assert_eq!(
            err,
            ApiError::Http {
                status: 404,
                message: "not found".into()
            }
        );
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_get_memory() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/memory/m7"))
            .and(header("X-API-Key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"id": "m7", "content": "note", "relevance_score": 0.4}
            })))
            .mount(&server)
            .await;

        let api = test_api(&format!("{}/", server.uri()));
        let memory = api.get_memory("m7").await.unwrap();
        assert_eq!(memory.id, "m7");
        assert_eq!(memory.relevance_score, Some(0.4));
    }

    #[tokio::test]
    async fn test_malformed_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(SEARCH_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let api = test_api(&server.uri());
        let err = api
            .search(&SearchRequest {
                query: "q".into(),
                max_memories: 1,
                max_nodes: 0,
                enable_agentic_graph: false,
                scope: ApiScope::default(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Decode(_)));
    }

    #[test]
    fn test_config_requires_key() {
        let settings = Settings::default();
        assert!(matches!(
            HttpApiConfig::from_settings(&settings),
            Err(ApiError::NotConfigured(_))
        ));

        let settings = Settings {
            memory_api_key: Some("k".into()),
            ..Settings::default()
        };
        let config = HttpApiConfig::from_settings(&settings).unwrap();
        assert_eq!(config.api_key.expose_secret(), "k");
        assert_eq!(config.timeout, Duration::from_secs(30));
    }
}
