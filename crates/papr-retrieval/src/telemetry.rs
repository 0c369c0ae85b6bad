//! Retrieval telemetry.
//!
//! A [`MetricsHandle`] collects phase timings for one search. Flushing
//! appends one JSON line to a local file (when configured) and posts one
//! `QueryLog` record to the external record service. Delivery is
//! at-most-once with no retries; failures are logged and dropped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use papr_types::{Route, Settings};

use crate::error::TelemetryError;

pub const QUERY_LOG_CLASS: &str = "QueryLog";
pub const API_VERSION: &str = "v1";

/// Timing marks within one search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    EmbedStart,
    EmbedEnd,
    VectorStart,
    VectorEnd,
    TotalEnd,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierBreakdown {
    pub tier0: usize,
    pub tier1: usize,
}

/// Per-call record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalMetrics {
    pub query_text: String,
    pub query_start_time: DateTime<Utc>,
    pub embedding_latency_ms: Option<f64>,
    pub vector_search_latency_ms: Option<f64>,
    pub total_latency_ms: Option<f64>,
    pub num_results: usize,
    pub embedding_dimensions: Option<usize>,
    pub model_name: Option<String>,
    pub device_type: Option<String>,
    pub tier_breakdown: TierBreakdown,
    pub route: Option<Route>,
    pub confidence: Option<f32>,
    /// Active (non-pad) query tokens
    pub query_tokens: Option<usize>,
    /// Whitespace-token approximation over returned contents
    pub retrieved_memory_tokens: usize,
    pub user_id: Option<String>,
    pub workspace_id: Option<String>,
    pub error: Option<String>,
}

impl RetrievalMetrics {
    /// Embedding plus vector search, or the total when neither ran.
    pub fn retrieval_latency_ms(&self) -> Option<f64> {
        match (self.embedding_latency_ms, self.vector_search_latency_ms) {
            (None, None) => self.total_latency_ms,
            (e, v) => Some(e.unwrap_or(0.0) + v.unwrap_or(0.0)),
        }
    }
}

/// In-flight metrics for one search.
#[derive(Debug, Clone)]
pub struct MetricsHandle {
    pub metrics: RetrievalMetrics,
    started: Instant,
    marks: HashMap<Phase, Instant>,
}

impl MetricsHandle {
    pub fn begin(query: &str) -> Self {
        Self {
            metrics: RetrievalMetrics {
                query_text: query.to_string(),
                query_start_time: Utc::now(),
                embedding_latency_ms: None,
                vector_search_latency_ms: None,
                total_latency_ms: None,
                num_results: 0,
                embedding_dimensions: None,
                model_name: None,
                device_type: None,
                tier_breakdown: TierBreakdown::default(),
                route: None,
                confidence: None,
                query_tokens: None,
                retrieved_memory_tokens: 0,
                user_id: None,
                workspace_id: None,
                error: None,
            },
            started: Instant::now(),
            marks: HashMap::new(),
        }
    }

    pub fn mark(&mut self, phase: Phase) {
        self.mark_at(phase, Instant::now());
    }

    pub fn mark_at(&mut self, phase: Phase, at: Instant) {
        self.marks.insert(phase, at);
        match phase {
            Phase::EmbedEnd => {
                self.metrics.embedding_latency_ms = self.span_ms(Phase::EmbedStart, Phase::EmbedEnd)
            }
            Phase::VectorEnd => {
                self.metrics.vector_search_latency_ms =
                    self.span_ms(Phase::VectorStart, Phase::VectorEnd)
            }
            Phase::TotalEnd => {
                self.metrics.total_latency_ms = Some(millis(at.saturating_duration_since(self.started)))
            }
            Phase::EmbedStart | Phase::VectorStart => {}
        }
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        self.metrics.error = Some(error.into());
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Close the total timer if still open.
    pub fn finish(mut self) -> RetrievalMetrics {
        if !self.marks.contains_key(&Phase::TotalEnd) {
            self.mark(Phase::TotalEnd);
        }
        self.metrics
    }

    fn span_ms(&self, from: Phase, to: Phase) -> Option<f64> {
        let start = self.marks.get(&from)?;
        let end = self.marks.get(&to)?;
        Some(millis(end.saturating_duration_since(*start)))
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Per-flush fields that are not timings.
#[derive(Debug, Clone, Default)]
pub struct FlushExtra {
    pub ranking_enabled: bool,
    pub enabled_agentic_graph: bool,
    /// Merged into the record as-is (classification scores, entity pointers)
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub enabled: bool,
    /// Record service base, e.g. "https://parse.example.com/parse"
    pub server_url: Option<String>,
    pub app_id: Option<String>,
    pub master_key: Option<SecretString>,
    pub rest_key: Option<SecretString>,
    pub log_file: Option<PathBuf>,
    pub infrastructure_region: String,
    pub api_version: String,
    pub timeout: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            server_url: None,
            app_id: None,
            master_key: None,
            rest_key: None,
            log_file: None,
            infrastructure_region: "on-device".to_string(),
            api_version: API_VERSION.to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl TelemetryConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let secret = |v: &Option<String>| v.clone().filter(|s| !s.is_empty()).map(SecretString::from);
        Self {
            enabled: settings.enable_metrics,
            server_url: settings.parse_server_url.clone().filter(|s| !s.is_empty()),
            app_id: settings.parse_app_id.clone().filter(|s| !s.is_empty()),
            master_key: secret(&settings.parse_master_key),
            rest_key: secret(&settings.parse_api_key),
            log_file: settings.metrics_log_file.clone(),
            infrastructure_region: settings.infrastructure_region.clone(),
            ..Default::default()
        }
    }
}

pub struct TelemetrySink {
    client: Client,
    config: TelemetryConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedRecord {
    object_id: Option<String>,
}

impl TelemetrySink {
    pub fn new(config: TelemetryConfig) -> Result<Self, TelemetryError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| TelemetryError::Request(e.to_string()))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    pub fn begin(&self, query: &str) -> MetricsHandle {
        MetricsHandle::begin(query)
    }

    /// `QueryLog` record body.
    pub fn query_log_body(&self, metrics: &RetrievalMetrics, extra: &FlushExtra) -> Value {
        let mut body = json!({
            "queryText": metrics.query_text,
            "retrievalLatencyMs": metrics.retrieval_latency_ms(),
            "totalProcessingTimeMs": metrics.total_latency_ms,
            "queryEmbeddingTokens": metrics.query_tokens,
            "retrievedMemoryTokens": metrics.retrieved_memory_tokens,
            "apiVersion": self.config.api_version,
            "infrastructureRegion": self.config.infrastructure_region,
            "rankingEnabled": extra.ranking_enabled,
            "enabledAgenticGraph": extra.enabled_agentic_graph,
            "onDevice": true,
            "SDKLog": true,
        });
        if let Value::Object(map) = &mut body {
            if let Some(user) = &metrics.user_id {
                map.insert("user".into(), pointer("_User", user));
            }
            if let Some(workspace) = &metrics.workspace_id {
                map.insert("workspace".into(), pointer("WorkSpace", workspace));
            }
            for (k, v) in &extra.fields {
                map.insert(k.clone(), v.clone());
            }
        }
        body
    }

    /// Write the local line and post the record. Returns the remote record id.
    pub async fn flush(
        &self,
        handle: MetricsHandle,
        extra: FlushExtra,
    ) -> Result<Option<String>, TelemetryError> {
        if !self.config.enabled {
            return Ok(None);
        }
        let metrics = handle.finish();

        if let Some(path) = &self.config.log_file {
            if let Err(e) = append_line(path, &metrics).await {
                warn!(path = ?path, error = %e, "Failed to write metrics log");
            }
        }

        let (Some(base), Some(app_id)) = (&self.config.server_url, &self.config.app_id) else {
            return Err(TelemetryError::NotConfigured(
                "record service URL or app id missing".into(),
            ));
        };
        let (key_header, key) = match (&self.config.master_key, &self.config.rest_key) {
            (Some(key), _) => ("X-Master-Key", key),
            (None, Some(key)) => ("X-REST-API-Key", key),
            (None, None) => {
                return Err(TelemetryError::NotConfigured(
                    "record service key missing".into(),
                ))
            }
        };

        let url = format!("{}/classes/{}", base.trim_end_matches('/'), QUERY_LOG_CLASS);
        let body = self.query_log_body(&metrics, &extra);
        let response = self
            .client
            .post(&url)
            .header("X-App-Id", app_id)
            .header(key_header, key.expose_secret())
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TelemetryError::Http {
                status: status.as_u16(),
                message,
            });
        }
        let created: CreatedRecord = response.json().await?;
        debug!(object_id = ?created.object_id, "Posted query log");
        Ok(created.object_id)
    }

    /// Fire-and-forget flush on the current runtime.
    ///
    /// Returns immediately; the handle is only useful to tests. Without a
    /// runtime the record is dropped.
    pub fn spawn_flush(
        self: &Arc<Self>,
        handle: MetricsHandle,
        extra: FlushExtra,
    ) -> Option<JoinHandle<()>> {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                debug!("No runtime, dropping telemetry record");
                return None;
            }
        };
        let sink = Arc::clone(self);
        Some(runtime.spawn(async move {
            match sink.flush(handle, extra).await {
                Ok(_) => {}
                Err(TelemetryError::NotConfigured(reason)) => {
                    debug!(reason = %reason, "Telemetry skipped")
                }
                Err(e) => warn!(error = %e, "Telemetry flush failed"),
            }
        }))
    }
}

fn pointer(class_name: &str, object_id: &str) -> Value {
    json!({"__type": "Pointer", "className": class_name, "objectId": object_id})
}

async fn append_line(path: &Path, metrics: &RetrievalMetrics) -> Result<(), TelemetryError> {
    let mut line = serde_json::to_vec(metrics)?;
    line.push(b'\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&line).await?;
    file.flush().await?;
    Ok(())
}
