//! # papr-retrieval
//!
//! Per-call retrieval for the on-device memory core.
//!
//! ## Features
//! - Routing between the local tier index and the remote memory service
//! - Single query embedding, both tiers searched in parallel
//! - Hybrid ranking (`α · similarity + (1 − α) · relevance`)
//! - Confidence fallback to the remote service
//! - Host resource probe deciding whether on-device work is enabled
//! - Per-query metrics flushed off the hot path

pub mod error;
pub mod orchestrator;
pub mod probe;
pub mod ranking;
pub mod response;
pub mod routing;
pub mod telemetry;

pub use error::{RetrievalError, TelemetryError, REMOTE_NOT_CONFIGURED};
pub use orchestrator::{merge_tiers, LocalIndex, Orchestrator, RetrievalConfig, SearchEnv};
pub use probe::{
    auto_configure, DecisionSource, OnDeviceDecision, ProbeDetails, ProbeReport, ProbeThresholds,
    ResourceProbe, ResourceSample, ResourceSampler, StaticSampler, SystemSampler,
};
pub use ranking::{hybrid_score, rank, relevance_from, Candidate, DEFAULT_ALPHA, RELEVANCE_KEY};
pub use response::{Latencies, MemoryScore, SearchOptions, SearchResponse};
pub use routing::{decide, RemoteReason, RouteDecision, RoutingInputs};
pub use telemetry::{
    FlushExtra, MetricsHandle, Phase, RetrievalMetrics, TelemetryConfig, TelemetrySink,
    TierBreakdown, QUERY_LOG_CLASS,
};
