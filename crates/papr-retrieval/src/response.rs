//! Search request options and the response shape shared by both routes.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use papr_types::{Memory, Route, Tier};

use crate::routing::RemoteReason;

#[derive(Debug, Clone, PartialEq)]
pub struct SearchOptions {
    pub max_memories: usize,
    pub max_nodes: usize,
    pub enable_agentic_graph: bool,
    /// End-to-end deadline; the configured default when `None`
    pub timeout: Option<Duration>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            max_memories: 20,
            max_nodes: 15,
            enable_agentic_graph: false,
            timeout: None,
        }
    }
}

impl SearchOptions {
    pub fn with_max_memories(mut self, max_memories: usize) -> Self {
        self.max_memories = max_memories;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Latencies {
    /// `None` when no embedding ran
    pub embedding_ms: Option<f64>,
    pub vector_search_ms: Option<f64>,
    pub remote_ms: Option<f64>,
    pub total_ms: f64,
}

/// Local scores for one returned memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryScore {
    pub id: String,
    pub tier: Tier,
    pub similarity: f32,
    pub hybrid: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub memories: Vec<Memory>,
    pub nodes: Vec<Value>,
    pub route: Route,
    pub latencies: Latencies,
    /// Top hybrid score of the local attempt
    pub confidence: Option<f32>,
    /// Parallel to `memories` on the local route; empty on the remote route
    pub scores: Vec<MemoryScore>,
    /// Answered locally before the initial sync completed
    pub from_partial_cache: bool,
    /// Why the call went remote
    pub remote_reason: Option<RemoteReason>,
    /// User context changed mid-call; results were discarded
    pub stale_context: bool,
}

impl SearchResponse {
    pub fn empty(route: Route) -> Self {
        Self {
            memories: Vec::new(),
            nodes: Vec::new(),
            route,
            latencies: Latencies::default(),
            confidence: None,
            scores: Vec::new(),
            from_partial_cache: false,
            remote_reason: None,
            stale_context: false,
        }
    }

    /// Empty response flagged as discarded because the context switched.
    pub fn stale(route: Route) -> Self {
        Self {
            stale_context: true,
            ..Self::empty(route)
        }
    }

    pub fn ids(&self) -> Vec<&str> {
        self.memories.iter().map(|m| m.id.as_str()).collect()
    }
}
