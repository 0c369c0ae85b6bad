//! Per-call routing between the local index and the remote service.

use serde::{Deserialize, Serialize};

/// Everything the routing rules look at, captured at call time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RoutingInputs {
    pub context_set: bool,
    pub engine_ready: bool,
    pub initial_sync_complete: bool,
    pub store_empty: bool,
    /// Probe or explicit override allows on-device work
    pub local_enabled: bool,
    pub sync_degraded: bool,
    pub remote_available: bool,
}

/// Why a call went remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteReason {
    NoUserContext,
    EngineNotReady,
    CacheNotReady,
    LocalDisabled,
    SyncDegraded,
    /// Local top score under the similarity threshold
    LowConfidence,
    /// Local search failed or found nothing
    LocalUnavailable,
}

impl RemoteReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteReason::NoUserContext => "no_user_context",
            RemoteReason::EngineNotReady => "engine_not_ready",
            RemoteReason::CacheNotReady => "cache_not_ready",
            RemoteReason::LocalDisabled => "local_disabled",
            RemoteReason::SyncDegraded => "sync_degraded",
            RemoteReason::LowConfidence => "low_confidence",
            RemoteReason::LocalUnavailable => "local_unavailable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    Local,
    Remote(RemoteReason),
}

/// Rules in order:
/// 1. no user context → remote
/// 2. engine not ready, or initial sync incomplete with an empty cache → remote
/// 3. local disabled by the probe → remote
/// 4. sync degraded while the remote is reachable → remote
/// 5. otherwise local
///
/// Rules 2 (cache half) and 4 only route remote when a remote exists; with no
/// remote the local index is the only option.
pub fn decide(inputs: &RoutingInputs) -> RouteDecision {
    if !inputs.context_set {
        return RouteDecision::Remote(RemoteReason::NoUserContext);
    }
    if !inputs.engine_ready {
        return RouteDecision::Remote(RemoteReason::EngineNotReady);
    }
    if !inputs.initial_sync_complete && inputs.store_empty && inputs.remote_available {
        return RouteDecision::Remote(RemoteReason::CacheNotReady);
    }
    if !inputs.local_enabled {
        return RouteDecision::Remote(RemoteReason::LocalDisabled);
    }
    if inputs.sync_degraded && inputs.remote_available {
        return RouteDecision::Remote(RemoteReason::SyncDegraded);
    }
    RouteDecision::Local
}
