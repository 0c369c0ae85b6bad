//! Hybrid ranking across both tiers.
//!
//! `hybrid = α · similarity + (1 − α) · relevance` when the server supplied a
//! relevance score, otherwise `hybrid = similarity`. Ties prefer Tier-0, then
//! the lexicographically smaller id.

use std::cmp::Ordering;
use std::collections::HashSet;

use serde_json::Value;

use papr_types::Tier;
use papr_vector::{Metadata, QueryHit};

/// Metadata key of the server-side relevance score.
pub const RELEVANCE_KEY: &str = "relevance_score";

pub const DEFAULT_ALPHA: f32 = 0.7;

/// One hit with its scores.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: String,
    pub tier: Tier,
    pub distance: f32,
    pub similarity: f32,
    pub relevance: Option<f32>,
    pub hybrid: f32,
    pub metadata: Metadata,
    pub document: String,
}

impl Candidate {
    pub fn from_hit(hit: QueryHit, tier: Tier, alpha: f32) -> Self {
        let similarity = hit.similarity();
        let relevance = relevance_from(&hit.metadata);
        Self {
            hybrid: hybrid_score(similarity, relevance, alpha),
            id: hit.id,
            tier,
            distance: hit.distance,
            similarity,
            relevance,
            metadata: hit.metadata,
            document: hit.document,
        }
    }
}

/// Server relevance from metadata, clamped to `[0, 1]`.
pub fn relevance_from(metadata: &Metadata) -> Option<f32> {
    metadata
        .get(RELEVANCE_KEY)
        .and_then(Value::as_f64)
        .map(|r| r as f32)
        .filter(|r| r.is_finite())
        .map(|r| r.clamp(0.0, 1.0))
}

pub fn hybrid_score(similarity: f32, relevance: Option<f32>, alpha: f32) -> f32 {
    match relevance {
        Some(r) => alpha * similarity + (1.0 - alpha) * r.clamp(0.0, 1.0),
        None => similarity,
    }
}

/// Descending hybrid, then Tier-0 before Tier-1, then id ascending.
pub fn compare(a: &Candidate, b: &Candidate) -> Ordering {
    b.hybrid
        .total_cmp(&a.hybrid)
        .then_with(|| a.tier.cmp(&b.tier))
        .then_with(|| a.id.cmp(&b.id))
}

/// Sort, drop duplicate ids (keeping the best), truncate to `k`.
pub fn rank(mut candidates: Vec<Candidate>, k: usize) -> Vec<Candidate> {
    candidates.sort_by(compare);
    let mut seen = HashSet::new();
    candidates.retain(|c| seen.insert(c.id.clone()));
    candidates.truncate(k);
    candidates
}
