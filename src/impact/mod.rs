//! Impact analysis engine
//!
//! Answers "which tests does this change put at risk?" by propagating scores
//! from changed nodes through the knowledge graph.
//!
//! - [`attenuation`]: per-hop decay by depth and relationship kind
//! - [`propagation`]: BFS propagation, batch accumulation and normalization

pub mod attenuation;
pub mod propagation;

pub use attenuation::{attenuation, relationship_multiplier};
pub use propagation::{ImpactPropagator, SCORE_DIGITS, normalize_impacts};

use crate::model::SemanticChange;

/// Additive per-hop boost derived from past co-changes and failures.
///
/// Implementations must be cheap and deterministic for the duration of a
/// propagation batch; they are shared across worker threads.
pub trait HistoricalBoost: Send + Sync {
    fn historical_boost(&self, change: &SemanticChange, target: &str) -> f64;
}

/// No history available: every boost is zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHistory;

impl HistoricalBoost for NoHistory {
    fn historical_boost(&self, _change: &SemanticChange, _target: &str) -> f64 {
        0.0
    }
}
