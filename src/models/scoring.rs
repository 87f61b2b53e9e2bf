// src/models/scoring.rs

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::config::SignalWeights;
use crate::models::core::EntityId;

/// Per-signal similarity values for one candidate pair.
///
/// `None` means the signal was unavailable (missing embedding, disabled
/// feature, timed-out lookup) and was omitted from the weighted sum, not
/// counted as zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalBreakdown {
    pub name: Option<f64>,
    pub phonetic: Option<f64>,
    pub embedding: Option<f64>,
    pub graph: Option<f64>,
}

impl SignalBreakdown {
    /// Weighted combination over the signals that are present, with the
    /// weights renormalized so partial availability does not depress scores.
    /// Returns 0.0 when no signal is present.
    pub fn combine(&self, weights: &SignalWeights) -> f64 {
        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        for (signal, weight) in [
            (self.name, weights.name),
            (self.phonetic, weights.phonetic),
            (self.embedding, weights.embedding),
            (self.graph, weights.graph),
        ] {
            if let Some(value) = signal {
                weighted_sum += weight * value;
                weight_total += weight;
            }
        }
        if weight_total <= 0.0 {
            return 0.0;
        }
        (weighted_sum / weight_total).clamp(0.0, 1.0)
    }

    pub fn present_count(&self) -> usize {
        [self.name, self.phonetic, self.embedding, self.graph]
            .iter()
            .filter(|s| s.is_some())
            .count()
    }
}

/// Scored candidate pair produced by the combined scoring pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateScore {
    pub entity_a: EntityId,
    pub entity_b: EntityId,
    pub confidence: f64,
    pub breakdown: SignalBreakdown,

    /// Blocking strategies that surfaced this candidate
    pub blocking_strategies: Vec<String>,

    /// True when a Stage-B signal timed out and scoring degraded to the
    /// available signals
    pub degraded: bool,
}

/// Persistable snapshot of a score, attached to history and review rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreSnapshot {
    pub confidence: f64,
    pub breakdown: SignalBreakdown,
}

impl From<&CandidateScore> for ScoreSnapshot {
    fn from(score: &CandidateScore) -> Self {
        Self {
            confidence: score.confidence,
            breakdown: score.breakdown.clone(),
        }
    }
}

/// Routing outcome of the decision policy for one scored pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MergeDecision {
    AutoMerge,
    Review { priority: f64 },
    Reject,
}

/// Aggregate counters for one consolidation pass, logged at completion.
#[derive(Debug, Default, Clone)]
pub struct ConsolidationRunStats {
    pub entities_processed: usize,
    pub candidates_considered: usize,
    pub pairs_scored: usize,
    pub pairs_rejected_fast: usize,
    pub auto_merges: usize,
    pub auto_merge_failures: usize,
    pub queued_for_review: usize,
    pub rejected: usize,
    pub degraded_pairs: usize,
    pub duration: Duration,
}

impl ConsolidationRunStats {
    pub fn absorb(&mut self, other: &ConsolidationRunStats) {
        self.entities_processed += other.entities_processed;
        self.candidates_considered += other.candidates_considered;
        self.pairs_scored += other.pairs_scored;
        self.pairs_rejected_fast += other.pairs_rejected_fast;
        self.auto_merges += other.auto_merges;
        self.auto_merge_failures += other.auto_merge_failures;
        self.queued_for_review += other.queued_for_review;
        self.rejected += other.rejected;
        self.degraded_pairs += other.degraded_pairs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_renormalizes_over_present_signals() {
        let weights = SignalWeights::default();
        let full = SignalBreakdown {
            name: Some(0.8),
            phonetic: Some(0.8),
            embedding: Some(0.8),
            graph: Some(0.8),
        };
        let partial = SignalBreakdown {
            name: Some(0.8),
            phonetic: Some(0.8),
            embedding: None,
            graph: None,
        };
        // A uniformly 0.8 pair scores 0.8 regardless of which signals exist.
        assert!((full.combine(&weights) - 0.8).abs() < 1e-9);
        assert!((partial.combine(&weights) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn combine_with_no_signals_is_zero() {
        assert_eq!(SignalBreakdown::default().combine(&SignalWeights::default()), 0.0);
    }

    #[test]
    fn missing_embedding_is_omitted_not_zeroed() {
        let weights = SignalWeights::default();
        let with_zero = SignalBreakdown {
            name: Some(0.9),
            phonetic: Some(1.0),
            embedding: Some(0.0),
            graph: None,
        };
        let with_missing = SignalBreakdown {
            name: Some(0.9),
            phonetic: Some(1.0),
            embedding: None,
            graph: None,
        };
        assert!(with_missing.combine(&weights) > with_zero.combine(&weights));
    }
}
