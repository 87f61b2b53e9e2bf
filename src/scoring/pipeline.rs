// src/scoring/pipeline.rs

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::time::timeout;

use crate::blocking::BlockedCandidate;
use crate::error::{DependencyError, Result};
use crate::models::config::ConsolidationConfig;
use crate::models::core::{Entity, EntityId};
use crate::models::scoring::{CandidateScore, SignalBreakdown};
use crate::similarity::{
    embedding_similarity, graph_similarity, phonetic_similarity, string_similarity,
};
use crate::storage::ConsolidationStore;

/// Fast-filter floor: pairs whose string+phonetic combination falls below
/// this never reach Stage B. Prunes the bulk of false blocking hits before
/// any vector or graph work.
pub const STAGE_A_MIN_COMBINED: f64 = 0.5;

pub const STAGE_B_SIGNAL_TIMEOUT_MS: u64 = 2_000;

/// Two-phase filter-then-score pipeline.
///
/// Stage A computes only the cheap string and phonetic signals for every
/// blocking candidate. Stage B — the only stage touching vectors or the
/// graph — runs on the small survivor set, omitting signals that are
/// missing, disabled, or timed out, and renormalizing the weights over what
/// remains.
pub struct ScoringPipeline {
    store: Arc<dyn ConsolidationStore>,
}

impl ScoringPipeline {
    pub fn new(store: Arc<dyn ConsolidationStore>) -> Self {
        Self { store }
    }

    /// Scores one blocking candidate against the probe. Returns `None` when
    /// Stage A rejects the pair (no further work performed).
    pub async fn score_pair(
        &self,
        probe: &Entity,
        candidate: &Entity,
        blocked: &BlockedCandidate,
        config: &ConsolidationConfig,
    ) -> Result<Option<CandidateScore>> {
        // Stage A: string + phonetic only.
        let name = string_similarity(&probe.normalized_name, &candidate.normalized_name);
        let phonetic = phonetic_similarity(&probe.normalized_name, &candidate.normalized_name);

        let fast_weight = config.weights.name + config.weights.phonetic;
        let fast_combined = if fast_weight > 0.0 {
            (config.weights.name * name + config.weights.phonetic * phonetic) / fast_weight
        } else {
            name.max(phonetic)
        };
        if fast_combined < STAGE_A_MIN_COMBINED {
            debug!(
                "stage A rejected ({}, {}): combined {:.3}",
                probe.id, candidate.id, fast_combined
            );
            return Ok(None);
        }

        let mut breakdown = SignalBreakdown {
            name: Some(name),
            phonetic: Some(phonetic),
            embedding: None,
            graph: None,
        };
        let mut degraded = false;

        // Stage B: deep signals for survivors only.
        if config.embedding_enabled {
            breakdown.embedding =
                embedding_similarity(probe.embedding.as_deref(), candidate.embedding.as_deref());
        }
        if config.graph_enabled {
            match self.neighborhood_overlap(&probe.id, &candidate.id).await {
                Ok(overlap) => breakdown.graph = overlap,
                Err(err) => {
                    if config.strict_signals {
                        return Err(err);
                    }
                    warn!(
                        "graph signal degraded for ({}, {}): {}",
                        probe.id, candidate.id, err
                    );
                    degraded = true;
                }
            }
        }

        let confidence = breakdown.combine(&config.weights);
        let (entity_a, entity_b) = Entity::ordered_pair(&probe.id, &candidate.id);
        Ok(Some(CandidateScore {
            entity_a,
            entity_b,
            confidence,
            breakdown,
            blocking_strategies: blocked
                .strategies
                .iter()
                .map(|s| s.as_str().to_string())
                .collect(),
            degraded,
        }))
    }

    async fn neighborhood_overlap(
        &self,
        a: &EntityId,
        b: &EntityId,
    ) -> Result<Option<f64>> {
        let duration = Duration::from_millis(STAGE_B_SIGNAL_TIMEOUT_MS);
        let neighbors_a = match timeout(duration, self.store.neighbor_ids(a)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(DependencyError::SignalTimeout {
                    signal: "graph".to_string(),
                    timeout_ms: STAGE_B_SIGNAL_TIMEOUT_MS,
                    a: a.clone(),
                    b: b.clone(),
                }
                .into())
            }
        };
        let neighbors_b = match timeout(duration, self.store.neighbor_ids(b)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(DependencyError::SignalTimeout {
                    signal: "graph".to_string(),
                    timeout_ms: STAGE_B_SIGNAL_TIMEOUT_MS,
                    a: a.clone(),
                    b: b.clone(),
                }
                .into())
            }
        };
        Ok(graph_similarity(&neighbors_a, &neighbors_b))
    }
}
