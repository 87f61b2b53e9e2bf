// src/blocking/engine.rs

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::time::timeout;

use crate::error::{ConsolidationError, DependencyError, Result};
use crate::models::config::ConsolidationConfig;
use crate::models::core::{Entity, EntityId};
use crate::storage::{ConsolidationStore, EntityLookup};

pub const BLOCKING_LOOKUP_TIMEOUT_MS: u64 = 5_000;

/// Candidate retrieval strategies, in application order (cheapest first).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockingStrategy {
    PhoneticCode,
    NormalizedNameExact,
    NameFuzzy,
    SharedSourceDocument,
    EmbeddingNeighbor,
}

impl BlockingStrategy {
    pub fn as_str(&self) -> &str {
        match self {
            Self::PhoneticCode => "phonetic_code",
            Self::NormalizedNameExact => "normalized_name_exact",
            Self::NameFuzzy => "name_fuzzy",
            Self::SharedSourceDocument => "shared_source_document",
            Self::EmbeddingNeighbor => "embedding_neighbor",
        }
    }

    /// Exact-match strength used for deterministic truncation: lower is
    /// stronger. Exact name beats phonetic beats fuzzy beats co-occurrence
    /// beats vector neighbors.
    fn strength(&self) -> u8 {
        match self {
            Self::NormalizedNameExact => 0,
            Self::PhoneticCode => 1,
            Self::NameFuzzy => 2,
            Self::SharedSourceDocument => 3,
            Self::EmbeddingNeighbor => 4,
        }
    }
}

/// One blocking hit, with every strategy that produced it. The strategy set
/// travels into scoring output for debugging and for weighting trust in
/// fuzzy vs exact hits.
#[derive(Debug, Clone)]
pub struct BlockedCandidate {
    pub entity_id: EntityId,
    pub strategies: Vec<BlockingStrategy>,
}

/// Retrieves a bounded candidate set for one entity using successive,
/// unioned indexed lookups — never a full-population comparison.
pub struct BlockingEngine {
    store: Arc<dyn ConsolidationStore>,
}

impl BlockingEngine {
    pub fn new(store: Arc<dyn ConsolidationStore>) -> Self {
        Self { store }
    }

    /// Runs the strategy ladder for `probe`, stopping once the candidate
    /// cap is reached. Output is deduplicated and deterministically ordered
    /// by descending exact-match strength, then entity id; truncation picks
    /// from that order, so reruns over an unchanged population reproduce
    /// the same set.
    pub async fn candidates_for(
        &self,
        probe: &Entity,
        config: &ConsolidationConfig,
    ) -> Result<Vec<BlockedCandidate>> {
        let mut accumulated: BTreeMap<EntityId, Vec<BlockingStrategy>> = BTreeMap::new();

        for (strategy, lookup) in self.lookups_for(probe, config) {
            if accumulated.len() >= config.max_candidates {
                break;
            }
            // One slow index never fails the whole pass: a timed-out
            // strategy is skipped and the remaining lookups still run,
            // unless the scope insists on the full signal set.
            let ids = match self.run_lookup(&lookup, config.max_group_size).await {
                Ok(ids) => ids,
                Err(err @ ConsolidationError::Dependency(_)) => {
                    if config.strict_signals {
                        return Err(err);
                    }
                    warn!(
                        "blocking[{}] skipped for {}: {}",
                        strategy.as_str(),
                        probe.id,
                        err
                    );
                    continue;
                }
                Err(err) => return Err(err),
            };
            debug!(
                "blocking[{}] for {}: {} hit(s)",
                strategy.as_str(),
                probe.id,
                ids.len()
            );
            for id in ids {
                if id == probe.id {
                    continue;
                }
                let strategies = accumulated.entry(id).or_default();
                if !strategies.contains(&strategy) {
                    strategies.push(strategy);
                }
            }
        }

        let mut candidates: Vec<BlockedCandidate> = accumulated
            .into_iter()
            .map(|(entity_id, strategies)| BlockedCandidate {
                entity_id,
                strategies,
            })
            .collect();
        candidates.sort_by(|a, b| {
            let sa = a.strategies.iter().map(|s| s.strength()).min().unwrap_or(u8::MAX);
            let sb = b.strategies.iter().map(|s| s.strength()).min().unwrap_or(u8::MAX);
            sa.cmp(&sb).then_with(|| a.entity_id.cmp(&b.entity_id))
        });
        candidates.truncate(config.max_candidates);
        Ok(candidates)
    }

    /// The strategy ladder for one probe. Strategies whose key is absent on
    /// the probe (no phonetic code, no source document, no embedding) are
    /// skipped rather than issued empty.
    fn lookups_for(
        &self,
        probe: &Entity,
        config: &ConsolidationConfig,
    ) -> Vec<(BlockingStrategy, EntityLookup)> {
        let mut lookups = Vec::new();

        if let Some(code) = &probe.phonetic_code {
            lookups.push((
                BlockingStrategy::PhoneticCode,
                EntityLookup::PhoneticCode {
                    scope_id: probe.scope_id.clone(),
                    entity_type: probe.entity_type.clone(),
                    code: code.clone(),
                },
            ));
        }
        if !probe.normalized_name.is_empty() {
            lookups.push((
                BlockingStrategy::NormalizedNameExact,
                EntityLookup::NormalizedName {
                    scope_id: probe.scope_id.clone(),
                    entity_type: probe.entity_type.clone(),
                    normalized_name: probe.normalized_name.clone(),
                },
            ));
            lookups.push((
                BlockingStrategy::NameFuzzy,
                EntityLookup::NameFuzzy {
                    scope_id: probe.scope_id.clone(),
                    normalized_name: probe.normalized_name.clone(),
                },
            ));
        }
        if let Some(doc) = &probe.source_document_id {
            lookups.push((
                BlockingStrategy::SharedSourceDocument,
                EntityLookup::SourceDocument {
                    scope_id: probe.scope_id.clone(),
                    source_document_id: doc.clone(),
                },
            ));
        }
        if config.embedding_enabled {
            if let Some(embedding) = &probe.embedding {
                lookups.push((
                    BlockingStrategy::EmbeddingNeighbor,
                    EntityLookup::EmbeddingNeighbors {
                        scope_id: probe.scope_id.clone(),
                        entity_type: probe.entity_type.clone(),
                        embedding: embedding.clone(),
                        k: config.max_group_size,
                    },
                ));
            }
        }
        lookups
    }

    async fn run_lookup(&self, lookup: &EntityLookup, limit: usize) -> Result<Vec<EntityId>> {
        let duration = Duration::from_millis(BLOCKING_LOOKUP_TIMEOUT_MS);
        match timeout(duration, self.store.lookup_entity_ids(lookup, limit)).await {
            Ok(result) => result,
            Err(_) => Err(DependencyError::BlockingTimeout {
                timeout_ms: BLOCKING_LOOKUP_TIMEOUT_MS,
            }
            .into()),
        }
    }
}
