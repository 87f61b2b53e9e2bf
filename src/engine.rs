// src/engine.rs

//! Consolidation pass orchestration.
//!
//! Wires blocking -> scoring -> decision -> merge/queue for one entity, and
//! pages a scope's canonical population for batch re-scoring. Nothing here
//! holds state across invocations; everything crosses through the store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use log::{debug, info, warn};

use crate::blocking::BlockingEngine;
use crate::decision::decide;
use crate::error::{ConsolidationError, Result, ValidationError};
use crate::merge::history::MergeHistoryService;
use crate::merge::MergeService;
use crate::models::core::{Entity, EntityId, MergeReason, ReviewDecision, ReviewItemId, ScopeId};
use crate::models::scoring::{CandidateScore, ConsolidationRunStats, MergeDecision, ScoreSnapshot};
use crate::normalize::normalize_name;
use crate::review::ReviewQueue;
use crate::scoring::ScoringPipeline;
use crate::similarity::phonetic_code;
use crate::storage::{ConsolidationStore, EventSink};

const SCOPE_PAGE_SIZE: usize = 200;
const MAX_CONCURRENT_ENTITY_PASSES: usize = 8;
const SYSTEM_ACTOR: &str = "system";

pub struct ConsolidationEngine {
    store: Arc<dyn ConsolidationStore>,
    blocking: BlockingEngine,
    scoring: ScoringPipeline,
    merges: Arc<MergeService>,
    reviews: ReviewQueue,
    history: MergeHistoryService,
}

impl ConsolidationEngine {
    pub fn new(store: Arc<dyn ConsolidationStore>, events: Arc<dyn EventSink>) -> Self {
        let merges = Arc::new(MergeService::new(Arc::clone(&store), events));
        Self {
            blocking: BlockingEngine::new(Arc::clone(&store)),
            scoring: ScoringPipeline::new(Arc::clone(&store)),
            reviews: ReviewQueue::new(Arc::clone(&store), Arc::clone(&merges)),
            history: MergeHistoryService::new(Arc::clone(&store)),
            merges,
            store,
        }
    }

    pub fn merges(&self) -> &Arc<MergeService> {
        &self.merges
    }

    pub fn reviews(&self) -> &ReviewQueue {
        &self.reviews
    }

    pub fn history(&self) -> &MergeHistoryService {
        &self.history
    }

    /// One incremental consolidation pass: the entity against the existing
    /// population. Non-canonical probes are skipped quietly — a merge that
    /// absorbed the entity mid-flight makes the pass moot, not an error.
    pub async fn consolidate_entity(&self, entity_id: &EntityId) -> Result<ConsolidationRunStats> {
        let started = Instant::now();
        let mut stats = ConsolidationRunStats::default();

        let mut probe = match self.store.get_entity(entity_id).await? {
            Some(entity) => entity,
            None => {
                return Err(ValidationError::EntityNotFound { id: entity_id.clone() }.into())
            }
        };
        if !probe.is_canonical {
            debug!("skipping consolidation pass for non-canonical entity {}", probe.id);
            return Ok(stats);
        }
        stats.entities_processed = 1;

        let config = self.store.config_for_scope(&probe.scope_id).await?;
        config.validate()?;

        probe = self.backfill_derived_fields(probe).await?;

        let candidates = self.blocking.candidates_for(&probe, &config).await?;
        stats.candidates_considered = candidates.len();
        if candidates.is_empty() {
            stats.duration = started.elapsed();
            return Ok(stats);
        }

        let candidate_ids: Vec<EntityId> =
            candidates.iter().map(|c| c.entity_id.clone()).collect();
        let entities: HashMap<EntityId, Entity> = self
            .store
            .get_entities(&candidate_ids)
            .await?
            .into_iter()
            .map(|e| (e.id.clone(), e))
            .collect();

        for blocked in &candidates {
            let candidate = match entities.get(&blocked.entity_id) {
                Some(entity) if entity.is_canonical => entity,
                _ => continue,
            };

            let score = match self
                .scoring
                .score_pair(&probe, candidate, blocked, &config)
                .await?
            {
                Some(score) => score,
                None => {
                    stats.pairs_rejected_fast += 1;
                    continue;
                }
            };
            stats.pairs_scored += 1;
            if score.degraded {
                stats.degraded_pairs += 1;
            }

            match decide(score.confidence, &config) {
                MergeDecision::AutoMerge => {
                    if config.auto_consolidation_enabled {
                        self.execute_auto_merge(&probe, candidate, &score, &mut stats)
                            .await?;
                    } else {
                        // Auto-consolidation off: high-confidence pairs take
                        // the review path at top priority.
                        if self
                            .reviews
                            .enqueue_candidate(&probe.scope_id, &score, 1.0)
                            .await?
                        {
                            stats.queued_for_review += 1;
                        }
                    }
                }
                MergeDecision::Review { priority } => {
                    if self
                        .reviews
                        .enqueue_candidate(&probe.scope_id, &score, priority)
                        .await?
                    {
                        stats.queued_for_review += 1;
                    }
                }
                MergeDecision::Reject => {
                    debug!(
                        "rejected pair ({}, {}) at confidence {:.3}",
                        score.entity_a, score.entity_b, score.confidence
                    );
                    stats.rejected += 1;
                }
            }

            // A merge may have absorbed the probe itself; the remaining
            // candidates were blocked for an entity that no longer stands.
            if stats.auto_merges > 0 {
                match self.store.get_entity(&probe.id).await? {
                    Some(current) if current.is_canonical => probe = current,
                    _ => {
                        debug!("probe {} absorbed mid-pass, ending pass", probe.id);
                        break;
                    }
                }
            }
        }

        stats.duration = started.elapsed();
        debug!(
            "pass for {}: {} candidates, {} scored, {} auto-merged, {} queued, {} rejected in {:.2?}",
            entity_id,
            stats.candidates_considered,
            stats.pairs_scored,
            stats.auto_merges,
            stats.queued_for_review,
            stats.rejected,
            stats.duration
        );
        Ok(stats)
    }

    async fn execute_auto_merge(
        &self,
        probe: &Entity,
        candidate: &Entity,
        score: &CandidateScore,
        stats: &mut ConsolidationRunStats,
    ) -> Result<()> {
        let (canonical, absorbed) = MergeService::choose_canonical(probe, candidate);
        let snapshot = ScoreSnapshot::from(score);
        match self
            .merges
            .merge(
                &canonical,
                &[absorbed.clone()],
                MergeReason::AutoHighConfidence,
                Some(snapshot),
                SYSTEM_ACTOR,
            )
            .await
        {
            Ok(_) => {
                stats.auto_merges += 1;
                Ok(())
            }
            Err(ConsolidationError::Validation(err)) => {
                // Population moved under us; the pair is moot.
                debug!("auto-merge skipped ({}, {}): {}", canonical, absorbed, err);
                Ok(())
            }
            Err(err) => {
                // Never drop a high-confidence pair: transient execution
                // failure falls back to the review queue.
                warn!(
                    "auto-merge failed for ({}, {}), falling back to review: {}",
                    canonical, absorbed, err
                );
                stats.auto_merge_failures += 1;
                if self
                    .reviews
                    .enqueue_candidate(&probe.scope_id, score, 1.0)
                    .await?
                {
                    stats.queued_for_review += 1;
                }
                Ok(())
            }
        }
    }

    /// Batch re-scoring over a scope's canonical population, paged and
    /// bounded-concurrent. Entities absorbed while the sweep runs are
    /// skipped by their own pass.
    pub async fn consolidate_scope(&self, scope_id: &ScopeId) -> Result<ConsolidationRunStats> {
        let started = Instant::now();
        let mut totals = ConsolidationRunStats::default();
        let mut offset = 0;

        loop {
            let page = self
                .store
                .list_canonical(scope_id, offset, SCOPE_PAGE_SIZE)
                .await?;
            if page.is_empty() {
                break;
            }
            offset += page.len();

            let results: Vec<Result<ConsolidationRunStats>> = stream::iter(page.iter())
                .map(|id| self.consolidate_entity(id))
                .buffer_unordered(MAX_CONCURRENT_ENTITY_PASSES)
                .collect()
                .await;
            for result in results {
                match result {
                    Ok(stats) => totals.absorb(&stats),
                    Err(ConsolidationError::Validation(err)) => {
                        debug!("batch pass skipped an entity: {}", err)
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        totals.duration = started.elapsed();
        info!(
            "scope {} sweep: {} entities, {} pairs scored, {} auto-merges, {} queued, {} rejected, {} degraded in {:.2?}",
            scope_id,
            totals.entities_processed,
            totals.pairs_scored,
            totals.auto_merges,
            totals.queued_for_review,
            totals.rejected,
            totals.degraded_pairs,
            totals.duration
        );
        Ok(totals)
    }

    /// Read-only variant of the pass: blocked and scored candidates for an
    /// entity, no decisions executed. Backs "find similar to X" queries.
    pub async fn find_similar(&self, entity_id: &EntityId) -> Result<Vec<CandidateScore>> {
        let probe = self
            .store
            .get_entity(entity_id)
            .await?
            .ok_or_else(|| ValidationError::EntityNotFound { id: entity_id.clone() })?;
        let config = self.store.config_for_scope(&probe.scope_id).await?;

        let candidates = self.blocking.candidates_for(&probe, &config).await?;
        let candidate_ids: Vec<EntityId> =
            candidates.iter().map(|c| c.entity_id.clone()).collect();
        let entities: HashMap<EntityId, Entity> = self
            .store
            .get_entities(&candidate_ids)
            .await?
            .into_iter()
            .map(|e| (e.id.clone(), e))
            .collect();

        let mut scores = Vec::new();
        for blocked in &candidates {
            let candidate = match entities.get(&blocked.entity_id) {
                Some(entity) if entity.is_canonical => entity,
                _ => continue,
            };
            if let Some(score) = self
                .scoring
                .score_pair(&probe, candidate, blocked, &config)
                .await?
            {
                scores.push(score);
            }
        }
        scores.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(scores)
    }

    /// Human decision intake (§6): validates and applies one decision.
    pub async fn apply_review_decision(
        &self,
        item_id: &ReviewItemId,
        decision: ReviewDecision,
        actor: &str,
        notes: Option<String>,
    ) -> Result<()> {
        self.reviews
            .apply_decision(item_id, decision, actor, notes)
            .await?;
        Ok(())
    }

    /// Expiry sweep over a scope's review queue.
    pub async fn expire_stale_reviews(&self, scope_id: &ScopeId) -> Result<usize> {
        self.reviews.expire_stale(scope_id).await
    }

    /// One page of a scope's canonical entity ids, for callers driving
    /// their own batch progress.
    pub async fn canonical_page(
        &self,
        scope_id: &ScopeId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<EntityId>> {
        self.store.list_canonical(scope_id, offset, limit).await
    }

    /// Derives missing normalized name and phonetic code on the probe and
    /// writes them back — the one scoring-owned entity mutation.
    async fn backfill_derived_fields(&self, mut probe: Entity) -> Result<Entity> {
        let mut changed = false;
        if probe.normalized_name.is_empty() && !probe.display_name.is_empty() {
            probe.normalized_name = normalize_name(&probe.display_name);
            changed = true;
        }
        if probe.phonetic_code.is_none() && !probe.normalized_name.is_empty() {
            probe.phonetic_code = phonetic_code(&probe.normalized_name);
            changed = probe.phonetic_code.is_some() || changed;
        }
        if changed {
            let expected = probe.version;
            probe.version += 1;
            probe.updated_at = chrono::Utc::now();
            if let Err(err) = self.store.update_entity(&probe, expected).await {
                // Backfill is opportunistic; a racing write keeps its state.
                warn!("derived-field backfill for {} not persisted: {}", probe.id, err);
                probe.version = expected;
            }
        }
        Ok(probe)
    }
}
