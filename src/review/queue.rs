// src/review/queue.rs

//! Review queue: medium-confidence pairs awaiting a human decision.
//!
//! State machine: pending -> approved | rejected | deferred | expired.
//! Deferred items return to the queue deprioritized; expired is terminal
//! and reached only when an operand no longer exists or is no longer
//! canonical. Enqueue is idempotent per (scope, entity_a, entity_b).

use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};

use crate::error::{ConsolidationError, Result, ValidationError};
use crate::merge::MergeService;
use crate::models::core::{
    Entity, EntityId, MergeReason, MergeReviewItem, ReviewDecision, ReviewItemId, ReviewStatus,
    ScopeId,
};
use crate::models::scoring::{CandidateScore, ScoreSnapshot};
use crate::storage::ConsolidationStore;

const EXPIRY_SWEEP_PAGE: usize = 500;

pub struct ReviewQueue {
    store: Arc<dyn ConsolidationStore>,
    merges: Arc<MergeService>,
}

impl ReviewQueue {
    pub fn new(store: Arc<dyn ConsolidationStore>, merges: Arc<MergeService>) -> Self {
        Self { store, merges }
    }

    /// Queues a scored pair for review. Returns false when an actionable
    /// item for the pair already exists — the duplicate discovery is
    /// dropped, scores and all.
    pub async fn enqueue_candidate(
        &self,
        scope_id: &ScopeId,
        score: &CandidateScore,
        priority: f64,
    ) -> Result<bool> {
        let now = Utc::now();
        let (entity_a, entity_b) = Entity::ordered_pair(&score.entity_a, &score.entity_b);
        let item = MergeReviewItem {
            id: ReviewItemId::new_random(),
            scope_id: scope_id.clone(),
            entity_a,
            entity_b,
            confidence: score.confidence,
            priority,
            signal_breakdown: score.breakdown.clone(),
            blocking_strategies: score.blocking_strategies.clone(),
            status: ReviewStatus::Pending,
            decided_by: None,
            decided_at: None,
            notes: None,
            created_at: now,
            updated_at: now,
        };
        let inserted = self.store.enqueue_review_if_absent(&item).await?;
        if inserted {
            debug!(
                "queued ({}, {}) for review at confidence {:.3} priority {:.3}",
                item.entity_a, item.entity_b, item.confidence, item.priority
            );
        } else {
            debug!(
                "pair ({}, {}) already queued, not re-queued",
                item.entity_a, item.entity_b
            );
        }
        Ok(inserted)
    }

    /// Applies a human decision. The item must still be actionable
    /// (pending or deferred); approving executes the merge immediately with
    /// reason `user_approved`.
    pub async fn apply_decision(
        &self,
        item_id: &ReviewItemId,
        decision: ReviewDecision,
        actor: &str,
        notes: Option<String>,
    ) -> Result<MergeReviewItem> {
        let mut item = self
            .store
            .get_review_item(item_id)
            .await?
            .ok_or_else(|| ValidationError::ReviewItemNotFound { id: item_id.clone() })?;
        if !item.status.is_actionable() {
            return Err(ValidationError::ReviewItemNotActionable {
                id: item.id.clone(),
                status: item.status.as_str().to_string(),
            }
            .into());
        }

        let now = Utc::now();
        match decision {
            ReviewDecision::Reject => {
                item.status = ReviewStatus::Rejected;
            }
            ReviewDecision::Defer => {
                item.status = ReviewStatus::Deferred;
            }
            ReviewDecision::Approve => {
                match self.execute_approved_merge(&item, actor).await {
                    Ok(()) => item.status = ReviewStatus::Approved,
                    Err(ConsolidationError::Validation(err)) => {
                        // An operand went stale under the reviewer; the pair
                        // is obsolete, not an error the caller can fix.
                        warn!(
                            "review item {} expired on approval: {}",
                            item.id, err
                        );
                        item.status = ReviewStatus::Expired;
                    }
                    Err(other) => return Err(other),
                }
            }
        }
        item.decided_by = Some(actor.to_string());
        item.decided_at = Some(now);
        item.notes = notes;
        item.updated_at = now;
        self.store.update_review_item(&item).await?;
        info!(
            "review item {} -> {} by {}",
            item.id,
            item.status.as_str(),
            actor
        );
        Ok(item)
    }

    async fn execute_approved_merge(&self, item: &MergeReviewItem, actor: &str) -> Result<()> {
        let entities = self
            .store
            .get_entities(&[item.entity_a.clone(), item.entity_b.clone()])
            .await?;
        let a = entities
            .iter()
            .find(|e| e.id == item.entity_a)
            .ok_or_else(|| ValidationError::EntityNotFound { id: item.entity_a.clone() })?;
        let b = entities
            .iter()
            .find(|e| e.id == item.entity_b)
            .ok_or_else(|| ValidationError::EntityNotFound { id: item.entity_b.clone() })?;

        let (canonical, absorbed) = MergeService::choose_canonical(a, b);
        let snapshot = ScoreSnapshot {
            confidence: item.confidence,
            breakdown: item.signal_breakdown.clone(),
        };
        self.merges
            .merge(
                &canonical,
                &[absorbed],
                MergeReason::UserApproved,
                Some(snapshot),
                actor,
            )
            .await?;
        Ok(())
    }

    /// Actionable items for a scope, pending ahead of deferred, most
    /// ambiguous first.
    pub async fn next_items(
        &self,
        scope_id: &ScopeId,
        limit: usize,
    ) -> Result<Vec<MergeReviewItem>> {
        self.store.list_actionable(scope_id, limit).await
    }

    /// Expires items whose operands no longer exist or are no longer
    /// canonical (made obsolete by an unrelated merge). Returns the number
    /// of items expired.
    pub async fn expire_stale(&self, scope_id: &ScopeId) -> Result<usize> {
        let items = self
            .store
            .list_actionable(scope_id, EXPIRY_SWEEP_PAGE)
            .await?;
        let mut expired = 0;
        for mut item in items {
            let stale = !self.operand_is_live(&item.entity_a).await?
                || !self.operand_is_live(&item.entity_b).await?;
            if stale {
                let now = Utc::now();
                item.status = ReviewStatus::Expired;
                item.decided_by = Some("expiry_sweep".to_string());
                item.decided_at = Some(now);
                item.updated_at = now;
                self.store.update_review_item(&item).await?;
                expired += 1;
            }
        }
        if expired > 0 {
            info!("expired {} stale review item(s) in scope {}", expired, scope_id);
        }
        Ok(expired)
    }

    async fn operand_is_live(&self, id: &EntityId) -> Result<bool> {
        Ok(self
            .store
            .get_entity(id)
            .await?
            .map(|e| e.is_canonical)
            .unwrap_or(false))
    }
}
