// src/merge/service.rs

//! Merge, undo, and split execution.
//!
//! Operations on overlapping entity sets are mutually exclusive: a keyed
//! lock set serializes them per entity id (acquired in sorted order), and
//! the store's optimistic version checks are the backstop for anything that
//! slips between read and commit. A version conflict is retried once with
//! fresh reads, then surfaced as a conflict error.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::{InvariantError, Result, ValidationError};
use crate::merge::strategy::merge_properties;
use crate::models::config::ConsolidationConfig;
use crate::models::core::{
    history_details, AliasId, Entity, EntityAlias, EntityId, EntityRelationship, EntitySnapshot,
    EntityType, MergeEventType, MergeHistory, MergeHistoryId, MergeReason,
};
use crate::models::scoring::ScoreSnapshot;
use crate::normalize::normalize_name;
use crate::similarity::phonetic_code;
use crate::storage::{
    ConsolidationEvent, ConsolidationStore, EntityVersion, EventSink, MergeApplication,
    SplitApplication, UndoApplication,
};

/// Endpoint state of one edge before a merge redirected it, recorded in the
/// merge's history details so undo restores exactly what the merge changed.
/// Reverting through this snapshot stays correct even when the edge had
/// already been redirected by an earlier merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EdgeStateBefore {
    source_id: EntityId,
    target_id: EntityId,
    original_source_id: Option<EntityId>,
    original_target_id: Option<EntityId>,
    suppressed: bool,
    redirected_by: Option<MergeHistoryId>,
}

impl EdgeStateBefore {
    fn of(edge: &EntityRelationship) -> Self {
        Self {
            source_id: edge.source_id.clone(),
            target_id: edge.target_id.clone(),
            original_source_id: edge.original_source_id.clone(),
            original_target_id: edge.original_target_id.clone(),
            suppressed: edge.suppressed,
            redirected_by: edge.redirected_by.clone(),
        }
    }
}

/// Caller-supplied property assignment for a split: properties accumulated
/// post-merge cannot be attributed automatically, so the caller says what
/// moves to the new entity.
#[derive(Debug, Clone)]
pub struct PropertyReassignment {
    pub new_display_name: String,
    pub new_entity_type: Option<EntityType>,
    /// Property keys moved off the canonical entity onto the new one
    pub move_properties: Vec<String>,
    /// Properties assigned directly to the new entity
    pub assign_properties: Map<String, Value>,
}

/// Keyed async locks serializing mutations per entity id.
#[derive(Default)]
struct EntityLockSet {
    locks: Mutex<HashMap<EntityId, Arc<Mutex<()>>>>,
}

impl EntityLockSet {
    /// Acquires the locks for `ids` in sorted order, so two operations over
    /// overlapping sets cannot deadlock.
    async fn acquire(&self, ids: &[EntityId]) -> Vec<OwnedMutexGuard<()>> {
        let mut sorted: Vec<EntityId> = ids.to_vec();
        sorted.sort();
        sorted.dedup();

        let handles: Vec<Arc<Mutex<()>>> = {
            let mut locks = self.locks.lock().await;
            sorted
                .iter()
                .map(|id| Arc::clone(locks.entry(id.clone()).or_default()))
                .collect()
        };
        let mut guards = Vec::with_capacity(handles.len());
        for handle in handles {
            guards.push(handle.lock_owned().await);
        }
        guards
    }
}

pub struct MergeService {
    store: Arc<dyn ConsolidationStore>,
    events: Arc<dyn EventSink>,
    locks: EntityLockSet,
}

impl MergeService {
    pub fn new(store: Arc<dyn ConsolidationStore>, events: Arc<dyn EventSink>) -> Self {
        Self {
            store,
            events,
            locks: EntityLockSet::default(),
        }
    }

    /// Given two canonical entities, picks which survives a merge: higher
    /// extraction confidence wins, ties go to the lexicographically smaller
    /// id so the choice is reproducible.
    pub fn choose_canonical(a: &Entity, b: &Entity) -> (EntityId, EntityId) {
        if a.extraction_confidence > b.extraction_confidence {
            (a.id.clone(), b.id.clone())
        } else if b.extraction_confidence > a.extraction_confidence {
            (b.id.clone(), a.id.clone())
        } else if a.id <= b.id {
            (a.id.clone(), b.id.clone())
        } else {
            (b.id.clone(), a.id.clone())
        }
    }

    /// Absorbs `absorbed_ids` into `canonical_id`.
    ///
    /// Validates every operand exists, is canonical, and shares the scope;
    /// fails with a validation error and no partial effect otherwise. All
    /// writes — alias snapshots, property merge, canonical flips, edge
    /// redirection, history — commit atomically.
    pub async fn merge(
        &self,
        canonical_id: &EntityId,
        absorbed_ids: &[EntityId],
        reason: MergeReason,
        score: Option<ScoreSnapshot>,
        actor: &str,
    ) -> Result<MergeHistoryId> {
        if absorbed_ids.is_empty() {
            return Err(ValidationError::NoAbsorbedEntities.into());
        }
        let mut lock_ids = vec![canonical_id.clone()];
        lock_ids.extend_from_slice(absorbed_ids);
        let _guards = self.locks.acquire(&lock_ids).await;

        let mut attempt = 0;
        loop {
            match self
                .try_merge(canonical_id, absorbed_ids, reason, score.clone(), actor)
                .await
            {
                Ok((history_id, event)) => {
                    self.emit(event).await;
                    return Ok(history_id);
                }
                Err(err) if err.is_retryable() && attempt == 0 => {
                    warn!(
                        "merge conflict for canonical {}, retrying once: {}",
                        canonical_id, err
                    );
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_merge(
        &self,
        canonical_id: &EntityId,
        absorbed_ids: &[EntityId],
        reason: MergeReason,
        score: Option<ScoreSnapshot>,
        actor: &str,
    ) -> Result<(MergeHistoryId, ConsolidationEvent)> {
        let canonical = self.require_canonical(canonical_id).await?;
        let mut absorbed_entities = Vec::with_capacity(absorbed_ids.len());
        for id in absorbed_ids {
            if id == canonical_id {
                return Err(ValidationError::SelfMerge { id: id.clone() }.into());
            }
            let entity = self.require_canonical(id).await?;
            if entity.scope_id != canonical.scope_id {
                return Err(ValidationError::ScopeMismatch {
                    a: canonical.id.clone(),
                    b: entity.id.clone(),
                }
                .into());
            }
            absorbed_entities.push(entity);
        }

        let config = self.store.config_for_scope(&canonical.scope_id).await?;
        let now = Utc::now();
        let history_id = MergeHistoryId::new_random();

        let mut expected_versions = vec![EntityVersion {
            id: canonical.id.clone(),
            version: canonical.version,
        }];
        let canonical_properties_before = canonical.properties.clone();

        // Property merge, alias snapshots, canonical flips.
        let mut canonical_update = canonical.clone();
        let mut absorbed_updates = Vec::new();
        let mut aliases = Vec::new();
        for absorbed in &absorbed_entities {
            expected_versions.push(EntityVersion {
                id: absorbed.id.clone(),
                version: absorbed.version,
            });
            canonical_update.properties =
                merge_properties(&canonical_update, absorbed, &config);

            aliases.push(EntityAlias {
                id: AliasId::new_random(),
                scope_id: absorbed.scope_id.clone(),
                canonical_id: canonical.id.clone(),
                original_entity_id: absorbed.id.clone(),
                original_display_name: absorbed.display_name.clone(),
                original_normalized_name: absorbed.normalized_name.clone(),
                snapshot: EntitySnapshot::of(absorbed),
                merge_history_id: history_id.clone(),
                consumed: false,
                consumed_at: None,
                created_at: now,
            });

            let mut flipped = absorbed.clone();
            flipped.is_canonical = false;
            flipped.canonical_of = Some(canonical.id.clone());
            flipped.version += 1;
            flipped.updated_at = now;
            absorbed_updates.push(flipped);
        }
        canonical_update.version += 1;
        canonical_update.updated_at = now;

        // Aliases already pointing at an absorbed entity re-point to the
        // survivor, keeping the alias graph one level deep.
        let mut repointed = Map::new();
        for absorbed in &absorbed_entities {
            for mut child in self.store.alias_children(&absorbed.id).await? {
                expected_versions.push(EntityVersion {
                    id: child.id.clone(),
                    version: child.version,
                });
                repointed.insert(child.id.0.clone(), Value::String(absorbed.id.0.clone()));
                child.canonical_of = Some(canonical.id.clone());
                child.version += 1;
                child.updated_at = now;
                absorbed_updates.push(child);
            }
        }

        let (edge_updates, edge_states_before) = self
            .plan_edge_redirects(&canonical, &absorbed_entities, &history_id, now)
            .await?;

        let mut affected: Vec<EntityId> = vec![canonical.id.clone()];
        affected.extend(absorbed_ids.iter().cloned());
        affected.extend(repointed.keys().map(|id| EntityId(id.clone())));

        let mut details = Map::new();
        details.insert(
            history_details::CANONICAL_PROPERTIES_BEFORE.to_string(),
            Value::Object(canonical_properties_before),
        );
        if !repointed.is_empty() {
            details.insert(
                history_details::REPOINTED_CHILDREN.to_string(),
                Value::Object(repointed),
            );
        }
        if !edge_states_before.is_empty() {
            details.insert(
                history_details::EDGE_STATES_BEFORE.to_string(),
                Value::Object(edge_states_before),
            );
        }

        let history = MergeHistory {
            id: history_id.clone(),
            scope_id: canonical.scope_id.clone(),
            event_type: MergeEventType::EntitiesMerged,
            canonical_id: Some(canonical.id.clone()),
            affected_entity_ids: affected.clone(),
            reason,
            score_snapshot: score,
            actor: actor.to_string(),
            details,
            undone: false,
            undone_by: None,
            undone_at: None,
            undo_reason: None,
            created_at: now,
        };

        let scope_id = canonical.scope_id.clone();
        self.store
            .apply_merge(MergeApplication {
                scope_id: scope_id.clone(),
                expected_versions,
                canonical_update,
                absorbed_updates,
                aliases,
                edge_updates,
                history,
            })
            .await?;

        info!(
            "merged {} entit{} into {} ({})",
            absorbed_ids.len(),
            if absorbed_ids.len() == 1 { "y" } else { "ies" },
            canonical.id,
            reason.as_str()
        );

        let event = ConsolidationEvent {
            event_id: Uuid::new_v4().to_string(),
            event_type: MergeEventType::EntitiesMerged,
            scope_id,
            history_id: history_id.clone(),
            canonical_id: Some(canonical.id.clone()),
            affected_entity_ids: affected,
            occurred_at: now,
        };
        Ok((history_id, event))
    }

    /// Redirects every edge touching an absorbed entity to the canonical
    /// entity. Edges that collapse into self-loops or duplicate an existing
    /// canonical edge are suppressed, not deleted; original endpoints are
    /// kept on the row for audit, and each touched edge's pre-merge state is
    /// returned for the history details so undo can restore it exactly.
    async fn plan_edge_redirects(
        &self,
        canonical: &Entity,
        absorbed_entities: &[Entity],
        history_id: &MergeHistoryId,
        now: chrono::DateTime<Utc>,
    ) -> Result<(Vec<EntityRelationship>, Map<String, Value>)> {
        // Edge keys already live on the canonical entity.
        let mut seen_keys: std::collections::HashSet<(EntityId, EntityId, String)> = self
            .store
            .edges_touching(&canonical.id)
            .await?
            .into_iter()
            .filter(|edge| !edge.suppressed)
            .map(|edge| {
                (
                    edge.source_id.clone(),
                    edge.target_id.clone(),
                    edge.relationship_type.clone(),
                )
            })
            .collect();

        let mut updates = Vec::new();
        let mut states_before = Map::new();
        for absorbed in absorbed_entities {
            for edge in self.store.edges_touching(&absorbed.id).await? {
                if edge.suppressed {
                    continue;
                }
                let state = serde_json::to_value(EdgeStateBefore::of(&edge))
                    .map_err(crate::error::ConsolidationError::storage)?;
                states_before.insert(edge.id.0.clone(), state);
                let mut redirected = edge.clone();
                if redirected.original_source_id.is_none() {
                    redirected.original_source_id = Some(edge.source_id.clone());
                }
                if redirected.original_target_id.is_none() {
                    redirected.original_target_id = Some(edge.target_id.clone());
                }
                if redirected.source_id == absorbed.id {
                    redirected.source_id = canonical.id.clone();
                }
                if redirected.target_id == absorbed.id {
                    redirected.target_id = canonical.id.clone();
                }
                redirected.redirected_by = Some(history_id.clone());
                redirected.updated_at = now;

                let key = (
                    redirected.source_id.clone(),
                    redirected.target_id.clone(),
                    redirected.relationship_type.clone(),
                );
                if redirected.source_id == redirected.target_id {
                    redirected.suppressed = true;
                } else if !seen_keys.insert(key) {
                    redirected.suppressed = true;
                }
                updates.push(redirected);
            }
        }
        Ok((updates, states_before))
    }

    /// Reverses a prior merge, restoring every absorbed entity from its
    /// alias snapshot. Rejected when the canonical entity was itself since
    /// absorbed — an ambiguous partial undo would corrupt provenance.
    pub async fn undo(
        &self,
        merge_id: &MergeHistoryId,
        actor: &str,
        reason: Option<String>,
    ) -> Result<MergeHistoryId> {
        let original = self
            .store
            .get_history(merge_id)
            .await?
            .ok_or_else(|| ValidationError::HistoryNotFound { id: merge_id.clone() })?;
        if original.event_type != MergeEventType::EntitiesMerged {
            return Err(ValidationError::NotAMergeEvent {
                id: merge_id.clone(),
                event_type: original.event_type.as_str().to_string(),
            }
            .into());
        }
        if original.undone {
            return Err(ValidationError::AlreadyUndone { id: merge_id.clone() }.into());
        }

        let _guards = self.locks.acquire(&original.affected_entity_ids).await;

        let mut attempt = 0;
        loop {
            match self.try_undo(&original, actor, reason.clone()).await {
                Ok((history_id, event)) => {
                    self.emit(event).await;
                    return Ok(history_id);
                }
                Err(err) if err.is_retryable() && attempt == 0 => {
                    warn!("undo conflict for merge {}, retrying once: {}", merge_id, err);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_undo(
        &self,
        original: &MergeHistory,
        actor: &str,
        reason: Option<String>,
    ) -> Result<(MergeHistoryId, ConsolidationEvent)> {
        let canonical_id = original
            .canonical_id
            .clone()
            .ok_or_else(|| ValidationError::HistoryNotFound { id: original.id.clone() })?;
        let canonical = self
            .store
            .get_entity(&canonical_id)
            .await?
            .ok_or_else(|| ValidationError::EntityNotFound { id: canonical_id.clone() })?;
        if !canonical.is_canonical {
            let absorbed_into = canonical.canonical_of.clone().ok_or(
                InvariantError::DanglingAlias { id: canonical.id.clone() },
            )?;
            return Err(InvariantError::CanonicalSinceAbsorbed {
                merge_id: original.id.clone(),
                canonical: canonical_id,
                absorbed_into,
            }
            .into());
        }

        let aliases: Vec<EntityAlias> = self
            .store
            .aliases_for_merge(&original.id)
            .await?
            .into_iter()
            .filter(|alias| !alias.consumed)
            .collect();
        if aliases.is_empty() {
            return Err(InvariantError::AliasSnapshotMissing {
                id: canonical_id,
                merge_id: original.id.clone(),
            }
            .into());
        }

        let config = self.store.config_for_scope(&canonical.scope_id).await?;
        let now = Utc::now();
        let history_id = MergeHistoryId::new_random();

        let mut expected_versions = vec![EntityVersion {
            id: canonical.id.clone(),
            version: canonical.version,
        }];
        let mut restored_entities = Vec::new();
        let mut consumed_alias_ids = Vec::new();

        // Re-materialize each absorbed entity from its snapshot.
        for alias in &aliases {
            let current = self
                .store
                .get_entity(&alias.original_entity_id)
                .await?
                .ok_or_else(|| ValidationError::EntityNotFound {
                    id: alias.original_entity_id.clone(),
                })?;
            expected_versions.push(EntityVersion {
                id: current.id.clone(),
                version: current.version,
            });

            let snapshot = &alias.snapshot;
            let mut restored = current.clone();
            restored.entity_type = snapshot.entity_type.clone();
            restored.display_name = snapshot.display_name.clone();
            restored.normalized_name = snapshot.normalized_name.clone();
            restored.description = snapshot.description.clone();
            restored.properties = snapshot.properties.clone();
            restored.external_ids = snapshot.external_ids.clone();
            restored.source_document_id = snapshot.source_document_id.clone();
            restored.source_text = snapshot.source_text.clone();
            restored.embedding = snapshot.embedding.clone();
            restored.phonetic_code = snapshot.phonetic_code.clone();
            restored.extraction_confidence = snapshot.extraction_confidence;
            restored.is_canonical = true;
            restored.canonical_of = None;
            restored.version += 1;
            restored.updated_at = now;
            restored_entities.push(restored);
            consumed_alias_ids.push(alias.id.clone());
        }

        // Aliases the merge re-pointed go back to their previous canonical
        // entity, which the loop above just restored.
        if let Some(repointed) = original
            .details
            .get(history_details::REPOINTED_CHILDREN)
            .and_then(|v| v.as_object())
        {
            for (child_id, previous) in repointed {
                let child_id = EntityId(child_id.clone());
                let previous = match previous.as_str() {
                    Some(id) => EntityId(id.to_string()),
                    None => continue,
                };
                let mut child = self
                    .store
                    .get_entity(&child_id)
                    .await?
                    .ok_or_else(|| ValidationError::EntityNotFound { id: child_id.clone() })?;
                expected_versions.push(EntityVersion {
                    id: child.id.clone(),
                    version: child.version,
                });
                child.canonical_of = Some(previous);
                child.version += 1;
                child.updated_at = now;
                restored_entities.push(child);
            }
        }

        // Revert the canonical side for reversible fields only.
        let before = original
            .details
            .get(history_details::CANONICAL_PROPERTIES_BEFORE)
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();
        let mut reverted = canonical.clone();
        let current_keys: Vec<String> = reverted.properties.keys().cloned().collect();
        for key in current_keys {
            if !config.strategy_for(&key).is_reversible() {
                continue;
            }
            match before.get(&key) {
                Some(value) => {
                    reverted.properties.insert(key, value.clone());
                }
                None => {
                    reverted.properties.remove(&key);
                }
            }
        }
        reverted.version += 1;
        reverted.updated_at = now;
        restored_entities.push(reverted);

        // Revert edge redirection attributable to this merge, restoring the
        // exact pre-merge endpoint state recorded in the merge details.
        let edge_states: Map<String, Value> = original
            .details
            .get(history_details::EDGE_STATES_BEFORE)
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();
        let mut edge_updates = Vec::new();
        for edge in self.store.edges_touching(&canonical.id).await? {
            if edge.redirected_by.as_ref() != Some(&original.id) {
                continue;
            }
            let state: EdgeStateBefore = match edge_states
                .get(&edge.id.0)
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
            {
                Some(state) => state,
                None => {
                    warn!(
                        "no pre-merge state recorded for edge {}, leaving it redirected",
                        edge.id
                    );
                    continue;
                }
            };
            let mut restored = edge.clone();
            restored.source_id = state.source_id;
            restored.target_id = state.target_id;
            restored.original_source_id = state.original_source_id;
            restored.original_target_id = state.original_target_id;
            restored.suppressed = state.suppressed;
            restored.redirected_by = state.redirected_by;
            restored.updated_at = now;
            edge_updates.push(restored);
        }

        let mut details = Map::new();
        details.insert(
            history_details::UNDOES_MERGE.to_string(),
            Value::String(original.id.0.clone()),
        );

        let history = MergeHistory {
            id: history_id.clone(),
            scope_id: canonical.scope_id.clone(),
            event_type: MergeEventType::MergeUndone,
            canonical_id: Some(canonical.id.clone()),
            affected_entity_ids: original.affected_entity_ids.clone(),
            reason: original.reason,
            score_snapshot: original.score_snapshot.clone(),
            actor: actor.to_string(),
            details,
            undone: false,
            undone_by: None,
            undone_at: None,
            undo_reason: None,
            created_at: now,
        };

        let scope_id = canonical.scope_id.clone();
        self.store
            .apply_undo(UndoApplication {
                scope_id: scope_id.clone(),
                undone_history_id: original.id.clone(),
                undone_by: actor.to_string(),
                undone_at: now,
                undo_reason: reason,
                expected_versions,
                restored_entities,
                consumed_alias_ids,
                edge_updates,
                history,
            })
            .await?;

        info!("undid merge {} ({} aliases restored)", original.id, aliases.len());

        let event = ConsolidationEvent {
            event_id: Uuid::new_v4().to_string(),
            event_type: MergeEventType::MergeUndone,
            scope_id,
            history_id: history_id.clone(),
            canonical_id: Some(canonical.id.clone()),
            affected_entity_ids: original.affected_entity_ids.clone(),
            occurred_at: now,
        };
        Ok((history_id, event))
    }

    /// Divides a canonical entity in two going forward. Not an undo:
    /// properties accumulated post-merge are reassigned explicitly by the
    /// caller.
    pub async fn split(
        &self,
        canonical_id: &EntityId,
        reassignment: PropertyReassignment,
        actor: &str,
        reason: Option<String>,
    ) -> Result<(EntityId, MergeHistoryId)> {
        if reassignment.new_display_name.trim().is_empty() {
            return Err(ValidationError::EmptySplit.into());
        }
        let _guards = self.locks.acquire(std::slice::from_ref(canonical_id)).await;

        let mut attempt = 0;
        loop {
            match self
                .try_split(canonical_id, &reassignment, actor, reason.clone())
                .await
            {
                Ok((new_id, history_id, event)) => {
                    self.emit(event).await;
                    return Ok((new_id, history_id));
                }
                Err(err) if err.is_retryable() && attempt == 0 => {
                    warn!(
                        "split conflict for canonical {}, retrying once: {}",
                        canonical_id, err
                    );
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_split(
        &self,
        canonical_id: &EntityId,
        reassignment: &PropertyReassignment,
        actor: &str,
        reason: Option<String>,
    ) -> Result<(EntityId, MergeHistoryId, ConsolidationEvent)> {
        let canonical = self.require_canonical(canonical_id).await?;
        let now = Utc::now();
        let history_id = MergeHistoryId::new_random();

        let mut new_properties = reassignment.assign_properties.clone();
        let mut canonical_update = canonical.clone();
        let mut moved_keys = Vec::new();
        for key in &reassignment.move_properties {
            if let Some(value) = canonical_update.properties.remove(key) {
                new_properties.insert(key.clone(), value);
                moved_keys.push(key.clone());
            }
        }
        canonical_update.version += 1;
        canonical_update.updated_at = now;

        let display_name = reassignment.new_display_name.trim().to_string();
        let normalized = normalize_name(&display_name);
        let new_entity = Entity {
            id: EntityId::new_random(),
            scope_id: canonical.scope_id.clone(),
            entity_type: reassignment
                .new_entity_type
                .clone()
                .unwrap_or_else(|| canonical.entity_type.clone()),
            display_name,
            phonetic_code: phonetic_code(&normalized),
            normalized_name: normalized,
            description: None,
            properties: new_properties,
            external_ids: Vec::new(),
            source_document_id: None,
            source_text: None,
            embedding: None,
            extraction_confidence: canonical.extraction_confidence,
            is_canonical: true,
            canonical_of: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };

        let mut details = Map::new();
        details.insert(
            history_details::SPLIT_NEW_ENTITY.to_string(),
            Value::String(new_entity.id.0.clone()),
        );
        details.insert(
            history_details::SPLIT_REASSIGNED_KEYS.to_string(),
            Value::Array(moved_keys.iter().map(|k| Value::String(k.clone())).collect()),
        );
        if let Some(reason_text) = &reason {
            details.insert("reason".to_string(), Value::String(reason_text.clone()));
        }

        let affected = vec![canonical.id.clone(), new_entity.id.clone()];
        let history = MergeHistory {
            id: history_id.clone(),
            scope_id: canonical.scope_id.clone(),
            event_type: MergeEventType::EntitySplit,
            canonical_id: Some(canonical.id.clone()),
            affected_entity_ids: affected.clone(),
            reason: MergeReason::UserApproved,
            score_snapshot: None,
            actor: actor.to_string(),
            details,
            undone: false,
            undone_by: None,
            undone_at: None,
            undo_reason: None,
            created_at: now,
        };

        let new_id = new_entity.id.clone();
        let scope_id = canonical.scope_id.clone();
        self.store
            .apply_split(SplitApplication {
                scope_id: scope_id.clone(),
                expected_versions: vec![EntityVersion {
                    id: canonical.id.clone(),
                    version: canonical.version,
                }],
                new_entity,
                canonical_update,
                history,
            })
            .await?;

        info!(
            "split {} off canonical {} ({} properties moved)",
            new_id,
            canonical.id,
            moved_keys.len()
        );

        let event = ConsolidationEvent {
            event_id: Uuid::new_v4().to_string(),
            event_type: MergeEventType::EntitySplit,
            scope_id,
            history_id: history_id.clone(),
            canonical_id: Some(canonical.id.clone()),
            affected_entity_ids: affected,
            occurred_at: now,
        };
        Ok((new_id, history_id, event))
    }

    async fn require_canonical(&self, id: &EntityId) -> Result<Entity> {
        let entity = self
            .store
            .get_entity(id)
            .await?
            .ok_or_else(|| ValidationError::EntityNotFound { id: id.clone() })?;
        if !entity.is_canonical {
            let canonical = entity
                .canonical_of
                .clone()
                .ok_or(InvariantError::DanglingAlias { id: entity.id.clone() })?;
            return Err(ValidationError::EntityNotCanonical {
                id: entity.id.clone(),
                canonical,
            }
            .into());
        }
        Ok(entity)
    }

    /// At-least-once delivery: a sink failure is logged, never rolled into
    /// the already-committed operation.
    async fn emit(&self, event: ConsolidationEvent) {
        let event_id = event.event_id.clone();
        if let Err(err) = self.events.emit(event).await {
            warn!("event {} delivery failed: {}", event_id, err);
        } else {
            debug!("event {} delivered", event_id);
        }
    }
}
