// src/storage/memory.rs

use std::collections::{BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::error::{ConflictError, Result};
use crate::models::config::ConsolidationConfig;
use crate::models::core::{
    AliasId, Entity, EntityAlias, EntityId, EntityRelationship, EntityType, MergeHistory,
    MergeHistoryId, MergeReviewItem, RelationshipId, ReviewItemId, ScopeId,
};
use crate::normalize::trigrams;
use crate::similarity::embedding_similarity;
use crate::storage::{
    ConfigProvider, ConsolidationEvent, EntityLookup, EntityStore, EntityVersion, EventSink,
    HistoryStore, MergeApplication, RelationshipStore, ReviewStore, SplitApplication,
    TransactionalStore, UndoApplication,
};

/// In-memory implementation of the store contracts.
///
/// Backs the integration tests and embedded callers. A single `RwLock`
/// around the whole state gives the transactional applications their
/// atomicity; the secondary maps stand in for the indexes a real backend
/// would carry, so lookups stay per-key rather than per-population.
#[derive(Default)]
pub struct MemoryStorage {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    entities: HashMap<EntityId, Entity>,
    relationships: HashMap<RelationshipId, EntityRelationship>,
    edges_by_entity: HashMap<EntityId, BTreeSet<String>>,
    aliases: HashMap<AliasId, EntityAlias>,
    aliases_by_canonical: HashMap<EntityId, Vec<AliasId>>,
    aliases_by_merge: HashMap<MergeHistoryId, Vec<AliasId>>,
    reviews: HashMap<ReviewItemId, MergeReviewItem>,
    review_by_pair: HashMap<(ScopeId, EntityId, EntityId), ReviewItemId>,
    history: HashMap<MergeHistoryId, MergeHistory>,
    history_order: Vec<MergeHistoryId>,
    configs: HashMap<ScopeId, ConsolidationConfig>,

    // Secondary indexes over canonical entities
    idx_phonetic: HashMap<(ScopeId, EntityType, String), BTreeSet<EntityId>>,
    idx_norm_name: HashMap<(ScopeId, EntityType, String), BTreeSet<EntityId>>,
    idx_trigram: HashMap<(ScopeId, String), BTreeSet<EntityId>>,
    idx_source_doc: HashMap<(ScopeId, String), BTreeSet<EntityId>>,
    canonical_by_scope: HashMap<ScopeId, BTreeSet<EntityId>>,
    children_by_canonical: HashMap<EntityId, BTreeSet<EntityId>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/admin hook; the engine itself never writes config.
    pub async fn set_config(&self, config: ConsolidationConfig) {
        let mut inner = self.inner.write().await;
        inner.configs.insert(config.scope_id.clone(), config);
    }
}

impl Inner {
    fn deindex_entity(&mut self, entity: &Entity) {
        let scope = entity.scope_id.clone();
        if let Some(code) = &entity.phonetic_code {
            if let Some(set) = self.idx_phonetic.get_mut(&(
                scope.clone(),
                entity.entity_type.clone(),
                code.clone(),
            )) {
                set.remove(&entity.id);
            }
        }
        if let Some(set) = self.idx_norm_name.get_mut(&(
            scope.clone(),
            entity.entity_type.clone(),
            entity.normalized_name.clone(),
        )) {
            set.remove(&entity.id);
        }
        for gram in trigrams(&entity.normalized_name) {
            if let Some(set) = self.idx_trigram.get_mut(&(scope.clone(), gram)) {
                set.remove(&entity.id);
            }
        }
        if let Some(doc) = &entity.source_document_id {
            if let Some(set) = self.idx_source_doc.get_mut(&(scope.clone(), doc.clone())) {
                set.remove(&entity.id);
            }
        }
        if let Some(set) = self.canonical_by_scope.get_mut(&scope) {
            set.remove(&entity.id);
        }
    }

    fn index_entity(&mut self, entity: &Entity) {
        if !entity.is_canonical {
            return;
        }
        let scope = entity.scope_id.clone();
        if let Some(code) = &entity.phonetic_code {
            self.idx_phonetic
                .entry((scope.clone(), entity.entity_type.clone(), code.clone()))
                .or_default()
                .insert(entity.id.clone());
        }
        self.idx_norm_name
            .entry((
                scope.clone(),
                entity.entity_type.clone(),
                entity.normalized_name.clone(),
            ))
            .or_default()
            .insert(entity.id.clone());
        for gram in trigrams(&entity.normalized_name) {
            self.idx_trigram
                .entry((scope.clone(), gram))
                .or_default()
                .insert(entity.id.clone());
        }
        if let Some(doc) = &entity.source_document_id {
            self.idx_source_doc
                .entry((scope.clone(), doc.clone()))
                .or_default()
                .insert(entity.id.clone());
        }
        self.canonical_by_scope
            .entry(scope)
            .or_default()
            .insert(entity.id.clone());
    }

    fn write_entity(&mut self, entity: Entity) {
        if let Some(old) = self.entities.get(&entity.id).cloned() {
            self.deindex_entity(&old);
            if let Some(previous) = &old.canonical_of {
                if let Some(set) = self.children_by_canonical.get_mut(previous) {
                    set.remove(&old.id);
                }
            }
        }
        self.index_entity(&entity);
        if let Some(canonical) = &entity.canonical_of {
            self.children_by_canonical
                .entry(canonical.clone())
                .or_default()
                .insert(entity.id.clone());
        }
        self.entities.insert(entity.id.clone(), entity);
    }

    fn check_versions(&self, expected: &[EntityVersion]) -> Result<()> {
        for ev in expected {
            let current = self
                .entities
                .get(&ev.id)
                .map(|e| e.version)
                .unwrap_or(-1);
            if current != ev.version {
                return Err(ConflictError::VersionMismatch {
                    id: ev.id.clone(),
                    expected: ev.version,
                    found: current,
                }
                .into());
            }
        }
        Ok(())
    }

    fn write_relationship(&mut self, relationship: EntityRelationship) {
        if let Some(old) = self.relationships.get(&relationship.id).cloned() {
            for endpoint in [&old.source_id, &old.target_id] {
                if let Some(set) = self.edges_by_entity.get_mut(endpoint) {
                    set.remove(&old.id.0);
                }
            }
        }
        for endpoint in [&relationship.source_id, &relationship.target_id] {
            self.edges_by_entity
                .entry(endpoint.clone())
                .or_default()
                .insert(relationship.id.0.clone());
        }
        self.relationships
            .insert(relationship.id.clone(), relationship);
    }

    fn append_history(&mut self, history: MergeHistory) {
        self.history_order.push(history.id.clone());
        self.history.insert(history.id.clone(), history);
    }
}

#[async_trait]
impl EntityStore for MemoryStorage {
    async fn get_entity(&self, id: &EntityId) -> Result<Option<Entity>> {
        Ok(self.inner.read().await.entities.get(id).cloned())
    }

    async fn get_entities(&self, ids: &[EntityId]) -> Result<Vec<Entity>> {
        let inner = self.inner.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| inner.entities.get(id).cloned())
            .collect())
    }

    async fn insert_entity(&self, entity: &Entity) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.write_entity(entity.clone());
        Ok(())
    }

    async fn update_entity(&self, entity: &Entity, expected_version: i64) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.check_versions(&[EntityVersion {
            id: entity.id.clone(),
            version: expected_version,
        }])?;
        inner.write_entity(entity.clone());
        Ok(())
    }

    async fn lookup_entity_ids(
        &self,
        lookup: &EntityLookup,
        limit: usize,
    ) -> Result<Vec<EntityId>> {
        let inner = self.inner.read().await;
        let ids: Vec<EntityId> = match lookup {
            EntityLookup::PhoneticCode {
                scope_id,
                entity_type,
                code,
            } => inner
                .idx_phonetic
                .get(&(scope_id.clone(), entity_type.clone(), code.clone()))
                .map(|set| set.iter().take(limit).cloned().collect())
                .unwrap_or_default(),
            EntityLookup::NormalizedName {
                scope_id,
                entity_type,
                normalized_name,
            } => inner
                .idx_norm_name
                .get(&(
                    scope_id.clone(),
                    entity_type.clone(),
                    normalized_name.clone(),
                ))
                .map(|set| set.iter().take(limit).cloned().collect())
                .unwrap_or_default(),
            EntityLookup::NameFuzzy {
                scope_id,
                normalized_name,
            } => {
                // Trigram overlap counting, the in-memory stand-in for a
                // pg_trgm-style index.
                let mut overlap: HashMap<EntityId, usize> = HashMap::new();
                for gram in trigrams(normalized_name) {
                    if let Some(set) = inner.idx_trigram.get(&(scope_id.clone(), gram)) {
                        for id in set {
                            *overlap.entry(id.clone()).or_insert(0) += 1;
                        }
                    }
                }
                let mut scored: Vec<(usize, EntityId)> =
                    overlap.into_iter().map(|(id, n)| (n, id)).collect();
                scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
                scored.into_iter().take(limit).map(|(_, id)| id).collect()
            }
            EntityLookup::SourceDocument {
                scope_id,
                source_document_id,
            } => inner
                .idx_source_doc
                .get(&(scope_id.clone(), source_document_id.clone()))
                .map(|set| set.iter().take(limit).cloned().collect())
                .unwrap_or_default(),
            EntityLookup::EmbeddingNeighbors {
                scope_id,
                entity_type,
                embedding,
                k,
            } => {
                let mut scored: Vec<(f64, EntityId)> = inner
                    .canonical_by_scope
                    .get(scope_id)
                    .into_iter()
                    .flatten()
                    .filter_map(|id| inner.entities.get(id))
                    .filter(|e| &e.entity_type == entity_type)
                    .filter_map(|e| {
                        embedding_similarity(Some(embedding.as_slice()), e.embedding.as_deref())
                            .map(|sim| (sim, e.id.clone()))
                    })
                    .collect();
                scored.sort_by(|a, b| {
                    b.0.partial_cmp(&a.0)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.1.cmp(&b.1))
                });
                scored
                    .into_iter()
                    .take((*k).min(limit))
                    .map(|(_, id)| id)
                    .collect()
            }
        };
        Ok(ids)
    }

    async fn list_canonical(
        &self,
        scope_id: &ScopeId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<EntityId>> {
        let inner = self.inner.read().await;
        Ok(inner
            .canonical_by_scope
            .get(scope_id)
            .map(|set| set.iter().skip(offset).take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn aliases_for_canonical(&self, canonical_id: &EntityId) -> Result<Vec<EntityAlias>> {
        let inner = self.inner.read().await;
        Ok(inner
            .aliases_by_canonical
            .get(canonical_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.aliases.get(id).cloned())
            .collect())
    }

    async fn aliases_for_merge(&self, merge_id: &MergeHistoryId) -> Result<Vec<EntityAlias>> {
        let inner = self.inner.read().await;
        Ok(inner
            .aliases_by_merge
            .get(merge_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.aliases.get(id).cloned())
            .collect())
    }

    async fn alias_children(&self, canonical_id: &EntityId) -> Result<Vec<Entity>> {
        let inner = self.inner.read().await;
        Ok(inner
            .children_by_canonical
            .get(canonical_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.entities.get(id).cloned())
            .collect())
    }

    async fn search_names(
        &self,
        scope_id: &ScopeId,
        normalized_query: &str,
        limit: usize,
    ) -> Result<Vec<EntityId>> {
        let inner = self.inner.read().await;
        let mut hits: BTreeSet<EntityId> = BTreeSet::new();
        for id in inner.canonical_by_scope.get(scope_id).into_iter().flatten() {
            if let Some(entity) = inner.entities.get(id) {
                if entity.normalized_name.contains(normalized_query) {
                    hits.insert(id.clone());
                }
            }
        }
        // Historical names: aliases resolve to the live canonical entity.
        // The alias row keeps the canonical id at merge time; when that
        // entity was itself absorbed later, one hop lands on the survivor.
        for alias in inner.aliases.values() {
            if alias.scope_id == *scope_id
                && !alias.consumed
                && alias.original_normalized_name.contains(normalized_query)
            {
                let resolved = match inner.entities.get(&alias.canonical_id) {
                    Some(entity) if !entity.is_canonical => entity
                        .canonical_of
                        .clone()
                        .unwrap_or_else(|| alias.canonical_id.clone()),
                    _ => alias.canonical_id.clone(),
                };
                hits.insert(resolved);
            }
        }
        Ok(hits.into_iter().take(limit).collect())
    }
}

#[async_trait]
impl RelationshipStore for MemoryStorage {
    async fn edges_touching(&self, entity_id: &EntityId) -> Result<Vec<EntityRelationship>> {
        let inner = self.inner.read().await;
        Ok(inner
            .edges_by_entity
            .get(entity_id)
            .into_iter()
            .flatten()
            .filter_map(|rid| inner.relationships.get(&RelationshipId(rid.clone())).cloned())
            .collect())
    }

    async fn neighbor_ids(&self, entity_id: &EntityId) -> Result<HashSet<EntityId>> {
        let inner = self.inner.read().await;
        let mut neighbors = HashSet::new();
        for rid in inner.edges_by_entity.get(entity_id).into_iter().flatten() {
            if let Some(edge) = inner.relationships.get(&RelationshipId(rid.clone())) {
                if edge.suppressed {
                    continue;
                }
                if edge.source_id == *entity_id {
                    neighbors.insert(edge.target_id.clone());
                } else {
                    neighbors.insert(edge.source_id.clone());
                }
            }
        }
        Ok(neighbors)
    }

    async fn insert_relationship(&self, relationship: &EntityRelationship) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.write_relationship(relationship.clone());
        Ok(())
    }
}

#[async_trait]
impl ReviewStore for MemoryStorage {
    async fn enqueue_review_if_absent(&self, item: &MergeReviewItem) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let key = (
            item.scope_id.clone(),
            item.entity_a.clone(),
            item.entity_b.clone(),
        );
        if let Some(existing_id) = inner.review_by_pair.get(&key) {
            if let Some(existing) = inner.reviews.get(existing_id) {
                if existing.status.is_actionable() {
                    return Ok(false);
                }
            }
        }
        inner.review_by_pair.insert(key, item.id.clone());
        inner.reviews.insert(item.id.clone(), item.clone());
        Ok(true)
    }

    async fn get_review_item(&self, id: &ReviewItemId) -> Result<Option<MergeReviewItem>> {
        Ok(self.inner.read().await.reviews.get(id).cloned())
    }

    async fn update_review_item(&self, item: &MergeReviewItem) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.reviews.insert(item.id.clone(), item.clone());
        Ok(())
    }

    async fn list_actionable(
        &self,
        scope_id: &ScopeId,
        limit: usize,
    ) -> Result<Vec<MergeReviewItem>> {
        let inner = self.inner.read().await;
        let mut items: Vec<MergeReviewItem> = inner
            .reviews
            .values()
            .filter(|item| item.scope_id == *scope_id && item.status.is_actionable())
            .cloned()
            .collect();
        items.sort_by(|a, b| {
            // Pending ahead of deferred, then most ambiguous first.
            let rank = |item: &MergeReviewItem| {
                if item.status == crate::models::core::ReviewStatus::Pending {
                    0
                } else {
                    1
                }
            };
            rank(a)
                .cmp(&rank(b))
                .then_with(|| {
                    b.priority
                        .partial_cmp(&a.priority)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.0.cmp(&b.id.0))
        });
        items.truncate(limit);
        Ok(items)
    }
}

#[async_trait]
impl HistoryStore for MemoryStorage {
    async fn get_history(&self, id: &MergeHistoryId) -> Result<Option<MergeHistory>> {
        Ok(self.inner.read().await.history.get(id).cloned())
    }

    async fn history_touching(&self, entity_id: &EntityId) -> Result<Vec<MergeHistory>> {
        let inner = self.inner.read().await;
        Ok(inner
            .history_order
            .iter()
            .filter_map(|id| inner.history.get(id))
            .filter(|h| h.affected_entity_ids.contains(entity_id))
            .cloned()
            .collect())
    }

    async fn list_history(&self, scope_id: &ScopeId, limit: usize) -> Result<Vec<MergeHistory>> {
        let inner = self.inner.read().await;
        Ok(inner
            .history_order
            .iter()
            .rev()
            .filter_map(|id| inner.history.get(id))
            .filter(|h| h.scope_id == *scope_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TransactionalStore for MemoryStorage {
    async fn apply_merge(&self, application: MergeApplication) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.check_versions(&application.expected_versions)?;

        inner.write_entity(application.canonical_update);
        for absorbed in application.absorbed_updates {
            inner.write_entity(absorbed);
        }
        for alias in application.aliases {
            inner
                .aliases_by_canonical
                .entry(alias.canonical_id.clone())
                .or_default()
                .push(alias.id.clone());
            inner
                .aliases_by_merge
                .entry(alias.merge_history_id.clone())
                .or_default()
                .push(alias.id.clone());
            inner.aliases.insert(alias.id.clone(), alias);
        }
        for edge in application.edge_updates {
            inner.write_relationship(edge);
        }
        inner.append_history(application.history);
        Ok(())
    }

    async fn apply_undo(&self, application: UndoApplication) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.check_versions(&application.expected_versions)?;

        for restored in application.restored_entities {
            inner.write_entity(restored);
        }
        for alias_id in &application.consumed_alias_ids {
            if let Some(alias) = inner.aliases.get_mut(alias_id) {
                alias.consumed = true;
                alias.consumed_at = Some(application.undone_at);
            }
        }
        for edge in application.edge_updates {
            inner.write_relationship(edge);
        }
        if let Some(original) = inner.history.get_mut(&application.undone_history_id) {
            original.undone = true;
            original.undone_by = Some(application.undone_by.clone());
            original.undone_at = Some(application.undone_at);
            original.undo_reason = application.undo_reason.clone();
        }
        inner.append_history(application.history);
        Ok(())
    }

    async fn apply_split(&self, application: SplitApplication) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.check_versions(&application.expected_versions)?;

        inner.write_entity(application.new_entity);
        inner.write_entity(application.canonical_update);
        inner.append_history(application.history);
        Ok(())
    }
}

#[async_trait]
impl ConfigProvider for MemoryStorage {
    async fn config_for_scope(&self, scope_id: &ScopeId) -> Result<ConsolidationConfig> {
        let inner = self.inner.read().await;
        Ok(inner
            .configs
            .get(scope_id)
            .cloned()
            .unwrap_or_else(|| ConsolidationConfig::default_for(scope_id.clone())))
    }
}

/// Event sink that retains emitted events; used by tests to assert on the
/// at-least-once notification stream.
#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<ConsolidationEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn drain(&self) -> Vec<ConsolidationEvent> {
        std::mem::take(&mut *self.events.lock().await)
    }

    pub async fn emitted(&self) -> Vec<ConsolidationEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn emit(&self, event: ConsolidationEvent) -> Result<()> {
        self.events.lock().await.push(event);
        Ok(())
    }
}
