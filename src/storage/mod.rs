//! Boundary contracts between the engine and its collaborators.
//!
//! The engine assumes a queryable store with indexing primitives, not a
//! specific product. Each lookup in `EntityLookup` must be satisfiable by a
//! single indexed access on the backend; none may degenerate into a
//! collection scan. Merge, undo, and split cross the boundary as one
//! transactional application each, so atomicity lives with the backend that
//! can actually provide it.

pub mod memory;
pub mod postgres;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::config::ConsolidationConfig;
use crate::models::core::{
    AliasId, Entity, EntityAlias, EntityId, EntityRelationship, EntityType, MergeEventType,
    MergeHistory, MergeHistoryId, MergeReviewItem, ReviewItemId, ScopeId,
};

/// Indexed candidate lookups available to the blocking engine.
///
/// Every variant targets canonical entities in one scope; backends resolve
/// each against a dedicated index (hash, trigram, or vector).
#[derive(Debug, Clone)]
pub enum EntityLookup {
    /// Same scope + type + phonetic code
    PhoneticCode {
        scope_id: ScopeId,
        entity_type: EntityType,
        code: String,
    },
    /// Same scope + type + exact normalized name
    NormalizedName {
        scope_id: ScopeId,
        entity_type: EntityType,
        normalized_name: String,
    },
    /// Trigram/substring similarity on the normalized name
    NameFuzzy {
        scope_id: ScopeId,
        normalized_name: String,
    },
    /// Entities extracted from the same source document
    SourceDocument {
        scope_id: ScopeId,
        source_document_id: String,
    },
    /// Nearest neighbors in the embedding index, restricted to one type
    EmbeddingNeighbors {
        scope_id: ScopeId,
        entity_type: EntityType,
        embedding: Vec<f32>,
        k: usize,
    },
}

/// Expected optimistic-concurrency token for one entity inside a
/// transactional application.
#[derive(Debug, Clone)]
pub struct EntityVersion {
    pub id: EntityId,
    pub version: i64,
}

/// Everything a merge writes, applied atomically: either all of alias
/// creation, property merge, canonical flip, edge redirection, and the
/// history row succeed, or none do.
#[derive(Debug, Clone)]
pub struct MergeApplication {
    pub scope_id: ScopeId,
    /// Versions the involved entities must still have at commit time
    pub expected_versions: Vec<EntityVersion>,
    /// Canonical row with merged properties and bumped version
    pub canonical_update: Entity,
    /// Absorbed rows flipped to non-canonical with `canonical_of` set
    pub absorbed_updates: Vec<Entity>,
    /// One alias row per absorbed entity
    pub aliases: Vec<EntityAlias>,
    /// Redirected / suppressed relationship rows
    pub edge_updates: Vec<EntityRelationship>,
    pub history: MergeHistory,
}

/// Everything an undo writes, applied atomically.
#[derive(Debug, Clone)]
pub struct UndoApplication {
    pub scope_id: ScopeId,
    /// The original merge row to flag as undone
    pub undone_history_id: MergeHistoryId,
    pub undone_by: String,
    pub undone_at: DateTime<Utc>,
    pub undo_reason: Option<String>,
    pub expected_versions: Vec<EntityVersion>,
    /// Absorbed entities re-materialized from their snapshots, plus the
    /// canonical row with reversible fields restored
    pub restored_entities: Vec<Entity>,
    /// Alias rows marked consumed (retained for audit)
    pub consumed_alias_ids: Vec<AliasId>,
    /// Relationship rows with redirection reverted
    pub edge_updates: Vec<EntityRelationship>,
    /// New `merge_undone` history row referencing the original
    pub history: MergeHistory,
}

/// Everything a split writes, applied atomically.
#[derive(Debug, Clone)]
pub struct SplitApplication {
    pub scope_id: ScopeId,
    pub expected_versions: Vec<EntityVersion>,
    pub new_entity: Entity,
    /// Canonical row with reassigned properties removed
    pub canonical_update: Entity,
    pub history: MergeHistory,
}

/// Notification emitted after each committed merge/undo/split.
///
/// Delivery is at-least-once; consumers must be idempotent on `event_id`.
#[derive(Debug, Clone)]
pub struct ConsolidationEvent {
    pub event_id: String,
    pub event_type: MergeEventType,
    pub scope_id: ScopeId,
    pub history_id: MergeHistoryId,
    pub canonical_id: Option<EntityId>,
    pub affected_entity_ids: Vec<EntityId>,
    pub occurred_at: DateTime<Utc>,
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get_entity(&self, id: &EntityId) -> Result<Option<Entity>>;

    async fn get_entities(&self, ids: &[EntityId]) -> Result<Vec<Entity>>;

    /// Used by the extraction boundary and by tests to seed population.
    async fn insert_entity(&self, entity: &Entity) -> Result<()>;

    /// Version-checked single-entity write (scoring-owned backfills). The
    /// row is written as given; `expected_version` must match the stored
    /// version or the call fails with a conflict.
    async fn update_entity(&self, entity: &Entity, expected_version: i64) -> Result<()>;

    /// One indexed lookup; returns at most `limit` canonical entity ids in
    /// a deterministic order.
    async fn lookup_entity_ids(&self, lookup: &EntityLookup, limit: usize)
        -> Result<Vec<EntityId>>;

    /// Pages through a scope's canonical population for batch re-scoring.
    async fn list_canonical(
        &self,
        scope_id: &ScopeId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<EntityId>>;

    async fn aliases_for_canonical(&self, canonical_id: &EntityId) -> Result<Vec<EntityAlias>>;

    async fn aliases_for_merge(&self, merge_id: &MergeHistoryId) -> Result<Vec<EntityAlias>>;

    /// Non-canonical entities whose `canonical_of` points at the entity.
    /// When their canonical entity is itself absorbed, the merge re-points
    /// them so the alias graph never chains.
    async fn alias_children(&self, canonical_id: &EntityId) -> Result<Vec<Entity>>;

    /// Search canonical entities by current or historical (alias) name;
    /// returns canonical ids.
    async fn search_names(
        &self,
        scope_id: &ScopeId,
        normalized_query: &str,
        limit: usize,
    ) -> Result<Vec<EntityId>>;
}

#[async_trait]
pub trait RelationshipStore: Send + Sync {
    /// All edges whose current endpoints touch the entity, suppressed rows
    /// included (callers filter for projections, keep for audit).
    async fn edges_touching(&self, entity_id: &EntityId) -> Result<Vec<EntityRelationship>>;

    /// Unsuppressed immediate neighbors of an entity.
    async fn neighbor_ids(&self, entity_id: &EntityId) -> Result<HashSet<EntityId>>;

    async fn insert_relationship(&self, relationship: &EntityRelationship) -> Result<()>;
}

#[async_trait]
pub trait ReviewStore: Send + Sync {
    /// Idempotent enqueue keyed on (scope, entity_a, entity_b): returns
    /// false without writing when an actionable item for the pair exists.
    async fn enqueue_review_if_absent(&self, item: &MergeReviewItem) -> Result<bool>;

    async fn get_review_item(&self, id: &ReviewItemId) -> Result<Option<MergeReviewItem>>;

    async fn update_review_item(&self, item: &MergeReviewItem) -> Result<()>;

    /// Actionable items for a scope: pending before deferred, then by
    /// descending priority.
    async fn list_actionable(
        &self,
        scope_id: &ScopeId,
        limit: usize,
    ) -> Result<Vec<MergeReviewItem>>;
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn get_history(&self, id: &MergeHistoryId) -> Result<Option<MergeHistory>>;

    /// Every history row whose affected set contains the entity, oldest
    /// first — the "find all history touching entity X" provenance query.
    async fn history_touching(&self, entity_id: &EntityId) -> Result<Vec<MergeHistory>>;

    async fn list_history(&self, scope_id: &ScopeId, limit: usize) -> Result<Vec<MergeHistory>>;
}

#[async_trait]
pub trait TransactionalStore: Send + Sync {
    async fn apply_merge(&self, application: MergeApplication) -> Result<()>;

    async fn apply_undo(&self, application: UndoApplication) -> Result<()>;

    async fn apply_split(&self, application: SplitApplication) -> Result<()>;
}

#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// The scope's consolidation config, falling back to defaults when the
    /// scope has none stored. The engine never writes config.
    async fn config_for_scope(&self, scope_id: &ScopeId) -> Result<ConsolidationConfig>;
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: ConsolidationEvent) -> Result<()>;
}

/// The full store surface the engine operates against.
pub trait ConsolidationStore:
    EntityStore
    + RelationshipStore
    + ReviewStore
    + HistoryStore
    + TransactionalStore
    + ConfigProvider
{
}

impl<T> ConsolidationStore for T where
    T: EntityStore
        + RelationshipStore
        + ReviewStore
        + HistoryStore
        + TransactionalStore
        + ConfigProvider
{
}

/// Default sink: events land in the log only.
pub struct LoggingEventSink;

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: ConsolidationEvent) -> Result<()> {
        log::info!(
            "event {} {}: scope={} history={} affected={}",
            event.event_id,
            event.event_type.as_str(),
            event.scope_id,
            event.history_id,
            event.affected_entity_ids.len()
        );
        Ok(())
    }
}
