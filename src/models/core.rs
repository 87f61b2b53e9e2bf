// src/models/core.rs

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ValidationError;

//------------------------------------------------------------------------------
// IDENTIFIER TYPES
//------------------------------------------------------------------------------
// Newtype pattern for type safety to prevent mixing different ID types

/// Strongly typed identifier for Entity records
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub String);

/// Strongly typed identifier for the tenant boundary a record belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeId(pub String);

/// Strongly typed identifier for EntityRelationship records
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationshipId(pub String);

/// Strongly typed identifier for EntityAlias records
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AliasId(pub String);

/// Strongly typed identifier for MergeReviewItem records
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReviewItemId(pub String);

/// Strongly typed identifier for MergeHistory records
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MergeHistoryId(pub String);

macro_rules! impl_id_display {
    ($($ty:ident),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(&self.0)
                }
            }

            impl $ty {
                pub fn new_random() -> Self {
                    Self(Uuid::new_v4().to_string())
                }

                pub fn as_str(&self) -> &str {
                    &self.0
                }
            }
        )*
    };
}

impl_id_display!(EntityId, ScopeId, RelationshipId, AliasId, ReviewItemId, MergeHistoryId);

//------------------------------------------------------------------------------
// ENTITY TYPE
//------------------------------------------------------------------------------

/// Open, domain-defined entity type.
///
/// Not a closed enum: domains add their own types without a schema change.
/// Validation (non-empty, trimmed, lowercased) happens here at the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityType(String);

impl EntityType {
    pub fn new(raw: &str) -> Result<Self, ValidationError> {
        let normalized = raw.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(ValidationError::EmptyEntityType);
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

//------------------------------------------------------------------------------
// CORE DOMAIN MODELS
//------------------------------------------------------------------------------

/// The atomic record being deduplicated.
///
/// Entities are created by the extraction pipeline and never deleted; merges
/// are soft. An entity with `is_canonical == false` always carries a
/// `canonical_of` reference to a canonical entity, and canonical entities
/// never point at another canonical entity (no alias chains).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    /// Unique identifier for this entity
    pub id: EntityId,

    /// Tenant boundary this entity belongs to
    pub scope_id: ScopeId,

    /// Domain-defined type (person, organization, drug, ...)
    pub entity_type: EntityType,

    /// Human-readable name as extracted
    pub display_name: String,

    /// Case/whitespace/diacritic-folded form of the display name
    pub normalized_name: String,

    /// Longer free-text description, when extraction produced one
    pub description: Option<String>,

    /// Free-form properties (key -> JSON value)
    pub properties: Map<String, Value>,

    /// Identifiers in external systems
    pub external_ids: Vec<String>,

    /// Source document the entity was extracted from
    pub source_document_id: Option<String>,

    /// Text span the extraction was based on
    pub source_text: Option<String>,

    /// Optional embedding vector for semantic similarity
    pub embedding: Option<Vec<f32>>,

    /// Phonetic code derived from the display name (blocking aid)
    pub phonetic_code: Option<String>,

    /// Confidence score from the original extraction (0.0-1.0)
    pub extraction_confidence: f64,

    /// False once this entity has been absorbed into another
    pub is_canonical: bool,

    /// The canonical entity this one was absorbed into (None when canonical)
    pub canonical_of: Option<EntityId>,

    /// Optimistic concurrency token, bumped on every store write
    pub version: i64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// Sorted pair key used wherever a pair of entities must be ordered
    /// consistently (review items, locks, history).
    pub fn ordered_pair(a: &EntityId, b: &EntityId) -> (EntityId, EntityId) {
        if a <= b {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        }
    }
}

/// Directed typed edge between two entities.
///
/// Edges are never physically deleted. A redirect updates `source_id` /
/// `target_id` while the original endpoints stay behind in
/// `original_source_id` / `original_target_id`; collapsed self-loops and
/// duplicates are suppressed, not removed, so undo can restore them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRelationship {
    pub id: RelationshipId,
    pub scope_id: ScopeId,

    /// Current (possibly redirected) endpoints
    pub source_id: EntityId,
    pub target_id: EntityId,

    /// Endpoints as originally written; set once, on the first redirect
    pub original_source_id: Option<EntityId>,
    pub original_target_id: Option<EntityId>,

    pub relationship_type: String,
    pub confidence: f64,
    pub properties: Map<String, Value>,

    /// True when the edge collapsed into a self-loop or duplicate during a
    /// merge and is excluded from graph projections
    pub suppressed: bool,

    /// The merge event responsible for the current redirect/suppression
    pub redirected_by: Option<MergeHistoryId>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Full pre-merge state of an absorbed entity, sufficient to reconstruct it
/// byte-for-byte on undo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub entity_type: EntityType,
    pub display_name: String,
    pub normalized_name: String,
    pub description: Option<String>,
    pub properties: Map<String, Value>,
    pub external_ids: Vec<String>,
    pub source_document_id: Option<String>,
    pub source_text: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub phonetic_code: Option<String>,
    pub extraction_confidence: f64,
}

impl EntitySnapshot {
    pub fn of(entity: &Entity) -> Self {
        Self {
            entity_type: entity.entity_type.clone(),
            display_name: entity.display_name.clone(),
            normalized_name: entity.normalized_name.clone(),
            description: entity.description.clone(),
            properties: entity.properties.clone(),
            external_ids: entity.external_ids.clone(),
            source_document_id: entity.source_document_id.clone(),
            source_text: entity.source_text.clone(),
            embedding: entity.embedding.clone(),
            phonetic_code: entity.phonetic_code.clone(),
            extraction_confidence: entity.extraction_confidence,
        }
    }
}

/// One row per entity absorbed into a canonical entity.
///
/// Created exactly once per merge and immutable afterward, except that undo
/// marks it consumed. Original names are retained so "search by any
/// historical name" keeps working after the merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityAlias {
    pub id: AliasId,
    pub scope_id: ScopeId,

    /// The canonical entity the alias now belongs to
    pub canonical_id: EntityId,

    /// Original id of the absorbed entity
    pub original_entity_id: EntityId,

    /// Names at merge time, searchable as historical names
    pub original_display_name: String,
    pub original_normalized_name: String,

    /// Full pre-merge state of the absorbed entity
    pub snapshot: EntitySnapshot,

    /// The merge event that created this alias
    pub merge_history_id: MergeHistoryId,

    /// Set by undo; the row is retained for audit, never deleted
    pub consumed: bool,
    pub consumed_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

//------------------------------------------------------------------------------
// REVIEW QUEUE
//------------------------------------------------------------------------------

/// Lifecycle of a queued candidate pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewStatus {
    /// Awaiting a human decision
    Pending,

    /// Human confirmed; a merge was executed
    Approved,

    /// Human rejected; no merge performed
    Rejected,

    /// Pushed back into the queue at reduced priority
    Deferred,

    /// An operand no longer exists or is no longer canonical
    Expired,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Deferred => "deferred",
            Self::Expired => "expired",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "approved" => Self::Approved,
            "rejected" => Self::Rejected,
            "deferred" => Self::Deferred,
            "expired" => Self::Expired,
            _ => Self::Pending,
        }
    }

    /// Pending and deferred items accept human decisions; the rest are
    /// terminal.
    pub fn is_actionable(&self) -> bool {
        matches!(self, Self::Pending | Self::Deferred)
    }
}

/// A human decision supplied through the intake boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    Approve,
    Reject,
    Defer,
}

/// One row per candidate pair requiring human judgment.
///
/// Unique per (scope, entity_a, entity_b) with the pair stored in sorted
/// order; the same pair is never queued twice while a pending item exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeReviewItem {
    pub id: ReviewItemId,
    pub scope_id: ScopeId,

    /// Candidate pair, sorted so entity_a < entity_b
    pub entity_a: EntityId,
    pub entity_b: EntityId,

    /// Combined confidence from the scoring pipeline
    pub confidence: f64,

    /// Peaks for maximal uncertainty near the review-band midpoint
    pub priority: f64,

    /// Per-signal breakdown behind the combined confidence
    pub signal_breakdown: crate::models::scoring::SignalBreakdown,

    /// Blocking strategies that surfaced the pair
    pub blocking_strategies: Vec<String>,

    pub status: ReviewStatus,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

//------------------------------------------------------------------------------
// MERGE HISTORY
//------------------------------------------------------------------------------

/// Consolidation event kinds recorded in the history log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeEventType {
    EntitiesMerged,
    MergeUndone,
    EntitySplit,
}

impl MergeEventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::EntitiesMerged => "entities_merged",
            Self::MergeUndone => "merge_undone",
            Self::EntitySplit => "entity_split",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "merge_undone" => Self::MergeUndone,
            "entity_split" => Self::EntitySplit,
            _ => Self::EntitiesMerged,
        }
    }
}

/// Why a merge was executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeReason {
    /// Confidence reached the auto-merge threshold
    AutoHighConfidence,

    /// A human approved the pair from the review queue
    UserApproved,

    /// Part of a batch re-scoring sweep
    Batch,
}

impl MergeReason {
    pub fn as_str(&self) -> &str {
        match self {
            Self::AutoHighConfidence => "auto_high_confidence",
            Self::UserApproved => "user_approved",
            Self::Batch => "batch",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "user_approved" => Self::UserApproved,
            "batch" => Self::Batch,
            _ => Self::AutoHighConfidence,
        }
    }
}

/// One immutable row per consolidation event.
///
/// Append-only in spirit: an undo creates a new row and flips `undone` on
/// the original merge row, it never rewrites history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeHistory {
    pub id: MergeHistoryId,
    pub scope_id: ScopeId,
    pub event_type: MergeEventType,

    /// Surviving canonical entity; None where there no longer is one
    pub canonical_id: Option<EntityId>,

    /// Every entity id touched by the event
    pub affected_entity_ids: Vec<EntityId>,

    pub reason: MergeReason,

    /// Similarity snapshot at decision time, when the event had one
    pub score_snapshot: Option<crate::models::scoring::ScoreSnapshot>,

    /// Who triggered the event ("system" for auto merges)
    pub actor: String,

    /// Event-specific payload: pre-merge canonical properties, split
    /// reassignments, undo back-references
    pub details: Map<String, Value>,

    pub undone: bool,
    pub undone_by: Option<String>,
    pub undone_at: Option<DateTime<Utc>>,
    pub undo_reason: Option<String>,

    pub created_at: DateTime<Utc>,
}

/// Detail keys used inside `MergeHistory.details`.
pub mod history_details {
    /// Canonical entity's property map before the merge applied strategies.
    pub const CANONICAL_PROPERTIES_BEFORE: &str = "canonical_properties_before";
    /// Aliases of an absorbed entity re-pointed to the surviving canonical
    /// entity, keyed by entity id with the prior `canonical_of` as value.
    pub const REPOINTED_CHILDREN: &str = "repointed_children";
    /// Pre-merge endpoint state of every edge this merge redirected, keyed
    /// by relationship id. Undo restores exactly these fields.
    pub const EDGE_STATES_BEFORE: &str = "edge_states_before";
    /// History id of the merge an undo event reverses.
    pub const UNDOES_MERGE: &str = "undoes_merge";
    /// New entity created by a split.
    pub const SPLIT_NEW_ENTITY: &str = "split_new_entity";
    /// Property keys moved off the canonical entity by a split.
    pub const SPLIT_REASSIGNED_KEYS: &str = "split_reassigned_keys";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_type_folds_case_and_whitespace() {
        let t = EntityType::new("  Person ").unwrap();
        assert_eq!(t.as_str(), "person");
    }

    #[test]
    fn entity_type_rejects_empty() {
        assert!(EntityType::new("   ").is_err());
    }

    #[test]
    fn ordered_pair_is_stable() {
        let a = EntityId("b".into());
        let b = EntityId("a".into());
        assert_eq!(
            Entity::ordered_pair(&a, &b),
            Entity::ordered_pair(&b, &a)
        );
        assert_eq!(Entity::ordered_pair(&a, &b).0, b);
    }

    #[test]
    fn review_status_round_trips() {
        for status in [
            ReviewStatus::Pending,
            ReviewStatus::Approved,
            ReviewStatus::Rejected,
            ReviewStatus::Deferred,
            ReviewStatus::Expired,
        ] {
            assert_eq!(ReviewStatus::from_str(status.as_str()), status);
        }
    }
}
