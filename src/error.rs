//! Error types for the consolidation engine.
//!
//! Every fallible engine operation returns a `ConsolidationError`. The four
//! variants map to distinct caller behaviors: validation errors are reported
//! synchronously and never retried, conflicts are retried once internally
//! before surfacing, dependency errors degrade to the available signals, and
//! invariant violations are always rejected outright.

use thiserror::Error;

use crate::models::core::{EntityId, MergeHistoryId, ReviewItemId};

#[derive(Debug, Error)]
pub enum ConsolidationError {
    /// Malformed input, threshold misconfiguration, missing or non-canonical
    /// entities. Reported to the caller, never retried.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Concurrent merge activity on an overlapping entity set. Retried once
    /// internally; callers seeing this should re-submit.
    #[error("conflict: {0}")]
    Conflict(#[from] ConflictError),

    /// An optional external signal (embedding index, graph lookup) timed out
    /// or was unavailable. Recovered locally by omitting the signal unless
    /// the scope's config forbids degradation.
    #[error("dependency failure: {0}")]
    Dependency(#[from] DependencyError),

    /// A provenance-critical invariant would be broken. Always rejected.
    #[error("invariant violation: {0}")]
    Invariant(#[from] InvariantError),

    /// Storage-layer failure outside the taxonomy above.
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("entity not found: {id}")]
    EntityNotFound { id: EntityId },

    #[error("entity {id} is not canonical; resolve to its canonical entity {canonical} first")]
    EntityNotCanonical { id: EntityId, canonical: EntityId },

    #[error("entities {a} and {b} belong to different scopes")]
    ScopeMismatch { a: EntityId, b: EntityId },

    #[error("cannot merge entity {id} with itself")]
    SelfMerge { id: EntityId },

    #[error("merge requires at least one absorbed entity")]
    NoAbsorbedEntities,

    #[error("entity type cannot be empty")]
    EmptyEntityType,

    #[error("review threshold {review} must be strictly less than auto-merge threshold {auto}")]
    ThresholdOrder { review: f64, auto: f64 },

    #[error("threshold {value} is out of range [0.0, 1.0]")]
    ThresholdOutOfRange { value: f64 },

    #[error("similarity weight for '{signal}' is negative: {value}")]
    NegativeWeight { signal: String, value: f64 },

    #[error("review item not found: {id}")]
    ReviewItemNotFound { id: ReviewItemId },

    #[error("review item {id} is {status}; only pending or deferred items accept decisions")]
    ReviewItemNotActionable { id: ReviewItemId, status: String },

    #[error("merge history record not found: {id}")]
    HistoryNotFound { id: MergeHistoryId },

    #[error("history record {id} is a {event_type} event; only merges can be undone")]
    NotAMergeEvent { id: MergeHistoryId, event_type: String },

    #[error("merge {id} has already been undone")]
    AlreadyUndone { id: MergeHistoryId },

    #[error("split must reassign at least one property or supply a new display name")]
    EmptySplit,
}

#[derive(Debug, Error)]
pub enum ConflictError {
    #[error("version check failed for entity {id}: expected {expected}, found {found}")]
    VersionMismatch {
        id: EntityId,
        expected: i64,
        found: i64,
    },

    #[error("concurrent merge touching entities {ids:?}")]
    OverlappingMerge { ids: Vec<EntityId> },
}

#[derive(Debug, Error)]
pub enum DependencyError {
    #[error("blocking lookup timed out after {timeout_ms}ms")]
    BlockingTimeout { timeout_ms: u64 },

    #[error("{signal} similarity timed out after {timeout_ms}ms for pair ({a}, {b})")]
    SignalTimeout {
        signal: String,
        timeout_ms: u64,
        a: EntityId,
        b: EntityId,
    },

    #[error("{signal} signal unavailable: {reason}")]
    SignalUnavailable { signal: String, reason: String },
}

#[derive(Debug, Error)]
pub enum InvariantError {
    #[error(
        "cannot undo merge {merge_id}: canonical entity {canonical} was since absorbed into {absorbed_into}"
    )]
    CanonicalSinceAbsorbed {
        merge_id: MergeHistoryId,
        canonical: EntityId,
        absorbed_into: EntityId,
    },

    #[error("alias snapshot missing for entity {id} in merge {merge_id}")]
    AliasSnapshotMissing {
        id: EntityId,
        merge_id: MergeHistoryId,
    },

    #[error("entity {id} is non-canonical but has no canonical_of reference")]
    DanglingAlias { id: EntityId },
}

pub type Result<T> = std::result::Result<T, ConsolidationError>;

impl ConsolidationError {
    /// True when the operation may succeed on re-submission.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConsolidationError::Conflict(_))
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        ConsolidationError::Storage(err.to_string())
    }
}
