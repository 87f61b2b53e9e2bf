// src/lib.rs

//! Entity consolidation engine.
//!
//! Identifies which extracted entities represent the same real-world thing,
//! scores candidate pairs over heterogeneous similarity signals, and
//! executes reversible merge operations with full provenance. One fixed
//! pipeline: blocking -> fast similarity -> deep similarity -> weighted
//! decision -> execution.

pub mod blocking;
pub mod decision;
pub mod engine;
pub mod error;
pub mod merge;
pub mod models;
pub mod normalize;
pub mod review;
pub mod scoring;
pub mod similarity;
pub mod storage;
pub mod utils;

pub use engine::ConsolidationEngine;
pub use error::{ConsolidationError, Result};
pub use merge::{MergeService, PropertyReassignment};
pub use models::config::ConsolidationConfig;
pub use models::core::{
    Entity, EntityAlias, EntityId, EntityRelationship, EntityType, MergeHistory, MergeHistoryId,
    MergeReason, MergeReviewItem, ReviewDecision, ReviewItemId, ReviewStatus, ScopeId,
};
pub use models::scoring::{CandidateScore, MergeDecision, SignalBreakdown};
pub use review::ReviewQueue;
pub use storage::memory::{MemoryEventSink, MemoryStorage};
pub use storage::postgres::{connect, PgStorage};
pub use storage::{ConsolidationStore, EventSink, LoggingEventSink};
