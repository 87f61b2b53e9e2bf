// src/merge/history.rs

//! Read side of the merge history log.
//!
//! The log itself is written only inside the transactional applications;
//! this service answers provenance queries over it.

use std::sync::Arc;

use crate::error::Result;
use crate::models::core::{EntityId, MergeHistory, MergeHistoryId, ScopeId};
use crate::storage::ConsolidationStore;

pub struct MergeHistoryService {
    store: Arc<dyn ConsolidationStore>,
}

impl MergeHistoryService {
    pub fn new(store: Arc<dyn ConsolidationStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, id: &MergeHistoryId) -> Result<Option<MergeHistory>> {
        self.store.get_history(id).await
    }

    /// Every merge/undo/split event whose affected set contains the entity,
    /// oldest first.
    pub async fn touching(&self, entity_id: &EntityId) -> Result<Vec<MergeHistory>> {
        self.store.history_touching(entity_id).await
    }

    pub async fn recent(&self, scope_id: &ScopeId, limit: usize) -> Result<Vec<MergeHistory>> {
        self.store.list_history(scope_id, limit).await
    }
}
