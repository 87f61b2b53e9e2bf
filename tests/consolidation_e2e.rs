//! End-to-end consolidation scenarios over the in-memory store.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use consolidation_lib::blocking::BlockingEngine;
use consolidation_lib::error::{ConsolidationError, InvariantError, ValidationError};
use consolidation_lib::models::config::{ConsolidationConfig, SignalWeights};
use consolidation_lib::models::core::{
    Entity, EntityId, EntityRelationship, EntityType, MergeEventType, MergeReason,
    RelationshipId, ReviewDecision, ReviewStatus, ScopeId,
};
use consolidation_lib::normalize::normalize_name;
use consolidation_lib::similarity::phonetic_code;
use consolidation_lib::storage::memory::{MemoryEventSink, MemoryStorage};
use consolidation_lib::storage::{EntityStore, RelationshipStore, ReviewStore};
use consolidation_lib::ConsolidationEngine;

fn harness() -> (Arc<ConsolidationEngine>, Arc<MemoryStorage>, Arc<MemoryEventSink>) {
    let store = Arc::new(MemoryStorage::new());
    let events = Arc::new(MemoryEventSink::new());
    let engine = Arc::new(ConsolidationEngine::new(store.clone(), events.clone()));
    (engine, store, events)
}

fn person(scope: &ScopeId, name: &str, embedding: Option<Vec<f32>>) -> Entity {
    let now = Utc::now();
    let normalized = normalize_name(name);
    Entity {
        id: EntityId::new_random(),
        scope_id: scope.clone(),
        entity_type: EntityType::new("person").unwrap(),
        display_name: name.to_string(),
        phonetic_code: phonetic_code(&normalized),
        normalized_name: normalized,
        description: None,
        properties: serde_json::Map::new(),
        external_ids: Vec::new(),
        source_document_id: None,
        source_text: None,
        embedding,
        extraction_confidence: 0.9,
        is_canonical: true,
        canonical_of: None,
        version: 0,
        created_at: now,
        updated_at: now,
    }
}

fn edge_between(
    scope: &ScopeId,
    source: &EntityId,
    target: &EntityId,
    kind: &str,
) -> EntityRelationship {
    let now = Utc::now();
    EntityRelationship {
        id: RelationshipId::new_random(),
        scope_id: scope.clone(),
        source_id: source.clone(),
        target_id: target.clone(),
        original_source_id: None,
        original_target_id: None,
        relationship_type: kind.to_string(),
        confidence: 1.0,
        properties: serde_json::Map::new(),
        suppressed: false,
        redirected_by: None,
        created_at: now,
        updated_at: now,
    }
}

/// Config where the combined confidence equals the embedding similarity
/// exactly, making pipeline outcomes predictable from the seeded vectors.
fn embedding_only_config(scope: &ScopeId) -> ConsolidationConfig {
    let mut config = ConsolidationConfig::default_for(scope.clone());
    config.graph_enabled = false;
    config.weights = SignalWeights {
        name: 0.0,
        phonetic: 0.0,
        embedding: 1.0,
        graph: 0.0,
    };
    config
}

#[tokio::test]
async fn robert_smith_auto_merges_with_rob_smith() {
    let (engine, store, events) = harness();
    let scope = ScopeId("default".into());

    // Embeddings with cosine similarity 0.95.
    let a = person(&scope, "Robert Smith", Some(vec![1.0, 0.0]));
    let b = person(&scope, "Rob Smith", Some(vec![0.95, 0.312_249_9]));
    store.insert_entity(&a).await.unwrap();
    store.insert_entity(&b).await.unwrap();

    let stats = engine.consolidate_entity(&a.id).await.unwrap();
    assert_eq!(stats.auto_merges, 1, "expected the pair to auto-merge");

    // Exactly one of the two survives as canonical, the other is its alias.
    let a_after = store.get_entity(&a.id).await.unwrap().unwrap();
    let b_after = store.get_entity(&b.id).await.unwrap().unwrap();
    let (canonical, alias) = if a_after.is_canonical {
        (a_after, b_after)
    } else {
        (b_after, a_after)
    };
    assert!(canonical.is_canonical);
    assert!(!alias.is_canonical);
    assert_eq!(alias.canonical_of.as_ref(), Some(&canonical.id));

    // A subsequent "find similar" query no longer surfaces the absorbed one.
    let similar = engine.find_similar(&canonical.id).await.unwrap();
    assert!(similar.is_empty(), "absorbed entity still surfaced: {similar:?}");

    // One merged history row listing both ids, one emitted event.
    let history = engine.history().touching(&a.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].event_type, MergeEventType::EntitiesMerged);
    assert_eq!(history[0].reason, MergeReason::AutoHighConfidence);
    assert!(history[0].affected_entity_ids.contains(&a.id));
    assert!(history[0].affected_entity_ids.contains(&b.id));
    assert!(history[0].score_snapshot.as_ref().unwrap().confidence >= 0.90);

    let emitted = events.emitted().await;
    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].event_type, MergeEventType::EntitiesMerged);
    assert!(!emitted[0].event_id.is_empty());
}

#[tokio::test]
async fn review_band_pair_queues_at_midpoint_priority_and_approval_merges() {
    let (engine, store, _events) = harness();
    let scope = ScopeId("review".into());
    store.set_config(embedding_only_config(&scope)).await;

    // Cosine ~0.4 puts the rescaled similarity at ~0.70, the midpoint of the
    // default 0.50/0.90 review band.
    let a = person(&scope, "Acme Corp", Some(vec![1.0, 0.0]));
    let b = person(&scope, "Acme Corp", Some(vec![0.4, 0.916_515_1]));
    store.insert_entity(&a).await.unwrap();
    store.insert_entity(&b).await.unwrap();

    let stats = engine.consolidate_entity(&a.id).await.unwrap();
    assert_eq!(stats.auto_merges, 0);
    assert_eq!(stats.queued_for_review, 1);

    let items = engine.reviews().next_items(&scope, 10).await.unwrap();
    assert_eq!(items.len(), 1);
    let item = &items[0];
    assert_eq!(item.status, ReviewStatus::Pending);
    assert!((item.confidence - 0.70).abs() < 1e-6);
    assert!(item.priority > 0.99, "midpoint pair should rank highest");
    assert!(item.signal_breakdown.embedding.is_some());
    // name, phonetic, and embedding were computed; graph was disabled.
    assert_eq!(item.signal_breakdown.present_count(), 3);

    // Approving executes the merge with reason user_approved.
    let decided = engine
        .apply_review_decision(&item.id, ReviewDecision::Approve, "reviewer-1", None)
        .await;
    assert!(decided.is_ok());
    let item_after = store.get_review_item(&item.id).await.unwrap().unwrap();
    assert_eq!(item_after.status, ReviewStatus::Approved);
    assert_eq!(item_after.decided_by.as_deref(), Some("reviewer-1"));

    let history = engine.history().touching(&a.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].event_type, MergeEventType::EntitiesMerged);
    assert_eq!(history[0].reason, MergeReason::UserApproved);
    assert!(history[0].affected_entity_ids.contains(&a.id));
    assert!(history[0].affected_entity_ids.contains(&b.id));
}

#[tokio::test]
async fn enqueue_is_idempotent_while_pending() {
    let (engine, store, _events) = harness();
    let scope = ScopeId("review".into());
    store.set_config(embedding_only_config(&scope)).await;

    let a = person(&scope, "Acme Corp", Some(vec![1.0, 0.0]));
    let b = person(&scope, "Acme Corp", Some(vec![0.4, 0.916_515_1]));
    store.insert_entity(&a).await.unwrap();
    store.insert_entity(&b).await.unwrap();

    let first = engine.consolidate_entity(&a.id).await.unwrap();
    assert_eq!(first.queued_for_review, 1);

    // Rediscovering the same pair does not re-queue it, scores and all.
    let second = engine.consolidate_entity(&a.id).await.unwrap();
    assert_eq!(second.queued_for_review, 0);
    let third = engine.consolidate_entity(&b.id).await.unwrap();
    assert_eq!(third.queued_for_review, 0);

    let items = engine.reviews().next_items(&scope, 10).await.unwrap();
    assert_eq!(items.len(), 1);
}

#[tokio::test]
async fn merging_into_an_alias_is_rejected() {
    let (engine, store, _events) = harness();
    let scope = ScopeId("default".into());

    let a = person(&scope, "Robert Smith", None);
    let b = person(&scope, "Bob Smith", None);
    let c = person(&scope, "Rob Smith", None);
    for entity in [&a, &b, &c] {
        store.insert_entity(entity).await.unwrap();
    }

    engine
        .merges()
        .merge(&c.id, &[a.id.clone()], MergeReason::Batch, None, "admin")
        .await
        .unwrap();

    // A is now an alias of C; merging into it must point the caller at C.
    let err = engine
        .merges()
        .merge(&a.id, &[b.id.clone()], MergeReason::Batch, None, "admin")
        .await
        .unwrap_err();
    match err {
        ConsolidationError::Validation(ValidationError::EntityNotCanonical {
            id,
            canonical,
        }) => {
            assert_eq!(id, a.id);
            assert_eq!(canonical, c.id);
        }
        other => panic!("expected EntityNotCanonical, got {other}"),
    }
}

#[tokio::test]
async fn undo_round_trips_premerge_state() {
    let (engine, store, events) = harness();
    let scope = ScopeId("default".into());

    let mut c = person(&scope, "Acme Corporation", None);
    c.properties = json!({"phone": "111", "kind": "org"})
        .as_object()
        .cloned()
        .unwrap();
    let mut a = person(&scope, "Acme Corp", None);
    a.properties = json!({"phone": "222", "email": "hello@acme.org"})
        .as_object()
        .cloned()
        .unwrap();
    store.insert_entity(&c).await.unwrap();
    store.insert_entity(&a).await.unwrap();

    let merge_id = engine
        .merges()
        .merge(
            &c.id,
            &[a.id.clone()],
            MergeReason::AutoHighConfidence,
            None,
            "system",
        )
        .await
        .unwrap();

    // Canonical keeps its phone (prefer-canonical default) and gains email.
    let c_merged = store.get_entity(&c.id).await.unwrap().unwrap();
    assert_eq!(c_merged.properties["phone"], json!("111"));
    assert_eq!(c_merged.properties["email"], json!("hello@acme.org"));

    engine
        .merges()
        .undo(&merge_id, "admin", Some("merged in error".into()))
        .await
        .unwrap();

    // The absorbed entity comes back byte-for-byte.
    let a_restored = store.get_entity(&a.id).await.unwrap().unwrap();
    assert!(a_restored.is_canonical);
    assert_eq!(a_restored.canonical_of, None);
    assert_eq!(a_restored.properties, a.properties);
    assert_eq!(a_restored.display_name, a.display_name);
    assert_eq!(a_restored.normalized_name, a.normalized_name);

    // The canonical side reverts every reversible field.
    let c_restored = store.get_entity(&c.id).await.unwrap().unwrap();
    assert_eq!(c_restored.properties, c.properties);

    // The alias row is consumed, not deleted; history keeps both events.
    let aliases = store.aliases_for_merge(&merge_id).await.unwrap();
    assert_eq!(aliases.len(), 1);
    assert!(aliases[0].consumed);
    assert_eq!(aliases[0].snapshot.properties, a.properties);
    assert_eq!(store.aliases_for_canonical(&c.id).await.unwrap().len(), 1);

    let original = engine.history().get(&merge_id).await.unwrap().unwrap();
    assert!(original.undone);
    assert_eq!(original.undone_by.as_deref(), Some("admin"));

    let history = engine.history().touching(&a.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].event_type, MergeEventType::MergeUndone);
    assert_eq!(engine.history().recent(&scope, 10).await.unwrap().len(), 2);

    let emitted = events.emitted().await;
    assert_eq!(emitted.len(), 2);
    assert_eq!(emitted[1].event_type, MergeEventType::MergeUndone);

    // A second undo of the same merge is rejected.
    let err = engine.merges().undo(&merge_id, "admin", None).await.unwrap_err();
    assert!(matches!(
        err,
        ConsolidationError::Validation(ValidationError::AlreadyUndone { .. })
    ));
}

#[tokio::test]
async fn exact_auto_merge_threshold_is_inclusive() {
    let (engine, store, _events) = harness();
    let scope = ScopeId("boundary".into());
    store.set_config(embedding_only_config(&scope)).await;

    // Cosine exactly 0.8 (|[1, 0.75]| = 1.25) rescales to exactly 0.90.
    let a = person(&scope, "Jane Doe", Some(vec![1.0, 0.0]));
    let b = person(&scope, "Jane Doe", Some(vec![1.0, 0.75]));
    store.insert_entity(&a).await.unwrap();
    store.insert_entity(&b).await.unwrap();

    let stats = engine.consolidate_entity(&a.id).await.unwrap();
    assert_eq!(stats.auto_merges, 1, "boundary pair must merge, not queue");
    assert_eq!(stats.queued_for_review, 0);
}

#[tokio::test]
async fn exact_review_threshold_queues_instead_of_rejecting() {
    let (engine, store, _events) = harness();
    let scope = ScopeId("boundary".into());
    store.set_config(embedding_only_config(&scope)).await;

    // Orthogonal vectors: cosine 0.0 rescales to exactly 0.50.
    let a = person(&scope, "Jane Doe", Some(vec![1.0, 0.0]));
    let b = person(&scope, "Jane Doe", Some(vec![0.0, 1.0]));
    store.insert_entity(&a).await.unwrap();
    store.insert_entity(&b).await.unwrap();

    let stats = engine.consolidate_entity(&a.id).await.unwrap();
    assert_eq!(stats.queued_for_review, 1, "boundary pair must queue");
    assert_eq!(stats.rejected, 0);

    // The band edge carries the lowest priority.
    let items = engine.reviews().next_items(&scope, 10).await.unwrap();
    assert_eq!(items.len(), 1);
    assert!(items[0].priority < 1e-6);
}

#[tokio::test]
async fn blocking_is_deterministic_under_truncation() {
    let (_engine, store, _events) = harness();
    let scope = ScopeId("default".into());
    let mut config = ConsolidationConfig::default_for(scope.clone());
    config.max_candidates = 3;

    let probe = person(&scope, "Robert Smith", None);
    store.insert_entity(&probe).await.unwrap();
    for _ in 0..6 {
        store
            .insert_entity(&person(&scope, "Robert Smith", None))
            .await
            .unwrap();
    }

    let blocking = BlockingEngine::new(store.clone());
    let first = blocking.candidates_for(&probe, &config).await.unwrap();
    let second = blocking.candidates_for(&probe, &config).await.unwrap();

    assert_eq!(first.len(), 3, "candidate set must be truncated to the cap");
    let first_ids: Vec<_> = first.iter().map(|c| c.entity_id.clone()).collect();
    let second_ids: Vec<_> = second.iter().map(|c| c.entity_id.clone()).collect();
    assert_eq!(first_ids, second_ids, "rerun must reproduce the same set");
}

#[tokio::test]
async fn chained_merge_repoints_aliases_and_undo_restores_them() {
    let (engine, store, _events) = harness();
    let scope = ScopeId("default".into());

    let a = person(&scope, "Robert Smith", None);
    let c = person(&scope, "Rob Smith", None);
    let d = person(&scope, "Bob Smith", None);
    for entity in [&a, &c, &d] {
        store.insert_entity(entity).await.unwrap();
    }

    // 1. a absorbed into c, then c absorbed into d.
    let merge_one = engine
        .merges()
        .merge(&c.id, &[a.id.clone()], MergeReason::Batch, None, "admin")
        .await
        .unwrap();
    let merge_two = engine
        .merges()
        .merge(&d.id, &[c.id.clone()], MergeReason::Batch, None, "admin")
        .await
        .unwrap();

    // 2. The alias graph never chains: a points straight at d.
    let a_after = store.get_entity(&a.id).await.unwrap().unwrap();
    assert_eq!(a_after.canonical_of.as_ref(), Some(&d.id));
    assert!(engine
        .history()
        .get(&merge_two)
        .await
        .unwrap()
        .unwrap()
        .affected_entity_ids
        .contains(&a.id));

    // 3. Undoing the buried merge is rejected: its canonical was absorbed.
    let err = engine.merges().undo(&merge_one, "admin", None).await.unwrap_err();
    assert!(matches!(
        err,
        ConsolidationError::Invariant(InvariantError::CanonicalSinceAbsorbed { .. })
    ));

    // 4. Undoing the top merge restores c and re-points a back to it.
    engine.merges().undo(&merge_two, "admin", None).await.unwrap();
    let c_after = store.get_entity(&c.id).await.unwrap().unwrap();
    assert!(c_after.is_canonical);
    let a_after = store.get_entity(&a.id).await.unwrap().unwrap();
    assert!(!a_after.is_canonical);
    assert_eq!(a_after.canonical_of.as_ref(), Some(&c.id));
}

#[tokio::test]
async fn edge_redirection_collapses_duplicates_and_undo_restores_them() {
    let (engine, store, _events) = harness();
    let scope = ScopeId("default".into());

    let a = person(&scope, "Robert Smith", None);
    let c = person(&scope, "Rob Smith", None);
    let x = person(&scope, "Jane Doe", None);
    for entity in [&a, &c, &x] {
        store.insert_entity(entity).await.unwrap();
    }
    let a_edge = edge_between(&scope, &a.id, &x.id, "works_with");
    let c_edge = edge_between(&scope, &c.id, &x.id, "works_with");
    let ac_edge = edge_between(&scope, &a.id, &c.id, "same_team");
    for edge in [&a_edge, &c_edge, &ac_edge] {
        store.insert_relationship(edge).await.unwrap();
    }

    let merge_id = engine
        .merges()
        .merge(&c.id, &[a.id.clone()], MergeReason::Batch, None, "admin")
        .await
        .unwrap();

    // a->x duplicates the surviving c->x edge; a->c collapses to a self-loop.
    // Both are suppressed, neither is deleted, and the projection sees only x.
    let neighbors = store.neighbor_ids(&c.id).await.unwrap();
    assert_eq!(neighbors.len(), 1);
    assert!(neighbors.contains(&x.id));

    let edges = store.edges_touching(&c.id).await.unwrap();
    assert_eq!(edges.len(), 3, "redirected edges are retained, not deleted");
    let suppressed = edges.iter().filter(|e| e.suppressed).count();
    assert_eq!(suppressed, 2);

    // Undo restores the original endpoints and clears the suppression.
    engine.merges().undo(&merge_id, "admin", None).await.unwrap();
    let restored = store.edges_touching(&a.id).await.unwrap();
    assert_eq!(restored.len(), 2);
    assert!(restored.iter().all(|e| !e.suppressed));
    assert!(restored
        .iter()
        .any(|e| e.id == a_edge.id && e.source_id == a.id && e.target_id == x.id));
    assert!(restored
        .iter()
        .any(|e| e.id == ac_edge.id && e.source_id == a.id && e.target_id == c.id));
}

#[tokio::test]
async fn expiry_sweep_expires_items_with_stale_operands() {
    let (engine, store, _events) = harness();
    let scope = ScopeId("review".into());
    store.set_config(embedding_only_config(&scope)).await;

    let a = person(&scope, "Acme Corp", Some(vec![1.0, 0.0]));
    let b = person(&scope, "Acme Corp", Some(vec![0.4, 0.916_515_1]));
    let c = person(&scope, "Acme Holdings", None);
    for entity in [&a, &b, &c] {
        store.insert_entity(entity).await.unwrap();
    }

    let stats = engine.consolidate_entity(&a.id).await.unwrap();
    assert_eq!(stats.queued_for_review, 1);
    let item_id = engine.reviews().next_items(&scope, 10).await.unwrap()[0]
        .id
        .clone();

    // An unrelated merge absorbs b, making the queued pair obsolete.
    engine
        .merges()
        .merge(&c.id, &[b.id.clone()], MergeReason::Batch, None, "admin")
        .await
        .unwrap();

    let expired = engine.expire_stale_reviews(&scope).await.unwrap();
    assert_eq!(expired, 1);
    let items = engine.reviews().next_items(&scope, 10).await.unwrap();
    assert!(items.is_empty());

    let item = store.get_review_item(&item_id).await.unwrap().unwrap();
    assert_eq!(item.status, ReviewStatus::Expired);

    // A decision on the expired item is rejected.
    let late_decision = engine
        .apply_review_decision(&item_id, ReviewDecision::Approve, "reviewer-1", None)
        .await;
    assert!(matches!(
        late_decision,
        Err(ConsolidationError::Validation(
            ValidationError::ReviewItemNotActionable { .. }
        ))
    ));
}

#[tokio::test]
async fn split_moves_properties_to_a_new_entity() {
    let (engine, store, _events) = harness();
    let scope = ScopeId("default".into());

    let mut c = person(&scope, "Acme Corporation", None);
    c.properties = json!({"phone": "111", "fax": "333", "kind": "org"})
        .as_object()
        .cloned()
        .unwrap();
    store.insert_entity(&c).await.unwrap();

    let reassignment = consolidation_lib::PropertyReassignment {
        new_display_name: "Acme Research".to_string(),
        new_entity_type: None,
        move_properties: vec!["fax".to_string()],
        assign_properties: json!({"kind": "lab"}).as_object().cloned().unwrap(),
    };
    let (new_id, history_id) = engine
        .merges()
        .split(&c.id, reassignment, "admin", Some("distinct division".into()))
        .await
        .unwrap();

    let canonical = store.get_entity(&c.id).await.unwrap().unwrap();
    assert!(canonical.properties.get("fax").is_none());
    assert_eq!(canonical.properties["phone"], json!("111"));

    let created = store.get_entity(&new_id).await.unwrap().unwrap();
    assert!(created.is_canonical);
    assert_eq!(created.display_name, "Acme Research");
    assert_eq!(created.properties["fax"], json!("333"));
    assert_eq!(created.properties["kind"], json!("lab"));

    let event = engine.history().get(&history_id).await.unwrap().unwrap();
    assert_eq!(event.event_type, MergeEventType::EntitySplit);
    assert!(event.affected_entity_ids.contains(&c.id));
    assert!(event.affected_entity_ids.contains(&new_id));
}

#[tokio::test]
async fn scope_sweep_consolidates_the_canonical_population() {
    let (engine, store, _events) = harness();
    let scope = ScopeId("default".into());

    let a = person(&scope, "Robert Smith", Some(vec![1.0, 0.0]));
    let b = person(&scope, "Rob Smith", Some(vec![0.95, 0.312_249_9]));
    let unrelated = person(&scope, "Wanda Maximoff", None);
    for entity in [&a, &b, &unrelated] {
        store.insert_entity(entity).await.unwrap();
    }

    let stats = engine.consolidate_scope(&scope).await.unwrap();
    assert_eq!(stats.auto_merges, 1);
    assert!(stats.entities_processed >= 1);

    // Two canonical entities remain: the merged pair's survivor and the
    // unrelated one.
    let canonical = engine.canonical_page(&scope, 0, 10).await.unwrap();
    assert_eq!(canonical.len(), 2);
}

#[tokio::test]
async fn historical_names_keep_resolving_after_merge() {
    let (engine, store, _events) = harness();
    let scope = ScopeId("default".into());

    let a = person(&scope, "Robert Smith", None);
    let c = person(&scope, "Rob Smith", None);
    store.insert_entity(&a).await.unwrap();
    store.insert_entity(&c).await.unwrap();

    engine
        .merges()
        .merge(&c.id, &[a.id.clone()], MergeReason::Batch, None, "admin")
        .await
        .unwrap();

    // Searching by the absorbed entity's old name lands on the canonical.
    let hits = store.search_names(&scope, "robert smith", 10).await.unwrap();
    assert_eq!(hits, vec![c.id.clone()]);
}
