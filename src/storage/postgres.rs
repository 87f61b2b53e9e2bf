// src/storage/postgres.rs

//! PostgreSQL implementation of the store contracts.
//!
//! Expects the `consolidation` schema with tables `entity`,
//! `entity_relationship`, `entity_alias`, `merge_review_item`,
//! `merge_history`, and `scope_config`, plus the `pg_trgm` extension (fuzzy
//! name blocking) and `vector` (embedding nearest-neighbor blocking). The
//! review queue's idempotent enqueue leans on a partial unique index over
//! (scope_id, entity_a, entity_b) for actionable statuses.
//!
//! Transactional applications take row locks in sorted id order and compare
//! optimistic versions before writing; a mismatch surfaces as a conflict for
//! the merge service to retry.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bb8::Pool;
use bb8_postgres::PostgresConnectionManager;
use log::info;
use tokio_postgres::{Config, GenericClient, NoTls, Row as PgRow, Transaction};
use pgvector::Vector;
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};

use crate::error::{ConflictError, ConsolidationError, Result};
use crate::models::config::ConsolidationConfig;
use crate::models::core::{
    AliasId, Entity, EntityAlias, EntityId, EntityRelationship, EntitySnapshot, EntityType,
    MergeEventType, MergeHistory, MergeHistoryId, MergeReason, MergeReviewItem, RelationshipId,
    ReviewItemId, ReviewStatus, ScopeId,
};
use crate::storage::{
    ConfigProvider, EntityLookup, EntityStore, EntityVersion, HistoryStore, MergeApplication,
    RelationshipStore, ReviewStore, SplitApplication, TransactionalStore, UndoApplication,
};

pub type PgPool = Pool<PostgresConnectionManager<NoTls>>;

/// Reads POSTGRES_* environment variables and constructs the connection
/// config.
fn build_pg_config() -> Config {
    let mut config = Config::new();
    let host = std::env::var("POSTGRES_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = std::env::var("POSTGRES_PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(5432);
    let dbname = std::env::var("POSTGRES_DB").unwrap_or_else(|_| "consolidation".to_string());
    let user = std::env::var("POSTGRES_USER").unwrap_or_else(|_| "postgres".to_string());
    let password = std::env::var("POSTGRES_PASSWORD").unwrap_or_default();

    info!(
        "DB Config: Host={}, Port={}, DB={}, User={}",
        host, port, dbname, user
    );
    config
        .host(&host)
        .port(port)
        .dbname(&dbname)
        .user(&user)
        .password(&password);
    config.application_name("entity_consolidation");
    config.connect_timeout(Duration::from_secs(10));
    config
}

/// Initializes the database connection pool.
pub async fn connect() -> anyhow::Result<PgPool> {
    let config = build_pg_config();
    info!("Connecting to PostgreSQL database...");
    let manager = PostgresConnectionManager::new(config, NoTls);

    let pool = Pool::builder()
        .max_size(20)
        .min_idle(Some(2))
        .idle_timeout(Some(Duration::from_secs(180)))
        .connection_timeout(Duration::from_secs(15))
        .build(manager)
        .await
        .context("Failed to build database connection pool")?;

    let conn = pool
        .get()
        .await
        .context("Failed to get test connection from pool")?;
    conn.query_one("SELECT 1", &[])
        .await
        .context("Test query 'SELECT 1' failed")?;
    drop(conn);
    info!("Database connection pool initialized successfully.");
    Ok(pool)
}

pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn client(&self) -> Result<bb8::PooledConnection<'_, PostgresConnectionManager<NoTls>>> {
        self.pool.get().await.map_err(ConsolidationError::storage)
    }
}

fn entity_from_row(row: &PgRow) -> Result<Entity> {
    let entity_type: String = row.get("entity_type");
    let properties: Value = row.get("properties");
    let embedding: Option<Vec<f32>> = row
        .get::<_, Option<Vector>>("embedding")
        .map(|v| v.to_vec());
    Ok(Entity {
        id: EntityId(row.get("id")),
        scope_id: ScopeId(row.get("scope_id")),
        entity_type: EntityType::new(&entity_type).map_err(ConsolidationError::storage)?,
        display_name: row.get("display_name"),
        normalized_name: row.get("normalized_name"),
        description: row.get("description"),
        properties: properties.as_object().cloned().unwrap_or_default(),
        external_ids: row.get("external_ids"),
        source_document_id: row.get("source_document_id"),
        source_text: row.get("source_text"),
        embedding,
        phonetic_code: row.get("phonetic_code"),
        extraction_confidence: row.get("extraction_confidence"),
        is_canonical: row.get("is_canonical"),
        canonical_of: row.get::<_, Option<String>>("canonical_of").map(EntityId),
        version: row.get("version"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn relationship_from_row(row: &PgRow) -> EntityRelationship {
    let properties: Value = row.get("properties");
    EntityRelationship {
        id: RelationshipId(row.get("id")),
        scope_id: ScopeId(row.get("scope_id")),
        source_id: EntityId(row.get("source_id")),
        target_id: EntityId(row.get("target_id")),
        original_source_id: row
            .get::<_, Option<String>>("original_source_id")
            .map(EntityId),
        original_target_id: row
            .get::<_, Option<String>>("original_target_id")
            .map(EntityId),
        relationship_type: row.get("relationship_type"),
        confidence: row.get("confidence"),
        properties: properties.as_object().cloned().unwrap_or_default(),
        suppressed: row.get("suppressed"),
        redirected_by: row
            .get::<_, Option<String>>("redirected_by")
            .map(MergeHistoryId),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn alias_from_row(row: &PgRow) -> Result<EntityAlias> {
    let snapshot: Value = row.get("snapshot");
    let snapshot: EntitySnapshot =
        serde_json::from_value(snapshot).map_err(ConsolidationError::storage)?;
    Ok(EntityAlias {
        id: AliasId(row.get("id")),
        scope_id: ScopeId(row.get("scope_id")),
        canonical_id: EntityId(row.get("canonical_id")),
        original_entity_id: EntityId(row.get("original_entity_id")),
        original_display_name: row.get("original_display_name"),
        original_normalized_name: row.get("original_normalized_name"),
        snapshot,
        merge_history_id: MergeHistoryId(row.get("merge_history_id")),
        consumed: row.get("consumed"),
        consumed_at: row.get("consumed_at"),
        created_at: row.get("created_at"),
    })
}

fn review_item_from_row(row: &PgRow) -> Result<MergeReviewItem> {
    let breakdown: Value = row.get("signal_breakdown");
    let status: String = row.get("status");
    Ok(MergeReviewItem {
        id: ReviewItemId(row.get("id")),
        scope_id: ScopeId(row.get("scope_id")),
        entity_a: EntityId(row.get("entity_a")),
        entity_b: EntityId(row.get("entity_b")),
        confidence: row.get("confidence"),
        priority: row.get("priority"),
        signal_breakdown: serde_json::from_value(breakdown)
            .map_err(ConsolidationError::storage)?,
        blocking_strategies: row.get("blocking_strategies"),
        status: ReviewStatus::from_str(&status),
        decided_by: row.get("decided_by"),
        decided_at: row.get("decided_at"),
        notes: row.get("notes"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn history_from_row(row: &PgRow) -> Result<MergeHistory> {
    let event_type: String = row.get("event_type");
    let reason: String = row.get("reason");
    let details: Value = row.get("details");
    let score_snapshot = match row.get::<_, Option<Value>>("score_snapshot") {
        Some(value) => Some(serde_json::from_value(value).map_err(ConsolidationError::storage)?),
        None => None,
    };
    Ok(MergeHistory {
        id: MergeHistoryId(row.get("id")),
        scope_id: ScopeId(row.get("scope_id")),
        event_type: MergeEventType::from_str(&event_type),
        canonical_id: row.get::<_, Option<String>>("canonical_id").map(EntityId),
        affected_entity_ids: row
            .get::<_, Vec<String>>("affected_entity_ids")
            .into_iter()
            .map(EntityId)
            .collect(),
        reason: MergeReason::from_str(&reason),
        score_snapshot,
        actor: row.get("actor"),
        details: details.as_object().cloned().unwrap_or_default(),
        undone: row.get("undone"),
        undone_by: row.get("undone_by"),
        undone_at: row.get("undone_at"),
        undo_reason: row.get("undo_reason"),
        created_at: row.get("created_at"),
    })
}

fn config_from_row(row: &PgRow) -> Result<ConsolidationConfig> {
    let weights: Value = row.get("weights");
    let strategies: Value = row.get("property_strategies");
    Ok(ConsolidationConfig {
        scope_id: ScopeId(row.get("scope_id")),
        auto_merge_threshold: row.get("auto_merge_threshold"),
        review_threshold: row.get("review_threshold"),
        max_group_size: row.get::<_, i32>("max_group_size") as usize,
        max_candidates: row.get::<_, i32>("max_candidates") as usize,
        embedding_enabled: row.get("embedding_enabled"),
        graph_enabled: row.get("graph_enabled"),
        auto_consolidation_enabled: row.get("auto_consolidation_enabled"),
        strict_signals: row.get("strict_signals"),
        weights: serde_json::from_value(weights).map_err(ConsolidationError::storage)?,
        property_strategies: serde_json::from_value(strategies)
            .map_err(ConsolidationError::storage)?,
    })
}

async fn write_entity_row<C: GenericClient>(client: &C, entity: &Entity) -> Result<()> {
    let properties = Value::Object(entity.properties.clone());
    let embedding = entity.embedding.clone().map(Vector::from);
    let canonical_of = entity.canonical_of.as_ref().map(|id| id.0.as_str());
    client
        .execute(
            "INSERT INTO consolidation.entity
                 (id, scope_id, entity_type, display_name, normalized_name, description,
                  properties, external_ids, source_document_id, source_text, embedding,
                  phonetic_code, extraction_confidence, is_canonical, canonical_of,
                  version, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
             ON CONFLICT (id) DO UPDATE SET
                 entity_type = EXCLUDED.entity_type,
                 display_name = EXCLUDED.display_name,
                 normalized_name = EXCLUDED.normalized_name,
                 description = EXCLUDED.description,
                 properties = EXCLUDED.properties,
                 external_ids = EXCLUDED.external_ids,
                 source_document_id = EXCLUDED.source_document_id,
                 source_text = EXCLUDED.source_text,
                 embedding = EXCLUDED.embedding,
                 phonetic_code = EXCLUDED.phonetic_code,
                 extraction_confidence = EXCLUDED.extraction_confidence,
                 is_canonical = EXCLUDED.is_canonical,
                 canonical_of = EXCLUDED.canonical_of,
                 version = EXCLUDED.version,
                 updated_at = EXCLUDED.updated_at",
            &[
                &entity.id.0,
                &entity.scope_id.0,
                &entity.entity_type.as_str(),
                &entity.display_name,
                &entity.normalized_name,
                &entity.description,
                &properties,
                &entity.external_ids,
                &entity.source_document_id,
                &entity.source_text,
                &embedding,
                &entity.phonetic_code,
                &entity.extraction_confidence,
                &entity.is_canonical,
                &canonical_of,
                &entity.version,
                &entity.created_at,
                &entity.updated_at,
            ],
        )
        .await
        .map_err(ConsolidationError::storage)?;
    Ok(())
}

async fn write_relationship_row<C: GenericClient>(
    client: &C,
    edge: &EntityRelationship,
) -> Result<()> {
    let properties = Value::Object(edge.properties.clone());
    let original_source = edge.original_source_id.as_ref().map(|id| id.0.as_str());
    let original_target = edge.original_target_id.as_ref().map(|id| id.0.as_str());
    let redirected_by = edge.redirected_by.as_ref().map(|id| id.0.as_str());
    client
        .execute(
            "INSERT INTO consolidation.entity_relationship
                 (id, scope_id, source_id, target_id, original_source_id,
                  original_target_id, relationship_type, confidence, properties,
                  suppressed, redirected_by, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
             ON CONFLICT (id) DO UPDATE SET
                 source_id = EXCLUDED.source_id,
                 target_id = EXCLUDED.target_id,
                 original_source_id = EXCLUDED.original_source_id,
                 original_target_id = EXCLUDED.original_target_id,
                 relationship_type = EXCLUDED.relationship_type,
                 confidence = EXCLUDED.confidence,
                 properties = EXCLUDED.properties,
                 suppressed = EXCLUDED.suppressed,
                 redirected_by = EXCLUDED.redirected_by,
                 updated_at = EXCLUDED.updated_at",
            &[
                &edge.id.0,
                &edge.scope_id.0,
                &edge.source_id.0,
                &edge.target_id.0,
                &original_source,
                &original_target,
                &edge.relationship_type,
                &edge.confidence,
                &properties,
                &edge.suppressed,
                &redirected_by,
                &edge.created_at,
                &edge.updated_at,
            ],
        )
        .await
        .map_err(ConsolidationError::storage)?;
    Ok(())
}

async fn write_alias_row<C: GenericClient>(client: &C, alias: &EntityAlias) -> Result<()> {
    let snapshot = serde_json::to_value(&alias.snapshot).map_err(ConsolidationError::storage)?;
    client
        .execute(
            "INSERT INTO consolidation.entity_alias
                 (id, scope_id, canonical_id, original_entity_id, original_display_name,
                  original_normalized_name, snapshot, merge_history_id, consumed,
                  consumed_at, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            &[
                &alias.id.0,
                &alias.scope_id.0,
                &alias.canonical_id.0,
                &alias.original_entity_id.0,
                &alias.original_display_name,
                &alias.original_normalized_name,
                &snapshot,
                &alias.merge_history_id.0,
                &alias.consumed,
                &alias.consumed_at,
                &alias.created_at,
            ],
        )
        .await
        .map_err(ConsolidationError::storage)?;
    Ok(())
}

async fn write_history_row<C: GenericClient>(client: &C, history: &MergeHistory) -> Result<()> {
    let canonical_id = history.canonical_id.as_ref().map(|id| id.0.as_str());
    let affected: Vec<String> = history
        .affected_entity_ids
        .iter()
        .map(|id| id.0.clone())
        .collect();
    let score_snapshot = match &history.score_snapshot {
        Some(snapshot) => {
            Some(serde_json::to_value(snapshot).map_err(ConsolidationError::storage)?)
        }
        None => None,
    };
    let details = Value::Object(history.details.clone());
    client
        .execute(
            "INSERT INTO consolidation.merge_history
                 (id, scope_id, event_type, canonical_id, affected_entity_ids, reason,
                  score_snapshot, actor, details, undone, undone_by, undone_at,
                  undo_reason, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
            &[
                &history.id.0,
                &history.scope_id.0,
                &history.event_type.as_str(),
                &canonical_id,
                &affected,
                &history.reason.as_str(),
                &score_snapshot,
                &history.actor,
                &details,
                &history.undone,
                &history.undone_by,
                &history.undone_at,
                &history.undo_reason,
                &history.created_at,
            ],
        )
        .await
        .map_err(ConsolidationError::storage)?;
    Ok(())
}

/// Locks the expected rows in sorted id order and compares versions. Sorted
/// acquisition keeps two overlapping transactions from deadlocking in the
/// database the same way the service's keyed locks do in process.
async fn lock_and_check_versions(
    tx: &Transaction<'_>,
    expected: &[EntityVersion],
) -> Result<()> {
    let mut sorted: Vec<&EntityVersion> = expected.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));
    sorted.dedup_by(|a, b| a.id == b.id);
    for ev in sorted {
        let row = tx
            .query_opt(
                "SELECT version FROM consolidation.entity WHERE id = $1 FOR UPDATE",
                &[&ev.id.0],
            )
            .await
            .map_err(ConsolidationError::storage)?;
        let found = row.map(|r| r.get::<_, i64>("version")).unwrap_or(-1);
        if found != ev.version {
            return Err(ConflictError::VersionMismatch {
                id: ev.id.clone(),
                expected: ev.version,
                found,
            }
            .into());
        }
    }
    Ok(())
}

#[async_trait]
impl EntityStore for PgStorage {
    async fn get_entity(&self, id: &EntityId) -> Result<Option<Entity>> {
        let conn = self.client().await?;
        let row = conn
            .query_opt("SELECT * FROM consolidation.entity WHERE id = $1", &[&id.0])
            .await
            .map_err(ConsolidationError::storage)?;
        row.map(|r| entity_from_row(&r)).transpose()
    }

    async fn get_entities(&self, ids: &[EntityId]) -> Result<Vec<Entity>> {
        let conn = self.client().await?;
        let id_strings: Vec<String> = ids.iter().map(|id| id.0.clone()).collect();
        let rows = conn
            .query(
                "SELECT * FROM consolidation.entity WHERE id = ANY($1) ORDER BY id",
                &[&id_strings],
            )
            .await
            .map_err(ConsolidationError::storage)?;
        rows.iter().map(entity_from_row).collect()
    }

    async fn insert_entity(&self, entity: &Entity) -> Result<()> {
        let conn = self.client().await?;
        write_entity_row(&*conn, entity).await
    }

    async fn update_entity(&self, entity: &Entity, expected_version: i64) -> Result<()> {
        let mut conn = self.client().await?;
        let tx = conn
            .transaction()
            .await
            .map_err(ConsolidationError::storage)?;
        lock_and_check_versions(
            &tx,
            &[EntityVersion {
                id: entity.id.clone(),
                version: expected_version,
            }],
        )
        .await?;
        write_entity_row(&tx, entity).await?;
        tx.commit().await.map_err(ConsolidationError::storage)
    }

    async fn lookup_entity_ids(
        &self,
        lookup: &EntityLookup,
        limit: usize,
    ) -> Result<Vec<EntityId>> {
        let conn = self.client().await?;
        let limit = limit as i64;
        let rows = match lookup {
            EntityLookup::PhoneticCode {
                scope_id,
                entity_type,
                code,
            } => {
                conn.query(
                    "SELECT id FROM consolidation.entity
                     WHERE scope_id = $1 AND entity_type = $2 AND phonetic_code = $3
                       AND is_canonical
                     ORDER BY id LIMIT $4",
                    &[&scope_id.0, &entity_type.as_str(), &code, &limit],
                )
                .await
            }
            EntityLookup::NormalizedName {
                scope_id,
                entity_type,
                normalized_name,
            } => {
                conn.query(
                    "SELECT id FROM consolidation.entity
                     WHERE scope_id = $1 AND entity_type = $2 AND normalized_name = $3
                       AND is_canonical
                     ORDER BY id LIMIT $4",
                    &[&scope_id.0, &entity_type.as_str(), &normalized_name, &limit],
                )
                .await
            }
            EntityLookup::NameFuzzy {
                scope_id,
                normalized_name,
            } => {
                conn.query(
                    "SELECT id FROM consolidation.entity
                     WHERE scope_id = $1 AND is_canonical AND normalized_name % $2
                     ORDER BY similarity(normalized_name, $2) DESC, id LIMIT $3",
                    &[&scope_id.0, &normalized_name, &limit],
                )
                .await
            }
            EntityLookup::SourceDocument {
                scope_id,
                source_document_id,
            } => {
                conn.query(
                    "SELECT id FROM consolidation.entity
                     WHERE scope_id = $1 AND source_document_id = $2 AND is_canonical
                     ORDER BY id LIMIT $3",
                    &[&scope_id.0, &source_document_id, &limit],
                )
                .await
            }
            EntityLookup::EmbeddingNeighbors {
                scope_id,
                entity_type,
                embedding,
                k,
            } => {
                let probe = Vector::from(embedding.clone());
                let k = (*k as i64).min(limit);
                conn.query(
                    "SELECT id FROM consolidation.entity
                     WHERE scope_id = $1 AND entity_type = $2 AND is_canonical
                       AND embedding IS NOT NULL
                     ORDER BY embedding <=> $3, id LIMIT $4",
                    &[&scope_id.0, &entity_type.as_str(), &probe, &k],
                )
                .await
            }
        }
        .map_err(ConsolidationError::storage)?;
        Ok(rows.iter().map(|r| EntityId(r.get("id"))).collect())
    }

    async fn list_canonical(
        &self,
        scope_id: &ScopeId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<EntityId>> {
        let conn = self.client().await?;
        let rows = conn
            .query(
                "SELECT id FROM consolidation.entity
                 WHERE scope_id = $1 AND is_canonical
                 ORDER BY id OFFSET $2 LIMIT $3",
                &[&scope_id.0, &(offset as i64), &(limit as i64)],
            )
            .await
            .map_err(ConsolidationError::storage)?;
        Ok(rows.iter().map(|r| EntityId(r.get("id"))).collect())
    }

    async fn aliases_for_canonical(&self, canonical_id: &EntityId) -> Result<Vec<EntityAlias>> {
        let conn = self.client().await?;
        let rows = conn
            .query(
                "SELECT * FROM consolidation.entity_alias
                 WHERE canonical_id = $1 ORDER BY created_at, id",
                &[&canonical_id.0],
            )
            .await
            .map_err(ConsolidationError::storage)?;
        rows.iter().map(alias_from_row).collect()
    }

    async fn aliases_for_merge(&self, merge_id: &MergeHistoryId) -> Result<Vec<EntityAlias>> {
        let conn = self.client().await?;
        let rows = conn
            .query(
                "SELECT * FROM consolidation.entity_alias
                 WHERE merge_history_id = $1 ORDER BY created_at, id",
                &[&merge_id.0],
            )
            .await
            .map_err(ConsolidationError::storage)?;
        rows.iter().map(alias_from_row).collect()
    }

    async fn alias_children(&self, canonical_id: &EntityId) -> Result<Vec<Entity>> {
        let conn = self.client().await?;
        let rows = conn
            .query(
                "SELECT * FROM consolidation.entity WHERE canonical_of = $1 ORDER BY id",
                &[&canonical_id.0],
            )
            .await
            .map_err(ConsolidationError::storage)?;
        rows.iter().map(entity_from_row).collect()
    }

    async fn search_names(
        &self,
        scope_id: &ScopeId,
        normalized_query: &str,
        limit: usize,
    ) -> Result<Vec<EntityId>> {
        let conn = self.client().await?;
        let limit_param = limit as i64;
        let mut hits: BTreeSet<EntityId> = BTreeSet::new();

        let rows = conn
            .query(
                "SELECT id FROM consolidation.entity
                 WHERE scope_id = $1 AND is_canonical
                   AND normalized_name LIKE '%' || $2 || '%'
                 ORDER BY id LIMIT $3",
                &[&scope_id.0, &normalized_query, &limit_param],
            )
            .await
            .map_err(ConsolidationError::storage)?;
        hits.extend(rows.iter().map(|r| EntityId(r.get("id"))));

        // Historical names resolve through the alias row's canonical entity
        // to whatever canonical record survives today.
        let rows = conn
            .query(
                "SELECT DISTINCT COALESCE(e.canonical_of, e.id) AS resolved
                 FROM consolidation.entity_alias a
                 JOIN consolidation.entity e ON e.id = a.canonical_id
                 WHERE a.scope_id = $1 AND NOT a.consumed
                   AND a.original_normalized_name LIKE '%' || $2 || '%'
                 LIMIT $3",
                &[&scope_id.0, &normalized_query, &limit_param],
            )
            .await
            .map_err(ConsolidationError::storage)?;
        hits.extend(rows.iter().map(|r| EntityId(r.get("resolved"))));

        Ok(hits.into_iter().take(limit).collect())
    }
}

#[async_trait]
impl RelationshipStore for PgStorage {
    async fn edges_touching(&self, entity_id: &EntityId) -> Result<Vec<EntityRelationship>> {
        let conn = self.client().await?;
        let rows = conn
            .query(
                "SELECT * FROM consolidation.entity_relationship
                 WHERE source_id = $1 OR target_id = $1
                 ORDER BY id",
                &[&entity_id.0],
            )
            .await
            .map_err(ConsolidationError::storage)?;
        Ok(rows.iter().map(relationship_from_row).collect())
    }

    async fn neighbor_ids(&self, entity_id: &EntityId) -> Result<HashSet<EntityId>> {
        let conn = self.client().await?;
        let rows = conn
            .query(
                "SELECT CASE WHEN source_id = $1 THEN target_id ELSE source_id END AS neighbor
                 FROM consolidation.entity_relationship
                 WHERE (source_id = $1 OR target_id = $1) AND NOT suppressed",
                &[&entity_id.0],
            )
            .await
            .map_err(ConsolidationError::storage)?;
        Ok(rows.iter().map(|r| EntityId(r.get("neighbor"))).collect())
    }

    async fn insert_relationship(&self, relationship: &EntityRelationship) -> Result<()> {
        let conn = self.client().await?;
        write_relationship_row(&*conn, relationship).await
    }
}

#[async_trait]
impl ReviewStore for PgStorage {
    async fn enqueue_review_if_absent(&self, item: &MergeReviewItem) -> Result<bool> {
        let conn = self.client().await?;
        let breakdown = serde_json::to_value(&item.signal_breakdown)
            .map_err(ConsolidationError::storage)?;
        // The partial unique index over actionable items makes this a
        // single-statement idempotent enqueue: 0 rows means a pending or
        // deferred item for the pair already exists.
        let inserted = conn
            .execute(
                "INSERT INTO consolidation.merge_review_item
                     (id, scope_id, entity_a, entity_b, confidence, priority,
                      signal_breakdown, blocking_strategies, status, decided_by,
                      decided_at, notes, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                 ON CONFLICT (scope_id, entity_a, entity_b)
                     WHERE status IN ('pending', 'deferred')
                     DO NOTHING",
                &[
                    &item.id.0,
                    &item.scope_id.0,
                    &item.entity_a.0,
                    &item.entity_b.0,
                    &item.confidence,
                    &item.priority,
                    &breakdown,
                    &item.blocking_strategies,
                    &item.status.as_str(),
                    &item.decided_by,
                    &item.decided_at,
                    &item.notes,
                    &item.created_at,
                    &item.updated_at,
                ],
            )
            .await
            .map_err(ConsolidationError::storage)?;
        Ok(inserted > 0)
    }

    async fn get_review_item(&self, id: &ReviewItemId) -> Result<Option<MergeReviewItem>> {
        let conn = self.client().await?;
        let row = conn
            .query_opt(
                "SELECT * FROM consolidation.merge_review_item WHERE id = $1",
                &[&id.0],
            )
            .await
            .map_err(ConsolidationError::storage)?;
        row.map(|r| review_item_from_row(&r)).transpose()
    }

    async fn update_review_item(&self, item: &MergeReviewItem) -> Result<()> {
        let conn = self.client().await?;
        let breakdown = serde_json::to_value(&item.signal_breakdown)
            .map_err(ConsolidationError::storage)?;
        conn.execute(
            "UPDATE consolidation.merge_review_item
             SET confidence = $1, priority = $2, signal_breakdown = $3,
                 blocking_strategies = $4, status = $5, decided_by = $6,
                 decided_at = $7, notes = $8, updated_at = $9
             WHERE id = $10",
            &[
                &item.confidence,
                &item.priority,
                &breakdown,
                &item.blocking_strategies,
                &item.status.as_str(),
                &item.decided_by,
                &item.decided_at,
                &item.notes,
                &item.updated_at,
                &item.id.0,
            ],
        )
        .await
        .map_err(ConsolidationError::storage)?;
        Ok(())
    }

    async fn list_actionable(
        &self,
        scope_id: &ScopeId,
        limit: usize,
    ) -> Result<Vec<MergeReviewItem>> {
        let conn = self.client().await?;
        let rows = conn
            .query(
                "SELECT * FROM consolidation.merge_review_item
                 WHERE scope_id = $1 AND status IN ('pending', 'deferred')
                 ORDER BY CASE WHEN status = 'pending' THEN 0 ELSE 1 END,
                          priority DESC, created_at, id
                 LIMIT $2",
                &[&scope_id.0, &(limit as i64)],
            )
            .await
            .map_err(ConsolidationError::storage)?;
        rows.iter().map(review_item_from_row).collect()
    }
}

#[async_trait]
impl HistoryStore for PgStorage {
    async fn get_history(&self, id: &MergeHistoryId) -> Result<Option<MergeHistory>> {
        let conn = self.client().await?;
        let row = conn
            .query_opt(
                "SELECT * FROM consolidation.merge_history WHERE id = $1",
                &[&id.0],
            )
            .await
            .map_err(ConsolidationError::storage)?;
        row.map(|r| history_from_row(&r)).transpose()
    }

    async fn history_touching(&self, entity_id: &EntityId) -> Result<Vec<MergeHistory>> {
        let conn = self.client().await?;
        let rows = conn
            .query(
                "SELECT * FROM consolidation.merge_history
                 WHERE affected_entity_ids @> ARRAY[$1]
                 ORDER BY created_at, id",
                &[&entity_id.0],
            )
            .await
            .map_err(ConsolidationError::storage)?;
        rows.iter().map(history_from_row).collect()
    }

    async fn list_history(&self, scope_id: &ScopeId, limit: usize) -> Result<Vec<MergeHistory>> {
        let conn = self.client().await?;
        let rows = conn
            .query(
                "SELECT * FROM consolidation.merge_history
                 WHERE scope_id = $1
                 ORDER BY created_at DESC, id DESC
                 LIMIT $2",
                &[&scope_id.0, &(limit as i64)],
            )
            .await
            .map_err(ConsolidationError::storage)?;
        rows.iter().map(history_from_row).collect()
    }
}

#[async_trait]
impl TransactionalStore for PgStorage {
    async fn apply_merge(&self, application: MergeApplication) -> Result<()> {
        let mut conn = self.client().await?;
        let tx = conn
            .transaction()
            .await
            .map_err(ConsolidationError::storage)?;
        lock_and_check_versions(&tx, &application.expected_versions).await?;

        write_entity_row(&tx, &application.canonical_update).await?;
        for absorbed in &application.absorbed_updates {
            write_entity_row(&tx, absorbed).await?;
        }
        for alias in &application.aliases {
            write_alias_row(&tx, alias).await?;
        }
        for edge in &application.edge_updates {
            write_relationship_row(&tx, edge).await?;
        }
        write_history_row(&tx, &application.history).await?;

        tx.commit().await.map_err(ConsolidationError::storage)
    }

    async fn apply_undo(&self, application: UndoApplication) -> Result<()> {
        let mut conn = self.client().await?;
        let tx = conn
            .transaction()
            .await
            .map_err(ConsolidationError::storage)?;
        lock_and_check_versions(&tx, &application.expected_versions).await?;

        for restored in &application.restored_entities {
            write_entity_row(&tx, restored).await?;
        }
        let consumed: Vec<String> = application
            .consumed_alias_ids
            .iter()
            .map(|id| id.0.clone())
            .collect();
        tx.execute(
            "UPDATE consolidation.entity_alias
             SET consumed = TRUE, consumed_at = $1
             WHERE id = ANY($2)",
            &[&application.undone_at, &consumed],
        )
        .await
        .map_err(ConsolidationError::storage)?;
        for edge in &application.edge_updates {
            write_relationship_row(&tx, edge).await?;
        }
        tx.execute(
            "UPDATE consolidation.merge_history
             SET undone = TRUE, undone_by = $1, undone_at = $2, undo_reason = $3
             WHERE id = $4",
            &[
                &application.undone_by,
                &application.undone_at,
                &application.undo_reason,
                &application.undone_history_id.0,
            ],
        )
        .await
        .map_err(ConsolidationError::storage)?;
        write_history_row(&tx, &application.history).await?;

        tx.commit().await.map_err(ConsolidationError::storage)
    }

    async fn apply_split(&self, application: SplitApplication) -> Result<()> {
        let mut conn = self.client().await?;
        let tx = conn
            .transaction()
            .await
            .map_err(ConsolidationError::storage)?;
        lock_and_check_versions(&tx, &application.expected_versions).await?;

        write_entity_row(&tx, &application.new_entity).await?;
        write_entity_row(&tx, &application.canonical_update).await?;
        write_history_row(&tx, &application.history).await?;

        tx.commit().await.map_err(ConsolidationError::storage)
    }
}

#[async_trait]
impl ConfigProvider for PgStorage {
    async fn config_for_scope(&self, scope_id: &ScopeId) -> Result<ConsolidationConfig> {
        let conn = self.client().await?;
        let row = conn
            .query_opt(
                "SELECT * FROM consolidation.scope_config WHERE scope_id = $1",
                &[&scope_id.0],
            )
            .await
            .map_err(ConsolidationError::storage)?;
        match row {
            Some(row) => config_from_row(&row),
            None => Ok(ConsolidationConfig::default_for(scope_id.clone())),
        }
    }
}
