use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use consolidation_lib::models::core::{EntityId, ScopeId};
use consolidation_lib::models::scoring::ConsolidationRunStats;
use consolidation_lib::storage::postgres::{connect, PgStorage};
use consolidation_lib::storage::LoggingEventSink;
use consolidation_lib::utils::env::load_env;
use consolidation_lib::ConsolidationEngine;
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};

const BATCH_PAGE: usize = 500;
const BATCH_CONCURRENCY: usize = 8;

#[derive(Parser)]
#[command(
    name = "consolidate",
    about = "Entity consolidation: blocking, similarity scoring, reviewable merges"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one incremental consolidation pass for a single entity
    Entity {
        /// Id of the created/updated entity to score against the population
        #[arg(long)]
        id: String,
    },
    /// Re-score a scope's entire canonical population
    Scope {
        /// Scope (tenant) to sweep
        #[arg(long)]
        scope: String,
    },
    /// Expire review items whose operands are gone or no longer canonical
    Sweep {
        /// Scope (tenant) whose review queue to sweep
        #[arg(long)]
        scope: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    load_env();
    let cli = Cli::parse();

    let pool = connect().await.context("Failed to connect to database")?;
    info!("Successfully connected to the database");
    let store = Arc::new(PgStorage::new(pool));
    let engine = Arc::new(ConsolidationEngine::new(store, Arc::new(LoggingEventSink)));

    match cli.command {
        Command::Entity { id } => run_entity(&engine, EntityId(id)).await,
        Command::Scope { scope } => run_scope(&engine, ScopeId(scope)).await,
        Command::Sweep { scope } => run_sweep(&engine, ScopeId(scope)).await,
    }
}

async fn run_entity(engine: &ConsolidationEngine, id: EntityId) -> Result<()> {
    info!("Running consolidation pass for entity {}", id);
    let stats = engine.consolidate_entity(&id).await?;
    info!(
        "Pass complete: {} candidates, {} scored, {} auto-merged, {} queued, {} rejected in {:.2?}",
        stats.candidates_considered,
        stats.pairs_scored,
        stats.auto_merges,
        stats.queued_for_review,
        stats.rejected,
        stats.duration
    );
    Ok(())
}

async fn run_scope(engine: &Arc<ConsolidationEngine>, scope: ScopeId) -> Result<()> {
    let started = Instant::now();
    info!("Collecting canonical population for scope {}", scope);

    let mut ids: Vec<EntityId> = Vec::new();
    loop {
        let page = engine.canonical_page(&scope, ids.len(), BATCH_PAGE).await?;
        if page.is_empty() {
            break;
        }
        ids.extend(page);
    }
    info!("Scope {} has {} canonical entities", scope, ids.len());

    let pb = ProgressBar::new(ids.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("█▉▊▋▌▍▎▏  "),
    );
    pb.set_message("Scoring entities...");

    let results: Vec<_> = stream::iter(ids.iter())
        .map(|id| {
            let engine = Arc::clone(engine);
            let pb = pb.clone();
            async move {
                let result = engine.consolidate_entity(id).await;
                pb.inc(1);
                result
            }
        })
        .buffer_unordered(BATCH_CONCURRENCY)
        .collect()
        .await;
    pb.finish_with_message("Sweep complete");

    let mut totals = ConsolidationRunStats::default();
    for result in results {
        match result {
            Ok(stats) => totals.absorb(&stats),
            Err(err) => warn!("Entity pass failed: {}", err),
        }
    }

    info!("=== Consolidation Summary ===");
    info!("Scope: {}", scope);
    info!("Entities processed: {}", totals.entities_processed);
    info!("Candidate pairs considered: {}", totals.candidates_considered);
    info!("Pairs scored: {}", totals.pairs_scored);
    info!("Auto-merges: {}", totals.auto_merges);
    info!("Queued for review: {}", totals.queued_for_review);
    info!("Rejected: {}", totals.rejected);
    info!("Degraded pairs: {}", totals.degraded_pairs);
    info!("Total execution time: {:.2?}", started.elapsed());
    Ok(())
}

async fn run_sweep(engine: &ConsolidationEngine, scope: ScopeId) -> Result<()> {
    info!("Sweeping review queue for scope {}", scope);
    let expired = engine.expire_stale_reviews(&scope).await?;
    info!("Expired {} stale review item(s)", expired);
    Ok(())
}
