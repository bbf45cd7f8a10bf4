//! CLI entry points for annotation: one-shot batches, reset and the
//! long-running worker.

use anyhow::{bail, Result};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

use crate::aliases::{self, AliasStore};
use crate::config::Config;
use crate::db;
use crate::gateway;
use crate::models::TaskKind;
use crate::pipeline::{Annotator, BatchReport};
use crate::state::{self, ResetScope};

/// Wire the gateway and the alias table for `pool`.
pub async fn build_annotator(config: &Config, pool: SqlitePool) -> Result<Annotator> {
    let table = aliases::load_alias_table(&config.tagging, Some(&pool)).await?;
    let gateway = gateway::create_gateway(config)?;
    Ok(Annotator::new(
        config.clone(),
        pool,
        gateway,
        Arc::new(AliasStore::new(table)),
    ))
}

fn print_report(title: &str, report: &BatchReport) {
    println!("{}", title);
    println!("  selected: {}", report.selected);
    println!("  succeeded: {}", report.succeeded);
    if report.skipped > 0 {
        println!("  skipped (no backend call): {}", report.skipped);
    }
    println!("  failed: {}", report.failed);
    println!("  poisoned: {}", report.poisoned);
    if report.superseded > 0 {
        println!("  already done elsewhere: {}", report.superseded);
    }
    if report.storage_errors > 0 {
        println!("  storage errors: {}", report.storage_errors);
    }
}

pub async fn run_tag_pending(config: &Config, limit: Option<i64>) -> Result<()> {
    let pool = db::connect(config).await?;
    let annotator = build_annotator(config, pool.clone()).await?;
    let report = annotator.tag_pending(limit).await?;
    print_report("tag pending", &report);
    pool.close().await;
    Ok(())
}

pub async fn run_embed_pending(config: &Config, limit: Option<i64>) -> Result<()> {
    let pool = db::connect(config).await?;
    let annotator = build_annotator(config, pool.clone()).await?;
    let report = annotator.embed_pending(limit).await?;
    print_report("embed pending", &report);
    pool.close().await;
    Ok(())
}

/// Make unfinished messages eligible again. Either one message id or all
/// poisoned messages of the track.
pub async fn run_reset(
    config: &Config,
    task: TaskKind,
    message: Option<i64>,
    all_poisoned: bool,
) -> Result<()> {
    let scope = match (message, all_poisoned) {
        (Some(id), false) => ResetScope::Message(id),
        (None, true) => ResetScope::Poisoned {
            ceiling: match task {
                TaskKind::Tag => config.tagging.max_attempts,
                TaskKind::Embed => config.embedding.max_attempts,
            },
        },
        _ => bail!("Pass exactly one of --message <id> or --all-poisoned"),
    };

    let pool = db::connect(config).await?;
    let count = state::reset(&pool, task, scope).await?;
    pool.close().await;

    println!("reset {}", task);
    println!("  messages reset: {}", count);
    Ok(())
}

// ============ Worker ============

/// Run tagging and embedding cycles on their own intervals until Ctrl-C.
///
/// Each cycle keeps taking batches while the previous batch was full and
/// had no failures, so a backlog drains without waiting a full interval.
pub async fn run_worker(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let annotator = build_annotator(config, pool.clone()).await?;

    let mut tag_tick =
        tokio::time::interval(Duration::from_secs(config.worker.tagging_interval_secs.max(1)));
    let mut embed_tick = tokio::time::interval(Duration::from_secs(
        config.worker.embedding_interval_secs.max(1),
    ));

    tracing::info!(
        tagging_every = config.worker.tagging_interval_secs,
        embedding_every = config.worker.embedding_interval_secs,
        backend = %config.backend.primary,
        "worker.start"
    );
    println!("worker running (Ctrl-C to stop)");

    loop {
        tokio::select! {
            _ = tag_tick.tick() => {
                match annotator.aliases().reload(&config.tagging, Some(&pool)).await {
                    Ok(n) => tracing::debug!(aliases = n, "aliases.reload"),
                    Err(e) => tracing::warn!(error = %e, "aliases.reload_failed"),
                }
                drain(&annotator, TaskKind::Tag, config.tagging.batch_size).await;
            }
            _ = embed_tick.tick() => {
                drain(&annotator, TaskKind::Embed, config.embedding.batch_size).await;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("worker.stop");
                break;
            }
        }
    }

    pool.close().await;
    Ok(())
}

async fn drain(annotator: &Annotator, task: TaskKind, batch_size: i64) {
    loop {
        let result = match task {
            TaskKind::Tag => annotator.tag_pending(Some(batch_size)).await,
            TaskKind::Embed => annotator.embed_pending(Some(batch_size)).await,
        };
        match result {
            Ok(report) => {
                let full = report.selected as i64 >= batch_size;
                if !full || report.failed > 0 || report.storage_errors > 0 {
                    break;
                }
            }
            Err(e) => {
                tracing::error!(task = %task, error = %e, "worker.cycle_failed");
                break;
            }
        }
    }
}
