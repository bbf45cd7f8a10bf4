//! Database statistics and annotation progress.
//!
//! Shows how far tagging and embedding have got: totals, pending and
//! poisoned counts per track, and a per-channel breakdown. Used by
//! `chan stats` to confirm the worker is keeping up.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;

/// Progress of one annotation track.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrackStats {
    pub done: i64,
    pub pending: i64,
    pub poisoned: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub channel: String,
    pub messages: i64,
    pub tagged: i64,
    pub embedded: i64,
    pub last_fetched_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub channels: i64,
    pub messages: i64,
    pub tags: i64,
    pub tagging: TrackStats,
    pub embedding: TrackStats,
    pub by_channel: Vec<ChannelStats>,
}

/// Gather counts. Poisoned means unfinished with attempts at the ceiling.
pub async fn collect_stats(
    pool: &SqlitePool,
    tag_ceiling: i64,
    embed_ceiling: i64,
) -> Result<Stats> {
    let channels: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM channels")
        .fetch_one(pool)
        .await?;
    let tags: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tags")
        .fetch_one(pool)
        .await?;

    let row = sqlx::query(
        r#"
        SELECT
            COUNT(*) AS total,
            COALESCE(SUM(tags_processed = 1), 0) AS tag_done,
            COALESCE(SUM(tags_processed = 0 AND tag_attempts < ?), 0) AS tag_pending,
            COALESCE(SUM(tags_processed = 0 AND tag_attempts >= ?), 0) AS tag_poisoned,
            COALESCE(SUM(embedding_processed = 1), 0) AS emb_done,
            COALESCE(SUM(embedding_processed = 0 AND embedding_attempts < ?), 0) AS emb_pending,
            COALESCE(SUM(embedding_processed = 0 AND embedding_attempts >= ?), 0) AS emb_poisoned
        FROM messages
        "#,
    )
    .bind(tag_ceiling)
    .bind(tag_ceiling)
    .bind(embed_ceiling)
    .bind(embed_ceiling)
    .fetch_one(pool)
    .await?;

    let channel_rows = sqlx::query(
        r#"
        SELECT
            c.username,
            c.last_fetched_at,
            COUNT(m.id) AS messages,
            COALESCE(SUM(m.tags_processed = 1), 0) AS tagged,
            COALESCE(SUM(m.embedding_processed = 1), 0) AS embedded
        FROM channels c
        LEFT JOIN messages m ON m.channel_id = c.id
        GROUP BY c.id
        ORDER BY messages DESC, c.username ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(Stats {
        channels,
        messages: row.get("total"),
        tags,
        tagging: TrackStats {
            done: row.get("tag_done"),
            pending: row.get("tag_pending"),
            poisoned: row.get("tag_poisoned"),
        },
        embedding: TrackStats {
            done: row.get("emb_done"),
            pending: row.get("emb_pending"),
            poisoned: row.get("emb_poisoned"),
        },
        by_channel: channel_rows
            .iter()
            .map(|r| ChannelStats {
                channel: r.get("username"),
                messages: r.get("messages"),
                tagged: r.get("tagged"),
                embedded: r.get("embedded"),
                last_fetched_at: r.get("last_fetched_at"),
            })
            .collect(),
    })
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config, json: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let stats = collect_stats(
        &pool,
        config.tagging.max_attempts,
        config.embedding.max_attempts,
    )
    .await?;
    pool.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Channel Annotate — Database Stats");
    println!("=================================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Channels:    {}", stats.channels);
    println!("  Messages:    {}", stats.messages);
    println!("  Tags:        {}", stats.tags);
    println!();
    println!(
        "  Tagged:      {} / {} ({}%)  pending {}  poisoned {}",
        stats.tagging.done,
        stats.messages,
        percent(stats.tagging.done, stats.messages),
        stats.tagging.pending,
        stats.tagging.poisoned
    );
    println!(
        "  Embedded:    {} / {} ({}%)  pending {}  poisoned {}",
        stats.embedding.done,
        stats.messages,
        percent(stats.embedding.done, stats.messages),
        stats.embedding.pending,
        stats.embedding.poisoned
    );

    if !stats.by_channel.is_empty() {
        println!();
        println!("  By channel:");
        println!(
            "  {:<24} {:>8} {:>8} {:>10}   {}",
            "CHANNEL", "MSGS", "TAGGED", "EMBEDDED", "LAST FETCH"
        );
        println!("  {}", "-".repeat(76));

        for c in &stats.by_channel {
            let fetched = match c.last_fetched_at {
                Some(ts) => format_ts_relative(ts),
                None => "never".to_string(),
            };
            println!(
                "  {:<24} {:>8} {:>8} {:>10}   {}",
                c.channel, c.messages, c.tagged, c.embedded, fetched
            );
        }
    }

    println!();
    Ok(())
}

fn percent(part: i64, total: i64) -> i64 {
    if total > 0 {
        (part * 100) / total
    } else {
        0
    }
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Relative time like "3 hours ago"; absolute beyond a month.
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 || delta >= 86400 * 30 {
        return chrono::DateTime::from_timestamp(ts, 0)
            .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| ts.to_string());
    }

    let (n, unit) = match delta {
        d if d < 60 => return "just now".to_string(),
        d if d < 3600 => (d / 60, "min"),
        d if d < 86400 => (d / 3600, "hour"),
        d => (d / 86400, "day"),
    };
    format!("{} {}{} ago", n, unit, if n == 1 { "" } else { "s" })
}
