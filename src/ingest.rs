//! Ingestion of scraped channel posts.
//!
//! Input is JSON lines, one [`RawMessage`] per line. Each record upserts
//! its channel and its message keyed on `(channel, message_id)`. A
//! re-ingested message whose text changed goes back to pending on both
//! annotation tracks; unchanged text keeps its annotation state.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::collections::BTreeSet;
use std::io::BufRead;
use std::path::Path;

use crate::config::Config;
use crate::db;
use crate::models::RawMessage;
use crate::text;

/// What [`ingest_messages`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub channels: usize,
}

/// Ingest a JSONL file, or stdin when `path` is `None` or `-`.
pub async fn run_ingest(config: &Config, path: Option<&Path>) -> Result<()> {
    let (messages, skipped) = match path {
        Some(p) if p != Path::new("-") => {
            let file = std::fs::File::open(p)
                .with_context(|| format!("Failed to open input: {}", p.display()))?;
            parse_jsonl(std::io::BufReader::new(file))?
        }
        _ => parse_jsonl(std::io::stdin().lock())?,
    };

    let pool = db::connect(config).await?;
    let report = ingest_messages(&pool, &messages).await?;

    println!("ingest");
    println!("  records: {}", messages.len());
    println!("  skipped lines: {}", skipped);
    println!("  inserted: {}", report.inserted);
    println!("  updated: {}", report.updated);
    println!("  unchanged: {}", report.unchanged);
    println!("  channels touched: {}", report.channels);
    println!("ok");

    pool.close().await;
    Ok(())
}

/// Parse JSON lines. Blank lines are ignored; malformed lines are logged
/// and counted, never fatal.
pub fn parse_jsonl<R: BufRead>(reader: R) -> Result<(Vec<RawMessage>, usize)> {
    let mut messages = Vec::new();
    let mut skipped = 0;

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<RawMessage>(line) {
            Ok(msg) if !msg.channel.trim().is_empty() => messages.push(msg),
            Ok(_) => {
                tracing::warn!(line = idx + 1, "ingest.skip: empty channel");
                skipped += 1;
            }
            Err(e) => {
                tracing::warn!(line = idx + 1, error = %e, "ingest.skip");
                skipped += 1;
            }
        }
    }

    Ok((messages, skipped))
}

/// Upsert channels and messages, then refresh per-channel aggregates.
pub async fn ingest_messages(pool: &SqlitePool, messages: &[RawMessage]) -> Result<IngestReport> {
    let mut report = IngestReport::default();
    let mut touched = BTreeSet::new();

    for msg in messages {
        let channel = normalize_channel(&msg.channel);
        let channel_id = upsert_channel(pool, &channel, msg).await?;
        touched.insert(channel_id);

        match upsert_message(pool, channel_id, &channel, msg).await? {
            Upsert::Inserted => report.inserted += 1,
            Upsert::Changed => report.updated += 1,
            Upsert::Unchanged => report.unchanged += 1,
        }
    }

    for channel_id in &touched {
        refresh_channel(pool, *channel_id).await?;
    }
    report.channels = touched.len();

    tracing::info!(
        inserted = report.inserted,
        updated = report.updated,
        unchanged = report.unchanged,
        "ingest.done"
    );
    Ok(report)
}

/// Channel usernames are stored without `@` and lowercased.
pub fn normalize_channel(raw: &str) -> String {
    raw.trim().trim_start_matches('@').to_lowercase()
}

/// Stable identity of a message's content.
pub fn content_hash(channel: &str, message_id: i64, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}:{}", channel, message_id, text).as_bytes());
    format!("{:x}", hasher.finalize())
}

enum Upsert {
    Inserted,
    Changed,
    Unchanged,
}

async fn upsert_channel(pool: &SqlitePool, username: &str, msg: &RawMessage) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO channels (username, title, category) VALUES (?, ?, ?)
        ON CONFLICT(username) DO UPDATE SET
            title = COALESCE(excluded.title, channels.title),
            category = COALESCE(excluded.category, channels.category)
        RETURNING id
        "#,
    )
    .bind(username)
    .bind(&msg.title)
    .bind(&msg.category)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

async fn upsert_message(
    pool: &SqlitePool,
    channel_id: i64,
    channel: &str,
    msg: &RawMessage,
) -> Result<Upsert> {
    let content = msg.text.trim();
    let hash = content_hash(channel, msg.message_id, content);

    let existing: Option<String> = sqlx::query_scalar(
        "SELECT content_hash FROM messages WHERE channel_id = ? AND message_id = ?",
    )
    .bind(channel_id)
    .bind(msg.message_id)
    .fetch_optional(pool)
    .await?;

    let outcome = match existing.as_deref() {
        None => Upsert::Inserted,
        Some(h) if h == hash => Upsert::Unchanged,
        Some(_) => Upsert::Changed,
    };

    let mut tx = pool.begin().await?;

    // Changed text resets both tracks; SET expressions see the old row.
    sqlx::query(
        r#"
        INSERT INTO messages (channel_id, message_id, ts, date, permalink, content, content_hash, word_count, views, forwards, raw_json)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(channel_id, message_id) DO UPDATE SET
            ts = excluded.ts,
            date = excluded.date,
            permalink = COALESCE(excluded.permalink, messages.permalink),
            views = COALESCE(excluded.views, messages.views),
            forwards = COALESCE(excluded.forwards, messages.forwards),
            raw_json = excluded.raw_json,
            tags_processed = CASE WHEN messages.content_hash = excluded.content_hash
                THEN messages.tags_processed ELSE 0 END,
            embedding_processed = CASE WHEN messages.content_hash = excluded.content_hash
                THEN messages.embedding_processed ELSE 0 END,
            tag_attempts = CASE WHEN messages.content_hash = excluded.content_hash
                THEN messages.tag_attempts ELSE 0 END,
            embedding_attempts = CASE WHEN messages.content_hash = excluded.content_hash
                THEN messages.embedding_attempts ELSE 0 END,
            content = excluded.content,
            content_hash = excluded.content_hash,
            word_count = excluded.word_count
        "#,
    )
    .bind(channel_id)
    .bind(msg.message_id)
    .bind(msg.ts.timestamp())
    .bind(msg.ts.format("%Y-%m-%d").to_string())
    .bind(&msg.permalink)
    .bind(content)
    .bind(&hash)
    .bind(text::word_count(content))
    .bind(msg.views)
    .bind(msg.forwards)
    .bind(serde_json::to_string(msg)?)
    .execute(&mut *tx)
    .await?;

    if matches!(outcome, Upsert::Changed) {
        // Annotations of the old text go with it.
        let row_id: i64 =
            sqlx::query_scalar("SELECT id FROM messages WHERE channel_id = ? AND message_id = ?")
                .bind(channel_id)
                .bind(msg.message_id)
                .fetch_one(&mut *tx)
                .await?;

        sqlx::query(
            r#"
            UPDATE messages SET
                emoji_line = NULL,
                emoji_json = NULL,
                code_json = NULL,
                last_tag_error = NULL,
                last_embedding_error = NULL
            WHERE id = ?
            "#,
        )
        .bind(row_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM message_tags WHERE message_id = ?")
            .bind(row_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM embeddings WHERE message_id = ?")
            .bind(row_id)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(outcome)
}

/// Move the channel cursor and recompute aggregates from stored rows.
async fn refresh_channel(pool: &SqlitePool, channel_id: i64) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE channels SET
            last_message_id = (SELECT MAX(message_id) FROM messages WHERE channel_id = channels.id),
            message_count = (SELECT COUNT(*) FROM messages WHERE channel_id = channels.id),
            avg_views = (SELECT AVG(views) FROM messages WHERE channel_id = channels.id),
            last_fetched_at = ?
        WHERE id = ?
        "#,
    )
    .bind(chrono::Utc::now().timestamp())
    .bind(channel_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_jsonl_skips_bad_lines() {
        let input = concat!(
            r#"{"channel":"@Markettwits","message_id":1,"ts":"2024-05-01T10:00:00Z","text":"ЦБ сохранил ставку"}"#,
            "\n\n",
            "not json\n",
            r#"{"channel":"","message_id":2,"ts":"2024-05-01T10:00:00Z"}"#,
            "\n",
        );
        let (messages, skipped) = parse_jsonl(input.as_bytes()).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(skipped, 2);
        assert_eq!(messages[0].message_id, 1);
        assert!(messages[0].views.is_none());
    }

    #[test]
    fn test_normalize_channel() {
        assert_eq!(normalize_channel(" @MarketTwits "), "markettwits");
        assert_eq!(normalize_channel("rbc_news"), "rbc_news");
    }

    #[test]
    fn test_content_hash_depends_on_identity_and_text() {
        let a = content_hash("c", 1, "text");
        assert_eq!(a, content_hash("c", 1, "text"));
        assert_ne!(a, content_hash("c", 2, "text"));
        assert_ne!(a, content_hash("c", 1, "other"));
        assert_eq!(a.len(), 64);
    }
}
