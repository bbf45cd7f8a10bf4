//! Retrieval over annotated messages.
//!
//! Three queries share one filter shape ([`MessageFilter`]):
//!
//! - [`fetch_messages`]: filtered listing, newest first.
//! - [`top_tags`]: tag frequencies, count desc then canonical text asc.
//! - [`similarity_search`]: the query is embedded through the gateway and
//!   stored vectors are ranked by cosine distance in Rust.
//!
//! Limits are clamped to the configured default and maximum. A query that
//! cannot be embedded yields no hits rather than an error.

use anyhow::{bail, Result};
use chrono::NaiveDate;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;

use crate::aliases;
use crate::canonical::Canonicalizer;
use crate::config::{Config, RetrievalConfig};
use crate::db;
use crate::gateway::{self, AnnotationBackend, AnnotationRequest};
use crate::ingest::normalize_channel;
use crate::models::{MessageHit, SimilarHit, TagCount};
use crate::vector;

const SNIPPET_CHARS: usize = 240;

/// Optional filters applied by every retrieval query.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub channel: Option<String>,
    /// Canonical tag text, matched exactly.
    pub tag: Option<String>,
    /// Inclusive lower date bound.
    pub since: Option<NaiveDate>,
    /// Inclusive upper date bound.
    pub until: Option<NaiveDate>,
}

impl MessageFilter {
    /// Parse `YYYY-MM-DD` bounds as given on the command line.
    pub fn parse(
        channel: Option<String>,
        tag: Option<String>,
        since: Option<&str>,
        until: Option<&str>,
    ) -> Result<Self> {
        let since = since.map(parse_date).transpose()?;
        let until = until.map(parse_date).transpose()?;
        if let (Some(s), Some(u)) = (since, until) {
            if s > u {
                bail!("--since {} is after --until {}", s, u);
            }
        }
        Ok(Self {
            channel,
            tag,
            since,
            until,
        })
    }
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| anyhow::anyhow!("Invalid date '{}' (expected YYYY-MM-DD): {}", raw, e))
}

/// Requested limit, or the default when absent or non-positive, capped at `max`.
pub fn clamp_limit(requested: Option<i64>, default: i64, max: i64) -> i64 {
    match requested {
        Some(n) if n > 0 => n.min(max),
        _ => default.min(max),
    }
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, filter: &MessageFilter) {
    if let Some(channel) = &filter.channel {
        qb.push(" AND c.username = ")
            .push_bind(normalize_channel(channel));
    }
    if let Some(tag) = &filter.tag {
        qb.push(
            " AND EXISTS (SELECT 1 FROM message_tags ft JOIN tags t2 ON t2.id = ft.tag_id \
             WHERE ft.message_id = m.id AND t2.canonical = ",
        )
        .push_bind(tag.clone())
        .push(")");
    }
    if let Some(since) = filter.since {
        qb.push(" AND m.date >= ")
            .push_bind(since.format("%Y-%m-%d").to_string());
    }
    if let Some(until) = filter.until {
        qb.push(" AND m.date <= ")
            .push_bind(until.format("%Y-%m-%d").to_string());
    }
}

// ============ Structured fetch ============

/// Filtered messages, `ts` desc then id desc, with their tags attached.
///
/// `limit` is clamped to `limits.default_limit` / `limits.max_limit`.
pub async fn fetch_messages(
    pool: &SqlitePool,
    limits: &RetrievalConfig,
    filter: &MessageFilter,
    limit: Option<i64>,
    offset: i64,
) -> Result<Vec<MessageHit>> {
    let limit = clamp_limit(limit, limits.default_limit, limits.max_limit);
    let mut qb = QueryBuilder::<Sqlite>::new(
        r#"
        SELECT m.id, c.username AS channel, m.message_id, m.ts, m.date, m.permalink,
               m.content, m.views, m.emoji_line
        FROM messages m
        JOIN channels c ON c.id = m.channel_id
        WHERE 1 = 1
        "#,
    );
    push_filters(&mut qb, filter);
    qb.push(" ORDER BY m.ts DESC, m.id DESC LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset.max(0));

    let rows = qb.build().fetch_all(pool).await?;
    let mut hits: Vec<MessageHit> = rows
        .iter()
        .map(|row| MessageHit {
            id: row.get("id"),
            channel: row.get("channel"),
            message_id: row.get("message_id"),
            ts: row.get("ts"),
            date: row.get("date"),
            permalink: row.get("permalink"),
            content: row.get("content"),
            views: row.get("views"),
            emoji_line: row.get("emoji_line"),
            tags: Vec::new(),
        })
        .collect();

    let ids: Vec<i64> = hits.iter().map(|h| h.id).collect();
    let mut tags = tags_for(pool, &ids).await?;
    for hit in &mut hits {
        hit.tags = tags.remove(&hit.id).unwrap_or_default();
    }
    Ok(hits)
}

async fn tags_for(pool: &SqlitePool, ids: &[i64]) -> Result<HashMap<i64, Vec<String>>> {
    let mut map: HashMap<i64, Vec<String>> = HashMap::new();
    if ids.is_empty() {
        return Ok(map);
    }

    let mut qb = QueryBuilder::<Sqlite>::new(
        "SELECT mt.message_id, t.canonical FROM message_tags mt \
         JOIN tags t ON t.id = mt.tag_id WHERE mt.message_id IN (",
    );
    let mut list = qb.separated(", ");
    for id in ids {
        list.push_bind(*id);
    }
    qb.push(") ORDER BY mt.message_id, t.canonical");

    for row in qb.build().fetch_all(pool).await? {
        map.entry(row.get("message_id"))
            .or_default()
            .push(row.get("canonical"));
    }
    Ok(map)
}

// ============ Top tags ============

/// Tag frequencies over filtered messages.
///
/// Ties on count are ordered by the canonical text under SQLite's BINARY
/// collation, i.e. by code point.
pub async fn top_tags(
    pool: &SqlitePool,
    limits: &RetrievalConfig,
    filter: &MessageFilter,
    limit: Option<i64>,
) -> Result<Vec<TagCount>> {
    let limit = clamp_limit(limit, limits.top_tags_limit, limits.top_tags_max);
    let mut qb = QueryBuilder::<Sqlite>::new(
        r#"
        SELECT t.canonical, COUNT(*) AS cnt
        FROM message_tags mt
        JOIN tags t ON t.id = mt.tag_id
        JOIN messages m ON m.id = mt.message_id
        JOIN channels c ON c.id = m.channel_id
        WHERE 1 = 1
        "#,
    );
    push_filters(&mut qb, filter);
    qb.push(" GROUP BY t.id ORDER BY cnt DESC, t.canonical COLLATE BINARY ASC LIMIT ")
        .push_bind(limit);

    let rows = qb.build().fetch_all(pool).await?;
    Ok(rows
        .iter()
        .map(|row| TagCount {
            canonical: row.get("canonical"),
            count: row.get("cnt"),
        })
        .collect())
}

// ============ Similarity ============

/// Messages closest to `query` in embedding space.
///
/// Distance asc, then `ts` desc, then id asc. Stored vectors whose length
/// differs from the query vector are skipped. `min_score` drops hits whose
/// similarity `1 - distance` is below it; without one `limits.min_score`
/// applies.
pub async fn similarity_search(
    pool: &SqlitePool,
    gateway: &dyn AnnotationBackend,
    limits: &RetrievalConfig,
    query: &str,
    filter: &MessageFilter,
    min_score: Option<f64>,
    limit: Option<i64>,
) -> Result<Vec<SimilarHit>> {
    let limit = clamp_limit(limit, limits.similar_limit, limits.similar_max);
    let min_score = min_score.or(limits.min_score);
    let query = query.trim();
    if query.is_empty() {
        return Ok(Vec::new());
    }

    let query_vec = match gateway.annotate(&AnnotationRequest::embed(query)).await {
        Ok(result) => match result.into_embedding() {
            Some(v) => v,
            None => return Ok(Vec::new()),
        },
        Err(e) => {
            tracing::warn!(kind = e.kind(), error = %e, "search.embed_failed");
            return Ok(Vec::new());
        }
    };

    let mut qb = QueryBuilder::<Sqlite>::new(
        r#"
        SELECT m.id, c.username AS channel, m.message_id, m.ts, m.date, m.permalink,
               m.content, e.embedding
        FROM embeddings e
        JOIN messages m ON m.id = e.message_id
        JOIN channels c ON c.id = m.channel_id
        WHERE 1 = 1
        "#,
    );
    push_filters(&mut qb, filter);
    let rows = qb.build().fetch_all(pool).await?;

    let mut hits: Vec<SimilarHit> = Vec::new();
    for row in &rows {
        let blob: Vec<u8> = row.get("embedding");
        let Some(distance) = vector::cosine_distance(&query_vec, &vector::blob_to_vec(&blob))
        else {
            continue;
        };
        let score = 1.0 - distance;
        if min_score.is_some_and(|min| score < min) {
            continue;
        }
        let content: String = row.get("content");
        hits.push(SimilarHit {
            id: row.get("id"),
            channel: row.get("channel"),
            message_id: row.get("message_id"),
            ts: row.get("ts"),
            date: row.get("date"),
            permalink: row.get("permalink"),
            snippet: content.chars().take(SNIPPET_CHARS).collect(),
            distance,
            score,
        });
    }

    hits.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.ts.cmp(&a.ts))
            .then(a.id.cmp(&b.id))
    });
    hits.truncate(limit as usize);
    Ok(hits)
}

// ============ CLI ============

/// Resolve a user-typed tag to its canonical form.
async fn canonical_filter(
    config: &Config,
    pool: &SqlitePool,
    mut filter: MessageFilter,
) -> Result<MessageFilter> {
    if let Some(tag) = filter.tag.take() {
        let table = aliases::load_alias_table(&config.tagging, Some(pool)).await?;
        let canonicalizer = Canonicalizer::new(Arc::new(table))
            .with_fold(config.tagging.fold_aliases)
            .with_abbreviations(config.tagging.abbreviations.iter().cloned());
        filter.tag = Some(canonicalizer.canonicalize(&tag));
    }
    Ok(filter)
}

pub async fn run_fetch(
    config: &Config,
    filter: MessageFilter,
    limit: Option<i64>,
    offset: i64,
    json: bool,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let filter = canonical_filter(config, &pool, filter).await?;
    let hits = fetch_messages(&pool, &config.retrieval, &filter, limit, offset).await?;
    pool.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
        return Ok(());
    }
    if hits.is_empty() {
        println!("No messages.");
        return Ok(());
    }

    for hit in &hits {
        let emoji = hit.emoji_line.as_deref().unwrap_or("");
        println!("[{}] @{} #{} {}", hit.date, hit.channel, hit.message_id, emoji);
        if !hit.tags.is_empty() {
            println!("    tags: {}", hit.tags.join(", "));
        }
        if let Some(link) = &hit.permalink {
            println!("    url: {}", link);
        }
        let excerpt: String = hit.content.chars().take(SNIPPET_CHARS).collect();
        println!("    \"{}\"", excerpt.replace('\n', " ").trim());
        println!();
    }
    Ok(())
}

pub async fn run_top_tags(
    config: &Config,
    filter: MessageFilter,
    limit: Option<i64>,
    json: bool,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let filter = canonical_filter(config, &pool, filter).await?;
    let counts = top_tags(&pool, &config.retrieval, &filter, limit).await?;
    pool.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&counts)?);
        return Ok(());
    }
    if counts.is_empty() {
        println!("No tags.");
        return Ok(());
    }
    for (i, tc) in counts.iter().enumerate() {
        println!("{:>3}. {:<32} {:>6}", i + 1, tc.canonical, tc.count);
    }
    Ok(())
}

pub async fn run_search(
    config: &Config,
    query: &str,
    filter: MessageFilter,
    min_score: Option<f64>,
    limit: Option<i64>,
    json: bool,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let gateway = gateway::create_gateway(config)?;
    let hits = similarity_search(
        &pool,
        gateway.as_ref(),
        &config.retrieval,
        query,
        &filter,
        min_score,
        limit,
    )
    .await?;
    pool.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
        return Ok(());
    }
    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{}. [{:.3}] @{} #{} ({})",
            i + 1,
            hit.score,
            hit.channel,
            hit.message_id,
            hit.date
        );
        if let Some(link) = &hit.permalink {
            println!("    url: {}", link);
        }
        println!("    excerpt: \"{}\"", hit.snippet.replace('\n', " ").trim());
        println!();
    }
    Ok(())
}
