//! Per-message annotation state and its persisted transitions.
//!
//! Each message carries two independent tracks, tagging and embedding.
//! A track is in one of four states:
//!
//! ```text
//!            select              success
//! Pending ───────────▶ Processing ────────▶ Done
//!    ▲                     │
//!    │  failure,           │ failure,
//!    │  attempts < ceiling │ attempts >= ceiling
//!    └─────────────────────┤
//!                          ▼
//!                       Poisoned ──(chan reset)──▶ Pending
//! ```
//!
//! `Processing` only exists in memory while a batch runs. The persisted
//! form is `*_processed` plus the attempt counter, so every transition
//! below is a single UPDATE (or one transaction) with the counter
//! incremented inside SQL.

use anyhow::Result;
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::gateway::TagPayload;
use crate::models::TaskKind;
use crate::vector;

/// State of one annotation track of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationState {
    Pending { attempts: i64 },
    Processing { attempts: i64 },
    Done { attempts: i64 },
    Poisoned { attempts: i64 },
}

impl AnnotationState {
    /// Derive the state from persisted columns.
    pub fn from_row(processed: bool, attempts: i64, ceiling: i64) -> Self {
        if processed {
            Self::Done { attempts }
        } else if attempts >= ceiling {
            Self::Poisoned { attempts }
        } else {
            Self::Pending { attempts }
        }
    }

    pub fn attempts(&self) -> i64 {
        match *self {
            Self::Pending { attempts }
            | Self::Processing { attempts }
            | Self::Done { attempts }
            | Self::Poisoned { attempts } => attempts,
        }
    }

    pub fn is_eligible(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }

    /// Pending → Processing. Other states are returned unchanged.
    pub fn begin(self) -> Self {
        match self {
            Self::Pending { attempts } => Self::Processing { attempts },
            other => other,
        }
    }

    /// Processing → Done, counting the attempt.
    pub fn succeed(self) -> Self {
        match self {
            Self::Processing { attempts } => Self::Done {
                attempts: attempts + 1,
            },
            other => other,
        }
    }

    /// Processing → Pending or Poisoned, counting the attempt.
    pub fn fail(self, ceiling: i64) -> Self {
        match self {
            Self::Processing { attempts } => Self::from_row(false, attempts + 1, ceiling),
            other => other,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending { .. } => "pending",
            Self::Processing { .. } => "processing",
            Self::Done { .. } => "done",
            Self::Poisoned { .. } => "poisoned",
        }
    }
}

/// A message selected for annotation.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub id: i64,
    pub channel: String,
    pub message_id: i64,
    pub content: String,
    pub attempts: i64,
}

impl PendingMessage {
    pub fn state(&self) -> AnnotationState {
        AnnotationState::Pending {
            attempts: self.attempts,
        }
    }
}

// ============ Selection ============

/// Newest eligible messages for a track, at most `limit`.
///
/// With `require_tags`, embedding only considers tagged messages.
pub async fn fetch_pending(
    pool: &SqlitePool,
    kind: TaskKind,
    ceiling: i64,
    limit: i64,
    require_tags: bool,
) -> Result<Vec<PendingMessage>> {
    let gate = if kind == TaskKind::Embed && require_tags {
        "AND m.tags_processed = 1"
    } else {
        ""
    };
    let sql = format!(
        r#"
        SELECT m.id, c.username AS channel, m.message_id, m.content, m.{attempts} AS attempts
        FROM messages m
        JOIN channels c ON c.id = m.channel_id
        WHERE m.{processed} = 0 AND m.{attempts} < ? {gate}
        ORDER BY m.ts DESC, m.id DESC
        LIMIT ?
        "#,
        attempts = kind.attempts_column(),
        processed = kind.processed_column(),
        gate = gate,
    );

    let rows = sqlx::query(&sql)
        .bind(ceiling)
        .bind(limit)
        .fetch_all(pool)
        .await?;

    Ok(rows
        .iter()
        .map(|row| PendingMessage {
            id: row.get("id"),
            channel: row.get("channel"),
            message_id: row.get("message_id"),
            content: row.get("content"),
            attempts: row.get("attempts"),
        })
        .collect())
}

/// Current state of one track, or `None` for an unknown message.
pub async fn message_state(
    pool: &SqlitePool,
    kind: TaskKind,
    id: i64,
    ceiling: i64,
) -> Result<Option<AnnotationState>> {
    let sql = format!(
        "SELECT {processed} AS processed, {attempts} AS attempts FROM messages WHERE id = ?",
        processed = kind.processed_column(),
        attempts = kind.attempts_column(),
    );
    let row = sqlx::query(&sql).bind(id).fetch_optional(pool).await?;

    Ok(row.map(|row| {
        let processed: i64 = row.get("processed");
        AnnotationState::from_row(processed != 0, row.get("attempts"), ceiling)
    }))
}

// ============ Transitions ============

/// Insert the tag if absent and return its id.
pub async fn upsert_tag(conn: &mut SqliteConnection, canonical: &str) -> Result<i64> {
    sqlx::query(
        "INSERT INTO tags (canonical, created_at) VALUES (?, ?) ON CONFLICT(canonical) DO NOTHING",
    )
    .bind(canonical)
    .bind(chrono::Utc::now().timestamp())
    .execute(&mut *conn)
    .await?;

    let id: i64 = sqlx::query_scalar("SELECT id FROM tags WHERE canonical = ?")
        .bind(canonical)
        .fetch_one(&mut *conn)
        .await?;
    Ok(id)
}

/// Link a message to a tag. A repeated pair updates provenance only.
pub async fn upsert_message_tag(
    conn: &mut SqliteConnection,
    message_id: i64,
    tag_id: i64,
    source: &str,
    confidence: Option<f64>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO message_tags (message_id, tag_id, source, confidence)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(message_id, tag_id) DO UPDATE SET
            source = excluded.source,
            confidence = excluded.confidence
        "#,
    )
    .bind(message_id)
    .bind(tag_id)
    .bind(source)
    .bind(confidence)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Tagging succeeded: store tags and signals, mark the track done.
pub async fn record_tag_success(
    pool: &SqlitePool,
    message_id: i64,
    canonical_tags: &[String],
    source: &str,
    payload: &TagPayload,
) -> Result<()> {
    let emoji_json = if payload.emoji.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&payload.emoji)?)
    };
    let code_json = if payload.code.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&payload.code)?)
    };

    let mut tx = pool.begin().await?;

    for canonical in canonical_tags {
        let tag_id = upsert_tag(&mut tx, canonical).await?;
        upsert_message_tag(&mut tx, message_id, tag_id, source, None).await?;
    }

    sqlx::query(
        r#"
        UPDATE messages SET
            tags_processed = 1,
            tag_attempts = tag_attempts + 1,
            last_tag_error = NULL,
            emoji_line = ?,
            emoji_json = ?,
            code_json = ?
        WHERE id = ?
        "#,
    )
    .bind(payload.emoji_line())
    .bind(emoji_json)
    .bind(code_json)
    .bind(message_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Embedding succeeded: overwrite the stored vector, mark the track done.
pub async fn record_embedding_success(
    pool: &SqlitePool,
    message_id: i64,
    model: &str,
    embedding: &[f32],
) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO embeddings (message_id, model, dims, embedding, created_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(message_id) DO UPDATE SET
            model = excluded.model,
            dims = excluded.dims,
            embedding = excluded.embedding,
            created_at = excluded.created_at
        "#,
    )
    .bind(message_id)
    .bind(model)
    .bind(embedding.len() as i64)
    .bind(vector::vec_to_blob(embedding))
    .bind(chrono::Utc::now().timestamp())
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        UPDATE messages SET
            embedding_processed = 1,
            embedding_attempts = embedding_attempts + 1,
            last_embedding_error = NULL
        WHERE id = ?
        "#,
    )
    .bind(message_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Count a failed attempt and keep the error. Returns the new count, or
/// `None` when the track already finished (a late failure from an
/// overlapping run leaves a done message untouched).
pub async fn record_failure(
    pool: &SqlitePool,
    kind: TaskKind,
    message_id: i64,
    error: &str,
) -> Result<Option<i64>> {
    let sql = format!(
        "UPDATE messages SET {attempts} = {attempts} + 1, {error_col} = ? \
         WHERE id = ? AND {processed} = 0 RETURNING {attempts}",
        attempts = kind.attempts_column(),
        error_col = kind.error_column(),
        processed = kind.processed_column(),
    );
    let attempts: Option<i64> = sqlx::query_scalar(&sql)
        .bind(error)
        .bind(message_id)
        .fetch_optional(pool)
        .await?;
    Ok(attempts)
}

/// Which messages a reset applies to.
#[derive(Debug, Clone, Copy)]
pub enum ResetScope {
    /// One message, whatever its attempt count.
    Message(i64),
    /// Every message at or above the ceiling.
    Poisoned { ceiling: i64 },
}

/// Clear attempts and errors on unfinished messages so they are selected
/// again. Finished messages are never touched.
pub async fn reset(pool: &SqlitePool, kind: TaskKind, scope: ResetScope) -> Result<u64> {
    let (filter, value) = match scope {
        ResetScope::Message(id) => ("id = ?", id),
        ResetScope::Poisoned { ceiling } => (
            match kind {
                TaskKind::Tag => "tag_attempts >= ?",
                TaskKind::Embed => "embedding_attempts >= ?",
            },
            ceiling,
        ),
    };
    let sql = format!(
        "UPDATE messages SET {attempts} = 0, {error_col} = NULL WHERE {processed} = 0 AND {filter}",
        attempts = kind.attempts_column(),
        error_col = kind.error_column(),
        processed = kind.processed_column(),
        filter = filter,
    );

    let done = sqlx::query(&sql).bind(value).execute(pool).await?;
    Ok(done.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_row() {
        assert_eq!(
            AnnotationState::from_row(false, 0, 3),
            AnnotationState::Pending { attempts: 0 }
        );
        assert_eq!(
            AnnotationState::from_row(false, 3, 3),
            AnnotationState::Poisoned { attempts: 3 }
        );
        assert_eq!(
            AnnotationState::from_row(true, 7, 3),
            AnnotationState::Done { attempts: 7 }
        );
    }

    #[test]
    fn test_failure_below_ceiling_returns_to_pending() {
        let s = AnnotationState::Pending { attempts: 0 }.begin();
        assert_eq!(s.label(), "processing");
        assert_eq!(s.fail(3), AnnotationState::Pending { attempts: 1 });
    }

    #[test]
    fn test_failure_at_ceiling_poisons() {
        let s = AnnotationState::Pending { attempts: 2 }.begin().fail(3);
        assert_eq!(s, AnnotationState::Poisoned { attempts: 3 });
        assert!(!s.is_eligible());
        assert_eq!(s.begin(), s);
    }

    #[test]
    fn test_success_counts_attempt() {
        let s = AnnotationState::Pending { attempts: 1 }.begin().succeed();
        assert_eq!(s, AnnotationState::Done { attempts: 2 });
        assert_eq!(s.attempts(), 2);
    }

    #[test]
    fn test_transitions_ignore_wrong_source_state() {
        let done = AnnotationState::Done { attempts: 1 };
        assert_eq!(done.fail(3), done);
        assert_eq!(done.succeed(), done);
        let pending = AnnotationState::Pending { attempts: 0 };
        assert_eq!(pending.succeed(), pending);
    }
}
