//! Schema migrations.
//!
//! Six tables: `channels`, `messages`, `tags`, `tag_aliases`,
//! `message_tags` and `embeddings`. Every statement is idempotent so
//! `chan init` can run any number of times.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables and indexes on an open pool.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS channels (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            title TEXT,
            category TEXT,
            is_private INTEGER NOT NULL DEFAULT 0,
            last_message_id INTEGER,
            last_fetched_at INTEGER,
            message_count INTEGER NOT NULL DEFAULT 0,
            avg_views REAL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Annotation state lives on the message row so each transition is
    // one UPDATE.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            channel_id INTEGER NOT NULL,
            message_id INTEGER NOT NULL,
            ts INTEGER NOT NULL,
            date TEXT NOT NULL,
            permalink TEXT,
            content TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            word_count INTEGER NOT NULL DEFAULT 0,
            views INTEGER,
            forwards INTEGER,
            raw_json TEXT,
            tags_processed INTEGER NOT NULL DEFAULT 0,
            embedding_processed INTEGER NOT NULL DEFAULT 0,
            tag_attempts INTEGER NOT NULL DEFAULT 0,
            embedding_attempts INTEGER NOT NULL DEFAULT 0,
            last_tag_error TEXT,
            last_embedding_error TEXT,
            emoji_line TEXT,
            emoji_json TEXT,
            code_json TEXT,
            UNIQUE(channel_id, message_id),
            FOREIGN KEY (channel_id) REFERENCES channels(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tags (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            canonical TEXT NOT NULL UNIQUE,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tag_aliases (
            alias TEXT PRIMARY KEY,
            canonical TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS message_tags (
            message_id INTEGER NOT NULL,
            tag_id INTEGER NOT NULL,
            source TEXT NOT NULL,
            confidence REAL,
            PRIMARY KEY (message_id, tag_id),
            FOREIGN KEY (message_id) REFERENCES messages(id),
            FOREIGN KEY (tag_id) REFERENCES tags(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embeddings (
            message_id INTEGER PRIMARY KEY,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (message_id) REFERENCES messages(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_ts ON messages(ts DESC, id DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_channel ON messages(channel_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_messages_tag_state ON messages(tags_processed, tag_attempts)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_messages_embed_state ON messages(embedding_processed, embedding_attempts)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_message_tags_tag ON message_tags(tag_id)")
        .execute(pool)
        .await?;

    Ok(())
}
