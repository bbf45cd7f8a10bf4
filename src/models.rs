//! Core data models shared by ingestion, annotation and retrieval.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raw post record produced by the channel scraper.
///
/// One JSON object per line in the ingest input. `(channel, message_id)`
/// identifies a post; re-ingesting the same pair updates it in place.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawMessage {
    pub channel: String,
    pub message_id: i64,
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub permalink: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub views: Option<i64>,
    #[serde(default)]
    pub forwards: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

/// The two annotation tasks a message goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Tag,
    Embed,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Tag => "tag",
            TaskKind::Embed => "embed",
        }
    }

    pub(crate) fn processed_column(&self) -> &'static str {
        match self {
            TaskKind::Tag => "tags_processed",
            TaskKind::Embed => "embedding_processed",
        }
    }

    pub(crate) fn attempts_column(&self) -> &'static str {
        match self {
            TaskKind::Tag => "tag_attempts",
            TaskKind::Embed => "embedding_attempts",
        }
    }

    pub(crate) fn error_column(&self) -> &'static str {
        match self {
            TaskKind::Tag => "last_tag_error",
            TaskKind::Embed => "last_embedding_error",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message row as returned by structured fetch.
#[derive(Debug, Clone, Serialize)]
pub struct MessageHit {
    pub id: i64,
    pub channel: String,
    pub message_id: i64,
    pub ts: i64,
    pub date: String,
    pub permalink: Option<String>,
    pub content: String,
    pub views: Option<i64>,
    pub emoji_line: Option<String>,
    pub tags: Vec<String>,
}

/// One row of the top-tags aggregation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TagCount {
    pub canonical: String,
    pub count: i64,
}

/// A similarity search hit. `score` is `1 - distance`.
#[derive(Debug, Clone, Serialize)]
pub struct SimilarHit {
    pub id: i64,
    pub channel: String,
    pub message_id: i64,
    pub ts: i64,
    pub date: String,
    pub permalink: Option<String>,
    pub snippet: String,
    pub distance: f64,
    pub score: f64,
}
