//! Batch annotation over the eligible message pool.
//!
//! An [`Annotator`] selects pending messages for one track, runs the
//! gateway on them with bounded parallelism and persists each outcome
//! through [`crate::state`]. Every error is caught per message: a backend
//! failure becomes an attempt increment plus a stored error, and a
//! storage failure is logged and counted. Neither stops the batch.

use anyhow::Result;
use futures::stream::{self, StreamExt};
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::aliases::AliasStore;
use crate::canonical::Canonicalizer;
use crate::config::Config;
use crate::gateway::{AnnotationBackend, AnnotationRequest, TagPayload};
use crate::models::TaskKind;
use crate::signals;
use crate::state::{self, AnnotationState, PendingMessage};
use crate::text;

/// Emoji line stored on service posts.
const SERVICE_EMOJI: &str = "📰";

/// Provenance recorded when no backend was consulted.
const LOCAL_SOURCE: &str = "local";

/// What happened to one message.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Done { tags: usize },
    /// Completed without a backend call (service post or empty text).
    Skipped,
    Failed { state: AnnotationState },
    /// Failed, but another run had already finished the message.
    Superseded,
    /// The outcome could not be persisted.
    StorageError,
}

/// Totals for one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub selected: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Failures that reached the ceiling in this batch.
    pub poisoned: usize,
    pub superseded: usize,
    pub storage_errors: usize,
}

impl BatchReport {
    fn add(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Done { .. } => self.succeeded += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Failed { state } => {
                self.failed += 1;
                if matches!(state, AnnotationState::Poisoned { .. }) {
                    self.poisoned += 1;
                }
            }
            Outcome::Superseded => self.superseded += 1,
            Outcome::StorageError => self.storage_errors += 1,
        }
    }
}

pub struct Annotator {
    config: Config,
    pool: SqlitePool,
    gateway: Arc<dyn AnnotationBackend>,
    aliases: Arc<AliasStore>,
}

impl Annotator {
    pub fn new(
        config: Config,
        pool: SqlitePool,
        gateway: Arc<dyn AnnotationBackend>,
        aliases: Arc<AliasStore>,
    ) -> Self {
        Self {
            config,
            pool,
            gateway,
            aliases,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn aliases(&self) -> &Arc<AliasStore> {
        &self.aliases
    }

    /// Canonicalizer bound to the alias table in effect now.
    fn canonicalizer(&self) -> Canonicalizer {
        Canonicalizer::new(self.aliases.snapshot())
            .with_fold(self.config.tagging.fold_aliases)
            .with_abbreviations(self.config.tagging.abbreviations.iter().cloned())
    }

    // ============ Tagging ============

    /// Tag one batch of pending messages.
    pub async fn tag_pending(&self, limit: Option<i64>) -> Result<BatchReport> {
        let cfg = &self.config.tagging;
        let limit = limit.unwrap_or(cfg.batch_size).max(1);
        let pending =
            state::fetch_pending(&self.pool, TaskKind::Tag, cfg.max_attempts, limit, false).await?;

        let canonicalizer = self.canonicalizer();
        let canonicalizer = &canonicalizer;

        let mut report = BatchReport {
            selected: pending.len(),
            ..Default::default()
        };
        let outcomes: Vec<Outcome> = stream::iter(pending)
            .map(|msg| async move { self.tag_one(msg, canonicalizer).await })
            .buffer_unordered(cfg.concurrency)
            .collect()
            .await;

        for outcome in &outcomes {
            report.add(outcome);
        }
        tracing::info!(
            selected = report.selected,
            succeeded = report.succeeded,
            skipped = report.skipped,
            failed = report.failed,
            poisoned = report.poisoned,
            "tagging.batch"
        );
        Ok(report)
    }

    async fn tag_one(&self, msg: PendingMessage, canonicalizer: &Canonicalizer) -> Outcome {
        let cfg = &self.config.tagging;
        let processing = msg.state().begin();

        if msg.content.trim().is_empty() || text::is_service_post(&msg.content) {
            let payload = TagPayload {
                emoji: vec![SERVICE_EMOJI.to_string()],
                ..Default::default()
            };
            return match state::record_tag_success(&self.pool, msg.id, &[], LOCAL_SOURCE, &payload)
                .await
            {
                Ok(()) => Outcome::Skipped,
                Err(e) => self.storage_error(TaskKind::Tag, &msg, e),
            };
        }

        let candidates = if cfg.use_candidates {
            text::extract_candidates(&msg.content)
        } else {
            Vec::new()
        };
        let request = AnnotationRequest::tag(
            text::prepare_for_tagging(&msg.content, cfg.max_chars),
            candidates,
            cfg.max_tags,
        );

        let result = match self.gateway.annotate(&request).await {
            Ok(result) => result,
            Err(e) => return self.fail(TaskKind::Tag, &msg, processing, &e.to_string()).await,
        };

        let backend = result.backend.clone();
        let Some(payload) = result.into_tags() else {
            return self
                .fail(TaskKind::Tag, &msg, processing, "backend returned an embedding")
                .await;
        };
        let payload = signals::enrich(payload, &msg.content);
        let tags = canonicalizer.canonicalize_tags(&payload.tags, cfg.max_tags);

        match state::record_tag_success(&self.pool, msg.id, &tags, &backend, &payload).await {
            Ok(()) => {
                tracing::info!(
                    message = msg.id,
                    channel = %msg.channel,
                    backend = %backend,
                    raw = payload.tags.len(),
                    tags = tags.len(),
                    "tagging.result"
                );
                Outcome::Done { tags: tags.len() }
            }
            Err(e) => self.storage_error(TaskKind::Tag, &msg, e),
        }
    }

    // ============ Embedding ============

    /// Embed one batch of pending messages.
    pub async fn embed_pending(&self, limit: Option<i64>) -> Result<BatchReport> {
        let cfg = &self.config.embedding;
        let limit = limit.unwrap_or(cfg.batch_size).max(1);
        let pending = state::fetch_pending(
            &self.pool,
            TaskKind::Embed,
            cfg.max_attempts,
            limit,
            cfg.require_tags,
        )
        .await?;

        let mut report = BatchReport {
            selected: pending.len(),
            ..Default::default()
        };
        let outcomes: Vec<Outcome> = stream::iter(pending)
            .map(|msg| self.embed_one(msg))
            .buffer_unordered(cfg.concurrency)
            .collect()
            .await;

        for outcome in &outcomes {
            report.add(outcome);
        }
        tracing::info!(
            selected = report.selected,
            succeeded = report.succeeded,
            failed = report.failed,
            poisoned = report.poisoned,
            "embedding.batch"
        );
        Ok(report)
    }

    async fn embed_one(&self, msg: PendingMessage) -> Outcome {
        let cfg = &self.config.embedding;
        let processing = msg.state().begin();

        let input = text::prepare_for_embedding(&msg.content, cfg.max_chars);
        if input.is_empty() {
            return self.fail(TaskKind::Embed, &msg, processing, "empty text").await;
        }

        let result = match self.gateway.annotate(&AnnotationRequest::embed(input)).await {
            Ok(result) => result,
            Err(e) => return self.fail(TaskKind::Embed, &msg, processing, &e.to_string()).await,
        };

        let model = result.model.clone().unwrap_or_else(|| cfg.model.clone());
        let Some(vector) = result.into_embedding() else {
            return self
                .fail(TaskKind::Embed, &msg, processing, "backend returned tags")
                .await;
        };
        if let Some(dims) = cfg.dims {
            if vector.len() != dims {
                let reason = format!("dimension mismatch: got {}, expected {}", vector.len(), dims);
                return self.fail(TaskKind::Embed, &msg, processing, &reason).await;
            }
        }

        match state::record_embedding_success(&self.pool, msg.id, &model, &vector).await {
            Ok(()) => {
                tracing::debug!(message = msg.id, dims = vector.len(), model = %model, "embedding.result");
                Outcome::Done { tags: 0 }
            }
            Err(e) => self.storage_error(TaskKind::Embed, &msg, e),
        }
    }

    // ============ Outcomes ============

    async fn fail(
        &self,
        kind: TaskKind,
        msg: &PendingMessage,
        processing: AnnotationState,
        reason: &str,
    ) -> Outcome {
        let ceiling = match kind {
            TaskKind::Tag => self.config.tagging.max_attempts,
            TaskKind::Embed => self.config.embedding.max_attempts,
        };

        match state::record_failure(&self.pool, kind, msg.id, reason).await {
            Ok(None) => {
                tracing::debug!(task = %kind, message = msg.id, error = %reason, "annotation.superseded");
                Outcome::Superseded
            }
            Ok(Some(attempts)) => {
                // The stored counter is authoritative when runs overlap.
                let next = match processing.fail(ceiling) {
                    predicted if predicted.attempts() == attempts => predicted,
                    _ => AnnotationState::from_row(false, attempts, ceiling),
                };
                match kind {
                    TaskKind::Tag => tracing::warn!(
                        message = msg.id,
                        attempts,
                        state = next.label(),
                        error = %reason,
                        "tagging.error"
                    ),
                    TaskKind::Embed => tracing::warn!(
                        message = msg.id,
                        attempts,
                        state = next.label(),
                        error = %reason,
                        "embedding.error"
                    ),
                }
                Outcome::Failed { state: next }
            }
            Err(e) => self.storage_error(kind, msg, e),
        }
    }

    fn storage_error(&self, kind: TaskKind, msg: &PendingMessage, e: anyhow::Error) -> Outcome {
        tracing::error!(task = %kind, message = msg.id, error = %e, "annotation.storage_error");
        Outcome::StorageError
    }
}
