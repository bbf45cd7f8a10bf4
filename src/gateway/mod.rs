//! Annotation gateway: tags and embeddings from LLM backends.
//!
//! Two backend strategies implement [`AnnotationBackend`]:
//!
//! - **[`JobBackend`]** submits a job to an LLM job service and polls it
//!   until a terminal status or the deadline (`Submitting → Polling →
//!   Done | Failed | TimedOut`).
//! - **[`DirectBackend`]** calls an Ollama-compatible server and waits for
//!   the response inline.
//!
//! [`FallbackBackend`] wraps a primary and an optional secondary. When the
//! primary fails for any reason the secondary is tried exactly once; if
//! that fails too (or there is no secondary) the caller gets
//! [`AnnotationError::FallbackExhausted`] carrying both causes.
//!
//! ```text
//!                 ┌────────────────┐
//! annotate() ───▶ │ FallbackBackend│
//!                 └──────┬─────────┘
//!             primary    │    on error
//!          ┌─────────────┴─────────────┐
//!          ▼                           ▼
//!   ┌────────────┐              ┌────────────┐
//!   │ JobBackend │              │DirectBackend│
//!   │submit+poll │              │  one call   │
//!   └────────────┘              └────────────┘
//! ```
//!
//! Use [`create_gateway`] to build the composition from configuration.
//! Backends hold only configuration and an HTTP client, so one gateway is
//! shared by every concurrent annotation in a batch.

mod direct;
mod fallback;
mod job;
pub mod payload;

pub use direct::DirectBackend;
pub use fallback::FallbackBackend;
pub use job::{AnnotationJob, JobBackend, JobStatus};
pub use payload::TagPayload;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::Config;
use crate::models::TaskKind;

/// Failure of one annotation call.
#[derive(Debug, Error)]
pub enum AnnotationError {
    /// The request could not be submitted or the reply was malformed.
    #[error("backend submit failed: {0}")]
    BackendSubmit(String),

    /// A status request failed with a non-success status or bad body.
    #[error("backend poll failed: {0}")]
    BackendPoll(String),

    /// No terminal status before the deadline.
    #[error("backend timed out after {elapsed:?}{}", job_suffix(.job_id))]
    BackendTimeout {
        job_id: Option<String>,
        elapsed: Duration,
    },

    /// The backend reported the job as failed or cancelled.
    #[error("backend job failed: {0}")]
    BackendJobFailed(String),

    /// Terminal success but the payload lacks the required field.
    #[error("backend returned an empty result: {0}")]
    BackendEmptyResult(String),

    /// The primary failed and the secondary failed or was not configured.
    #[error("all backends failed: primary: {primary}; {}", secondary_message(.secondary))]
    FallbackExhausted {
        primary: Box<AnnotationError>,
        secondary: Option<Box<AnnotationError>>,
    },
}

fn job_suffix(job_id: &Option<String>) -> String {
    match job_id {
        Some(id) => format!(" (job {})", id),
        None => String::new(),
    }
}

fn secondary_message(secondary: &Option<Box<AnnotationError>>) -> String {
    match secondary {
        Some(err) => format!("secondary: {}", err),
        None => "fallback disabled".to_string(),
    }
}

impl AnnotationError {
    /// Stable short name for logs and stored error records.
    pub fn kind(&self) -> &'static str {
        match self {
            AnnotationError::BackendSubmit(_) => "submit",
            AnnotationError::BackendPoll(_) => "poll",
            AnnotationError::BackendTimeout { .. } => "timeout",
            AnnotationError::BackendJobFailed(_) => "job_failed",
            AnnotationError::BackendEmptyResult(_) => "empty_result",
            AnnotationError::FallbackExhausted { .. } => "fallback_exhausted",
        }
    }
}

/// What to annotate.
#[derive(Debug, Clone)]
pub struct AnnotationRequest {
    pub task: TaskKind,
    pub text: String,
    /// Tag hints extracted from the text; used when the model returns none.
    pub candidates: Vec<String>,
    pub max_tags: usize,
}

impl AnnotationRequest {
    pub fn tag(text: impl Into<String>, candidates: Vec<String>, max_tags: usize) -> Self {
        Self {
            task: TaskKind::Tag,
            text: text.into(),
            candidates,
            max_tags,
        }
    }

    pub fn embed(text: impl Into<String>) -> Self {
        Self {
            task: TaskKind::Embed,
            text: text.into(),
            candidates: Vec::new(),
            max_tags: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub enum AnnotationOutput {
    Tags(TagPayload),
    Embedding(Vec<f32>),
}

/// A validated backend answer.
#[derive(Debug, Clone)]
pub struct AnnotationResult {
    /// Name of the backend that produced the result.
    pub backend: String,
    pub model: Option<String>,
    pub output: AnnotationOutput,
}

impl AnnotationResult {
    pub fn into_tags(self) -> Option<TagPayload> {
        match self.output {
            AnnotationOutput::Tags(p) => Some(p),
            AnnotationOutput::Embedding(_) => None,
        }
    }

    pub fn into_embedding(self) -> Option<Vec<f32>> {
        match self.output {
            AnnotationOutput::Embedding(v) => Some(v),
            AnnotationOutput::Tags(_) => None,
        }
    }
}

/// A strategy that can annotate text.
#[async_trait]
pub trait AnnotationBackend: Send + Sync {
    /// Recorded as provenance on stored tags.
    fn name(&self) -> &str;

    async fn annotate(
        &self,
        request: &AnnotationRequest,
    ) -> std::result::Result<AnnotationResult, AnnotationError>;
}

/// Model parameters shared by both backend strategies.
#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub tag_model: String,
    pub embed_model: String,
    pub temperature: f64,
    pub system_prompt: Option<String>,
}

impl ModelSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tag_model: config.tagging.model.clone(),
            embed_model: config.embedding.model.clone(),
            temperature: config.tagging.temperature,
            system_prompt: config.tagging.system_prompt.clone(),
        }
    }

    pub(crate) fn system_prompt(&self) -> &str {
        self.system_prompt
            .as_deref()
            .unwrap_or(payload::DEFAULT_SYSTEM_PROMPT)
    }
}

/// Build the configured backend composition.
///
/// `backend.primary` picks the strategy tried first; with
/// `backend.fallback = true` the other strategy becomes the secondary.
pub fn create_gateway(config: &Config) -> Result<Arc<dyn AnnotationBackend>> {
    let job: Arc<dyn AnnotationBackend> = Arc::new(JobBackend::from_config(config)?);
    let direct: Arc<dyn AnnotationBackend> = Arc::new(DirectBackend::from_config(config)?);

    let (primary, secondary) = match config.backend.primary.as_str() {
        "job" => (job, direct),
        "direct" => (direct, job),
        other => anyhow::bail!(
            "Unknown backend.primary: '{}'. Must be job or direct.",
            other
        ),
    };

    let secondary = config.backend.fallback.then_some(secondary);
    Ok(Arc::new(FallbackBackend::new(primary, secondary)))
}
