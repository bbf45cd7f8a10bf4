//! TOML configuration.
//!
//! Every section has defaults, so a file containing only `[db] path = ...`
//! is a valid configuration. [`load_config`] parses and validates; invalid
//! ranges are rejected up front rather than surfacing mid-batch.
//!
//! ```toml
//! [db]
//! path = "./data/chan.sqlite"
//!
//! [backend]
//! primary = "job"          # "job" (submit + poll) or "direct"
//! fallback = true
//! timeout_secs = 30
//! poll_interval_ms = 500
//! job_url = "http://llmcore:8080"
//! direct_url = "http://127.0.0.1:11434"
//!
//! [tagging]
//! model = "llama3.2:3b"
//! max_attempts = 5
//! max_chars = 2000
//! aliases_path = "./config/aliases.json"
//!
//! [embedding]
//! model = "nomic-embed-text"
//! max_chars = 4000
//!
//! [retrieval]
//! default_limit = 20
//! max_limit = 100
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub tagging: TaggingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

// ============ Backend ============

/// Which annotation backend is tried first and how long it may take.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    #[serde(default = "default_primary")]
    pub primary: String,
    #[serde(default = "default_true")]
    pub fallback: bool,
    /// Wall-clock budget for one job on the job-based backend.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Per-request HTTP timeout for the direct backend.
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_job_url")]
    pub job_url: String,
    #[serde(default = "default_direct_url")]
    pub direct_url: String,
    /// Provider hint forwarded to the job service.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_priority")]
    pub priority: i64,
    /// Attempts the job service itself may spend on one request.
    #[serde(default = "default_job_attempts")]
    pub job_max_attempts: i64,
    #[serde(default = "default_source")]
    pub source: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            primary: default_primary(),
            fallback: true,
            timeout_secs: default_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            http_timeout_secs: default_http_timeout_secs(),
            job_url: default_job_url(),
            direct_url: default_direct_url(),
            provider: default_provider(),
            priority: default_priority(),
            job_max_attempts: default_job_attempts(),
            source: default_source(),
        }
    }
}

fn default_primary() -> String {
    "job".to_string()
}
fn default_true() -> bool {
    true
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_http_timeout_secs() -> u64 {
    20
}
fn default_job_url() -> String {
    "http://llmcore:8080".to_string()
}
fn default_direct_url() -> String {
    "http://127.0.0.1:11434".to_string()
}
fn default_provider() -> String {
    "auto".to_string()
}
fn default_priority() -> i64 {
    2
}
fn default_job_attempts() -> i64 {
    2
}
fn default_source() -> String {
    "channel-annotate".to_string()
}

// ============ Tagging ============

#[derive(Debug, Deserialize, Clone)]
pub struct TaggingConfig {
    #[serde(default = "default_tag_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tags")]
    pub max_tags: usize,
    #[serde(default = "default_tag_max_chars")]
    pub max_chars: usize,
    /// Attempt ceiling; a message at or above it is poisoned.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,
    #[serde(default = "default_tag_batch")]
    pub batch_size: i64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_true")]
    pub use_candidates: bool,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// JSON alias file layered over the built-in table.
    #[serde(default)]
    pub aliases_path: Option<PathBuf>,
    /// Also match aliases on a lowercased, transliterated key.
    #[serde(default = "default_true")]
    pub fold_aliases: bool,
    /// Reject alias files that map one alias to two canonicals.
    #[serde(default)]
    pub strict_aliases: bool,
    /// Tokens kept verbatim by title-casing, in addition to all-caps tokens.
    #[serde(default)]
    pub abbreviations: Vec<String>,
}

impl Default for TaggingConfig {
    fn default() -> Self {
        Self {
            model: default_tag_model(),
            temperature: default_temperature(),
            max_tags: default_max_tags(),
            max_chars: default_tag_max_chars(),
            max_attempts: default_max_attempts(),
            batch_size: default_tag_batch(),
            concurrency: default_concurrency(),
            use_candidates: true,
            system_prompt: None,
            aliases_path: None,
            fold_aliases: true,
            strict_aliases: false,
            abbreviations: Vec::new(),
        }
    }
}

fn default_tag_model() -> String {
    "llama3.2:3b".to_string()
}
fn default_temperature() -> f64 {
    0.1
}
fn default_max_tags() -> usize {
    30
}
fn default_tag_max_chars() -> usize {
    2000
}
fn default_max_attempts() -> i64 {
    5
}
fn default_tag_batch() -> i64 {
    50
}
fn default_concurrency() -> usize {
    4
}

// ============ Embedding ============

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embed_model")]
    pub model: String,
    /// Expected vector length; mismatching vectors are treated as failures.
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_embed_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,
    #[serde(default = "default_embed_batch")]
    pub batch_size: i64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Only embed messages whose tagging has completed.
    #[serde(default = "default_true")]
    pub require_tags: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embed_model(),
            dims: None,
            max_chars: default_embed_max_chars(),
            max_attempts: default_max_attempts(),
            batch_size: default_embed_batch(),
            concurrency: default_concurrency(),
            require_tags: true,
        }
    }
}

fn default_embed_model() -> String {
    "nomic-embed-text".to_string()
}
fn default_embed_max_chars() -> usize {
    4000
}
fn default_embed_batch() -> i64 {
    16
}

// ============ Retrieval ============

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_limit")]
    pub default_limit: i64,
    #[serde(default = "default_max_limit")]
    pub max_limit: i64,
    #[serde(default = "default_top_tags")]
    pub top_tags_limit: i64,
    #[serde(default = "default_top_tags_max")]
    pub top_tags_max: i64,
    #[serde(default = "default_similar_limit")]
    pub similar_limit: i64,
    #[serde(default = "default_similar_max")]
    pub similar_max: i64,
    #[serde(default)]
    pub min_score: Option<f64>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            top_tags_limit: default_top_tags(),
            top_tags_max: default_top_tags_max(),
            similar_limit: default_similar_limit(),
            similar_max: default_similar_max(),
            min_score: None,
        }
    }
}

fn default_limit() -> i64 {
    20
}
fn default_max_limit() -> i64 {
    100
}
fn default_top_tags() -> i64 {
    25
}
fn default_top_tags_max() -> i64 {
    200
}
fn default_similar_limit() -> i64 {
    10
}
fn default_similar_max() -> i64 {
    50
}

// ============ Worker ============

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default = "default_tag_interval")]
    pub tagging_interval_secs: u64,
    #[serde(default = "default_embed_interval")]
    pub embedding_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tagging_interval_secs: default_tag_interval(),
            embedding_interval_secs: default_embed_interval(),
        }
    }
}

fn default_tag_interval() -> u64 {
    120
}
fn default_embed_interval() -> u64 {
    300
}

impl Config {
    /// Defaults everywhere except the database path.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            backend: BackendConfig::default(),
            tagging: TaggingConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    match config.backend.primary.as_str() {
        "job" | "direct" => {}
        other => anyhow::bail!(
            "Unknown backend.primary: '{}'. Must be job or direct.",
            other
        ),
    }

    if config.backend.timeout_secs == 0 {
        anyhow::bail!("backend.timeout_secs must be > 0");
    }
    if config.backend.poll_interval_ms == 0 {
        anyhow::bail!("backend.poll_interval_ms must be > 0");
    }

    match config.backend.provider.as_str() {
        "auto" | "ollama" | "openai" | "openrouter" => {}
        other => anyhow::bail!(
            "Unknown backend.provider: '{}'. Must be auto, ollama, openai, or openrouter.",
            other
        ),
    }

    if config.tagging.max_attempts < 1 || config.embedding.max_attempts < 1 {
        anyhow::bail!("max_attempts must be >= 1");
    }
    if config.tagging.batch_size < 1 || config.embedding.batch_size < 1 {
        anyhow::bail!("batch_size must be >= 1");
    }
    if config.tagging.concurrency == 0 || config.embedding.concurrency == 0 {
        anyhow::bail!("concurrency must be > 0");
    }
    if config.tagging.max_tags == 0 {
        anyhow::bail!("tagging.max_tags must be > 0");
    }
    if config.embedding.dims == Some(0) {
        anyhow::bail!("embedding.dims must be > 0 when set");
    }

    let r = &config.retrieval;
    if r.default_limit < 1 || r.max_limit < r.default_limit {
        anyhow::bail!("retrieval limits must satisfy 1 <= default_limit <= max_limit");
    }
    if r.top_tags_limit < 1 || r.top_tags_max < r.top_tags_limit {
        anyhow::bail!("retrieval top-tags limits must satisfy 1 <= top_tags_limit <= top_tags_max");
    }
    if r.similar_limit < 1 || r.similar_max < r.similar_limit {
        anyhow::bail!("retrieval similar limits must satisfy 1 <= similar_limit <= similar_max");
    }
    if let Some(min) = r.min_score {
        if !(-1.0..=1.0).contains(&min) {
            anyhow::bail!("retrieval.min_score must be in [-1.0, 1.0]");
        }
    }

    Ok(())
}
