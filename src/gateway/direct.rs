//! Direct backend for an Ollama-compatible server.
//!
//! `POST /api/embeddings {model, prompt}` returns `{embedding: [...]}`;
//! `POST /api/chat {model, messages, options, stream: false}` returns
//! `{message: {content}}`. One request per annotation, no retries; the
//! state machine owns retrying.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

use super::job::with_candidates;
use super::payload;
use super::{
    AnnotationBackend, AnnotationError, AnnotationOutput, AnnotationRequest, AnnotationResult,
    ModelSettings,
};
use crate::config::Config;
use crate::models::TaskKind;

pub struct DirectBackend {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    models: ModelSettings,
}

impl DirectBackend {
    pub fn new(base_url: impl Into<String>, models: ModelSettings) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(20),
            models,
        })
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(
            Self::new(&config.backend.direct_url, ModelSettings::from_config(config))?
                .with_timeout(Duration::from_secs(config.backend.http_timeout_secs)),
        )
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// One request, bounded end to end by the configured timeout.
    async fn post(&self, path: &str, body: &Value) -> Result<Value, AnnotationError> {
        let started = Instant::now();
        match tokio::time::timeout(self.timeout, self.exchange(path, body)).await {
            Err(_) => Err(AnnotationError::BackendTimeout {
                job_id: None,
                elapsed: started.elapsed(),
            }),
            Ok(reply) => reply,
        }
    }

    async fn exchange(&self, path: &str, body: &Value) -> Result<Value, AnnotationError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                AnnotationError::BackendSubmit(format!("request to {} failed: {}", url, e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AnnotationError::BackendSubmit(format!(
                "status {}: {}",
                status,
                text.chars().take(200).collect::<String>()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| AnnotationError::BackendSubmit(format!("invalid JSON: {}", e)))
    }
}

#[async_trait]
impl AnnotationBackend for DirectBackend {
    fn name(&self) -> &str {
        "direct"
    }

    async fn annotate(
        &self,
        request: &AnnotationRequest,
    ) -> Result<AnnotationResult, AnnotationError> {
        match request.task {
            TaskKind::Embed => {
                let body = json!({
                    "model": self.models.embed_model,
                    "prompt": request.text,
                });
                let reply = self.post("/api/embeddings", &body).await?;
                let vec = payload::parse_embedding(&reply).ok_or_else(|| {
                    AnnotationError::BackendEmptyResult("no embedding in response".to_string())
                })?;
                Ok(AnnotationResult {
                    backend: self.name().to_string(),
                    model: Some(self.models.embed_model.clone()),
                    output: AnnotationOutput::Embedding(vec),
                })
            }
            TaskKind::Tag => {
                let prompt =
                    payload::tag_prompt(&request.text, &request.candidates, request.max_tags);
                let body = payload::chat_body(
                    &self.models.tag_model,
                    self.models.system_prompt(),
                    &prompt,
                    self.models.temperature,
                );
                let reply = self.post("/api/chat", &body).await?;
                let content = reply
                    .pointer("/message/content")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let parsed = payload::parse_tag_payload(content, request.max_tags);
                let model = reply
                    .get("model")
                    .and_then(Value::as_str)
                    .unwrap_or(&self.models.tag_model)
                    .to_string();
                Ok(AnnotationResult {
                    backend: self.name().to_string(),
                    model: Some(model),
                    output: AnnotationOutput::Tags(with_candidates(parsed, request)?),
                })
            }
        }
    }
}
