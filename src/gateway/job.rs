//! Job-service backend: submit, then poll until done or the deadline.
//!
//! Protocol:
//!
//! ```text
//! POST {base}/v1/llm/request   {task, provider, prompt, model?, priority, max_attempts, ...}
//!   200/202 → {"job_id": "..."}
//! GET  {base}/v1/jobs/{job_id}
//!   200 → {"status": "queued|running|done|failed|error|cancelled", "error"?, "result"?}
//! ```
//!
//! Polling runs at a fixed interval. The whole call, submission included,
//! is bounded by `backend.timeout_secs`; an abandoned job is left to the
//! service.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

use super::payload::{self, TagPayload};
use super::{
    AnnotationBackend, AnnotationError, AnnotationOutput, AnnotationRequest, AnnotationResult,
    ModelSettings,
};
use crate::config::Config;
use crate::models::TaskKind;

/// Status reported by the job service.
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Pending,
    Done(Value),
    Failed(String),
    Cancelled(String),
}

impl JobStatus {
    fn from_body(body: &Value) -> Self {
        let status = body
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_lowercase();
        let error = body.get("error").and_then(Value::as_str).map(str::to_string);

        match status.as_str() {
            "done" => Self::Done(body.get("result").cloned().unwrap_or(Value::Null)),
            "failed" | "error" => Self::Failed(error.unwrap_or_else(|| "job failed".to_string())),
            "cancelled" | "canceled" => {
                Self::Cancelled(error.unwrap_or_else(|| "job cancelled".to_string()))
            }
            _ => Self::Pending,
        }
    }
}

/// A submitted job, owned by the call that created it.
#[derive(Debug, Clone)]
pub struct AnnotationJob {
    pub id: String,
    pub submitted_at: Instant,
    pub deadline: Instant,
    pub status: JobStatus,
}

/// Backend speaking the job-service protocol.
pub struct JobBackend {
    client: reqwest::Client,
    base_url: String,
    provider: String,
    priority: i64,
    max_attempts: i64,
    source: String,
    timeout: Duration,
    poll_interval: Duration,
    models: ModelSettings,
}

impl JobBackend {
    pub fn new(base_url: impl Into<String>, models: ModelSettings) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            provider: "auto".to_string(),
            priority: 2,
            max_attempts: 2,
            source: "channel-annotate".to_string(),
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            models,
        })
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let b = &config.backend;
        Ok(Self::new(&b.job_url, ModelSettings::from_config(config))?
            .with_timeout(Duration::from_secs(b.timeout_secs))
            .with_poll_interval(Duration::from_millis(b.poll_interval_ms))
            .with_provider(&b.provider)
            .with_priority(b.priority, b.job_max_attempts)
            .with_source(&b.source))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_provider(mut self, provider: &str) -> Self {
        self.provider = match provider.trim().to_lowercase().as_str() {
            p @ ("auto" | "ollama" | "openai" | "openrouter") => p.to_string(),
            _ => "auto".to_string(),
        };
        self
    }

    pub fn with_priority(mut self, priority: i64, max_attempts: i64) -> Self {
        self.priority = priority;
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source = source.to_string();
        self
    }

    /// Local model names only mean something to providers that run them.
    fn forwards_model(&self) -> bool {
        matches!(self.provider.as_str(), "auto" | "ollama")
    }

    fn request_body(&self, request: &AnnotationRequest) -> Value {
        let mut body = match request.task {
            TaskKind::Tag => json!({
                "task": "chat",
                "provider": self.provider,
                "prompt": payload::tag_prompt(&request.text, &request.candidates, request.max_tags),
                "temperature": self.models.temperature,
                "max_tokens": 700,
                "priority": self.priority,
                "source": self.source,
                "max_attempts": self.max_attempts,
                "options": {"system": self.models.system_prompt()},
            }),
            TaskKind::Embed => json!({
                "task": "embed",
                "provider": self.provider,
                "prompt": request.text,
                "priority": self.priority,
                "source": self.source,
                "max_attempts": self.max_attempts,
            }),
        };

        if self.forwards_model() {
            let model = match request.task {
                TaskKind::Tag => &self.models.tag_model,
                TaskKind::Embed => &self.models.embed_model,
            };
            body["model"] = json!(model);
        }
        body
    }

    /// Submit a job. Consumes part of the call's time budget.
    ///
    /// The deadline covers the whole exchange, reading the body included.
    pub async fn submit(&self, request: &AnnotationRequest) -> Result<AnnotationJob, AnnotationError> {
        let submitted_at = Instant::now();
        let deadline = submitted_at + self.timeout;

        let id = match tokio::time::timeout(self.timeout, self.post_job(request)).await {
            Err(_) => {
                return Err(AnnotationError::BackendTimeout {
                    job_id: None,
                    elapsed: submitted_at.elapsed(),
                })
            }
            Ok(id) => id?,
        };

        tracing::debug!(job_id = %id, task = %request.task, "job submitted");

        Ok(AnnotationJob {
            id,
            submitted_at,
            deadline,
            status: JobStatus::Pending,
        })
    }

    async fn post_job(&self, request: &AnnotationRequest) -> Result<String, AnnotationError> {
        let url = format!("{}/v1/llm/request", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&self.request_body(request))
            .send()
            .await
            .map_err(|e| AnnotationError::BackendSubmit(e.to_string()))?;

        let status = response.status();
        if status.as_u16() != 200 && status.as_u16() != 202 {
            let body = response.text().await.unwrap_or_default();
            return Err(AnnotationError::BackendSubmit(format!(
                "status {}: {}",
                status,
                truncate(&body, 200)
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AnnotationError::BackendSubmit(format!("invalid JSON: {}", e)))?;

        match body.get("job_id") {
            Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            _ => Err(AnnotationError::BackendSubmit(
                "response has no job_id".to_string(),
            )),
        }
    }

    /// One status request. Unbounded on its own; [`JobBackend::wait`]
    /// runs it under the job deadline.
    pub async fn poll_once(&self, job_id: &str) -> Result<JobStatus, AnnotationError> {
        let url = format!("{}/v1/jobs/{}", self.base_url, job_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AnnotationError::BackendPoll(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AnnotationError::BackendPoll(format!(
                "status {}: {}",
                status,
                truncate(&body, 200)
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AnnotationError::BackendPoll(format!("invalid JSON: {}", e)))?;

        Ok(JobStatus::from_body(&body))
    }

    /// Poll until a terminal status, returning the raw `result` value.
    pub async fn wait(&self, job: &mut AnnotationJob) -> Result<Value, AnnotationError> {
        let timed_out = |job: &AnnotationJob| AnnotationError::BackendTimeout {
            job_id: Some(job.id.clone()),
            elapsed: job.submitted_at.elapsed(),
        };

        loop {
            let now = Instant::now();
            if now >= job.deadline {
                return Err(timed_out(job));
            }

            let status = match tokio::time::timeout(job.deadline - now, self.poll_once(&job.id)).await
            {
                Err(_) => return Err(timed_out(job)),
                Ok(status) => status?,
            };
            job.status = status.clone();

            match status {
                JobStatus::Done(result) => return Ok(result),
                JobStatus::Failed(msg) | JobStatus::Cancelled(msg) => {
                    return Err(AnnotationError::BackendJobFailed(msg))
                }
                JobStatus::Pending => {}
            }

            let now = Instant::now();
            if now >= job.deadline {
                return Err(timed_out(job));
            }
            tokio::time::sleep(self.poll_interval.min(job.deadline - now)).await;
        }
    }

    fn validate(
        &self,
        request: &AnnotationRequest,
        result: &Value,
    ) -> Result<AnnotationResult, AnnotationError> {
        if !result.is_object() {
            return Err(AnnotationError::BackendEmptyResult(
                "job result is not an object".to_string(),
            ));
        }

        let model = result
            .pointer("/data/model")
            .or_else(|| result.get("model"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let output = match request.task {
            TaskKind::Embed => {
                let vec = payload::parse_embedding(result).ok_or_else(|| {
                    AnnotationError::BackendEmptyResult("no embedding in job result".to_string())
                })?;
                AnnotationOutput::Embedding(vec)
            }
            TaskKind::Tag => {
                let text = payload::extract_llm_text(result).unwrap_or_default();
                let parsed = payload::parse_tag_payload(&text, request.max_tags);
                AnnotationOutput::Tags(with_candidates(parsed, request)?)
            }
        };

        Ok(AnnotationResult {
            backend: self.name().to_string(),
            model,
            output,
        })
    }
}

#[async_trait]
impl AnnotationBackend for JobBackend {
    fn name(&self) -> &str {
        "job"
    }

    async fn annotate(
        &self,
        request: &AnnotationRequest,
    ) -> Result<AnnotationResult, AnnotationError> {
        let mut job = self.submit(request).await?;
        let result = self.wait(&mut job).await?;
        tracing::debug!(
            job_id = %job.id,
            elapsed_ms = job.submitted_at.elapsed().as_millis() as u64,
            "job done"
        );
        self.validate(request, &result)
    }
}

/// Fill in extracted candidates when the model produced no tags.
pub(crate) fn with_candidates(
    mut parsed: TagPayload,
    request: &AnnotationRequest,
) -> Result<TagPayload, AnnotationError> {
    if parsed.tags.is_empty() {
        parsed.tags = request.candidates.clone();
        if request.max_tags > 0 {
            parsed.tags.truncate(request.max_tags);
        }
    }
    if parsed.tags.is_empty() {
        return Err(AnnotationError::BackendEmptyResult(
            "no tags in model output".to_string(),
        ));
    }
    Ok(parsed)
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(provider: &str) -> JobBackend {
        let models = ModelSettings {
            tag_model: "llama3.2:3b".into(),
            embed_model: "nomic-embed-text".into(),
            temperature: 0.1,
            system_prompt: Some("sys".into()),
        };
        JobBackend::new("http://jobs.local/", models)
            .unwrap()
            .with_provider(provider)
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!(JobStatus::from_body(&json!({"status": "queued"})), JobStatus::Pending);
        assert_eq!(JobStatus::from_body(&json!({})), JobStatus::Pending);
        assert_eq!(
            JobStatus::from_body(&json!({"status": "DONE", "result": {"a": 1}})),
            JobStatus::Done(json!({"a": 1}))
        );
        assert_eq!(
            JobStatus::from_body(&json!({"status": "error", "error": "oom"})),
            JobStatus::Failed("oom".into())
        );
        assert_eq!(
            JobStatus::from_body(&json!({"status": "canceled"})),
            JobStatus::Cancelled("job cancelled".into())
        );
    }

    #[test]
    fn test_tag_body_carries_model_for_local_providers() {
        let b = backend("auto");
        let body = b.request_body(&AnnotationRequest::tag("текст", vec![], 10));
        assert_eq!(body["task"], "chat");
        assert_eq!(body["model"], "llama3.2:3b");
        assert_eq!(body["options"]["system"], "sys");
        assert_eq!(body["max_tokens"], 700);
    }

    #[test]
    fn test_hosted_provider_omits_model() {
        let b = backend("openrouter");
        let body = b.request_body(&AnnotationRequest::embed("текст"));
        assert_eq!(body["task"], "embed");
        assert_eq!(body["provider"], "openrouter");
        assert!(body.get("model").is_none());
    }

    #[test]
    fn test_unknown_provider_becomes_auto() {
        assert_eq!(backend("bedrock").provider, "auto");
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        assert_eq!(backend("auto").base_url, "http://jobs.local");
    }

    #[test]
    fn test_candidates_fill_empty_tags() {
        let req = AnnotationRequest::tag("x", vec!["SBER".into()], 5);
        let filled = with_candidates(TagPayload::default(), &req).unwrap();
        assert_eq!(filled.tags, vec!["SBER"]);

        let bare = AnnotationRequest::tag("x", vec![], 5);
        let err = with_candidates(TagPayload::default(), &bare).unwrap_err();
        assert_eq!(err.kind(), "empty_result");
    }
}
