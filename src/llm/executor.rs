//! Completion request executor.
//!
//! Owns the HTTP client and the full request lifecycle: token budget
//! check, fast health gate, rate-slot acquisition, bounded retries with
//! linear backoff, 429 back-off via the rate controller, and SSE decode
//! for the streaming variant. Only timeouts and transport errors count
//! against connection health; API-level rejections do not.

use crate::config::{HealthConfig, LlmConfig, RateLimitConfig};
use crate::context::estimate_tokens;
use crate::error::CompletionError;
use crate::llm::health::{ConnectionHealth, ConnectionStatus, DEGRADED_PAUSE, DEGRADED_PAUSE_FAST};
use crate::llm::rate::RateController;
use crate::llm::sse::{SseDeltas, SseEvent};
use crate::llm::{PromptRole, RequestJob, ToolCallRequest, ToolCompletion};
use anyhow::Context as _;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::time::Duration;

/// Cap on response-body text carried into logs and error messages.
const LOG_BODY_LIMIT: usize = 500;

type CompletionResult<T> = std::result::Result<T, CompletionError>;

pub struct CompletionExecutor {
    http: reqwest::Client,
    config: LlmConfig,
    rate: RateController,
    health: ConnectionHealth,
    check_interval: Duration,
}

enum SendOutcome {
    Response(reqwest::Response),
    Retry,
}

impl CompletionExecutor {
    pub fn new(
        config: LlmConfig,
        rate_config: &RateLimitConfig,
        health_config: &HealthConfig,
    ) -> crate::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .with_context(|| "failed to build HTTP client")?;
        Ok(Self {
            http,
            rate: RateController::new(rate_config),
            health: ConnectionHealth::new(health_config.auto_recovery),
            check_interval: health_config.check_interval(),
            config,
        })
    }

    pub fn rate(&self) -> &RateController {
        &self.rate
    }

    pub fn health(&self) -> &ConnectionHealth {
        &self.health
    }

    /// Stream a completion as text deltas. The stream ends after the
    /// terminal marker, or yields one `Err` and stops.
    pub fn stream_completion(
        &self,
        job: RequestJob,
    ) -> impl Stream<Item = CompletionResult<String>> + Send + '_ {
        async_stream::try_stream! {
            self.check_budget(&job)?;
            self.ensure_usable(true).await?;

            let mut attempt: u32 = 0;
            'attempts: loop {
                attempt += 1;
                let response = match self.send_attempt(&job, true, attempt).await? {
                    SendOutcome::Response(response) => response,
                    SendOutcome::Retry => continue 'attempts,
                };

                let bytes = response.bytes_stream().map(|chunk| {
                    chunk.map_err(|error| CompletionError::Stream(error.to_string()))
                });
                let mut events = SseDeltas::new(bytes);
                let mut yielded = false;
                let mut stream_error: Option<CompletionError> = None;
                while let Some(event) = events.next().await {
                    match event {
                        Ok(SseEvent::Delta(text)) => {
                            yielded = true;
                            yield text;
                        }
                        Ok(SseEvent::Finished) => break,
                        Err(error) => {
                            stream_error = Some(error);
                            break;
                        }
                    }
                }

                if let Some(error) = stream_error {
                    self.note_stream_failure(yielded, attempt, error).await?;
                    continue 'attempts;
                }
                self.health.record_success().await;
                break 'attempts;
            }
        }
    }

    /// Non-streaming completion, including any tool-call directives.
    pub async fn complete(&self, job: &RequestJob) -> CompletionResult<ToolCompletion> {
        self.check_budget(job)?;
        self.ensure_usable(true).await?;

        let mut attempt: u32 = 0;
        let response = loop {
            attempt += 1;
            match self.send_attempt(job, false, attempt).await? {
                SendOutcome::Response(response) => break response,
                SendOutcome::Retry => continue,
            }
        };

        let raw = match response.text().await {
            Ok(raw) => raw,
            Err(error) => {
                self.health.record_failure("transport").await;
                return Err(CompletionError::Transport(error.to_string()));
            }
        };
        let parsed: ChatResponse = serde_json::from_str(&raw).map_err(|error| {
            CompletionError::Other(anyhow::anyhow!(
                "failed to parse completion response: {error}; body: {}",
                truncate_for_log(&raw)
            ))
        })?;
        self.health.record_success().await;
        Ok(convert_completion(parsed))
    }

    /// One send attempt. `Err` is terminal; `Retry` means the caller
    /// should loop (backoff for the next attempt happens here).
    async fn send_attempt(
        &self,
        job: &RequestJob,
        stream: bool,
        attempt: u32,
    ) -> CompletionResult<SendOutcome> {
        if attempt > 1 {
            let delay = self.config.retry_delay() * (attempt - 1);
            tracing::debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying completion request after backoff"
            );
            tokio::time::sleep(delay).await;
        }

        self.rate.acquire().await;
        let result = self
            .http
            .post(self.chat_url())
            .bearer_auth(&self.config.api_key)
            .json(&self.build_body(job, stream))
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(error) => {
                let timed_out = error.is_timeout();
                let kind = if timed_out { "timeout" } else { "transport" };
                self.health.record_failure(kind).await;
                if attempt >= self.config.max_retries {
                    return Err(if timed_out {
                        CompletionError::TimedOut { attempts: attempt }
                    } else {
                        CompletionError::Transport(error.to_string())
                    });
                }
                tracing::warn!(%error, attempt, "completion request failed, retrying");
                return Ok(SendOutcome::Retry);
            }
        };

        let status = response.status();
        if status.as_u16() == 429 {
            let hint = retry_after(&response);
            self.rate.on_rate_limited(hint).await;
            if attempt >= self.config.max_retries {
                return Err(CompletionError::RateLimited { attempts: attempt });
            }
            return Ok(SendOutcome::Retry);
        }
        if !status.is_success() {
            let message = extract_api_error(response).await;
            tracing::error!(
                status = status.as_u16(),
                message,
                "completion API rejected the request"
            );
            return Err(CompletionError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(SendOutcome::Response(response))
    }

    /// A broken event stream is retriable only while nothing has been
    /// yielded; afterwards a retry would duplicate visible text.
    async fn note_stream_failure(
        &self,
        yielded: bool,
        attempt: u32,
        error: CompletionError,
    ) -> CompletionResult<()> {
        self.health.record_failure("stream").await;
        if yielded || attempt >= self.config.max_retries {
            return Err(error);
        }
        tracing::warn!(attempt, "completion stream broke before first delta, retrying");
        Ok(())
    }

    fn check_budget(&self, job: &RequestJob) -> CompletionResult<()> {
        let estimated: usize = job.text_sections().map(estimate_tokens).sum();
        if estimated > self.config.context_token_limit {
            return Err(CompletionError::ContextTooLarge {
                estimated,
                limit: self.config.context_token_limit,
            });
        }
        Ok(())
    }

    async fn ensure_usable(&self, fast: bool) -> CompletionResult<()> {
        if self.check_health(fast).await {
            Ok(())
        } else {
            Err(CompletionError::Degraded {
                status: self.health.status().await.label(),
            })
        }
    }

    /// Whether the connection should be used right now. Fast mode never
    /// probes a failed connection and shortens the degraded pause; it
    /// guards the latency-sensitive pre-stream path.
    pub async fn check_health(&self, fast: bool) -> bool {
        match self.health.status().await {
            ConnectionStatus::Healthy => true,
            ConnectionStatus::Failed => {
                if fast {
                    false
                } else {
                    self.probe_connection().await
                }
            }
            ConnectionStatus::Degraded => {
                let pause = if fast { DEGRADED_PAUSE_FAST } else { DEGRADED_PAUSE };
                tracing::debug!(
                    pause_secs = pause.as_secs(),
                    "connection degraded, pausing before use"
                );
                tokio::time::sleep(pause).await;
                true
            }
            ConnectionStatus::Unknown => self.probe_connection().await,
        }
    }

    /// Minimal completion used as a recovery probe. Success heals the
    /// connection; a failed probe leaves the state as it was.
    pub async fn probe_connection(&self) -> bool {
        let body = json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": "Hello"}],
            "max_completion_tokens": 5,
        });
        let result = self
            .http
            .post(self.chat_url())
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                self.health.record_success().await;
                true
            }
            Ok(response) => {
                tracing::debug!(
                    status = response.status().as_u16(),
                    "connection probe rejected"
                );
                false
            }
            Err(error) => {
                tracing::debug!(%error, "connection probe failed");
                false
            }
        }
    }

    /// Background recovery loop. Probes on an interval while the
    /// connection is degraded or failed; exits when the shutdown signal
    /// flips.
    pub async fn run_health_monitor(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        if !self.health.auto_recovery() {
            tracing::info!("auto recovery disabled, health monitor not running");
            return;
        }
        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let status = self.health.status().await;
                    if matches!(status, ConnectionStatus::Degraded | ConnectionStatus::Failed) {
                        tracing::info!(status = status.label(), "attempting connection recovery");
                        if self.probe_connection().await {
                            tracing::info!("connection recovery probe succeeded");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::debug!("health monitor stopping");
                        break;
                    }
                }
            }
        }
    }

    fn chat_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    fn build_body(&self, job: &RequestJob, stream: bool) -> Value {
        let last_user = job
            .blocks
            .iter()
            .rposition(|block| block.role == PromptRole::User);

        let mut messages = Vec::with_capacity(job.blocks.len());
        for (index, block) in job.blocks.iter().enumerate() {
            let role = match block.role {
                PromptRole::System => "system",
                PromptRole::User => "user",
            };
            if Some(index) == last_user && !job.images.is_empty() {
                let mut parts = vec![json!({"type": "text", "text": block.text})];
                for image in &job.images {
                    parts.push(json!({
                        "type": "image_url",
                        "image_url": {"url": image.url, "detail": image.detail},
                    }));
                }
                messages.push(json!({"role": role, "content": parts}));
            } else {
                messages.push(json!({"role": role, "content": block.text}));
            }
        }

        let mut body = json!({
            "model": job.model,
            "messages": messages,
            "max_completion_tokens": job.max_completion_tokens,
        });
        if (job.temperature - 1.0).abs() > f32::EPSILON {
            body["temperature"] = json!(job.temperature);
        }
        if !job.tools.is_empty() {
            let tools: Vec<Value> = job
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        },
                    })
                })
                .collect();
            body["tools"] = json!(tools);
            body["tool_choice"] = json!("auto");
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }
}

#[derive(Debug, Default, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: ChatMessage,
}

#[derive(Debug, Default, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<RawToolCall>,
}

#[derive(Debug, Deserialize)]
struct RawToolCall {
    #[serde(default)]
    id: String,
    function: RawFunction,
}

#[derive(Debug, Deserialize)]
struct RawFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn convert_completion(parsed: ChatResponse) -> ToolCompletion {
    let Some(choice) = parsed.choices.into_iter().next() else {
        return ToolCompletion::default();
    };
    let text = choice.message.content.filter(|text| !text.is_empty());
    let tool_calls = choice
        .message
        .tool_calls
        .into_iter()
        .map(|call| {
            let arguments = serde_json::from_str(&call.function.arguments).unwrap_or_else(|error| {
                tracing::warn!(%error, tool = %call.function.name, "tool call arguments were not valid JSON");
                json!({})
            });
            ToolCallRequest {
                id: call.id,
                name: call.function.name,
                arguments,
            }
        })
        .collect();
    ToolCompletion { text, tool_calls }
}

/// `Retry-After` in whole seconds; anything else is ignored.
fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

async fn extract_api_error(response: reqwest::Response) -> String {
    let body = response.text().await.unwrap_or_default();
    if body.trim().is_empty() {
        return "unknown error".to_string();
    }
    serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|value| value["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| truncate_for_log(&body).to_string())
}

fn truncate_for_log(body: &str) -> &str {
    if body.len() <= LOG_BODY_LIMIT {
        return body;
    }
    let mut end = LOG_BODY_LIMIT;
    while end > 0 && !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}
