//! OpenAI-compatible chat completions client.
//!
//! Works with OpenAI, Azure OpenAI, vLLM, Ollama, and other compatible
//! endpoints. Transient failures (timeouts excluded) are retried here with
//! bounded exponential backoff - 3 attempts, 500 ms initial delay,
//! doubling, capped at 8 s - because the core deliberately does not retry.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tinker_core::llm::ChunkSink;
use tinker_core::{ChatMessage, LlmClient, LlmConfig, LlmError, LlmReply, Usage};
use tracing::{debug, warn};

const MAX_ATTEMPTS: u32 = 3;
const BASE_DELAY: Duration = Duration::from_millis(500);
const MAX_DELAY: Duration = Duration::from_secs(8);

pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl OpenAiClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let timeout = Duration::from_secs(120);
        Self {
            http: Self::build_http(timeout),
            base_url: base_url.into(),
            model: model.into(),
            api_key: None,
            timeout,
        }
    }

    /// Builds a client from config, reading the API key from the
    /// configured environment variable.
    pub fn from_config(config: &LlmConfig) -> Self {
        let timeout = Duration::from_secs(config.timeout_secs);
        Self {
            http: Self::build_http(timeout),
            base_url: config.base_url.clone(),
            model: config.model.clone(),
            api_key: std::env::var(&config.api_key_env).ok().filter(|k| !k.is_empty()),
            timeout,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    fn build_http(timeout: Duration) -> reqwest::Client {
        reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default()
    }

    fn request(&self, body: &ChatRequest) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .post(format!("{}/chat/completions", self.base_url.trim_end_matches('/')))
            .json(body);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        req
    }

    fn map_send_error(&self, e: reqwest::Error) -> LlmError {
        if e.is_timeout() {
            LlmError::Timeout(self.timeout)
        } else {
            LlmError::Transient(e.to_string())
        }
    }

    async fn request_once(&self, history: &[ChatMessage]) -> Result<LlmReply, LlmError> {
        let body = ChatRequest {
            model: self.model.clone(),
            messages: history.iter().map(WireMessage::from).collect(),
            stream: false,
        };
        let response = self
            .request(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_to_error(status, &text));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Fatal(format!("malformed response: {e}")))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Fatal("response contained no choices".into()))?;

        Ok(LlmReply {
            text: choice.message.content.unwrap_or_default(),
            usage: parsed.usage.map(Usage::from).unwrap_or_default(),
        })
    }

    async fn stream_once(
        &self,
        history: &[ChatMessage],
        on_chunk: &ChunkSink<'_>,
    ) -> Result<LlmReply, LlmError> {
        let body = ChatRequest {
            model: self.model.clone(),
            messages: history.iter().map(WireMessage::from).collect(),
            stream: true,
        };
        let response = self
            .request(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_to_error(status, &text));
        }

        let mut text = String::new();
        let mut usage = Usage::default();
        let mut buffer = String::new();
        let mut stream = response.bytes_stream();

        while let Some(bytes) = stream.next().await {
            // Once streaming has begun, a drop is surfaced as transient
            // without retry: replaying a half-consumed stream would
            // duplicate chunks the caller already observed.
            let bytes = bytes.map_err(|e| LlmError::Transient(format!("stream dropped: {e}")))?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(newline) = buffer.find('\n') {
                let line: String = buffer.drain(..=newline).collect();
                match parse_sse_line(line.trim()) {
                    SseLine::Chunk(chunk) => {
                        if let Some(delta) = chunk.content() {
                            text.push_str(&delta);
                            on_chunk(&delta);
                        }
                        if let Some(u) = chunk.usage {
                            usage = Usage::from(u);
                        }
                    }
                    SseLine::Done => {
                        debug!(chars = text.len(), "Stream complete");
                        return Ok(LlmReply { text, usage });
                    }
                    SseLine::Ignore => {}
                }
            }
        }

        Ok(LlmReply { text, usage })
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn name(&self) -> &str {
        "openai"
    }

    async fn send(&self, history: &[ChatMessage]) -> Result<LlmReply, LlmError> {
        let mut attempt = 0;
        loop {
            match self.request_once(history).await {
                Ok(reply) => return Ok(reply),
                Err(LlmError::Transient(message)) if attempt + 1 < MAX_ATTEMPTS => {
                    let delay = backoff_delay(attempt);
                    warn!(attempt = attempt + 1, %message, ?delay, "Transient LLM error; backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_streaming(
        &self,
        history: &[ChatMessage],
        on_chunk: &ChunkSink<'_>,
    ) -> Result<LlmReply, LlmError> {
        let mut attempt = 0;
        loop {
            match self.stream_once(history, on_chunk).await {
                Ok(reply) => return Ok(reply),
                // Only connection-phase failures are retried; see
                // stream_once for mid-stream behavior.
                Err(LlmError::Transient(message))
                    if attempt + 1 < MAX_ATTEMPTS && !message.starts_with("stream dropped") =>
                {
                    let delay = backoff_delay(attempt);
                    warn!(attempt = attempt + 1, %message, ?delay, "Transient LLM error; backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Bounded exponential backoff: 500 ms base, doubling, capped at 8 s.
fn backoff_delay(attempt: u32) -> Duration {
    BASE_DELAY
        .checked_mul(2u32.saturating_pow(attempt))
        .map_or(MAX_DELAY, |d| d.min(MAX_DELAY))
}

fn status_to_error(status: u16, body: &str) -> LlmError {
    let detail = if body.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {}", body.chars().take(200).collect::<String>())
    };
    match status {
        429 | 500..=599 => LlmError::Transient(detail),
        401 | 403 => LlmError::Fatal(format!("authentication failed ({detail})")),
        _ => LlmError::Fatal(detail),
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

impl From<&ChatMessage> for WireMessage {
    fn from(msg: &ChatMessage) -> Self {
        let role = match msg.role {
            tinker_core::Role::System => "system",
            tinker_core::Role::User => "user",
            tinker_core::Role::Assistant => "assistant",
        };
        Self {
            role: role.to_string(),
            content: Some(msg.content.clone()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl From<WireUsage> for Usage {
    fn from(u: WireUsage) -> Self {
        Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<WireUsage>,
}

impl StreamChunk {
    fn content(&self) -> Option<String> {
        self.choices.first().and_then(|c| c.delta.content.clone())
    }
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
}

enum SseLine {
    Chunk(StreamChunk),
    Done,
    Ignore,
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Ignore;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => SseLine::Chunk(chunk),
        Err(e) => {
            warn!(error = %e, "Unparseable stream chunk ignored");
            SseLine::Ignore
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_bounded() {
        assert_eq!(backoff_delay(0), Duration::from_millis(500));
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(10), Duration::from_secs(8));
        assert_eq!(backoff_delay(u32::MAX), Duration::from_secs(8));
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(status_to_error(429, ""), LlmError::Transient(_)));
        assert!(matches!(status_to_error(503, "busy"), LlmError::Transient(_)));
        assert!(matches!(status_to_error(401, ""), LlmError::Fatal(_)));
        assert!(matches!(status_to_error(400, "bad"), LlmError::Fatal(_)));
    }

    #[test]
    fn test_parse_sse_chunk() {
        let line = r#"data: {"choices":[{"delta":{"content":"hel"}}]}"#;
        match parse_sse_line(line) {
            SseLine::Chunk(chunk) => assert_eq!(chunk.content().unwrap(), "hel"),
            _ => panic!("expected chunk"),
        }
    }

    #[test]
    fn test_parse_sse_done_and_noise() {
        assert!(matches!(parse_sse_line("data: [DONE]"), SseLine::Done));
        assert!(matches!(parse_sse_line(": keepalive"), SseLine::Ignore));
        assert!(matches!(parse_sse_line(""), SseLine::Ignore));
        assert!(matches!(parse_sse_line("data: {broken"), SseLine::Ignore));
    }

    #[test]
    fn test_wire_message_roles() {
        let msg = ChatMessage::system("be useful");
        let wire = WireMessage::from(&msg);
        assert_eq!(wire.role, "system");
        assert_eq!(wire.content.as_deref(), Some("be useful"));
    }
}
