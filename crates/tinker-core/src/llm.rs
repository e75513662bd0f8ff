//! The LLM connection boundary.
//!
//! The core consumes this trait and never retries: transient-retry policy
//! belongs to the implementing adapter. Any error surfaced here terminates
//! the current round as failed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message in a task's conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Token accounting for one request or one task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    /// Adds another usage sample into this one.
    pub fn absorb(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// A fully assembled LLM reply.
#[derive(Debug, Clone)]
pub struct LlmReply {
    pub text: String,
    pub usage: Usage,
}

/// Error classes the connection must distinguish.
///
/// By the time one of these reaches the core, the adapter has already
/// exhausted whatever retry policy it implements.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Retryable by the adapter, not by the core.
    #[error("transient LLM error: {0}")]
    Transient(String),
    /// The configured per-request timeout elapsed.
    #[error("LLM request timed out after {0:?}")]
    Timeout(Duration),
    /// Authentication, quota, or protocol failure; retrying cannot help.
    #[error("fatal LLM error: {0}")]
    Fatal(String),
}

/// Callback receiving incremental text chunks during streaming.
pub type ChunkSink<'a> = dyn Fn(&str) + Send + Sync + 'a;

/// An LLM connection.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Human-readable backend name for events and logs.
    fn name(&self) -> &str;

    /// Sends the conversation and returns the assembled reply.
    async fn send(&self, history: &[ChatMessage]) -> Result<LlmReply, LlmError>;

    /// Streaming variant: `on_chunk` observes incremental text before the
    /// full reply is assembled. The default implementation falls back to
    /// [`send`](Self::send) and delivers the reply as a single chunk.
    async fn send_streaming(
        &self,
        history: &[ChatMessage],
        on_chunk: &ChunkSink<'_>,
    ) -> Result<LlmReply, LlmError> {
        let reply = self.send(history).await?;
        on_chunk(&reply.text);
        Ok(reply)
    }
}
