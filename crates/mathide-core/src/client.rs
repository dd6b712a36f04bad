//! Model completion contract
//!
//! The orchestrator only ever talks to the model through
//! [`CompletionClient`]. [`RetryingClient`] wraps any implementation with
//! the bounded retry policy:
//! - rate limiting and connection failures are retried with exponential backoff
//! - everything else is returned immediately
//! - an empty reply is an invalid response, never retried

use crate::config::RetryPolicy;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Log target for raw request and response text
pub const TRANSCRIPT_TARGET: &str = "mathide::transcript";

/// Author of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions
    System,
    /// Request content
    User,
    /// Earlier model output
    Assistant,
}

/// One role/content pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author
    pub role: Role,
    /// Text
    pub content: String,
}

impl ChatMessage {
    /// System message
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// User message
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Request sent to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Ordered conversation
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature
    pub temperature: f32,
    /// Model identifier
    pub model: String,
}

/// Token accounting for one completion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens
    pub prompt_tokens: u32,
    /// Completion tokens
    pub completion_tokens: u32,
    /// Sum of both
    pub total_tokens: u32,
}

/// Model reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Raw text
    pub content: String,
    /// Token accounting
    pub usage: TokenUsage,
    /// Why generation stopped
    pub finish_reason: String,
    /// Model that answered
    pub model: String,
}

impl CompletionResponse {
    /// Plain reply with zero usage
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            usage: TokenUsage::default(),
            finish_reason: "stop".to_string(),
            model: String::new(),
        }
    }
}

/// Failure classes surfaced by a completion client
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompletionError {
    /// Service asked us to slow down
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Network failure or timeout
    #[error("connection failed: {0}")]
    Connection(String),

    /// Reply was empty or unusable
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Anything else; terminal
    #[error("completion failed: {0}")]
    Other(String),
}

impl CompletionError {
    /// Whether the failure class is retried
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Connection(_))
    }
}

/// Text-in, text-out model service
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Run one completion
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, CompletionError>;
}

#[async_trait]
impl<C: CompletionClient + ?Sized> CompletionClient for Arc<C> {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, CompletionError> {
        (**self).complete(request).await
    }
}

/// Completion client with bounded retry
#[derive(Debug, Clone)]
pub struct RetryingClient<C> {
    inner: C,
    policy: RetryPolicy,
    transcript: bool,
}

impl<C: CompletionClient> RetryingClient<C> {
    /// Wrap a client
    #[must_use]
    pub fn new(inner: C, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            transcript: false,
        }
    }

    /// Log requests and raw replies under [`TRANSCRIPT_TARGET`]
    #[must_use]
    pub fn with_transcript(mut self, enabled: bool) -> Self {
        self.transcript = enabled;
        self
    }

    /// Wrapped client
    #[inline]
    #[must_use]
    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Active policy
    #[inline]
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }
}

#[async_trait]
impl<C: CompletionClient> CompletionClient for RetryingClient<C> {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, CompletionError> {
        let attempts = self.policy.attempts();

        if self.transcript {
            for message in &request.messages {
                debug!(
                    target: TRANSCRIPT_TARGET,
                    model = %request.model,
                    role = ?message.role,
                    content = %message.content,
                    "request message"
                );
            }
        }

        let mut attempt = 0;
        loop {
            debug!(attempt = attempt + 1, attempts, "completion request");
            match self.inner.complete(request).await {
                Ok(response) if response.content.trim().is_empty() => {
                    warn!("model returned empty content");
                    return Err(CompletionError::InvalidResponse(
                        "empty content".to_string(),
                    ));
                }
                Ok(response) => {
                    info!(
                        prompt_tokens = response.usage.prompt_tokens,
                        completion_tokens = response.usage.completion_tokens,
                        total_tokens = response.usage.total_tokens,
                        finish_reason = %response.finish_reason,
                        "completion received"
                    );
                    if self.transcript {
                        debug!(
                            target: TRANSCRIPT_TARGET,
                            model = %response.model,
                            content = %response.content,
                            "response"
                        );
                    }
                    return Ok(response);
                }
                Err(err) if err.is_transient() && attempt + 1 < attempts => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        error = %err,
                        attempt = attempt + 1,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "transient completion failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    warn!(error = %err, attempt = attempt + 1, "completion failed");
                    return Err(err);
                }
            }
        }
    }
}
