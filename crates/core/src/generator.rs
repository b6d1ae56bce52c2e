//! TextGenerator trait — the abstraction over the LLM backend.
//!
//! A generator knows how to turn a system prompt + user prompt (and optional
//! inline images) into text, either as one complete string or as a stream of
//! chunks. The orchestrator consumes this trait without knowing which
//! provider sits behind it; cancellation is expressed by dropping the chunk
//! receiver.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use crate::error::ProviderError;

/// A single request to the LLM backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Provider API key. Must be non-empty; never logged.
    pub api_key: String,

    /// Model identifier; legacy ids are migrated by the client.
    pub model: String,

    /// System prompt defining agent behavior.
    pub system_prompt: String,

    /// The user-facing prompt for this call.
    pub user_prompt: String,

    /// Inline images attached to the prompt.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<InlineImage>,

    /// Sampling temperature, clamped to [0, 2].
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

fn default_temperature() -> f32 {
    0.7
}

impl GenerationRequest {
    /// Minimal request with default sampling parameters.
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            images: Vec::new(),
            temperature: default_temperature(),
            max_tokens: None,
        }
    }
}

/// An inline image payload (base64-encoded).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InlineImage {
    pub mime_type: String,
    pub data_base64: String,
}

/// Why a stream finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural end of generation.
    Stop,
    /// The max token budget was exhausted.
    MaxTokens,
    /// The provider blocked the content.
    Safety,
    /// Any other provider-reported reason.
    Other(String),
}

/// A single chunk in a streaming response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextChunk {
    /// Partial text delta. Non-empty for every non-terminal chunk.
    pub text: String,

    /// Whether this is the final chunk.
    #[serde(default)]
    pub done: bool,

    /// Finish reason, typically only on the final chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

impl TextChunk {
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            done: false,
            finish_reason: None,
        }
    }

    pub fn terminal(reason: FinishReason) -> Self {
        Self {
            text: String::new(),
            done: true,
            finish_reason: Some(reason),
        }
    }
}

/// The core generator trait.
///
/// Implementations: the Gemini streaming client, and test stubs.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// A human-readable name for this generator (e.g. "gemini").
    fn name(&self) -> &str;

    /// Send a request and get the complete response text.
    ///
    /// Default implementation drains `stream()`.
    async fn generate(&self, request: GenerationRequest) -> Result<String, ProviderError> {
        let mut rx = self.stream(request).await?;
        let mut text = String::new();
        while let Some(chunk) = rx.recv().await {
            text.push_str(&chunk?.text);
        }
        Ok(text)
    }

    /// Send a request and get a stream of response chunks.
    ///
    /// Chunks arrive in provider order; the receiver yields zero or more
    /// non-empty deltas followed by one terminal chunk. Dropping the
    /// receiver cancels the underlying request within one chunk's bound.
    async fn stream(
        &self,
        request: GenerationRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<Result<TextChunk, ProviderError>>, ProviderError>;
}
