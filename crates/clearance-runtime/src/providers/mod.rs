//! Model provider abstractions for clearance-runtime.
//!
//! A provider is the only place where model calls are made. It offers two
//! capabilities: a streaming evaluation channel that ends with an explicit
//! end marker, and a plain completion used for remediation.
//!
//! ## Security
//!
//! Providers keep credentials in [`ApiCredential`], see [`secrets`].

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

mod retry;
mod scripted;
pub mod secrets;

#[cfg(feature = "azure")]
mod azure;

pub use retry::{RetryConfig, RetryingProvider};
pub use scripted::ScriptedProvider;
pub use secrets::{ApiCredential, CredentialSource};

#[cfg(feature = "azure")]
pub use azure::{AzureOpenAiProvider, AZURE_OPENAI_KEY_ENV};

/// Errors from model providers.
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    HttpError(String),

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    #[error("JSON parse error: {0}")]
    ParseError(String),

    #[error("Authentication failed")]
    AuthError,

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Stream interrupted: {0}")]
    StreamError(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

impl ProviderError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::HttpError(_)
            | ProviderError::RateLimited { .. }
            | ProviderError::Timeout(_) => true,
            ProviderError::ApiError { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Sampling settings for a model call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    /// Maximum tokens to generate
    pub max_tokens: u32,

    /// Temperature (0.0 for deterministic)
    pub temperature: f32,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            temperature: 0.0,
        }
    }
}

/// A chat message for model completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// "system" or "user"
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    /// Instructions for the model.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    /// The composed evaluation or remediation request.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// One item of a streaming response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelChunk {
    /// Next piece of text, in emission order.
    Text(String),
    /// The model finished its answer. Nothing follows.
    End,
}

/// Ordered chunks from an open evaluation stream.
///
/// A stream that ends without [`ModelChunk::End`] was truncated.
pub type ChunkStream = BoxStream<'static, Result<ModelChunk, ProviderError>>;

/// A model backend.
///
/// Shared process-wide behind an `Arc<dyn ModelProvider>`.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Open a streaming evaluation channel for a composed prompt.
    async fn open_stream(
        &self,
        messages: Vec<ChatMessage>,
        config: &CompletionConfig,
    ) -> Result<ChunkStream, ProviderError>;

    /// Run a non-streaming completion and return the full text.
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        config: &CompletionConfig,
    ) -> Result<String, ProviderError>;

    /// Short backend name for log fields.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_message_wire_form() {
        let json = serde_json::to_value(ChatMessage::system("Evaluate")).unwrap();
        assert_eq!(json, serde_json::json!({ "role": "system", "content": "Evaluate" }));
        assert_eq!(ChatMessage::user("Scan this").role, "user");
    }

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::HttpError("reset".into()).is_transient());
        assert!(ProviderError::RateLimited { retry_after: None }.is_transient());
        assert!(ProviderError::ApiError { status: 503, message: "busy".into() }.is_transient());
        assert!(!ProviderError::ApiError { status: 400, message: "bad".into() }.is_transient());
        assert!(!ProviderError::AuthError.is_transient());
        assert!(!ProviderError::StreamError("cut".into()).is_transient());
    }
}
