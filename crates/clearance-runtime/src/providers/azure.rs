//! Azure OpenAI chat-completions provider.
//!
//! Streams with server-sent events: each `data:` line carries a JSON delta,
//! and `data: [DONE]` is the end marker.
//!
//! ## Security
//!
//! The key is held in an [`ApiCredential`] and only exposed when setting
//! the `api-key` header.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::secrets::ApiCredential;
use super::{ChatMessage, ChunkStream, CompletionConfig, ModelChunk, ModelProvider, ProviderError};
use crate::config::AzureConfig;

/// Environment variable holding the Azure OpenAI key.
pub const AZURE_OPENAI_KEY_ENV: &str = "AZURE_OPENAI_KEY";

const DONE_SENTINEL: &str = "[DONE]";

/// Azure OpenAI provider for one deployment.
pub struct AzureOpenAiProvider {
    client: reqwest::Client,
    endpoint: String,
    deployment: String,
    api_version: String,
    credential: ApiCredential,
}

impl std::fmt::Debug for AzureOpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureOpenAiProvider")
            .field("endpoint", &self.endpoint)
            .field("deployment", &self.deployment)
            .field("api_version", &self.api_version)
            .field("credential", &self.credential)
            .finish()
    }
}

impl AzureOpenAiProvider {
    /// Build from runtime config. The key comes from config or
    /// `AZURE_OPENAI_KEY`.
    pub fn from_config(config: &AzureConfig) -> Result<Self, ProviderError> {
        let endpoint = required(config.endpoint.as_deref(), "Azure OpenAI endpoint", "AZURE_OPENAI_ENDPOINT")?;
        let deployment = required(
            config.deployment.as_deref(),
            "Azure OpenAI deployment",
            "AZURE_OPENAI_DEPLOYMENT",
        )?;
        let credential =
            ApiCredential::resolve(config.api_key.as_deref(), AZURE_OPENAI_KEY_ENV, "Azure OpenAI key")?;

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ProviderError::HttpError(e.to_string()))?;

        tracing::debug!(
            deployment = %deployment,
            api_version = %config.api_version,
            key_source = %credential.source(),
            "Azure OpenAI provider configured"
        );

        Ok(Self {
            client,
            endpoint,
            deployment,
            api_version: config.api_version.clone(),
            credential,
        })
    }

    fn url(&self) -> String {
        completions_url(&self.endpoint, &self.deployment, &self.api_version)
    }

    async fn send(
        &self,
        messages: Vec<ChatMessage>,
        config: &CompletionConfig,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let body = ChatRequest {
            messages,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            stream,
        };

        let response = self
            .client
            .post(self.url())
            .header("api-key", self.credential.expose())
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::HttpError(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        match status.as_u16() {
            401 | 403 => Err(ProviderError::AuthError),
            429 => {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);
                Err(ProviderError::RateLimited { retry_after })
            }
            code => {
                let text = response.text().await.unwrap_or_default();
                Err(ProviderError::ApiError {
                    status: code,
                    message: error_message(&text),
                })
            }
        }
    }
}

fn required(value: Option<&str>, name: &str, env_var: &str) -> Result<String, ProviderError> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            ProviderError::NotConfigured(format!("{} not set: configure it or set {}", name, env_var))
        })
}

fn completions_url(endpoint: &str, deployment: &str, api_version: &str) -> String {
    format!(
        "{}/openai/deployments/{}/chat/completions?api-version={}",
        endpoint.trim_end_matches('/'),
        deployment,
        api_version
    )
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<ErrorBody>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.to_string())
}

/// Turn one SSE `data` payload into a chunk. `None` for keep-alive and
/// metadata events that carry no text.
fn decode_event(data: &str) -> Option<Result<ModelChunk, ProviderError>> {
    if data.trim() == DONE_SENTINEL {
        return Some(Ok(ModelChunk::End));
    }
    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .filter_map(|c| c.delta.content)
            .reduce(|mut a, b| {
                a.push_str(&b);
                a
            })
            .filter(|text| !text.is_empty())
            .map(|text| Ok(ModelChunk::Text(text))),
        Err(e) => Some(Err(ProviderError::ParseError(e.to_string()))),
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ResponseChoice>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

#[async_trait]
impl ModelProvider for AzureOpenAiProvider {
    async fn open_stream(
        &self,
        messages: Vec<ChatMessage>,
        config: &CompletionConfig,
    ) -> Result<ChunkStream, ProviderError> {
        let response = self.send(messages, config, true).await?;

        let chunks = response
            .bytes_stream()
            .eventsource()
            .filter_map(|event| async move {
                match event {
                    Ok(event) => decode_event(&event.data),
                    Err(e) => Some(Err(ProviderError::StreamError(e.to_string()))),
                }
            });

        Ok(chunks.boxed())
    }

    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        config: &CompletionConfig,
    ) -> Result<String, ProviderError> {
        let response = self.send(messages, config, false).await?;
        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;

        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::ParseError("Response contained no message".to_string()))
    }

    fn name(&self) -> &str {
        "azure-openai"
    }
}
