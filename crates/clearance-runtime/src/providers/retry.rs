//! Exponential retry around a provider.
//!
//! Only opening the stream and plain completions are retried. An error in
//! the middle of a stream is returned as-is, since the model cannot resume
//! from where it stopped.

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::{ChatMessage, ChunkStream, CompletionConfig, ModelProvider, ProviderError};
use crate::config::duration_human;

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "duration_human")]
    pub min_delay: Duration,

    /// Upper bound for any single delay
    #[serde(with = "duration_human")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
            .with_jitter()
    }
}

/// Decorator that retries transient provider failures.
pub struct RetryingProvider {
    inner: Arc<dyn ModelProvider>,
    config: RetryConfig,
}

impl RetryingProvider {
    pub fn new(inner: Arc<dyn ModelProvider>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl ModelProvider for RetryingProvider {
    async fn open_stream(
        &self,
        messages: Vec<ChatMessage>,
        config: &CompletionConfig,
    ) -> Result<ChunkStream, ProviderError> {
        (|| async { self.inner.open_stream(messages.clone(), config).await })
            .retry(self.config.backoff())
            .when(ProviderError::is_transient)
            .notify(|e: &ProviderError, delay: Duration| {
                tracing::warn!(
                    provider = self.inner.name(),
                    error = %e,
                    delay = ?delay,
                    "Opening model stream failed, retrying"
                );
            })
            .await
    }

    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        config: &CompletionConfig,
    ) -> Result<String, ProviderError> {
        (|| async { self.inner.complete(messages.clone(), config).await })
            .retry(self.config.backoff())
            .when(ProviderError::is_transient)
            .notify(|e: &ProviderError, delay: Duration| {
                tracing::warn!(
                    provider = self.inner.name(),
                    error = %e,
                    delay = ?delay,
                    "Completion failed, retrying"
                );
            })
            .await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ScriptedProvider;
    use futures::StreamExt;

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_transient_open_failures_are_retried() {
        let scripted = Arc::new(
            ScriptedProvider::new(vec!["hello".to_string()]).failing_opens(2),
        );
        let provider = RetryingProvider::new(scripted.clone(), fast_retry(3));

        let mut stream = provider
            .open_stream(vec![ChatMessage::user("x")], &CompletionConfig::default())
            .await
            .unwrap();
        assert!(matches!(stream.next().await, Some(Ok(_))));
        assert_eq!(scripted.open_attempts(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let scripted = Arc::new(
            ScriptedProvider::new(vec!["hello".to_string()]).failing_opens(5),
        );
        let provider = RetryingProvider::new(scripted.clone(), fast_retry(2));

        let result = provider
            .open_stream(vec![ChatMessage::user("x")], &CompletionConfig::default())
            .await;
        assert!(matches!(result, Err(ProviderError::HttpError(_))));
        assert_eq!(scripted.open_attempts(), 2);
    }
}
