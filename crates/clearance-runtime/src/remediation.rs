//! Remediation call for failed sessions.

use clearance_core::{AggregationEngine, AggregationFormatError, PolicyDefinition, Remediation, RemediationRequest};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::prompts::remediation_messages;
use crate::providers::{CompletionConfig, ModelProvider, ProviderError};

/// Errors from the remediation call.
#[derive(Error, Debug, Clone)]
pub enum RemediationError {
    #[error("Remediation call failed: {0}")]
    Upstream(#[from] ProviderError),

    #[error("Malformed remediation response: {0}")]
    Format(#[from] AggregationFormatError),

    #[error("Remediation timed out after {0:?}")]
    Timeout(Duration),
}

/// Asks the model for a remediation and validates the answer.
pub struct RemediationClient {
    provider: Arc<dyn ModelProvider>,
    engine: AggregationEngine,
    completion: CompletionConfig,
    timeout: Duration,
}

impl RemediationClient {
    pub fn new(provider: Arc<dyn ModelProvider>, completion: CompletionConfig, timeout: Duration) -> Self {
        Self {
            provider,
            engine: AggregationEngine::new(),
            completion,
            timeout,
        }
    }

    /// Run the remediation call for `request`.
    ///
    /// `policies` supplies the descriptions used to enrich the prompt.
    pub async fn remediate(
        &self,
        request: &RemediationRequest,
        policies: &[PolicyDefinition],
    ) -> Result<Remediation, RemediationError> {
        let messages = remediation_messages(request, policies);
        let raw = tokio::time::timeout(self.timeout, self.provider.complete(messages, &self.completion))
            .await
            .map_err(|_| RemediationError::Timeout(self.timeout))??;

        let failed_ids: Vec<String> = request
            .failed_results
            .iter()
            .map(|r| r.policy_id.clone())
            .collect();

        self.engine
            .validate_remediation(&raw, &failed_ids)
            .map_err(|e| {
                tracing::warn!(
                    provider = self.provider.name(),
                    error = %e,
                    response_len = raw.len(),
                    "Rejected remediation response"
                );
                RemediationError::from(e)
            })
    }
}
