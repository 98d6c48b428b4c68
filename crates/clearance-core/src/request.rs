//! Inbound request validation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ScanRequest;

/// Separator placed between supporting documents in the prompt context.
pub const DOCUMENT_SEPARATOR: &str = "\n---\n";

/// Placeholder rendered when a request carries no documents.
pub const NO_DOCUMENTS: &str = "No documents provided";

/// Malformed or unserviceable requests. Surfaced to the caller as a
/// structured failure, never as an opaque server error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Prompt cannot be empty or contain only whitespace")]
    EmptyPrompt,

    #[error("Too many documents: {count} (max allowed: {max})")]
    TooManyDocuments { count: usize, max: usize },

    #[error("Document {index} is {size} bytes (max allowed: {max})")]
    DocumentTooLarge { index: usize, size: usize, max: usize },

    #[error("Unknown policy set '{id}'. Available: {available:?}")]
    UnknownPolicySet { id: String, available: Vec<String> },

    #[error("Policy set '{0}' selects no policies")]
    EmptyPolicySet(String),

    #[error("Unknown policy IDs: {0:?}")]
    UnknownPolicies(Vec<String>),

    #[error("Result for '{0}' passed and cannot be aggregated")]
    NotAFailure(String),

    #[error("No failed results to aggregate")]
    NothingToAggregate,
}

/// Size limits applied to scan requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestLimits {
    pub max_documents: usize,
    pub max_document_size: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_documents: 10,
            max_document_size: 1024 * 1024,
        }
    }
}

impl RequestLimits {
    /// Check a scan request against these limits.
    pub fn validate(&self, request: &ScanRequest) -> Result<(), ValidationError> {
        if request.prompt.trim().is_empty() {
            return Err(ValidationError::EmptyPrompt);
        }

        if request.documents.len() > self.max_documents {
            return Err(ValidationError::TooManyDocuments {
                count: request.documents.len(),
                max: self.max_documents,
            });
        }

        for (index, doc) in request.documents.iter().enumerate() {
            if doc.len() > self.max_document_size {
                return Err(ValidationError::DocumentTooLarge {
                    index,
                    size: doc.len(),
                    max: self.max_document_size,
                });
            }
        }

        Ok(())
    }
}

/// Join the non-empty documents of a request into one context block.
///
/// Returns `None` when there is nothing to show the model.
pub fn document_context(documents: &[String]) -> Option<String> {
    let docs: Vec<&str> = documents
        .iter()
        .map(|d| d.as_str())
        .filter(|d| !d.trim().is_empty())
        .collect();

    if docs.is_empty() {
        None
    } else {
        Some(docs.join(DOCUMENT_SEPARATOR))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitespace_prompt_rejected() {
        let limits = RequestLimits::default();
        let result = limits.validate(&ScanRequest::new("   \n\t"));
        assert_eq!(result, Err(ValidationError::EmptyPrompt));
    }

    #[test]
    fn test_too_many_documents() {
        let limits = RequestLimits {
            max_documents: 1,
            ..Default::default()
        };
        let request = ScanRequest {
            prompt: "Summarize these".to_string(),
            documents: vec!["a".to_string(), "b".to_string()],
            policy_set_id: None,
        };
        assert!(matches!(
            limits.validate(&request),
            Err(ValidationError::TooManyDocuments { count: 2, max: 1 })
        ));
    }

    #[test]
    fn test_document_too_large() {
        let limits = RequestLimits {
            max_document_size: 4,
            ..Default::default()
        };
        let request = ScanRequest {
            prompt: "Summarize".to_string(),
            documents: vec!["ok".to_string(), "too long".to_string()],
            policy_set_id: None,
        };
        assert!(matches!(
            limits.validate(&request),
            Err(ValidationError::DocumentTooLarge { index: 1, .. })
        ));
    }

    #[test]
    fn test_document_context_joins_non_empty() {
        let docs = vec!["first".to_string(), " ".to_string(), "second".to_string()];
        assert_eq!(document_context(&docs).unwrap(), "first\n---\nsecond");
        assert!(document_context(&[]).is_none());
    }
}
