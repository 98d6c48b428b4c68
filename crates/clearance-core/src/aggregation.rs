//! Aggregation engine: merges per-policy verdicts into a session outcome.
//!
//! The rules are fixed:
//! 1. Results for unknown policies never take part in pass/fail.
//! 2. The session passes iff every remaining result passed.
//! 3. Otherwise the failed subset is sent for remediation, and the response
//!    must have exactly the expected shape or it is rejected.

use serde_json::{Map, Value};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::policy::{PolicySnapshot, ResolvedPolicySet};
use crate::request::ValidationError;
use crate::types::{
    AggregateRequest, ComplianceResult, CriticalConcern, RecommendationPair, Remediation,
    RemediationRequest,
};

/// Top-level key carrying the summary string.
pub const SUMMARY_KEY: &str = "Aggregated Summary";

/// Top-level key carrying the per-policy recommendation pairs.
pub const RECOMMENDATIONS_KEY: &str = "Recommendations";

/// Top-level key carrying the rewritten prompt.
pub const REPHRASE_KEY: &str = "Rephrase Prompt";

const EXPECTED_KEYS: [&str; 3] = [SUMMARY_KEY, RECOMMENDATIONS_KEY, REPHRASE_KEY];

/// A remediation response that does not have the required shape.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AggregationFormatError {
    #[error("Remediation response is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("Remediation response must be a JSON object")]
    NotAnObject,

    #[error("Remediation response is missing '{0}'")]
    MissingKey(&'static str),

    #[error("Unexpected top-level keys in remediation response: {0:?}")]
    UnexpectedKeys(Vec<String>),

    #[error("'{0}' must be a string")]
    NotAString(&'static str),

    #[error("'Recommendations' must be an object keyed by policy id")]
    RecommendationsNotObject,

    #[error("Recommendations for '{0}' must be exactly two strings")]
    BadRecommendationPair(String),

    #[error("Recommendations missing for policies: {0:?}")]
    MissingRecommendations(Vec<String>),

    #[error("Recommendations given for policies that did not fail: {0:?}")]
    UnexpectedRecommendations(Vec<String>),
}

/// Session-level outcome computed from every verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutcome {
    /// Every known-policy result passed.
    pub passed: bool,

    /// Known-policy results that failed, in input order.
    pub failed: Vec<ComplianceResult>,

    /// The failed result most deserving of attention.
    pub critical_concern: Option<CriticalConcern>,

    /// Weight-averaged grade of known-policy results. Informational only.
    pub weighted_score: Option<f64>,
}

impl SessionOutcome {
    pub fn needs_remediation(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn failed_ids(&self) -> Vec<String> {
        self.failed.iter().map(|r| r.policy_id.clone()).collect()
    }
}

/// Reduces verdicts to a [`SessionOutcome`] and checks remediation responses.
pub struct AggregationEngine;

impl AggregationEngine {
    pub fn new() -> Self {
        Self
    }

    /// Compute the session outcome.
    pub fn outcome(&self, results: &[ComplianceResult], set: &ResolvedPolicySet) -> SessionOutcome {
        let counted: Vec<&ComplianceResult> =
            results.iter().filter(|r| r.counts_toward_outcome()).collect();

        let failed: Vec<ComplianceResult> = counted
            .iter()
            .filter(|r| !r.passed())
            .map(|r| (*r).clone())
            .collect();

        let total_weight: f64 = counted.iter().map(|r| set.weight(&r.policy_id)).sum();
        let weighted_score = if counted.is_empty() || total_weight <= 0.0 {
            None
        } else {
            let sum: f64 = counted
                .iter()
                .map(|r| set.weight(&r.policy_id) * r.grade())
                .sum();
            Some((sum / total_weight * 100.0).round() / 100.0)
        };

        SessionOutcome {
            passed: failed.is_empty(),
            critical_concern: critical_concern(&failed),
            failed,
            weighted_score,
        }
    }

    /// Build the remediation request for a failed session. `None` when
    /// nothing failed.
    pub fn remediation_request(
        &self,
        outcome: &SessionOutcome,
        original_prompt: &str,
    ) -> Option<RemediationRequest> {
        let critical_concern = outcome.critical_concern.clone()?;
        Some(RemediationRequest {
            failed_results: outcome.failed.clone(),
            original_prompt: original_prompt.to_string(),
            critical_concern,
        })
    }

    /// Validate a standalone aggregation request against the registry.
    ///
    /// Every result must name a registered policy and must actually have
    /// failed.
    pub fn standalone_request(
        &self,
        request: AggregateRequest,
        snapshot: &PolicySnapshot,
    ) -> Result<RemediationRequest, ValidationError> {
        if request.failed_results.is_empty() {
            return Err(ValidationError::NothingToAggregate);
        }
        if request.original_prompt.trim().is_empty() {
            return Err(ValidationError::EmptyPrompt);
        }

        let unknown: Vec<String> = request
            .failed_results
            .iter()
            .filter(|r| !snapshot.contains(&r.policy_id))
            .map(|r| r.policy_id.clone())
            .collect();
        if !unknown.is_empty() {
            return Err(ValidationError::UnknownPolicies(unknown));
        }

        // Thresholds sent by the caller are not trusted.
        let failed_results: Vec<ComplianceResult> = request
            .failed_results
            .iter()
            .map(|r| r.regraded(&snapshot.subject(&r.policy_id)))
            .collect();

        if let Some(passed) = failed_results.iter().find(|r| r.passed()) {
            return Err(ValidationError::NotAFailure(passed.policy_id.clone()));
        }

        let critical_concern =
            critical_concern(&failed_results).ok_or(ValidationError::NothingToAggregate)?;

        Ok(RemediationRequest {
            failed_results,
            original_prompt: request.original_prompt,
            critical_concern,
        })
    }

    /// Parse and strictly validate a remediation response.
    ///
    /// The response must be one JSON object with exactly the keys
    /// [`SUMMARY_KEY`], [`RECOMMENDATIONS_KEY`] and [`REPHRASE_KEY`];
    /// recommendations must cover exactly the failed policy ids, each with two
    /// strings. A single surrounding ```` ```json ```` fence is tolerated.
    pub fn validate_remediation(
        &self,
        raw: &str,
        failed_ids: &[String],
    ) -> Result<Remediation, AggregationFormatError> {
        let body = strip_code_fence(raw);
        let value: Value = serde_json::from_str(body)
            .map_err(|e| AggregationFormatError::InvalidJson(e.to_string()))?;

        let Value::Object(object) = value else {
            return Err(AggregationFormatError::NotAnObject);
        };

        let unexpected: Vec<String> = object
            .keys()
            .filter(|k| !EXPECTED_KEYS.contains(&k.as_str()))
            .cloned()
            .collect();
        if !unexpected.is_empty() {
            return Err(AggregationFormatError::UnexpectedKeys(unexpected));
        }

        let aggregated_summary = string_field(&object, SUMMARY_KEY)?;
        let rephrase_prompt = string_field(&object, REPHRASE_KEY)?;

        let recommendations = match object.get(RECOMMENDATIONS_KEY) {
            None => return Err(AggregationFormatError::MissingKey(RECOMMENDATIONS_KEY)),
            Some(Value::Object(map)) => recommendation_pairs(map)?,
            Some(_) => return Err(AggregationFormatError::RecommendationsNotObject),
        };

        let expected: BTreeSet<&str> = failed_ids.iter().map(String::as_str).collect();
        let missing: Vec<String> = expected
            .iter()
            .filter(|id| !recommendations.contains_key(**id))
            .map(|id| id.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(AggregationFormatError::MissingRecommendations(missing));
        }

        let extra: Vec<String> = recommendations
            .keys()
            .filter(|id| !expected.contains(id.as_str()))
            .cloned()
            .collect();
        if !extra.is_empty() {
            return Err(AggregationFormatError::UnexpectedRecommendations(extra));
        }

        Ok(Remediation {
            aggregated_summary,
            recommendations,
            rephrase_prompt,
        })
    }
}

impl Default for AggregationEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Pick the critical concern among failed results: highest severity first,
/// then the lexicographically smallest policy id.
pub fn critical_concern(failed: &[ComplianceResult]) -> Option<CriticalConcern> {
    failed
        .iter()
        .filter(|r| !r.passed())
        .min_by_key(|r| (Reverse(r.severity()), r.policy_id.clone()))
        .map(|r| CriticalConcern {
            policy_id: r.policy_id.clone(),
            severity: r.severity(),
            verdict: r.verdict(),
            problem: r.problem.clone(),
        })
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(inner) = rest.strip_suffix("```") else {
        return trimmed;
    };
    // Drop an info string such as `json` on the opening line.
    match inner.split_once('\n') {
        Some((info, body)) if !info.trim().contains(char::is_whitespace) => body.trim(),
        _ => inner.trim(),
    }
}

fn string_field(object: &Map<String, Value>, key: &'static str) -> Result<String, AggregationFormatError> {
    match object.get(key) {
        None => Err(AggregationFormatError::MissingKey(key)),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(AggregationFormatError::NotAString(key)),
    }
}

fn recommendation_pairs(
    map: &Map<String, Value>,
) -> Result<BTreeMap<String, RecommendationPair>, AggregationFormatError> {
    let mut pairs = BTreeMap::new();

    for (policy_id, value) in map {
        let bad = || AggregationFormatError::BadRecommendationPair(policy_id.clone());
        let Value::Array(items) = value else {
            return Err(bad());
        };
        match items.as_slice() {
            [Value::String(first), Value::String(second)] => {
                pairs.insert(policy_id.clone(), [first.clone(), second.clone()]);
            }
            _ => return Err(bad()),
        }
    }

    Ok(pairs)
}
