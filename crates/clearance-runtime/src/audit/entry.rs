//! Audit record types.

use chrono::{DateTime, Utc};
use clearance_core::{AggregationRecord, ComplianceResult, FailureReport, ResolvedPolicySet, SessionState};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Kind of an audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEntryType {
    SessionStart,
    PolicyVerdict,
    Aggregation,
    SessionEnd,
    Error,
}

impl fmt::Display for AuditEntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuditEntryType::SessionStart => "session_start",
            AuditEntryType::PolicyVerdict => "policy_verdict",
            AuditEntryType::Aggregation => "aggregation",
            AuditEntryType::SessionEnd => "session_end",
            AuditEntryType::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// One persisted audit record. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    /// Strictly increasing within one process lifetime
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    #[serde(rename = "type")]
    pub entry_type: AuditEntryType,
    pub payload: Value,
}

/// An entry before the logger assigns its sequence number and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    pub request_id: String,
    pub entry_type: AuditEntryType,
    pub payload: Value,
}

impl AuditEvent {
    pub fn new(request_id: impl Into<String>, entry_type: AuditEntryType, payload: Value) -> Self {
        Self {
            request_id: request_id.into(),
            entry_type,
            payload,
        }
    }

    /// Records the prompt and every document exactly as they were sent.
    pub fn session_start(request_id: &str, set: &ResolvedPolicySet, prompt: &str, documents: &[String]) -> Self {
        Self::new(
            request_id,
            AuditEntryType::SessionStart,
            json!({
                "policySetId": set.id,
                "registryGeneration": set.generation,
                "policyIds": set.policy_ids(),
                "prompt": prompt,
                "documentCount": documents.len(),
                "documents": documents,
            }),
        )
    }

    pub fn policy_verdict(request_id: &str, result: &ComplianceResult) -> Self {
        Self::new(
            request_id,
            AuditEntryType::PolicyVerdict,
            json!({
                "policyId": result.policy_id,
                "verdict": result.verdict(),
                "severity": result.severity(),
                "grade": result.grade(),
                "threshold": result.threshold(),
                "passed": result.passed(),
                "unknownPolicy": result.unknown_policy,
                "problem": result.problem,
                "rationale": result.rationale,
                "fix": result.fix,
                "rephrase": result.rephrase,
                "diagnostics": result.diagnostics,
            }),
        )
    }

    pub fn aggregation(request_id: &str, record: &AggregationRecord) -> Self {
        let failed: Vec<&str> = record
            .failed_results
            .iter()
            .map(|r| r.policy_id.as_str())
            .collect();
        Self::new(
            request_id,
            AuditEntryType::Aggregation,
            json!({
                "failedPolicyIds": failed,
                "criticalConcern": record.critical_concern,
                "aggregatedSummary": record.aggregated_summary,
                "recommendations": record.recommendations,
                "rephrasedPrompt": record.rephrased_prompt,
            }),
        )
    }

    pub fn session_end(
        request_id: &str,
        state: SessionState,
        weighted_score: Option<f64>,
        failure: Option<&FailureReport>,
    ) -> Self {
        Self::new(
            request_id,
            AuditEntryType::SessionEnd,
            json!({
                "sessionState": state,
                "weightedScore": weighted_score,
                "failure": failure,
            }),
        )
    }

    /// An error scoped to the whole session, or to one policy.
    pub fn error(request_id: &str, policy_id: Option<&str>, message: impl Into<String>) -> Self {
        Self::new(
            request_id,
            AuditEntryType::Error,
            json!({
                "policyId": policy_id,
                "message": message.into(),
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_wire_shape() {
        let entry = AuditLogEntry {
            seq: 7,
            timestamp: Utc::now(),
            request_id: "req-1".to_string(),
            entry_type: AuditEntryType::PolicyVerdict,
            payload: json!({"policyId": "P1"}),
        };

        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["seq"], 7);
        assert_eq!(value["requestId"], "req-1");
        assert_eq!(value["type"], "policy_verdict");
        assert_eq!(value["payload"]["policyId"], "P1");

        let back: AuditLogEntry = serde_json::from_value(value).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_verdict_event_keeps_findings() {
        let subject = clearance_core::VerdictSubject {
            policy_id: "P2".to_string(),
            name: "Copyright".to_string(),
            threshold: 0.5,
            unknown_policy: false,
        };
        let findings = clearance_core::Findings {
            problem: "Quotes a full chapter.".to_string(),
            rationale: "Reproduces protected text.".to_string(),
            fix: "Summarize instead.".to_string(),
            rephrase: Some("Summarize chapter one".to_string()),
        };
        let result = ComplianceResult::graded(&subject, clearance_core::SeverityLevel::High, findings, vec![]);

        let event = AuditEvent::policy_verdict("req-1", &result);
        assert_eq!(event.payload["problem"], "Quotes a full chapter.");
        assert_eq!(event.payload["rationale"], "Reproduces protected text.");
        assert_eq!(event.payload["fix"], "Summarize instead.");
        assert_eq!(event.payload["rephrase"], "Summarize chapter one");
        assert_eq!(event.payload["passed"], false);
    }

    #[test]
    fn test_error_event_names_policy() {
        let event = AuditEvent::error("req-1", Some("P3"), "stream truncated");
        assert_eq!(event.entry_type, AuditEntryType::Error);
        assert_eq!(event.payload["policyId"], "P3");

        let session_wide = AuditEvent::error("req-1", None, "upstream failed");
        assert!(session_wide.payload["policyId"].is_null());
    }
}
