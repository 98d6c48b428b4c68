//! Scan session lifecycle.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;

use crate::policy::ResolvedPolicySet;
use crate::types::{
    ComplianceResult, Diagnostic, DiagnosticKind, Findings, ScanRequest, SessionState,
};

/// Attempted a lifecycle move the state machine does not allow.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid session transition from {from} to {to}")]
pub struct TransitionError {
    pub from: SessionState,
    pub to: SessionState,
}

/// One scan request from acceptance to its terminal state.
#[derive(Debug, Clone)]
pub struct ScanSession {
    request_id: String,
    prompt: String,
    documents: Vec<String>,
    policy_set: ResolvedPolicySet,
    results: Vec<ComplianceResult>,
    state: SessionState,
    created_at: DateTime<Utc>,
    stream_started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl ScanSession {
    /// Open a session in `Pending` against an already resolved policy set.
    pub fn new(request_id: impl Into<String>, request: ScanRequest, policy_set: ResolvedPolicySet) -> Self {
        Self {
            request_id: request_id.into(),
            prompt: request.prompt,
            documents: request.documents,
            policy_set,
            results: Vec::new(),
            state: SessionState::Pending,
            created_at: Utc::now(),
            stream_started_at: None,
            completed_at: None,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn documents(&self) -> &[String] {
        &self.documents
    }

    pub fn policy_set(&self) -> &ResolvedPolicySet {
        &self.policy_set
    }

    pub fn results(&self) -> &[ComplianceResult] {
        &self.results
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn stream_started_at(&self) -> Option<DateTime<Utc>> {
        self.stream_started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Move to `next`, stamping the lifecycle timestamps.
    pub fn transition(&mut self, next: SessionState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }

        tracing::debug!(
            request_id = %self.request_id,
            from = %self.state,
            to = %next,
            "Session transition"
        );

        if next == SessionState::Streaming {
            self.stream_started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        self.state = next;
        Ok(())
    }

    /// Store the parsed verdicts, one per policy in set order followed by
    /// unknown-policy verdicts.
    pub fn set_results(&mut self, results: Vec<ComplianceResult>) {
        self.results = order_results(&self.policy_set, results);
    }

    /// Drop every verdict. Used when a session times out.
    pub fn discard_results(&mut self) {
        self.results.clear();
    }
}

/// Arrange verdicts so each policy of the set has exactly one, in set order.
///
/// Policies the stream never mentioned get an `Incomplete` verdict. Extra
/// verdicts for unknown ids follow, sorted by id.
pub fn order_results(set: &ResolvedPolicySet, results: Vec<ComplianceResult>) -> Vec<ComplianceResult> {
    let mut by_id: HashMap<String, ComplianceResult> = results
        .into_iter()
        .map(|r| (r.policy_id.clone(), r))
        .collect();

    let mut ordered: Vec<ComplianceResult> = set
        .policies
        .iter()
        .map(|policy| {
            by_id.remove(&policy.id).unwrap_or_else(|| {
                ComplianceResult::incomplete(
                    &set.subject(&policy.id),
                    Findings::default(),
                    vec![Diagnostic::new(
                        DiagnosticKind::MissingSection,
                        "Model stream contained no region for this policy",
                    )],
                )
            })
        })
        .collect();

    let mut extra: Vec<ComplianceResult> = by_id.into_values().collect();
    extra.sort_by(|a, b| a.policy_id.cmp(&b.policy_id));
    ordered.extend(extra);
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PolicyRegistry, PolicySource};
    use crate::types::{SeverityLevel, VerdictState, VerdictSubject};

    fn policy_set() -> ResolvedPolicySet {
        let yaml = r#"
policies:
  - id: P1
    name: One
    description: First
    threshold: 0.5
  - id: P2
    name: Two
    description: Second
    threshold: 0.5
"#;
        PolicyRegistry::load(&PolicySource::Yaml(yaml.to_string()))
            .unwrap()
            .current()
            .resolve(None)
            .unwrap()
    }

    #[test]
    fn test_lifecycle_stamps_timestamps() {
        let mut session = ScanSession::new("req-1", ScanRequest::new("hello"), policy_set());
        assert_eq!(session.state(), SessionState::Pending);

        session.transition(SessionState::Streaming).unwrap();
        assert!(session.stream_started_at().is_some());
        session.transition(SessionState::Parsing).unwrap();
        session.transition(SessionState::Completed).unwrap();
        assert!(session.completed_at().is_some());

        let err = session.transition(SessionState::Failed).unwrap_err();
        assert_eq!(err.from, SessionState::Completed);
    }

    #[test]
    fn test_aggregating_cannot_time_out() {
        let mut session = ScanSession::new("req-2", ScanRequest::new("hello"), policy_set());
        session.transition(SessionState::Streaming).unwrap();
        session.transition(SessionState::Parsing).unwrap();
        session.transition(SessionState::Aggregating).unwrap();
        assert!(session.transition(SessionState::TimedOut).is_err());
        assert_eq!(session.state(), SessionState::Aggregating);
    }

    #[test]
    fn test_results_ordered_with_missing_filled() {
        let set = policy_set();
        let unknown = ComplianceResult::graded(
            &VerdictSubject::unknown("ZZ"),
            SeverityLevel::Safe,
            Findings::default(),
            vec![],
        );
        let p2 = ComplianceResult::graded(
            &set.subject("P2"),
            SeverityLevel::Low,
            Findings::default(),
            vec![],
        );

        let ordered = order_results(&set, vec![unknown, p2]);
        let ids: Vec<&str> = ordered.iter().map(|r| r.policy_id.as_str()).collect();
        assert_eq!(ids, vec!["P1", "P2", "ZZ"]);
        assert_eq!(ordered[0].verdict(), VerdictState::Incomplete);
        assert!(ordered[2].unknown_policy);
    }
}
