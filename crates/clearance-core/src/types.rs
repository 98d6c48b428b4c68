//! Core types shared by the demultiplexer, the verdict parser and the
//! aggregation engine.
//!
//! Grade arithmetic lives here and nowhere else: a [`ComplianceResult`] can
//! only be built through [`ComplianceResult::graded`] or
//! [`ComplianceResult::incomplete`], and deserialization re-derives the
//! computed fields, so `passed` can never be set independently of the grade.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Discretized risk rating assigned by the model to one policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeverityLevel {
    Safe,
    Low,
    Medium,
    High,
}

impl SeverityLevel {
    /// Every level, lowest first.
    pub const ALL: [SeverityLevel; 4] = [
        SeverityLevel::Safe,
        SeverityLevel::Low,
        SeverityLevel::Medium,
        SeverityLevel::High,
    ];

    /// Severity in hundredths (0, 33, 66, 100).
    pub fn hundredths(self) -> u32 {
        match self {
            SeverityLevel::Safe => 0,
            SeverityLevel::Low => 33,
            SeverityLevel::Medium => 66,
            SeverityLevel::High => 100,
        }
    }

    /// Numeric severity (0.00, 0.33, 0.66, 1.00).
    pub fn value(self) -> f64 {
        f64::from(self.hundredths()) / 100.0
    }

    /// `round(1 - severity, 2)`, computed in hundredths so no float drift
    /// can leak into the comparison against a threshold.
    pub fn grade(self) -> f64 {
        f64::from(100 - self.hundredths()) / 100.0
    }

    /// Parse a severity token (case-insensitive).
    pub fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "safe" => Some(SeverityLevel::Safe),
            "low" => Some(SeverityLevel::Low),
            "medium" => Some(SeverityLevel::Medium),
            "high" => Some(SeverityLevel::High),
            _ => None,
        }
    }
}

impl fmt::Display for SeverityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeverityLevel::Safe => write!(f, "Safe"),
            SeverityLevel::Low => write!(f, "Low"),
            SeverityLevel::Medium => write!(f, "Medium"),
            SeverityLevel::High => write!(f, "High"),
        }
    }
}

/// Final classification of one policy verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictState {
    /// Grade met the policy threshold.
    Passed,
    /// Grade fell below the threshold.
    Failed,
    /// High severity below threshold; grade pinned to 0.00.
    Refused,
    /// Mandatory sections missing or malformed; treated as High.
    Incomplete,
}

impl VerdictState {
    /// Whether this state counts as a failure for aggregation.
    pub fn is_failure(self) -> bool {
        !matches!(self, VerdictState::Passed)
    }
}

/// Kinds of non-fatal findings raised while parsing a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// Reported score differs from the computed grade.
    GradeMismatch,
    /// Threshold echo differs from the registry threshold.
    ThresholdMismatch,
    /// Passed/Failed token differs from the computed outcome.
    ResultMismatch,
    /// Grade section present but its payload could not be parsed.
    MalformedGrade,
    /// A mandatory section never arrived.
    MissingSection,
    /// A recognized heading appeared out of order and was kept as text.
    OutOfOrderSection,
    /// The model stream ended without its end marker.
    TruncatedStream,
}

/// A non-fatal parser finding attached to a verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Identity of the policy a verdict is about, as captured at session start.
#[derive(Debug, Clone, PartialEq)]
pub struct VerdictSubject {
    pub policy_id: String,
    pub name: String,
    pub threshold: f64,
    pub unknown_policy: bool,
}

impl VerdictSubject {
    /// Threshold used for ids outside the session's policy set. Only a
    /// `Safe` verdict can meet it.
    pub const UNKNOWN_POLICY_THRESHOLD: f64 = 1.0;

    /// Subject for a policy id the registry does not know.
    pub fn unknown(policy_id: impl Into<String>) -> Self {
        let policy_id = policy_id.into();
        Self {
            name: policy_id.clone(),
            policy_id,
            threshold: Self::UNKNOWN_POLICY_THRESHOLD,
            unknown_policy: true,
        }
    }
}

/// Free-text sections of a verdict.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Findings {
    pub problem: String,
    pub rationale: String,
    pub fix: String,
    pub rephrase: Option<String>,
}

/// The structured outcome of evaluating one policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ComplianceResultRecord", rename_all = "camelCase")]
pub struct ComplianceResult {
    pub policy_id: String,
    pub name: String,
    threshold: f64,
    severity: SeverityLevel,
    grade: f64,
    passed: bool,
    verdict: VerdictState,
    pub problem: String,
    pub rationale: String,
    pub fix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rephrase: Option<String>,
    #[serde(default)]
    pub unknown_policy: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
}

impl ComplianceResult {
    /// Build a verdict from a parsed severity.
    ///
    /// `passed = grade >= threshold`; a High severity that misses the
    /// threshold is forced to `Refused` with grade 0.00.
    pub fn graded(
        subject: &VerdictSubject,
        severity: SeverityLevel,
        findings: Findings,
        diagnostics: Vec<Diagnostic>,
    ) -> Self {
        let computed = severity.grade();
        let passed = computed >= subject.threshold;
        let (grade, verdict) = if passed {
            (computed, VerdictState::Passed)
        } else if severity == SeverityLevel::High {
            (0.0, VerdictState::Refused)
        } else {
            (computed, VerdictState::Failed)
        };

        Self::assemble(subject, severity, grade, passed, verdict, findings, diagnostics)
    }

    /// Build a fail-closed verdict for underspecified model output.
    ///
    /// Severity is forced to High and the verdict never passes, even against
    /// a zero threshold.
    pub fn incomplete(
        subject: &VerdictSubject,
        findings: Findings,
        diagnostics: Vec<Diagnostic>,
    ) -> Self {
        Self::assemble(
            subject,
            SeverityLevel::High,
            0.0,
            false,
            VerdictState::Incomplete,
            findings,
            diagnostics,
        )
    }

    fn assemble(
        subject: &VerdictSubject,
        severity: SeverityLevel,
        grade: f64,
        passed: bool,
        verdict: VerdictState,
        findings: Findings,
        diagnostics: Vec<Diagnostic>,
    ) -> Self {
        Self {
            policy_id: subject.policy_id.clone(),
            name: subject.name.clone(),
            threshold: subject.threshold,
            severity,
            grade,
            passed,
            verdict,
            problem: findings.problem,
            rationale: findings.rationale,
            fix: findings.fix,
            rephrase: findings.rephrase,
            unknown_policy: subject.unknown_policy,
            diagnostics,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn severity(&self) -> SeverityLevel {
        self.severity
    }

    pub fn grade(&self) -> f64 {
        self.grade
    }

    pub fn passed(&self) -> bool {
        self.passed
    }

    pub fn verdict(&self) -> VerdictState {
        self.verdict
    }

    /// Whether this result takes part in session pass/fail.
    pub fn counts_toward_outcome(&self) -> bool {
        !self.unknown_policy
    }

    /// The same findings judged against another subject, typically the
    /// registered policy. `Incomplete` stays incomplete.
    pub fn regraded(&self, subject: &VerdictSubject) -> Self {
        if self.verdict == VerdictState::Incomplete {
            Self::incomplete(subject, self.findings(), self.diagnostics.clone())
        } else {
            Self::graded(subject, self.severity, self.findings(), self.diagnostics.clone())
        }
    }

    fn subject(&self) -> VerdictSubject {
        VerdictSubject {
            policy_id: self.policy_id.clone(),
            name: self.name.clone(),
            threshold: self.threshold,
            unknown_policy: self.unknown_policy,
        }
    }

    fn findings(&self) -> Findings {
        Findings {
            problem: self.problem.clone(),
            rationale: self.rationale.clone(),
            fix: self.fix.clone(),
            rephrase: self.rephrase.clone(),
        }
    }
}

/// Wire form of a [`ComplianceResult`]. Computed fields sent by a caller are
/// accepted for compatibility but ignored.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ComplianceResultRecord {
    policy_id: String,
    #[serde(default)]
    name: Option<String>,
    threshold: f64,
    severity: SeverityLevel,
    #[serde(default)]
    #[allow(dead_code)]
    grade: Option<f64>,
    #[serde(default)]
    #[allow(dead_code)]
    passed: Option<bool>,
    #[serde(default)]
    verdict: Option<VerdictState>,
    #[serde(default)]
    problem: String,
    #[serde(default)]
    rationale: String,
    #[serde(default)]
    fix: String,
    #[serde(default)]
    rephrase: Option<String>,
    #[serde(default)]
    unknown_policy: bool,
    #[serde(default)]
    diagnostics: Vec<Diagnostic>,
}

impl TryFrom<ComplianceResultRecord> for ComplianceResult {
    type Error = String;

    fn try_from(record: ComplianceResultRecord) -> Result<Self, Self::Error> {
        if !(0.0..=1.0).contains(&record.threshold) {
            return Err(format!(
                "threshold {} for '{}' is outside [0, 1]",
                record.threshold, record.policy_id
            ));
        }

        let subject = VerdictSubject {
            name: record.name.unwrap_or_else(|| record.policy_id.clone()),
            policy_id: record.policy_id,
            threshold: record.threshold,
            unknown_policy: record.unknown_policy,
        };
        let findings = Findings {
            problem: record.problem,
            rationale: record.rationale,
            fix: record.fix,
            rephrase: record.rephrase,
        };

        let result = if record.verdict == Some(VerdictState::Incomplete) {
            ComplianceResult::incomplete(&subject, findings, record.diagnostics)
        } else {
            ComplianceResult::graded(&subject, record.severity, findings, record.diagnostics)
        };
        Ok(result)
    }
}

impl From<&ComplianceResult> for VerdictSubject {
    fn from(result: &ComplianceResult) -> Self {
        result.subject()
    }
}

impl From<&ComplianceResult> for Findings {
    fn from(result: &ComplianceResult) -> Self {
        result.findings()
    }
}

/// Lifecycle of a scan session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Streaming,
    Parsing,
    Aggregating,
    Completed,
    Failed,
    TimedOut,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::TimedOut
        )
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Pending, Streaming) => true,
            (Streaming, Parsing) => true,
            (Parsing, Aggregating) | (Parsing, Completed) => true,
            (Aggregating, Completed) => true,
            (Pending | Streaming | Parsing | Aggregating, Failed) => true,
            (Pending | Streaming | Parsing, TimedOut) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Pending => "pending",
            SessionState::Streaming => "streaming",
            SessionState::Parsing => "parsing",
            SessionState::Aggregating => "aggregating",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::TimedOut => "timed_out",
        };
        write!(f, "{}", s)
    }
}

/// Inbound scan request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRequest {
    pub prompt: String,
    #[serde(default)]
    pub documents: Vec<String>,
    #[serde(default)]
    pub policy_set_id: Option<String>,
}

impl ScanRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }
}

/// The policy that most deserves an operator's attention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriticalConcern {
    pub policy_id: String,
    pub severity: SeverityLevel,
    pub verdict: VerdictState,
    pub problem: String,
}

/// Two ordered recommendation strings for one failed policy.
pub type RecommendationPair = [String; 2];

/// Everything the remediation collaborator needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemediationRequest {
    pub failed_results: Vec<ComplianceResult>,
    pub original_prompt: String,
    pub critical_concern: CriticalConcern,
}

/// A validated remediation response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Remediation {
    pub aggregated_summary: String,
    pub recommendations: BTreeMap<String, RecommendationPair>,
    pub rephrase_prompt: String,
}

/// Merged record of every failed verdict in a session and its remediation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationRecord {
    pub failed_results: Vec<ComplianceResult>,
    pub original_prompt: String,
    pub critical_concern: CriticalConcern,
    pub aggregated_summary: String,
    pub recommendations: BTreeMap<String, RecommendationPair>,
    pub rephrased_prompt: String,
}

impl AggregationRecord {
    pub fn new(request: RemediationRequest, remediation: Remediation) -> Self {
        Self {
            failed_results: request.failed_results,
            original_prompt: request.original_prompt,
            critical_concern: request.critical_concern,
            aggregated_summary: remediation.aggregated_summary,
            recommendations: remediation.recommendations,
            rephrased_prompt: remediation.rephrase_prompt,
        }
    }
}

/// Standalone aggregation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateRequest {
    pub failed_results: Vec<ComplianceResult>,
    pub original_prompt: String,
}

/// Category of a structured session failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Upstream,
    AggregationFormat,
    Timeout,
    Cancelled,
    Internal,
}

/// Why a session ended in `Failed` or `TimedOut`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureReport {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Response to a scan request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResponse {
    pub request_id: String,
    pub results: Vec<ComplianceResult>,
    pub session_state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical_concern: Option<CriticalConcern>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weighted_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<AggregationRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audit_warnings: Vec<String>,
}
