//! Grade section payload grammar.
//!
//! ```text
//! Severity: Medium
//! Score: `0.34/1`
//! Threshold: 0.50
//! Result: Failed
//! ```
//!
//! Only the severity drives the verdict. Score, threshold and result are
//! echoes from the model, checked against the computed values.

use lazy_static::lazy_static;
use regex::Regex;

use crate::types::{ComplianceResult, Diagnostic, DiagnosticKind, SeverityLevel};

lazy_static! {
    static ref FIELD_LINE: Regex = Regex::new(
        r"^(?i)(severity|score|threshold|result)\s*:\s*(.*)$"
    ).unwrap();

    static ref SEVERITY_VALUE: Regex = Regex::new(
        r"^(?i)(safe|low|medium|high)$"
    ).unwrap();

    /// `0.34`, `.34`, `0.34/1`, `0.34 / 1.0`
    static ref SCORE_VALUE: Regex = Regex::new(
        r"^(\d+(?:\.\d+)?|\.\d+)\s*(?:/\s*1(?:\.0+)?)?$"
    ).unwrap();

    static ref THRESHOLD_VALUE: Regex = Regex::new(
        r"^(\d+(?:\.\d+)?|\.\d+)$"
    ).unwrap();

    static ref RESULT_VALUE: Regex = Regex::new(
        r"^(?i)(passed|failed)$"
    ).unwrap();
}

/// Two-decimal comparison slack for echoed numbers.
const ECHO_TOLERANCE: f64 = 0.005;

/// What the model wrote in a Grade section.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GradeReport {
    pub severity: Option<SeverityLevel>,
    pub score: Option<f64>,
    pub threshold: Option<f64>,
    /// `Some(true)` for `Passed`.
    pub result: Option<bool>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Strip list bullets, bold markers and backticks around a payload line.
fn normalize(line: &str) -> String {
    let line = line.trim();
    let line = line
        .strip_prefix("- ")
        .or_else(|| line.strip_prefix("* "))
        .unwrap_or(line);
    line.chars().filter(|c| *c != '`' && *c != '*').collect::<String>().trim().to_string()
}

/// Parse a Grade section payload. The first occurrence of each field wins.
pub fn parse_grade(payload: &str) -> GradeReport {
    let mut report = GradeReport::default();

    for raw in payload.lines() {
        let line = normalize(raw);
        let Some(caps) = FIELD_LINE.captures(&line) else {
            continue;
        };
        let field = caps[1].to_ascii_lowercase();
        let value = caps[2].trim();

        match field.as_str() {
            "severity" if report.severity.is_none() => {
                if SEVERITY_VALUE.is_match(value) {
                    report.severity = SeverityLevel::parse(value);
                } else {
                    report.malformed(format!("Unrecognized severity '{}'", value));
                }
            }
            "score" if report.score.is_none() => match SCORE_VALUE.captures(value) {
                Some(c) => report.score = c[1].parse().ok(),
                None => report.malformed(format!("Unparseable score '{}'", value)),
            },
            "threshold" if report.threshold.is_none() => match THRESHOLD_VALUE.captures(value) {
                Some(c) => report.threshold = c[1].parse().ok(),
                None => report.malformed(format!("Unparseable threshold '{}'", value)),
            },
            "result" if report.result.is_none() => {
                if RESULT_VALUE.is_match(value) {
                    report.result = Some(value.eq_ignore_ascii_case("passed"));
                } else {
                    report.malformed(format!("Unrecognized result token '{}'", value));
                }
            }
            _ => {}
        }
    }

    if report.severity.is_none() && !report.has(DiagnosticKind::MalformedGrade) {
        report.malformed("Grade section carries no severity".to_string());
    }

    report
}

impl GradeReport {
    fn malformed(&mut self, message: String) {
        self.diagnostics
            .push(Diagnostic::new(DiagnosticKind::MalformedGrade, message));
    }

    fn has(&self, kind: DiagnosticKind) -> bool {
        self.diagnostics.iter().any(|d| d.kind == kind)
    }

    /// Compare the echoed values against a verdict built from the severity.
    /// The computed values always win; disagreements become diagnostics.
    pub fn check_echoes(&self, result: &ComplianceResult) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();

        if let Some(score) = self.score {
            if (score - result.grade()).abs() >= ECHO_TOLERANCE {
                diagnostics.push(Diagnostic::new(
                    DiagnosticKind::GradeMismatch,
                    format!(
                        "Reported score {:.2} differs from computed grade {:.2}",
                        score,
                        result.grade()
                    ),
                ));
            }
        }

        if let Some(threshold) = self.threshold {
            if (threshold - result.threshold()).abs() >= ECHO_TOLERANCE {
                diagnostics.push(Diagnostic::new(
                    DiagnosticKind::ThresholdMismatch,
                    format!(
                        "Reported threshold {:.2} differs from policy threshold {:.2}",
                        threshold,
                        result.threshold()
                    ),
                ));
            }
        }

        if let Some(reported) = self.result {
            if reported != result.passed() {
                diagnostics.push(Diagnostic::new(
                    DiagnosticKind::ResultMismatch,
                    format!(
                        "Reported result {} differs from computed {}",
                        if reported { "Passed" } else { "Failed" },
                        if result.passed() { "Passed" } else { "Failed" }
                    ),
                ));
            }
        }

        diagnostics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Findings, VerdictSubject};

    fn subject(threshold: f64) -> VerdictSubject {
        VerdictSubject {
            policy_id: "P1".to_string(),
            name: "Privacy".to_string(),
            threshold,
            unknown_policy: false,
        }
    }

    #[test]
    fn test_full_payload() {
        let report = parse_grade("Severity: Medium\nScore: `0.34/1`\nThreshold: 0.50\nResult: Failed\n");
        assert_eq!(report.severity, Some(SeverityLevel::Medium));
        assert_eq!(report.score, Some(0.34));
        assert_eq!(report.threshold, Some(0.50));
        assert_eq!(report.result, Some(false));
        assert!(report.diagnostics.is_empty());
    }

    #[test]
    fn test_markdown_decoration_tolerated() {
        let report = parse_grade("- **Severity:** High\n- **Score:** 0.00 / 1.0\n");
        assert_eq!(report.severity, Some(SeverityLevel::High));
        assert_eq!(report.score, Some(0.0));
    }

    #[test]
    fn test_missing_severity_is_malformed() {
        let report = parse_grade("Score: 0.67/1\nResult: Passed\n");
        assert!(report.severity.is_none());
        assert_eq!(report.diagnostics.len(), 1);
        assert_eq!(report.diagnostics[0].kind, DiagnosticKind::MalformedGrade);
    }

    #[test]
    fn test_bad_severity_token() {
        let report = parse_grade("Severity: Critical\n");
        assert!(report.severity.is_none());
        assert_eq!(report.diagnostics.len(), 1);
    }

    #[test]
    fn test_bad_score_is_diagnostic_only() {
        let report = parse_grade("Severity: Low\nScore: two thirds\n");
        assert_eq!(report.severity, Some(SeverityLevel::Low));
        assert!(report.score.is_none());
        assert_eq!(report.diagnostics[0].kind, DiagnosticKind::MalformedGrade);
    }

    #[test]
    fn test_score_mismatch_flagged_but_computed_wins() {
        let report = parse_grade("Severity: Medium\nScore: 0.80/1\nThreshold: 0.5\nResult: Passed\n");
        let result = ComplianceResult::graded(
            &subject(0.5),
            SeverityLevel::Medium,
            Findings::default(),
            vec![],
        );
        let kinds: Vec<DiagnosticKind> =
            report.check_echoes(&result).iter().map(|d| d.kind).collect();

        assert_eq!(
            kinds,
            vec![DiagnosticKind::GradeMismatch, DiagnosticKind::ResultMismatch]
        );
        assert_eq!(result.grade(), 0.34);
    }

    #[test]
    fn test_threshold_echo_mismatch() {
        let report = parse_grade("Severity: Safe\nThreshold: 0.70\n");
        let result =
            ComplianceResult::graded(&subject(0.8), SeverityLevel::Safe, Findings::default(), vec![]);
        let diags = report.check_echoes(&result);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].kind, DiagnosticKind::ThresholdMismatch);
    }

    #[test]
    fn test_refused_echo_consistent() {
        let result =
            ComplianceResult::graded(&subject(0.9), SeverityLevel::High, Findings::default(), vec![]);
        assert!(parse_grade("Severity: High\nScore: 0.00/1\nThreshold: 0.90\nResult: Failed\n")
            .check_echoes(&result)
            .is_empty());
    }
}
