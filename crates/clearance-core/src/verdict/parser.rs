//! Per-policy verdict state machine.
//!
//! The parser consumes one policy's sub-stream incrementally. Input is
//! buffered per line, so a chunk may end anywhere, including inside a heading
//! or inside a multi-byte character.

use std::fmt;

use super::grade::parse_grade;
use crate::types::{ComplianceResult, Diagnostic, DiagnosticKind, Findings, VerdictSubject};

/// Recognized sections, in the order the grammar requires them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Section {
    Problem,
    WhyItFailed,
    WhatToFix,
    Rephrase,
    ComplianceId,
    Grade,
}

impl Section {
    /// Classify a heading line. Returns `None` for anything that is not a
    /// `###` heading naming a known section.
    pub fn from_heading(line: &str) -> Option<Section> {
        let title = line.trim().strip_prefix("###")?;
        let title = title.trim_start_matches('#').trim();
        let title = title.trim_matches('*').trim();
        let title = title.strip_suffix(':').unwrap_or(title).trim();

        match title.to_ascii_lowercase().as_str() {
            "problem" => Some(Section::Problem),
            "why it failed" => Some(Section::WhyItFailed),
            "what to fix" => Some(Section::WhatToFix),
            "prompt rephrase" | "rephrase" => Some(Section::Rephrase),
            "compliance id and name" => Some(Section::ComplianceId),
            "grade" => Some(Section::Grade),
            _ => None,
        }
    }

    pub fn is_mandatory(self) -> bool {
        matches!(self, Section::Problem | Section::Grade)
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Section::Problem => "Problem",
            Section::WhyItFailed => "Why It Failed",
            Section::WhatToFix => "What To Fix",
            Section::Rephrase => "Prompt Rephrase",
            Section::ComplianceId => "Compliance ID and Name",
            Section::Grade => "Grade",
        };
        write!(f, "{}", s)
    }
}

/// Where the parser is in the section grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    /// No recognized heading yet.
    AwaitingSection,
    /// Accumulating text for a section.
    InSection(Section),
    /// The policy's region closed while in this section; it may reopen.
    SectionComplete(Section),
    /// A verdict has been produced.
    Done,
}

/// Turns one policy's sub-stream into a [`ComplianceResult`].
#[derive(Debug)]
pub struct VerdictParser {
    subject: VerdictSubject,
    state: ParserState,
    line: Vec<u8>,
    sections: Vec<(Section, String)>,
    diagnostics: Vec<Diagnostic>,
    truncated: bool,
}

impl VerdictParser {
    pub fn new(subject: VerdictSubject) -> Self {
        Self {
            subject,
            state: ParserState::AwaitingSection,
            line: Vec::new(),
            sections: Vec::new(),
            diagnostics: Vec::new(),
            truncated: false,
        }
    }

    /// Parse a complete sub-stream in one call.
    pub fn parse(subject: VerdictSubject, text: &[u8]) -> ComplianceResult {
        let mut parser = Self::new(subject);
        parser.feed(text);
        parser.finish()
    }

    pub fn subject(&self) -> &VerdictSubject {
        &self.subject
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    /// Consume the next bytes of the sub-stream.
    pub fn feed(&mut self, bytes: &[u8]) {
        if self.state == ParserState::Done {
            return;
        }
        if let ParserState::SectionComplete(section) = self.state {
            self.state = ParserState::InSection(section);
        }

        for &b in bytes {
            if b == b'\n' {
                let line = std::mem::take(&mut self.line);
                self.process_line(&line);
            } else {
                self.line.push(b);
            }
        }
    }

    /// The policy's region was closed by another policy's marker.
    pub fn pause(&mut self) {
        if let ParserState::InSection(section) = self.state {
            self.state = ParserState::SectionComplete(section);
        }
    }

    /// Record that the upstream stream ended without its end marker.
    pub fn mark_truncated(&mut self) {
        self.truncated = true;
    }

    /// End of sub-stream: build the verdict.
    ///
    /// Missing Problem or Grade sections, or a Grade section without a
    /// parseable severity, produce an `Incomplete` verdict.
    pub fn finish(mut self) -> ComplianceResult {
        if !self.line.is_empty() {
            let line = std::mem::take(&mut self.line);
            self.process_line(&line);
        }
        self.state = ParserState::Done;

        if self.truncated {
            self.diagnostics.push(Diagnostic::new(
                DiagnosticKind::TruncatedStream,
                "Model stream ended before its end marker",
            ));
        }

        let mut complete = true;
        for section in [Section::Problem, Section::Grade] {
            if self.section_text(section).is_none() {
                complete = false;
                self.diagnostics.push(Diagnostic::new(
                    DiagnosticKind::MissingSection,
                    format!("Mandatory section '{}' never arrived", section),
                ));
            }
        }

        let severity = match self.section_text(Section::Grade) {
            Some(payload) => {
                let report = parse_grade(&payload);
                self.diagnostics.extend(report.diagnostics.iter().cloned());
                report.severity.map(|s| (s, report))
            }
            None => None,
        };

        let findings = self.findings();
        let diagnostics = std::mem::take(&mut self.diagnostics);

        match severity {
            Some((severity, report)) if complete => {
                let mut result =
                    ComplianceResult::graded(&self.subject, severity, findings, diagnostics);
                let echoes = report.check_echoes(&result);
                result.diagnostics.extend(echoes);
                result
            }
            _ => {
                tracing::debug!(
                    policy = %self.subject.policy_id,
                    "Verdict incomplete, failing closed"
                );
                ComplianceResult::incomplete(&self.subject, findings, diagnostics)
            }
        }
    }

    fn current_section(&self) -> Option<Section> {
        match self.state {
            ParserState::InSection(s) | ParserState::SectionComplete(s) => Some(s),
            _ => None,
        }
    }

    fn process_line(&mut self, raw: &[u8]) {
        let decoded = String::from_utf8_lossy(raw);
        let line = decoded.strip_suffix('\r').unwrap_or(&decoded);

        if let Some(section) = Section::from_heading(line) {
            match self.current_section() {
                Some(current) if section <= current => {
                    self.diagnostics.push(Diagnostic::new(
                        DiagnosticKind::OutOfOrderSection,
                        format!("Heading '{}' after '{}' kept as text", section, current),
                    ));
                }
                _ => {
                    self.sections.push((section, String::new()));
                    self.state = ParserState::InSection(section);
                    return;
                }
            }
        }

        // Text before the first heading belongs to no field.
        if let Some((_, body)) = self.sections.last_mut() {
            body.push_str(line);
            body.push('\n');
        }
    }

    fn section_text(&self, section: Section) -> Option<String> {
        self.sections
            .iter()
            .find(|(s, _)| *s == section)
            .map(|(_, body)| body.trim().to_string())
    }

    fn findings(&self) -> Findings {
        Findings {
            problem: self.section_text(Section::Problem).unwrap_or_default(),
            rationale: self.section_text(Section::WhyItFailed).unwrap_or_default(),
            fix: self.section_text(Section::WhatToFix).unwrap_or_default(),
            rephrase: self
                .section_text(Section::Rephrase)
                .filter(|r| !r.is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SeverityLevel, VerdictState};

    fn subject(threshold: f64) -> VerdictSubject {
        VerdictSubject {
            policy_id: "P1".to_string(),
            name: "Content Safety".to_string(),
            threshold,
            unknown_policy: false,
        }
    }

    const MEDIUM_VERDICT: &str = "\
### Problem
The prompt asks for instructions to bypass a paywall.

### Why It Failed
Circumventing access controls infringes copyright.

### What To Fix
Ask for a summary of publicly available material instead.

### Prompt Rephrase
Summarize the public abstract of this article.

### Compliance ID and Name
P1 - Content Safety

### Grade
Severity: Medium
Score: 0.34/1
Threshold: 0.50
Result: Failed
";

    #[test]
    fn test_heading_classification() {
        assert_eq!(Section::from_heading("### Problem"), Some(Section::Problem));
        assert_eq!(Section::from_heading("###  why it failed:"), Some(Section::WhyItFailed));
        assert_eq!(Section::from_heading("### **Grade**"), Some(Section::Grade));
        assert_eq!(Section::from_heading("#### Rephrase"), Some(Section::Rephrase));
        assert_eq!(Section::from_heading("## Problem"), None);
        assert_eq!(Section::from_heading("### Notes"), None);
        assert_eq!(Section::from_heading("Problem"), None);
    }

    #[test]
    fn test_full_verdict() {
        let result = VerdictParser::parse(subject(0.5), MEDIUM_VERDICT.as_bytes());

        assert_eq!(result.severity(), SeverityLevel::Medium);
        assert_eq!(result.grade(), 0.34);
        assert!(!result.passed());
        assert_eq!(result.verdict(), VerdictState::Failed);
        assert_eq!(result.problem, "The prompt asks for instructions to bypass a paywall.");
        assert_eq!(result.rationale, "Circumventing access controls infringes copyright.");
        assert_eq!(
            result.rephrase.as_deref(),
            Some("Summarize the public abstract of this article.")
        );
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
    }

    #[test]
    fn test_byte_at_a_time_matches_single_feed() {
        let whole = VerdictParser::parse(subject(0.5), MEDIUM_VERDICT.as_bytes());

        let mut parser = VerdictParser::new(subject(0.5));
        for b in MEDIUM_VERDICT.as_bytes() {
            parser.feed(std::slice::from_ref(b));
        }
        assert_eq!(parser.finish(), whole);
    }

    #[test]
    fn test_safe_passes() {
        let text = "### Problem\nNone.\n### Grade\nSeverity: Safe\nScore: 1.00/1\nThreshold: 0.80\nResult: Passed";
        let result = VerdictParser::parse(subject(0.8), text.as_bytes());
        assert_eq!(result.grade(), 1.0);
        assert!(result.passed());
        assert!(result.diagnostics.is_empty());
    }

    #[test]
    fn test_high_is_refused() {
        let text = "### Problem\nRequests a weapon recipe.\n### Why It Failed\nViolent content.\n### Grade\nSeverity: High\n";
        let result = VerdictParser::parse(subject(0.9), text.as_bytes());
        assert_eq!(result.verdict(), VerdictState::Refused);
        assert_eq!(result.grade(), 0.0);
        assert_eq!(result.rationale, "Violent content.");
    }

    #[test]
    fn test_missing_grade_is_incomplete() {
        let mut parser = VerdictParser::new(subject(0.5));
        parser.feed(b"### Problem\nSomething\n### Why It Failed\nBecause");
        parser.mark_truncated();
        let result = parser.finish();

        assert_eq!(result.verdict(), VerdictState::Incomplete);
        assert_eq!(result.severity(), SeverityLevel::High);
        assert_eq!(result.rationale, "Because");
        let kinds: Vec<DiagnosticKind> = result.diagnostics.iter().map(|d| d.kind).collect();
        assert!(kinds.contains(&DiagnosticKind::TruncatedStream));
        assert!(kinds.contains(&DiagnosticKind::MissingSection));
    }

    #[test]
    fn test_missing_problem_is_incomplete() {
        let result = VerdictParser::parse(subject(0.0), b"### Grade\nSeverity: Safe\n");
        assert_eq!(result.verdict(), VerdictState::Incomplete);
        assert!(!result.passed());
    }

    #[test]
    fn test_grade_without_severity_is_incomplete() {
        let result =
            VerdictParser::parse(subject(0.5), b"### Problem\nx\n### Grade\nScore: 0.67/1\n");
        assert_eq!(result.verdict(), VerdictState::Incomplete);
        assert!(result
            .diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::MalformedGrade));
    }

    #[test]
    fn test_unrecognized_heading_kept_in_current_field() {
        let text = "### Problem\nFirst line\n### Details\nSecond line\n### Grade\nSeverity: Low\n";
        let result = VerdictParser::parse(subject(0.5), text.as_bytes());
        assert_eq!(result.problem, "First line\n### Details\nSecond line");
        assert_eq!(result.verdict(), VerdictState::Passed);
    }

    #[test]
    fn test_out_of_order_heading_is_text() {
        let text = "### Problem\nA\n### What To Fix\nB\n### Why It Failed\nC\n### Grade\nSeverity: Low\n";
        let result = VerdictParser::parse(subject(0.5), text.as_bytes());
        assert_eq!(result.fix, "B\n### Why It Failed\nC");
        assert!(result.rationale.is_empty());
        assert_eq!(result.diagnostics[0].kind, DiagnosticKind::OutOfOrderSection);
    }

    #[test]
    fn test_pause_and_resume() {
        let mut parser = VerdictParser::new(subject(0.5));
        parser.feed(b"### Problem\nPart one ");
        parser.pause();
        assert_eq!(parser.state(), ParserState::SectionComplete(Section::Problem));
        parser.feed(b"part two\n### Grade\nSeverity: Safe\n");
        assert_eq!(parser.state(), ParserState::InSection(Section::Grade));

        let result = parser.finish();
        assert_eq!(result.problem, "Part one part two");
    }

    #[test]
    fn test_crlf_lines() {
        let text = "### Problem\r\nA\r\n### Grade\r\nSeverity: Medium\r\n";
        let result = VerdictParser::parse(subject(0.3), text.as_bytes());
        assert_eq!(result.problem, "A");
        assert!(result.passed());
    }
}
