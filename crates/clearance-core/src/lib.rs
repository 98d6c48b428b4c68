//! # clearance-core
//!
//! Deterministic core of the streaming compliance verdict engine.
//!
//! A generative model evaluates several policies at once and answers in a
//! single stream. This crate turns that stream into structured verdicts:
//!
//! 1. [`StreamDemultiplexer`] splits the stream into per-policy sub-streams
//! 2. [`VerdictParser`] turns each sub-stream into a [`ComplianceResult`]
//! 3. [`AggregationEngine`] computes the session outcome and validates the
//!    remediation response when anything failed
//!
//! ## Key Guarantees
//!
//! 1. **Computed grades**: `grade = round(1 - severity, 2)` and
//!    `passed = grade >= threshold`; nothing else sets `passed`
//! 2. **Fail-closed**: missing or malformed sections yield `Incomplete`,
//!    treated as High severity
//! 3. **Chunk-independent**: the same stream split at any byte boundaries
//!    produces the same verdicts
//! 4. **No I/O**: model calls, audit and timing live in `clearance-runtime`
//!
//! ## Example
//!
//! ```rust,ignore
//! use clearance_core::{evaluate_transcript, PolicyRegistry, PolicySource};
//!
//! let registry = PolicyRegistry::load(&PolicySource::file("policies.yaml"))?;
//! let set = registry.current().resolve(None)?;
//! let results = evaluate_transcript(transcript.as_bytes(), &set);
//! ```

pub mod aggregation;
pub mod demux;
pub mod policy;
pub mod request;
pub mod session;
pub mod types;
pub mod verdict;

// Re-export main types at crate root
pub use aggregation::{
    critical_concern, AggregationEngine, AggregationFormatError, SessionOutcome,
    RECOMMENDATIONS_KEY, REPHRASE_KEY, SUMMARY_KEY,
};
pub use demux::{policy_marker, DemuxEvent, StreamDemultiplexer, SubStream};
pub use policy::{
    ConfigError, PolicyDefinition, PolicyFile, PolicyRegistry, PolicySetDefinition,
    PolicySnapshot, PolicySource, ResolvedPolicySet,
};
pub use request::{document_context, RequestLimits, ValidationError};
pub use session::{order_results, ScanSession, TransitionError};
pub use types::{
    AggregateRequest, AggregationRecord, ComplianceResult, CriticalConcern, Diagnostic,
    DiagnosticKind, FailureKind, FailureReport, Findings, RecommendationPair, Remediation,
    RemediationRequest, ScanRequest, ScanResponse, SessionState, SeverityLevel, VerdictState,
    VerdictSubject,
};
pub use verdict::{ParserState, Section, VerdictParser};

/// Evaluate a complete model transcript against a policy set.
///
/// Runs the demultiplexer and one parser per sub-stream synchronously and
/// returns one verdict per policy in set order, followed by verdicts for
/// unknown policy ids.
pub fn evaluate_transcript(transcript: &[u8], set: &ResolvedPolicySet) -> Vec<ComplianceResult> {
    let mut demux = StreamDemultiplexer::new(set.policy_ids());
    demux.push(transcript);
    demux.finish();

    let results = demux
        .into_sub_streams()
        .into_iter()
        .map(|stream| VerdictParser::parse(set.subject(&stream.policy_id), &stream.buffer))
        .collect();

    order_results(set, results)
}
