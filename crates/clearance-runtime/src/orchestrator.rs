//! Scan orchestrator.
//!
//! Drives one session through its lifecycle:
//! - Opens the model stream with retry
//! - Demultiplexes it and feeds one parser task per policy
//! - Joins the verdicts and runs remediation when anything failed
//! - Writes the audit trail
//!
//! The stream deadline and explicit cancellation both drop the model stream
//! and abort every parser task still running.

use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use clearance_core::{
    AggregateRequest, AggregationEngine, AggregationFormatError, AggregationRecord,
    ComplianceResult, ConfigError, DemuxEvent, FailureKind, FailureReport, PolicyRegistry,
    PolicySource, Remediation, RequestLimits, ResolvedPolicySet, ScanRequest, ScanResponse,
    ScanSession, SessionOutcome, SessionState, StreamDemultiplexer, ValidationError,
    VerdictParser, VerdictState, VerdictSubject,
};

use crate::audit::{AuditEvent, AuditLogger, AuditWriteError};
use crate::config::{RuntimeConfig, SettingsError};
use crate::prompts::evaluation_messages;
use crate::providers::{
    ChatMessage, CompletionConfig, ModelChunk, ModelProvider, ProviderError, RetryingProvider,
};
use crate::remediation::{RemediationClient, RemediationError};

/// Errors from the runtime orchestrator.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("Policy configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Provider not configured: {0}")]
    ProviderNotConfigured(String),

    #[error("Model call failed: {0}")]
    Upstream(#[from] ProviderError),

    #[error("Malformed remediation response: {0}")]
    AggregationFormat(#[from] AggregationFormatError),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Runtime configuration error: {0}")]
    Settings(#[from] SettingsError),

    #[error("Audit trail unavailable: {0}")]
    Audit(#[from] AuditWriteError),
}

impl From<RemediationError> for RuntimeError {
    fn from(error: RemediationError) -> Self {
        match error {
            RemediationError::Upstream(e) => RuntimeError::Upstream(e),
            RemediationError::Format(e) => RuntimeError::AggregationFormat(e),
            RemediationError::Timeout(d) => RuntimeError::Timeout(d),
        }
    }
}

/// Input for one policy's parser task.
#[derive(Debug)]
enum ParserInput {
    Data(Vec<u8>),
    Pause,
    Truncated,
}

/// Why the streaming phase stopped.
enum StreamEnd {
    Finished {
        results: Vec<ComplianceResult>,
        truncated: bool,
    },
    Upstream(ProviderError),
    Internal(String),
    TimedOut,
    Cancelled,
}

/// Routes demultiplexer events to per-policy parser tasks.
struct ParserPool<'a> {
    set: &'a ResolvedPolicySet,
    senders: HashMap<String, mpsc::UnboundedSender<ParserInput>>,
    tasks: JoinSet<ComplianceResult>,
}

impl<'a> ParserPool<'a> {
    fn new(set: &'a ResolvedPolicySet) -> Self {
        Self {
            set,
            senders: HashMap::new(),
            tasks: JoinSet::new(),
        }
    }

    fn dispatch(&mut self, events: Vec<DemuxEvent>) {
        for event in events {
            match event {
                DemuxEvent::Opened {
                    policy_id,
                    unknown_policy,
                } => {
                    if unknown_policy {
                        tracing::warn!(policy = %policy_id, "Model emitted a region for an unknown policy");
                    }
                    let sender = self.spawn_parser(self.set.subject(&policy_id));
                    self.senders.insert(policy_id, sender);
                }
                DemuxEvent::Reopened { policy_id } => {
                    tracing::debug!(policy = %policy_id, "Policy region reopened");
                }
                DemuxEvent::Data { policy_id, bytes } => self.send(&policy_id, ParserInput::Data(bytes)),
                DemuxEvent::Closed { policy_id } => self.send(&policy_id, ParserInput::Pause),
            }
        }
    }

    fn spawn_parser(&mut self, subject: VerdictSubject) -> mpsc::UnboundedSender<ParserInput> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.tasks.spawn(async move {
            let mut parser = VerdictParser::new(subject);
            while let Some(input) = rx.recv().await {
                match input {
                    ParserInput::Data(bytes) => parser.feed(&bytes),
                    ParserInput::Pause => parser.pause(),
                    ParserInput::Truncated => parser.mark_truncated(),
                }
            }
            parser.finish()
        });
        tx
    }

    fn send(&self, policy_id: &str, input: ParserInput) {
        if let Some(sender) = self.senders.get(policy_id) {
            // The receiver only goes away when the task was aborted.
            let _ = sender.send(input);
        }
    }

    fn mark_truncated(&self) {
        for sender in self.senders.values() {
            let _ = sender.send(ParserInput::Truncated);
        }
    }

    /// Close every channel and wait for all parsers to finish.
    async fn join(mut self) -> Result<Vec<ComplianceResult>, String> {
        self.senders.clear();
        let mut results = Vec::with_capacity(self.tasks.len());
        while let Some(joined) = self.tasks.join_next().await {
            results.push(joined.map_err(|e| format!("Parser task failed: {}", e))?);
        }
        Ok(results)
    }
}

/// Runs scan sessions against a shared provider, registry and audit trail.
pub struct ScanOrchestrator {
    /// Model provider, already wrapped with retry
    provider: Arc<dyn ModelProvider>,

    /// Policy registry; reload it to change policies for new sessions
    registry: Arc<PolicyRegistry>,

    /// Audit trail shared by all sessions
    audit: Arc<AuditLogger>,

    engine: AggregationEngine,
    remediation: RemediationClient,
    limits: RequestLimits,
    completion: CompletionConfig,
    stream_timeout: Duration,
}

impl ScanOrchestrator {
    pub fn builder() -> ScanOrchestratorBuilder {
        ScanOrchestratorBuilder::new()
    }

    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    /// Run a scan to completion.
    pub async fn scan(&self, request: ScanRequest) -> Result<ScanResponse, RuntimeError> {
        self.scan_with_cancellation(request, CancellationToken::new())
            .await
    }

    /// Run a scan that stops early when `cancel` fires.
    ///
    /// Only request validation errors are returned as `Err`. Once a session
    /// exists, every outcome (including upstream failure, timeout and
    /// cancellation) is reported in the response.
    pub async fn scan_with_cancellation(
        &self,
        request: ScanRequest,
        cancel: CancellationToken,
    ) -> Result<ScanResponse, RuntimeError> {
        self.limits.validate(&request)?;
        let snapshot = self.registry.current();
        let set = snapshot.resolve(request.policy_set_id.as_deref())?;

        let request_id = Uuid::new_v4().to_string();
        let messages = evaluation_messages(&set, &request);
        let mut session = ScanSession::new(request_id.clone(), request, set);
        let mut warnings = Vec::new();

        tracing::info!(
            request_id = %request_id,
            policy_set = %session.policy_set().id,
            policies = session.policy_set().policies.len(),
            "Scan started"
        );
        self.record(
            &mut warnings,
            AuditEvent::session_start(
                &request_id,
                session.policy_set(),
                session.prompt(),
                session.documents(),
            ),
        );

        let end = tokio::select! {
            biased;
            _ = cancel.cancelled() => StreamEnd::Cancelled,
            streamed = tokio::time::timeout(
                self.stream_timeout,
                self.run_stream(&mut session, messages),
            ) => streamed.unwrap_or(StreamEnd::TimedOut),
        };

        let mut outcome = None;
        let mut aggregation = None;
        let (terminal, failure) = match end {
            StreamEnd::Finished { results, truncated } => {
                if truncated {
                    tracing::warn!(request_id = %request_id, "Model stream ended without end marker");
                }
                session.set_results(results);
                self.record_verdicts(&session, &mut warnings);

                let session_outcome = self.engine.outcome(session.results(), session.policy_set());
                let aggregated = self
                    .aggregate_session(&mut session, &session_outcome, &mut warnings)
                    .await;
                outcome = Some(session_outcome);
                match aggregated {
                    Ok(record) => {
                        aggregation = record;
                        (SessionState::Completed, None)
                    }
                    Err(report) => (SessionState::Failed, Some(report)),
                }
            }
            StreamEnd::TimedOut => {
                session.discard_results();
                let report = FailureReport::new(
                    FailureKind::Timeout,
                    format!("Model stream did not complete within {:?}", self.stream_timeout),
                );
                (SessionState::TimedOut, Some(report))
            }
            StreamEnd::Cancelled => (
                SessionState::Failed,
                Some(FailureReport::new(FailureKind::Cancelled, "Scan cancelled")),
            ),
            StreamEnd::Upstream(e) => (
                SessionState::Failed,
                Some(FailureReport::new(FailureKind::Upstream, e.to_string())),
            ),
            StreamEnd::Internal(message) => (
                SessionState::Failed,
                Some(FailureReport::new(FailureKind::Internal, message)),
            ),
        };

        if let Some(report) = &failure {
            tracing::warn!(
                request_id = %request_id,
                kind = ?report.kind,
                error = %report.message,
                "Scan session failed"
            );
            self.record(
                &mut warnings,
                AuditEvent::error(&request_id, None, report.message.clone()),
            );
        }
        if let Err(e) = session.transition(terminal) {
            tracing::error!(request_id = %request_id, error = %e, "Invalid terminal transition");
        }

        let weighted_score = outcome.as_ref().and_then(|o| o.weighted_score);
        self.record(
            &mut warnings,
            AuditEvent::session_end(&request_id, session.state(), weighted_score, failure.as_ref()),
        );

        tracing::info!(
            request_id = %request_id,
            state = %session.state(),
            results = session.results().len(),
            "Scan finished"
        );

        Ok(ScanResponse {
            request_id,
            results: session.results().to_vec(),
            session_state: session.state(),
            critical_concern: outcome.as_ref().and_then(|o| o.critical_concern.clone()),
            weighted_score,
            aggregation,
            failure,
            audit_warnings: warnings,
        })
    }

    /// Run remediation for results supplied by the caller.
    ///
    /// Every result must name a registered policy and must have failed.
    pub async fn aggregate(&self, request: AggregateRequest) -> Result<Remediation, RuntimeError> {
        let snapshot = self.registry.current();
        let remediation_request = self.engine.standalone_request(request, &snapshot)?;
        let remediation = self
            .remediation
            .remediate(&remediation_request, snapshot.policies())
            .await?;

        let request_id = Uuid::new_v4().to_string();
        let record = AggregationRecord::new(remediation_request, remediation.clone());
        let mut warnings = Vec::new();
        self.record(&mut warnings, AuditEvent::aggregation(&request_id, &record));

        Ok(remediation)
    }

    /// Stream, demultiplex and parse. Dropping the returned future aborts
    /// the model stream and every parser task.
    async fn run_stream(&self, session: &mut ScanSession, messages: Vec<ChatMessage>) -> StreamEnd {
        let mut stream = match self.provider.open_stream(messages, &self.completion).await {
            Ok(stream) => stream,
            Err(e) => return StreamEnd::Upstream(e),
        };
        if let Err(e) = session.transition(SessionState::Streaming) {
            return StreamEnd::Internal(e.to_string());
        }

        let set = session.policy_set().clone();
        let mut demux = StreamDemultiplexer::new(set.policy_ids());
        let mut parsers = ParserPool::new(&set);
        let mut ended = false;

        while let Some(item) = stream.next().await {
            match item {
                Ok(ModelChunk::Text(text)) => parsers.dispatch(demux.push(text.as_bytes())),
                Ok(ModelChunk::End) => {
                    ended = true;
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        request_id = %session.request_id(),
                        error = %e,
                        "Model stream failed"
                    );
                    return StreamEnd::Upstream(e);
                }
            }
        }
        drop(stream);

        parsers.dispatch(demux.finish());
        if !ended {
            parsers.mark_truncated();
        }

        if let Err(e) = session.transition(SessionState::Parsing) {
            return StreamEnd::Internal(e.to_string());
        }

        match parsers.join().await {
            Ok(results) => StreamEnd::Finished {
                results,
                truncated: !ended,
            },
            Err(message) => StreamEnd::Internal(message),
        }
    }

    /// Run remediation when anything failed, moving the session to
    /// `Aggregating` first. `Ok(None)` when every policy passed.
    async fn aggregate_session(
        &self,
        session: &mut ScanSession,
        outcome: &SessionOutcome,
        warnings: &mut Vec<String>,
    ) -> Result<Option<AggregationRecord>, FailureReport> {
        let Some(request) = self.engine.remediation_request(outcome, session.prompt()) else {
            return Ok(None);
        };

        session
            .transition(SessionState::Aggregating)
            .map_err(|e| FailureReport::new(FailureKind::Internal, e.to_string()))?;

        tracing::info!(
            request_id = %session.request_id(),
            failed = ?outcome.failed_ids(),
            critical = %request.critical_concern.policy_id,
            "Requesting remediation"
        );

        let remediation = self
            .remediation
            .remediate(&request, &session.policy_set().policies)
            .await
            .map_err(|e| {
                let kind = match &e {
                    RemediationError::Upstream(_) => FailureKind::Upstream,
                    RemediationError::Format(_) => FailureKind::AggregationFormat,
                    RemediationError::Timeout(_) => FailureKind::Timeout,
                };
                FailureReport::new(kind, e.to_string())
            })?;

        let record = AggregationRecord::new(request, remediation);
        self.record(warnings, AuditEvent::aggregation(session.request_id(), &record));
        Ok(Some(record))
    }

    fn record_verdicts(&self, session: &ScanSession, warnings: &mut Vec<String>) {
        let request_id = session.request_id();
        for result in session.results() {
            self.record(warnings, AuditEvent::policy_verdict(request_id, result));
            if result.verdict() == VerdictState::Incomplete {
                let detail: Vec<&str> = result
                    .diagnostics
                    .iter()
                    .map(|d| d.message.as_str())
                    .collect();
                self.record(
                    warnings,
                    AuditEvent::error(
                        request_id,
                        Some(&result.policy_id),
                        format!("Verdict incomplete: {}", detail.join("; ")),
                    ),
                );
            }
        }
    }

    /// Append to the audit trail. Failures never abort the session: they
    /// become response warnings plus a best-effort `Error` entry.
    fn record(&self, warnings: &mut Vec<String>, event: AuditEvent) {
        let request_id = event.request_id.clone();
        let entry_type = event.entry_type;
        if let Err(e) = self.audit.append(event) {
            tracing::warn!(
                request_id = %request_id,
                entry_type = %entry_type,
                error = %e,
                "Audit append failed"
            );
            warnings.push(format!("Failed to record {} entry: {}", entry_type, e));
            let _ = self.audit.append(AuditEvent::error(
                &request_id,
                None,
                format!("Failed to record {} entry: {}", entry_type, e),
            ));
        }
    }
}

/// Builder for [`ScanOrchestrator`].
pub struct ScanOrchestratorBuilder {
    provider: Option<Arc<dyn ModelProvider>>,
    registry: Option<Arc<PolicyRegistry>>,
    audit: Option<Arc<AuditLogger>>,
    config: RuntimeConfig,
}

impl ScanOrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            provider: None,
            registry: None,
            audit: None,
            config: RuntimeConfig::default(),
        }
    }

    /// Set the model provider. It is wrapped with retry on build.
    pub fn provider(mut self, provider: Arc<dyn ModelProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Use an already loaded registry instead of `config.policy_file`.
    pub fn registry(mut self, registry: Arc<PolicyRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use this audit logger instead of opening `config.audit.directory`.
    pub fn audit_logger(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<ScanOrchestrator, RuntimeError> {
        let config = self.config;
        let provider = self
            .provider
            .ok_or_else(|| RuntimeError::ProviderNotConfigured("No provider set".to_string()))?;
        let provider: Arc<dyn ModelProvider> =
            Arc::new(RetryingProvider::new(provider, config.retry.clone()));

        let registry = match self.registry {
            Some(registry) => registry,
            None => Arc::new(PolicyRegistry::load(&PolicySource::file(
                config.policy_file.clone(),
            ))?),
        };
        let audit = match self.audit {
            Some(audit) => audit,
            None => Arc::new(AuditLogger::open(&config.audit)?),
        };

        let remediation = RemediationClient::new(
            provider.clone(),
            config.completion.clone(),
            config.remediation_timeout,
        );

        Ok(ScanOrchestrator {
            provider,
            registry,
            audit,
            engine: AggregationEngine::new(),
            remediation,
            limits: config.limits,
            completion: config.completion,
            stream_timeout: config.stream_timeout,
        })
    }
}

impl Default for ScanOrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
