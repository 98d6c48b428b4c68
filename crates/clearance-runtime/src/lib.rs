//! # clearance-runtime
//!
//! Async runtime for Clearance scans.
//!
//! `clearance-core` holds the deterministic pieces (policy registry, stream
//! demultiplexer, verdict parser, aggregation). This crate adds everything
//! that talks to the outside world:
//!
//! - [`providers`]: the model provider seam, retry and the Azure OpenAI client
//! - [`orchestrator`]: one scan session from request to response
//! - [`remediation`]: the follow-up call for failed sessions
//! - [`audit`]: the append-only audit trail
//! - [`config`]: runtime settings from YAML and the environment
//!
//! ## Example
//!
//! ```rust,ignore
//! use clearance_runtime::{RuntimeConfig, ScanOrchestrator};
//! use clearance_core::ScanRequest;
//!
//! let config = RuntimeConfig::from_yaml_file("clearance.yaml")?;
//! let orchestrator = ScanOrchestrator::builder()
//!     .provider(provider)
//!     .config(config)
//!     .build()?;
//!
//! let response = orchestrator
//!     .scan(ScanRequest::new("Summarize the attached contract"))
//!     .await?;
//! println!("{:?}", response.session_state);
//! ```

pub mod audit;
pub mod config;
pub mod orchestrator;
pub mod prompts;
pub mod providers;
pub mod remediation;

pub use audit::{
    AuditEntryType, AuditEvent, AuditLogEntry, AuditLogger, AuditWriteError, FileSegmentStore,
    MemorySegmentStore, RotationPolicy, SegmentStore,
};
pub use config::{AuditConfig, AzureConfig, RuntimeConfig, SettingsError, DEFAULT_AZURE_API_VERSION};
pub use orchestrator::{RuntimeError, ScanOrchestrator, ScanOrchestratorBuilder};
pub use providers::{
    ApiCredential, ChatMessage, ChunkStream, CompletionConfig, CredentialSource, ModelChunk,
    ModelProvider, ProviderError, RetryConfig, RetryingProvider, ScriptedProvider,
};
pub use remediation::{RemediationClient, RemediationError};

#[cfg(feature = "azure")]
pub use providers::AzureOpenAiProvider;

pub use tokio_util::sync::CancellationToken;
