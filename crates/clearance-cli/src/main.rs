//! Clearance command line.
//!
//! ```text
//! clearance scan "Summarize this contract" --document contract.txt
//! clearance scan --prompt-file prompt.txt --replay transcript.txt
//! clearance aggregate failures.json
//! clearance check-policies
//! ```
//!
//! Results are printed to stdout as JSON. Diagnostics go to stderr and are
//! filtered with `RUST_LOG` (default `info`).

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use clearance_core::{AggregateRequest, PolicyRegistry, PolicySource, ScanRequest, ScanResponse, SessionState};
use clearance_runtime::{CancellationToken, ModelProvider, RuntimeConfig, ScanOrchestrator, ScriptedProvider};

/// Exit code when the session completed and every policy passed.
const EXIT_CLEAR: u8 = 0;
/// Exit code when a policy failed or the session did not complete.
const EXIT_FLAGGED: u8 = 1;
/// Exit code for usage, configuration and I/O errors.
const EXIT_ERROR: u8 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "clearance",
    version,
    about = "Streaming compliance scans for model prompts",
    long_about = "Clearance evaluates a prompt and its documents against a registry of compliance policies in a single streamed model call, and suggests remediation when policies fail."
)]
struct Cli {
    /// Runtime settings file (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Policy file, overrides `policy_file` from the settings
    #[arg(short, long, global = true)]
    policies: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan a prompt against a policy set
    Scan(ScanArgs),

    /// Request remediation for failed results read from a JSON file
    Aggregate(AggregateArgs),

    /// Validate the policy file and list its policy sets
    CheckPolicies,
}

#[derive(clap::Args, Debug)]
struct ScanArgs {
    /// Prompt to scan
    #[arg(required_unless_present = "prompt_file", conflicts_with = "prompt_file")]
    prompt: Option<String>,

    /// Read the prompt from a file
    #[arg(long)]
    prompt_file: Option<PathBuf>,

    /// Supporting document (repeatable)
    #[arg(short, long = "document")]
    documents: Vec<PathBuf>,

    /// Policy set to evaluate, defaults to the registry's default set
    #[arg(short = 's', long)]
    policy_set: Option<String>,

    #[command(flatten)]
    replay: ReplayArgs,
}

#[derive(clap::Args, Debug)]
struct AggregateArgs {
    /// JSON file with `failedResults` and `originalPrompt`
    input: PathBuf,

    #[command(flatten)]
    replay: ReplayArgs,
}

/// Offline provider settings: replay recorded model output instead of
/// calling a live deployment.
#[derive(clap::Args, Debug)]
struct ReplayArgs {
    /// Recorded evaluation stream to replay
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Characters per replayed chunk
    #[arg(long, default_value_t = 64, value_parser = clap::value_parser!(u64).range(1..))]
    chunk_size: u64,

    /// Recorded remediation response to replay
    #[arg(long)]
    replay_remediation: Option<PathBuf>,
}

impl ReplayArgs {
    fn is_offline(&self) -> bool {
        self.replay.is_some() || self.replay_remediation.is_some()
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {}", e);
            return ExitCode::from(EXIT_ERROR);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(EXIT_ERROR)
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let config = load_config(cli.config.as_deref(), cli.policies.as_deref())?;

    match cli.command {
        Command::Scan(args) => scan(config, args).await,
        Command::Aggregate(args) => aggregate(config, args).await,
        Command::CheckPolicies => check_policies(&config),
    }
}

fn load_config(path: Option<&Path>, policies: Option<&Path>) -> Result<RuntimeConfig> {
    let mut config = match path {
        Some(path) => RuntimeConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    config
        .apply_env_overrides()
        .context("Invalid settings in environment")?;
    if let Some(policies) = policies {
        config.policy_file = policies.to_path_buf();
    }
    Ok(config)
}

async fn scan(config: RuntimeConfig, args: ScanArgs) -> Result<u8> {
    let prompt = match (&args.prompt, &args.prompt_file) {
        (Some(prompt), _) => prompt.clone(),
        (None, Some(path)) => read_text(path)?,
        (None, None) => bail!("A prompt or --prompt-file is required"),
    };
    let documents = args
        .documents
        .iter()
        .map(|path| read_text(path))
        .collect::<Result<Vec<_>>>()?;

    let request = ScanRequest {
        prompt,
        documents,
        policy_set_id: args.policy_set.clone(),
    };

    let orchestrator = build_orchestrator(config, &args.replay)?;
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling scan");
            on_interrupt.cancel();
        }
    });

    let response = orchestrator
        .scan_with_cancellation(request, cancel)
        .await
        .context("Scan rejected")?;

    print_json(&response)?;
    Ok(scan_exit_code(&response))
}

async fn aggregate(config: RuntimeConfig, args: AggregateArgs) -> Result<u8> {
    let raw = read_text(&args.input)?;
    let request: AggregateRequest = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid aggregation request in {}", args.input.display()))?;

    let orchestrator = build_orchestrator(config, &args.replay)?;
    let remediation = orchestrator
        .aggregate(request)
        .await
        .context("Aggregation failed")?;

    print_json(&remediation)?;
    Ok(EXIT_CLEAR)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PolicyReport {
    policy_file: PathBuf,
    generation: u64,
    default_policy_set: String,
    policies: Vec<PolicySummary>,
    policy_sets: Vec<PolicySetSummary>,
}

#[derive(Debug, Serialize)]
struct PolicySummary {
    id: String,
    name: String,
    threshold: f64,
    weight: f64,
    custom_template: bool,
}

#[derive(Debug, Serialize)]
struct PolicySetSummary {
    id: String,
    policies: Vec<String>,
}

fn check_policies(config: &RuntimeConfig) -> Result<u8> {
    let registry = PolicyRegistry::load(&PolicySource::file(config.policy_file.clone()))
        .with_context(|| format!("Invalid policy file {}", config.policy_file.display()))?;
    let snapshot = registry.current();

    let policies = snapshot
        .policies()
        .iter()
        .map(|p| PolicySummary {
            id: p.id.clone(),
            name: p.name.clone(),
            threshold: p.threshold,
            weight: p.effective_weight(),
            custom_template: p.template.is_some(),
        })
        .collect();

    let mut policy_sets = Vec::new();
    for id in snapshot.policy_set_ids() {
        let set = snapshot
            .resolve(Some(id))
            .with_context(|| format!("Policy set '{}' does not resolve", id))?;
        policy_sets.push(PolicySetSummary {
            id: set.id.clone(),
            policies: set.policy_ids(),
        });
    }

    print_json(&PolicyReport {
        policy_file: config.policy_file.clone(),
        generation: snapshot.generation(),
        default_policy_set: snapshot.default_set().to_string(),
        policies,
        policy_sets,
    })?;
    Ok(EXIT_CLEAR)
}

fn build_orchestrator(config: RuntimeConfig, replay: &ReplayArgs) -> Result<ScanOrchestrator> {
    let provider = build_provider(&config, replay)?;
    ScanOrchestrator::builder()
        .provider(provider)
        .config(config)
        .build()
        .context("Failed to initialize scan orchestrator")
}

fn build_provider(config: &RuntimeConfig, replay: &ReplayArgs) -> Result<Arc<dyn ModelProvider>> {
    if replay.is_offline() {
        return Ok(Arc::new(replay_provider(replay)?));
    }
    live_provider(config)
}

fn replay_provider(replay: &ReplayArgs) -> Result<ScriptedProvider> {
    let transcript = match &replay.replay {
        Some(path) => read_text(path)?,
        None => String::new(),
    };
    let chunk_chars = usize::try_from(replay.chunk_size).context("--chunk-size is too large")?;
    let mut provider = ScriptedProvider::from_transcript(&transcript, chunk_chars);
    if let Some(path) = &replay.replay_remediation {
        provider = provider.with_completion(read_text(path)?);
    }
    tracing::info!(chunk_chars, "Replaying recorded model output");
    Ok(provider)
}

#[cfg(feature = "azure")]
fn live_provider(config: &RuntimeConfig) -> Result<Arc<dyn ModelProvider>> {
    let provider = clearance_runtime::AzureOpenAiProvider::from_config(&config.azure)
        .context("Azure OpenAI is not configured")?;
    Ok(Arc::new(provider))
}

#[cfg(not(feature = "azure"))]
fn live_provider(_config: &RuntimeConfig) -> Result<Arc<dyn ModelProvider>> {
    bail!("No live provider compiled in: rebuild with `--features azure` or pass --replay")
}

fn scan_exit_code(response: &ScanResponse) -> u8 {
    let clear = response.session_state == SessionState::Completed
        && response.failure.is_none()
        && response
            .results
            .iter()
            .filter(|r| r.counts_toward_outcome())
            .all(|r| r.passed());
    if clear {
        EXIT_CLEAR
    } else {
        EXIT_FLAGGED
    }
}

fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", json);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use clearance_core::{ComplianceResult, Findings, SeverityLevel, VerdictSubject};
    use std::io::Write;

    const POLICIES: &str = r#"
policies:
  - id: P1
    name: Content Safety
    description: No harmful content
    threshold: 0.8
  - id: P2
    name: Copyright
    description: No protected works
    threshold: 0.5
policy_sets:
  - id: strict
    include: [P1]
"#;

    fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    fn config_in(dir: &Path) -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.policy_file = write_file(dir, "policies.yaml", POLICIES);
        config.audit.directory = dir.join("audit");
        config
    }

    fn region(id: &str, severity: &str) -> String {
        format!(
            "<<<POLICY:{id}>>>\n### Problem\nNone.\n### Why It Failed\nn/a\n### What To Fix\nn/a\n### Grade\nSeverity: {severity}\n"
        )
    }

    #[test]
    fn test_cli_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_scan() {
        let cli = Cli::try_parse_from([
            "clearance",
            "scan",
            "Hello there",
            "-d",
            "a.txt",
            "-d",
            "b.txt",
            "--policy-set",
            "strict",
        ])
        .unwrap();
        let Command::Scan(args) = cli.command else {
            panic!("expected scan");
        };
        assert_eq!(args.prompt.as_deref(), Some("Hello there"));
        assert_eq!(args.documents.len(), 2);
        assert_eq!(args.policy_set.as_deref(), Some("strict"));
        assert_eq!(args.replay.chunk_size, 64);
    }

    #[test]
    fn test_scan_requires_a_prompt() {
        assert!(Cli::try_parse_from(["clearance", "scan"]).is_err());
        assert!(Cli::try_parse_from(["clearance", "scan", "hi", "--prompt-file", "p.txt"]).is_err());
        assert!(Cli::try_parse_from(["clearance", "scan", "--prompt-file", "p.txt"]).is_ok());
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        assert!(Cli::try_parse_from(["clearance", "scan", "hi", "--replay", "t.txt", "--chunk-size", "0"]).is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["clearance", "check-policies", "--policies", "p.yaml"]).unwrap();
        assert_eq!(cli.policies, Some(PathBuf::from("p.yaml")));
        assert!(matches!(cli.command, Command::CheckPolicies));
    }

    #[test]
    fn test_policies_flag_overrides_settings() {
        let dir = tempfile::tempdir().unwrap();
        let settings = write_file(dir.path(), "clearance.yaml", "policy_file: from-settings.yaml\n");
        let config = load_config(Some(&settings), Some(Path::new("override.yaml"))).unwrap();
        assert_eq!(config.policy_file, PathBuf::from("override.yaml"));
    }

    #[test]
    fn test_check_policies_on_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        assert_eq!(check_policies(&config).unwrap(), EXIT_CLEAR);
    }

    #[test]
    fn test_check_policies_reports_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.policy_file = write_file(dir.path(), "bad.yaml", "policies: []\n");
        assert!(check_policies(&config).is_err());
    }

    #[tokio::test]
    async fn test_replayed_scan_clear() {
        let dir = tempfile::tempdir().unwrap();
        let transcript = format!("{}{}", region("P1", "Safe"), region("P2", "Safe"));
        let replay = ReplayArgs {
            replay: Some(write_file(dir.path(), "transcript.txt", &transcript)),
            chunk_size: 7,
            replay_remediation: None,
        };

        let orchestrator = build_orchestrator(config_in(dir.path()), &replay).unwrap();
        let response = orchestrator.scan(ScanRequest::new("Tell me a joke")).await.unwrap();

        assert_eq!(response.session_state, SessionState::Completed);
        assert_eq!(scan_exit_code(&response), EXIT_CLEAR);
    }

    #[tokio::test]
    async fn test_replayed_scan_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let transcript = format!("{}{}", region("P1", "Safe"), region("P2", "High"));
        let remediation = r#"{
  "Aggregated Summary": "Asks for lyrics.",
  "Recommendations": { "P2": ["Paraphrase", "Link to the source"] },
  "Rephrase Prompt": "Summarize the song's themes"
}"#;
        let replay = ReplayArgs {
            replay: Some(write_file(dir.path(), "transcript.txt", &transcript)),
            chunk_size: 13,
            replay_remediation: Some(write_file(dir.path(), "remediation.json", remediation)),
        };

        let orchestrator = build_orchestrator(config_in(dir.path()), &replay).unwrap();
        let response = orchestrator
            .scan(ScanRequest::new("Print all the lyrics"))
            .await
            .unwrap();

        assert_eq!(response.session_state, SessionState::Completed);
        assert!(response.aggregation.is_some());
        assert_eq!(scan_exit_code(&response), EXIT_FLAGGED);
    }

    #[test]
    fn test_unknown_policy_does_not_flag_session() {
        let stray = ComplianceResult::graded(
            &VerdictSubject::unknown("ZZ"),
            SeverityLevel::High,
            Findings::default(),
            vec![],
        );
        assert!(!stray.passed());

        let response = ScanResponse {
            request_id: "req-1".to_string(),
            results: vec![stray],
            session_state: SessionState::Completed,
            critical_concern: None,
            weighted_score: None,
            aggregation: None,
            failure: None,
            audit_warnings: vec![],
        };
        assert_eq!(scan_exit_code(&response), EXIT_CLEAR);
    }

    #[tokio::test]
    async fn test_replayed_unknown_region_stays_clear() {
        let dir = tempfile::tempdir().unwrap();
        let transcript = format!("{}{}{}", region("P1", "Safe"), region("ZZ", "High"), region("P2", "Safe"));
        let replay = ReplayArgs {
            replay: Some(write_file(dir.path(), "transcript.txt", &transcript)),
            chunk_size: 9,
            replay_remediation: None,
        };

        let orchestrator = build_orchestrator(config_in(dir.path()), &replay).unwrap();
        let response = orchestrator.scan(ScanRequest::new("Tell me a joke")).await.unwrap();

        assert!(response.results.iter().any(|r| r.unknown_policy));
        assert!(response.aggregation.is_none());
        assert_eq!(scan_exit_code(&response), EXIT_CLEAR);
    }

    #[cfg(not(feature = "azure"))]
    #[test]
    fn test_live_provider_requires_feature() {
        let replay = ReplayArgs {
            replay: None,
            chunk_size: 64,
            replay_remediation: None,
        };
        assert!(build_provider(&RuntimeConfig::default(), &replay).is_err());
    }
}
