//! Runtime configuration.
//!
//! Loaded from YAML with a default for every field, then overridden from
//! the environment. Durations are written in human form (`"60s"`, `"1h"`).

use clearance_core::RequestLimits;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::providers::{CompletionConfig, RetryConfig};

/// Azure OpenAI API version used when none is configured.
pub const DEFAULT_AZURE_API_VERSION: &str = "2024-02-15-preview";

/// Errors loading runtime configuration.
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid value for {key}: {reason}")]
    InvalidOverride { key: String, reason: String },
}

pub(crate) mod duration_human {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

/// Audit trail settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Directory holding the audit segments
    pub directory: PathBuf,

    /// Rotate before a segment would grow past this many bytes
    pub max_segment_bytes: u64,

    /// Rotate once a segment has been open this long
    #[serde(with = "duration_human")]
    pub max_segment_age: Duration,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("audit"),
            max_segment_bytes: 10 * 1024 * 1024,
            max_segment_age: Duration::from_secs(60 * 60),
        }
    }
}

/// Azure OpenAI connection settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AzureConfig {
    pub endpoint: Option<String>,
    pub deployment: Option<String>,
    pub api_version: String,

    /// Never written back out; prefer `AZURE_OPENAI_KEY`.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            deployment: None,
            api_version: DEFAULT_AZURE_API_VERSION.to_string(),
            api_key: None,
        }
    }
}

impl fmt::Debug for AzureConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureConfig")
            .field("endpoint", &self.endpoint)
            .field("deployment", &self.deployment)
            .field("api_version", &self.api_version)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Everything the runtime needs besides the policy file contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Policy registry file (YAML or JSON)
    pub policy_file: PathBuf,

    /// Deadline for the whole evaluation stream
    #[serde(with = "duration_human")]
    pub stream_timeout: Duration,

    /// Deadline for the remediation call
    #[serde(with = "duration_human")]
    pub remediation_timeout: Duration,

    pub limits: RequestLimits,
    pub retry: RetryConfig,
    pub completion: CompletionConfig,
    pub audit: AuditConfig,
    pub azure: AzureConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            policy_file: PathBuf::from("policies/compliances.yaml"),
            stream_timeout: Duration::from_secs(60),
            remediation_timeout: Duration::from_secs(60),
            limits: RequestLimits::default(),
            retry: RetryConfig::default(),
            completion: CompletionConfig::default(),
            audit: AuditConfig::default(),
            azure: AzureConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, SettingsError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    /// Apply `CLEARANCE_*` and `AZURE_OPENAI_*` variables from the process
    /// environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), SettingsError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), SettingsError> {
        if let Some(v) = lookup("CLEARANCE_POLICY_FILE") {
            self.policy_file = PathBuf::from(v);
        }
        if let Some(v) = lookup("CLEARANCE_STREAM_TIMEOUT") {
            self.stream_timeout = parse_duration("CLEARANCE_STREAM_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("CLEARANCE_REMEDIATION_TIMEOUT") {
            self.remediation_timeout = parse_duration("CLEARANCE_REMEDIATION_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("CLEARANCE_AUDIT_DIR") {
            self.audit.directory = PathBuf::from(v);
        }
        if let Some(v) = lookup("CLEARANCE_MAX_DOCUMENTS") {
            self.limits.max_documents =
                v.trim()
                    .parse()
                    .map_err(|e: std::num::ParseIntError| SettingsError::InvalidOverride {
                        key: "CLEARANCE_MAX_DOCUMENTS".to_string(),
                        reason: e.to_string(),
                    })?;
        }
        if let Some(v) = lookup("AZURE_OPENAI_ENDPOINT") {
            self.azure.endpoint = Some(v);
        }
        if let Some(v) = lookup("AZURE_OPENAI_DEPLOYMENT") {
            self.azure.deployment = Some(v);
        }
        if let Some(v) = lookup("AZURE_OPENAI_API_VERSION") {
            self.azure.api_version = v;
        }
        if let Some(v) = lookup("AZURE_OPENAI_KEY") {
            self.azure.api_key = Some(v);
        }
        Ok(())
    }
}

fn parse_duration(key: &str, value: &str) -> Result<Duration, SettingsError> {
    humantime::parse_duration(value.trim()).map_err(|e| SettingsError::InvalidOverride {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_yaml_gives_defaults() {
        let config = RuntimeConfig::from_yaml("").unwrap();
        assert_eq!(config.stream_timeout, Duration::from_secs(60));
        assert_eq!(config.azure.api_version, DEFAULT_AZURE_API_VERSION);
        assert_eq!(config.limits.max_documents, 10);
    }

    #[test]
    fn test_human_durations() {
        let yaml = r#"
stream_timeout: 90s
audit:
  max_segment_age: 2h
  max_segment_bytes: 4096
retry:
  max_attempts: 5
  min_delay: 250ms
"#;
        let config = RuntimeConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.stream_timeout, Duration::from_secs(90));
        assert_eq!(config.audit.max_segment_age, Duration::from_secs(7200));
        assert_eq!(config.audit.max_segment_bytes, 4096);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.min_delay, Duration::from_millis(250));
        assert_eq!(config.retry.max_delay, Duration::from_secs(10));
    }

    #[test]
    fn test_bad_duration_rejected() {
        assert!(RuntimeConfig::from_yaml("stream_timeout: soon").is_err());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("CLEARANCE_STREAM_TIMEOUT", "5s"),
            ("AZURE_OPENAI_ENDPOINT", "https://example.openai.azure.com"),
            ("AZURE_OPENAI_KEY", "secret"),
        ]
        .into_iter()
        .collect();

        let mut config = RuntimeConfig::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.stream_timeout, Duration::from_secs(5));
        assert_eq!(config.azure.api_key.as_deref(), Some("secret"));
        assert!(!format!("{:?}", config).contains("secret"));
    }

    #[test]
    fn test_invalid_override_reports_key() {
        let mut config = RuntimeConfig::default();
        let err = config
            .apply_overrides(|k| (k == "CLEARANCE_MAX_DOCUMENTS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("CLEARANCE_MAX_DOCUMENTS"));
    }

    #[test]
    fn test_api_key_not_serialized() {
        let mut config = RuntimeConfig::default();
        config.azure.api_key = Some("secret".to_string());
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(!yaml.contains("secret"));
        assert!(yaml.contains("stream_timeout: 1m"));
    }
}
