//! Policy file parsing from YAML/JSON.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::schema::validate_policy_schema;

lazy_static! {
    static ref POLICY_ID_PATTERN: Regex = Regex::new(r"^[A-Za-z0-9_-]+$").unwrap();
}

/// Task header used when a policy set does not define its own.
pub const DEFAULT_TASK: &str =
    "Evaluate the following input against all compliance categories defined in the system prompt.";

/// Name of the implicit set used when a file defines none.
pub const IMPLICIT_POLICY_SET: &str = "default";

/// Errors that can occur when loading a policy registry.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read policy file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Policy file does not match schema: {}", .0.join("; "))]
    SchemaError(Vec<String>),

    #[error("Duplicate policy ID: {0}")]
    DuplicatePolicyId(String),

    #[error("Threshold {threshold} for policy '{id}' is outside [0, 1]")]
    ThresholdOutOfRange { id: String, threshold: f64 },

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("Duplicate policy set ID: {0}")]
    DuplicatePolicySet(String),

    #[error("Default policy set '{0}' is not defined")]
    UnknownDefaultSet(String),
}

/// Where a policy registry is loaded from.
#[derive(Debug, Clone)]
pub enum PolicySource {
    /// Inline YAML document
    Yaml(String),
    /// Inline JSON document
    Json(String),
    /// File on disk; `.json` is parsed as JSON, anything else as YAML
    File(PathBuf),
}

impl PolicySource {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        PolicySource::File(path.into())
    }

    /// Read and validate the policy file this source points to.
    pub fn read(&self) -> Result<PolicyFile, ConfigError> {
        match self {
            PolicySource::Yaml(yaml) => PolicyFile::from_yaml(yaml),
            PolicySource::Json(json) => PolicyFile::from_json(json),
            PolicySource::File(path) => PolicyFile::from_file(path),
        }
    }
}

/// A single compliance policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyDefinition {
    /// Unique, stable identifier (e.g., "content_safety")
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// What the policy checks for
    pub description: String,

    /// Evaluation template; the built-in template is used when absent
    #[serde(default)]
    pub template: Option<String>,

    /// Minimum grade required to pass (0.0 - 1.0)
    pub threshold: f64,

    /// Relative weight in the informational weighted score
    #[serde(default)]
    pub weight: Option<f64>,
}

impl PolicyDefinition {
    /// Weight with the default of 1.0 applied.
    pub fn effective_weight(&self) -> f64 {
        self.weight.unwrap_or(1.0)
    }
}

/// A named selection of policies plus the task header for its prompts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicySetDefinition {
    pub id: String,

    #[serde(default)]
    pub task: Option<String>,

    /// Policy ids or names to include; empty means all
    #[serde(default)]
    pub include: Vec<String>,

    /// Policy ids or names to exclude; wins over include
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl PolicySetDefinition {
    /// The set every file gets when it defines none.
    pub fn implicit() -> Self {
        Self {
            id: IMPLICIT_POLICY_SET.to_string(),
            task: None,
            include: vec![],
            exclude: vec![],
        }
    }

    pub fn task(&self) -> &str {
        self.task.as_deref().unwrap_or(DEFAULT_TASK)
    }

    /// Whether a policy belongs to this set. Terms match id or name,
    /// case-insensitively.
    pub fn selects(&self, policy: &PolicyDefinition) -> bool {
        let matches = |terms: &[String]| {
            terms.iter().any(|t| {
                let t = t.trim();
                t.eq_ignore_ascii_case(&policy.id) || t.eq_ignore_ascii_case(&policy.name)
            })
        };

        if !self.include.is_empty() && !matches(&self.include) {
            return false;
        }
        !matches(&self.exclude)
    }
}

/// A parsed and validated policy file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyFile {
    pub policies: Vec<PolicyDefinition>,

    #[serde(default)]
    pub policy_sets: Vec<PolicySetDefinition>,

    #[serde(default)]
    pub default_policy_set: Option<String>,
}

impl PolicyFile {
    /// Parse a policy file from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value = serde_yaml::from_str(yaml)?;
        Self::from_value(value)
    }

    /// Parse a policy file from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    /// Parse a policy file from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        tracing::debug!(path = %path.display(), "Read policy file");

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&contents),
            _ => Self::from_yaml(&contents),
        }
    }

    fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        validate_policy_schema(&value).map_err(ConfigError::SchemaError)?;
        let file: PolicyFile = serde_json::from_value(value)?;
        file.validate()?;
        Ok(file)
    }

    /// Validate the semantic rules the schema cannot express.
    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();

        for policy in &self.policies {
            if !seen.insert(policy.id.as_str()) {
                return Err(ConfigError::DuplicatePolicyId(policy.id.clone()));
            }

            if !POLICY_ID_PATTERN.is_match(&policy.id) {
                return Err(ConfigError::InvalidField {
                    field: format!("policies[{}].id", policy.id),
                    reason: "must match ^[A-Za-z0-9_-]+$".to_string(),
                });
            }

            if !policy.threshold.is_finite() || !(0.0..=1.0).contains(&policy.threshold) {
                return Err(ConfigError::ThresholdOutOfRange {
                    id: policy.id.clone(),
                    threshold: policy.threshold,
                });
            }

            if policy.name.trim().is_empty() || policy.name.chars().count() > 100 {
                return Err(ConfigError::InvalidField {
                    field: format!("policies[{}].name", policy.id),
                    reason: "must be 1-100 characters".to_string(),
                });
            }

            if policy.description.trim().is_empty() {
                return Err(ConfigError::InvalidField {
                    field: format!("policies[{}].description", policy.id),
                    reason: "must not be empty".to_string(),
                });
            }

            if let Some(weight) = policy.weight {
                if !weight.is_finite() || weight <= 0.0 {
                    return Err(ConfigError::InvalidField {
                        field: format!("policies[{}].weight", policy.id),
                        reason: "must be a positive number".to_string(),
                    });
                }
            }
        }

        let mut set_ids = HashSet::new();
        for set in &self.policy_sets {
            if !set_ids.insert(set.id.as_str()) {
                return Err(ConfigError::DuplicatePolicySet(set.id.clone()));
            }
        }

        if let Some(default) = &self.default_policy_set {
            let known = set_ids.contains(default.as_str())
                || (self.policy_sets.is_empty() && default == IMPLICIT_POLICY_SET);
            if !known {
                return Err(ConfigError::UnknownDefaultSet(default.clone()));
            }
        }

        Ok(())
    }

    /// Policy sets with the implicit set filled in when none are defined.
    pub fn effective_policy_sets(&self) -> Vec<PolicySetDefinition> {
        if self.policy_sets.is_empty() {
            vec![PolicySetDefinition::implicit()]
        } else {
            self.policy_sets.clone()
        }
    }

    /// Default set id: explicit, else the first defined set.
    pub fn effective_default_set(&self) -> String {
        self.default_policy_set.clone().unwrap_or_else(|| {
            self.policy_sets
                .first()
                .map(|s| s.id.clone())
                .unwrap_or_else(|| IMPLICIT_POLICY_SET.to_string())
        })
    }
}
