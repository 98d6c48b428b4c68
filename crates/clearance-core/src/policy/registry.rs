//! Hot-reloadable policy registry.
//!
//! The registry hands out immutable [`PolicySnapshot`]s behind an `Arc`.
//! A reload builds a complete new snapshot first and then swaps the pointer,
//! so a session that captured a snapshot keeps evaluating against that
//! generation and no reader ever observes a half-applied update.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::definition::{ConfigError, PolicyDefinition, PolicyFile, PolicySetDefinition, PolicySource};
use crate::request::ValidationError;
use crate::types::VerdictSubject;

/// One immutable generation of the registry.
#[derive(Debug)]
pub struct PolicySnapshot {
    generation: u64,
    loaded_at: DateTime<Utc>,
    policies: Vec<PolicyDefinition>,
    sets: BTreeMap<String, PolicySetDefinition>,
    default_set: String,
}

/// A policy set resolved against one snapshot.
#[derive(Debug, Clone)]
pub struct ResolvedPolicySet {
    pub id: String,
    pub task: String,
    pub generation: u64,
    pub policies: Vec<PolicyDefinition>,
}

impl ResolvedPolicySet {
    pub fn policy(&self, id: &str) -> Option<&PolicyDefinition> {
        self.policies.iter().find(|p| p.id == id)
    }

    pub fn policy_ids(&self) -> Vec<String> {
        self.policies.iter().map(|p| p.id.clone()).collect()
    }

    /// Verdict subject for a policy id seen in the model stream. Ids outside
    /// this set get the unknown-policy subject.
    pub fn subject(&self, policy_id: &str) -> VerdictSubject {
        subject_of(self.policy(policy_id), policy_id)
    }

    /// Weight of a policy in the weighted score; 1.0 for unknown ids.
    pub fn weight(&self, policy_id: &str) -> f64 {
        self.policy(policy_id)
            .map(PolicyDefinition::effective_weight)
            .unwrap_or(1.0)
    }
}

impl PolicySnapshot {
    fn build(file: PolicyFile, generation: u64) -> Self {
        let sets = file
            .effective_policy_sets()
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();
        let default_set = file.effective_default_set();

        Self {
            generation,
            loaded_at: Utc::now(),
            policies: file.policies,
            sets,
            default_set,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// All policies in file order.
    pub fn policies(&self) -> &[PolicyDefinition] {
        &self.policies
    }

    pub fn policy(&self, id: &str) -> Option<&PolicyDefinition> {
        self.policies.iter().find(|p| p.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.policy(id).is_some()
    }

    /// Verdict subject for a registered policy, or an unknown subject.
    pub fn subject(&self, policy_id: &str) -> VerdictSubject {
        subject_of(self.policy(policy_id), policy_id)
    }

    pub fn default_set(&self) -> &str {
        &self.default_set
    }

    pub fn policy_set_ids(&self) -> Vec<&str> {
        self.sets.keys().map(|s| s.as_str()).collect()
    }

    /// Resolve a policy set, falling back to the default set.
    ///
    /// Fails if the set is unknown or selects no policies.
    pub fn resolve(&self, set_id: Option<&str>) -> Result<ResolvedPolicySet, ValidationError> {
        let id = set_id.unwrap_or(&self.default_set);
        let set = self
            .sets
            .get(id)
            .ok_or_else(|| ValidationError::UnknownPolicySet {
                id: id.to_string(),
                available: self.sets.keys().cloned().collect(),
            })?;

        let policies: Vec<PolicyDefinition> = self
            .policies
            .iter()
            .filter(|p| set.selects(p))
            .cloned()
            .collect();

        if policies.is_empty() {
            return Err(ValidationError::EmptyPolicySet(id.to_string()));
        }

        Ok(ResolvedPolicySet {
            id: id.to_string(),
            task: set.task().to_string(),
            generation: self.generation,
            policies,
        })
    }
}

fn subject_of(policy: Option<&PolicyDefinition>, policy_id: &str) -> VerdictSubject {
    match policy {
        Some(p) => VerdictSubject {
            policy_id: p.id.clone(),
            name: p.name.clone(),
            threshold: p.threshold,
            unknown_policy: false,
        },
        None => VerdictSubject::unknown(policy_id),
    }
}

/// Process-wide registry of policy definitions.
#[derive(Debug)]
pub struct PolicyRegistry {
    current: RwLock<Arc<PolicySnapshot>>,
}

impl PolicyRegistry {
    /// Load the first generation from a source.
    pub fn load(source: &PolicySource) -> Result<Self, ConfigError> {
        let file = source.read()?;
        Ok(Self::from_file(file))
    }

    /// Build a registry from an already validated policy file.
    pub fn from_file(file: PolicyFile) -> Self {
        let snapshot = PolicySnapshot::build(file, 1);
        tracing::info!(
            generation = 1,
            policies = snapshot.policies.len(),
            "Policy registry loaded"
        );

        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// The active snapshot. Callers hold it for as long as they need a
    /// consistent view.
    pub fn current(&self) -> Arc<PolicySnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Replace the active snapshot with a freshly loaded one.
    ///
    /// On error the previous generation stays active. Returns the new
    /// generation number.
    pub fn reload(&self, source: &PolicySource) -> Result<u64, ConfigError> {
        let file = match source.read() {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(error = %e, "Policy reload rejected, keeping current generation");
                return Err(e);
            }
        };

        let mut current = self.current.write();
        let generation = current.generation() + 1;
        let snapshot = Arc::new(PolicySnapshot::build(file, generation));
        let policies = snapshot.policies.len();
        *current = snapshot;
        drop(current);

        tracing::info!(generation, policies, "Policy registry reloaded");

        Ok(generation)
    }
}
