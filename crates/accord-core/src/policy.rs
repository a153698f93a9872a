//! Safety policy
//!
//! Immutable, session-scoped limits bounding every risk dimension of a
//! negotiation. Loaded from TOML; fields missing from the file keep their
//! defaults.

use crate::error::ConfigError;
use crate::types::ChangeSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Session safety limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SafetyPolicy {
    /// Round cap
    pub max_rounds: u32,
    /// Proposals a node may submit over the whole session
    pub max_proposals_per_agent: usize,
    /// Proposals a node may submit in one round
    pub max_proposals_per_round: usize,
    /// Consecutive idle rounds that count as convergence
    pub convergence_threshold: usize,
    /// Whether conflicted votes must go to an arbiter
    pub arbitration_required: bool,
    /// Distinct resources a single commit may modify
    pub max_resources_per_commit: usize,
    /// Resources all commits of the session may modify in total
    pub max_total_resources: usize,
    /// Maximum length of a counter-proposal chain
    pub max_counter_depth: u32,
    /// Resources no proposal may touch
    pub protected_resources: BTreeSet<String>,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self {
            max_rounds: 10,
            max_proposals_per_agent: 3,
            max_proposals_per_round: 1,
            convergence_threshold: 2,
            arbitration_required: true,
            max_resources_per_commit: 1,
            max_total_resources: 10,
            max_counter_depth: 3,
            protected_resources: BTreeSet::new(),
        }
    }
}

impl SafetyPolicy {
    /// Create default policy
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a policy from TOML text
    ///
    /// # Errors
    /// `ConfigError::Parse` for malformed TOML or unknown keys,
    /// `ConfigError::Invalid` if validation fails
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let policy: Self = toml::from_str(text)?;
        policy.validate()?;
        Ok(policy)
    }

    /// Load a policy from a TOML file
    ///
    /// # Errors
    /// `ConfigError::Io` if the file cannot be read, otherwise as
    /// [`SafetyPolicy::from_toml_str`]
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Render the policy as TOML
    ///
    /// # Errors
    /// `ConfigError::Invalid` if serialization fails
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Check constraints serde cannot express
    ///
    /// # Errors
    /// `ConfigError::Invalid` if a protected resource identifier is blank
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protected_resources.iter().any(|r| r.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "protected resource identifiers must not be blank".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether `resource` is protected
    #[inline]
    #[must_use]
    pub fn is_protected(&self, resource: &str) -> bool {
        self.protected_resources.contains(resource)
    }

    /// First protected resource touched by `change`, if any
    #[must_use]
    pub fn protected_in<'c>(&self, change: &'c ChangeSet) -> Option<&'c str> {
        change
            .edits
            .iter()
            .map(|e| e.resource.as_str())
            .find(|r| self.is_protected(r))
    }

    /// With round cap
    #[inline]
    #[must_use]
    pub fn with_max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = rounds;
        self
    }

    /// With per-agent session budget
    #[inline]
    #[must_use]
    pub fn with_max_proposals_per_agent(mut self, max: usize) -> Self {
        self.max_proposals_per_agent = max;
        self
    }

    /// With per-agent per-round budget
    #[inline]
    #[must_use]
    pub fn with_max_proposals_per_round(mut self, max: usize) -> Self {
        self.max_proposals_per_round = max;
        self
    }

    /// With convergence threshold
    #[inline]
    #[must_use]
    pub fn with_convergence_threshold(mut self, idle_rounds: usize) -> Self {
        self.convergence_threshold = idle_rounds;
        self
    }

    /// With arbitration requirement
    #[inline]
    #[must_use]
    pub fn with_arbitration_required(mut self, required: bool) -> Self {
        self.arbitration_required = required;
        self
    }

    /// With per-commit resource cap
    #[inline]
    #[must_use]
    pub fn with_max_resources_per_commit(mut self, max: usize) -> Self {
        self.max_resources_per_commit = max;
        self
    }

    /// With session resource cap
    #[inline]
    #[must_use]
    pub fn with_max_total_resources(mut self, max: usize) -> Self {
        self.max_total_resources = max;
        self
    }

    /// With counter-proposal depth cap
    #[inline]
    #[must_use]
    pub fn with_max_counter_depth(mut self, depth: u32) -> Self {
        self.max_counter_depth = depth;
        self
    }

    /// Add a protected resource
    #[inline]
    #[must_use]
    pub fn protect(mut self, resource: impl Into<String>) -> Self {
        self.protected_resources.insert(resource.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_reference_values() {
        let policy = SafetyPolicy::default();
        assert_eq!(policy.max_rounds, 10);
        assert_eq!(policy.max_proposals_per_agent, 3);
        assert_eq!(policy.max_proposals_per_round, 1);
        assert_eq!(policy.convergence_threshold, 2);
        assert!(policy.arbitration_required);
        assert_eq!(policy.max_resources_per_commit, 1);
        assert_eq!(policy.max_total_resources, 10);
        assert_eq!(policy.max_counter_depth, 3);
        assert!(policy.protected_resources.is_empty());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let policy = SafetyPolicy::from_toml_str(
            r#"
            max_rounds = 4
            protected_resources = ["Cargo.lock", "build.rs"]
            "#,
        )
        .unwrap();

        assert_eq!(policy.max_rounds, 4);
        assert_eq!(policy.max_proposals_per_agent, 3);
        assert!(policy.is_protected("build.rs"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = SafetyPolicy::from_toml_str("max_round = 4").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn negative_values_are_rejected() {
        assert!(SafetyPolicy::from_toml_str("max_rounds = -1").is_err());
    }

    #[test]
    fn blank_protected_resource_is_invalid() {
        let err = SafetyPolicy::from_toml_str(r#"protected_resources = [" "]"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn toml_round_trip_through_file() {
        let policy = SafetyPolicy::new()
            .with_max_rounds(7)
            .with_arbitration_required(false)
            .protect("secrets.toml");

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", policy.to_toml_string().unwrap()).unwrap();

        let loaded = SafetyPolicy::from_toml_file(file.path()).unwrap();
        assert_eq!(loaded, policy);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = SafetyPolicy::from_toml_file("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn protected_in_finds_first_hit() {
        let policy = SafetyPolicy::new().protect("b");
        let change = ChangeSet::single("a", "", "").with_edit("b", "", "");
        assert_eq!(policy.protected_in(&change), Some("b"));
        assert_eq!(policy.protected_in(&ChangeSet::single("a", "", "")), None);
    }
}
