//! Error types for Accord Core
//!
//! Only graph construction failures and invalid configuration abort a
//! session. Everything else that can go wrong during negotiation is a
//! [`NegotiationFault`]: a value recorded in session state and surfaced in
//! the summary, never returned as `Err`.

use crate::state_machine::IllegalTransition;
use crate::types::ProposalId;
use accord_graph::GraphError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Fatal session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The dependency graph could not be built
    #[error("graph construction failed: {0}")]
    Graph(#[from] GraphError),

    /// The safety policy is unusable
    #[error("invalid safety policy: {0}")]
    InvalidPolicy(#[from] ConfigError),

    /// The engine attempted a phase change its state machine forbids
    #[error("internal error: {0}")]
    Internal(#[from] IllegalTransition),
}

impl SessionError {
    /// Whether the session was refused because of a dependency cycle
    #[inline]
    #[must_use]
    pub fn is_cycle(&self) -> bool {
        matches!(self, Self::Graph(GraphError::Cycle(_)))
    }
}

/// Configuration loading and validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Policy file could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Policy text is not valid TOML for a policy
    #[error("failed to parse policy: {0}")]
    Parse(#[from] toml::de::Error),

    /// Policy parsed but violates a constraint
    #[error("{0}")]
    Invalid(String),
}

/// Non-fatal negotiation friction
///
/// Each variant is absorbed into session state so callers can audit why a
/// proposal did or did not become a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NegotiationFault {
    /// Proposal touches a protected resource; rejected at submission
    #[error("proposal touches protected resource {resource}")]
    ProtectedResourceViolation { resource: String },

    /// Oracle call failed or timed out; treated as empty output
    #[error("oracle {operation} failed for {node}: {detail}")]
    OracleFailure {
        node: String,
        operation: OracleOperation,
        detail: String,
    },

    /// Node has no proposal budget left
    #[error("{node} exceeded its proposal budget")]
    BudgetExceeded { node: String },

    /// Conflict needs an arbiter but none can rule on it
    #[error("no arbiter available for proposal {proposal}")]
    ArbitrationUnavailable { proposal: ProposalId },

    /// Accepted proposal does not fit under the modification caps
    #[error(
        "proposal {proposal} modifies {requested} resources (per-commit cap {per_commit_cap}, {remaining} left in session)"
    )]
    ResourceCapExceeded {
        proposal: ProposalId,
        requested: usize,
        per_commit_cap: usize,
        remaining: usize,
    },

    /// Proposal cannot be routed or has no identifiable change target
    #[error("malformed proposal: {detail}")]
    MalformedProposal { detail: String },

    /// Counter-proposal chain is deeper than the policy allows
    #[error("counter-proposal depth {depth} exceeds cap {cap}")]
    CounterDepthExceeded { depth: u32, cap: u32 },
}

impl NegotiationFault {
    /// Short machine-readable kind, matching the serialized tag
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ProtectedResourceViolation { .. } => "protected_resource_violation",
            Self::OracleFailure { .. } => "oracle_failure",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::ArbitrationUnavailable { .. } => "arbitration_unavailable",
            Self::ResourceCapExceeded { .. } => "resource_cap_exceeded",
            Self::MalformedProposal { .. } => "malformed_proposal",
            Self::CounterDepthExceeded { .. } => "counter_depth_exceeded",
        }
    }
}

/// Which oracle operation a failure belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OracleOperation {
    Propose,
    Evaluate,
    Arbitrate,
}

impl std::fmt::Display for OracleOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Propose => "propose",
            Self::Evaluate => "evaluate",
            Self::Arbitrate => "arbitrate",
        })
    }
}

/// Errors reported by Reasoning Oracle implementations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OracleError {
    /// The backing intelligence could not be reached
    #[error("oracle unavailable: {0}")]
    Unavailable(String),

    /// The backing intelligence produced unusable output
    #[error("invalid oracle response: {0}")]
    InvalidResponse(String),

    /// Any other failure
    #[error("{0}")]
    Other(String),
}

/// Errors reported by Commit Applier implementations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    /// The artifact changed since the proposal was drafted
    #[error("stale base for {resource}")]
    StaleBase { resource: String },

    /// The mutation itself failed
    #[error("apply failed: {0}")]
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use accord_graph::CycleError;

    #[test]
    fn fault_kind_matches_serialized_tag() {
        let fault = NegotiationFault::ProtectedResourceViolation {
            resource: "Cargo.lock".to_string(),
        };
        let json = serde_json::to_value(&fault).unwrap();
        assert_eq!(json["kind"], fault.kind());
        assert!(fault.to_string().contains("Cargo.lock"));
    }

    #[test]
    fn session_error_detects_cycle() {
        let err = SessionError::from(GraphError::Cycle(CycleError {
            member: "a".to_string(),
            cycle: vec!["a".to_string()],
        }));
        assert!(err.is_cycle());
        assert!(err.to_string().starts_with("graph construction failed"));

        let err = SessionError::from(ConfigError::Invalid("bad".to_string()));
        assert!(!err.is_cycle());
    }

    #[test]
    fn oracle_operation_display() {
        let fault = NegotiationFault::OracleFailure {
            node: "n".to_string(),
            operation: OracleOperation::Evaluate,
            detail: "timed out".to_string(),
        };
        assert_eq!(fault.to_string(), "oracle evaluate failed for n: timed out");
    }
}
