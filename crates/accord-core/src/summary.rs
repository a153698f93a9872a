//! Session summary handed to artifact emitters

use crate::error::NegotiationFault;
use crate::trace::{verify_chain, IntegrityViolation, TraceEntry};
use crate::types::{ApplyStatus, CommitId, CommitRecord, ProposalId, SessionId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Why a session stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// No proposals for `convergence_threshold` consecutive rounds
    Convergence,
    /// Round cap reached
    MaxRounds,
    /// Session resource-modification cap reached
    ResourceLimit,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Convergence => "convergence",
            Self::MaxRounds => "max_rounds",
            Self::ResourceLimit => "resource_limit",
        })
    }
}

/// Where in the round a proposal was turned down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionStage {
    /// Refused before distribution; never evaluated
    Submission,
    /// Evaluated, then not accepted
    Resolution,
}

/// Why a proposal was turned down
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectionReason {
    /// A modeled fault (protected resource, budget, malformed, ...)
    Fault { fault: NegotiationFault },
    /// Accepts did not outnumber rejects
    Vote { accepts: usize, rejects: usize },
    /// The arbiter's binding verdict was not an accept
    Arbiter { arbiter: String },
}

impl RejectionReason {
    /// The underlying fault, if any
    #[must_use]
    pub fn fault(&self) -> Option<&NegotiationFault> {
        match self {
            Self::Fault { fault } => Some(fault),
            _ => None,
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fault { fault } => write!(f, "{fault}"),
            Self::Vote { accepts, rejects } => {
                write!(f, "vote failed ({accepts} accept / {rejects} reject)")
            }
            Self::Arbiter { arbiter } => write!(f, "rejected by arbiter {arbiter}"),
        }
    }
}

/// A proposal that did not become a commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionRecord {
    pub proposal: ProposalId,
    pub node: String,
    pub round: u32,
    pub stage: RejectionStage,
    pub reason: RejectionReason,
}

/// An accepted proposal held back by modification caps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferralRecord {
    pub proposal: ProposalId,
    pub node: String,
    pub round: u32,
    pub fault: NegotiationFault,
}

/// A fault that did not concern a specific proposal outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultRecord {
    pub round: u32,
    pub fault: NegotiationFault,
}

/// Final account of a negotiation session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegotiationSummary {
    pub session_id: SessionId,
    pub rounds_executed: u32,
    pub termination: TerminationReason,
    pub commits: Vec<CommitRecord>,
    pub apply_status: BTreeMap<CommitId, ApplyStatus>,
    /// Every submission attempt, including those refused at submission
    pub proposals_attempted: usize,
    /// Attempts that passed submission checks and were distributed
    pub proposals_submitted: usize,
    pub evaluations: usize,
    pub arbitrations: usize,
    pub rejections: Vec<RejectionRecord>,
    pub deferrals: Vec<DeferralRecord>,
    pub oracle_failures: Vec<FaultRecord>,
    /// Budget slots used per node
    pub proposal_usage: BTreeMap<String, usize>,
    pub resources_modified: usize,
    pub trace: Vec<TraceEntry>,
}

impl NegotiationSummary {
    /// Number of rejected proposals
    #[inline]
    #[must_use]
    pub fn rejection_count(&self) -> usize {
        self.rejections.len()
    }

    /// Commit created for `proposal`, if any
    #[must_use]
    pub fn commit_for(&self, proposal: ProposalId) -> Option<&CommitRecord> {
        self.commits.iter().find(|c| c.proposal == proposal)
    }

    /// Whether `proposal` became a commit
    #[inline]
    #[must_use]
    pub fn is_committed(&self, proposal: ProposalId) -> bool {
        self.commit_for(proposal).is_some()
    }

    /// Rejection record for `proposal`, if any
    #[must_use]
    pub fn rejection_for(&self, proposal: ProposalId) -> Option<&RejectionRecord> {
        self.rejections.iter().find(|r| r.proposal == proposal)
    }

    /// Commits the applier failed to apply
    pub fn apply_failures(&self) -> impl Iterator<Item = (&CommitId, &ApplyStatus)> {
        self.apply_status.iter().filter(|(_, s)| s.is_failed())
    }

    /// Hex hash of the final trace entry
    #[must_use]
    pub fn trace_head(&self) -> String {
        self.trace
            .last()
            .map_or_else(|| hex::encode([0u8; 32]), TraceEntry::hash_hex)
    }

    /// Verify the audit trace carried by this summary
    ///
    /// # Errors
    /// `IntegrityViolation` if the trace was altered
    pub fn verify_trace(&self) -> Result<(), IntegrityViolation> {
        verify_chain(&self.trace)
    }

    /// Human-readable multi-line report
    #[must_use]
    pub fn generate_text(&self) -> String {
        let mut report = String::new();
        report.push_str(&format!("=== Negotiation Session {} ===\n\n", self.session_id));
        report.push_str(&format!("Rounds: {}\n", self.rounds_executed));
        report.push_str(&format!("Termination: {}\n", self.termination));
        report.push_str(&format!(
            "Proposals: {} submitted / {} attempted\n",
            self.proposals_submitted, self.proposals_attempted
        ));
        report.push_str(&format!("Evaluations: {}\n", self.evaluations));
        report.push_str(&format!("Arbitrations: {}\n", self.arbitrations));
        report.push_str(&format!("Commits: {}\n", self.commits.len()));
        report.push_str(&format!("Rejections: {}\n", self.rejections.len()));
        report.push_str(&format!("Deferrals: {}\n", self.deferrals.len()));
        report.push_str(&format!("Oracle failures: {}\n", self.oracle_failures.len()));
        report.push_str(&format!("Resources modified: {}\n", self.resources_modified));

        if !self.commits.is_empty() {
            report.push_str("\nCommits:\n");
            for commit in &self.commits {
                let status = match self.apply_status.get(&commit.id) {
                    Some(ApplyStatus::ApplyFailed { reason }) => format!("apply_failed: {reason}"),
                    Some(ApplyStatus::Applied) => "applied".to_string(),
                    None => "pending".to_string(),
                };
                report.push_str(&format!(
                    "  {} {} by {} ({}) [{}] {}\n",
                    commit.id,
                    commit.proposal,
                    commit.proposer,
                    commit.consensus,
                    commit.modified_resources.join(", "),
                    status
                ));
            }
        }

        if !self.rejections.is_empty() {
            report.push_str("\nRejections:\n");
            for r in &self.rejections {
                report.push_str(&format!(
                    "  {} by {} (round {}): {}\n",
                    r.proposal, r.node, r.round, r.reason
                ));
            }
        }

        report.push_str(&format!("\nTrace head: {}\n", self.trace_head()));
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn termination_reason_serializes_snake_case() {
        let json = serde_json::to_string(&TerminationReason::MaxRounds).unwrap();
        assert_eq!(json, "\"max_rounds\"");
        assert_eq!(TerminationReason::ResourceLimit.to_string(), "resource_limit");
    }

    #[test]
    fn rejection_reason_exposes_fault() {
        let reason = RejectionReason::Fault {
            fault: NegotiationFault::BudgetExceeded {
                node: "a".to_string(),
            },
        };
        assert_eq!(reason.fault().map(NegotiationFault::kind), Some("budget_exceeded"));
        assert!(RejectionReason::Vote { accepts: 1, rejects: 1 }.fault().is_none());
    }
}
