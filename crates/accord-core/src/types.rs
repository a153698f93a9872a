//! Core types for Accord
//!
//! Defines the negotiation data model:
//! - Identifiers for sessions, proposals and commits
//! - Change descriptors and proposals
//! - Evaluations and their decisions
//! - Commit records and their consensus classification

use crate::trace::TraceEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use ulid::Ulid;

/// Unique session identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Ulid);

impl SessionId {
    /// Generate new session ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Proposal identifier, sequential within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProposalId(pub u64);

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{:04}", self.0)
    }
}

/// Commit identifier, sequential within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitId(pub u64);

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{:04}", self.0)
    }
}

/// One resource touched by a change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEdit {
    /// Resource identifier (file path, symbol path, ...)
    pub resource: String,
    /// Content expected before the change
    pub before: String,
    /// Content after the change
    pub after: String,
}

/// Structured change descriptor
///
/// The engine never interprets `before`/`after`; it only inspects which
/// resources are touched.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Individual resource edits
    pub edits: Vec<ResourceEdit>,
}

impl ChangeSet {
    /// Change touching a single resource
    #[must_use]
    pub fn single(
        resource: impl Into<String>,
        before: impl Into<String>,
        after: impl Into<String>,
    ) -> Self {
        Self::default().with_edit(resource, before, after)
    }

    /// Add an edit
    #[must_use]
    pub fn with_edit(
        mut self,
        resource: impl Into<String>,
        before: impl Into<String>,
        after: impl Into<String>,
    ) -> Self {
        self.edits.push(ResourceEdit {
            resource: resource.into(),
            before: before.into(),
            after: after.into(),
        });
        self
    }

    /// Distinct resources touched
    #[must_use]
    pub fn resources(&self) -> BTreeSet<&str> {
        self.edits.iter().map(|e| e.resource.as_str()).collect()
    }

    /// Whether any edit touches `resource`
    #[inline]
    #[must_use]
    pub fn touches(&self, resource: &str) -> bool {
        self.edits.iter().any(|e| e.resource == resource)
    }

    /// Whether the change has no edits
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }
}

/// Proposal priority; higher priorities are resolved first within a round
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Proposal content as drafted by an oracle, before the engine stamps it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalDraft {
    /// Addressed node; `None` broadcasts to every other node
    pub target: Option<String>,
    /// Free-form intent tag (`refactor`, `fix`, `docs`, ...)
    pub intent: String,
    /// The change itself
    pub change: ChangeSet,
    /// Why the change is proposed
    pub rationale: String,
    /// Resolution priority
    pub priority: Priority,
    /// Proposals this one builds on
    pub depends_on: Vec<ProposalId>,
}

impl ProposalDraft {
    /// Create a broadcast draft
    #[must_use]
    pub fn new(intent: impl Into<String>, change: ChangeSet) -> Self {
        Self {
            target: None,
            intent: intent.into(),
            change,
            rationale: String::new(),
            priority: Priority::default(),
            depends_on: Vec::new(),
        }
    }

    /// Address a single node
    #[inline]
    #[must_use]
    pub fn targeting(mut self, node: impl Into<String>) -> Self {
        self.target = Some(node.into());
        self
    }

    /// With rationale
    #[inline]
    #[must_use]
    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = rationale.into();
        self
    }

    /// With priority
    #[inline]
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Declare a dependency on an earlier proposal
    #[inline]
    #[must_use]
    pub fn depends_on(mut self, proposal: ProposalId) -> Self {
        self.depends_on.push(proposal);
        self
    }
}

/// A submitted candidate change
///
/// Created by the engine from a [`ProposalDraft`]; never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: ProposalId,
    /// Originating node
    pub origin: String,
    /// Addressed node; `None` means broadcast
    pub target: Option<String>,
    /// Round the proposal was created in
    pub round: u32,
    pub intent: String,
    pub change: ChangeSet,
    pub rationale: String,
    pub priority: Priority,
    pub depends_on: Vec<ProposalId>,
    /// Proposal this one counters, if it is a counter-proposal
    pub counter_of: Option<ProposalId>,
    /// Length of the counter chain leading to this proposal (0 = original)
    pub counter_depth: u32,
}

impl Proposal {
    pub(crate) fn from_draft(
        id: ProposalId,
        origin: &str,
        round: u32,
        draft: ProposalDraft,
        counter_of: Option<(ProposalId, u32)>,
    ) -> Self {
        let mut depends_on = draft.depends_on;
        if let Some((parent, _)) = counter_of {
            if !depends_on.contains(&parent) {
                depends_on.insert(0, parent);
            }
        }
        Self {
            id,
            origin: origin.to_string(),
            target: draft.target,
            round,
            intent: draft.intent,
            change: draft.change,
            rationale: draft.rationale,
            priority: draft.priority,
            depends_on,
            counter_of: counter_of.map(|(parent, _)| parent),
            counter_depth: counter_of.map_or(0, |(_, depth)| depth + 1),
        }
    }

    /// Whether the proposal is addressed to every other node
    #[inline]
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.target.is_none()
    }
}

/// Evaluation verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accept,
    Reject,
    /// Reject in favour of an attached counter-proposal
    Counter,
    /// Abstain for now
    Defer,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Accept => "accept",
            Self::Reject => "reject",
            Self::Counter => "counter",
            Self::Defer => "defer",
        })
    }
}

/// Coarse risk rating
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

/// Evaluator's risk assessment of a proposal
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub notes: Vec<String>,
}

impl RiskAssessment {
    /// Assessment with a level and no notes
    #[inline]
    #[must_use]
    pub fn new(level: RiskLevel) -> Self {
        Self {
            level,
            notes: Vec::new(),
        }
    }

    /// Add a note
    #[inline]
    #[must_use]
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }
}

/// Evaluation content as drafted by an oracle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationDraft {
    pub decision: Decision,
    /// Confidence, clamped to [0, 1] when stamped
    pub confidence: f64,
    pub rationale: String,
    /// Only meaningful with [`Decision::Counter`]
    pub counter_proposal: Option<ProposalDraft>,
    pub risk: RiskAssessment,
}

impl EvaluationDraft {
    /// Draft with the given decision and full confidence
    #[must_use]
    pub fn new(decision: Decision) -> Self {
        Self {
            decision,
            confidence: 1.0,
            rationale: String::new(),
            counter_proposal: None,
            risk: RiskAssessment::default(),
        }
    }

    /// Accept draft
    #[inline]
    #[must_use]
    pub fn accept() -> Self {
        Self::new(Decision::Accept)
    }

    /// Reject draft
    #[inline]
    #[must_use]
    pub fn reject() -> Self {
        Self::new(Decision::Reject)
    }

    /// Defer draft
    #[inline]
    #[must_use]
    pub fn defer() -> Self {
        Self::new(Decision::Defer)
    }

    /// Counter draft carrying an alternative proposal
    #[inline]
    #[must_use]
    pub fn counter(alternative: ProposalDraft) -> Self {
        Self {
            counter_proposal: Some(alternative),
            ..Self::new(Decision::Counter)
        }
    }

    /// With confidence
    #[inline]
    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    /// With rationale
    #[inline]
    #[must_use]
    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = rationale.into();
        self
    }

    /// With risk assessment
    #[inline]
    #[must_use]
    pub fn with_risk(mut self, risk: RiskAssessment) -> Self {
        self.risk = risk;
        self
    }
}

/// A verdict on one proposal by one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub proposal: ProposalId,
    pub evaluator: String,
    pub round: u32,
    pub decision: Decision,
    /// In [0, 1]; fixed at 1.0 for binding verdicts
    pub confidence: f64,
    pub rationale: String,
    pub counter_proposal: Option<ProposalDraft>,
    pub risk: RiskAssessment,
    /// Whether this is an arbiter's binding verdict
    pub binding: bool,
}

impl Evaluation {
    pub(crate) fn from_draft(
        proposal: ProposalId,
        evaluator: &str,
        round: u32,
        draft: EvaluationDraft,
    ) -> Self {
        let confidence = if draft.confidence.is_nan() {
            0.0
        } else {
            draft.confidence.clamp(0.0, 1.0)
        };
        let counter_proposal = match draft.decision {
            Decision::Counter => draft.counter_proposal,
            _ => None,
        };
        Self {
            proposal,
            evaluator: evaluator.to_string(),
            round,
            decision: draft.decision,
            confidence,
            rationale: draft.rationale,
            counter_proposal,
            risk: draft.risk,
            binding: false,
        }
    }

    pub(crate) fn binding(proposal: ProposalId, arbiter: &str, round: u32, draft: EvaluationDraft) -> Self {
        let decision = match draft.decision {
            Decision::Accept => Decision::Accept,
            _ => Decision::Reject,
        };
        Self {
            proposal,
            evaluator: arbiter.to_string(),
            round,
            decision,
            confidence: 1.0,
            rationale: draft.rationale,
            counter_proposal: None,
            risk: draft.risk,
            binding: true,
        }
    }
}

/// How a commit was agreed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusType {
    /// Every evaluation accepted, no arbiter involved
    Unanimous,
    /// Accepts outnumbered rejects, no arbiter involved
    Majority,
    /// An arbiter's binding verdict decided
    Arbiter,
}

impl fmt::Display for ConsensusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unanimous => "unanimous",
            Self::Majority => "majority",
            Self::Arbiter => "arbiter",
        })
    }
}

/// Finalized resolution of an accepted proposal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub id: CommitId,
    pub proposal: ProposalId,
    pub round: u32,
    pub proposer: String,
    /// Nodes whose evaluations were counted, in evaluation order
    pub evaluators: Vec<String>,
    pub consensus: ConsensusType,
    /// Resolved change handed to the applier
    pub change: ChangeSet,
    pub modified_resources: Vec<String>,
    pub timestamp: DateTime<Utc>,
    /// Audit trail for the proposal up to and including the commit
    pub trace: Vec<TraceEntry>,
}

/// Outcome of handing a commit to the applier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ApplyStatus {
    Applied,
    ApplyFailed { reason: String },
}

impl ApplyStatus {
    /// Whether application failed
    #[inline]
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::ApplyFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_set_resources_are_distinct() {
        let change = ChangeSet::single("src/a.rs", "", "x")
            .with_edit("src/b.rs", "", "y")
            .with_edit("src/a.rs", "x", "z");

        assert_eq!(change.resources().len(), 2);
        assert!(change.touches("src/b.rs"));
        assert!(!change.touches("src/c.rs"));
    }

    #[test]
    fn counter_proposal_links_parent() {
        let draft = ProposalDraft::new("fix", ChangeSet::single("r", "a", "b"));
        let proposal = Proposal::from_draft(ProposalId(7), "n", 2, draft, Some((ProposalId(3), 1)));

        assert_eq!(proposal.counter_of, Some(ProposalId(3)));
        assert_eq!(proposal.counter_depth, 2);
        assert_eq!(proposal.depends_on, vec![ProposalId(3)]);
        assert!(proposal.is_broadcast());
    }

    #[test]
    fn evaluation_confidence_is_clamped() {
        let eval = Evaluation::from_draft(
            ProposalId(1),
            "n",
            0,
            EvaluationDraft::accept().with_confidence(4.2),
        );
        assert_eq!(eval.confidence, 1.0);

        let eval = Evaluation::from_draft(
            ProposalId(1),
            "n",
            0,
            EvaluationDraft::reject().with_confidence(f64::NAN),
        );
        assert_eq!(eval.confidence, 0.0);
    }

    #[test]
    fn counter_payload_dropped_for_other_decisions() {
        let mut draft = EvaluationDraft::accept();
        draft.counter_proposal = Some(ProposalDraft::new("x", ChangeSet::default()));
        let eval = Evaluation::from_draft(ProposalId(1), "n", 0, draft);
        assert!(eval.counter_proposal.is_none());
    }

    #[test]
    fn binding_verdict_is_normalized() {
        let eval = Evaluation::binding(
            ProposalId(1),
            "arb",
            3,
            EvaluationDraft::defer().with_confidence(0.2),
        );
        assert_eq!(eval.decision, Decision::Reject);
        assert_eq!(eval.confidence, 1.0);
        assert!(eval.binding);
    }

    #[test]
    fn ids_display() {
        assert_eq!(ProposalId(12).to_string(), "p0012");
        assert_eq!(CommitId(3).to_string(), "c0003");
        assert_eq!(ConsensusType::Arbiter.to_string(), "arbiter");
    }
}
