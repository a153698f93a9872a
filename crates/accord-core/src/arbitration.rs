//! Conflict detection and arbitration
//!
//! A vote is conflicted when it is tied or within one vote
//! (`|accepts - rejects| <= 1`); conflicted proposals go to an arbiter when
//! the policy requires it. Counter and defer votes count on neither side.

use crate::types::{ConsensusType, Decision, Evaluation};
use accord_graph::{DependencyGraph, Node};
use serde::{Deserialize, Serialize};

/// Vote count for one proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VoteTally {
    pub accepts: usize,
    pub rejects: usize,
    pub counters: usize,
    pub defers: usize,
}

impl VoteTally {
    /// Tally non-binding evaluations
    #[must_use]
    pub fn from_evaluations<'a>(evaluations: impl IntoIterator<Item = &'a Evaluation>) -> Self {
        evaluations
            .into_iter()
            .filter(|e| !e.binding)
            .fold(Self::default(), |mut tally, e| {
                match e.decision {
                    Decision::Accept => tally.accepts += 1,
                    Decision::Reject => tally.rejects += 1,
                    Decision::Counter => tally.counters += 1,
                    Decision::Defer => tally.defers += 1,
                }
                tally
            })
    }

    /// Total votes cast
    #[inline]
    #[must_use]
    pub fn total(&self) -> usize {
        self.accepts + self.rejects + self.counters + self.defers
    }

    /// Tie or close vote
    #[inline]
    #[must_use]
    pub fn is_conflicted(&self) -> bool {
        self.accepts.abs_diff(self.rejects) <= 1
    }

    /// Plain majority: accepts strictly exceed rejects
    #[inline]
    #[must_use]
    pub fn has_majority(&self) -> bool {
        self.accepts > self.rejects
    }

    /// Every vote cast was an accept
    #[inline]
    #[must_use]
    pub fn is_unanimous(&self) -> bool {
        self.accepts > 0 && self.accepts == self.total()
    }

    /// Classification for a commit decided by vote
    #[inline]
    #[must_use]
    pub fn consensus(&self) -> ConsensusType {
        if self.is_unanimous() {
            ConsensusType::Unanimous
        } else {
            ConsensusType::Majority
        }
    }
}

/// Pick the arbiter for a proposal by `proposer`
///
/// First arbiter-flagged node in declaration order that is not the proposer.
#[must_use]
pub fn select_arbiter<'g>(graph: &'g DependencyGraph, proposer: &str) -> Option<&'g Node> {
    graph.arbiters().find(|node| node.name() != proposer)
}

/// How the vote phase settled a proposal before caps are applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteOutcome {
    /// Accepted with the given classification
    Accepted(ConsensusType),
    /// Accepts did not outnumber rejects
    Rejected,
    /// Needs a binding verdict
    NeedsArbitration,
}

/// Settle a tally under the arbitration requirement
#[must_use]
pub fn settle(tally: &VoteTally, arbitration_required: bool) -> VoteOutcome {
    if tally.is_conflicted() && arbitration_required {
        VoteOutcome::NeedsArbitration
    } else if tally.has_majority() {
        VoteOutcome::Accepted(tally.consensus())
    } else {
        VoteOutcome::Rejected
    }
}
