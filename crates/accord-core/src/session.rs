//! Negotiation session state
//!
//! Mutable bookkeeping owned exclusively by one engine instance. Observers
//! get read-only [`SessionSnapshot`] copies through a [`SnapshotHandle`].

use crate::state_machine::{validate_transition, IllegalTransition, SessionPhase};
use crate::summary::{DeferralRecord, FaultRecord, RejectionRecord};
use crate::types::{ApplyStatus, CommitId, CommitRecord, Proposal, ProposalDraft, ProposalId, SessionId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Final disposition of a node's own proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalOutcome {
    Committed,
    Rejected,
    Deferred,
}

/// Per-node, per-session analysis memory
///
/// Populated by the engine and handed back to the oracle on every call for
/// that node, so the node remembers what it has seen and how its own
/// proposals fared.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AnalysisMemory {
    /// Proposals this node was asked to evaluate
    pub seen: Vec<ProposalId>,
    /// Outcomes of this node's proposals
    pub outcomes: BTreeMap<ProposalId, ProposalOutcome>,
    /// Free-form observations
    pub notes: Vec<String>,
}

impl AnalysisMemory {
    /// Number of this node's proposals that became commits
    #[must_use]
    pub fn committed_count(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| matches!(o, ProposalOutcome::Committed))
            .count()
    }
}

/// Counter-proposal waiting for the next round
#[derive(Debug, Clone)]
pub(crate) struct QueuedCounter {
    pub(crate) parent: ProposalId,
    pub(crate) parent_depth: u32,
    pub(crate) draft: ProposalDraft,
}

/// Engine-owned mutable bookkeeping
#[derive(Debug)]
pub(crate) struct SessionState {
    pub(crate) session_id: SessionId,
    pub(crate) phase: SessionPhase,
    pub(crate) round: u32,
    pub(crate) rounds_executed: u32,
    pub(crate) usage: BTreeMap<String, usize>,
    pub(crate) round_usage: BTreeMap<String, usize>,
    pub(crate) idle_rounds: usize,
    pub(crate) resources_modified: usize,
    pub(crate) next_proposal: u64,
    pub(crate) next_commit: u64,
    pub(crate) proposals: BTreeMap<ProposalId, Proposal>,
    pub(crate) open: Vec<ProposalId>,
    pub(crate) committed: Vec<CommitRecord>,
    pub(crate) apply_status: BTreeMap<CommitId, ApplyStatus>,
    pub(crate) rejected: Vec<RejectionRecord>,
    pub(crate) deferred: Vec<DeferralRecord>,
    pub(crate) oracle_failures: Vec<FaultRecord>,
    pub(crate) attempted: usize,
    pub(crate) evaluations: usize,
    pub(crate) arbitrations: usize,
    pub(crate) memory: BTreeMap<String, AnalysisMemory>,
    pub(crate) counters: BTreeMap<String, Vec<QueuedCounter>>,
}

impl SessionState {
    pub(crate) fn new<'a>(session_id: SessionId, nodes: impl Iterator<Item = &'a str>) -> Self {
        let mut usage = BTreeMap::new();
        let mut memory = BTreeMap::new();
        for name in nodes {
            usage.insert(name.to_string(), 0);
            memory.insert(name.to_string(), AnalysisMemory::default());
        }
        Self {
            session_id,
            phase: SessionPhase::SeedingProposals,
            round: 0,
            rounds_executed: 0,
            usage,
            round_usage: BTreeMap::new(),
            idle_rounds: 0,
            resources_modified: 0,
            next_proposal: 0,
            next_commit: 0,
            proposals: BTreeMap::new(),
            open: Vec::new(),
            committed: Vec::new(),
            apply_status: BTreeMap::new(),
            rejected: Vec::new(),
            deferred: Vec::new(),
            oracle_failures: Vec::new(),
            attempted: 0,
            evaluations: 0,
            arbitrations: 0,
            memory,
            counters: BTreeMap::new(),
        }
    }

    pub(crate) fn transition(&mut self, to: SessionPhase) -> Result<(), IllegalTransition> {
        validate_transition(self.phase, to)?;
        tracing::trace!(from = ?self.phase, to = ?to, round = self.round, "Phase transition");
        self.phase = to;
        Ok(())
    }

    pub(crate) fn used(&self, node: &str) -> usize {
        self.usage.get(node).copied().unwrap_or(0)
    }

    pub(crate) fn used_this_round(&self, node: &str) -> usize {
        self.round_usage.get(node).copied().unwrap_or(0)
    }

    pub(crate) fn consume_slot(&mut self, node: &str) {
        *self.usage.entry(node.to_string()).or_insert(0) += 1;
        *self.round_usage.entry(node.to_string()).or_insert(0) += 1;
    }

    pub(crate) fn next_proposal_id(&mut self) -> ProposalId {
        let id = ProposalId(self.next_proposal);
        self.next_proposal += 1;
        id
    }

    pub(crate) fn next_commit_id(&mut self) -> CommitId {
        let id = CommitId(self.next_commit);
        self.next_commit += 1;
        id
    }

    pub(crate) fn memory_mut(&mut self, node: &str) -> &mut AnalysisMemory {
        self.memory.entry(node.to_string()).or_default()
    }

    pub(crate) fn committed_resources(&self) -> Vec<String> {
        self.committed
            .iter()
            .flat_map(|c| c.modified_resources.iter().cloned())
            .collect()
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id,
            phase: self.phase,
            round: self.round,
            rounds_executed: self.rounds_executed,
            pending_proposals: self
                .open
                .iter()
                .filter_map(|id| self.proposals.get(id))
                .cloned()
                .collect(),
            proposal_usage: self.usage.clone(),
            idle_rounds: self.idle_rounds,
            resources_modified: self.resources_modified,
            commits: self.committed.len(),
            rejections: self.rejected.len(),
        }
    }
}

/// Point-in-time, read-only copy of a session's progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub phase: SessionPhase,
    pub round: u32,
    pub rounds_executed: u32,
    /// Proposals submitted this round and not yet resolved
    pub pending_proposals: Vec<Proposal>,
    pub proposal_usage: BTreeMap<String, usize>,
    pub idle_rounds: usize,
    pub resources_modified: usize,
    pub commits: usize,
    pub rejections: usize,
}

/// Cloneable observer of a running session
///
/// Only ever hands out copies; it cannot mutate the session.
#[derive(Debug, Clone)]
pub struct SnapshotHandle {
    state: Arc<RwLock<SessionState>>,
}

impl SnapshotHandle {
    pub(crate) fn new(state: Arc<RwLock<SessionState>>) -> Self {
        Self { state }
    }

    /// Current snapshot
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.read().snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_count_per_round_and_total() {
        let mut state = SessionState::new(SessionId::new(), ["a", "b"].into_iter());
        state.consume_slot("a");
        state.consume_slot("a");
        assert_eq!(state.used("a"), 2);
        assert_eq!(state.used_this_round("a"), 2);
        state.round_usage.clear();
        assert_eq!(state.used_this_round("a"), 0);
        assert_eq!(state.used("b"), 0);
    }

    #[test]
    fn ids_are_sequential() {
        let mut state = SessionState::new(SessionId::new(), std::iter::empty());
        assert_eq!(state.next_proposal_id(), ProposalId(0));
        assert_eq!(state.next_proposal_id(), ProposalId(1));
        assert_eq!(state.next_commit_id(), CommitId(0));
    }

    #[test]
    fn snapshot_handle_reads_live_state() {
        let state = Arc::new(RwLock::new(SessionState::new(
            SessionId::new(),
            ["a"].into_iter(),
        )));
        let handle = SnapshotHandle::new(Arc::clone(&state));
        assert_eq!(handle.snapshot().phase, SessionPhase::SeedingProposals);

        state.write().transition(SessionPhase::RoundActive).unwrap();
        state.write().round = 3;
        let snap = handle.snapshot();
        assert_eq!(snap.phase, SessionPhase::RoundActive);
        assert_eq!(snap.round, 3);
        assert_eq!(snap.proposal_usage.get("a"), Some(&0));
    }

    #[test]
    fn illegal_transition_is_refused() {
        let mut state = SessionState::new(SessionId::new(), std::iter::empty());
        assert!(state.transition(SessionPhase::Committing).is_err());
        assert_eq!(state.phase, SessionPhase::SeedingProposals);
    }
}
