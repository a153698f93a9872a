//! Reasoning Oracle contract
//!
//! The intelligence that drafts proposals, evaluations and arbitration
//! verdicts lives outside this crate. The engine only sees this trait; any
//! `Err` (or a call exceeding the engine's timeout) is treated as "no output"
//! for that node and round.

use crate::error::OracleError;
use crate::session::AnalysisMemory;
use crate::types::{Evaluation, EvaluationDraft, Proposal, ProposalDraft, SessionId};
use accord_graph::{ArtifactRef, Node};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What a node can see when asked to act
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleContext {
    pub session_id: SessionId,
    pub round: u32,
    /// Position of the node in the activation order
    pub activation_index: usize,
    pub dependencies: Vec<String>,
    pub artifact: ArtifactRef,
    /// The node's own session memory
    pub memory: AnalysisMemory,
    /// Proposals submitted this round that the node may see: those of
    /// earlier nodes during proposal collection, all of them during evaluation
    pub visible_proposals: Vec<Proposal>,
    /// Resources modified by commits so far
    pub committed_resources: Vec<String>,
    /// Proposal slots the node has left this round
    pub remaining_budget: usize,
}

/// External reasoning intelligence
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReasoningOracle: Send + Sync {
    /// Draft zero or one proposal for `node`
    async fn propose(
        &self,
        node: &Node,
        context: &OracleContext,
    ) -> Result<Option<ProposalDraft>, OracleError>;

    /// Judge a proposal addressed to `node`
    async fn evaluate(
        &self,
        node: &Node,
        proposal: &Proposal,
        context: &OracleContext,
    ) -> Result<EvaluationDraft, OracleError>;

    /// Issue a binding verdict on a conflicted proposal
    ///
    /// Confidence of the result is forced to 1.0; anything but `accept`
    /// counts as a rejection.
    async fn arbitrate(
        &self,
        arbiter: &Node,
        proposal: &Proposal,
        evaluations: &[Evaluation],
        round: u32,
    ) -> Result<EvaluationDraft, OracleError>;
}
