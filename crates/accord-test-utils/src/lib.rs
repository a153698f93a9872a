//! Testing utilities for the Accord workspace
//!
//! Scripted oracles, recording appliers and graph fixtures.

#![allow(missing_docs)]

use accord_core::{
    ApplyError, ChangeSet, CommitApplier, CommitId, CommitRecord, Evaluation, EvaluationDraft,
    OracleContext, OracleError, Proposal, ProposalDraft, ProposalId, ReasoningOracle,
};
use accord_graph::{DependencyGraph, Node, NodeDefinition};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Build definitions from `(name, dependencies)` pairs
pub fn nodes(layout: &[(&str, &[&str])]) -> Vec<NodeDefinition> {
    layout.iter()
        .map(|(name, deps)| {
            deps.iter()
                .fold(NodeDefinition::regular(*name), |def, dep| def.depends_on(*dep))
        })
        .collect()
}

/// Build a graph from `(name, dependencies)` pairs
pub fn graph(layout: &[(&str, &[&str])]) -> DependencyGraph {
    DependencyGraph::build(nodes(layout), vec![]).unwrap()
}

/// Single-resource proposal draft
pub fn edit(resource: &str) -> ProposalDraft {
    ProposalDraft::new(format!("update {resource}"), ChangeSet::single(resource, "old", "new"))
}

/// Oracle that replays scripted answers
///
/// - proposals: queued drafts per node (one popped per call), or a draft a
///   node proposes every time it is asked
/// - votes: a fixed evaluation per evaluator, falling back to `default_vote`
/// - arbitration: the configured verdict, or an error when none is set
/// - failing nodes: every call for them returns `OracleError::Unavailable`
#[derive(Debug)]
pub struct ScriptedOracle {
    queued: Mutex<BTreeMap<String, VecDeque<ProposalDraft>>>,
    always: BTreeMap<String, ProposalDraft>,
    votes: BTreeMap<String, EvaluationDraft>,
    default_vote: EvaluationDraft,
    verdict: Option<EvaluationDraft>,
    failing: BTreeSet<String>,
    evaluated: Mutex<Vec<(String, ProposalId)>>,
    arbitrated: Mutex<Vec<(String, ProposalId)>>,
    contexts: Mutex<Vec<(String, OracleContext)>>,
}

impl Default for ScriptedOracle {
    fn default() -> Self {
        Self {
            queued: Mutex::default(),
            always: BTreeMap::new(),
            votes: BTreeMap::new(),
            default_vote: EvaluationDraft::accept(),
            verdict: None,
            failing: BTreeSet::new(),
            evaluated: Mutex::default(),
            arbitrated: Mutex::default(),
            contexts: Mutex::default(),
        }
    }
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one proposal for `node`
    pub fn propose_once(self, node: &str, draft: ProposalDraft) -> Self {
        self.queued
            .lock()
            .entry(node.to_string())
            .or_default()
            .push_back(draft);
        self
    }

    /// `node` proposes `draft` every time it is asked
    pub fn propose_always(mut self, node: &str, draft: ProposalDraft) -> Self {
        self.always.insert(node.to_string(), draft);
        self
    }

    /// Fixed evaluation returned by `node`
    pub fn vote(mut self, node: &str, draft: EvaluationDraft) -> Self {
        self.votes.insert(node.to_string(), draft);
        self
    }

    /// Evaluation returned by nodes without a fixed vote
    pub fn default_vote(mut self, draft: EvaluationDraft) -> Self {
        self.default_vote = draft;
        self
    }

    /// Arbiter verdict
    pub fn verdict(mut self, draft: EvaluationDraft) -> Self {
        self.verdict = Some(draft);
        self
    }

    /// Every call for `node` fails
    pub fn fail_node(mut self, node: &str) -> Self {
        self.failing.insert(node.to_string());
        self
    }

    /// `(evaluator, proposal)` pairs in call order
    pub fn evaluated(&self) -> Vec<(String, ProposalId)> {
        self.evaluated.lock().clone()
    }

    /// Whether any evaluator saw `proposal`
    pub fn was_evaluated(&self, proposal: ProposalId) -> bool {
        self.evaluated.lock().iter().any(|(_, id)| *id == proposal)
    }

    /// `(arbiter, proposal)` pairs in call order
    pub fn arbitrated(&self) -> Vec<(String, ProposalId)> {
        self.arbitrated.lock().clone()
    }

    /// Contexts passed to `propose`, with the node asked
    pub fn propose_contexts(&self) -> Vec<(String, OracleContext)> {
        self.contexts.lock().clone()
    }

    fn check(&self, node: &Node) -> Result<(), OracleError> {
        if self.failing.contains(node.name()) {
            Err(OracleError::Unavailable(format!("{} is scripted to fail", node.name())))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ReasoningOracle for ScriptedOracle {
    async fn propose(
        &self,
        node: &Node,
        context: &OracleContext,
    ) -> Result<Option<ProposalDraft>, OracleError> {
        self.contexts
            .lock()
            .push((node.name().to_string(), context.clone()));
        self.check(node)?;
        if let Some(draft) = self
            .queued
            .lock()
            .get_mut(node.name())
            .and_then(VecDeque::pop_front)
        {
            return Ok(Some(draft));
        }
        Ok(self.always.get(node.name()).cloned())
    }

    async fn evaluate(
        &self,
        node: &Node,
        proposal: &Proposal,
        _context: &OracleContext,
    ) -> Result<EvaluationDraft, OracleError> {
        self.check(node)?;
        self.evaluated
            .lock()
            .push((node.name().to_string(), proposal.id));
        Ok(self
            .votes
            .get(node.name())
            .cloned()
            .unwrap_or_else(|| self.default_vote.clone()))
    }

    async fn arbitrate(
        &self,
        arbiter: &Node,
        proposal: &Proposal,
        _evaluations: &[Evaluation],
        _round: u32,
    ) -> Result<EvaluationDraft, OracleError> {
        self.check(arbiter)?;
        self.arbitrated
            .lock()
            .push((arbiter.name().to_string(), proposal.id));
        self.verdict
            .clone()
            .ok_or_else(|| OracleError::Other("no verdict scripted".into()))
    }
}

/// Applier that records every commit it receives
#[derive(Debug, Default)]
pub struct RecordingApplier {
    applied: Mutex<Vec<CommitId>>,
}

impl RecordingApplier {
    pub fn applied(&self) -> Vec<CommitId> {
        self.applied.lock().clone()
    }
}

#[async_trait]
impl CommitApplier for RecordingApplier {
    async fn apply(&self, commit: &CommitRecord) -> Result<(), ApplyError> {
        self.applied.lock().push(commit.id);
        Ok(())
    }
}

/// Applier that fails for commits touching any of the listed resources
#[derive(Debug, Default)]
pub struct FailingApplier {
    resources: BTreeSet<String>,
}

impl FailingApplier {
    pub fn on(resources: &[&str]) -> Self {
        Self {
            resources: resources.iter().map(|r| r.to_string()).collect(),
        }
    }
}

#[async_trait]
impl CommitApplier for FailingApplier {
    async fn apply(&self, commit: &CommitRecord) -> Result<(), ApplyError> {
        match commit
            .modified_resources
            .iter()
            .find(|r| self.resources.contains(*r))
        {
            Some(resource) => Err(ApplyError::StaleBase {
                resource: resource.clone(),
            }),
            None => Ok(()),
        }
    }
}
