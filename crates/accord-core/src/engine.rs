//! Negotiation engine
//!
//! Drives the round-synchronous protocol over a built dependency graph:
//!
//! 1. Proposal collection in activation order (queued counter-proposals
//!    first, then one `propose` call per node with budget left)
//! 2. Distribution to every other node, or to the named target only
//! 3. Evaluation; calls run concurrently but are aggregated at a barrier
//! 4. Conflict detection on the accept/reject tally
//! 5. Arbitration of conflicted proposals when the policy requires it
//! 6. Commit creation under the resource-modification caps
//! 7. Convergence and safety checks
//!
//! Oracle failures and timeouts degrade to "no output"; nothing but an
//! invalid policy or an internal phase error makes [`NegotiationEngine::run`]
//! return `Err`.

use crate::applier::{CommitApplier, DryRunApplier};
use crate::arbitration::{select_arbiter, settle, VoteOutcome, VoteTally};
use crate::error::{NegotiationFault, OracleError, OracleOperation, SessionError};
use crate::oracle::{OracleContext, ReasoningOracle};
use crate::policy::SafetyPolicy;
use crate::session::{ProposalOutcome, QueuedCounter, SessionSnapshot, SessionState, SnapshotHandle};
use crate::state_machine::SessionPhase;
use crate::summary::{
    DeferralRecord, FaultRecord, NegotiationSummary, RejectionReason, RejectionRecord,
    RejectionStage, TerminationReason,
};
use crate::trace::{NegotiationTrace, TraceEvent};
use crate::types::{
    ApplyStatus, CommitRecord, ConsensusType, Decision, Evaluation, Proposal, ProposalDraft,
    ProposalId, SessionId,
};
use accord_graph::{DependencyEdge, DependencyGraph, Node, NodeDefinition};
use futures::future::join_all;
use parking_lot::RwLock;
use std::cmp::Reverse;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::Instrument;

/// Engine tuning outside the safety policy
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deadline for a single oracle call
    pub oracle_timeout: Duration,
    /// Oracle calls allowed in flight during one phase
    pub max_concurrent_calls: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            oracle_timeout: Duration::from_secs(30),
            max_concurrent_calls: 8,
        }
    }
}

impl EngineConfig {
    /// With oracle call timeout
    #[inline]
    #[must_use]
    pub fn with_oracle_timeout(mut self, timeout: Duration) -> Self {
        self.oracle_timeout = timeout;
        self
    }

    /// With concurrency bound (at least 1)
    #[inline]
    #[must_use]
    pub fn with_max_concurrent_calls(mut self, max: usize) -> Self {
        self.max_concurrent_calls = max.max(1);
        self
    }
}

/// How a proposal left the vote and arbitration phases
#[derive(Debug)]
enum Resolution {
    Accept(ConsensusType),
    Reject(RejectionReason),
}

/// One negotiation session over a fixed graph, policy and oracle
pub struct NegotiationEngine {
    graph: Arc<DependencyGraph>,
    policy: SafetyPolicy,
    config: EngineConfig,
    oracle: Arc<dyn ReasoningOracle>,
    applier: Arc<dyn CommitApplier>,
    state: Arc<RwLock<SessionState>>,
    trace: NegotiationTrace,
}

impl fmt::Debug for NegotiationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NegotiationEngine")
            .field("nodes", &self.graph.len())
            .field("policy", &self.policy)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl NegotiationEngine {
    /// Create an engine with a dry-run applier and default config
    #[must_use]
    pub fn new(
        graph: impl Into<Arc<DependencyGraph>>,
        policy: SafetyPolicy,
        oracle: Arc<dyn ReasoningOracle>,
    ) -> Self {
        let graph = graph.into();
        let state = SessionState::new(
            SessionId::new(),
            graph.activation_order().iter().map(String::as_str),
        );
        Self {
            graph,
            policy,
            config: EngineConfig::default(),
            oracle,
            applier: Arc::new(DryRunApplier),
            state: Arc::new(RwLock::new(state)),
            trace: NegotiationTrace::default(),
        }
    }

    /// With commit applier
    #[inline]
    #[must_use]
    pub fn with_applier(mut self, applier: Arc<dyn CommitApplier>) -> Self {
        self.applier = applier;
        self
    }

    /// With engine config
    #[inline]
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Session identifier
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.state.read().session_id
    }

    /// Read-only observer usable while [`run`](Self::run) executes elsewhere
    #[must_use]
    pub fn snapshot_handle(&self) -> SnapshotHandle {
        SnapshotHandle::new(Arc::clone(&self.state))
    }

    /// Current snapshot
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.read().snapshot()
    }

    /// Run the session to termination
    ///
    /// # Errors
    /// - `SessionError::InvalidPolicy` if the policy fails validation
    /// - `SessionError::Internal` on an illegal phase transition
    pub async fn run(self) -> Result<NegotiationSummary, SessionError> {
        self.policy.validate()?;
        let span = tracing::info_span!("negotiation", session = %self.session_id());
        self.drive().instrument(span).await
    }

    async fn drive(&self) -> Result<NegotiationSummary, SessionError> {
        tracing::info!(
            nodes = self.graph.len(),
            max_rounds = self.policy.max_rounds,
            "Negotiation started"
        );
        self.trace.record(
            0,
            None,
            None,
            TraceEvent::SessionStarted {
                nodes: self.graph.len(),
            },
        );

        let termination = if self.policy.max_rounds == 0 {
            TerminationReason::MaxRounds
        } else {
            let mut round = 0;
            loop {
                self.begin_round(round)?;
                let submitted = self.collect_proposals(round).await;
                if round == 0 {
                    self.state.write().transition(SessionPhase::RoundActive)?;
                }
                let mut evaluations = self.collect_evaluations(round, &submitted).await;
                let settled = self.detect_conflicts(round, &submitted, &evaluations)?;
                let resolutions = self
                    .arbitrate(round, &submitted, settled, &mut evaluations)
                    .await?;
                self.commit(round, &submitted, resolutions, &evaluations)
                    .await?;
                if let Some(reason) = self.check_termination(round, submitted.len())? {
                    break reason;
                }
                round += 1;
            }
        };

        self.finish(termination)
    }

    fn begin_round(&self, round: u32) -> Result<(), SessionError> {
        let mut state = self.state.write();
        if round > 0 {
            state.transition(SessionPhase::RoundActive)?;
        }
        state.round = round;
        state.round_usage.clear();
        state.open.clear();
        Ok(())
    }

    async fn collect_proposals(&self, round: u32) -> Vec<Proposal> {
        let mut submitted = Vec::new();

        for (index, name) in self.graph.activation_order().iter().enumerate() {
            let Some(node) = self.graph.node(name) else {
                continue;
            };

            let queued = self.state.write().counters.remove(name).unwrap_or_default();
            for counter in queued {
                self.submit(
                    node,
                    round,
                    counter.draft,
                    Some((counter.parent, counter.parent_depth)),
                    &mut submitted,
                );
            }

            let context = {
                let state = self.state.read();
                if self.budget_left(&state, name) == 0 {
                    tracing::debug!(node = %name, round, "No proposal budget left");
                    continue;
                }
                self.context(&state, node, index, round, &submitted)
            };

            match self.call(self.oracle.propose(node, &context)).await {
                Ok(Some(draft)) => self.submit(node, round, draft, None, &mut submitted),
                Ok(None) => tracing::trace!(node = %name, round, "Nothing to propose"),
                Err(detail) => self.oracle_failed(name, OracleOperation::Propose, round, detail),
            }
        }

        submitted
    }

    fn submit(
        &self,
        node: &Node,
        round: u32,
        draft: ProposalDraft,
        counter_of: Option<(ProposalId, u32)>,
        submitted: &mut Vec<Proposal>,
    ) {
        let name = node.name();
        let (proposal, fault) = {
            let mut state = self.state.write();
            state.attempted += 1;
            let id = state.next_proposal_id();
            let proposal = Proposal::from_draft(id, name, round, draft, counter_of);

            if self.budget_left(&state, name) == 0 {
                let fault = NegotiationFault::BudgetExceeded {
                    node: name.to_string(),
                };
                (proposal, Some(fault))
            } else {
                state.consume_slot(name);
                let fault = self.submission_fault(&state, &proposal);
                if fault.is_none() {
                    state.proposals.insert(proposal.id, proposal.clone());
                    state.open.push(proposal.id);
                }
                (proposal, fault)
            }
        };

        if let Some(fault) = fault {
            self.reject(&proposal, RejectionStage::Submission, RejectionReason::Fault { fault });
            return;
        }

        tracing::debug!(
            node = %name,
            round,
            proposal = %proposal.id,
            target = proposal.target.as_deref().unwrap_or("*"),
            intent = %proposal.intent,
            "Proposal submitted"
        );
        self.trace.record(
            round,
            Some(name),
            Some(proposal.id),
            TraceEvent::ProposalSubmitted {
                target: proposal.target.clone(),
            },
        );
        submitted.push(proposal);
    }

    /// Hard submission rules, protected resources first
    fn submission_fault(&self, state: &SessionState, proposal: &Proposal) -> Option<NegotiationFault> {
        if let Some(resource) = self.policy.protected_in(&proposal.change) {
            return Some(NegotiationFault::ProtectedResourceViolation {
                resource: resource.to_string(),
            });
        }

        let malformed = |detail: String| Some(NegotiationFault::MalformedProposal { detail });
        if proposal.change.is_empty() {
            return malformed("change set has no edits".to_string());
        }
        if proposal.change.edits.iter().any(|e| e.resource.trim().is_empty()) {
            return malformed("edit without a resource identifier".to_string());
        }
        if let Some(target) = &proposal.target {
            if !self.graph.contains(target) {
                return malformed(format!("unknown target node {target}"));
            }
            if *target == proposal.origin {
                return malformed("proposal targets its own node".to_string());
            }
        }
        if let Some(missing) = proposal
            .depends_on
            .iter()
            .find(|id| !state.proposals.contains_key(*id))
        {
            return malformed(format!("depends on unknown proposal {missing}"));
        }
        if proposal.counter_depth > self.policy.max_counter_depth {
            return Some(NegotiationFault::CounterDepthExceeded {
                depth: proposal.counter_depth,
                cap: self.policy.max_counter_depth,
            });
        }
        None
    }

    async fn collect_evaluations(&self, round: u32, submitted: &[Proposal]) -> Vec<Vec<Evaluation>> {
        let contexts: Vec<OracleContext> = {
            let state = self.state.read();
            self.graph
                .activation_order()
                .iter()
                .enumerate()
                .filter_map(|(index, name)| self.graph.node(name).map(|node| (index, node)))
                .map(|(index, node)| self.context(&state, node, index, round, submitted))
                .collect()
        };

        let jobs: Vec<(usize, usize)> = submitted
            .iter()
            .enumerate()
            .flat_map(|(i, proposal)| {
                self.recipients(proposal)
                    .into_iter()
                    .map(move |evaluator| (i, evaluator))
            })
            .collect();

        let semaphore = Semaphore::new(self.config.max_concurrent_calls.max(1));
        let results = join_all(jobs.iter().map(|&(i, evaluator)| {
            let semaphore = &semaphore;
            let proposal = &submitted[i];
            let context = &contexts[evaluator];
            async move {
                let _permit = semaphore.acquire().await;
                let node = self.node_at(evaluator);
                match node {
                    Some(node) => self.call(self.oracle.evaluate(node, proposal, context)).await,
                    None => Err("evaluator vanished from graph".to_string()),
                }
            }
        }))
        .await;

        // Barrier: everything below runs only once every call has finished.
        let mut per_proposal: Vec<Vec<Evaluation>> = vec![Vec::new(); submitted.len()];
        for (&(i, evaluator), result) in jobs.iter().zip(results) {
            let proposal = &submitted[i];
            let name = self.graph.activation_order()[evaluator].as_str();
            match result {
                Ok(draft) => {
                    let evaluation = Evaluation::from_draft(proposal.id, name, round, draft);
                    self.record_evaluation(proposal, &evaluation);
                    per_proposal[i].push(evaluation);
                }
                Err(detail) => self.oracle_failed(name, OracleOperation::Evaluate, round, detail),
            }
        }
        per_proposal
    }

    /// Activation-order indices of the nodes a proposal is sent to
    fn recipients(&self, proposal: &Proposal) -> Vec<usize> {
        self.graph
            .activation_order()
            .iter()
            .enumerate()
            .filter(|(_, name)| **name != proposal.origin)
            .filter(|(_, name)| proposal.target.as_ref().map_or(true, |t| t == *name))
            .map(|(index, _)| index)
            .collect()
    }

    fn node_at(&self, index: usize) -> Option<&Node> {
        self.graph
            .activation_order()
            .get(index)
            .and_then(|name| self.graph.node(name))
    }

    fn record_evaluation(&self, proposal: &Proposal, evaluation: &Evaluation) {
        tracing::debug!(
            proposal = %proposal.id,
            evaluator = %evaluation.evaluator,
            decision = %evaluation.decision,
            confidence = evaluation.confidence,
            "Evaluation recorded"
        );
        self.trace.record(
            evaluation.round,
            Some(evaluation.evaluator.as_str()),
            Some(proposal.id),
            TraceEvent::EvaluationRecorded {
                decision: evaluation.decision,
                confidence: evaluation.confidence,
            },
        );

        let mut state = self.state.write();
        state.evaluations += 1;
        state.memory_mut(&evaluation.evaluator).seen.push(proposal.id);
        if let (Decision::Counter, Some(draft)) =
            (evaluation.decision, evaluation.counter_proposal.clone())
        {
            state
                .counters
                .entry(evaluation.evaluator.clone())
                .or_default()
                .push(QueuedCounter {
                    parent: proposal.id,
                    parent_depth: proposal.counter_depth,
                    draft,
                });
        }
    }

    fn detect_conflicts(
        &self,
        round: u32,
        submitted: &[Proposal],
        evaluations: &[Vec<Evaluation>],
    ) -> Result<Vec<(VoteTally, VoteOutcome)>, SessionError> {
        self.state.write().transition(SessionPhase::ConflictCheck)?;

        Ok(submitted
            .iter()
            .zip(evaluations)
            .map(|(proposal, evals)| {
                let tally = VoteTally::from_evaluations(evals);
                if tally.is_conflicted() {
                    tracing::debug!(
                        proposal = %proposal.id,
                        accepts = tally.accepts,
                        rejects = tally.rejects,
                        "Conflict detected"
                    );
                    self.trace.record(
                        round,
                        Some(proposal.origin.as_str()),
                        Some(proposal.id),
                        TraceEvent::ConflictDetected {
                            accepts: tally.accepts,
                            rejects: tally.rejects,
                        },
                    );
                }
                (tally, settle(&tally, self.policy.arbitration_required))
            })
            .collect())
    }

    async fn arbitrate(
        &self,
        round: u32,
        submitted: &[Proposal],
        settled: Vec<(VoteTally, VoteOutcome)>,
        evaluations: &mut [Vec<Evaluation>],
    ) -> Result<Vec<Resolution>, SessionError> {
        if settled
            .iter()
            .any(|(_, outcome)| *outcome == VoteOutcome::NeedsArbitration)
        {
            self.state.write().transition(SessionPhase::Arbitration)?;
        }

        let mut resolutions = Vec::with_capacity(settled.len());
        for (i, (tally, outcome)) in settled.into_iter().enumerate() {
            let proposal = &submitted[i];
            let resolution = match outcome {
                VoteOutcome::Accepted(consensus) => Resolution::Accept(consensus),
                VoteOutcome::Rejected => Resolution::Reject(RejectionReason::Vote {
                    accepts: tally.accepts,
                    rejects: tally.rejects,
                }),
                VoteOutcome::NeedsArbitration => {
                    self.arbitrate_one(round, proposal, &mut evaluations[i]).await
                }
            };
            resolutions.push(resolution);
        }
        Ok(resolutions)
    }

    async fn arbitrate_one(
        &self,
        round: u32,
        proposal: &Proposal,
        evaluations: &mut Vec<Evaluation>,
    ) -> Resolution {
        let unavailable = || {
            Resolution::Reject(RejectionReason::Fault {
                fault: NegotiationFault::ArbitrationUnavailable {
                    proposal: proposal.id,
                },
            })
        };

        let Some(arbiter) = select_arbiter(&self.graph, &proposal.origin) else {
            tracing::warn!(proposal = %proposal.id, "Arbitration required but no arbiter available");
            return unavailable();
        };

        let draft = match self
            .call(self.oracle.arbitrate(arbiter, proposal, evaluations.as_slice(), round))
            .await
        {
            Ok(draft) => draft,
            Err(detail) => {
                self.oracle_failed(arbiter.name(), OracleOperation::Arbitrate, round, detail);
                tracing::warn!(proposal = %proposal.id, arbiter = arbiter.name(), "Arbitration failed");
                return unavailable();
            }
        };

        let verdict = Evaluation::binding(proposal.id, arbiter.name(), round, draft);
        tracing::info!(
            proposal = %proposal.id,
            arbiter = arbiter.name(),
            decision = %verdict.decision,
            "Arbiter ruled"
        );
        self.trace.record(
            round,
            Some(arbiter.name()),
            Some(proposal.id),
            TraceEvent::Arbitrated {
                decision: verdict.decision,
            },
        );
        self.state.write().arbitrations += 1;

        let resolution = if verdict.decision == Decision::Accept {
            Resolution::Accept(ConsensusType::Arbiter)
        } else {
            Resolution::Reject(RejectionReason::Arbiter {
                arbiter: arbiter.name().to_string(),
            })
        };
        evaluations.push(verdict);
        resolution
    }

    async fn commit(
        &self,
        round: u32,
        submitted: &[Proposal],
        resolutions: Vec<Resolution>,
        evaluations: &[Vec<Evaluation>],
    ) -> Result<(), SessionError> {
        self.state.write().transition(SessionPhase::Committing)?;

        // Higher priority first, then submission order, so caps favour
        // the proposals their authors ranked most important.
        let mut order: Vec<usize> = (0..submitted.len()).collect();
        order.sort_by_key(|&i| (Reverse(submitted[i].priority), submitted[i].id));

        let mut resolutions: Vec<Option<Resolution>> = resolutions.into_iter().map(Some).collect();
        for i in order {
            let proposal = &submitted[i];
            match resolutions[i].take() {
                Some(Resolution::Accept(consensus)) => {
                    self.create_commit(round, proposal, consensus, &evaluations[i])
                        .await;
                }
                Some(Resolution::Reject(reason)) => {
                    self.reject(proposal, RejectionStage::Resolution, reason);
                }
                None => {}
            }
        }

        self.state.write().open.clear();
        Ok(())
    }

    async fn create_commit(
        &self,
        round: u32,
        proposal: &Proposal,
        consensus: ConsensusType,
        evaluations: &[Evaluation],
    ) {
        let resources: Vec<String> = proposal
            .change
            .resources()
            .into_iter()
            .map(str::to_string)
            .collect();

        let commit_id = {
            let mut state = self.state.write();
            let remaining = self
                .policy
                .max_total_resources
                .saturating_sub(state.resources_modified);

            if resources.len() > self.policy.max_resources_per_commit || resources.len() > remaining
            {
                let fault = NegotiationFault::ResourceCapExceeded {
                    proposal: proposal.id,
                    requested: resources.len(),
                    per_commit_cap: self.policy.max_resources_per_commit,
                    remaining,
                };
                tracing::warn!(proposal = %proposal.id, %fault, "Accepted proposal deferred");
                state.deferred.push(DeferralRecord {
                    proposal: proposal.id,
                    node: proposal.origin.clone(),
                    round,
                    fault: fault.clone(),
                });
                state
                    .memory_mut(&proposal.origin)
                    .outcomes
                    .insert(proposal.id, ProposalOutcome::Deferred);
                drop(state);
                self.trace.record(
                    round,
                    Some(proposal.origin.as_str()),
                    Some(proposal.id),
                    TraceEvent::Deferred { fault },
                );
                return;
            }

            state.resources_modified += resources.len();
            state
                .memory_mut(&proposal.origin)
                .outcomes
                .insert(proposal.id, ProposalOutcome::Committed);
            state.next_commit_id()
        };

        self.trace.record(
            round,
            Some(proposal.origin.as_str()),
            Some(proposal.id),
            TraceEvent::Committed {
                commit: commit_id,
                consensus,
            },
        );

        let record = CommitRecord {
            id: commit_id,
            proposal: proposal.id,
            round,
            proposer: proposal.origin.clone(),
            evaluators: evaluations.iter().map(|e| e.evaluator.clone()).collect(),
            consensus,
            change: proposal.change.clone(),
            modified_resources: resources,
            timestamp: chrono::Utc::now(),
            trace: self.trace.for_proposal(proposal.id),
        };
        tracing::info!(
            commit = %record.id,
            proposal = %proposal.id,
            proposer = %proposal.origin,
            consensus = %consensus,
            "Commit created"
        );
        self.state.write().committed.push(record.clone());

        let status = match self.applier.apply(&record).await {
            Ok(()) => {
                self.trace.record(
                    round,
                    Some(proposal.origin.as_str()),
                    Some(proposal.id),
                    TraceEvent::CommitApplied { commit: commit_id },
                );
                ApplyStatus::Applied
            }
            Err(e) => {
                tracing::warn!(commit = %commit_id, error = %e, "Commit apply failed");
                self.trace.record(
                    round,
                    Some(proposal.origin.as_str()),
                    Some(proposal.id),
                    TraceEvent::CommitApplyFailed {
                        commit: commit_id,
                        reason: e.to_string(),
                    },
                );
                ApplyStatus::ApplyFailed {
                    reason: e.to_string(),
                }
            }
        };
        self.state.write().apply_status.insert(commit_id, status);
    }

    fn reject(&self, proposal: &Proposal, stage: RejectionStage, reason: RejectionReason) {
        match reason.fault() {
            Some(
                fault @ (NegotiationFault::ProtectedResourceViolation { .. }
                | NegotiationFault::MalformedProposal { .. }),
            ) => {
                tracing::warn!(proposal = %proposal.id, node = %proposal.origin, %fault, "Proposal refused");
            }
            _ => {
                tracing::debug!(proposal = %proposal.id, node = %proposal.origin, %reason, "Proposal rejected");
            }
        }

        self.trace.record(
            proposal.round,
            Some(proposal.origin.as_str()),
            Some(proposal.id),
            TraceEvent::ProposalRejected {
                reason: reason.to_string(),
            },
        );

        let mut state = self.state.write();
        state
            .memory_mut(&proposal.origin)
            .outcomes
            .insert(proposal.id, ProposalOutcome::Rejected);
        state.rejected.push(RejectionRecord {
            proposal: proposal.id,
            node: proposal.origin.clone(),
            round: proposal.round,
            stage,
            reason,
        });
    }

    fn check_termination(
        &self,
        round: u32,
        submitted: usize,
    ) -> Result<Option<TerminationReason>, SessionError> {
        let mut state = self.state.write();
        state.transition(SessionPhase::ConvergenceCheck)?;
        state.rounds_executed = round + 1;

        if submitted == 0 {
            state.idle_rounds += 1;
        } else {
            state.idle_rounds = 0;
        }

        tracing::info!(
            round,
            submitted,
            commits = state.committed.len(),
            idle_rounds = state.idle_rounds,
            resources_modified = state.resources_modified,
            "Round complete"
        );

        let reason = if state.idle_rounds >= self.policy.convergence_threshold {
            Some(TerminationReason::Convergence)
        } else if state.rounds_executed >= self.policy.max_rounds {
            Some(TerminationReason::MaxRounds)
        } else if state.resources_modified >= self.policy.max_total_resources {
            Some(TerminationReason::ResourceLimit)
        } else {
            None
        };
        Ok(reason)
    }

    fn finish(&self, termination: TerminationReason) -> Result<NegotiationSummary, SessionError> {
        let round = {
            let mut state = self.state.write();
            state.transition(SessionPhase::Terminated)?;
            state.round
        };
        self.trace.record(
            round,
            None,
            None,
            TraceEvent::Terminated {
                reason: termination,
            },
        );

        let state = self.state.read();
        tracing::info!(
            reason = %termination,
            rounds = state.rounds_executed,
            commits = state.committed.len(),
            rejections = state.rejected.len(),
            "Negotiation terminated"
        );

        Ok(NegotiationSummary {
            session_id: state.session_id,
            rounds_executed: state.rounds_executed,
            termination,
            commits: state.committed.clone(),
            apply_status: state.apply_status.clone(),
            proposals_attempted: state.attempted,
            proposals_submitted: state.proposals.len(),
            evaluations: state.evaluations,
            arbitrations: state.arbitrations,
            rejections: state.rejected.clone(),
            deferrals: state.deferred.clone(),
            oracle_failures: state.oracle_failures.clone(),
            proposal_usage: state.usage.clone(),
            resources_modified: state.resources_modified,
            trace: self.trace.entries(),
        })
    }

    fn budget_left(&self, state: &SessionState, node: &str) -> usize {
        let total = self
            .policy
            .max_proposals_per_agent
            .saturating_sub(state.used(node));
        let this_round = self
            .policy
            .max_proposals_per_round
            .saturating_sub(state.used_this_round(node));
        total.min(this_round)
    }

    fn context(
        &self,
        state: &SessionState,
        node: &Node,
        activation_index: usize,
        round: u32,
        visible: &[Proposal],
    ) -> OracleContext {
        OracleContext {
            session_id: state.session_id,
            round,
            activation_index,
            dependencies: node.dependencies().iter().cloned().collect(),
            artifact: node.artifact().clone(),
            memory: state.memory.get(node.name()).cloned().unwrap_or_default(),
            visible_proposals: visible.to_vec(),
            committed_resources: state.committed_resources(),
            remaining_budget: self.budget_left(state, node.name()),
        }
    }

    /// Run an oracle call under the configured timeout
    async fn call<T>(&self, fut: impl Future<Output = Result<T, OracleError>>) -> Result<T, String> {
        match tokio::time::timeout(self.config.oracle_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {:?}", self.config.oracle_timeout)),
        }
    }

    fn oracle_failed(&self, node: &str, operation: OracleOperation, round: u32, detail: String) {
        let fault = NegotiationFault::OracleFailure {
            node: node.to_string(),
            operation,
            detail,
        };
        tracing::warn!(node, round, %fault, "Oracle call produced no output");
        self.trace.record(
            round,
            Some(node),
            None,
            TraceEvent::OracleFailed {
                fault: fault.clone(),
            },
        );
        self.state
            .write()
            .oracle_failures
            .push(FaultRecord { round, fault });
    }
}

/// Run one session over an already built graph
///
/// # Errors
/// See [`NegotiationEngine::run`]
pub async fn run_session(
    graph: impl Into<Arc<DependencyGraph>>,
    policy: SafetyPolicy,
    oracle: Arc<dyn ReasoningOracle>,
) -> Result<NegotiationSummary, SessionError> {
    NegotiationEngine::new(graph, policy, oracle).run().await
}

/// Build the graph from scanner output, then run one session
///
/// # Errors
/// `SessionError::Graph` (fatal, the session never starts) if the graph is
/// cyclic or inconsistent; otherwise see [`NegotiationEngine::run`]
pub async fn negotiate(
    definitions: Vec<NodeDefinition>,
    edges: Vec<DependencyEdge>,
    policy: SafetyPolicy,
    oracle: Arc<dyn ReasoningOracle>,
) -> Result<NegotiationSummary, SessionError> {
    let graph = DependencyGraph::build(definitions, edges)?;
    run_session(graph, policy, oracle).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::MockReasoningOracle;
    use crate::types::{ChangeSet, EvaluationDraft};
    use async_trait::async_trait;

    fn graph(defs: Vec<NodeDefinition>) -> Arc<DependencyGraph> {
        Arc::new(DependencyGraph::build(defs, vec![]).unwrap())
    }

    fn edit(resource: &str) -> ProposalDraft {
        ProposalDraft::new("tidy", ChangeSet::single(resource, "old", "new"))
    }

    #[tokio::test]
    async fn test_oracle_errors_degrade_to_no_output() {
        let g = graph(vec![
            NodeDefinition::regular("a"),
            NodeDefinition::regular("b").depends_on("a"),
        ]);
        let mut oracle = MockReasoningOracle::new();
        oracle.expect_propose().returning(|node, _| match node.name() {
            "a" => Err(OracleError::Unavailable("offline".into())),
            _ => Ok(Some(edit("src/b.rs"))),
        });
        oracle
            .expect_evaluate()
            .returning(|_, _, _| Err(OracleError::InvalidResponse("garbled".into())));

        let policy = SafetyPolicy::new().with_max_proposals_per_agent(1);
        let summary = NegotiationEngine::new(g, policy, Arc::new(oracle))
            .run()
            .await
            .unwrap();

        assert_eq!(summary.termination, TerminationReason::Convergence);
        assert_eq!(summary.rounds_executed, 3);
        // a: propose x3, evaluate x1
        assert_eq!(summary.oracle_failures.len(), 4);
        assert!(summary.commits.is_empty());
        let rejection = &summary.rejections[0];
        assert_eq!(rejection.reason.fault().map(NegotiationFault::kind), Some("arbitration_unavailable"));
        assert!(summary.verify_trace().is_ok());
    }

    #[tokio::test]
    async fn test_tie_without_arbitration_is_rejected() {
        let g = graph(vec![
            NodeDefinition::regular("a"),
            NodeDefinition::regular("b"),
            NodeDefinition::regular("c"),
        ]);
        let mut oracle = MockReasoningOracle::new();
        oracle.expect_propose().returning(|node, ctx| {
            Ok((node.name() == "a" && ctx.round == 0).then(|| edit("src/a.rs")))
        });
        oracle.expect_evaluate().returning(|node, _, _| {
            Ok(match node.name() {
                "b" => EvaluationDraft::accept(),
                _ => EvaluationDraft::reject(),
            })
        });
        oracle.expect_arbitrate().never();

        let policy = SafetyPolicy::new().with_arbitration_required(false);
        let summary = run_session(g, policy, Arc::new(oracle)).await.unwrap();

        assert!(summary.commits.is_empty());
        assert_eq!(
            summary.rejections[0].reason,
            RejectionReason::Vote {
                accepts: 1,
                rejects: 1
            }
        );
        assert_eq!(summary.arbitrations, 0);
    }

    #[tokio::test]
    async fn test_arbiter_breaks_tie() {
        let g = graph(vec![
            NodeDefinition::regular("a"),
            NodeDefinition::regular("b"),
            NodeDefinition::regular("c"),
            NodeDefinition::arbiter("judge"),
        ]);
        let mut oracle = MockReasoningOracle::new();
        oracle.expect_propose().returning(|node, ctx| {
            Ok((node.name() == "a" && ctx.round == 0).then(|| edit("src/a.rs")))
        });
        oracle.expect_evaluate().returning(|node, _, _| {
            Ok(match node.name() {
                "b" => EvaluationDraft::accept(),
                "c" => EvaluationDraft::reject(),
                _ => EvaluationDraft::defer(),
            })
        });
        oracle
            .expect_arbitrate()
            .times(1)
            .returning(|arbiter, _, evaluations, _| {
                assert_eq!(arbiter.name(), "judge");
                assert_eq!(evaluations.len(), 3);
                Ok(EvaluationDraft::accept().with_confidence(0.2))
            });

        let summary = run_session(g, SafetyPolicy::new(), Arc::new(oracle))
            .await
            .unwrap();

        assert_eq!(summary.commits.len(), 1);
        let commit = &summary.commits[0];
        assert_eq!(commit.consensus, ConsensusType::Arbiter);
        assert_eq!(commit.evaluators, vec!["b", "c", "judge", "judge"]);
        assert_eq!(summary.arbitrations, 1);
    }

    #[tokio::test]
    async fn test_counter_proposal_is_submitted_next_round() {
        let g = graph(vec![NodeDefinition::regular("a"), NodeDefinition::regular("b")]);
        let mut oracle = MockReasoningOracle::new();
        oracle.expect_propose().returning(|node, ctx| {
            Ok((node.name() == "a" && ctx.round == 0).then(|| edit("src/a.rs").targeting("b")))
        });
        oracle.expect_evaluate().returning(|node, _, _| {
            Ok(match node.name() {
                "b" => EvaluationDraft::counter(edit("src/b.rs")),
                _ => EvaluationDraft::accept(),
            })
        });

        let policy = SafetyPolicy::new().with_arbitration_required(false);
        let summary = run_session(g, policy, Arc::new(oracle)).await.unwrap();

        assert_eq!(summary.commits.len(), 1);
        let commit = &summary.commits[0];
        assert_eq!(commit.proposer, "b");
        assert_eq!(commit.round, 1);
        assert_eq!(summary.proposal_usage.get("b"), Some(&1));
        let original = summary.rejection_for(ProposalId(0)).unwrap();
        assert_eq!(original.stage, RejectionStage::Resolution);
        assert_eq!(summary.termination, TerminationReason::Convergence);
    }

    #[tokio::test]
    async fn test_zero_round_cap_terminates_before_any_call() {
        let g = graph(vec![NodeDefinition::regular("a")]);
        let oracle = MockReasoningOracle::new();

        let policy = SafetyPolicy::new().with_max_rounds(0);
        let summary = run_session(g, policy, Arc::new(oracle)).await.unwrap();

        assert_eq!(summary.termination, TerminationReason::MaxRounds);
        assert_eq!(summary.rounds_executed, 0);
        assert_eq!(summary.trace.len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_policy_is_refused() {
        let g = graph(vec![NodeDefinition::regular("a")]);
        let oracle = MockReasoningOracle::new();

        let err = run_session(g, SafetyPolicy::new().protect("  "), Arc::new(oracle))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidPolicy(_)));
    }

    #[tokio::test]
    async fn test_cycle_is_fatal() {
        let oracle = MockReasoningOracle::new();
        let err = negotiate(
            vec![
                NodeDefinition::regular("a").depends_on("b"),
                NodeDefinition::regular("b").depends_on("a"),
            ],
            vec![],
            SafetyPolicy::new(),
            Arc::new(oracle),
        )
        .await
        .unwrap_err();
        assert!(err.is_cycle());
    }

    struct SlowOracle;

    #[async_trait]
    impl ReasoningOracle for SlowOracle {
        async fn propose(
            &self,
            _node: &Node,
            _context: &OracleContext,
        ) -> Result<Option<ProposalDraft>, OracleError> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(Some(edit("src/slow.rs")))
        }

        async fn evaluate(
            &self,
            _node: &Node,
            _proposal: &Proposal,
            _context: &OracleContext,
        ) -> Result<EvaluationDraft, OracleError> {
            Ok(EvaluationDraft::accept())
        }

        async fn arbitrate(
            &self,
            _arbiter: &Node,
            _proposal: &Proposal,
            _evaluations: &[Evaluation],
            _round: u32,
        ) -> Result<EvaluationDraft, OracleError> {
            Ok(EvaluationDraft::accept())
        }
    }

    #[tokio::test]
    async fn test_slow_oracle_times_out() {
        let g = graph(vec![NodeDefinition::regular("a"), NodeDefinition::regular("b")]);
        let config = EngineConfig::default().with_oracle_timeout(Duration::from_millis(10));

        let summary = NegotiationEngine::new(g, SafetyPolicy::new().with_max_rounds(1), Arc::new(SlowOracle))
            .with_config(config)
            .run()
            .await
            .unwrap();

        assert_eq!(summary.proposals_attempted, 0);
        assert_eq!(summary.oracle_failures.len(), 2);
        assert!(summary.oracle_failures.iter().all(|f| matches!(
            &f.fault,
            NegotiationFault::OracleFailure { operation: OracleOperation::Propose, detail, .. }
                if detail.starts_with("timed out")
        )));
    }

    #[test]
    fn test_config_clamps_concurrency() {
        let config = EngineConfig::default().with_max_concurrent_calls(0);
        assert_eq!(config.max_concurrent_calls, 1);
    }
}
