//! Accord Simulator - seeded property harness for the negotiation engine
//!
//! Generates random dependency graphs and a random (but reproducible)
//! oracle, runs full sessions, and checks the session invariants after each
//! one.

use crate::engine::{EngineConfig, NegotiationEngine};
use crate::error::OracleError;
use crate::oracle::{OracleContext, ReasoningOracle};
use crate::policy::SafetyPolicy;
use crate::summary::{NegotiationSummary, RejectionStage};
use crate::types::{
    ChangeSet, Decision, Evaluation, EvaluationDraft, Priority, Proposal, ProposalDraft,
};
use accord_graph::{DependencyGraph, Node, NodeDefinition};
use async_trait::async_trait;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

/// Simulator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Sessions to run
    pub sessions: usize,
    /// Upper bound on nodes per generated graph (at least 2)
    pub max_nodes: usize,
    /// Policy applied to every session
    pub policy: SafetyPolicy,
    /// Chance that an oracle call fails
    pub failure_rate: f64,
    /// Chance that a node proposes when asked
    pub propose_rate: f64,
    /// Chance that a generated node is arbiter-flagged
    pub arbiter_rate: f64,
    pub stop_on_first_violation: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            sessions: 50,
            max_nodes: 8,
            policy: SafetyPolicy::new().protect("Cargo.lock"),
            failure_rate: 0.05,
            propose_rate: 0.6,
            arbiter_rate: 0.2,
            stop_on_first_violation: false,
        }
    }
}

/// Invariants checked after every simulated session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvariantCheck {
    SessionCompleted,
    ActivationOrderRespectsDependencies,
    RoundCapRespected,
    ResourceCapsRespected,
    ProtectedResourcesUntouched,
    ProposalBudgetsRespected,
    ProposalsAccountedFor,
    TraceChainIntact,
}

/// A violated invariant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub session: usize,
    pub check: InvariantCheck,
    pub details: String,
}

/// Totals across all simulated sessions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulatorStats {
    pub sessions_run: usize,
    pub rounds: u64,
    pub commits: usize,
    pub rejections: usize,
    pub deferrals: usize,
    pub arbitrations: usize,
    pub oracle_failures: usize,
    pub terminations: BTreeMap<String, usize>,
}

impl SimulatorStats {
    fn record(&mut self, summary: &NegotiationSummary) {
        self.sessions_run += 1;
        self.rounds += u64::from(summary.rounds_executed);
        self.commits += summary.commits.len();
        self.rejections += summary.rejections.len();
        self.deferrals += summary.deferrals.len();
        self.arbitrations += summary.arbitrations;
        self.oracle_failures += summary.oracle_failures.len();
        *self
            .terminations
            .entry(summary.termination.to_string())
            .or_insert(0) += 1;
    }
}

/// Final report from the simulator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorReport {
    pub config: SimulatorConfig,
    pub stats: SimulatorStats,
    pub violations: Vec<Violation>,
}

impl SimulatorReport {
    /// Check if simulation passed all criteria
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// Generate a text report
    #[must_use]
    pub fn generate_text(&self) -> String {
        let mut report = String::new();
        let _ = writeln!(report, "=== Accord Simulator Report ===\n");
        let _ = writeln!(report, "Seed: {}", self.config.seed);
        let _ = writeln!(report, "Sessions: {}", self.stats.sessions_run);
        let _ = writeln!(report, "Rounds: {}", self.stats.rounds);
        let _ = writeln!(report, "Commits: {}", self.stats.commits);
        let _ = writeln!(report, "Rejections: {}", self.stats.rejections);
        let _ = writeln!(report, "Deferrals: {}", self.stats.deferrals);
        let _ = writeln!(report, "Arbitrations: {}", self.stats.arbitrations);
        let _ = writeln!(report, "Oracle failures: {}", self.stats.oracle_failures);
        for (reason, count) in &self.stats.terminations {
            let _ = writeln!(report, "Terminated by {reason}: {count}");
        }
        let _ = writeln!(report, "Violations: {}", self.violations.len());

        if !self.violations.is_empty() {
            let _ = writeln!(report, "\n=== Violations ===");
            for (i, v) in self.violations.iter().enumerate() {
                let _ = writeln!(
                    report,
                    "{}. session {} {:?}: {}",
                    i + 1,
                    v.session,
                    v.check,
                    v.details
                );
            }
        }

        let _ = writeln!(
            report,
            "\n=== Result: {} ===",
            if self.passed() { "PASS" } else { "FAIL" }
        );
        report
    }
}

/// Run the Accord Simulator
pub async fn run_simulator(config: SimulatorConfig) -> SimulatorReport {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut stats = SimulatorStats::default();
    let mut violations = Vec::new();

    for session in 0..config.sessions {
        let definitions = generate_definitions(&mut rng, &config);
        let graph = match DependencyGraph::build(definitions, vec![]) {
            Ok(graph) => Arc::new(graph),
            Err(e) => {
                violations.push(Violation {
                    session,
                    check: InvariantCheck::ActivationOrderRespectsDependencies,
                    details: format!("generated graph refused: {e}"),
                });
                continue;
            }
        };

        let oracle = RandomOracle::new(rng.gen(), &config);
        let engine = NegotiationEngine::new(Arc::clone(&graph), config.policy.clone(), Arc::new(oracle))
            .with_config(EngineConfig::default());

        let found = match engine.run().await {
            Ok(summary) => {
                stats.record(&summary);
                check_session(&graph, &config.policy, &summary)
            }
            Err(e) => vec![(InvariantCheck::SessionCompleted, e.to_string())],
        };

        let failed = !found.is_empty();
        violations.extend(found.into_iter().map(|(check, details)| Violation {
            session,
            check,
            details,
        }));
        if failed && config.stop_on_first_violation {
            break;
        }
    }

    SimulatorReport {
        config,
        stats,
        violations,
    }
}

/// Random DAG: every node may depend on nodes generated before it
fn generate_definitions(rng: &mut StdRng, config: &SimulatorConfig) -> Vec<NodeDefinition> {
    let count = rng.gen_range(2..=config.max_nodes.max(2));
    let mut definitions: Vec<NodeDefinition> = Vec::with_capacity(count);

    for i in 0..count {
        let name = format!("unit_{i:02}");
        let mut def = if rng.gen_bool(config.arbiter_rate.clamp(0.0, 1.0)) {
            NodeDefinition::arbiter(name)
        } else {
            NodeDefinition::regular(name)
        };
        for earlier in 0..i {
            if rng.gen_bool(0.3) {
                def = def.depends_on(format!("unit_{earlier:02}"));
            }
        }
        definitions.push(def);
    }

    // Declaration order is independent from dependency order
    for i in (1..definitions.len()).rev() {
        let j = rng.gen_range(0..=i);
        definitions.swap(i, j);
    }
    definitions
}

/// Every violated invariant for one finished session
pub fn check_session(
    graph: &DependencyGraph,
    policy: &SafetyPolicy,
    summary: &NegotiationSummary,
) -> Vec<(InvariantCheck, String)> {
    let mut found = Vec::new();

    let order = graph.activation_order();
    for node in graph.nodes() {
        let position = order.iter().position(|n| n == node.name());
        for dependency in node.dependencies() {
            let before = order.iter().position(|n| n == dependency);
            if before >= position {
                found.push((
                    InvariantCheck::ActivationOrderRespectsDependencies,
                    format!("{} activated before its dependency {dependency}", node.name()),
                ));
            }
        }
    }

    if summary.rounds_executed > policy.max_rounds {
        found.push((
            InvariantCheck::RoundCapRespected,
            format!("{} rounds with cap {}", summary.rounds_executed, policy.max_rounds),
        ));
    }

    if summary.resources_modified > policy.max_total_resources {
        found.push((
            InvariantCheck::ResourceCapsRespected,
            format!(
                "{} resources modified with cap {}",
                summary.resources_modified, policy.max_total_resources
            ),
        ));
    }
    for commit in &summary.commits {
        if commit.modified_resources.len() > policy.max_resources_per_commit {
            found.push((
                InvariantCheck::ResourceCapsRespected,
                format!("commit {} modifies {} resources", commit.id, commit.modified_resources.len()),
            ));
        }
        if let Some(resource) = policy.protected_in(&commit.change) {
            found.push((
                InvariantCheck::ProtectedResourcesUntouched,
                format!("commit {} touches {resource}", commit.id),
            ));
        }
    }

    for (node, used) in &summary.proposal_usage {
        if *used > policy.max_proposals_per_agent {
            found.push((
                InvariantCheck::ProposalBudgetsRespected,
                format!("{node} used {used} slots"),
            ));
        }
    }

    let resolved = summary
        .rejections
        .iter()
        .filter(|r| r.stage == RejectionStage::Resolution)
        .count()
        + summary.commits.len()
        + summary.deferrals.len();
    if resolved != summary.proposals_submitted {
        found.push((
            InvariantCheck::ProposalsAccountedFor,
            format!(
                "{} submitted but {resolved} resolved",
                summary.proposals_submitted
            ),
        ));
    }
    let refused = summary
        .rejections
        .iter()
        .filter(|r| r.stage == RejectionStage::Submission)
        .count();
    if summary.proposals_submitted + refused != summary.proposals_attempted {
        found.push((
            InvariantCheck::ProposalsAccountedFor,
            format!(
                "{} attempted but {} submitted and {refused} refused",
                summary.proposals_attempted, summary.proposals_submitted
            ),
        ));
    }

    if let Err(e) = summary.verify_trace() {
        found.push((InvariantCheck::TraceChainIntact, e.to_string()));
    }

    found
}

const RESOURCES: &[&str] = &[
    "src/lib.rs",
    "src/main.rs",
    "src/config.rs",
    "src/util.rs",
    "Cargo.toml",
];

/// Oracle whose every answer is derived from a seed and the call's inputs
///
/// Answers do not depend on call order, so sessions replay identically
/// however evaluation calls interleave.
#[derive(Debug, Clone)]
pub struct RandomOracle {
    seed: u64,
    failure_rate: f64,
    propose_rate: f64,
    protected: Vec<String>,
}

impl RandomOracle {
    /// Create an oracle for one session
    #[must_use]
    pub fn new(seed: u64, config: &SimulatorConfig) -> Self {
        Self {
            seed,
            failure_rate: config.failure_rate.clamp(0.0, 1.0),
            propose_rate: config.propose_rate.clamp(0.0, 1.0),
            protected: config.policy.protected_resources.iter().cloned().collect(),
        }
    }

    fn rng_for(&self, call: &str) -> StdRng {
        let mut hasher = Sha256::new();
        hasher.update(self.seed.to_le_bytes());
        hasher.update(call.as_bytes());
        let digest = hasher.finalize();
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&digest);
        StdRng::from_seed(seed)
    }

    fn maybe_fail(&self, rng: &mut StdRng) -> Result<(), OracleError> {
        if rng.gen_bool(self.failure_rate) {
            Err(OracleError::Unavailable("simulated outage".into()))
        } else {
            Ok(())
        }
    }

    fn draft(&self, rng: &mut StdRng, nodes: &[String]) -> ProposalDraft {
        let mut change = ChangeSet::default();
        let edits = if rng.gen_bool(0.15) { 2 } else { 1 };
        for _ in 0..edits {
            let resource = if !self.protected.is_empty() && rng.gen_bool(0.1) {
                self.protected[rng.gen_range(0..self.protected.len())].clone()
            } else {
                RESOURCES[rng.gen_range(0..RESOURCES.len())].to_string()
            };
            change = change.with_edit(resource, "before", "after");
        }

        let mut draft = ProposalDraft::new("simulated change", change).with_priority(
            match rng.gen_range(0..4) {
                0 => Priority::Low,
                1 => Priority::High,
                2 => Priority::Critical,
                _ => Priority::Normal,
            },
        );
        if !nodes.is_empty() && rng.gen_bool(0.3) {
            draft = draft.targeting(nodes[rng.gen_range(0..nodes.len())].clone());
        } else if rng.gen_bool(0.02) {
            draft = draft.targeting("ghost");
        }
        draft
    }
}

#[async_trait]
impl ReasoningOracle for RandomOracle {
    async fn propose(
        &self,
        node: &Node,
        context: &OracleContext,
    ) -> Result<Option<ProposalDraft>, OracleError> {
        let mut rng = self.rng_for(&format!("propose/{}/{}", node.name(), context.round));
        self.maybe_fail(&mut rng)?;
        if !rng.gen_bool(self.propose_rate) {
            return Ok(None);
        }
        let others: Vec<String> = context
            .visible_proposals
            .iter()
            .map(|p| p.origin.clone())
            .chain(context.dependencies.iter().cloned())
            .filter(|n| n != node.name())
            .collect();
        Ok(Some(self.draft(&mut rng, &others)))
    }

    async fn evaluate(
        &self,
        node: &Node,
        proposal: &Proposal,
        context: &OracleContext,
    ) -> Result<EvaluationDraft, OracleError> {
        let mut rng = self.rng_for(&format!(
            "evaluate/{}/{}/{}",
            node.name(),
            proposal.id,
            context.round
        ));
        self.maybe_fail(&mut rng)?;
        let confidence = rng.gen_range(0.0..=1.0);
        let draft = match rng.gen_range(0..10) {
            0..=4 => EvaluationDraft::accept(),
            5..=7 => EvaluationDraft::reject(),
            8 => EvaluationDraft::defer(),
            _ => EvaluationDraft::counter(self.draft(&mut rng, &[proposal.origin.clone()])),
        };
        Ok(draft.with_confidence(confidence))
    }

    async fn arbitrate(
        &self,
        arbiter: &Node,
        proposal: &Proposal,
        evaluations: &[Evaluation],
        round: u32,
    ) -> Result<EvaluationDraft, OracleError> {
        let mut rng = self.rng_for(&format!("arbitrate/{}/{}/{round}", arbiter.name(), proposal.id));
        self.maybe_fail(&mut rng)?;
        let accepts = evaluations
            .iter()
            .filter(|e| e.decision == Decision::Accept)
            .count();
        let lean = if accepts * 2 >= evaluations.len() { 0.7 } else { 0.3 };
        Ok(if rng.gen_bool(lean) {
            EvaluationDraft::accept()
        } else {
            EvaluationDraft::reject()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulator_small_run_passes() {
        let config = SimulatorConfig {
            sessions: 20,
            ..Default::default()
        };
        let report = run_simulator(config).await;
        assert!(report.passed(), "{}", report.generate_text());
        assert_eq!(report.stats.sessions_run, 20);
    }

    #[tokio::test]
    async fn test_simulator_is_reproducible() {
        let config = SimulatorConfig {
            seed: 7,
            sessions: 10,
            ..Default::default()
        };
        let a = run_simulator(config.clone()).await;
        let b = run_simulator(config).await;
        assert_eq!(a.stats.commits, b.stats.commits);
        assert_eq!(a.stats.rejections, b.stats.rejections);
        assert_eq!(a.stats.terminations, b.stats.terminations);
    }

    #[tokio::test]
    async fn test_all_failing_oracle_still_terminates() {
        let config = SimulatorConfig {
            sessions: 5,
            failure_rate: 1.0,
            ..Default::default()
        };
        let report = run_simulator(config).await;
        assert!(report.passed());
        assert_eq!(report.stats.commits, 0);
        assert!(report.stats.oracle_failures > 0);
    }

    #[test]
    fn test_generated_graphs_build() {
        let config = SimulatorConfig::default();
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..50 {
            let defs = generate_definitions(&mut rng, &config);
            assert!(DependencyGraph::build(defs, vec![]).is_ok());
        }
    }

    #[test]
    fn test_report_text_marks_failures() {
        let report = SimulatorReport {
            config: SimulatorConfig::default(),
            stats: SimulatorStats::default(),
            violations: vec![Violation {
                session: 3,
                check: InvariantCheck::TraceChainIntact,
                details: "hash mismatch at seq 4".into(),
            }],
        };
        let text = report.generate_text();
        assert!(text.contains("FAIL"));
        assert!(text.contains("session 3"));
    }
}
