//! Accord Core - negotiation engine for per-unit code agents
//!
//! Every code unit of a project is represented by a node in a dependency
//! graph. Nodes never edit code directly; they take part in a bounded,
//! round-based negotiation:
//! - Nodes are activated in a deterministic dependency order
//! - Proposals are distributed and evaluated by the other nodes
//! - Conflicted proposals are settled by an arbiter node
//! - Accepted proposals become commits under hard safety caps
//! - Every step lands in a hash-chained audit trace
//!
//! The reasoning intelligence is external, behind [`ReasoningOracle`].
//!
//! # Example
//!
//! ```rust,ignore
//! use accord_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example(oracle: Arc<dyn ReasoningOracle>) -> Result<(), SessionError> {
//! let graph = DependencyGraph::build(
//!     vec![
//!         NodeDefinition::regular("parser"),
//!         NodeDefinition::regular("codegen").depends_on("parser"),
//!         NodeDefinition::arbiter("architect"),
//!     ],
//!     vec![],
//! )?;
//!
//! let summary = run_session(graph, SafetyPolicy::new(), oracle).await?;
//! println!("{}", summary.generate_text());
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

// Core modules
pub mod applier;
pub mod arbitration;
pub mod engine;
pub mod error;
pub mod oracle;
pub mod policy;
pub mod session;
pub mod simulator;
pub mod state_machine;
pub mod summary;
pub mod trace;
pub mod types;

// Re-exports for convenience
pub use accord_graph::{
    build_graph, ArtifactRef, CycleError, DependencyEdge, DependencyGraph, GraphError, Node,
    NodeDefinition, NodeRole,
};
pub use applier::{CommitApplier, DryRunApplier};
pub use arbitration::{select_arbiter, settle, VoteOutcome, VoteTally};
pub use engine::{negotiate, run_session, EngineConfig, NegotiationEngine};
pub use error::{
    ApplyError, ConfigError, NegotiationFault, OracleError, OracleOperation, SessionError,
};
pub use oracle::{OracleContext, ReasoningOracle};
pub use policy::SafetyPolicy;
pub use session::{AnalysisMemory, ProposalOutcome, SessionSnapshot, SnapshotHandle};
pub use simulator::{run_simulator, SimulatorConfig, SimulatorReport};
pub use state_machine::{IllegalTransition, SessionPhase};
pub use summary::{
    DeferralRecord, FaultRecord, NegotiationSummary, RejectionReason, RejectionRecord,
    RejectionStage, TerminationReason,
};
pub use trace::{verify_chain, IntegrityViolation, NegotiationTrace, TraceEntry, TraceEvent};
pub use types::{
    ApplyStatus, ChangeSet, CommitId, CommitRecord, ConsensusType, Decision, Evaluation,
    EvaluationDraft, Priority, Proposal, ProposalDraft, ProposalId, ResourceEdit, RiskAssessment,
    RiskLevel, SessionId,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for running a negotiation
    pub use crate::{
        run_session, ChangeSet, CommitApplier, DependencyGraph, EvaluationDraft,
        NegotiationEngine, NegotiationSummary, NodeDefinition, OracleContext, OracleError,
        ProposalDraft, ReasoningOracle, SafetyPolicy, SessionError,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
