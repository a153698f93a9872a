//! Error types for graph construction

use std::fmt;

/// Graph construction and lookup errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// The declared dependencies form a cycle
    #[error(transparent)]
    Cycle(#[from] CycleError),

    /// Two definitions share a name
    #[error("duplicate node: {name}")]
    DuplicateNode { name: String },

    /// A dependency or edge names a node that was never defined
    #[error("node {node} depends on unknown node {dependency}")]
    UnknownDependency { node: String, dependency: String },

    /// Lookup of a node that is not part of the graph
    #[error("node not found: {name}")]
    NodeNotFound { name: String },
}

impl GraphError {
    /// The cycle details, if this is a cycle error
    #[inline]
    #[must_use]
    pub fn as_cycle(&self) -> Option<&CycleError> {
        match self {
            Self::Cycle(cycle) => Some(cycle),
            _ => None,
        }
    }
}

/// The dependency graph is not acyclic
///
/// `member` is one node on a cycle; `cycle` lists every node of the strongly
/// connected component containing it, sorted by name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub struct CycleError {
    /// A node that participates in the cycle
    pub member: String,
    /// All nodes of the offending component
    pub cycle: Vec<String>,
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dependency cycle through {} ({})",
            self.member,
            self.cycle.join(" -> ")
        )
    }
}
