//! Accord Graph - participant dependency graph
//!
//! Builds the directed "depends on" graph over negotiation participants and
//! derives the activation order the negotiation engine seeds proposals in.
//!
//! - Construction fails with [`CycleError`] when the graph is not acyclic
//! - [`DependencyGraph::activation_order`] is a topological order whose ties
//!   are broken by node name, so identical input always yields identical order
//! - [`DependencyGraph::descendants`] exposes transitive reverse dependencies
//!   for impact analysis
//!
//! # Example
//!
//! ```rust
//! use accord_graph::{DependencyGraph, NodeDefinition};
//!
//! let graph = DependencyGraph::build(
//!     vec![
//!         NodeDefinition::regular("z").depends_on("y"),
//!         NodeDefinition::regular("y").depends_on("x"),
//!         NodeDefinition::regular("x"),
//!     ],
//!     Vec::new(),
//! )
//! .unwrap();
//!
//! assert_eq!(graph.activation_order(), ["x", "y", "z"]);
//! ```

pub mod error;
pub mod graph;
pub mod node;

pub use error::{CycleError, GraphError};
pub use graph::{build_graph, DependencyEdge, DependencyGraph};
pub use node::{ArtifactRef, Node, NodeDefinition, NodeRole};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
