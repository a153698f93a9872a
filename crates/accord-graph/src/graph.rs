//! Dependency graph and activation ordering
//!
//! Edges point from a dependency to its dependent, so a topological walk
//! visits every node after all of the nodes it depends on.

use crate::error::{CycleError, GraphError};
use crate::node::{Node, NodeDefinition};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

/// An explicit "`node` depends on `depends_on`" edge
///
/// Edges supplement the dependency sets carried by node definitions; both are
/// merged at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyEdge {
    /// The dependent node
    pub node: String,
    /// The node it depends on
    pub depends_on: String,
}

impl DependencyEdge {
    /// Create a new edge
    #[inline]
    #[must_use]
    pub fn new(node: impl Into<String>, depends_on: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            depends_on: depends_on.into(),
        }
    }
}

/// Validated, acyclic participant graph
///
/// Read-only once built. Nodes are kept in declaration order; the activation
/// order is computed once at construction.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: Vec<Node>,
    index: BTreeMap<String, NodeIndex>,
    inner: DiGraph<usize, ()>,
    order: Vec<String>,
}

impl DependencyGraph {
    /// Build a graph from node definitions and explicit edges
    ///
    /// # Errors
    /// - `GraphError::DuplicateNode` if two definitions share a name
    /// - `GraphError::UnknownDependency` if a dependency is not defined
    /// - `GraphError::NodeNotFound` if an explicit edge starts at an unknown node
    /// - `GraphError::Cycle` if the dependencies are not acyclic
    pub fn build(
        definitions: Vec<NodeDefinition>,
        edges: Vec<DependencyEdge>,
    ) -> Result<Self, GraphError> {
        let mut inner = DiGraph::with_capacity(definitions.len(), edges.len());
        let mut index = BTreeMap::new();

        for (i, def) in definitions.iter().enumerate() {
            if index.contains_key(&def.name) {
                return Err(GraphError::DuplicateNode {
                    name: def.name.clone(),
                });
            }
            index.insert(def.name.clone(), inner.add_node(i));
        }

        let mut dependencies: Vec<BTreeSet<String>> =
            definitions.iter().map(|d| d.dependencies.clone()).collect();

        for edge in edges {
            let Some(&slot) = index.get(&edge.node) else {
                return Err(GraphError::NodeNotFound { name: edge.node });
            };
            dependencies[slot.index()].insert(edge.depends_on);
        }

        for (i, deps) in dependencies.iter().enumerate() {
            let dependent = NodeIndex::new(i);
            for dep in deps {
                let Some(&dependency) = index.get(dep) else {
                    return Err(GraphError::UnknownDependency {
                        node: definitions[i].name.clone(),
                        dependency: dep.clone(),
                    });
                };
                inner.update_edge(dependency, dependent, ());
            }
        }

        let nodes: Vec<Node> = definitions
            .into_iter()
            .zip(dependencies)
            .enumerate()
            .map(|(i, (def, deps))| Node::from_definition(def, deps, i))
            .collect();

        if let Err(cycle) = toposort(&inner, None) {
            return Err(cycle_error(&inner, &nodes, cycle.node_id()).into());
        }

        let order = kahn_order(&inner, &nodes);

        tracing::debug!(
            nodes = nodes.len(),
            edges = inner.edge_count(),
            "Built dependency graph"
        );

        Ok(Self {
            nodes,
            index,
            inner,
            order,
        })
    }

    /// Deterministic activation order
    ///
    /// Every node appears after all of its dependencies; among nodes that are
    /// ready at the same time the lexicographically smallest name goes first.
    #[inline]
    #[must_use]
    pub fn activation_order(&self) -> &[String] {
        &self.order
    }

    /// Transitive reverse dependencies of `name` (not including itself)
    ///
    /// # Errors
    /// `GraphError::NodeNotFound` if the node is not in the graph
    pub fn descendants(&self, name: &str) -> Result<BTreeSet<String>, GraphError> {
        let start = self.lookup(name)?;
        let mut dfs = Dfs::new(&self.inner, start);
        let mut out = BTreeSet::new();
        while let Some(ix) = dfs.next(&self.inner) {
            if ix != start {
                out.insert(self.nodes[ix.index()].name().to_string());
            }
        }
        Ok(out)
    }

    /// Direct dependents of `name`
    ///
    /// # Errors
    /// `GraphError::NodeNotFound` if the node is not in the graph
    pub fn dependents(&self, name: &str) -> Result<BTreeSet<String>, GraphError> {
        let ix = self.lookup(name)?;
        Ok(self
            .inner
            .neighbors_directed(ix, Direction::Outgoing)
            .map(|n| self.nodes[n.index()].name().to_string())
            .collect())
    }

    /// Direct dependencies of `name`
    ///
    /// # Errors
    /// `GraphError::NodeNotFound` if the node is not in the graph
    pub fn dependencies(&self, name: &str) -> Result<&BTreeSet<String>, GraphError> {
        self.node(name)
            .map(Node::dependencies)
            .ok_or_else(|| GraphError::NodeNotFound {
                name: name.to_string(),
            })
    }

    /// Nodes without dependencies, in activation order
    pub fn roots(&self) -> impl Iterator<Item = &Node> {
        self.order
            .iter()
            .filter_map(|name| self.node(name))
            .filter(|node| node.dependencies().is_empty())
    }

    /// Arbiter-flagged nodes in declaration order
    pub fn arbiters(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|node| node.is_arbiter())
    }

    /// Look up a node by name
    #[inline]
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.index.get(name).map(|ix| &self.nodes[ix.index()])
    }

    /// Whether a node with this name exists
    #[inline]
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// All nodes in declaration order
    #[inline]
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Number of nodes
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of dependency edges
    #[inline]
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.inner.edge_count()
    }

    fn lookup(&self, name: &str) -> Result<NodeIndex, GraphError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::NodeNotFound {
                name: name.to_string(),
            })
    }
}

/// Kahn's algorithm with a min-heap on node name for tie-breaking
fn kahn_order(graph: &DiGraph<usize, ()>, nodes: &[Node]) -> Vec<String> {
    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|ix| graph.neighbors_directed(ix, Direction::Incoming).count())
        .collect();

    let mut ready: BinaryHeap<Reverse<(&str, usize)>> = graph
        .node_indices()
        .filter(|ix| in_degree[ix.index()] == 0)
        .map(|ix| Reverse((nodes[ix.index()].name(), ix.index())))
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(Reverse((name, i))) = ready.pop() {
        order.push(name.to_string());
        for next in graph.neighbors_directed(NodeIndex::new(i), Direction::Outgoing) {
            let slot = &mut in_degree[next.index()];
            *slot -= 1;
            if *slot == 0 {
                ready.push(Reverse((nodes[next.index()].name(), next.index())));
            }
        }
    }
    order
}

fn cycle_error(graph: &DiGraph<usize, ()>, nodes: &[Node], member: NodeIndex) -> CycleError {
    let mut cycle: Vec<String> = tarjan_scc(graph)
        .into_iter()
        .find(|component| component.contains(&member))
        .unwrap_or_else(|| vec![member])
        .into_iter()
        .map(|ix| nodes[ix.index()].name().to_string())
        .collect();
    cycle.sort();

    CycleError {
        member: nodes[member.index()].name().to_string(),
        cycle,
    }
}

/// Build a graph from scanner output
///
/// # Errors
/// See [`DependencyGraph::build`]
pub fn build_graph(
    definitions: Vec<NodeDefinition>,
    edges: Vec<DependencyEdge>,
) -> Result<DependencyGraph, GraphError> {
    DependencyGraph::build(definitions, edges)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(name: &str, deps: &[&str]) -> NodeDefinition {
        deps.iter()
            .fold(NodeDefinition::regular(name), |d, dep| d.depends_on(*dep))
    }

    #[test]
    fn chain_orders_dependencies_first() {
        let graph = DependencyGraph::build(
            vec![def("z", &["y"]), def("y", &["x"]), def("x", &[])],
            Vec::new(),
        )
        .unwrap();

        assert_eq!(graph.activation_order(), ["x", "y", "z"]);
        assert_eq!(graph.edge_count(), 2);
    }

    #[test]
    fn ties_break_by_name() {
        let graph = DependencyGraph::build(
            vec![def("c", &[]), def("a", &[]), def("b", &["c"])],
            Vec::new(),
        )
        .unwrap();

        assert_eq!(graph.activation_order(), ["a", "c", "b"]);
    }

    #[test]
    fn explicit_edges_merge_into_dependencies() {
        let graph = DependencyGraph::build(
            vec![def("app", &[]), def("lib", &[])],
            vec![DependencyEdge::new("app", "lib")],
        )
        .unwrap();

        assert_eq!(graph.activation_order(), ["lib", "app"]);
        assert!(graph.dependencies("app").unwrap().contains("lib"));
    }

    #[test]
    fn cycle_is_rejected_with_member() {
        let err = DependencyGraph::build(
            vec![def("a", &["c"]), def("b", &["a"]), def("c", &["b"]), def("d", &[])],
            Vec::new(),
        )
        .unwrap_err();

        let cycle = err.as_cycle().expect("cycle error");
        assert!(["a", "b", "c"].contains(&cycle.member.as_str()));
        assert_eq!(cycle.cycle, ["a", "b", "c"]);
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let err = DependencyGraph::build(vec![def("solo", &["solo"])], Vec::new()).unwrap_err();
        assert_eq!(err.as_cycle().unwrap().member, "solo");
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let err = DependencyGraph::build(vec![def("a", &["ghost"])], Vec::new()).unwrap_err();
        assert_eq!(
            err,
            GraphError::UnknownDependency {
                node: "a".to_string(),
                dependency: "ghost".to_string()
            }
        );
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = DependencyGraph::build(vec![def("a", &[]), def("a", &[])], Vec::new());
        assert!(matches!(err, Err(GraphError::DuplicateNode { .. })));
    }

    #[test]
    fn descendants_are_transitive() {
        let graph = DependencyGraph::build(
            vec![
                def("base", &[]),
                def("mid", &["base"]),
                def("top", &["mid"]),
                def("side", &[]),
            ],
            Vec::new(),
        )
        .unwrap();

        let below: Vec<_> = graph.descendants("base").unwrap().into_iter().collect();
        assert_eq!(below, ["mid", "top"]);
        assert!(graph.descendants("side").unwrap().is_empty());
        assert_eq!(graph.dependents("base").unwrap().len(), 1);
        assert!(graph.descendants("nope").is_err());
    }

    #[test]
    fn arbiters_follow_declaration_order() {
        let graph = DependencyGraph::build(
            vec![
                NodeDefinition::arbiter("zeta"),
                NodeDefinition::regular("alpha"),
                NodeDefinition::arbiter("beta"),
            ],
            Vec::new(),
        )
        .unwrap();

        let names: Vec<_> = graph.arbiters().map(Node::name).collect();
        assert_eq!(names, ["zeta", "beta"]);
        let roots: Vec<_> = graph.roots().map(Node::name).collect();
        assert_eq!(roots, ["alpha", "beta", "zeta"]);
    }

    #[test]
    fn empty_graph_is_valid() {
        let graph = DependencyGraph::build(Vec::new(), Vec::new()).unwrap();
        assert!(graph.is_empty());
        assert!(graph.activation_order().is_empty());
    }
}
