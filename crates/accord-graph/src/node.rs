//! Participant nodes
//!
//! A node is one code unit taking part in a negotiation. Its identity (name,
//! dependencies, role, artifact reference) is fixed when the graph is built.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Capability flag of a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Ordinary proposer and evaluator
    #[default]
    Regular,
    /// Additionally permitted to issue binding conflict verdicts
    Arbiter,
}

impl NodeRole {
    /// Whether this role may arbitrate
    #[inline]
    #[must_use]
    pub fn is_arbiter(self) -> bool {
        matches!(self, Self::Arbiter)
    }
}

/// Opaque handle to the code artifact a node stands for
///
/// The artifact itself is owned by the scanning collaborator; the graph only
/// carries the reference through to oracles and appliers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(pub String);

impl ArtifactRef {
    /// Create a new artifact reference
    #[inline]
    #[must_use]
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    /// Reference as string slice
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Externally supplied node definition, as produced by source scanning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Unique node name
    pub name: String,
    /// Names of the nodes this one depends on
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Participant role
    #[serde(default)]
    pub role: NodeRole,
    /// Associated code artifact
    #[serde(default)]
    pub artifact: ArtifactRef,
}

impl NodeDefinition {
    /// Create a definition with the given role and no dependencies
    #[must_use]
    pub fn new(name: impl Into<String>, role: NodeRole) -> Self {
        let name = name.into();
        Self {
            artifact: ArtifactRef::new(name.clone()),
            name,
            dependencies: BTreeSet::new(),
            role,
        }
    }

    /// Create a regular participant
    #[inline]
    #[must_use]
    pub fn regular(name: impl Into<String>) -> Self {
        Self::new(name, NodeRole::Regular)
    }

    /// Create an arbiter participant
    #[inline]
    #[must_use]
    pub fn arbiter(name: impl Into<String>) -> Self {
        Self::new(name, NodeRole::Arbiter)
    }

    /// Add a dependency
    #[inline]
    #[must_use]
    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.insert(dependency.into());
        self
    }

    /// With artifact reference
    #[inline]
    #[must_use]
    pub fn with_artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifact = ArtifactRef::new(artifact);
        self
    }
}

/// A participant as stored in a built graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    name: String,
    dependencies: BTreeSet<String>,
    role: NodeRole,
    artifact: ArtifactRef,
    declaration_index: usize,
}

impl Node {
    pub(crate) fn from_definition(
        definition: NodeDefinition,
        dependencies: BTreeSet<String>,
        declaration_index: usize,
    ) -> Self {
        Self {
            name: definition.name,
            dependencies,
            role: definition.role,
            artifact: definition.artifact,
            declaration_index,
        }
    }

    /// Node name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Direct dependencies, including those declared through explicit edges
    #[inline]
    #[must_use]
    pub fn dependencies(&self) -> &BTreeSet<String> {
        &self.dependencies
    }

    /// Participant role
    #[inline]
    #[must_use]
    pub fn role(&self) -> NodeRole {
        self.role
    }

    /// Whether this node may arbitrate
    #[inline]
    #[must_use]
    pub fn is_arbiter(&self) -> bool {
        self.role.is_arbiter()
    }

    /// Associated code artifact
    #[inline]
    #[must_use]
    pub fn artifact(&self) -> &ArtifactRef {
        &self.artifact
    }

    /// Position in the original definition list
    #[inline]
    #[must_use]
    pub fn declaration_index(&self) -> usize {
        self.declaration_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_builder() {
        let def = NodeDefinition::arbiter("core")
            .depends_on("util")
            .depends_on("util")
            .with_artifact("src/core.rs");

        assert_eq!(def.role, NodeRole::Arbiter);
        assert_eq!(def.dependencies.len(), 1);
        assert_eq!(def.artifact.as_str(), "src/core.rs");
    }

    #[test]
    fn definition_defaults_from_json() {
        let def: NodeDefinition = serde_json::from_str(r#"{"name":"x"}"#).unwrap();
        assert_eq!(def.role, NodeRole::Regular);
        assert!(def.dependencies.is_empty());
        assert!(!def.role.is_arbiter());
    }
}
