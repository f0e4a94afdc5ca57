use serde::{Deserialize, Serialize};

use crate::coordinate::ArtifactCoordinate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionStatus {
    Unresolved,
    Failed,
    Resolved,
}

impl ResolutionStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Unresolved => 0,
            Self::Failed => 1,
            Self::Resolved => 2,
        }
    }

    /// Upsert rule for stores: a status never downgrades.
    pub fn merge(self, other: Self) -> Self {
        if other.rank() > self.rank() { other } else { self }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyNode {
    pub coordinate: ArtifactCoordinate,
    pub status: ResolutionStatus,
}

impl DependencyNode {
    pub fn new(coordinate: ArtifactCoordinate, status: ResolutionStatus) -> Self {
        Self { coordinate, status }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub parent: DependencyNode,
    pub child: DependencyNode,
    pub scope: String,
    pub optional: bool,
    /// Distance of `child` from the traversal root.
    pub depth: usize,
}

/// One element discovered by a traversal, in discovery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphEvent {
    Node(DependencyNode),
    Edge(DependencyEdge),
}
