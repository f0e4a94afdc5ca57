//! Write side of both stores, as seen by the processor and the visitors.

use std::sync::Arc;

use crate::error::PersistenceError;
use crate::graph::{DependencyEdge, DependencyNode};
use crate::graph_store::GraphStore;
use crate::measure::PackageSet;
use crate::package_store::PackageStore;

/// Every call must be an upsert keyed by stable identity: invoking it again
/// for the same entity never creates a duplicate.
pub trait PersistenceGateway: Send + Sync {
    fn upsert_graph_node(&self, node: &DependencyNode) -> Result<(), PersistenceError>;

    fn upsert_graph_edge(&self, edge: &DependencyEdge) -> Result<(), PersistenceError>;

    fn upsert_package_set(&self, library_id: &str, set: &PackageSet) -> Result<(), PersistenceError>;
}

pub struct StoreGateway {
    graph: Arc<GraphStore>,
    packages: Arc<PackageStore>,
}

impl StoreGateway {
    pub fn new(graph: Arc<GraphStore>, packages: Arc<PackageStore>) -> Self {
        Self { graph, packages }
    }

    pub fn graph(&self) -> &GraphStore {
        &self.graph
    }

    pub fn packages(&self) -> &PackageStore {
        &self.packages
    }
}

impl PersistenceGateway for StoreGateway {
    fn upsert_graph_node(&self, node: &DependencyNode) -> Result<(), PersistenceError> {
        self.graph.upsert_node(node)
    }

    fn upsert_graph_edge(&self, edge: &DependencyEdge) -> Result<(), PersistenceError> {
        self.graph.upsert_edge(edge)
    }

    fn upsert_package_set(&self, library_id: &str, set: &PackageSet) -> Result<(), PersistenceError> {
        self.packages.upsert_package_set(library_id, set)
    }
}
