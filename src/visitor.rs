//! Pluggable observers of a dependency traversal.
//!
//! A [`VisitorComposite`] is assembled once at startup and shared read-only by
//! every pipeline. Dispatch isolates visitors from each other: an error or a
//! panic in one is logged and counted, and the remaining visitors still see the
//! event.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::io::Write;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, warn};

use crate::coordinate::ArtifactCoordinate;
use crate::gateway::PersistenceGateway;
use crate::graph::{DependencyEdge, DependencyNode, GraphEvent, ResolutionStatus};

/// Implementations must tolerate revisits: a node reached through several
/// edges shows up in several `on_edge` calls.
pub trait GraphVisitor: Send + Sync {
    fn name(&self) -> &str;

    fn on_node(&self, node: &DependencyNode) -> Result<()>;

    fn on_edge(&self, edge: &DependencyEdge) -> Result<()>;

    fn begin_traversal(&self, _root: &ArtifactCoordinate) -> Result<()> {
        Ok(())
    }

    fn end_traversal(&self, _root: &ArtifactCoordinate) -> Result<()> {
        Ok(())
    }
}

struct Registered {
    visitor: Box<dyn GraphVisitor>,
    failures: AtomicU64,
}

#[derive(Default)]
pub struct VisitorComposite {
    visitors: Vec<Registered>,
}

impl VisitorComposite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, visitor: impl GraphVisitor + 'static) -> Self {
        self.visitors.push(Registered {
            visitor: Box::new(visitor),
            failures: AtomicU64::new(0),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.visitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visitors.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.visitors.iter().map(|r| r.visitor.name()).collect()
    }

    /// Errors and panics raised by the named visitor so far.
    pub fn failures(&self, name: &str) -> Option<u64> {
        self.visitors
            .iter()
            .find(|r| r.visitor.name() == name)
            .map(|r| r.failures.load(Ordering::Relaxed))
    }

    pub fn dispatch(&self, event: &GraphEvent) {
        let subject = match event {
            GraphEvent::Node(node) => &node.coordinate,
            GraphEvent::Edge(edge) => &edge.child.coordinate,
        };
        self.each(subject, |v| match event {
            GraphEvent::Node(node) => v.on_node(node),
            GraphEvent::Edge(edge) => v.on_edge(edge),
        });
    }

    pub fn begin_traversal(&self, root: &ArtifactCoordinate) {
        self.each(root, |v| v.begin_traversal(root));
    }

    pub fn end_traversal(&self, root: &ArtifactCoordinate) {
        self.each(root, |v| v.end_traversal(root));
    }

    fn each(&self, subject: &ArtifactCoordinate, call: impl Fn(&dyn GraphVisitor) -> Result<()>) {
        for registered in &self.visitors {
            let visitor = registered.visitor.as_ref();
            match catch_unwind(AssertUnwindSafe(|| call(visitor))) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => {
                    warn!(visitor = visitor.name(), coordinate = %subject, error = ?e, "visitor failed");
                }
                Err(_) => {
                    error!(visitor = visitor.name(), coordinate = %subject, "visitor panicked");
                }
            }
            registered.failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Prints each traversal as an indented tree.
pub struct PrettyPrinter {
    out: Mutex<Box<dyn Write + Send>>,
}

impl PrettyPrinter {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }
}

impl GraphVisitor for PrettyPrinter {
    fn name(&self) -> &str {
        "pretty-printer"
    }

    fn on_node(&self, _node: &DependencyNode) -> Result<()> {
        Ok(())
    }

    fn on_edge(&self, edge: &DependencyEdge) -> Result<()> {
        let mut line = format!(
            "{}{} [{}]",
            "  ".repeat(edge.depth),
            edge.child.coordinate,
            edge.scope
        );
        if edge.optional {
            line.push_str(" (optional)");
        }
        if edge.child.status != ResolutionStatus::Resolved {
            line.push_str(&format!(" {:?}", edge.child.status).to_uppercase());
        }
        writeln!(self.out.lock(), "{line}")?;
        Ok(())
    }

    fn begin_traversal(&self, root: &ArtifactCoordinate) -> Result<()> {
        writeln!(self.out.lock(), "{root}")?;
        Ok(())
    }

    fn end_traversal(&self, _root: &ArtifactCoordinate) -> Result<()> {
        self.out.lock().flush()?;
        Ok(())
    }
}

/// Upserts every discovered node and edge into the graph store.
pub struct GraphStoreVisitor {
    gateway: Arc<dyn PersistenceGateway>,
}

impl GraphStoreVisitor {
    pub fn new(gateway: Arc<dyn PersistenceGateway>) -> Self {
        Self { gateway }
    }
}

impl GraphVisitor for GraphStoreVisitor {
    fn name(&self) -> &str {
        "graph-store"
    }

    fn on_node(&self, node: &DependencyNode) -> Result<()> {
        self.gateway
            .upsert_graph_node(node)
            .with_context(|| format!("upsert node {}", node.coordinate))
    }

    fn on_edge(&self, edge: &DependencyEdge) -> Result<()> {
        self.gateway
            .upsert_graph_edge(edge)
            .with_context(|| format!("upsert edge {} -> {}", edge.parent.coordinate, edge.child.coordinate))
    }
}
