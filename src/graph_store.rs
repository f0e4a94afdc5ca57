//! Dependency topology persisted in LMDB.
//!
//! Nodes are keyed by coordinate, edges by `parent -> child`. Both writes are
//! upserts, so revisiting a node through a diamond leaves a single entry.

use anyhow::{Context, Result};
use heed::types::Str;
use heed::{Database, Env, EnvFlags, EnvOpenOptions, RwTxn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::coordinate::ArtifactCoordinate;
use crate::error::PersistenceError;
use crate::graph::{DependencyEdge, DependencyNode, ResolutionStatus};

pub const NODES_DB: &str = "nodes";
pub const EDGES_DB: &str = "edges";

const DEFAULT_MAP_SIZE: usize = 1024 * 1024 * 1024;
const EDGE_SEPARATOR: &str = " -> ";

type StrDb = Database<Str, Str>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRow {
    pub status: ResolutionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeRow {
    pub scope: String,
    pub optional: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GraphStats {
    pub nodes: u64,
    pub edges: u64,
}

#[derive(Debug)]
pub struct GraphStore {
    env: Env,
    db_path: PathBuf,
    nodes: StrDb,
    edges: StrDb,
}

impl GraphStore {
    pub fn open(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create graph store directory: {}", parent.display())
            })?;
        }

        let mut options = EnvOpenOptions::new();
        options.map_size(DEFAULT_MAP_SIZE);
        options.max_dbs(4);
        // SAFETY: Default LMDB locking is kept; NO_SUB_DIR stores the env as a single file.
        let env = unsafe {
            options.flags(EnvFlags::NO_SUB_DIR);
            options
                .open(&db_path)
                .with_context(|| format!("Failed to open graph store: {}", db_path.display()))?
        };

        let mut wtxn = env.write_txn()?;
        let nodes = env.create_database::<Str, Str>(&mut wtxn, Some(NODES_DB))?;
        let edges = env.create_database::<Str, Str>(&mut wtxn, Some(EDGES_DB))?;
        wtxn.commit()?;

        Ok(Self {
            env,
            db_path,
            nodes,
            edges,
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn upsert_node(&self, node: &DependencyNode) -> Result<(), PersistenceError> {
        let mut wtxn = self.env.write_txn()?;
        self.merge_node(&mut wtxn, node)?;
        wtxn.commit()?;
        Ok(())
    }

    /// Writes the edge and both endpoints in one transaction.
    pub fn upsert_edge(&self, edge: &DependencyEdge) -> Result<(), PersistenceError> {
        let mut wtxn = self.env.write_txn()?;
        self.merge_node(&mut wtxn, &edge.parent)?;
        self.merge_node(&mut wtxn, &edge.child)?;

        let key = edge_key(&edge.parent.coordinate, &edge.child.coordinate);
        let row = serde_json::to_string(&EdgeRow {
            scope: edge.scope.clone(),
            optional: edge.optional,
        })?;
        self.edges.put(&mut wtxn, key.as_str(), row.as_str())?;
        wtxn.commit()?;
        Ok(())
    }

    fn merge_node(&self, wtxn: &mut RwTxn<'_>, node: &DependencyNode) -> Result<(), PersistenceError> {
        let key = node.coordinate.to_string();
        let status = match self.nodes.get(wtxn, key.as_str())? {
            Some(raw) => serde_json::from_str::<NodeRow>(raw)?.status.merge(node.status),
            None => node.status,
        };
        let row = serde_json::to_string(&NodeRow { status })?;
        self.nodes.put(wtxn, key.as_str(), row.as_str())?;
        Ok(())
    }

    pub fn node(&self, coordinate: &ArtifactCoordinate) -> Result<Option<NodeRow>> {
        let rtxn = self.env.read_txn()?;
        let key = coordinate.to_string();
        let Some(raw) = self.nodes.get(&rtxn, key.as_str())? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(raw)?))
    }

    pub fn edge(
        &self,
        parent: &ArtifactCoordinate,
        child: &ArtifactCoordinate,
    ) -> Result<Option<EdgeRow>> {
        let rtxn = self.env.read_txn()?;
        let key = edge_key(parent, child);
        let Some(raw) = self.edges.get(&rtxn, key.as_str())? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(raw)?))
    }

    /// Direct dependencies of `parent`, in key order.
    pub fn dependencies_of(&self, parent: &ArtifactCoordinate) -> Result<Vec<ArtifactCoordinate>> {
        let rtxn = self.env.read_txn()?;
        let prefix = format!("{parent}{EDGE_SEPARATOR}");
        let mut children = Vec::new();
        for item in self.edges.prefix_iter(&rtxn, prefix.as_str())? {
            let (key, _) = item?;
            let child = key.trim_start_matches(prefix.as_str());
            children.push(
                child
                    .parse()
                    .with_context(|| format!("Corrupt edge key in graph store: {key}"))?,
            );
        }
        Ok(children)
    }

    pub fn stats(&self) -> Result<GraphStats> {
        let rtxn = self.env.read_txn()?;
        Ok(GraphStats {
            nodes: self.nodes.len(&rtxn)?,
            edges: self.edges.len(&rtxn)?,
        })
    }
}

fn edge_key(parent: &ArtifactCoordinate, child: &ArtifactCoordinate) -> String {
    format!("{parent}{EDGE_SEPARATOR}{child}")
}
