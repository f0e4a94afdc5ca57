//! Resolution engine seam and a Maven-repository implementation.
//!
//! The pipeline only relies on [`ResolutionEngine`]: a lazy, finite stream of
//! graph events for a root, and a way to fetch one binary payload. The
//! [`MavenRepository`] engine reads the standard repository layout from a
//! local directory and/or a remote HTTP repository. Topology comes from Gradle
//! module metadata (`<artifact>-<version>.module`), a JSON document published
//! next to the jar.

use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempPath;
use tracing::debug;

use crate::coordinate::ArtifactCoordinate;
use crate::error::ResolveError;
use crate::graph::{DependencyEdge, DependencyNode, GraphEvent, ResolutionStatus};

const MAX_METADATA_BYTES: u64 = 8 * 1024 * 1024;

/// Finite and not restartable: after an `Err` the traversal must start over
/// from the root.
pub type GraphStream = Box<dyn Iterator<Item = Result<GraphEvent, ResolveError>> + Send>;

pub trait ResolutionEngine: Send + Sync {
    fn collect_graph(&self, root: &ArtifactCoordinate) -> Result<GraphStream, ResolveError>;

    /// `Ok(None)` when the repository has no binary for `coordinate`.
    fn resolve_payload(&self, coordinate: &ArtifactCoordinate)
    -> Result<Option<Payload>, ResolveError>;
}

/// A fetched binary owned by one pipeline. The file is deleted when the
/// payload is dropped, on every exit path.
#[derive(Debug)]
pub struct Payload {
    path: TempPath,
}

impl Payload {
    pub fn new(path: TempPath) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes the file now, reporting failures instead of swallowing them.
    pub fn release(self) -> io::Result<()> {
        self.path.close()
    }
}

pub enum RepositorySource {
    Local(PathBuf),
    Remote { base_url: String, agent: ureq::Agent },
}

impl RepositorySource {
    pub fn remote(base_url: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .user_agent("maven-miner")
            .build();
        Self::Remote {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent,
        }
    }

    fn open(&self, relative: &str) -> Result<Option<Box<dyn Read + Send>>, ResolveError> {
        match self {
            Self::Local(root) => match File::open(root.join(relative)) {
                Ok(f) => Ok(Some(Box::new(f))),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(ResolveError::Io(e)),
            },
            Self::Remote { base_url, agent } => {
                let url = format!("{base_url}/{relative}");
                match agent.get(&url).call() {
                    Ok(response) => Ok(Some(response.into_reader())),
                    Err(ureq::Error::Status(404 | 410, _)) => Ok(None),
                    Err(ureq::Error::Status(code, _)) => {
                        Err(ResolveError::Network(format!("{url} answered HTTP {code}")))
                    }
                    Err(ureq::Error::Transport(t)) => {
                        Err(ResolveError::Network(format!("{url}: {t}")))
                    }
                }
            }
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Local(root) => root.display().to_string(),
            Self::Remote { base_url, .. } => base_url.clone(),
        }
    }
}

#[derive(Clone)]
pub struct MavenRepository {
    sources: Arc<Vec<RepositorySource>>,
}

impl MavenRepository {
    /// Sources are tried in order; the first one holding a file wins.
    pub fn new(sources: Vec<RepositorySource>) -> Self {
        Self {
            sources: Arc::new(sources),
        }
    }

    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self::new(vec![RepositorySource::Local(root.into())])
    }

    pub fn sources(&self) -> Vec<String> {
        self.sources.iter().map(RepositorySource::describe).collect()
    }
}

impl ResolutionEngine for MavenRepository {
    fn collect_graph(&self, root: &ArtifactCoordinate) -> Result<GraphStream, ResolveError> {
        let metadata = load_metadata(&self.sources, root)?;
        Ok(Box::new(Traversal::start(
            Arc::clone(&self.sources),
            root.clone(),
            metadata,
        )))
    }

    fn resolve_payload(
        &self,
        coordinate: &ArtifactCoordinate,
    ) -> Result<Option<Payload>, ResolveError> {
        let relative = coordinate.jar_path();
        for source in self.sources.iter() {
            let Some(mut reader) = source.open(&relative)? else {
                continue;
            };
            let mut tmp = tempfile::Builder::new()
                .prefix("maven-miner-")
                .suffix(".jar")
                .tempfile()
                .map_err(classify_io)?;
            io::copy(&mut reader, &mut tmp).map_err(classify_io)?;
            tmp.flush().map_err(classify_io)?;
            debug!(coordinate = %coordinate, source = %source.describe(), "payload fetched");
            return Ok(Some(Payload::new(tmp.into_temp_path())));
        }
        Ok(None)
    }
}

fn classify_io(e: io::Error) -> ResolveError {
    match e.kind() {
        io::ErrorKind::StorageFull | io::ErrorKind::OutOfMemory => {
            ResolveError::ResourceExhausted(e.to_string())
        }
        _ => ResolveError::Io(e),
    }
}

#[derive(Debug, Deserialize)]
struct ModuleMetadata {
    #[serde(default)]
    variants: Vec<Variant>,
}

#[derive(Debug, Deserialize)]
struct Variant {
    #[serde(default)]
    attributes: HashMap<String, serde_json::Value>,
    #[serde(default)]
    dependencies: Vec<ModuleDependency>,
}

#[derive(Debug, Deserialize)]
struct ModuleDependency {
    group: String,
    module: String,
    #[serde(default)]
    version: Option<VersionConstraint>,
}

#[derive(Debug, Deserialize)]
struct VersionConstraint {
    strictly: Option<String>,
    requires: Option<String>,
    prefers: Option<String>,
}

#[derive(Debug, Clone)]
struct Declared {
    coordinate: ArtifactCoordinate,
    scope: &'static str,
}

impl ModuleMetadata {
    /// Direct dependencies, `compile` (java-api) before `runtime` (java-runtime),
    /// each coordinate once.
    fn dependencies(&self) -> Vec<Declared> {
        let mut declared: Vec<Declared> = Vec::new();
        for wanted in ["java-api", "java-runtime"] {
            let scope = if wanted == "java-api" { "compile" } else { "runtime" };
            let variants = self.variants.iter().filter(|v| {
                v.attributes.get("org.gradle.usage").and_then(|u| u.as_str()) == Some(wanted)
            });
            for dep in variants.flat_map(|v| v.dependencies.iter()) {
                let Some(version) = dep.version.as_ref().and_then(|c| {
                    c.strictly.as_ref().or(c.requires.as_ref()).or(c.prefers.as_ref())
                }) else {
                    debug!(group = %dep.group, module = %dep.module, "dependency without version skipped");
                    continue;
                };
                let coordinate = ArtifactCoordinate::new(&dep.group, &dep.module, version);
                if !declared.iter().any(|d| d.coordinate == coordinate) {
                    declared.push(Declared { coordinate, scope });
                }
            }
        }
        declared
    }
}

fn load_metadata(
    sources: &[RepositorySource],
    coordinate: &ArtifactCoordinate,
) -> Result<Option<ModuleMetadata>, ResolveError> {
    let relative = coordinate.module_metadata_path();
    for source in sources {
        let Some(reader) = source.open(&relative)? else {
            continue;
        };
        let mut raw = Vec::new();
        reader
            .take(MAX_METADATA_BYTES)
            .read_to_end(&mut raw)
            .map_err(classify_io)?;
        let metadata = serde_json::from_slice(&raw)
            .map_err(|e| ResolveError::MalformedArtifact(format!("{relative}: {e}")))?;
        return Ok(Some(metadata));
    }
    Ok(None)
}

/// Breadth-first walk that yields each node once, followed by the edge that
/// discovered it. Edges to already-seen nodes are still yielded.
struct Traversal {
    sources: Arc<Vec<RepositorySource>>,
    ready: VecDeque<GraphEvent>,
    frontier: VecDeque<(DependencyNode, Vec<Declared>, usize)>,
    seen: HashMap<ArtifactCoordinate, ResolutionStatus>,
    broken: bool,
}

impl Traversal {
    fn start(
        sources: Arc<Vec<RepositorySource>>,
        root: ArtifactCoordinate,
        metadata: Option<ModuleMetadata>,
    ) -> Self {
        let status = if metadata.is_some() {
            ResolutionStatus::Resolved
        } else {
            ResolutionStatus::Unresolved
        };
        let node = DependencyNode::new(root.clone(), status);
        let deps = metadata.map(|m| m.dependencies()).unwrap_or_default();

        let mut seen = HashMap::new();
        seen.insert(root, status);
        Self {
            sources,
            ready: VecDeque::from([GraphEvent::Node(node.clone())]),
            frontier: VecDeque::from([(node, deps, 0)]),
            seen,
            broken: false,
        }
    }

    fn expand(&mut self) -> Result<(), ResolveError> {
        let Some((parent, deps, depth)) = self.frontier.pop_front() else {
            return Ok(());
        };
        for dep in deps {
            let child = match self.seen.get(&dep.coordinate) {
                Some(status) => DependencyNode::new(dep.coordinate.clone(), *status),
                None => {
                    let (status, next) = match load_metadata(&self.sources, &dep.coordinate) {
                        Ok(Some(m)) => (ResolutionStatus::Resolved, m.dependencies()),
                        Ok(None) => (ResolutionStatus::Unresolved, Vec::new()),
                        Err(ResolveError::MalformedArtifact(reason)) => {
                            debug!(coordinate = %dep.coordinate, reason = %reason, "unreadable module metadata");
                            (ResolutionStatus::Failed, Vec::new())
                        }
                        Err(e) => return Err(e),
                    };
                    let node = DependencyNode::new(dep.coordinate.clone(), status);
                    self.seen.insert(dep.coordinate.clone(), status);
                    self.ready.push_back(GraphEvent::Node(node.clone()));
                    if !next.is_empty() {
                        self.frontier.push_back((node.clone(), next, depth + 1));
                    }
                    node
                }
            };
            self.ready.push_back(GraphEvent::Edge(DependencyEdge {
                parent: parent.clone(),
                child,
                scope: dep.scope.to_string(),
                optional: false,
                depth: depth + 1,
            }));
        }
        Ok(())
    }
}

impl Iterator for Traversal {
    type Item = Result<GraphEvent, ResolveError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(event) = self.ready.pop_front() {
                return Some(Ok(event));
            }
            if self.broken || self.frontier.is_empty() {
                return None;
            }
            if let Err(e) = self.expand() {
                self.broken = true;
                self.ready.clear();
                return Some(Err(e));
            }
        }
    }
}
