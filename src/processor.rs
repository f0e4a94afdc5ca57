//! Per-artifact pipeline: RECEIVED → COLLECTING → RESOLVING → MEASURING →
//! PERSISTED, ending in DONE or FAILED.
//!
//! Each call to [`ArtifactProcessor::run`] executes the stages sequentially on
//! a dedicated thread bounded by the configured timeout; the fetched payload is
//! deleted on every path. [`ArtifactProcessor::record`] books an outcome into
//! the run counters, and [`ArtifactProcessor::process`] does both.
//!
//! The timeout and the final store write race through one phase flag: the
//! pipeline must move it from running to committed before writing the package
//! set, the waiter must move it from running to cancelled before reporting a
//! timeout. Whoever loses backs off, so a timed-out artifact never writes its
//! package set, and a write that already started is waited for and reported.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::coordinate::ArtifactCoordinate;
use crate::counters::{CountersSnapshot, RunCounters};
use crate::error::{Failure, FailureReason, Stage};
use crate::gateway::PersistenceGateway;
use crate::graph::GraphEvent;
use crate::measure::ClassCounter;
use crate::resolve::ResolutionEngine;
use crate::visitor::VisitorComposite;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

const RUNNING: u8 = 0;
const COMMITTED: u8 = 1;
const CANCELLED: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub coordinate: ArtifactCoordinate,
    pub nodes: usize,
    pub edges: usize,
    /// Collection stopped early; the topology seen so far was still visited.
    pub partial_graph: bool,
    pub packages: usize,
    pub classes: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Done(Summary),
    Failed(Failure),
}

impl Outcome {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Failed(f) => Some(f),
            Self::Done(_) => None,
        }
    }
}

#[derive(Clone)]
pub struct ArtifactProcessor {
    engine: Arc<dyn ResolutionEngine>,
    visitors: Arc<VisitorComposite>,
    counter: Arc<ClassCounter>,
    gateway: Arc<dyn PersistenceGateway>,
    counters: Arc<RunCounters>,
    timeout: Duration,
}

impl ArtifactProcessor {
    pub fn new(
        engine: Arc<dyn ResolutionEngine>,
        visitors: Arc<VisitorComposite>,
        counter: Arc<ClassCounter>,
        gateway: Arc<dyn PersistenceGateway>,
        counters: Arc<RunCounters>,
    ) -> Self {
        Self {
            engine,
            visitors,
            counter,
            gateway,
            counters,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn counters(&self) -> &Arc<RunCounters> {
        &self.counters
    }

    /// Current totals; safe to call while pipelines are in flight.
    pub fn report(&self) -> CountersSnapshot {
        let snapshot = self.counters.snapshot();
        info!(
            resolved = snapshot.resolved,
            non_resolved = snapshot.non_resolved,
            "{} artifact jars resolved, {} failed resolution",
            snapshot.resolved,
            snapshot.non_resolved
        );
        snapshot
    }

    /// Runs the pipeline and books its outcome.
    pub fn process(&self, coordinate: &ArtifactCoordinate) -> Outcome {
        let outcome = self.run(coordinate);
        self.record(&outcome);
        outcome
    }

    /// Books a terminal outcome: exactly one counter per call.
    pub fn record(&self, outcome: &Outcome) {
        match outcome {
            Outcome::Done(_) => self.counters.record_resolved(),
            Outcome::Failed(_) => self.counters.record_non_resolved(),
        }
    }

    /// Runs the pipeline to a terminal state without touching the counters.
    pub fn run(&self, coordinate: &ArtifactCoordinate) -> Outcome {
        let started = Instant::now();
        let phase = Arc::new(AtomicU8::new(RUNNING));
        let pipeline = Pipeline {
            engine: Arc::clone(&self.engine),
            visitors: Arc::clone(&self.visitors),
            counter: Arc::clone(&self.counter),
            gateway: Arc::clone(&self.gateway),
            coordinate: coordinate.clone(),
            phase: Arc::clone(&phase),
        };

        let (tx, rx) = mpsc::sync_channel(1);
        let spawned = std::thread::Builder::new()
            .name(format!("pipeline {coordinate}"))
            .spawn(move || {
                let _ = tx.send(pipeline.run());
            });

        let panicked = || {
            Failure::new(
                Stage::Failed,
                FailureReason::Unclassified,
                "pipeline thread panicked",
            )
        };
        let result = match spawned {
            Err(e) => Err(Failure::new(
                Stage::Received,
                FailureReason::ResourceExhaustion,
                format!("cannot start pipeline thread: {e}"),
            )),
            Ok(_) => match rx.recv_timeout(self.timeout) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => {
                    let cancel =
                        phase.compare_exchange(RUNNING, CANCELLED, Ordering::SeqCst, Ordering::SeqCst);
                    match cancel {
                        Ok(_) => Err(Failure::new(
                            Stage::Failed,
                            FailureReason::Timeout,
                            format!("no terminal state after {:?}", self.timeout),
                        )),
                        Err(_) => {
                            debug!(coordinate = %coordinate, "timed out mid-write, waiting for the store");
                            rx.recv().unwrap_or_else(|_| Err(panicked()))
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => Err(panicked()),
            },
        };

        match result {
            Ok(mut summary) => {
                summary.duration_ms = started.elapsed().as_millis() as u64;
                info!(
                    coordinate = %coordinate,
                    nodes = summary.nodes,
                    packages = summary.packages,
                    classes = summary.classes,
                    duration_ms = summary.duration_ms,
                    "artifact done"
                );
                Outcome::Done(summary)
            }
            Err(failure) => {
                error!(
                    coordinate = %coordinate,
                    stage = %failure.stage,
                    reason = %failure.reason,
                    detail = %failure.detail,
                    "artifact failed"
                );
                Outcome::Failed(failure)
            }
        }
    }
}

struct Pipeline {
    engine: Arc<dyn ResolutionEngine>,
    visitors: Arc<VisitorComposite>,
    counter: Arc<ClassCounter>,
    gateway: Arc<dyn PersistenceGateway>,
    coordinate: ArtifactCoordinate,
    phase: Arc<AtomicU8>,
}

struct Collected {
    nodes: usize,
    edges: usize,
    partial: bool,
}

impl Pipeline {
    fn run(&self) -> Result<Summary, Failure> {
        debug!(coordinate = %self.coordinate, stage = %Stage::Received);
        let collected = self.collect()?;

        self.enter(Stage::Resolving)?;
        let payload = match self.engine.resolve_payload(&self.coordinate) {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                return Err(Failure::new(
                    Stage::Resolving,
                    FailureReason::UnresolvablePayload,
                    "resolution engine returned no file",
                ));
            }
            Err(e) => return Err(Failure::resolution(&e)),
        };

        self.enter(Stage::Measuring)?;
        let library_id = self.coordinate.library_id();
        let packages = self
            .counter
            .measure(&library_id, payload.path())
            .map_err(|e| Failure::measurement(&e))?;
        debug!(coordinate = %self.coordinate, path = %payload.path().display(), "deleting payload");
        if let Err(e) = payload.release() {
            warn!(coordinate = %self.coordinate, error = %e, "failed to delete payload");
        }

        self.enter(Stage::Persisted)?;
        if self
            .phase
            .compare_exchange(RUNNING, COMMITTED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Self::cancelled_in(Stage::Persisted));
        }
        self.gateway
            .upsert_package_set(&library_id, &packages)
            .map_err(|e| Failure::persistence(&e))?;

        Ok(Summary {
            coordinate: self.coordinate.clone(),
            nodes: collected.nodes,
            edges: collected.edges,
            partial_graph: collected.partial,
            packages: packages.len(),
            classes: packages.class_count(),
            duration_ms: 0,
        })
    }

    fn cancelled(&self) -> bool {
        self.phase.load(Ordering::SeqCst) == CANCELLED
    }

    fn cancelled_in(stage: Stage) -> Failure {
        Failure::new(stage, FailureReason::Timeout, "cancelled")
    }

    fn enter(&self, stage: Stage) -> Result<(), Failure> {
        if self.cancelled() {
            return Err(Self::cancelled_in(stage));
        }
        debug!(coordinate = %self.coordinate, stage = %stage);
        Ok(())
    }

    /// Streams the traversal to the visitors. Repeated node events are dropped
    /// so each visitor sees a coordinate once per traversal.
    fn collect(&self) -> Result<Collected, Failure> {
        self.enter(Stage::Collecting)?;
        let stream = self
            .engine
            .collect_graph(&self.coordinate)
            .map_err(|e| Failure::collection(&e))?;

        self.visitors.begin_traversal(&self.coordinate);
        let mut seen = HashSet::new();
        let mut collected = Collected {
            nodes: 0,
            edges: 0,
            partial: false,
        };

        for event in stream {
            if self.cancelled() {
                self.visitors.end_traversal(&self.coordinate);
                return Err(Self::cancelled_in(Stage::Collecting));
            }
            match event {
                Ok(GraphEvent::Node(node)) => {
                    if !seen.insert(node.coordinate.clone()) {
                        debug!(coordinate = %node.coordinate, "duplicate node event dropped");
                        continue;
                    }
                    collected.nodes += 1;
                    self.visitors.dispatch(&GraphEvent::Node(node));
                }
                Ok(GraphEvent::Edge(edge)) => {
                    collected.edges += 1;
                    self.visitors.dispatch(&GraphEvent::Edge(edge));
                }
                Err(e) if collected.nodes == 0 => {
                    self.visitors.end_traversal(&self.coordinate);
                    return Err(Failure::collection(&e));
                }
                Err(e) => {
                    warn!(
                        coordinate = %self.coordinate,
                        error = %e,
                        nodes = collected.nodes,
                        "dependency collection interrupted, keeping partial graph"
                    );
                    collected.partial = true;
                    break;
                }
            }
        }

        self.visitors.end_traversal(&self.coordinate);
        Ok(collected)
    }
}
