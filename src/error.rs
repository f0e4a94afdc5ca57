//! Error taxonomy of the pipeline.
//!
//! Every per-artifact error is classified into a [`FailureReason`] and carried
//! as a [`Failure`] out of the stage that produced it. None of these escape the
//! processor; only startup errors (configuration, queue unreachable) end the
//! process.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// A queue message body that is not a coordinate. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("message body is not valid UTF-8: {raw:?}")]
    NotUtf8 { raw: String },

    #[error("expected group:artifact:version[:classifier], got {parts} part(s) in {raw:?}")]
    WrongArity { raw: String, parts: usize },

    #[error("invalid {field} in coordinate {raw:?}")]
    InvalidField { raw: String, field: &'static str },
}

/// Errors raised by a resolution engine, during collection or payload fetch.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("network failure: {0}")]
    Network(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed artifact metadata: {0}")]
    MalformedArtifact(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl ResolveError {
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::Network(_) | Self::Io(_) => FailureReason::NetworkIo,
            Self::MalformedArtifact(_) => FailureReason::MalformedArtifact,
            Self::ResourceExhausted(_) => FailureReason::ResourceExhaustion,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MeasureError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} is not a readable archive: {source}", path.display())]
    MalformedArchive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
}

impl MeasureError {
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::Io { .. } => FailureReason::NetworkIo,
            Self::MalformedArchive { .. } => FailureReason::MalformedArchive,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("graph store: {0}")]
    Graph(#[from] heed::Error),

    #[error("relational store: {0}")]
    Relational(#[from] rusqlite::Error),

    #[error("encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Broker connectivity problems. Unacknowledged messages stay queued.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("queue {0:?} has not been declared on this channel")]
    Undeclared(String),

    #[error("unknown delivery tag {0}")]
    UnknownTag(u64),

    #[error("queue storage: {0}")]
    Storage(#[from] heed::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    Collection,
    NetworkIo,
    MalformedArtifact,
    MalformedArchive,
    ResourceExhaustion,
    UnresolvablePayload,
    Timeout,
    Persistence,
    Unclassified,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Collection => "COLLECTION",
            Self::NetworkIo => "NETWORK_IO",
            Self::MalformedArtifact => "MALFORMED_ARTIFACT",
            Self::MalformedArchive => "MALFORMED_ARCHIVE",
            Self::ResourceExhaustion => "RESOURCE_EXHAUSTION",
            Self::UnresolvablePayload => "UNRESOLVABLE_PAYLOAD",
            Self::Timeout => "TIMEOUT",
            Self::Persistence => "PERSISTENCE",
            Self::Unclassified => "UNCLASSIFIED",
        };
        f.write_str(s)
    }
}

/// States of the per-artifact pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Received,
    Collecting,
    Resolving,
    Measuring,
    Persisted,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Received => "RECEIVED",
            Self::Collecting => "COLLECTING",
            Self::Resolving => "RESOLVING",
            Self::Measuring => "MEASURING",
            Self::Persisted => "PERSISTED",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Why and where a pipeline ended in FAILED.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{reason} while {stage}: {detail}")]
pub struct Failure {
    pub stage: Stage,
    pub reason: FailureReason,
    pub detail: String,
}

impl Failure {
    pub fn new(stage: Stage, reason: FailureReason, detail: impl Into<String>) -> Self {
        Self {
            stage,
            reason,
            detail: detail.into(),
        }
    }

    pub fn collection(err: &ResolveError) -> Self {
        Self::new(Stage::Collecting, FailureReason::Collection, err.to_string())
    }

    pub fn resolution(err: &ResolveError) -> Self {
        Self::new(Stage::Resolving, err.reason(), err.to_string())
    }

    pub fn measurement(err: &MeasureError) -> Self {
        Self::new(Stage::Measuring, err.reason(), err.to_string())
    }

    pub fn persistence(err: &PersistenceError) -> Self {
        Self::new(Stage::Persisted, FailureReason::Persistence, err.to_string())
    }
}
