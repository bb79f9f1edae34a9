//! The error type shared by every stage.

use crate::record_types::NodeId;
use std::io;
use thiserror::Error;

/// Errors raised while computing a PageRank iteration.
///
/// Data errors (a message for an id the partition does not own, duplicate
/// structure, corrupt frames) are fatal: rerunning the task would fail the
/// same way. I/O errors and worker panics are retryable, since every stage
/// reads only immutable inputs.
#[derive(Error, Debug)]
pub enum RankError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt record stream: {0}")]
    Corrupt(String),

    #[error("partition {partition}: message for node {message} but structure is at node {structure}")]
    KeyMismatch {
        partition: usize,
        message: NodeId,
        structure: NodeId,
    },

    #[error("partition {partition}: message for node {id} has no structure record")]
    MissingStructure { partition: usize, id: NodeId },

    #[error("partition {partition}: more than one structure record for node {id}")]
    DuplicateStructure { partition: usize, id: NodeId },

    #[error("partition {partition}: structure node {id} follows node {previous}")]
    UnsortedStructure {
        partition: usize,
        previous: NodeId,
        id: NodeId,
    },

    #[error("partition {partition}: message group {id} follows group {previous}")]
    UnsortedMessages {
        partition: usize,
        previous: NodeId,
        id: NodeId,
    },

    #[error("partition {partition}: unexpected {tag} record for node {id}")]
    UnexpectedRecord {
        partition: usize,
        tag: &'static str,
        id: NodeId,
    },

    #[error("partition {partition}: expected node {expected}, found node {found}")]
    NodeMismatch {
        partition: usize,
        expected: NodeId,
        found: NodeId,
    },

    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("{stage} task for partition {partition} panicked: {message}")]
    TaskPanicked {
        stage: &'static str,
        partition: usize,
        message: String,
    },

    #[error("{stage} task for partition {partition} failed after {attempts} attempt(s): {source}")]
    TaskFailed {
        stage: &'static str,
        partition: usize,
        attempts: usize,
        #[source]
        source: Box<RankError>,
    },

    #[error("computation cancelled")]
    Cancelled,
}

impl RankError {
    /// Whether rerunning the failed task from the same inputs may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RankError::Io(_) | RankError::TaskPanicked { .. })
    }
}

impl From<java_properties::PropertiesError> for RankError {
    fn from(e: java_properties::PropertiesError) -> Self {
        RankError::Corrupt(format!("manifest: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, RankError>;
