//! Error types for the matching and prioritisation engine

use sea_orm::DbErr;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{SegmentId, TaskStatus};

#[derive(Error, Debug)]
pub enum EngineError {
    /// The road network has not finished its first load yet. Callers retry.
    #[error("road network index is not loaded yet")]
    IndexUnavailable,

    #[error("invalid observation {0}: {1}")]
    InvalidObservation(Uuid, String),

    #[error("invalid road segment {0}: {1}")]
    InvalidSegment(SegmentId, String),

    #[error("road segment {0} not found")]
    SegmentNotFound(SegmentId),

    #[error("maintenance task {0} not found")]
    TaskNotFound(Uuid),

    #[error("task {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("aggregation worker for segment {0} stopped")]
    WorkerStopped(SegmentId),

    #[error("database error: {0}")]
    Database(#[from] DbErr),

    #[error("stored data is corrupt: {0}")]
    Corrupt(String),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl EngineError {
    /// Errors worth retrying with backoff; everything else is surfaced at once.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Database(err) => matches!(
                err,
                DbErr::Conn(_) | DbErr::ConnectionAcquire(_) | DbErr::Exec(_) | DbErr::Query(_)
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
