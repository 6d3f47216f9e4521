use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::key::TaskKey;
use crate::sqlite::is_busy;

use super::models::TaskStatus;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("task store unavailable at {path}: {source}")]
    StoreUnavailable {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task store path not configured")]
    MissingStore,
    #[error("task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("task {0} not found")]
    NotFound(String),
    #[error("task key {key} already belongs to a different source")]
    KeyCollision { key: TaskKey },
    #[error("invalid task status: {0}")]
    InvalidStatus(String),
    #[error("gave up waiting for task {key} after {waited:?}")]
    WaitTimeout { key: TaskKey, waited: Duration },
}

impl TaskError {
    /// Errors worth retrying after a pause: the store could not be reached or
    /// another connection held the write lock for longer than the busy timeout.
    pub fn is_transient(&self) -> bool {
        match self {
            TaskError::StoreUnavailable { .. } => true,
            TaskError::Database(error) => is_busy(error),
            _ => false,
        }
    }
}

pub type TaskResult<T> = std::result::Result<T, TaskError>;
