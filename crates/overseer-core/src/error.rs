//! Error types for the scheduler.
//!
//! `TaskError` is the public error surface: submission failures and the
//! outcomes observed through `wait`. Work bodies fail with plain
//! `anyhow::Error`; wrap one in [`WorkError`] to mark it unrecoverable and
//! bypass the retry budget.

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::sync::Arc;
use std::time::Duration;

use crate::models::TaskId;

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task manager is not running")]
    NotRunning,

    #[error("unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("unknown dependency: {0}")]
    UnknownDependency(TaskId),

    #[error("dependency failed: {0}")]
    DependencyFailed(TaskId),

    /// The work body's error, surfaced unchanged. Shared so that every
    /// `wait` caller observes the same underlying error.
    #[error("task failed: {0}")]
    Failed(Arc<anyhow::Error>),

    #[error("task cancelled: {0}")]
    Cancelled(String),

    /// A cancellation whose origin is the watchdog timeout path.
    #[error("task timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    /// The `wait` call's own deadline elapsed; the task itself is unaffected.
    #[error("timed out after {timeout:?} waiting for task {id}")]
    WaitTimeout { id: TaskId, timeout: Duration },
}

impl TaskError {
    /// True for the cancellation family (plain cancellation, dependency
    /// propagation, watchdog timeout).
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            TaskError::Cancelled(_) | TaskError::DependencyFailed(_) | TaskError::Timeout { .. }
        )
    }
}

/// Wrapper classifying a work failure as recoverable or not. The executor
/// downcasts failed attempts to this type; an unrecoverable error fails the
/// task immediately regardless of remaining retries. Errors that are not a
/// `WorkError` are treated as recoverable.
#[derive(Debug)]
pub struct WorkError {
    recoverable: bool,
    source: anyhow::Error,
}

impl WorkError {
    pub fn recoverable(source: anyhow::Error) -> Self {
        Self {
            recoverable: true,
            source,
        }
    }

    pub fn unrecoverable(source: anyhow::Error) -> Self {
        Self {
            recoverable: false,
            source,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.recoverable
    }
}

impl Display for WorkError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.source)
    }
}

impl std::error::Error for WorkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.source)
    }
}

/// Extension for marking a work result unrecoverable in one call.
pub trait WorkResultExt<T> {
    /// Converts the error side into an unrecoverable [`WorkError`].
    fn unrecoverable(self) -> anyhow::Result<T>;
}

impl<T> WorkResultExt<T> for anyhow::Result<T> {
    fn unrecoverable(self) -> anyhow::Result<T> {
        self.map_err(|e| WorkError::unrecoverable(e).into())
    }
}
