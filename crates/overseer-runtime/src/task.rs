//! The manager's mutable record of a submitted task.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use overseer_core::error::TaskError;
use overseer_core::models::{TaskConfig, TaskId, TaskInfo, TaskState, WatchId};

use crate::work::Work;

/// Why a task ended up `Cancelled`. Determines what `wait` surfaces.
#[derive(Debug, Clone)]
pub(crate) enum CancelReason {
    User,
    Shutdown,
    Dependency(TaskId),
    WatchdogTimeout { elapsed: Duration },
}

/// Handle to the current attempt. Present only while `Running`.
pub(crate) struct AttemptHandle {
    /// Cooperative cancellation signal shared with the running computation.
    pub cancel: CancellationToken,
    /// Hard abort, used only as a last resort during forced shutdown.
    pub abort: Option<AbortHandle>,
}

pub(crate) struct ManagedTask {
    pub id: TaskId,
    pub name: String,
    pub work: Arc<dyn Work>,
    pub config: TaskConfig,
    pub state: TaskState,
    pub handle: Option<AttemptHandle>,
    pub watchdog_id: Option<WatchId>,
    pub result: Option<serde_json::Value>,
    pub error: Option<Arc<anyhow::Error>>,
    pub cancel_reason: Option<CancelReason>,
    pub retry_count: u32,
    pub create_time: DateTime<Utc>,
    /// Start of the current attempt; cleared on retry.
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Ids of tasks whose dependency list names this task.
    pub dependents: HashSet<TaskId>,
    /// One-shot completion signal, notified at the terminal transition.
    pub done: Arc<Notify>,
}

impl ManagedTask {
    pub fn new(
        id: TaskId,
        name: String,
        work: Arc<dyn Work>,
        config: TaskConfig,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name,
            work,
            config,
            state: TaskState::Queued,
            handle: None,
            watchdog_id: None,
            result: None,
            error: None,
            cancel_reason: None,
            retry_count: 0,
            create_time: now,
            start_time: None,
            end_time: None,
            dependents: HashSet::new(),
            done: Arc::new(Notify::new()),
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.config.max_retries
    }

    /// The error `wait` surfaces for a cancelled task.
    pub fn cancel_error(&self) -> TaskError {
        match &self.cancel_reason {
            Some(CancelReason::WatchdogTimeout { elapsed }) => {
                TaskError::Timeout { elapsed: *elapsed }
            }
            Some(CancelReason::Dependency(dep)) => TaskError::DependencyFailed(dep.clone()),
            Some(CancelReason::Shutdown) => TaskError::Cancelled("manager shutdown".to_string()),
            Some(CancelReason::User) | None => TaskError::Cancelled("cancelled".to_string()),
        }
    }

    fn error_message(&self) -> Option<String> {
        if let Some(e) = &self.error {
            return Some(e.to_string());
        }
        if self.state == TaskState::Cancelled {
            return Some(self.cancel_error().to_string());
        }
        None
    }

    pub fn snapshot(&self) -> TaskInfo {
        TaskInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            state: self.state,
            priority: self.config.priority,
            retry_count: self.retry_count,
            max_retries: self.config.max_retries,
            dependencies: self.config.dependencies.clone(),
            metadata: self.config.metadata.clone(),
            result: self.result.clone(),
            error: self.error_message(),
            create_time: self.create_time,
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }
}
