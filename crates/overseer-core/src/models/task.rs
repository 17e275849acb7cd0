use std::collections::HashMap;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier assigned to a submitted task. Unique within a manager lifetime.
pub type TaskId = String;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Priority {
    /// All levels in ascending order. Dispatch scans this in reverse.
    pub const ALL: [Priority; 4] = [
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::Critical,
    ];

    /// Dense index for per-priority sub-queue addressing.
    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl Display for Priority {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

impl FromStr for Priority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            _ => Err(anyhow::anyhow!("Invalid priority: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Waiting,
    Running,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    /// Terminal states are absorbing: no transition leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

impl Display for TaskState {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            TaskState::Queued => write!(f, "queued"),
            TaskState::Waiting => write!(f, "waiting"),
            TaskState::Running => write!(f, "running"),
            TaskState::Retrying => write!(f, "retrying"),
            TaskState::Completed => write!(f, "completed"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for TaskState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskState::Queued),
            "waiting" => Ok(TaskState::Waiting),
            "running" => Ok(TaskState::Running),
            "retrying" => Ok(TaskState::Retrying),
            "completed" => Ok(TaskState::Completed),
            "failed" => Ok(TaskState::Failed),
            "cancelled" => Ok(TaskState::Cancelled),
            _ => Err(anyhow::anyhow!("Invalid task state: {}", s)),
        }
    }
}

/// Per-submission task configuration. Immutable once submitted.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub priority: Priority,
    /// Managed timeout enforced through the watchdog. None = no timeout.
    pub timeout: Option<Duration>,
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Ids of tasks that must complete before this one runs. Must name
    /// already-submitted tasks.
    pub dependencies: Vec<TaskId>,
    /// Opaque values surfaced to callbacks and watchdog entries.
    pub metadata: HashMap<String, serde_json::Value>,
    /// When true, the task is cancelled if any dependency fails or is cancelled.
    pub cancel_on_dependency_failure: bool,
    pub enable_watchdog: bool,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            timeout: None,
            max_retries: 0,
            retry_delay: Duration::from_secs(1),
            dependencies: Vec::new(),
            metadata: HashMap::new(),
            cancel_on_dependency_failure: true,
            enable_watchdog: true,
        }
    }
}

/// Read-only snapshot of a managed task. All introspection returns these,
/// never live references.
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: String,
    pub state: TaskState,
    pub priority: Priority,
    pub retry_count: u32,
    pub max_retries: u32,
    pub dependencies: Vec<TaskId>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub create_time: DateTime<Utc>,
    /// Start of the current attempt, not the first.
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl TaskInfo {
    /// Elapsed time of the current attempt. Running tasks measure against now.
    pub fn duration(&self) -> Option<Duration> {
        let start = self.start_time?;
        let end = self.end_time.unwrap_or_else(Utc::now);
        end.signed_duration_since(start).to_std().ok()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub total_submitted: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
    pub total_retries: u64,
    pub current_running: usize,
    pub current_queued: usize,
    pub current_waiting: usize,
    pub max_concurrent: usize,
}
