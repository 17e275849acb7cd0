use std::collections::HashMap;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier assigned to a watchdog entry, independent of any task id.
pub type WatchId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Marked by the monitor loop when the deadline passes. The entry is
    /// still live; settlement later overwrites this with the final status.
    Timeout,
    Cancelled,
}

impl Display for WatchStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            WatchStatus::Pending => write!(f, "pending"),
            WatchStatus::Running => write!(f, "running"),
            WatchStatus::Completed => write!(f, "completed"),
            WatchStatus::Failed => write!(f, "failed"),
            WatchStatus::Timeout => write!(f, "timeout"),
            WatchStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for WatchStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WatchStatus::Pending),
            "running" => Ok(WatchStatus::Running),
            "completed" => Ok(WatchStatus::Completed),
            "failed" => Ok(WatchStatus::Failed),
            "timeout" => Ok(WatchStatus::Timeout),
            "cancelled" => Ok(WatchStatus::Cancelled),
            _ => Err(anyhow::anyhow!("Invalid watch status: {}", s)),
        }
    }
}

/// Read-only snapshot of a watchdog entry, handed to callbacks.
#[derive(Debug, Clone, Serialize)]
pub struct WatchInfo {
    pub id: WatchId,
    pub name: String,
    pub status: WatchStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Effective deadline: the registered timeout or the configured default.
    #[serde(skip)]
    pub timeout: Duration,
    pub metadata: HashMap<String, serde_json::Value>,
    pub error: Option<String>,
}

impl WatchInfo {
    /// Elapsed time since registration. Unsettled entries measure against now.
    pub fn duration(&self) -> Duration {
        let end = self.end_time.unwrap_or_else(Utc::now);
        end.signed_duration_since(self.start_time)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WatchdogStats {
    pub total_registered: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_timeout: u64,
    pub total_cancelled: u64,
    pub current_running: usize,
    pub current_tracked: usize,
}
