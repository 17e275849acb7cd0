//! Configuration for the scheduler and the watchdog.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Size of the concurrency gate: maximum tasks in `Running` at once.
    pub max_concurrent_tasks: usize,
    /// Attach a watchdog instance to the manager.
    pub enable_watchdog: bool,
    /// Upper bound on the scheduler loop's idle wait when no wake signal
    /// arrives.
    pub poll_interval: Duration,
    /// How long `stop(cancel_running = false)` waits for running tasks before
    /// force-cancelling the stragglers.
    pub shutdown_grace: Duration,
    pub watchdog: WatchdogConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            enable_watchdog: true,
            poll_interval: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(30),
            watchdog: WatchdogConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Monitor loop cadence.
    pub check_interval: Duration,
    /// Fallback deadline for entries registered without an explicit timeout.
    pub default_timeout: Duration,
    /// Master switch for timeout detection.
    pub enable_timeout_check: bool,
    /// Reserved: flag entries outliving their expected lifetime.
    pub enable_leak_detection: bool,
    /// How long settled entries remain observable before garbage collection.
    pub retention: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(1),
            default_timeout: Duration::from_secs(300),
            enable_timeout_check: true,
            enable_leak_detection: true,
            retention: Duration::from_secs(60),
        }
    }
}
