//! Supervisory watchdog.
//!
//! Tracks registered deferred computations, detects deadline overruns, and
//! fires lifecycle callbacks. Detection and policy are deliberately split:
//! the monitor loop only *marks* an entry `Timeout` and invokes the timeout
//! callbacks; whoever registered the callback decides whether to cancel the
//! underlying work. Settled entries stay observable for a retention window
//! before garbage collection.

use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use overseer_core::clock::{Clock, SystemClock};
use overseer_core::config::WatchdogConfig;
use overseer_core::models::{WatchId, WatchInfo, WatchStatus, WatchdogStats};

use crate::work::{run_with_cancel, Settlement};

type WatchCallback = Arc<dyn Fn(&WatchId, &WatchInfo) + Send + Sync>;

/// Returned by [`Watchdog::watch`]: the entry id and the join handle of the
/// supervised computation.
pub struct Watched {
    pub id: WatchId,
    pub handle: JoinHandle<Settlement>,
}

struct WatchEntry {
    id: WatchId,
    name: String,
    cancel: CancellationToken,
    status: WatchStatus,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    timeout: Duration,
    metadata: HashMap<String, serde_json::Value>,
    error: Option<String>,
}

impl WatchEntry {
    fn settled(&self) -> bool {
        self.end_time.is_some()
    }

    fn snapshot(&self) -> WatchInfo {
        WatchInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            status: self.status,
            start_time: self.start_time,
            end_time: self.end_time,
            timeout: self.timeout,
            metadata: self.metadata.clone(),
            error: self.error.clone(),
        }
    }
}

#[derive(Default)]
struct Counters {
    registered: u64,
    completed: u64,
    failed: u64,
    timeout: u64,
    cancelled: u64,
}

struct WatchdogState {
    entries: HashMap<WatchId, WatchEntry>,
    counter: u64,
    stats: Counters,
}

#[derive(Default)]
struct CallbackSets {
    on_timeout: Vec<WatchCallback>,
    on_error: Vec<WatchCallback>,
    on_complete: Vec<WatchCallback>,
}

struct MonitorHandle {
    shutdown_tx: mpsc::Sender<()>,
    join: JoinHandle<()>,
}

struct WatchdogInner {
    config: WatchdogConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<WatchdogState>,
    callbacks: Mutex<CallbackSets>,
    running: AtomicBool,
    monitor: tokio::sync::Mutex<Option<MonitorHandle>>,
}

#[derive(Clone)]
pub struct Watchdog {
    inner: Arc<WatchdogInner>,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: WatchdogConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(WatchdogInner {
                config,
                clock,
                state: Mutex::new(WatchdogState {
                    entries: HashMap::new(),
                    counter: 0,
                    stats: Counters::default(),
                }),
                callbacks: Mutex::new(CallbackSets::default()),
                running: AtomicBool::new(false),
                monitor: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Process-wide convenience instance with default configuration. Test
    /// fixtures should construct isolated instances instead.
    pub fn global() -> &'static Watchdog {
        static GLOBAL: OnceLock<Watchdog> = OnceLock::new();
        GLOBAL.get_or_init(|| Watchdog::new(WatchdogConfig::default()))
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Starts the monitor loop. Idempotent.
    pub async fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("Watchdog already running");
            return;
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let inner = Arc::clone(&self.inner);
        let join = tokio::spawn(monitor_loop(inner, shutdown_rx));
        *self.inner.monitor.lock().await = Some(MonitorHandle { shutdown_tx, join });

        info!(
            check_interval_ms = self.inner.config.check_interval.as_millis() as u64,
            "Watchdog started"
        );
    }

    /// Stops the monitor loop. Entries and statistics are retained.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(handle) = self.inner.monitor.lock().await.take() {
            let _ = handle.shutdown_tx.send(()).await;
            let _ = handle.join.await;
        }

        info!("Watchdog stopped");
    }

    /// Registers and spawns a deferred computation under supervision.
    ///
    /// The computation is raced against `cancel`; whichever side settles
    /// first determines the entry's final status. The entry is updated and
    /// the matching callback set fired exactly once, at settlement, no
    /// matter who holds the returned join handle.
    pub fn watch<F>(
        &self,
        future: F,
        name: Option<String>,
        timeout: Option<Duration>,
        metadata: HashMap<String, serde_json::Value>,
        cancel: CancellationToken,
    ) -> Watched
    where
        F: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        let now = self.inner.clock.now();
        let id = {
            let mut state = self.inner.state.lock().expect("watchdog state poisoned");
            state.counter += 1;
            let id = format!("wd_{}_{}", state.counter, now.timestamp_millis());
            let entry = WatchEntry {
                id: id.clone(),
                name: name.unwrap_or_else(|| format!("watch-{}", state.counter)),
                cancel: cancel.clone(),
                status: WatchStatus::Running,
                start_time: now,
                end_time: None,
                timeout: timeout.unwrap_or(self.inner.config.default_timeout),
                metadata,
                error: None,
            };
            state.entries.insert(id.clone(), entry);
            state.stats.registered += 1;
            id
        };

        let inner = Arc::clone(&self.inner);
        let wrapped = run_with_cancel(future, cancel);
        let settle_id = id.clone();
        let handle = tokio::spawn(async move {
            let settlement = wrapped.await;
            settle(&inner, &settle_id, &settlement);
            settlement
        });

        debug!(watch_id = %id, "Registered with watchdog");
        Watched { id, handle }
    }

    /// Removes an entry from tracking. Returns false for unknown ids.
    pub fn unregister(&self, id: &str) -> bool {
        let mut state = self.inner.state.lock().expect("watchdog state poisoned");
        state.entries.remove(id).is_some()
    }

    /// Signals cancellation of a live entry. The computation observes the
    /// signal at its next suspension point; settlement finalizes the entry.
    pub fn cancel(&self, id: &str, msg: Option<&str>) -> bool {
        let token = {
            let mut state = self.inner.state.lock().expect("watchdog state poisoned");
            match state.entries.get_mut(id) {
                Some(entry) if !entry.settled() => {
                    entry.status = WatchStatus::Cancelled;
                    entry.error = Some(msg.unwrap_or("cancelled by watchdog").to_string());
                    entry.cancel.clone()
                }
                _ => return false,
            }
        };
        token.cancel();
        debug!(watch_id = %id, "Watchdog cancellation requested");
        true
    }

    pub fn add_timeout_callback<F>(&self, callback: F)
    where
        F: Fn(&WatchId, &WatchInfo) + Send + Sync + 'static,
    {
        self.inner
            .callbacks
            .lock()
            .expect("watchdog callbacks poisoned")
            .on_timeout
            .push(Arc::new(callback));
    }

    pub fn add_error_callback<F>(&self, callback: F)
    where
        F: Fn(&WatchId, &WatchInfo) + Send + Sync + 'static,
    {
        self.inner
            .callbacks
            .lock()
            .expect("watchdog callbacks poisoned")
            .on_error
            .push(Arc::new(callback));
    }

    pub fn add_complete_callback<F>(&self, callback: F)
    where
        F: Fn(&WatchId, &WatchInfo) + Send + Sync + 'static,
    {
        self.inner
            .callbacks
            .lock()
            .expect("watchdog callbacks poisoned")
            .on_complete
            .push(Arc::new(callback));
    }

    pub fn entry(&self, id: &str) -> Option<WatchInfo> {
        let state = self.inner.state.lock().expect("watchdog state poisoned");
        state.entries.get(id).map(WatchEntry::snapshot)
    }

    pub fn entries(&self) -> HashMap<WatchId, WatchInfo> {
        let state = self.inner.state.lock().expect("watchdog state poisoned");
        state
            .entries
            .iter()
            .map(|(id, entry)| (id.clone(), entry.snapshot()))
            .collect()
    }

    /// Entries whose computation is still live.
    pub fn running(&self) -> HashMap<WatchId, WatchInfo> {
        let state = self.inner.state.lock().expect("watchdog state poisoned");
        state
            .entries
            .iter()
            .filter(|(_, entry)| entry.status == WatchStatus::Running && !entry.settled())
            .map(|(id, entry)| (id.clone(), entry.snapshot()))
            .collect()
    }

    pub fn stats(&self) -> WatchdogStats {
        let state = self.inner.state.lock().expect("watchdog state poisoned");
        let current_running = state
            .entries
            .values()
            .filter(|entry| entry.status == WatchStatus::Running && !entry.settled())
            .count();
        WatchdogStats {
            total_registered: state.stats.registered,
            total_completed: state.stats.completed,
            total_failed: state.stats.failed,
            total_timeout: state.stats.timeout,
            total_cancelled: state.stats.cancelled,
            current_running,
            current_tracked: state.entries.len(),
        }
    }

    /// Human-readable status summary.
    pub fn status_report(&self) -> String {
        use std::fmt::Write;

        let stats = self.stats();
        let running = self.running();

        let mut out = String::new();
        let _ = writeln!(out, "Watchdog status");
        let _ = writeln!(out, "  running: {}", self.is_running());
        let _ = writeln!(out, "  registered: {}", stats.total_registered);
        let _ = writeln!(out, "  completed: {}", stats.total_completed);
        let _ = writeln!(out, "  failed: {}", stats.total_failed);
        let _ = writeln!(out, "  timeout: {}", stats.total_timeout);
        let _ = writeln!(out, "  cancelled: {}", stats.total_cancelled);
        let _ = writeln!(out, "  currently running: {}", stats.current_running);
        let _ = writeln!(out, "  currently tracked: {}", stats.current_tracked);
        for (id, info) in running {
            let _ = writeln!(
                out,
                "  - {} ({}): {:.2}s of {:.2}s",
                info.name,
                id,
                info.duration().as_secs_f64(),
                info.timeout.as_secs_f64()
            );
        }
        out
    }
}

async fn monitor_loop(inner: Arc<WatchdogInner>, mut shutdown_rx: mpsc::Receiver<()>) {
    let mut interval = tokio::time::interval(inner.config.check_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => check_entries(&inner),
        }
    }
}

/// One monitor sweep: mark overdue entries, collect expired ones.
fn check_entries(inner: &Arc<WatchdogInner>) {
    let now = inner.clock.now();
    let mut timed_out: Vec<(WatchId, WatchInfo)> = Vec::new();

    {
        let mut state = inner.state.lock().expect("watchdog state poisoned");

        let mut expired: Vec<WatchId> = Vec::new();
        for (id, entry) in state.entries.iter_mut() {
            let elapsed = now
                .signed_duration_since(entry.start_time)
                .to_std()
                .unwrap_or(Duration::ZERO);

            if inner.config.enable_timeout_check
                && !entry.settled()
                && entry.status == WatchStatus::Running
                && elapsed > entry.timeout
            {
                entry.status = WatchStatus::Timeout;
                timed_out.push((id.clone(), entry.snapshot()));
            } else if entry.settled() {
                let settled_for = entry
                    .end_time
                    .map(|end| {
                        now.signed_duration_since(end)
                            .to_std()
                            .unwrap_or(Duration::ZERO)
                    })
                    .unwrap_or(Duration::ZERO);
                if settled_for > inner.config.retention {
                    expired.push(id.clone());
                }
            }
        }

        state.stats.timeout += timed_out.len() as u64;
        for id in expired {
            state.entries.remove(&id);
            debug!(watch_id = %id, "Watchdog entry garbage collected");
        }
    }

    for (id, info) in timed_out {
        warn!(
            watch_id = %id,
            name = %info.name,
            elapsed_ms = info.duration().as_millis() as u64,
            "Watchdog detected timeout"
        );
        let callbacks = {
            let sets = inner.callbacks.lock().expect("watchdog callbacks poisoned");
            sets.on_timeout.clone()
        };
        fire(&callbacks, &id, &info);
    }
}

/// Finalizes an entry exactly once, regardless of who drove the computation.
fn settle(inner: &Arc<WatchdogInner>, id: &WatchId, settlement: &Settlement) {
    let now = inner.clock.now();
    let info = {
        let mut state = inner.state.lock().expect("watchdog state poisoned");
        let snapshot = {
            let Some(entry) = state.entries.get_mut(id) else {
                // Unregistered or collected before settlement; nothing to record.
                return;
            };
            if entry.settled() {
                return;
            }
            entry.end_time = Some(now);
            match settlement {
                Settlement::Completed(_) => entry.status = WatchStatus::Completed,
                Settlement::Failed(e) => {
                    entry.status = WatchStatus::Failed;
                    entry.error = Some(e.to_string());
                }
                Settlement::Cancelled => entry.status = WatchStatus::Cancelled,
            }
            entry.snapshot()
        };
        match settlement {
            Settlement::Completed(_) => state.stats.completed += 1,
            Settlement::Failed(_) => state.stats.failed += 1,
            Settlement::Cancelled => state.stats.cancelled += 1,
        }
        snapshot
    };
    match settlement {
        Settlement::Completed(_) => {
            debug!(watch_id = %id, "Watched computation completed");
            let callbacks = {
                let sets = inner.callbacks.lock().expect("watchdog callbacks poisoned");
                sets.on_complete.clone()
            };
            fire(&callbacks, id, &info);
        }
        Settlement::Failed(e) => {
            debug!(watch_id = %id, error = %e, "Watched computation failed");
            let callbacks = {
                let sets = inner.callbacks.lock().expect("watchdog callbacks poisoned");
                sets.on_error.clone()
            };
            fire(&callbacks, id, &info);
        }
        Settlement::Cancelled => {
            debug!(watch_id = %id, "Watched computation cancelled");
        }
    }
}

/// Invokes a callback set in registration order, isolating panics.
fn fire(callbacks: &[WatchCallback], id: &WatchId, info: &WatchInfo) {
    for callback in callbacks {
        if catch_unwind(AssertUnwindSafe(|| callback(id, info))).is_err() {
            error!(watch_id = %id, "Watchdog callback panicked");
        }
    }
}
