//! Task manager facade: submission, scheduling, execution, introspection.
//!
//! One long-running scheduler loop drains the ready queue in priority order,
//! claiming a semaphore permit per pop and handing both to a spawned worker.
//! Dispatch never blocks: when the gate is saturated the queue simply
//! retains the excess in priority order. Shared state lives behind a single
//! coarse mutex that is never held across an await.

use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use overseer_core::clock::{Clock, SystemClock};
use overseer_core::config::SchedulerConfig;
use overseer_core::error::{TaskError, WorkError};
use overseer_core::models::{SchedulerStats, TaskConfig, TaskId, TaskInfo, TaskState};

use crate::deps::{self, DepCheck};
use crate::queue::ReadyQueue;
use crate::task::{AttemptHandle, CancelReason, ManagedTask};
use crate::watchdog::Watchdog;
use crate::work::{run_with_cancel, work_fn, Settlement, Work};

type TaskCallback = Arc<dyn Fn(&TaskInfo) + Send + Sync>;

#[derive(Default)]
struct Counters {
    submitted: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    retries: u64,
}

struct ManagerState {
    tasks: HashMap<TaskId, ManagedTask>,
    queue: ReadyQueue,
    counter: u64,
    stats: Counters,
}

struct SchedulerHandle {
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

struct ManagerInner {
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    watchdog: Option<Watchdog>,
    semaphore: Arc<Semaphore>,
    state: Mutex<ManagerState>,
    on_complete: Mutex<Vec<TaskCallback>>,
    on_failed: Mutex<Vec<TaskCallback>>,
    wake: Notify,
    running: AtomicBool,
    scheduler: tokio::sync::Mutex<Option<SchedulerHandle>>,
}

#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<ManagerInner>,
}

impl TaskManager {
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: SchedulerConfig, clock: Arc<dyn Clock>) -> Self {
        let watchdog = config
            .enable_watchdog
            .then(|| Watchdog::with_clock(config.watchdog.clone(), Arc::clone(&clock)));

        let inner = Arc::new(ManagerInner {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_tasks)),
            config,
            clock,
            watchdog,
            state: Mutex::new(ManagerState {
                tasks: HashMap::new(),
                queue: ReadyQueue::new(),
                counter: 0,
                stats: Counters::default(),
            }),
            on_complete: Mutex::new(Vec::new()),
            on_failed: Mutex::new(Vec::new()),
            wake: Notify::new(),
            running: AtomicBool::new(false),
            scheduler: tokio::sync::Mutex::new(None),
        });

        // Timeout policy: the watchdog only reports; this callback turns a
        // reported timeout into a cooperative cancellation of the task.
        if let Some(watchdog) = &inner.watchdog {
            let weak = Arc::downgrade(&inner);
            watchdog.add_timeout_callback(move |watch_id, watch_info| {
                if let Some(inner) = weak.upgrade() {
                    on_watchdog_timeout(&inner, watch_id, watch_info.duration());
                }
            });
        }

        Self { inner }
    }

    /// Process-wide convenience instance with default configuration. Callers
    /// still own its lifecycle (`start`/`stop`). Test fixtures should
    /// construct isolated instances instead.
    pub fn global() -> &'static TaskManager {
        static GLOBAL: OnceLock<TaskManager> = OnceLock::new();
        GLOBAL.get_or_init(|| TaskManager::new(SchedulerConfig::default()))
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// The attached watchdog, if the manager was configured with one.
    pub fn watchdog(&self) -> Option<&Watchdog> {
        self.inner.watchdog.as_ref()
    }

    /// Starts the watchdog and the scheduler loop. Idempotent.
    pub async fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("Task manager already running");
            return;
        }

        if let Some(watchdog) = &self.inner.watchdog {
            watchdog.start().await;
        }

        let shutdown = CancellationToken::new();
        let join = tokio::spawn(scheduler_loop(Arc::clone(&self.inner), shutdown.clone()));
        *self.inner.scheduler.lock().await = Some(SchedulerHandle { shutdown, join });

        info!(
            max_concurrent = self.inner.config.max_concurrent_tasks,
            watchdog = self.inner.watchdog.is_some(),
            "Task manager started"
        );
    }

    /// Stops accepting submissions, halts the scheduler loop, then either
    /// cancels running tasks or waits for them within the shutdown grace
    /// period (force-cancelling stragglers). Idempotent.
    pub async fn stop(&self, cancel_running: bool) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(handle) = self.inner.scheduler.lock().await.take() {
            handle.shutdown.cancel();
            let _ = handle.join.await;
        }

        if cancel_running {
            cancel_all_running(&self.inner);
        } else {
            let deadline = Instant::now() + self.inner.config.shutdown_grace;
            loop {
                if running_count(&self.inner) == 0 {
                    break;
                }
                if Instant::now() >= deadline {
                    warn!("Timed out waiting for running tasks, cancelling the remainder");
                    cancel_all_running(&self.inner);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        // Cancellation is cooperative; give the attempts a moment to settle
        // before falling back to a hard abort.
        if !wait_until_drained(&self.inner, Duration::from_secs(5)).await {
            abort_running(&self.inner);
            if !wait_until_drained(&self.inner, Duration::from_secs(1)).await {
                warn!("Tasks still running after forced abort");
            }
        }

        if let Some(watchdog) = &self.inner.watchdog {
            watchdog.stop().await;
        }

        info!("Task manager stopped");
    }

    /// Submits a unit of work. Dependencies must name already-submitted
    /// tasks; the task is enqueued immediately when they are all complete,
    /// parked as `Waiting` otherwise.
    pub fn submit(
        &self,
        work: Arc<dyn Work>,
        name: Option<&str>,
        config: TaskConfig,
    ) -> Result<TaskId, TaskError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(TaskError::NotRunning);
        }

        let now = self.inner.clock.now();
        let mut notifications = Vec::new();
        let id = {
            let mut state = self.inner.state.lock().expect("manager state poisoned");
            for dep_id in &config.dependencies {
                if !state.tasks.contains_key(dep_id) {
                    return Err(TaskError::UnknownDependency(dep_id.clone()));
                }
            }

            state.counter += 1;
            let id = format!("task_{}_{}", state.counter, now.timestamp_millis());
            let name = name
                .map(str::to_string)
                .unwrap_or_else(|| format!("task-{}", state.counter));
            let task = ManagedTask::new(id.clone(), name, work, config, now);
            state.tasks.insert(id.clone(), task);
            state.stats.submitted += 1;

            route_new_task(&mut state, &id, now, &mut notifications);
            id
        };

        for done in notifications {
            done.notify_waiters();
        }
        self.inner.wake.notify_one();
        debug!(task_id = %id, "Task submitted");
        Ok(id)
    }

    /// Closure-based submission: `f` is the re-entrant work factory.
    pub fn submit_fn<F, Fut>(
        &self,
        name: Option<&str>,
        config: TaskConfig,
        f: F,
    ) -> Result<TaskId, TaskError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        self.submit(work_fn(f), name, config)
    }

    /// Cancels a task. Running tasks are signalled cooperatively and
    /// transition through the executor; queued and waiting tasks transition
    /// directly. Returns false for terminal, retrying, or unknown tasks.
    pub fn cancel(&self, id: &str) -> bool {
        let now = self.inner.clock.now();
        let mut notifications = Vec::new();
        let mut token = None;

        let cancelled = {
            let mut state = self.inner.state.lock().expect("manager state poisoned");
            let Some(task) = state.tasks.get_mut(id) else {
                return false;
            };
            match task.state {
                TaskState::Running => {
                    if task.cancel_reason.is_none() {
                        task.cancel_reason = Some(CancelReason::User);
                    }
                    token = task.handle.as_ref().map(|h| h.cancel.clone());
                    token.is_some()
                }
                TaskState::Queued | TaskState::Waiting => {
                    let id = id.to_string();
                    cancel_locked(&mut state, &id, CancelReason::User, now, &mut notifications);
                    notify_dependents_locked(&mut state, &id, now, &mut notifications);
                    true
                }
                _ => false,
            }
        };

        for done in notifications {
            done.notify_waiters();
        }
        if let Some(token) = token {
            token.cancel();
        }
        if cancelled {
            debug!(task_id = %id, "Task cancellation requested");
        }
        cancelled
    }

    /// Waits for the task to reach a terminal state. Event-driven: each task
    /// carries a one-shot completion signal fulfilled at the terminal
    /// transition.
    pub async fn wait(
        &self,
        id: &str,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, TaskError> {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, self.wait_inner(id)).await {
                Ok(result) => result,
                Err(_) => Err(TaskError::WaitTimeout {
                    id: id.to_string(),
                    timeout: limit,
                }),
            },
            None => self.wait_inner(id).await,
        }
    }

    async fn wait_inner(&self, id: &str) -> Result<serde_json::Value, TaskError> {
        loop {
            let done = {
                let state = self.inner.state.lock().expect("manager state poisoned");
                let Some(task) = state.tasks.get(id) else {
                    return Err(TaskError::UnknownTask(id.to_string()));
                };
                if let Some(result) = terminal_result(task) {
                    return result;
                }
                Arc::clone(&task.done)
            };

            let mut notified = pin!(done.notified());
            notified.as_mut().enable();

            // Re-check after registering interest to close the race with the
            // terminal transition.
            {
                let state = self.inner.state.lock().expect("manager state poisoned");
                match state.tasks.get(id) {
                    None => return Err(TaskError::UnknownTask(id.to_string())),
                    Some(task) => {
                        if let Some(result) = terminal_result(task) {
                            return result;
                        }
                    }
                }
            }

            notified.await;
        }
    }

    pub fn task_info(&self, id: &str) -> Option<TaskInfo> {
        let state = self.inner.state.lock().expect("manager state poisoned");
        state.tasks.get(id).map(ManagedTask::snapshot)
    }

    pub fn tasks(&self) -> HashMap<TaskId, TaskInfo> {
        let state = self.inner.state.lock().expect("manager state poisoned");
        state
            .tasks
            .iter()
            .map(|(id, task)| (id.clone(), task.snapshot()))
            .collect()
    }

    pub fn tasks_by_state(&self, target: TaskState) -> HashMap<TaskId, TaskInfo> {
        let state = self.inner.state.lock().expect("manager state poisoned");
        state
            .tasks
            .iter()
            .filter(|(_, task)| task.state == target)
            .map(|(id, task)| (id.clone(), task.snapshot()))
            .collect()
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.inner.state.lock().expect("manager state poisoned");
        let mut running = 0;
        let mut queued = 0;
        let mut waiting = 0;
        for task in state.tasks.values() {
            match task.state {
                TaskState::Running => running += 1,
                TaskState::Queued => queued += 1,
                TaskState::Waiting => waiting += 1,
                _ => {}
            }
        }
        SchedulerStats {
            total_submitted: state.stats.submitted,
            total_completed: state.stats.completed,
            total_failed: state.stats.failed,
            total_cancelled: state.stats.cancelled,
            total_retries: state.stats.retries,
            current_running: running,
            current_queued: queued,
            current_waiting: waiting,
            max_concurrent: self.inner.config.max_concurrent_tasks,
        }
    }

    pub fn add_complete_callback<F>(&self, callback: F)
    where
        F: Fn(&TaskInfo) + Send + Sync + 'static,
    {
        self.inner
            .on_complete
            .lock()
            .expect("callbacks poisoned")
            .push(Arc::new(callback));
    }

    pub fn add_failed_callback<F>(&self, callback: F)
    where
        F: Fn(&TaskInfo) + Send + Sync + 'static,
    {
        self.inner
            .on_failed
            .lock()
            .expect("callbacks poisoned")
            .push(Arc::new(callback));
    }

    /// Human-readable status summary.
    pub fn status_report(&self) -> String {
        use std::fmt::Write;

        let stats = self.stats();
        let running = self.tasks_by_state(TaskState::Running);

        let mut out = String::new();
        let _ = writeln!(out, "Task manager status");
        let _ = writeln!(out, "  running: {}", self.is_running());
        let _ = writeln!(out, "  max concurrent: {}", stats.max_concurrent);
        let _ = writeln!(out, "  submitted: {}", stats.total_submitted);
        let _ = writeln!(out, "  completed: {}", stats.total_completed);
        let _ = writeln!(out, "  failed: {}", stats.total_failed);
        let _ = writeln!(out, "  cancelled: {}", stats.total_cancelled);
        let _ = writeln!(out, "  retries: {}", stats.total_retries);
        let _ = writeln!(out, "  currently running: {}", stats.current_running);
        let _ = writeln!(out, "  queued: {}", stats.current_queued);
        let _ = writeln!(out, "  waiting on dependencies: {}", stats.current_waiting);
        for (id, info) in running {
            let duration = info.duration().unwrap_or(Duration::ZERO);
            let _ = writeln!(
                out,
                "  - {} ({}): {} priority, {:.2}s",
                info.name,
                id,
                info.priority,
                duration.as_secs_f64()
            );
        }
        out
    }
}

/// Maps a terminal task to what `wait` returns. None while non-terminal.
fn terminal_result(task: &ManagedTask) -> Option<Result<serde_json::Value, TaskError>> {
    match task.state {
        TaskState::Completed => Some(Ok(task
            .result
            .clone()
            .unwrap_or(serde_json::Value::Null))),
        TaskState::Failed => Some(Err(TaskError::Failed(
            task.error
                .clone()
                .unwrap_or_else(|| Arc::new(anyhow::anyhow!("task failed"))),
        ))),
        TaskState::Cancelled => Some(Err(task.cancel_error())),
        _ => None,
    }
}

/// Classifies a freshly inserted task as ready, waiting, or dead on arrival.
fn route_new_task(
    state: &mut ManagerState,
    id: &TaskId,
    now: DateTime<Utc>,
    notifications: &mut Vec<Arc<Notify>>,
) {
    match deps::evaluate(&mut state.tasks, id) {
        DepCheck::Satisfied => {
            let priority = state.tasks.get_mut(id).map(|task| {
                task.state = TaskState::Queued;
                task.config.priority
            });
            if let Some(priority) = priority {
                state.queue.push(priority, id.clone());
            }
        }
        DepCheck::Pending => {
            if let Some(task) = state.tasks.get_mut(id) {
                task.state = TaskState::Waiting;
            }
        }
        DepCheck::Missing { dependency } => {
            warn!(task_id = %id, dependency = %dependency, "Dependency not found, task left waiting");
            if let Some(task) = state.tasks.get_mut(id) {
                task.state = TaskState::Waiting;
            }
        }
        DepCheck::Failed { dependency } => {
            cancel_locked(
                state,
                id,
                CancelReason::Dependency(dependency),
                now,
                notifications,
            );
        }
    }
}

/// Transitions a non-terminal task directly to `Cancelled` under the lock.
/// Collects its completion signal for notification after the lock drops.
fn cancel_locked(
    state: &mut ManagerState,
    id: &TaskId,
    reason: CancelReason,
    now: DateTime<Utc>,
    notifications: &mut Vec<Arc<Notify>>,
) {
    state.queue.remove(id);
    let done = match state.tasks.get_mut(id) {
        Some(task) if !task.state.is_terminal() => {
            task.state = TaskState::Cancelled;
            task.cancel_reason = Some(reason);
            task.end_time = Some(now);
            task.handle = None;
            Some(Arc::clone(&task.done))
        }
        _ => None,
    };
    if let Some(done) = done {
        state.stats.cancelled += 1;
        notifications.push(done);
    }
}

/// Re-evaluates the dependents of every task on the worklist, promoting
/// satisfied waiters to the ready queue and propagating failure
/// cancellations transitively. Returns whether anything was enqueued.
fn notify_dependents_locked(
    state: &mut ManagerState,
    root: &TaskId,
    now: DateTime<Utc>,
    notifications: &mut Vec<Arc<Notify>>,
) -> bool {
    let mut queued_any = false;
    let mut worklist = vec![root.clone()];

    while let Some(current) = worklist.pop() {
        let dependents: Vec<TaskId> = state
            .tasks
            .get(&current)
            .map(|task| task.dependents.iter().cloned().collect())
            .unwrap_or_default();

        for dep_id in dependents {
            let is_waiting = state
                .tasks
                .get(&dep_id)
                .map(|task| task.state == TaskState::Waiting)
                .unwrap_or(false);
            if !is_waiting {
                continue;
            }

            match deps::evaluate(&mut state.tasks, &dep_id) {
                DepCheck::Satisfied => {
                    let priority = state.tasks.get_mut(&dep_id).map(|task| {
                        task.state = TaskState::Queued;
                        task.config.priority
                    });
                    if let Some(priority) = priority {
                        state.queue.push(priority, dep_id.clone());
                        queued_any = true;
                    }
                }
                DepCheck::Failed { dependency } => {
                    cancel_locked(
                        state,
                        &dep_id,
                        CancelReason::Dependency(dependency),
                        now,
                        notifications,
                    );
                    worklist.push(dep_id);
                }
                DepCheck::Pending | DepCheck::Missing { .. } => {}
            }
        }
    }

    queued_any
}

fn notify_dependents(inner: &Arc<ManagerInner>, id: &TaskId) {
    let now = inner.clock.now();
    let mut notifications = Vec::new();
    let queued_any = {
        let mut state = inner.state.lock().expect("manager state poisoned");
        notify_dependents_locked(&mut state, id, now, &mut notifications)
    };
    for done in notifications {
        done.notify_waiters();
    }
    if queued_any {
        inner.wake.notify_one();
    }
}

/// Catches edge cases where a dependent's notification raced its
/// dependency's terminal transition.
fn recheck_waiting(inner: &Arc<ManagerInner>) {
    let now = inner.clock.now();
    let mut notifications = Vec::new();
    let queued_any = {
        let mut state = inner.state.lock().expect("manager state poisoned");
        let waiting: Vec<TaskId> = state
            .tasks
            .values()
            .filter(|task| task.state == TaskState::Waiting)
            .map(|task| task.id.clone())
            .collect();

        let mut queued_any = false;
        for id in waiting {
            let still_waiting = state
                .tasks
                .get(&id)
                .map(|task| task.state == TaskState::Waiting)
                .unwrap_or(false);
            if !still_waiting {
                continue;
            }
            match deps::evaluate(&mut state.tasks, &id) {
                DepCheck::Satisfied => {
                    let priority = state.tasks.get_mut(&id).map(|task| {
                        task.state = TaskState::Queued;
                        task.config.priority
                    });
                    if let Some(priority) = priority {
                        state.queue.push(priority, id.clone());
                        queued_any = true;
                    }
                }
                DepCheck::Failed { dependency } => {
                    cancel_locked(
                        &mut state,
                        &id,
                        CancelReason::Dependency(dependency),
                        now,
                        &mut notifications,
                    );
                    queued_any |=
                        notify_dependents_locked(&mut state, &id, now, &mut notifications);
                }
                DepCheck::Pending | DepCheck::Missing { .. } => {}
            }
        }
        queued_any
    };

    for done in notifications {
        done.notify_waiters();
    }
    if queued_any {
        inner.wake.notify_one();
    }
}

async fn scheduler_loop(inner: Arc<ManagerInner>, shutdown: CancellationToken) {
    info!("Scheduler loop started");

    loop {
        // Drain: claim a permit, then pop the highest-priority task and hand
        // both to a worker. Claiming before popping keeps dispatch
        // non-blocking while the queue retains excess work in priority
        // order; the gate stays the sole admission control.
        loop {
            let permit = match Arc::clone(&inner.semaphore).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let next = {
                let mut state = inner.state.lock().expect("manager state poisoned");
                state.queue.pop_highest()
            };
            match next {
                Some(id) => {
                    let worker_inner = Arc::clone(&inner);
                    tokio::spawn(async move {
                        execute(worker_inner, id, permit).await;
                    });
                }
                None => break,
            }
        }

        recheck_waiting(&inner);

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = inner.wake.notified() => {}
            _ = tokio::time::sleep(inner.config.poll_interval) => {}
        }
    }

    info!("Scheduler loop stopped");
}

/// Runs one attempt of one task with the permit claimed at dispatch.
async fn execute(
    inner: Arc<ManagerInner>,
    id: TaskId,
    permit: tokio::sync::OwnedSemaphorePermit,
) {
    let now = inner.clock.now();
    let token = CancellationToken::new();
    let mut notifications = Vec::new();
    let started = {
        let mut state = inner.state.lock().expect("manager state poisoned");
        if !inner.running.load(Ordering::SeqCst) {
            // Popped during shutdown: don't start work nobody will supervise.
            cancel_locked(&mut state, &id, CancelReason::Shutdown, now, &mut notifications);
            notify_dependents_locked(&mut state, &id, now, &mut notifications);
            None
        } else {
            match state.tasks.get_mut(&id) {
                Some(task) if task.state == TaskState::Queued => {
                    task.state = TaskState::Running;
                    task.start_time = Some(now);
                    task.end_time = None;
                    task.handle = Some(AttemptHandle {
                        cancel: token.clone(),
                        abort: None,
                    });
                    Some((Arc::clone(&task.work), task.config.clone(), task.name.clone()))
                }
                _ => None,
            }
        }
    };
    for done in notifications {
        done.notify_waiters();
    }
    let Some((work, config, name)) = started else {
        drop(permit);
        inner.wake.notify_one();
        return;
    };

    debug!(task_id = %id, name = %name, "Task started");

    // Each attempt gets a fresh computation from the factory.
    let fut = async move { work.run().await };

    let handle = match inner.watchdog.as_ref() {
        Some(watchdog) if config.enable_watchdog => {
            let watched = watchdog.watch(
                fut,
                Some(name),
                config.timeout,
                config.metadata.clone(),
                token.clone(),
            );
            let mut state = inner.state.lock().expect("manager state poisoned");
            if let Some(task) = state.tasks.get_mut(&id) {
                task.watchdog_id = Some(watched.id.clone());
                if let Some(attempt) = task.handle.as_mut() {
                    attempt.abort = Some(watched.handle.abort_handle());
                }
            }
            watched.handle
        }
        _ => {
            let join = tokio::spawn(run_with_cancel(fut, token.clone()));
            let mut state = inner.state.lock().expect("manager state poisoned");
            if let Some(task) = state.tasks.get_mut(&id) {
                if let Some(attempt) = task.handle.as_mut() {
                    attempt.abort = Some(join.abort_handle());
                }
            }
            join
        }
    };

    let settlement = match handle.await {
        Ok(settlement) => settlement,
        Err(join_err) if join_err.is_cancelled() => Settlement::Cancelled,
        Err(join_err) => Settlement::Failed(anyhow::anyhow!("work panicked: {join_err}")),
    };

    match settlement {
        Settlement::Completed(value) => on_completed(&inner, &id, value),
        Settlement::Failed(e) => on_failed(&inner, &id, e).await,
        Settlement::Cancelled => on_cancelled(&inner, &id),
    }

    drop(permit);
    // The freed permit may unblock the next queued task.
    inner.wake.notify_one();
}

fn on_completed(inner: &Arc<ManagerInner>, id: &TaskId, value: serde_json::Value) {
    let now = inner.clock.now();
    let settled = {
        let mut state = inner.state.lock().expect("manager state poisoned");
        let settled = match state.tasks.get_mut(id) {
            Some(task) if !task.state.is_terminal() => {
                task.state = TaskState::Completed;
                task.result = Some(value);
                task.end_time = Some(now);
                task.handle = None;
                Some((task.snapshot(), Arc::clone(&task.done)))
            }
            _ => None,
        };
        if settled.is_some() {
            state.stats.completed += 1;
        }
        settled
    };
    let Some((info, done)) = settled else { return };

    done.notify_waiters();
    debug!(
        task_id = %id,
        duration_ms = info.duration().unwrap_or(Duration::ZERO).as_millis() as u64,
        "Task completed"
    );
    fire_task_callbacks(&inner.on_complete, &info);
    notify_dependents(inner, id);
}

async fn on_failed(inner: &Arc<ManagerInner>, id: &TaskId, e: anyhow::Error) {
    let unrecoverable = e
        .downcast_ref::<WorkError>()
        .map(|we| !we.is_recoverable())
        .unwrap_or(false);
    let now = inner.clock.now();

    let retry = {
        let mut state = inner.state.lock().expect("manager state poisoned");
        let retry = match state.tasks.get_mut(id) {
            Some(task) if task.state == TaskState::Running && !unrecoverable && task.can_retry() => {
                task.retry_count += 1;
                task.state = TaskState::Retrying;
                task.handle = None;
                task.watchdog_id = None;
                Some((task.config.retry_delay, task.retry_count, task.config.max_retries))
            }
            _ => None,
        };
        if retry.is_some() {
            state.stats.retries += 1;
        }
        retry
    };

    if let Some((delay, attempt, max_retries)) = retry {
        warn!(
            task_id = %id,
            error = %e,
            retry = attempt,
            max_retries,
            "Task failed, scheduling retry"
        );
        tokio::time::sleep(delay).await;
        requeue_retry(inner, id);
        return;
    }

    let settled = {
        let mut state = inner.state.lock().expect("manager state poisoned");
        let settled = match state.tasks.get_mut(id) {
            Some(task) if !task.state.is_terminal() => {
                task.state = TaskState::Failed;
                task.error = Some(Arc::new(e));
                task.end_time = Some(now);
                task.handle = None;
                Some((task.snapshot(), Arc::clone(&task.done)))
            }
            _ => None,
        };
        if settled.is_some() {
            state.stats.failed += 1;
        }
        settled
    };
    let Some((info, done)) = settled else { return };

    done.notify_waiters();
    error!(
        task_id = %id,
        error = info.error.as_deref().unwrap_or("unknown"),
        unrecoverable,
        "Task failed"
    );
    fire_task_callbacks(&inner.on_failed, &info);
    notify_dependents(inner, id);
}

fn on_cancelled(inner: &Arc<ManagerInner>, id: &TaskId) {
    let now = inner.clock.now();
    let settled = {
        let mut state = inner.state.lock().expect("manager state poisoned");
        let settled = match state.tasks.get_mut(id) {
            Some(task) if !task.state.is_terminal() => {
                task.state = TaskState::Cancelled;
                task.end_time = Some(now);
                task.handle = None;
                if task.cancel_reason.is_none() {
                    task.cancel_reason = Some(CancelReason::User);
                }
                Some(Arc::clone(&task.done))
            }
            _ => None,
        };
        if settled.is_some() {
            state.stats.cancelled += 1;
        }
        settled
    };
    let Some(done) = settled else { return };

    done.notify_waiters();
    info!(task_id = %id, "Task cancelled");
    notify_dependents(inner, id);
}

/// Clears the per-attempt fields and puts a retrying task back on the ready
/// queue. If the manager stopped during the retry delay, the task is
/// cancelled instead of being parked on a queue nobody drains.
fn requeue_retry(inner: &Arc<ManagerInner>, id: &TaskId) {
    let now = inner.clock.now();
    let mut notifications = Vec::new();
    let mut requeued = false;
    {
        let mut state = inner.state.lock().expect("manager state poisoned");
        let is_retrying = state
            .tasks
            .get(id)
            .map(|task| task.state == TaskState::Retrying)
            .unwrap_or(false);
        if is_retrying {
            if inner.running.load(Ordering::SeqCst) {
                let priority = state.tasks.get_mut(id).map(|task| {
                    task.handle = None;
                    task.start_time = None;
                    task.end_time = None;
                    task.error = None;
                    task.state = TaskState::Queued;
                    task.config.priority
                });
                if let Some(priority) = priority {
                    state.queue.push(priority, id.clone());
                    requeued = true;
                }
            } else {
                cancel_locked(&mut state, id, CancelReason::Shutdown, now, &mut notifications);
                notify_dependents_locked(&mut state, id, now, &mut notifications);
            }
        }
    }

    for done in notifications {
        done.notify_waiters();
    }
    if requeued {
        inner.wake.notify_one();
        debug!(task_id = %id, "Task re-queued for retry");
    }
}

/// Translates a watchdog timeout report into a cooperative cancellation of
/// the matching running task.
fn on_watchdog_timeout(inner: &Arc<ManagerInner>, watch_id: &str, elapsed: Duration) {
    let token = {
        let mut state = inner.state.lock().expect("manager state poisoned");
        state
            .tasks
            .values_mut()
            .find(|task| {
                task.watchdog_id.as_deref() == Some(watch_id) && task.state == TaskState::Running
            })
            .and_then(|task| {
                task.cancel_reason = Some(CancelReason::WatchdogTimeout { elapsed });
                task.handle.as_ref().map(|h| h.cancel.clone())
            })
    };
    if let Some(token) = token {
        warn!(watch_id = %watch_id, elapsed_ms = elapsed.as_millis() as u64, "Cancelling task after watchdog timeout");
        token.cancel();
    }
}

fn fire_task_callbacks(list: &Mutex<Vec<TaskCallback>>, info: &TaskInfo) {
    let callbacks = list.lock().expect("callbacks poisoned").clone();
    for callback in callbacks {
        if catch_unwind(AssertUnwindSafe(|| callback(info))).is_err() {
            error!(task_id = %info.id, "Task callback panicked");
        }
    }
}

fn running_count(inner: &Arc<ManagerInner>) -> usize {
    let state = inner.state.lock().expect("manager state poisoned");
    state
        .tasks
        .values()
        .filter(|task| task.state == TaskState::Running)
        .count()
}

fn cancel_all_running(inner: &Arc<ManagerInner>) {
    let tokens: Vec<CancellationToken> = {
        let mut state = inner.state.lock().expect("manager state poisoned");
        state
            .tasks
            .values_mut()
            .filter(|task| task.state == TaskState::Running)
            .filter_map(|task| {
                if task.cancel_reason.is_none() {
                    task.cancel_reason = Some(CancelReason::Shutdown);
                }
                task.handle.as_ref().map(|h| h.cancel.clone())
            })
            .collect()
    };
    for token in tokens {
        token.cancel();
    }
}

fn abort_running(inner: &Arc<ManagerInner>) {
    let aborts: Vec<_> = {
        let state = inner.state.lock().expect("manager state poisoned");
        state
            .tasks
            .values()
            .filter(|task| task.state == TaskState::Running)
            .filter_map(|task| task.handle.as_ref().and_then(|h| h.abort.clone()))
            .collect()
    };
    for abort in aborts {
        abort.abort();
    }
}

async fn wait_until_drained(inner: &Arc<ManagerInner>, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if running_count(inner) == 0 {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
