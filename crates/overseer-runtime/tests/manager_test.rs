use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use overseer_core::config::{SchedulerConfig, WatchdogConfig};
use overseer_core::error::{TaskError, WorkError};
use overseer_core::models::{Priority, TaskConfig, TaskState};
use overseer_runtime::TaskManager;

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn manager_with(max_concurrent: usize) -> TaskManager {
    init_logging();
    TaskManager::new(SchedulerConfig {
        max_concurrent_tasks: max_concurrent,
        watchdog: WatchdogConfig {
            check_interval: Duration::from_millis(25),
            ..WatchdogConfig::default()
        },
        ..SchedulerConfig::default()
    })
}

/// Submitting a simple computation and waiting yields its result.
#[tokio::test]
async fn test_submit_and_wait_returns_result() {
    let manager = manager_with(5);
    manager.start().await;

    let id = manager
        .submit_fn(Some("simple-addition"), TaskConfig::default(), || async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(json!(10 + 20))
        })
        .unwrap();

    let result = manager.wait(&id, Some(Duration::from_secs(2))).await.unwrap();
    assert_eq!(result, json!(30));

    let info = manager.task_info(&id).unwrap();
    assert_eq!(info.state, TaskState::Completed);
    assert_eq!(info.result, Some(json!(30)));

    let stats = manager.stats();
    assert_eq!(stats.total_submitted, 1);
    assert_eq!(stats.total_completed, 1);
    assert_eq!(stats.current_running, 0);

    manager.stop(true).await;
}

/// A work body failing twice then succeeding completes within its retry
/// budget, with the retry counters reflecting the two extra attempts.
#[tokio::test]
async fn test_retry_then_success() {
    let manager = manager_with(5);
    manager.start().await;

    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_for_work = Arc::clone(&attempts);
    let config = TaskConfig {
        max_retries: 3,
        retry_delay: Duration::from_millis(100),
        ..TaskConfig::default()
    };
    let id = manager
        .submit_fn(Some("retry-task"), config, move || {
            let attempts = Arc::clone(&attempts_for_work);
            async move {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(Duration::from_millis(20)).await;
                if attempt < 3 {
                    Err(anyhow::anyhow!("attempt {} failed", attempt))
                } else {
                    Ok(json!("ok"))
                }
            }
        })
        .unwrap();

    let result = manager.wait(&id, Some(Duration::from_secs(5))).await.unwrap();
    assert_eq!(result, json!("ok"));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let info = manager.task_info(&id).unwrap();
    assert_eq!(info.state, TaskState::Completed);
    assert_eq!(info.retry_count, 2);

    let stats = manager.stats();
    assert_eq!(stats.total_retries, 2);
    assert_eq!(stats.total_completed, 1);
    assert_eq!(stats.total_failed, 0);

    manager.stop(true).await;
}

/// A work body that always fails exhausts its retries and surfaces the
/// original error unchanged, after max_retries + 1 attempts.
#[tokio::test]
async fn test_retry_exhausted_fails_with_original_error() {
    let manager = manager_with(5);
    manager.start().await;

    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_for_work = Arc::clone(&attempts);
    let config = TaskConfig {
        max_retries: 2,
        retry_delay: Duration::from_millis(50),
        ..TaskConfig::default()
    };
    let id = manager
        .submit_fn(Some("always-failing"), config, move || {
            let attempts = Arc::clone(&attempts_for_work);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err::<Value, _>(anyhow::anyhow!("nope"))
            }
        })
        .unwrap();

    let err = manager
        .wait(&id, Some(Duration::from_secs(5)))
        .await
        .unwrap_err();
    match err {
        TaskError::Failed(source) => assert_eq!(source.to_string(), "nope"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let info = manager.task_info(&id).unwrap();
    assert_eq!(info.state, TaskState::Failed);
    assert_eq!(info.retry_count, 2);
    assert_eq!(manager.stats().total_failed, 1);

    manager.stop(true).await;
}

/// An unrecoverable work error bypasses the retry budget entirely.
#[tokio::test]
async fn test_unrecoverable_error_skips_retries() {
    let manager = manager_with(5);
    manager.start().await;

    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_for_work = Arc::clone(&attempts);
    let config = TaskConfig {
        max_retries: 5,
        retry_delay: Duration::from_millis(10),
        ..TaskConfig::default()
    };
    let id = manager
        .submit_fn(Some("bad-config"), config, move || {
            let attempts = Arc::clone(&attempts_for_work);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<Value, _>(WorkError::unrecoverable(anyhow::anyhow!("missing credentials")).into())
            }
        })
        .unwrap();

    let err = manager
        .wait(&id, Some(Duration::from_secs(2)))
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::Failed(_)));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    let info = manager.task_info(&id).unwrap();
    assert_eq!(info.state, TaskState::Failed);
    assert_eq!(info.retry_count, 0);

    manager.stop(true).await;
}

/// A dependent task starts only after all its dependencies completed.
#[tokio::test]
async fn test_dependencies_gate_start() {
    let manager = manager_with(5);
    manager.start().await;

    let sleeper = || async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(Value::Null)
    };
    let a = manager.submit_fn(Some("dep-a"), TaskConfig::default(), sleeper).unwrap();
    let b = manager.submit_fn(Some("dep-b"), TaskConfig::default(), sleeper).unwrap();

    let config = TaskConfig {
        dependencies: vec![a.clone(), b.clone()],
        ..TaskConfig::default()
    };
    let c = manager
        .submit_fn(Some("dependent"), config, || async { Ok(json!("c")) })
        .unwrap();

    manager.wait(&c, Some(Duration::from_secs(5))).await.unwrap();

    let a_info = manager.task_info(&a).unwrap();
    let b_info = manager.task_info(&b).unwrap();
    let c_info = manager.task_info(&c).unwrap();
    assert_eq!(c_info.state, TaskState::Completed);

    let latest_dep_end = a_info.end_time.unwrap().max(b_info.end_time.unwrap());
    assert!(c_info.start_time.unwrap() >= latest_dep_end);

    manager.stop(true).await;
}

/// A dependency failure cancels the dependent without ever running it, and
/// the cancellation propagates transitively.
#[tokio::test]
async fn test_dependency_failure_propagates() {
    let manager = manager_with(5);
    manager.start().await;

    let a = manager
        .submit_fn(Some("failing-dep"), TaskConfig::default(), || async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err::<Value, _>(anyhow::anyhow!("dependency failed"))
        })
        .unwrap();

    let b = manager
        .submit_fn(
            Some("dependent"),
            TaskConfig {
                dependencies: vec![a.clone()],
                ..TaskConfig::default()
            },
            || async { Ok(json!("should not run")) },
        )
        .unwrap();
    let c = manager
        .submit_fn(
            Some("transitive-dependent"),
            TaskConfig {
                dependencies: vec![b.clone()],
                ..TaskConfig::default()
            },
            || async { Ok(json!("should not run either")) },
        )
        .unwrap();

    let b_err = manager
        .wait(&b, Some(Duration::from_secs(2)))
        .await
        .unwrap_err();
    assert!(matches!(b_err, TaskError::DependencyFailed(ref dep) if *dep == a));

    let c_err = manager
        .wait(&c, Some(Duration::from_secs(2)))
        .await
        .unwrap_err();
    assert!(matches!(c_err, TaskError::DependencyFailed(ref dep) if *dep == b));

    let b_info = manager.task_info(&b).unwrap();
    assert_eq!(b_info.state, TaskState::Cancelled);
    assert!(b_info.start_time.is_none(), "dependent must never run");
    assert_eq!(manager.task_info(&c).unwrap().state, TaskState::Cancelled);

    manager.stop(true).await;
}

/// Submitting against an already-failed dependency cancels immediately.
#[tokio::test]
async fn test_submit_on_failed_dependency_is_dead_on_arrival() {
    let manager = manager_with(5);
    manager.start().await;

    let a = manager
        .submit_fn(Some("instant-failure"), TaskConfig::default(), || async {
            Err::<Value, _>(anyhow::anyhow!("boom"))
        })
        .unwrap();
    let _ = manager.wait(&a, Some(Duration::from_secs(2))).await;

    let b = manager
        .submit_fn(
            Some("late-dependent"),
            TaskConfig {
                dependencies: vec![a.clone()],
                ..TaskConfig::default()
            },
            || async { Ok(Value::Null) },
        )
        .unwrap();

    // No scheduling round-trip needed: the submission itself settles it.
    assert_eq!(manager.task_info(&b).unwrap().state, TaskState::Cancelled);
    let err = manager.wait(&b, None).await.unwrap_err();
    assert!(matches!(err, TaskError::DependencyFailed(ref dep) if *dep == a));

    manager.stop(true).await;
}

/// With cancel_on_dependency_failure disabled, a task whose dependency
/// failed simply stays waiting.
#[tokio::test]
async fn test_dependency_failure_without_cancel_flag_keeps_waiting() {
    let manager = manager_with(5);
    manager.start().await;

    let a = manager
        .submit_fn(Some("failing-dep"), TaskConfig::default(), || async {
            Err::<Value, _>(anyhow::anyhow!("boom"))
        })
        .unwrap();
    let b = manager
        .submit_fn(
            Some("stubborn-dependent"),
            TaskConfig {
                dependencies: vec![a.clone()],
                cancel_on_dependency_failure: false,
                ..TaskConfig::default()
            },
            || async { Ok(Value::Null) },
        )
        .unwrap();

    let _ = manager.wait(&a, Some(Duration::from_secs(2))).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(manager.task_info(&b).unwrap().state, TaskState::Waiting);

    manager.stop(true).await;
}

/// The concurrency gate caps simultaneous execution: with a cap of 3 and 10
/// tasks of 200ms each, the peak is exactly 3 and the batch takes at least
/// ceil(10/3) * 200ms.
#[tokio::test]
async fn test_concurrency_cap() {
    let manager = manager_with(3);
    manager.start().await;

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let started_at = Instant::now();

    let mut ids = Vec::new();
    for i in 0..10 {
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        let name = format!("burst-{i}");
        let id = manager
            .submit_fn(Some(name.as_str()), TaskConfig::default(), move || {
                let current = Arc::clone(&current);
                let peak = Arc::clone(&peak);
                async move {
                    let now_running = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now_running, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            })
            .unwrap();
        ids.push(id);
    }

    for id in &ids {
        manager.wait(id, Some(Duration::from_secs(10))).await.unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), 3);
    assert!(started_at.elapsed() >= Duration::from_millis(800));
    assert_eq!(manager.stats().total_completed, 10);

    manager.stop(true).await;
}

/// Tasks that become ready at the same instant dispatch highest priority
/// first.
#[tokio::test]
async fn test_priority_dispatch_order() {
    let manager = manager_with(1);
    manager.start().await;

    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let gate = manager
        .submit_fn(Some("gate"), TaskConfig::default(), || async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(Value::Null)
        })
        .unwrap();

    let mut ids = Vec::new();
    for (priority, label) in [
        (Priority::Low, "low"),
        (Priority::Critical, "critical"),
        (Priority::Normal, "normal"),
        (Priority::High, "high"),
    ] {
        let order = Arc::clone(&order);
        let config = TaskConfig {
            priority,
            dependencies: vec![gate.clone()],
            ..TaskConfig::default()
        };
        let id = manager
            .submit_fn(Some(label), config, move || {
                let order = Arc::clone(&order);
                async move {
                    order.lock().unwrap().push(label);
                    Ok(Value::Null)
                }
            })
            .unwrap();
        ids.push(id);
    }

    for id in &ids {
        manager.wait(id, Some(Duration::from_secs(5))).await.unwrap();
    }

    assert_eq!(
        order.lock().unwrap().as_slice(),
        &["critical", "high", "normal", "low"]
    );

    manager.stop(true).await;
}

/// Within one priority level, dispatch is strictly FIFO.
#[tokio::test]
async fn test_fifo_within_priority_level() {
    let manager = manager_with(1);
    manager.start().await;

    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let _blocker = manager
        .submit_fn(Some("blocker"), TaskConfig::default(), || async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            Ok(Value::Null)
        })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut ids = Vec::new();
    for label in ["first", "second"] {
        let order = Arc::clone(&order);
        let id = manager
            .submit_fn(Some(label), TaskConfig::default(), move || {
                let order = Arc::clone(&order);
                async move {
                    order.lock().unwrap().push(label);
                    Ok(Value::Null)
                }
            })
            .unwrap();
        ids.push(id);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    for id in &ids {
        manager.wait(id, Some(Duration::from_secs(5))).await.unwrap();
    }
    assert_eq!(order.lock().unwrap().as_slice(), &["first", "second"]);

    manager.stop(true).await;
}

/// Cancelling a running task signals it cooperatively; the task transitions
/// to Cancelled and `wait` surfaces the cancellation.
#[tokio::test]
async fn test_cancel_running_task() {
    let manager = manager_with(5);
    manager.start().await;

    let id = manager
        .submit_fn(Some("long-runner"), TaskConfig::default(), || async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        })
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.task_info(&id).unwrap().state, TaskState::Running);
    assert!(manager.cancel(&id));

    let err = manager
        .wait(&id, Some(Duration::from_secs(2)))
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::Cancelled(_)));

    let info = manager.task_info(&id).unwrap();
    assert_eq!(info.state, TaskState::Cancelled);
    assert!(info.start_time.is_some());

    // Terminal states are absorbing.
    assert!(!manager.cancel(&id));
    assert_eq!(manager.stats().total_cancelled, 1);

    manager.stop(true).await;
}

/// Cancelling a queued task removes it from the queue before it ever runs.
#[tokio::test]
async fn test_cancel_queued_task() {
    let manager = manager_with(1);
    manager.start().await;

    let _blocker = manager
        .submit_fn(Some("blocker"), TaskConfig::default(), || async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(Value::Null)
        })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let queued = manager
        .submit_fn(Some("queued"), TaskConfig::default(), || async {
            Ok(json!("never"))
        })
        .unwrap();
    assert_eq!(manager.task_info(&queued).unwrap().state, TaskState::Queued);

    assert!(manager.cancel(&queued));
    let info = manager.task_info(&queued).unwrap();
    assert_eq!(info.state, TaskState::Cancelled);
    assert!(info.start_time.is_none());

    // The blocker still completes untouched.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(manager.stats().total_completed, 1);

    manager.stop(true).await;
}

/// A `wait` deadline affects only the caller, never the task.
#[tokio::test]
async fn test_wait_timeout_leaves_task_untouched() {
    let manager = manager_with(5);
    manager.start().await;

    let id = manager
        .submit_fn(Some("slow"), TaskConfig::default(), || async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(json!("eventually"))
        })
        .unwrap();

    let err = manager
        .wait(&id, Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::WaitTimeout { .. }));

    let result = manager.wait(&id, Some(Duration::from_secs(2))).await.unwrap();
    assert_eq!(result, json!("eventually"));

    manager.stop(true).await;
}

/// Complete and failed callbacks fire for the matching outcomes, in
/// registration order, and a panicking callback never disturbs the others.
#[tokio::test]
async fn test_callbacks() {
    let manager = manager_with(5);
    manager.start().await;

    let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let events = Arc::clone(&events);
        manager.add_complete_callback(move |info| {
            events.lock().unwrap().push(format!("first:{}", info.name));
        });
    }
    manager.add_complete_callback(|_| panic!("misbehaving callback"));
    {
        let events = Arc::clone(&events);
        manager.add_complete_callback(move |info| {
            events.lock().unwrap().push(format!("second:{}", info.name));
        });
    }
    let failures: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let failures = Arc::clone(&failures);
        manager.add_failed_callback(move |info| {
            failures.lock().unwrap().push(info.name.clone());
        });
    }

    let ok = manager
        .submit_fn(Some("ok-task"), TaskConfig::default(), || async {
            Ok(Value::Null)
        })
        .unwrap();
    let bad = manager
        .submit_fn(Some("bad-task"), TaskConfig::default(), || async {
            Err::<Value, _>(anyhow::anyhow!("failure"))
        })
        .unwrap();

    manager.wait(&ok, Some(Duration::from_secs(2))).await.unwrap();
    let _ = manager.wait(&bad, Some(Duration::from_secs(2))).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        events.lock().unwrap().as_slice(),
        &["first:ok-task".to_string(), "second:ok-task".to_string()]
    );
    assert_eq!(failures.lock().unwrap().as_slice(), &["bad-task".to_string()]);

    manager.stop(true).await;
}

/// Statistics counters are conserved across a mixed batch of outcomes.
#[tokio::test]
async fn test_stats_conservation() {
    let manager = manager_with(5);
    manager.start().await;

    let mut ids = Vec::new();
    for i in 0..3 {
        let name = format!("ok-{i}");
        ids.push(
            manager
                .submit_fn(Some(name.as_str()), TaskConfig::default(), || async {
                    Ok(Value::Null)
                })
                .unwrap(),
        );
    }
    let failing = manager
        .submit_fn(
            Some("failing"),
            TaskConfig {
                max_retries: 1,
                retry_delay: Duration::from_millis(20),
                ..TaskConfig::default()
            },
            || async { Err::<Value, _>(anyhow::anyhow!("always")) },
        )
        .unwrap();
    let doomed = manager
        .submit_fn(Some("doomed"), TaskConfig::default(), || async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        })
        .unwrap();

    for id in &ids {
        manager.wait(id, Some(Duration::from_secs(2))).await.unwrap();
    }
    let _ = manager.wait(&failing, Some(Duration::from_secs(2))).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(manager.cancel(&doomed));
    let _ = manager.wait(&doomed, Some(Duration::from_secs(2))).await;

    let stats = manager.stats();
    assert_eq!(stats.total_submitted, 5);
    assert_eq!(stats.total_completed, 3);
    assert_eq!(stats.total_failed, 1);
    assert_eq!(stats.total_cancelled, 1);
    assert_eq!(stats.total_retries, 1);
    assert_eq!(
        stats.total_submitted,
        stats.total_completed + stats.total_failed + stats.total_cancelled
    );
    assert_eq!(stats.current_running, 0);
    assert_eq!(stats.current_queued, 0);
    assert_eq!(stats.current_waiting, 0);

    manager.stop(true).await;
}

/// After stop(cancel_running = true) returns, nothing is left running and
/// new submissions are rejected.
#[tokio::test]
async fn test_stop_cancels_running_tasks() {
    let manager = manager_with(2);
    manager.start().await;

    for i in 0..4 {
        let name = format!("sleeper-{i}");
        manager
            .submit_fn(Some(name.as_str()), TaskConfig::default(), || async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Value::Null)
            })
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.stats().current_running, 2);

    manager.stop(true).await;

    assert!(manager.tasks_by_state(TaskState::Running).is_empty());
    assert!(!manager.is_running());
    let result = manager.submit_fn(None, TaskConfig::default(), || async { Ok(Value::Null) });
    assert!(matches!(result, Err(TaskError::NotRunning)));
}

/// stop(cancel_running = false) waits for in-flight work instead of
/// cancelling it.
#[tokio::test]
async fn test_stop_waits_for_running_tasks() {
    let manager = manager_with(5);
    manager.start().await;

    let id = manager
        .submit_fn(Some("short"), TaskConfig::default(), || async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(json!("finished"))
        })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    manager.stop(false).await;

    let info = manager.task_info(&id).unwrap();
    assert_eq!(info.state, TaskState::Completed);
    assert_eq!(manager.stats().total_completed, 1);
}

/// The manager can be stopped and started again.
#[tokio::test]
async fn test_restart() {
    let manager = manager_with(5);
    manager.start().await;

    let first = manager
        .submit_fn(None, TaskConfig::default(), || async { Ok(json!(1)) })
        .unwrap();
    manager.wait(&first, Some(Duration::from_secs(2))).await.unwrap();
    manager.stop(false).await;

    manager.start().await;
    let second = manager
        .submit_fn(None, TaskConfig::default(), || async { Ok(json!(2)) })
        .unwrap();
    let result = manager.wait(&second, Some(Duration::from_secs(2))).await.unwrap();
    assert_eq!(result, json!(2));
    assert_eq!(manager.stats().total_submitted, 2);

    manager.stop(true).await;
}

/// Submission metadata is surfaced on task snapshots.
#[tokio::test]
async fn test_metadata_surfaced_in_snapshots() {
    let manager = manager_with(5);
    manager.start().await;

    let mut config = TaskConfig::default();
    config.metadata.insert("source".to_string(), json!("ingest"));
    let id = manager
        .submit_fn(Some("tagged"), config, || async { Ok(Value::Null) })
        .unwrap();
    manager.wait(&id, Some(Duration::from_secs(2))).await.unwrap();

    let info = manager.task_info(&id).unwrap();
    assert_eq!(info.metadata.get("source"), Some(&json!("ingest")));

    manager.stop(true).await;
}
