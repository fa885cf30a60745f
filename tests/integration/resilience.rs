//! Fault isolation, cancellation, and shutdown.
//!
//! These tests verify that breakers stop calls to a failing dependency,
//! that cancellation behaves per lane, and that stopping the orchestrator
//! leaves every task with a terminal result.

use serde_json::json;
use std::time::Duration;

use taskhive::{
    Backoff, CancelOutcome, CircuitState, Config, FailureKind, HealthStatus, Orchestrator,
    RetryPolicy, TaskFailure, TaskId, TaskPayload, TaskSpec, TaskStatus,
};

use crate::fixtures::{cpu_sleep, fast_config, fixed_pool_config, io_sleep, started, Calls};

fn breaker_config() -> Config {
    Config {
        failure_threshold: 3,
        recovery_timeout_secs: 0.3,
        half_open_max_calls: 2,
        ..fast_config()
    }
}

async fn run_one(orchestrator: &Orchestrator, spec: TaskSpec) -> taskhive::TaskResult {
    let id = orchestrator.submit(spec).unwrap();
    orchestrator
        .get_results(&[id], Some(Duration::from_secs(5)))
        .await
        .unwrap()
        .remove(0)
}

async fn wait_for_status(orchestrator: &Orchestrator, id: TaskId, status: TaskStatus) {
    for _ in 0..100 {
        if orchestrator.status(id) == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {id} never reached {status}");
}

/// Test: Breaker opens, rejects, and recovers
/// Given failure_threshold=3 on dependency "payments"
/// When three calls fail
/// Then the next call fails with CircuitOpen without invoking the payload,
/// and after recovery_timeout two successful trials close the circuit
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_breaker_opens_and_recovers() {
    let orchestrator = started(breaker_config()).await;
    let failures = Calls::new();

    for _ in 0..3 {
        let result = run_one(&orchestrator, failures.failing("503").dependency("payments")).await;
        assert_eq!(result.error.unwrap().kind, FailureKind::Execution);
    }
    let rejected = run_one(&orchestrator, failures.failing("503").dependency("payments")).await;
    assert_eq!(rejected.status, TaskStatus::Failed);
    assert_eq!(rejected.error.unwrap().kind, FailureKind::CircuitOpen);
    assert_eq!(failures.count(), 3);

    let breaker = orchestrator.breakers().get("payments");
    assert_eq!(breaker.state(), CircuitState::Open);
    let report = orchestrator.health_check().await;
    assert_eq!(report.status, HealthStatus::Degraded);
    assert_eq!(
        report.component("breakers").unwrap().status,
        HealthStatus::Degraded
    );

    tokio::time::sleep(Duration::from_millis(400)).await;
    let successes = Calls::new();
    let first = run_one(&orchestrator, successes.succeeding().dependency("payments")).await;
    assert_eq!(first.status, TaskStatus::Completed);
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    let second = run_one(&orchestrator, successes.succeeding().dependency("payments")).await;
    assert_eq!(second.status, TaskStatus::Completed);
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(successes.count(), 2);

    orchestrator.stop().await.unwrap();
}

/// Test: Breakers isolate dependencies
/// Given "crm" is open
/// When a task calls "ads" through its context
/// Then the call goes through
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_breakers_are_per_dependency() {
    let orchestrator = started(breaker_config()).await;
    let calls = Calls::new();
    for _ in 0..3 {
        run_one(&orchestrator, calls.failing("timeout").dependency("crm")).await;
    }
    assert_eq!(
        orchestrator.breakers().get("crm").state(),
        CircuitState::Open
    );

    let spec = TaskSpec::new(TaskPayload::future(|ctx| async move {
        let clicks: i32 = ctx.call("ads", async { Ok::<_, String>(42) }).await?;
        Ok::<_, TaskFailure>(json!(clicks))
    }));
    let result = run_one(&orchestrator, spec).await;
    assert_eq!(result.value, Some(json!(42)));
    assert_eq!(
        orchestrator.breakers().get("ads").state(),
        CircuitState::Closed
    );

    orchestrator.stop().await.unwrap();
}

/// Test: Cancelling a queued task
/// Given a task stuck behind a busy CPU worker
/// When it is cancelled
/// Then it is dequeued, recorded CANCELLED, and never invoked
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_queued_task() {
    let orchestrator = started(fixed_pool_config()).await;
    let calls = Calls::new();

    orchestrator.submit(cpu_sleep(300)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let queued = orchestrator.submit(calls.succeeding()).unwrap();
    assert_eq!(orchestrator.status(queued), Some(TaskStatus::Queued));

    assert_eq!(orchestrator.cancel(queued).unwrap(), CancelOutcome::Dequeued);
    let result = orchestrator.get_results(&[queued], None).await.unwrap().remove(0);
    assert_eq!(result.status, TaskStatus::Cancelled);
    assert_eq!(result.attempts, 0);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(calls.count(), 0);
    assert_eq!(
        orchestrator.cancel(queued).unwrap(),
        CancelOutcome::AlreadyTerminal
    );

    orchestrator.stop().await.unwrap();
}

/// Test: Cancelling a running I/O task
/// Given an I/O task that would sleep for 10s
/// When it is cancelled while running
/// Then it stops at its next suspension point and is recorded CANCELLED
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_running_io_task() {
    let orchestrator = started(fast_config()).await;
    let id = orchestrator.submit(io_sleep(10_000)).unwrap();
    wait_for_status(&orchestrator, id, TaskStatus::Running).await;

    assert_eq!(orchestrator.cancel(id).unwrap(), CancelOutcome::Signalled);
    let result = orchestrator
        .get_results(&[id], Some(Duration::from_secs(2)))
        .await
        .unwrap()
        .remove(0);
    assert_eq!(result.status, TaskStatus::Cancelled);
    assert_eq!(result.error.unwrap().kind, FailureKind::Cancelled);

    orchestrator.stop().await.unwrap();
}

/// Test: Running CPU tasks are not cancellable
/// Given a running CPU task
/// When it is cancelled
/// Then the call reports NotCancellable and the task completes normally
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_running_cpu_task_is_refused() {
    let orchestrator = started(fast_config()).await;
    let id = orchestrator.submit(cpu_sleep(200)).unwrap();
    wait_for_status(&orchestrator, id, TaskStatus::Running).await;

    assert_eq!(
        orchestrator.cancel(id).unwrap(),
        CancelOutcome::NotCancellable
    );
    let result = orchestrator
        .get_results(&[id], Some(Duration::from_secs(2)))
        .await
        .unwrap()
        .remove(0);
    assert_eq!(result.status, TaskStatus::Completed);

    orchestrator.stop().await.unwrap();
}

/// Test: Cancelling a task waiting out its backoff
/// Given a failed task scheduled to retry in 10s
/// When it is cancelled
/// Then it is recorded CANCELLED after its single attempt
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_during_retry_backoff() {
    let orchestrator = started(fast_config()).await;
    let calls = Calls::new();
    let retry = RetryPolicy::attempts(3).with_backoff(Backoff::fixed(Duration::from_secs(10)));
    let id = orchestrator.submit(calls.failing("flaky").retry(retry)).unwrap();

    for _ in 0..100 {
        if calls.count() == 1 && orchestrator.status(id) == Some(TaskStatus::Queued) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(orchestrator.cancel(id).unwrap(), CancelOutcome::Dequeued);

    let result = orchestrator.get_results(&[id], None).await.unwrap().remove(0);
    assert_eq!(result.status, TaskStatus::Cancelled);
    assert_eq!(result.attempts, 1);
    assert_eq!(calls.count(), 1);

    orchestrator.stop().await.unwrap();
}

/// Test: Stop leaves every task terminal
/// Given a CPU task running past the shutdown grace, a task queued behind it,
/// and a long I/O task
/// When the orchestrator stops
/// Then the queued task is CANCELLED and the running ones are lost
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_finalizes_everything() {
    let config = Config {
        shutdown_grace_secs: 0.2,
        ..fixed_pool_config()
    };
    let orchestrator = started(config).await;

    let running = orchestrator.submit(cpu_sleep(600)).unwrap();
    let long_io = orchestrator.submit(io_sleep(5_000)).unwrap();
    wait_for_status(&orchestrator, running, TaskStatus::Running).await;
    wait_for_status(&orchestrator, long_io, TaskStatus::Running).await;
    let queued = orchestrator
        .submit(TaskSpec::new(TaskPayload::blocking(|| {
            Err(TaskFailure::execution("should never run"))
        })))
        .unwrap();

    orchestrator.stop().await.unwrap();

    let results = orchestrator
        .get_results(&[running, long_io, queued], Some(Duration::from_secs(1)))
        .await
        .unwrap();
    for result in &results[..2] {
        assert_eq!(result.status, TaskStatus::Failed);
        let error = result.error.as_ref().unwrap();
        assert_eq!(error.kind, FailureKind::WorkerLost);
        assert_eq!(error.message, "worker terminated at shutdown");
    }
    assert_eq!(results[2].status, TaskStatus::Cancelled);
    assert_eq!(
        results[2].error.as_ref().unwrap().message,
        "orchestrator shutdown"
    );
    assert_eq!(orchestrator.health_check().await.status, HealthStatus::Unhealthy);
}
