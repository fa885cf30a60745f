//! End-to-end submit and gather scenarios.
//!
//! These tests run real payloads through the orchestrator and check the
//! results callers see: values, terminal statuses, and attempt counts.

use serde_json::json;
use std::time::Duration;

use taskhive::{
    Backoff, Classification, Error, FailureKind, Orchestrator, RetryPolicy, TaskFailure,
    TaskPayload, TaskSpec, TaskStatus,
};

use crate::fixtures::{cpu_sleep, fast_config, io_sleep, square, started, Calls};

/// Test: Squares complete in submission order
/// Given five `n*n` tasks and two workers
/// When results are gathered with a 10s timeout
/// Then every task is COMPLETED and values follow submission order
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_squares_complete_in_submission_order() {
    let orchestrator = started(fast_config()).await;

    let ids = orchestrator
        .submit_many((1..=5).map(square).collect())
        .unwrap();
    let results = orchestrator
        .get_results(&ids, Some(Duration::from_secs(10)))
        .await
        .unwrap();

    assert_eq!(results.len(), 5);
    assert!(results.iter().all(|r| r.status == TaskStatus::Completed));
    let values: Vec<_> = results.iter().map(|r| r.value.clone().unwrap()).collect();
    assert_eq!(
        values,
        vec![json!(1), json!(4), json!(9), json!(16), json!(25)]
    );
    for (result, id) in results.iter().zip(&ids) {
        assert_eq!(result.task_id, *id);
        assert_eq!(result.attempts, 1);
    }

    orchestrator.stop().await.unwrap();
}

/// Test: Always-failing task exhausts its attempts
/// Given a payload that always fails and max_attempts=3
/// When the task settles
/// Then it is FAILED with attempt count 3 and was invoked exactly 3 times
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_always_failing_task_exhausts_attempts() {
    let orchestrator = started(fast_config()).await;
    let calls = Calls::new();

    let retry = RetryPolicy::attempts(3).with_backoff(Backoff::fixed(Duration::from_millis(20)));
    let id = orchestrator
        .submit(calls.failing("upstream refused").retry(retry))
        .unwrap();
    let result = orchestrator
        .get_results(&[id], Some(Duration::from_secs(10)))
        .await
        .unwrap()
        .remove(0);

    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.attempts, 3);
    assert_eq!(calls.count(), 3);
    let error = result.error.unwrap();
    assert_eq!(error.kind, FailureKind::Execution);
    assert_eq!(error.message, "upstream refused");
    assert_eq!(orchestrator.get_stats().await.totals.retried, 2);

    orchestrator.stop().await.unwrap();
}

/// Test: Flaky task recovers on retry
/// Given a payload that fails once then succeeds
/// When it runs with max_attempts=3
/// Then it is COMPLETED after exactly 2 attempts
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_flaky_task_recovers_on_retry() {
    let orchestrator = started(fast_config()).await;
    let calls = Calls::new();

    let retry = RetryPolicy::attempts(3).with_backoff(Backoff::exponential(
        Duration::from_millis(10),
        2.0,
        Duration::from_millis(50),
    ));
    let id = orchestrator.submit(calls.flaky(2).retry(retry)).unwrap();
    let result = orchestrator
        .get_results(&[id], Some(Duration::from_secs(10)))
        .await
        .unwrap()
        .remove(0);

    assert_eq!(result.status, TaskStatus::Completed);
    assert_eq!(result.attempts, 2);
    assert_eq!(result.value, Some(json!(2)));

    orchestrator.stop().await.unwrap();
}

/// Test: Slow I/O task times out
/// Given timeout=1s and a payload that sleeps 5s
/// When results are gathered
/// Then the task is TIMED_OUT well before the payload would have finished
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_task_times_out() {
    let orchestrator = started(fast_config()).await;

    let started_at = std::time::Instant::now();
    let id = orchestrator
        .submit(io_sleep(5_000).timeout(Duration::from_secs(1)))
        .unwrap();
    let result = orchestrator
        .get_results(&[id], Some(Duration::from_secs(10)))
        .await
        .unwrap()
        .remove(0);

    assert_eq!(result.status, TaskStatus::TimedOut);
    assert_eq!(result.error.unwrap().kind, FailureKind::Timeout);
    assert!(started_at.elapsed() < Duration::from_secs(4));

    orchestrator.stop().await.unwrap();
}

/// Test: Blocking task times out and frees its worker
/// Given a CPU task that sleeps past its timeout
/// When a second CPU task is submitted behind it
/// Then the first is TIMED_OUT and the second still completes promptly
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_blocking_timeout_frees_worker() {
    let orchestrator = started(fast_config()).await;

    let slow = orchestrator
        .submit(cpu_sleep(800).timeout(Duration::from_millis(100)))
        .unwrap();
    let next = orchestrator.submit(square(9)).unwrap();
    let results = orchestrator
        .get_results(&[slow, next], Some(Duration::from_millis(600)))
        .await
        .unwrap();

    assert_eq!(results[0].status, TaskStatus::TimedOut);
    assert_eq!(results[1].status, TaskStatus::Completed);
    assert_eq!(results[1].value, Some(json!(81)));

    orchestrator.stop().await.unwrap();
}

/// Test: CPU-bound async task is held to its timeout
/// Given an async payload classified CPU-bound that blocks its thread for 1.5s
/// When it runs with timeout=200ms
/// Then it is TIMED_OUT long before the payload returns
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cpu_bound_async_task_times_out() {
    let orchestrator = started(fast_config()).await;
    let spec = TaskSpec::new(TaskPayload::future(|_ctx| async {
        std::thread::sleep(Duration::from_millis(1500));
        Ok(json!("too late"))
    }))
    .classification(Classification::CpuBound)
    .timeout(Duration::from_millis(200));

    let started_at = std::time::Instant::now();
    let id = orchestrator.submit(spec).unwrap();
    let results = orchestrator
        .get_results(&[id], Some(Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(results[0].status, TaskStatus::TimedOut);
    assert!(started_at.elapsed() < Duration::from_millis(1200));

    orchestrator.stop().await.unwrap();
}

/// Test: get_results is idempotent
/// Given a task whose result has already been retrieved
/// When get_results is called again
/// Then the same terminal result comes back
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_get_results_is_idempotent() {
    let orchestrator = started(fast_config()).await;
    let ids = orchestrator.submit_many(vec![square(3), square(4)]).unwrap();

    let first = orchestrator.get_results(&ids, None).await.unwrap();
    let second = orchestrator.get_results(&ids, None).await.unwrap();
    let reversed: Vec<_> = ids.iter().rev().copied().collect();
    let third = orchestrator.get_results(&reversed, None).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(third[0], first[1]);
    assert_eq!(third[1], first[0]);

    orchestrator.stop().await.unwrap();
}

/// Test: Partial results on timeout
/// Given one slow and one fast task
/// When get_results times out before the slow one finishes
/// Then the slow one comes back non-terminal and the fast one COMPLETED
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_partial_results_on_timeout() {
    let orchestrator = started(fast_config()).await;
    let slow = orchestrator.submit(io_sleep(1_000)).unwrap();
    let fast = orchestrator.submit(io_sleep(10)).unwrap();

    let partial = orchestrator
        .get_results(&[slow, fast], Some(Duration::from_millis(300)))
        .await
        .unwrap();
    assert!(!partial[0].is_terminal());
    assert!(matches!(
        partial[0].status,
        TaskStatus::Queued | TaskStatus::Running
    ));
    assert_eq!(partial[1].status, TaskStatus::Completed);

    let full = orchestrator
        .get_results(&[slow, fast], Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert!(full.iter().all(|r| r.status == TaskStatus::Completed));

    orchestrator.stop().await.unwrap();
}

/// Test: map returns results in item order
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_map_preserves_item_order() {
    let orchestrator = started(fast_config()).await;

    let results = orchestrator
        .map(
            |n: i64| {
                if n < 0 {
                    Err(TaskFailure::execution("negative input"))
                } else {
                    Ok(json!(n * 10))
                }
            },
            vec![3, -1, 7, 0],
        )
        .await
        .unwrap();

    let statuses: Vec<_> = results.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Completed,
            TaskStatus::Completed
        ]
    );
    assert_eq!(results[0].value, Some(json!(30)));
    assert_eq!(results[2].value, Some(json!(70)));
    assert_eq!(results[3].value, Some(json!(0)));

    orchestrator.stop().await.unwrap();
}

/// Test: map_async returns results in item order regardless of finish order
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_map_async_preserves_item_order() {
    let orchestrator = started(fast_config()).await;

    let results = orchestrator
        .map_async(
            |ms: u64| async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!(ms))
            },
            vec![120, 10, 60],
        )
        .await
        .unwrap();

    let values: Vec<_> = results.iter().map(|r| r.value.clone().unwrap()).collect();
    assert_eq!(values, vec![json!(120), json!(10), json!(60)]);

    orchestrator.stop().await.unwrap();
}

/// Test: Lifecycle misuse raises
#[tokio::test]
async fn test_submit_before_start_is_rejected() {
    let orchestrator = Orchestrator::new(fast_config()).unwrap();
    assert!(matches!(
        orchestrator.submit(square(2)),
        Err(Error::NotStarted)
    ));
    assert!(matches!(
        orchestrator.submit_many(vec![square(2)]),
        Err(Error::NotStarted)
    ));
}

/// Test: Invalid submissions fail synchronously
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_submission_is_rejected() {
    let orchestrator = started(fast_config()).await;

    let zero_timeout = square(2).timeout(Duration::ZERO);
    assert!(matches!(
        orchestrator.submit(zero_timeout),
        Err(Error::Validation(_))
    ));
    let no_attempts = square(2).retry(RetryPolicy::attempts(0));
    assert!(matches!(
        orchestrator.submit(no_attempts),
        Err(Error::Validation(_))
    ));

    orchestrator.stop().await.unwrap();
}
