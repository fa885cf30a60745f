//! Ordering guarantees.
//!
//! Within a lane, strictly higher priority dequeues first and ties go by
//! submission order. `stream_results` yields in completion order, unlike
//! `get_results`, which follows the caller's id order.

use futures::StreamExt;
use serde_json::json;
use std::time::Duration;

use taskhive::{Priority, TaskStatus};

use crate::fixtures::{cpu_sleep, fixed_pool_config, io_sleep, started, RunLog};

/// Test: Higher priority runs first
/// Given the only CPU worker is busy
/// When NORMAL, HIGH, URGENT and LOW tasks queue up in that order
/// Then they run URGENT, HIGH, NORMAL, LOW
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_higher_priority_dequeues_first() {
    let orchestrator = started(fixed_pool_config()).await;
    let log = RunLog::new();

    let blocker = orchestrator.submit(cpu_sleep(300)).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(orchestrator.status(blocker), Some(TaskStatus::Running));

    let ids = orchestrator
        .submit_many(vec![
            log.recording("normal").priority(Priority::Normal),
            log.recording("high").priority(Priority::High),
            log.recording("urgent").priority(Priority::Urgent),
            log.recording("low").priority(Priority::Low),
        ])
        .unwrap();
    orchestrator
        .get_results(&ids, Some(Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(log.entries(), vec!["urgent", "high", "normal", "low"]);
    orchestrator.stop().await.unwrap();
}

/// Test: FIFO within a priority
/// Given the only CPU worker is busy
/// When three HIGH tasks are submitted one by one
/// Then they run in submission order
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fifo_within_priority() {
    let orchestrator = started(fixed_pool_config()).await;
    let log = RunLog::new();

    orchestrator.submit(cpu_sleep(200)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut ids = Vec::new();
    for label in ["first", "second", "third"] {
        ids.push(
            orchestrator
                .submit(log.recording(label).priority(Priority::High))
                .unwrap(),
        );
    }
    orchestrator
        .get_results(&ids, Some(Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(log.entries(), vec!["first", "second", "third"]);
    orchestrator.stop().await.unwrap();
}

/// Test: Stream yields completion order
/// Given three I/O tasks that finish in the reverse of submission order
/// When their results are streamed
/// Then each arrives exactly once, fastest first
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stream_yields_completion_order() {
    let orchestrator = started(fixed_pool_config()).await;
    let ids = orchestrator
        .submit_many(vec![io_sleep(400), io_sleep(200), io_sleep(20)])
        .unwrap();

    let stream = orchestrator.stream_results(&ids).unwrap();
    let streamed = tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
        .await
        .unwrap();

    let values: Vec<_> = streamed.iter().map(|r| r.value.clone().unwrap()).collect();
    assert_eq!(values, vec![json!(20), json!(200), json!(400)]);
    let order: Vec<_> = streamed.iter().map(|r| r.task_id).collect();
    assert_eq!(order, vec![ids[2], ids[1], ids[0]]);

    orchestrator.stop().await.unwrap();
}

/// Test: Abandoning a stream early is safe
/// Given a stream over two tasks
/// When the caller takes one result and drops the stream
/// Then both tasks still finish and stay retrievable
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dropping_stream_early_is_safe() {
    let orchestrator = started(fixed_pool_config()).await;
    let ids = orchestrator
        .submit_many(vec![io_sleep(10), io_sleep(150)])
        .unwrap();

    let first = {
        let stream = orchestrator.stream_results(&ids).unwrap();
        let mut stream = Box::pin(stream);
        stream.next().await.unwrap()
    };
    assert_eq!(first.task_id, ids[0]);

    let results = orchestrator
        .get_results(&ids, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert!(results.iter().all(|r| r.status == TaskStatus::Completed));

    orchestrator.stop().await.unwrap();
}
