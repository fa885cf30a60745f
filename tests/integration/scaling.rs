//! Autoscaling, stats, and health reporting under load.

use std::time::Duration;

use taskhive::{Config, HealthStatus, TaskStatus};

use crate::fixtures::{cpu_sleep, fast_config, square, started};

fn scaling_config() -> Config {
    Config {
        min_workers: 2,
        max_workers: 5,
        scale_step: 1,
        ..fast_config()
    }
}

/// Test: Pool grows under backlog and never exceeds max
/// Given min=2, max=5 and a deep CPU backlog
/// When the autoscaler samples repeatedly
/// Then the worker count rises above min and never passes max
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_grows_under_backlog_within_bounds() {
    let orchestrator = started(scaling_config()).await;
    let ids = orchestrator
        .submit_many((0..24).map(|_| cpu_sleep(100)).collect())
        .unwrap();

    let mut peak = 0;
    for _ in 0..40 {
        let stats = orchestrator.get_stats().await;
        assert!(stats.workers <= 5, "pool exceeded max: {}", stats.workers);
        peak = peak.max(stats.workers);
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(peak > 2, "pool never scaled up");

    let results = orchestrator
        .get_results(&ids, Some(Duration::from_secs(10)))
        .await
        .unwrap();
    assert!(results.iter().all(|r| r.status == TaskStatus::Completed));
    orchestrator.stop().await.unwrap();
}

/// Test: Pool shrinks back when idle
/// Given a pool that scaled up for a burst
/// When the burst is over
/// Then idle workers retire down to min, one per lane kept
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_shrinks_back_when_idle() {
    let orchestrator = started(scaling_config()).await;
    let ids = orchestrator
        .submit_many((0..12).map(|_| cpu_sleep(80)).collect())
        .unwrap();
    orchestrator
        .get_results(&ids, Some(Duration::from_secs(10)))
        .await
        .unwrap();

    let mut workers = usize::MAX;
    for _ in 0..100 {
        let stats = orchestrator.get_stats().await;
        workers = stats.workers;
        if workers == 2 {
            assert_eq!(stats.io.workers, 1);
            assert_eq!(stats.cpu.workers, 1);
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(workers, 2);
    orchestrator.stop().await.unwrap();
}

/// Test: Stats reflect lifetime totals
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stats_track_totals() {
    let orchestrator = started(fast_config()).await;
    let ids = orchestrator
        .submit_many((1..=4).map(square).collect())
        .unwrap();
    orchestrator.get_results(&ids, None).await.unwrap();

    let stats = orchestrator.get_stats().await;
    assert!(stats.running);
    assert_eq!(stats.totals.submitted, 4);
    assert_eq!(stats.totals.completed, 4);
    assert_eq!(stats.totals.finished(), 4);
    assert_eq!(stats.queue_depth, 0);
    assert!(stats.workers >= 2);
    orchestrator.stop().await.unwrap();
}

/// Test: Health check across the lifecycle
/// Given a freshly started orchestrator
/// When health is checked before and after stop
/// Then it is Healthy with every component listed, then Unhealthy
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_health_check_lifecycle() {
    let orchestrator = started(fast_config()).await;

    let report = orchestrator.health_check().await;
    assert_eq!(report.status, HealthStatus::Healthy, "{report:?}");
    let names: Vec<_> = report.components.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["queue", "workers", "autoscaler", "breakers", "results"]
    );

    orchestrator.stop().await.unwrap();
    let report = orchestrator.health_check().await;
    assert_eq!(report.status, HealthStatus::Unhealthy);
    assert_eq!(
        report.component("queue").unwrap().status,
        HealthStatus::Unhealthy
    );
}
