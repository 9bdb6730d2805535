//! End-to-end pool behavior under a stubbed system monitor: ramp-up,
//! overload scale-down, error propagation, abort, pause/resume.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use spindrift_monitoring::{OverloadReport, SystemMonitor, SystemReport};
use spindrift_scheduler::{AutoscaledPool, AutoscaledPoolConfig, SchedulerError, TaskSource};

fn report(idle: bool) -> SystemReport {
    let part = |overloaded: bool| OverloadReport {
        is_overloaded: overloaded,
        limit_ratio: 0.2,
        actual_ratio: if overloaded { 1.0 } else { 0.0 },
    };
    SystemReport::new(part(!idle), part(false), part(false), part(false))
}

struct StubMonitor {
    idle: AtomicBool,
}

impl StubMonitor {
    fn new(idle: bool) -> Arc<Self> {
        Arc::new(Self {
            idle: AtomicBool::new(idle),
        })
    }
}

impl SystemMonitor for StubMonitor {
    fn current_status(&self) -> SystemReport {
        report(self.idle.load(Ordering::SeqCst))
    }
    fn historical_status(&self) -> SystemReport {
        report(self.idle.load(Ordering::SeqCst))
    }
}

/// Scriptable work source: readiness and completion are flipped from the
/// test body, tasks sleep a fixed duration, and tasks numbered at or past
/// `fail_from` fail after completing their sleep.
struct TestSource {
    ready: AtomicBool,
    finished: AtomicBool,
    task_duration: Duration,
    fail_from: Option<usize>,
    started: AtomicUsize,
    completed: AtomicUsize,
    ready_in_flight: AtomicUsize,
    ready_overlapped: AtomicBool,
}

impl TestSource {
    fn new(task_duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            ready: AtomicBool::new(true),
            finished: AtomicBool::new(false),
            task_duration,
            fail_from: None,
            started: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            ready_in_flight: AtomicUsize::new(0),
            ready_overlapped: AtomicBool::new(false),
        })
    }

    fn failing_from(task_duration: Duration, fail_from: usize) -> Arc<Self> {
        Arc::new(Self {
            ready: AtomicBool::new(true),
            finished: AtomicBool::new(false),
            task_duration,
            fail_from: Some(fail_from),
            started: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            ready_in_flight: AtomicUsize::new(0),
            ready_overlapped: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl TaskSource for TestSource {
    async fn run_task(&self) -> anyhow::Result<()> {
        let n = self.started.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.task_duration).await;
        self.completed.fetch_add(1, Ordering::SeqCst);
        if matches!(self.fail_from, Some(from) if n >= from) {
            anyhow::bail!("task {n} blew up");
        }
        Ok(())
    }

    async fn is_task_ready(&self) -> anyhow::Result<bool> {
        if self.ready_in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
            self.ready_overlapped.store(true, Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        self.ready_in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(self.ready.load(Ordering::SeqCst))
    }

    async fn is_finished(&self) -> anyhow::Result<bool> {
        Ok(self.finished.load(Ordering::SeqCst))
    }
}

fn fast_config() -> AutoscaledPoolConfig {
    AutoscaledPoolConfig {
        maybe_run_interval: Duration::from_millis(10),
        autoscale_interval: Duration::from_millis(50),
        logging_interval: Duration::ZERO,
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn ramps_up_to_max_when_idle_and_resolves_on_finish() {
    let source = TestSource::new(Duration::from_millis(200));
    let pool = Arc::new(
        AutoscaledPool::new(
            AutoscaledPoolConfig {
                min_concurrency: 1,
                max_concurrency: 5,
                scale_up_step_ratio: 0.5,
                scale_down_step_ratio: 0.5,
                ..fast_config()
            },
            StubMonitor::new(true),
            Arc::clone(&source) as Arc<dyn TaskSource>,
        )
        .unwrap(),
    );

    let run = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.run().await }
    });

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(pool.desired_concurrency(), 5);
    assert_eq!(pool.current_concurrency(), 5);

    source.ready.store(false, Ordering::SeqCst);
    source.finished.store(true, Ordering::SeqCst);

    let result = tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("run should resolve once drained and finished")
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(pool.current_concurrency(), 0);
}

#[tokio::test(start_paused = true)]
async fn scales_down_by_one_step_on_overload() {
    let source = TestSource::new(Duration::from_millis(10));
    source.ready.store(false, Ordering::SeqCst);
    let pool = Arc::new(
        AutoscaledPool::new(
            AutoscaledPoolConfig {
                min_concurrency: 1,
                max_concurrency: 100,
                desired_concurrency: Some(10),
                autoscale_interval: Duration::from_secs(10),
                ..fast_config()
            },
            StubMonitor::new(false),
            Arc::clone(&source) as Arc<dyn TaskSource>,
        )
        .unwrap(),
    );

    let run = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.run().await }
    });

    // First autoscale tick: ceil(10 * 0.05) = 1, down to 9.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.desired_concurrency(), 9);

    // No further tick before the next interval elapses.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(pool.desired_concurrency(), 9);

    pool.abort();
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn first_task_error_surfaces_through_run() {
    let source = TestSource::failing_from(Duration::from_millis(50), 3);
    let pool = Arc::new(
        AutoscaledPool::new(
            AutoscaledPoolConfig {
                min_concurrency: 1,
                max_concurrency: 1,
                ..fast_config()
            },
            StubMonitor::new(true),
            Arc::clone(&source) as Arc<dyn TaskSource>,
        )
        .unwrap(),
    );

    let result = tokio::time::timeout(Duration::from_secs(5), pool.run())
        .await
        .expect("run should reject on the third task");

    match result {
        Err(SchedulerError::Task { source: e }) => {
            assert!(e.to_string().contains("task 3 blew up"), "got: {e}");
        }
        other => panic!("expected a task error, got {other:?}"),
    }
    assert_eq!(source.started.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn later_errors_are_discarded() {
    let source = TestSource::failing_from(Duration::from_millis(100), 3);
    let pool = Arc::new(
        AutoscaledPool::new(
            AutoscaledPoolConfig {
                min_concurrency: 2,
                max_concurrency: 2,
                ..fast_config()
            },
            StubMonitor::new(true),
            Arc::clone(&source) as Arc<dyn TaskSource>,
        )
        .unwrap(),
    );

    // Tasks 3 and 4 both fail; run rejects exactly once with the first.
    let result = tokio::time::timeout(Duration::from_secs(5), pool.run())
        .await
        .expect("run should reject");
    assert!(matches!(result, Err(SchedulerError::Task { .. })));

    // The second failing task still drains in the background.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(source.completed.load(Ordering::SeqCst), 4);
    assert_eq!(pool.current_concurrency(), 0);
}

#[tokio::test(start_paused = true)]
async fn abort_resolves_run_without_cancelling_tasks() {
    let source = TestSource::new(Duration::from_secs(10));
    let pool = Arc::new(
        AutoscaledPool::new(
            AutoscaledPoolConfig {
                min_concurrency: 5,
                max_concurrency: 5,
                ..fast_config()
            },
            StubMonitor::new(true),
            Arc::clone(&source) as Arc<dyn TaskSource>,
        )
        .unwrap(),
    );

    let run = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.run().await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.current_concurrency(), 5);

    pool.abort();
    let result = tokio::time::timeout(Duration::from_millis(50), run)
        .await
        .expect("run should resolve promptly after abort")
        .unwrap();
    assert!(result.is_ok());

    // In-flight tasks were not cancelled; they complete in the background.
    assert_eq!(pool.current_concurrency(), 5);
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(source.completed.load(Ordering::SeqCst), 5);
    assert_eq!(pool.current_concurrency(), 0);
}

#[tokio::test(start_paused = true)]
async fn pause_drains_and_resume_readmits() {
    let source = TestSource::new(Duration::from_millis(50));
    let pool = Arc::new(
        AutoscaledPool::new(
            AutoscaledPoolConfig {
                min_concurrency: 2,
                max_concurrency: 2,
                ..fast_config()
            },
            StubMonitor::new(true),
            Arc::clone(&source) as Arc<dyn TaskSource>,
        )
        .unwrap(),
    );

    let run = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.run().await }
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    let desired_before = pool.desired_concurrency();

    pool.pause(None).await.unwrap();
    assert_eq!(pool.current_concurrency(), 0);
    let started_at_pause = source.started.load(Ordering::SeqCst);

    // No admissions while paused.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(source.started.load(Ordering::SeqCst), started_at_pause);
    assert!(!run.is_finished(), "run must stay pending across a pause");

    pool.resume();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(source.started.load(Ordering::SeqCst) > started_at_pause);
    assert_eq!(pool.desired_concurrency(), desired_before);

    pool.abort();
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn pause_times_out_while_a_task_hangs() {
    let source = TestSource::new(Duration::from_secs(10));
    let pool = Arc::new(
        AutoscaledPool::new(
            AutoscaledPoolConfig {
                min_concurrency: 1,
                max_concurrency: 1,
                ..fast_config()
            },
            StubMonitor::new(true),
            Arc::clone(&source) as Arc<dyn TaskSource>,
        )
        .unwrap(),
    );

    let run = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.run().await }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pool.current_concurrency(), 1);

    let result = pool.pause(Some(Duration::from_millis(50))).await;
    assert!(matches!(result, Err(SchedulerError::DrainTimeout { .. })));

    pool.abort();
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn equal_bounds_pin_the_desired_concurrency() {
    let source = TestSource::new(Duration::from_millis(20));
    let pool = Arc::new(
        AutoscaledPool::new(
            AutoscaledPoolConfig {
                min_concurrency: 3,
                max_concurrency: 3,
                ..fast_config()
            },
            StubMonitor::new(true),
            Arc::clone(&source) as Arc<dyn TaskSource>,
        )
        .unwrap(),
    );

    let run = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.run().await }
    });

    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.desired_concurrency(), 3);
    }

    pool.abort();
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn resolves_without_running_tasks_when_never_ready() {
    let source = TestSource::new(Duration::from_millis(10));
    source.ready.store(false, Ordering::SeqCst);
    let pool = Arc::new(
        AutoscaledPool::new(
            fast_config(),
            StubMonitor::new(true),
            Arc::clone(&source) as Arc<dyn TaskSource>,
        )
        .unwrap(),
    );

    let run = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.run().await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!run.is_finished());
    assert_eq!(source.started.load(Ordering::SeqCst), 0);

    source.finished.store(true, Ordering::SeqCst);
    let result = tokio::time::timeout(Duration::from_secs(1), run)
        .await
        .expect("run should resolve once the source reports finished")
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(source.started.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn ready_queries_never_overlap() {
    let source = TestSource::new(Duration::from_millis(5));
    let pool = Arc::new(
        AutoscaledPool::new(
            AutoscaledPoolConfig {
                min_concurrency: 4,
                max_concurrency: 8,
                maybe_run_interval: Duration::from_millis(2),
                ..fast_config()
            },
            StubMonitor::new(true),
            Arc::clone(&source) as Arc<dyn TaskSource>,
        )
        .unwrap(),
    );

    let run = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.run().await }
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!source.ready_overlapped.load(Ordering::SeqCst));

    pool.abort();
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn second_run_is_rejected() {
    let source = TestSource::new(Duration::from_millis(10));
    let pool = Arc::new(
        AutoscaledPool::new(
            fast_config(),
            StubMonitor::new(true),
            Arc::clone(&source) as Arc<dyn TaskSource>,
        )
        .unwrap(),
    );

    let run = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.run().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = pool.run().await;
    assert!(matches!(second, Err(SchedulerError::Config { .. })));

    pool.abort();
    assert!(run.await.unwrap().is_ok());
}
