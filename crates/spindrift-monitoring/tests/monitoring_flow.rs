//! Pushed telemetry flowing through the snapshotter into the combined
//! system verdict.

use std::sync::Arc;
use std::time::{Duration, Instant};

use spindrift_monitoring::{
    Snapshotter, SnapshotterConfig, SystemMonitor, SystemStatus, SystemStatusConfig,
    TelemetryEvent, TelemetryFeed,
};

fn client_event(at: Instant, overloaded: bool) -> TelemetryEvent {
    TelemetryEvent::Client {
        created_at: at,
        is_overloaded: overloaded,
        rate_limit_errors: if overloaded { 7 } else { 0 },
    }
}

#[tokio::test(start_paused = true)]
async fn recent_overload_shows_in_current_but_not_historical_status() {
    let feed = TelemetryFeed::new(128);
    let snapshotter = Arc::new(
        Snapshotter::new(
            SnapshotterConfig {
                max_memory_bytes: Some(8 * 1024 * 1024 * 1024),
                ..Default::default()
            },
            feed.clone(),
        )
        .unwrap(),
    );
    snapshotter.start();
    tokio::task::yield_now().await;

    let status = SystemStatus::new(SystemStatusConfig::default(), Arc::clone(&snapshotter)).unwrap();

    // 55 healthy seconds followed by a 4-second overloaded tail.
    let base = Instant::now();
    for secs in 0..=55u64 {
        feed.push(client_event(base + Duration::from_secs(secs), false));
    }
    for secs in 56..=59u64 {
        feed.push(client_event(base + Duration::from_secs(secs), true));
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Recent 5s window is dominated by the overloaded tail.
    let current = status.current_status();
    assert!(current.client.is_overloaded);
    assert!(!current.is_system_idle);

    // Over the full minute the tail is well under the 0.2 threshold.
    let historical = status.historical_status();
    assert!(!historical.client.is_overloaded);
    assert!(historical.client.actual_ratio < 0.1);

    snapshotter.stop();
}

#[tokio::test(start_paused = true)]
async fn quiet_system_reports_idle_on_both_windows() {
    let feed = TelemetryFeed::new(16);
    let snapshotter =
        Arc::new(Snapshotter::new(SnapshotterConfig::default(), feed.clone()).unwrap());
    snapshotter.start();
    tokio::task::yield_now().await;

    let status = SystemStatus::new(SystemStatusConfig::default(), Arc::clone(&snapshotter)).unwrap();

    let base = Instant::now();
    for secs in 0..10u64 {
        feed.push(client_event(base + Duration::from_secs(secs), false));
        feed.push(TelemetryEvent::Cpu {
            created_at: base + Duration::from_secs(secs),
            is_overloaded: false,
            used_ratio: 0.1,
        });
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(status.current_status().is_system_idle);
    assert!(status.historical_status().is_system_idle);

    snapshotter.stop();
}
