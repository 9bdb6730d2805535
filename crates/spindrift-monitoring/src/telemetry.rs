//! Intake channel for platform-pushed overload telemetry.
//!
//! CPU and client saturation are not sampled locally; the hosting platform
//! pushes them as events. [`TelemetryFeed`] is the broadcast bus those events
//! arrive on; the [`crate::Snapshotter`] subscribes on `start` and stamps
//! each event into the matching snapshot buffer.

use std::time::Instant;

use tokio::sync::broadcast;

/// One pushed telemetry record.
#[derive(Debug, Clone, Copy)]
pub enum TelemetryEvent {
    Cpu {
        created_at: Instant,
        is_overloaded: bool,
        used_ratio: f64,
    },
    Client {
        created_at: Instant,
        is_overloaded: bool,
        rate_limit_errors: u64,
    },
}

/// Sender half of the telemetry bus. Cheap to clone; dropping every clone
/// ends the subscribers' intake loops.
#[derive(Debug, Clone)]
pub struct TelemetryFeed {
    tx: broadcast::Sender<TelemetryEvent>,
}

impl TelemetryFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Events pushed while nobody is subscribed are
    /// dropped, matching the sampler being stopped.
    pub fn push(&self, event: TelemetryEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.tx.subscribe()
    }
}

impl Default for TelemetryFeed {
    fn default() -> Self {
        Self::new(64)
    }
}
