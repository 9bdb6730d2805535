//! Overload aggregation over snapshot history.
//!
//! Reduces each resource's snapshot slice to a time-weighted overload ratio
//! and combines the four verdicts into one idle/busy decision. The scheduler
//! consumes this through the [`SystemMonitor`] seam: the short window for
//! admission, the full retained history for autoscaling.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::error::MonitoringError;
use crate::snapshot::Snapshot;
use crate::snapshotter::Snapshotter;

/// SystemStatus configuration.
#[derive(Debug, Clone)]
pub struct SystemStatusConfig {
    /// Window used by [`SystemMonitor::current_status`].
    pub current_history: Duration,
    /// Per-resource overload thresholds: the system counts as overloaded on
    /// a resource once the time-weighted overloaded fraction exceeds these.
    pub max_memory_overloaded_ratio: f64,
    pub max_event_loop_overloaded_ratio: f64,
    pub max_cpu_overloaded_ratio: f64,
    pub max_client_overloaded_ratio: f64,
}

impl Default for SystemStatusConfig {
    fn default() -> Self {
        Self {
            current_history: Duration::from_secs(5),
            max_memory_overloaded_ratio: 0.2,
            max_event_loop_overloaded_ratio: 0.2,
            max_cpu_overloaded_ratio: 0.4,
            max_client_overloaded_ratio: 0.2,
        }
    }
}

impl SystemStatusConfig {
    pub fn validate(&self) -> Result<(), MonitoringError> {
        if self.current_history.is_zero() {
            return Err(MonitoringError::config(
                "current_history",
                "must be non-zero",
            ));
        }
        for (field, ratio) in [
            ("max_memory_overloaded_ratio", self.max_memory_overloaded_ratio),
            (
                "max_event_loop_overloaded_ratio",
                self.max_event_loop_overloaded_ratio,
            ),
            ("max_cpu_overloaded_ratio", self.max_cpu_overloaded_ratio),
            ("max_client_overloaded_ratio", self.max_client_overloaded_ratio),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(MonitoringError::config(
                    field,
                    format!("{ratio} is outside [0, 1]"),
                ));
            }
        }
        Ok(())
    }
}

/// Overload verdict for one resource over one window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OverloadReport {
    pub is_overloaded: bool,
    /// The configured threshold the ratio was judged against.
    pub limit_ratio: f64,
    /// Time-weighted fraction of the window spent overloaded, rounded to
    /// three decimals.
    pub actual_ratio: f64,
}

impl OverloadReport {
    fn idle(limit_ratio: f64) -> Self {
        Self {
            is_overloaded: false,
            limit_ratio,
            actual_ratio: 0.0,
        }
    }
}

/// Combined verdict across all four resource kinds.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SystemReport {
    pub is_system_idle: bool,
    pub memory: OverloadReport,
    pub event_loop: OverloadReport,
    pub cpu: OverloadReport,
    pub client: OverloadReport,
}

impl SystemReport {
    pub fn new(
        memory: OverloadReport,
        event_loop: OverloadReport,
        cpu: OverloadReport,
        client: OverloadReport,
    ) -> Self {
        Self {
            is_system_idle: !(memory.is_overloaded
                || event_loop.is_overloaded
                || cpu.is_overloaded
                || client.is_overloaded),
            memory,
            event_loop,
            cpu,
            client,
        }
    }
}

/// Read seam the scheduler polls. Implementations must be cheap to call from
/// a ticker.
pub trait SystemMonitor: Send + Sync {
    /// Verdict over the recent window; drives task admission.
    fn current_status(&self) -> SystemReport;
    /// Verdict over the full retained history; drives autoscaling.
    fn historical_status(&self) -> SystemReport;
}

/// [`SystemMonitor`] over a live [`Snapshotter`].
pub struct SystemStatus {
    config: SystemStatusConfig,
    snapshotter: Arc<Snapshotter>,
}

impl SystemStatus {
    pub fn new(
        config: SystemStatusConfig,
        snapshotter: Arc<Snapshotter>,
    ) -> Result<Self, MonitoringError> {
        config.validate()?;
        Ok(Self {
            config,
            snapshotter,
        })
    }

    fn status_for(&self, window: Option<Duration>) -> SystemReport {
        SystemReport::new(
            weighted_overload(
                &self.snapshotter.memory_sample(window),
                self.config.max_memory_overloaded_ratio,
            ),
            weighted_overload(
                &self.snapshotter.event_loop_sample(window),
                self.config.max_event_loop_overloaded_ratio,
            ),
            weighted_overload(
                &self.snapshotter.cpu_sample(window),
                self.config.max_cpu_overloaded_ratio,
            ),
            weighted_overload(
                &self.snapshotter.client_sample(window),
                self.config.max_client_overloaded_ratio,
            ),
        )
    }
}

impl SystemMonitor for SystemStatus {
    fn current_status(&self) -> SystemReport {
        self.status_for(Some(self.config.current_history))
    }

    fn historical_status(&self) -> SystemReport {
        self.status_for(None)
    }
}

/// Time-weighted overload mean over adjacent snapshot pairs. Each pair is
/// weighted by its gap in milliseconds; a zero gap (synchronous back-to-back
/// samples) counts as one millisecond so it cannot vanish from the mean.
/// Fewer than two snapshots cannot be weighted and report idle.
fn weighted_overload<T: Snapshot>(sample: &[T], limit_ratio: f64) -> OverloadReport {
    if sample.len() < 2 {
        return OverloadReport::idle(limit_ratio);
    }

    let mut total_weight = 0.0;
    let mut overloaded_weight = 0.0;
    for pair in sample.windows(2) {
        let gap_millis = pair[1]
            .created_at()
            .duration_since(pair[0].created_at())
            .as_secs_f64()
            * 1000.0;
        let weight = if gap_millis > 0.0 { gap_millis } else { 1.0 };
        total_weight += weight;
        if pair[1].is_overloaded() {
            overloaded_weight += weight;
        }
    }

    let actual_ratio = overloaded_weight / total_weight;
    OverloadReport {
        is_overloaded: actual_ratio > limit_ratio,
        limit_ratio,
        actual_ratio: round3(actual_ratio),
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
