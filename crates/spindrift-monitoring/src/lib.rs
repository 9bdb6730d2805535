//! Resource monitoring for the spindrift crawling runtime.
//!
//! The [`Snapshotter`] samples memory and scheduler lag on timers, stores
//! externally pushed CPU and client telemetry, and keeps a bounded history of
//! timestamped overload snapshots per resource kind. [`SystemStatus`] reduces
//! those histories to a binary idle/overloaded verdict that the task
//! scheduler polls when admitting and autoscaling work.

pub mod error;
pub mod snapshot;
pub mod snapshotter;
pub mod status;
pub mod telemetry;

pub use error::MonitoringError;
pub use snapshot::{ClientSnapshot, CpuSnapshot, EventLoopSnapshot, MemorySnapshot, Snapshot};
pub use snapshotter::{Snapshotter, SnapshotterConfig};
pub use status::{OverloadReport, SystemMonitor, SystemReport, SystemStatus, SystemStatusConfig};
pub use telemetry::{TelemetryEvent, TelemetryFeed};
