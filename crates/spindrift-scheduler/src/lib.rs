//! Autoscaled task pool for the spindrift crawling runtime.
//!
//! [`AutoscaledPool`] keeps the number of in-flight tasks close to a desired
//! concurrency and moves that target up or down based on the overload
//! verdicts of a [`spindrift_monitoring::SystemMonitor`]. Work arrives
//! through the three callbacks of a [`TaskSource`]; the pool promises never
//! to run more tasks than the current target and to surface the first
//! caller error through [`AutoscaledPool::run`].

pub mod error;
pub mod pool;
mod ticker;
pub mod work;

pub use error::SchedulerError;
pub use pool::{AutoscaledPool, AutoscaledPoolConfig, PoolStateSnapshot};
pub use work::TaskSource;
