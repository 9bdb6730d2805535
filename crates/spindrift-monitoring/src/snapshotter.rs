//! Periodic resource sampler.
//!
//! Two local samplers (memory, scheduler lag) run as spawned tasks; the next
//! sample is scheduled only after the previous one completes, so a slow
//! sampling pass never stacks ticks. CPU and client overload arrive pushed
//! over the [`TelemetryFeed`] and are stamped into their own buffers.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::MonitoringError;
use crate::snapshot::{
    ClientSnapshot, CpuSnapshot, EventLoopSnapshot, MemorySnapshot, SnapshotBuffer,
};
use crate::telemetry::{TelemetryEvent, TelemetryFeed};

/// Environment override for the memory ceiling, in megabytes. Hosting
/// platforms set this to the container limit.
pub const MEMORY_MBYTES_ENV: &str = "SPINDRIFT_MEMORY_MBYTES";

/// Snapshotter configuration.
#[derive(Debug, Clone)]
pub struct SnapshotterConfig {
    /// Cadence of the memory sampler.
    pub memory_sample_interval: Duration,
    /// Cadence of the scheduler-lag sampler.
    pub event_loop_sample_interval: Duration,
    /// How much history each snapshot buffer retains.
    pub sampling_history: Duration,
    /// Lag tolerance: a fire delayed beyond `interval * (1 + ratio)` is
    /// overloaded.
    pub max_blocked_ratio: f64,
    /// Memory is overloaded when used exceeds `1 - ratio` of the ceiling.
    pub min_free_memory_ratio: f64,
    /// Explicit memory ceiling. When unset, the env override applies, then a
    /// quarter of host memory.
    pub max_memory_bytes: Option<u64>,
}

impl Default for SnapshotterConfig {
    fn default() -> Self {
        Self {
            memory_sample_interval: Duration::from_secs(1),
            event_loop_sample_interval: Duration::from_millis(500),
            sampling_history: Duration::from_secs(60),
            max_blocked_ratio: 0.05,
            min_free_memory_ratio: 0.2,
            max_memory_bytes: None,
        }
    }
}

impl SnapshotterConfig {
    pub fn validate(&self) -> Result<(), MonitoringError> {
        if self.memory_sample_interval.is_zero() {
            return Err(MonitoringError::config(
                "memory_sample_interval",
                "must be non-zero",
            ));
        }
        if self.event_loop_sample_interval.is_zero() {
            return Err(MonitoringError::config(
                "event_loop_sample_interval",
                "must be non-zero",
            ));
        }
        if self.sampling_history.is_zero() {
            return Err(MonitoringError::config(
                "sampling_history",
                "must be non-zero",
            ));
        }
        if !(0.0..1.0).contains(&self.max_blocked_ratio) {
            return Err(MonitoringError::config(
                "max_blocked_ratio",
                format!("{} is outside [0, 1)", self.max_blocked_ratio),
            ));
        }
        if !(0.0..1.0).contains(&self.min_free_memory_ratio) {
            return Err(MonitoringError::config(
                "min_free_memory_ratio",
                format!("{} is outside [0, 1)", self.min_free_memory_ratio),
            ));
        }
        if self.max_memory_bytes == Some(0) {
            return Err(MonitoringError::config(
                "max_memory_bytes",
                "must be non-zero when set",
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Buffers {
    memory: SnapshotBuffer<MemorySnapshot>,
    event_loop: SnapshotBuffer<EventLoopSnapshot>,
    cpu: SnapshotBuffer<CpuSnapshot>,
    client: SnapshotBuffer<ClientSnapshot>,
}

impl Buffers {
    fn new(retention: Duration) -> Self {
        Self {
            memory: SnapshotBuffer::new(retention),
            event_loop: SnapshotBuffer::new(retention),
            cpu: SnapshotBuffer::new(retention),
            client: SnapshotBuffer::new(retention),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Produces timestamped overload signals for four resource kinds and keeps a
/// bounded history of each.
pub struct Snapshotter {
    config: SnapshotterConfig,
    max_memory_bytes: u64,
    buffers: Arc<Mutex<Buffers>>,
    feed: TelemetryFeed,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Snapshotter {
    pub fn new(config: SnapshotterConfig, feed: TelemetryFeed) -> Result<Self, MonitoringError> {
        config.validate()?;
        let max_memory_bytes = resolve_max_memory_bytes(&config);
        let buffers = Arc::new(Mutex::new(Buffers::new(config.sampling_history)));
        Ok(Self {
            config,
            max_memory_bytes,
            buffers,
            feed,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// The memory ceiling overload decisions are made against.
    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_bytes
    }

    /// Start the samplers and the telemetry intake. Idempotent.
    pub fn start(&self) {
        let mut tasks = lock(&self.tasks);
        if !tasks.is_empty() {
            debug!("snapshotter already started");
            return;
        }

        // Seed one healthy lag snapshot so the first measured delta has a
        // well-defined predecessor.
        lock(&self.buffers).event_loop.push(EventLoopSnapshot {
            created_at: Instant::now(),
            is_overloaded: false,
            exceeded: Duration::ZERO,
        });

        tasks.push(self.spawn_memory_sampler());
        tasks.push(self.spawn_lag_sampler());
        tasks.push(self.spawn_telemetry_intake());
        debug!(
            max_memory_bytes = self.max_memory_bytes,
            "snapshotter started"
        );
    }

    /// Cancel the samplers and unsubscribe from telemetry. Idempotent.
    pub fn stop(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }

    /// Memory snapshots no older than `window` (relative to the newest);
    /// the full retained history when `window` is `None`.
    pub fn memory_sample(&self, window: Option<Duration>) -> Vec<MemorySnapshot> {
        lock(&self.buffers).memory.sample(window)
    }

    pub fn event_loop_sample(&self, window: Option<Duration>) -> Vec<EventLoopSnapshot> {
        lock(&self.buffers).event_loop.sample(window)
    }

    pub fn cpu_sample(&self, window: Option<Duration>) -> Vec<CpuSnapshot> {
        lock(&self.buffers).cpu.sample(window)
    }

    pub fn client_sample(&self, window: Option<Duration>) -> Vec<ClientSnapshot> {
        lock(&self.buffers).client.sample(window)
    }

    fn spawn_memory_sampler(&self) -> JoinHandle<()> {
        let buffers = Arc::clone(&self.buffers);
        let interval = self.config.memory_sample_interval;
        let overload_threshold = 1.0 - self.config.min_free_memory_ratio;
        let max_bytes = self.max_memory_bytes;

        tokio::spawn(async move {
            let mut sys = System::new();
            loop {
                tokio::time::sleep(interval).await;
                match sample_memory(&mut sys, max_bytes, overload_threshold) {
                    Ok(snapshot) => lock(&buffers).memory.push(snapshot),
                    Err(e) => warn!(error = %e, "memory sample failed, skipping"),
                }
            }
        })
    }

    fn spawn_lag_sampler(&self) -> JoinHandle<()> {
        let buffers = Arc::clone(&self.buffers);
        let interval = self.config.event_loop_sample_interval;
        let threshold = interval.mul_f64(1.0 + self.config.max_blocked_ratio);

        tokio::spawn(async move {
            let mut last_fired = Instant::now();
            loop {
                tokio::time::sleep(interval).await;
                let now = Instant::now();
                let delta = now.duration_since(last_fired);
                last_fired = now;
                lock(&buffers).event_loop.push(EventLoopSnapshot {
                    created_at: now,
                    is_overloaded: delta > threshold,
                    exceeded: delta.saturating_sub(interval),
                });
            }
        })
    }

    fn spawn_telemetry_intake(&self) -> JoinHandle<()> {
        let buffers = Arc::clone(&self.buffers);
        let mut rx = self.feed.subscribe();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(TelemetryEvent::Cpu {
                        created_at,
                        is_overloaded,
                        used_ratio,
                    }) => lock(&buffers).cpu.push(CpuSnapshot {
                        created_at,
                        is_overloaded,
                        used_ratio,
                    }),
                    Ok(TelemetryEvent::Client {
                        created_at,
                        is_overloaded,
                        rate_limit_errors,
                    }) => lock(&buffers).client.push(ClientSnapshot {
                        created_at,
                        is_overloaded,
                        rate_limit_errors,
                    }),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "telemetry intake lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Drop for Snapshotter {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Ceiling resolution order: explicit config, env override, then a quarter
/// of host memory.
fn resolve_max_memory_bytes(config: &SnapshotterConfig) -> u64 {
    if let Some(bytes) = config.max_memory_bytes {
        return bytes;
    }
    if let Ok(raw) = std::env::var(MEMORY_MBYTES_ENV) {
        match raw.parse::<u64>() {
            Ok(mbytes) if mbytes > 0 => return mbytes * 1024 * 1024,
            _ => warn!(value = %raw, "ignoring unparseable memory ceiling override"),
        }
    }
    let mut sys = System::new();
    sys.refresh_memory();
    let total = sys.total_memory();
    if total == 0 {
        // Host reported nothing useful; assume a small container.
        return 2 * 1024 * 1024 * 1024;
    }
    total / 4
}

/// Resident memory of this process plus its direct children (the browser
/// subprocesses), judged against the ceiling.
fn sample_memory(
    sys: &mut System,
    max_bytes: u64,
    overload_threshold: f64,
) -> Result<MemorySnapshot, MonitoringError> {
    sys.refresh_memory();
    sys.refresh_processes(ProcessesToUpdate::All, true);

    let own_pid = Pid::from_u32(std::process::id());
    let used_bytes = match sys.process(own_pid) {
        Some(own) => {
            let children: u64 = sys
                .processes()
                .values()
                .filter(|p| p.parent() == Some(own_pid))
                .map(|p| p.memory())
                .sum();
            own.memory() + children
        }
        // Process table did not include us; fall back to system-wide usage.
        None => sys.total_memory().saturating_sub(sys.available_memory()),
    };

    if max_bytes == 0 {
        return Err(MonitoringError::sample("memory ceiling is zero"));
    }
    let used_ratio = used_bytes as f64 / max_bytes as f64;
    Ok(MemorySnapshot {
        created_at: Instant::now(),
        is_overloaded: used_ratio > overload_threshold,
        used_bytes,
        max_bytes,
    })
}
