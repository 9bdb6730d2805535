//! Snapshot data model: one timestamped overload record per resource kind,
//! kept in bounded per-kind buffers.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Common view over all snapshot kinds, used by the weighted-average
/// aggregation in [`crate::status`].
pub trait Snapshot {
    fn created_at(&self) -> Instant;
    fn is_overloaded(&self) -> bool;
}

/// Memory pressure at one sampling instant.
#[derive(Debug, Clone, Copy)]
pub struct MemorySnapshot {
    pub created_at: Instant,
    pub is_overloaded: bool,
    /// Resident bytes attributed to this process and its browser children.
    pub used_bytes: u64,
    /// The ceiling the overload decision was made against.
    pub max_bytes: u64,
}

/// Scheduler lag at one sampling instant. Overloaded when the sampler's
/// timer fired later than the configured cadence tolerates.
#[derive(Debug, Clone, Copy)]
pub struct EventLoopSnapshot {
    pub created_at: Instant,
    pub is_overloaded: bool,
    /// How far past the scheduled fire time the sample actually ran.
    pub exceeded: Duration,
}

/// CPU overload as reported by platform telemetry.
#[derive(Debug, Clone, Copy)]
pub struct CpuSnapshot {
    pub created_at: Instant,
    pub is_overloaded: bool,
    pub used_ratio: f64,
}

/// Downstream-client saturation as reported by platform telemetry.
#[derive(Debug, Clone, Copy)]
pub struct ClientSnapshot {
    pub created_at: Instant,
    pub is_overloaded: bool,
    pub rate_limit_errors: u64,
}

impl Snapshot for MemorySnapshot {
    fn created_at(&self) -> Instant {
        self.created_at
    }
    fn is_overloaded(&self) -> bool {
        self.is_overloaded
    }
}

impl Snapshot for EventLoopSnapshot {
    fn created_at(&self) -> Instant {
        self.created_at
    }
    fn is_overloaded(&self) -> bool {
        self.is_overloaded
    }
}

impl Snapshot for CpuSnapshot {
    fn created_at(&self) -> Instant {
        self.created_at
    }
    fn is_overloaded(&self) -> bool {
        self.is_overloaded
    }
}

impl Snapshot for ClientSnapshot {
    fn created_at(&self) -> Instant {
        self.created_at
    }
    fn is_overloaded(&self) -> bool {
        self.is_overloaded
    }
}

/// Bounded snapshot history. Entries older than the retention window
/// (relative to the newest entry) are dropped on insert, so pruning is
/// amortized O(1) per push.
#[derive(Debug)]
pub(crate) struct SnapshotBuffer<T: Snapshot + Clone> {
    retention: Duration,
    items: VecDeque<T>,
}

impl<T: Snapshot + Clone> SnapshotBuffer<T> {
    pub(crate) fn new(retention: Duration) -> Self {
        Self {
            retention,
            items: VecDeque::new(),
        }
    }

    pub(crate) fn push(&mut self, item: T) {
        let newest = item.created_at();
        while let Some(head) = self.items.front() {
            if newest.duration_since(head.created_at()) > self.retention {
                self.items.pop_front();
            } else {
                break;
            }
        }
        self.items.push_back(item);
    }

    /// Tail slice whose entries are at most `window` older than the newest
    /// entry; the full buffer when `window` is `None`. Always returns the
    /// accumulated slice, even when the window never fills.
    pub(crate) fn sample(&self, window: Option<Duration>) -> Vec<T> {
        let Some(window) = window else {
            return self.items.iter().cloned().collect();
        };
        let Some(newest) = self.items.back() else {
            return Vec::new();
        };
        let newest = newest.created_at();
        let mut tail: Vec<T> = self
            .items
            .iter()
            .rev()
            .take_while(|s| newest.duration_since(s.created_at()) <= window)
            .cloned()
            .collect();
        tail.reverse();
        tail
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu(at: Instant, overloaded: bool) -> CpuSnapshot {
        CpuSnapshot {
            created_at: at,
            is_overloaded: overloaded,
            used_ratio: if overloaded { 0.9 } else { 0.1 },
        }
    }

    #[test]
    fn push_prunes_entries_older_than_retention() {
        let base = Instant::now();
        let mut buf = SnapshotBuffer::new(Duration::from_secs(10));

        for secs in [0u64, 4, 8, 12, 16] {
            buf.push(cpu(base + Duration::from_secs(secs), false));
        }

        // 0s and 4s are more than 10s older than the newest entry (16s)
        assert_eq!(buf.len(), 3);
        let all = buf.sample(None);
        assert_eq!(all[0].created_at, base + Duration::from_secs(8));
    }

    #[test]
    fn sample_returns_tail_within_window() {
        let base = Instant::now();
        let mut buf = SnapshotBuffer::new(Duration::from_secs(60));

        for secs in [0u64, 10, 20, 30] {
            buf.push(cpu(base + Duration::from_secs(secs), false));
        }

        let tail = buf.sample(Some(Duration::from_secs(15)));
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].created_at, base + Duration::from_secs(20));
        assert_eq!(tail[1].created_at, base + Duration::from_secs(30));
    }

    #[test]
    fn sample_with_oversized_window_returns_everything() {
        let base = Instant::now();
        let mut buf = SnapshotBuffer::new(Duration::from_secs(60));
        for secs in [0u64, 1, 2] {
            buf.push(cpu(base + Duration::from_secs(secs), false));
        }

        // Window larger than the accumulated span still yields the full slice
        let tail = buf.sample(Some(Duration::from_secs(3600)));
        assert_eq!(tail.len(), 3);
    }

    #[test]
    fn sample_of_empty_buffer_is_empty() {
        let buf: SnapshotBuffer<CpuSnapshot> = SnapshotBuffer::new(Duration::from_secs(60));
        assert!(buf.sample(None).is_empty());
        assert!(buf.sample(Some(Duration::from_secs(5))).is_empty());
    }
}
