use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters accumulated across poll cycles.
///
/// `snapshot()` atomically reads and resets all counters, making it
/// suitable for periodic reporting without contention.
#[derive(Default)]
pub struct CycleStats {
    polls: AtomicU64,
    observations: AtomicU64,
    new_flows: AtomicU64,
    closed_flows: AtomicU64,
    samples: AtomicU64,
    unattributed: AtomicU64,
    reuse_detections: AtomicU64,
}

/// Point-in-time view of accumulated cycle counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleSnapshot {
    pub polls: u64,
    pub observations: u64,
    pub new_flows: u64,
    pub closed_flows: u64,
    pub samples: u64,
    pub unattributed: u64,
    pub reuse_detections: u64,
}

impl CycleStats {
    /// Create a new zeroed CycleStats.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the outcome of one completed poll cycle.
    pub fn record_cycle(
        &self,
        observations: u64,
        new_flows: u64,
        closed_flows: u64,
        samples: u64,
        unattributed: u64,
        reuse_detections: u64,
    ) {
        self.polls.fetch_add(1, Ordering::Relaxed);
        self.observations.fetch_add(observations, Ordering::Relaxed);
        self.new_flows.fetch_add(new_flows, Ordering::Relaxed);
        self.closed_flows.fetch_add(closed_flows, Ordering::Relaxed);
        self.samples.fetch_add(samples, Ordering::Relaxed);
        self.unattributed.fetch_add(unattributed, Ordering::Relaxed);
        self.reuse_detections
            .fetch_add(reuse_detections, Ordering::Relaxed);
    }

    /// Atomically read and reset all counters.
    pub fn snapshot(&self) -> CycleSnapshot {
        CycleSnapshot {
            polls: self.polls.swap(0, Ordering::Relaxed),
            observations: self.observations.swap(0, Ordering::Relaxed),
            new_flows: self.new_flows.swap(0, Ordering::Relaxed),
            closed_flows: self.closed_flows.swap(0, Ordering::Relaxed),
            samples: self.samples.swap(0, Ordering::Relaxed),
            unattributed: self.unattributed.swap(0, Ordering::Relaxed),
            reuse_detections: self.reuse_detections.swap(0, Ordering::Relaxed),
        }
    }
}
