use std::collections::HashMap;
use std::time::SystemTime;

use tracing::debug;

use super::{bucket_end, bucket_start, Granularity, RollupBucket, SampleBatch};

/// Identity key for bucket accumulation within one granularity lane.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    start: SystemTime,
    /// `None` is the global series.
    app: Option<String>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    sent: u64,
    received: u64,
}

/// One granularity's accumulator over the shared sample stream.
///
/// Lanes are independent: each dedups and folds on its own, so an hourly
/// update never depends on daily state.
#[derive(Debug)]
struct Lane {
    granularity: Granularity,
    /// Highest window end already folded into this lane.
    high_water: Option<SystemTime>,
    pending: HashMap<BucketKey, Totals>,
    duplicates: u64,
}

impl Lane {
    fn new(granularity: Granularity) -> Self {
        Self {
            granularity,
            high_water: None,
            pending: HashMap::new(),
            duplicates: 0,
        }
    }

    fn fold(&mut self, batch: &SampleBatch) -> bool {
        if let Some(hw) = self.high_water {
            if batch.window_end <= hw {
                self.duplicates += 1;
                debug!(
                    granularity = %self.granularity,
                    window_end = ?batch.window_end,
                    "duplicate sample window skipped",
                );
                return false;
            }
        }

        // Samples are classified by the bucket containing their window start.
        let start = bucket_start(self.granularity, batch.window_start);

        for sample in &batch.apps {
            let entry = self
                .pending
                .entry(BucketKey {
                    start,
                    app: Some(sample.app.clone()),
                })
                .or_default();
            entry.sent += sample.bytes_sent;
            entry.received += sample.bytes_received;
        }

        // Idle intervals still advance the window but leave no increment.
        if batch.global.bytes_sent > 0 || batch.global.bytes_received > 0 {
            let global = self
                .pending
                .entry(BucketKey { start, app: None })
                .or_default();
            global.sent += batch.global.bytes_sent;
            global.received += batch.global.bytes_received;
        }

        self.high_water = Some(batch.window_end);
        true
    }
}

/// Result of folding one sample batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub applied_lanes: usize,
    pub duplicate_lanes: usize,
}

/// Folds the per-interval sample stream into calendar-aligned rollup
/// increments for every granularity.
///
/// The engine is the sole owner of bucket mutation. Pending increments are
/// drained to the store by the caller; the durable layer upserts them, so
/// draining mid-bucket is safe and keeps memory flat.
pub struct AggregationEngine {
    lanes: Vec<Lane>,
}

impl AggregationEngine {
    /// Creates an engine with one lane per granularity.
    pub fn new() -> Self {
        Self {
            lanes: Granularity::all().iter().map(|g| Lane::new(*g)).collect(),
        }
    }

    /// Folds one interval's samples into every lane.
    ///
    /// Redelivered windows (window end at or below a lane's high-water
    /// mark) are skipped per lane, making delivery idempotent.
    pub fn ingest(&mut self, batch: &SampleBatch) -> IngestSummary {
        let mut summary = IngestSummary::default();

        for lane in &mut self.lanes {
            if lane.fold(batch) {
                summary.applied_lanes += 1;
            } else {
                summary.duplicate_lanes += 1;
            }
        }

        summary
    }

    /// Takes all pending bucket increments, leaving the lanes empty.
    ///
    /// Ordering is stable by granularity, then bucket start, then app, so
    /// store batches and test assertions are deterministic.
    pub fn drain(&mut self) -> Vec<RollupBucket> {
        let mut out = Vec::new();

        for lane in &mut self.lanes {
            let mut entries: Vec<(BucketKey, Totals)> = lane.pending.drain().collect();
            entries.sort_by(|(a, _), (b, _)| a.start.cmp(&b.start).then_with(|| a.app.cmp(&b.app)));

            for (key, totals) in entries {
                out.push(RollupBucket {
                    granularity: lane.granularity,
                    bucket_start: key.start,
                    bucket_end: bucket_end(lane.granularity, key.start),
                    app: key.app,
                    bytes_sent: totals.sent,
                    bytes_received: totals.received,
                });
            }
        }

        out
    }

    /// Number of pending bucket increments across all lanes.
    pub fn pending_len(&self) -> usize {
        self.lanes.iter().map(|l| l.pending.len()).sum()
    }

    /// Total duplicate windows skipped since startup, across lanes.
    pub fn duplicate_count(&self) -> u64 {
        self.lanes.iter().map(|l| l.duplicates).sum()
    }
}

impl Default for AggregationEngine {
    fn default() -> Self {
        Self::new()
    }
}
