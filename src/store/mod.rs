pub mod clickhouse;
pub mod memory;

use std::time::{Duration, SystemTime};

use thiserror::Error;
use tracing::{error, warn};

use crate::rollup::{AppSample, GlobalSample, Granularity, RollupBucket};

pub use clickhouse::ClickHouseStore;
pub use memory::MemoryStore;

/// Durable-layer failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("clickhouse: {0}")]
    ClickHouse(#[from] clickhouse_rs::errors::Error),

    /// Injected by test stores and raised for unreachable backends.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// One cycle's worth of rows bound for the store.
#[derive(Debug, Clone, Default)]
pub struct StoreBatch {
    pub raw_apps: Vec<AppSample>,
    pub raw_global: Option<GlobalSample>,
    pub rollups: Vec<RollupBucket>,
}

impl StoreBatch {
    pub fn is_empty(&self) -> bool {
        self.raw_apps.is_empty() && self.raw_global.is_none() && self.rollups.is_empty()
    }

    /// Total rows this batch would insert.
    pub fn row_count(&self) -> usize {
        self.raw_apps.len() + usize::from(self.raw_global.is_some()) + self.rollups.len()
    }
}

/// Retention horizon per table family.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub raw: Duration,
    pub hourly: Duration,
    pub daily: Duration,
    pub weekly: Duration,
    pub monthly: Duration,
}

impl RetentionPolicy {
    /// Horizon for one rollup granularity.
    pub fn horizon(&self, granularity: Granularity) -> Duration {
        match granularity {
            Granularity::Hourly => self.hourly,
            Granularity::Daily => self.daily,
            Granularity::Weekly => self.weekly,
            Granularity::Monthly => self.monthly,
        }
    }
}

/// Rollup store backends.
///
/// Enum dispatch rather than trait objects keeps async calls monomorphic
/// (no boxed futures on the per-cycle write path).
pub enum RollupStore {
    ClickHouse(ClickHouseStore),
    Memory(MemoryStore),
}

impl RollupStore {
    /// Returns the backend name for logging.
    pub fn name(&self) -> &str {
        match self {
            Self::ClickHouse(s) => s.name(),
            Self::Memory(s) => s.name(),
        }
    }

    /// Inserts raw samples and rollup increments.
    ///
    /// Rollup inserts are upserts: a second increment for the same bucket
    /// key folds into the same logical row.
    pub async fn insert_batch(&self, batch: &StoreBatch) -> Result<(), StoreError> {
        match self {
            Self::ClickHouse(s) => s.insert_batch(batch).await,
            Self::Memory(s) => s.insert_batch(batch),
        }
    }

    /// Buckets of one granularity intersecting `[from, to)`, ordered by
    /// bucket start ascending. `app` of `None` reads the global series.
    pub async fn query_range(
        &self,
        granularity: Granularity,
        app: Option<&str>,
        from: SystemTime,
        to: SystemTime,
    ) -> Result<Vec<RollupBucket>, StoreError> {
        match self {
            Self::ClickHouse(s) => s.query_range(granularity, app, from, to).await,
            Self::Memory(s) => s.query_range(granularity, app, from, to),
        }
    }

    /// Removes rows older than the per-granularity horizons.
    ///
    /// Runs on the maintenance cycle only, never inline with writes.
    pub async fn prune(&self, policy: &RetentionPolicy, now: SystemTime) -> Result<(), StoreError> {
        match self {
            Self::ClickHouse(s) => s.prune(policy, now).await,
            Self::Memory(s) => s.prune(policy, now),
        }
    }
}

/// Write-path wrapper applying bounded retry with exponential backoff.
///
/// Aggregates are best-effort durable: after the attempt budget the batch
/// is dropped with a diagnostic, and the poll loop is never blocked on a
/// failing backend.
pub struct StoreWriter {
    max_attempts: u32,
    initial_backoff: Duration,
}

impl StoreWriter {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
        }
    }

    /// Writes the batch, retrying transient failures. Returns whether the
    /// batch was persisted.
    pub async fn write(&self, store: &RollupStore, batch: &StoreBatch) -> bool {
        if batch.is_empty() {
            return true;
        }

        let mut backoff = self.initial_backoff;

        for attempt in 1..=self.max_attempts {
            match store.insert_batch(batch).await {
                Ok(()) => return true,
                Err(e) if attempt < self.max_attempts => {
                    warn!(
                        store = store.name(),
                        attempt,
                        error = %e,
                        "store write failed, retrying",
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => {
                    error!(
                        store = store.name(),
                        attempts = self.max_attempts,
                        rows = batch.row_count(),
                        error = %e,
                        "store write failed, dropping batch",
                    );
                }
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_batch_empty() {
        let batch = StoreBatch::default();
        assert!(batch.is_empty());
        assert_eq!(batch.row_count(), 0);
    }

    #[test]
    fn test_retention_policy_horizon() {
        let policy = RetentionPolicy {
            raw: Duration::from_secs(1),
            hourly: Duration::from_secs(2),
            daily: Duration::from_secs(3),
            weekly: Duration::from_secs(4),
            monthly: Duration::from_secs(5),
        };
        assert_eq!(policy.horizon(Granularity::Hourly), Duration::from_secs(2));
        assert_eq!(policy.horizon(Granularity::Monthly), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_writer_retries_until_success() {
        let memory = MemoryStore::new();
        memory.fail_next_inserts(2);
        let store = RollupStore::Memory(memory);

        let batch = StoreBatch {
            raw_global: Some(crate::rollup::GlobalSample {
                window_start: SystemTime::UNIX_EPOCH,
                window_end: SystemTime::UNIX_EPOCH + Duration::from_secs(5),
                bytes_sent: 10,
                bytes_received: 0,
            }),
            ..Default::default()
        };

        let writer = StoreWriter::new(3, Duration::from_millis(1));
        assert!(writer.write(&store, &batch).await);

        let RollupStore::Memory(memory) = &store else {
            unreachable!();
        };
        assert_eq!(memory.raw_global_len(), 1);
    }

    #[tokio::test]
    async fn test_writer_drops_after_attempt_budget() {
        let memory = MemoryStore::new();
        memory.fail_next_inserts(10);
        let store = RollupStore::Memory(memory);

        let batch = StoreBatch {
            raw_global: Some(crate::rollup::GlobalSample {
                window_start: SystemTime::UNIX_EPOCH,
                window_end: SystemTime::UNIX_EPOCH + Duration::from_secs(5),
                bytes_sent: 10,
                bytes_received: 0,
            }),
            ..Default::default()
        };

        let writer = StoreWriter::new(3, Duration::from_millis(1));
        assert!(!writer.write(&store, &batch).await);

        let RollupStore::Memory(memory) = &store else {
            unreachable!();
        };
        assert_eq!(memory.raw_global_len(), 0);
    }

    #[tokio::test]
    async fn test_writer_empty_batch_is_noop() {
        let store = RollupStore::Memory(MemoryStore::new());
        let writer = StoreWriter::new(3, Duration::from_millis(1));
        assert!(writer.write(&store, &StoreBatch::default()).await);
    }
}
