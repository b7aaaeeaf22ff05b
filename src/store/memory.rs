use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::SystemTime;

use crate::rollup::{bucket_end, AppSample, GlobalSample, Granularity, RollupBucket};

use super::{RetentionPolicy, StoreBatch, StoreError};

#[derive(Default)]
struct Tables {
    raw_apps: Vec<AppSample>,
    raw_global: Vec<GlobalSample>,
    buckets: HashMap<(Granularity, SystemTime, Option<String>), (u64, u64)>,
}

/// In-memory store used in tests and when no durable backend is configured.
///
/// Mirrors the durable upsert contract: bucket increments fold into one
/// logical row per `(granularity, bucket_start, app)`.
pub struct MemoryStore {
    tables: parking_lot::Mutex<Tables>,
    fail_next: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: parking_lot::Mutex::new(Tables::default()),
            fail_next: AtomicU32::new(0),
        }
    }

    pub fn name(&self) -> &str {
        "memory"
    }

    /// Makes the next `n` inserts fail, for exercising retry paths.
    pub fn fail_next_inserts(&self, n: u32) {
        self.fail_next.store(n, Ordering::Relaxed);
    }

    pub fn insert_batch(&self, batch: &StoreBatch) -> Result<(), StoreError> {
        if self
            .fail_next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }

        let mut tables = self.tables.lock();

        tables.raw_apps.extend(batch.raw_apps.iter().cloned());
        if let Some(global) = batch.raw_global {
            tables.raw_global.push(global);
        }

        for bucket in &batch.rollups {
            let entry = tables
                .buckets
                .entry((bucket.granularity, bucket.bucket_start, bucket.app.clone()))
                .or_insert((0, 0));
            entry.0 += bucket.bytes_sent;
            entry.1 += bucket.bytes_received;
        }

        Ok(())
    }

    pub fn query_range(
        &self,
        granularity: Granularity,
        app: Option<&str>,
        from: SystemTime,
        to: SystemTime,
    ) -> Result<Vec<RollupBucket>, StoreError> {
        let tables = self.tables.lock();

        let mut rows: Vec<RollupBucket> = tables
            .buckets
            .iter()
            .filter(|((g, start, a), _)| {
                *g == granularity && a.as_deref() == app && *start >= from && *start < to
            })
            .map(|((g, start, a), (sent, received))| RollupBucket {
                granularity: *g,
                bucket_start: *start,
                bucket_end: bucket_end(*g, *start),
                app: a.clone(),
                bytes_sent: *sent,
                bytes_received: *received,
            })
            .collect();

        rows.sort_by_key(|b| b.bucket_start);
        Ok(rows)
    }

    pub fn prune(&self, policy: &RetentionPolicy, now: SystemTime) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();

        if let Some(raw_cutoff) = now.checked_sub(policy.raw) {
            tables.raw_apps.retain(|s| s.window_start >= raw_cutoff);
            tables.raw_global.retain(|s| s.window_start >= raw_cutoff);
        }

        tables.buckets.retain(|(g, start, _), _| {
            match now.checked_sub(policy.horizon(*g)) {
                Some(cutoff) => *start >= cutoff,
                None => true,
            }
        });

        Ok(())
    }

    /// Number of raw global rows, for tests.
    pub fn raw_global_len(&self) -> usize {
        self.tables.lock().raw_global.len()
    }

    /// Number of raw app rows, for tests.
    pub fn raw_app_len(&self) -> usize {
        self.tables.lock().raw_apps.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{DateTime, Utc};

    use super::*;

    fn at(s: &str) -> SystemTime {
        s.parse::<DateTime<Utc>>().expect("valid test datetime").into()
    }

    fn increment(start: &str, app: Option<&str>, sent: u64) -> RollupBucket {
        RollupBucket {
            granularity: Granularity::Hourly,
            bucket_start: at(start),
            bucket_end: bucket_end(Granularity::Hourly, at(start)),
            app: app.map(str::to_string),
            bytes_sent: sent,
            bytes_received: 0,
        }
    }

    fn policy(secs: u64) -> RetentionPolicy {
        RetentionPolicy {
            raw: Duration::from_secs(secs),
            hourly: Duration::from_secs(secs),
            daily: Duration::from_secs(secs),
            weekly: Duration::from_secs(secs),
            monthly: Duration::from_secs(secs),
        }
    }

    #[test]
    fn test_bucket_increments_fold_into_one_row() {
        let store = MemoryStore::new();

        for sent in [100, 150, 200] {
            store
                .insert_batch(&StoreBatch {
                    rollups: vec![increment("2024-03-15T10:00:00Z", Some("firefox"), sent)],
                    ..Default::default()
                })
                .expect("insert");
        }

        let rows = store
            .query_range(
                Granularity::Hourly,
                Some("firefox"),
                at("2024-03-15T00:00:00Z"),
                at("2024-03-16T00:00:00Z"),
            )
            .expect("query");

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].bytes_sent, 450);
    }

    #[test]
    fn test_query_range_bounds_and_order() {
        let store = MemoryStore::new();
        store
            .insert_batch(&StoreBatch {
                rollups: vec![
                    increment("2024-03-15T12:00:00Z", None, 3),
                    increment("2024-03-15T10:00:00Z", None, 1),
                    increment("2024-03-15T11:00:00Z", None, 2),
                ],
                ..Default::default()
            })
            .expect("insert");

        let rows = store
            .query_range(
                Granularity::Hourly,
                None,
                at("2024-03-15T10:00:00Z"),
                at("2024-03-15T12:00:00Z"),
            )
            .expect("query");

        // [from, to): the 12:00 bucket is excluded.
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].bytes_sent, 1);
        assert_eq!(rows[1].bytes_sent, 2);
    }

    #[test]
    fn test_query_app_does_not_see_global() {
        let store = MemoryStore::new();
        store
            .insert_batch(&StoreBatch {
                rollups: vec![
                    increment("2024-03-15T10:00:00Z", None, 100),
                    increment("2024-03-15T10:00:00Z", Some("sshd"), 40),
                ],
                ..Default::default()
            })
            .expect("insert");

        let global = store
            .query_range(
                Granularity::Hourly,
                None,
                at("2024-03-15T00:00:00Z"),
                at("2024-03-16T00:00:00Z"),
            )
            .expect("query");
        assert_eq!(global.len(), 1);
        assert_eq!(global[0].bytes_sent, 100);

        let app = store
            .query_range(
                Granularity::Hourly,
                Some("sshd"),
                at("2024-03-15T00:00:00Z"),
                at("2024-03-16T00:00:00Z"),
            )
            .expect("query");
        assert_eq!(app.len(), 1);
        assert_eq!(app[0].bytes_sent, 40);
    }

    #[test]
    fn test_prune_removes_expired_buckets() {
        let store = MemoryStore::new();
        store
            .insert_batch(&StoreBatch {
                rollups: vec![
                    increment("2024-03-15T10:00:00Z", None, 1),
                    increment("2024-03-14T10:00:00Z", None, 2),
                ],
                ..Default::default()
            })
            .expect("insert");

        // Horizon of 12h measured from 2024-03-15T12:00.
        store
            .prune(&policy(12 * 3600), at("2024-03-15T12:00:00Z"))
            .expect("prune");

        let rows = store
            .query_range(
                Granularity::Hourly,
                None,
                at("2024-03-01T00:00:00Z"),
                at("2024-04-01T00:00:00Z"),
            )
            .expect("query");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].bucket_start, at("2024-03-15T10:00:00Z"));
    }

    #[test]
    fn test_injected_failures_decrement() {
        let store = MemoryStore::new();
        store.fail_next_inserts(1);

        let batch = StoreBatch {
            rollups: vec![increment("2024-03-15T10:00:00Z", None, 1)],
            ..Default::default()
        };

        assert!(store.insert_batch(&batch).is_err());
        assert!(store.insert_batch(&batch).is_ok());
    }
}
