pub mod engine;

use std::fmt;
use std::time::SystemTime;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Months, TimeZone, Timelike, Utc};

/// Rollup bucket width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Granularity {
    Hourly = 0,
    Daily = 1,
    Weekly = 2,
    Monthly = 3,
}

impl Granularity {
    /// Returns the canonical table/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }

    /// Return all granularities in ascending width order.
    pub fn all() -> &'static [Self] {
        &[Self::Hourly, Self::Daily, Self::Weekly, Self::Monthly]
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Start of the calendar-aligned bucket containing `at`.
///
/// Hours and days align to the UTC calendar, weeks to ISO weeks (Monday
/// start), months to the first of the month.
pub fn bucket_start(granularity: Granularity, at: SystemTime) -> SystemTime {
    let dt: DateTime<Utc> = at.into();
    let date = dt.date_naive();

    let naive = match granularity {
        Granularity::Hourly => date
            .and_hms_opt(dt.hour(), 0, 0)
            .expect("hour from a valid datetime"),
        Granularity::Daily => date.and_hms_opt(0, 0, 0).expect("midnight is valid"),
        Granularity::Weekly => {
            let monday =
                date - ChronoDuration::days(i64::from(date.weekday().num_days_from_monday()));
            monday.and_hms_opt(0, 0, 0).expect("midnight is valid")
        }
        Granularity::Monthly => date
            .with_day(1)
            .expect("day 1 exists in every month")
            .and_hms_opt(0, 0, 0)
            .expect("midnight is valid"),
    };

    Utc.from_utc_datetime(&naive).into()
}

/// Exclusive end of the bucket beginning at `start`.
pub fn bucket_end(granularity: Granularity, start: SystemTime) -> SystemTime {
    let dt: DateTime<Utc> = start.into();

    let end = match granularity {
        Granularity::Hourly => dt + ChronoDuration::hours(1),
        Granularity::Daily => dt + ChronoDuration::days(1),
        Granularity::Weekly => dt + ChronoDuration::days(7),
        Granularity::Monthly => dt
            .checked_add_months(Months::new(1))
            .expect("in-range month arithmetic"),
    };

    end.into()
}

/// Per-app traffic for one poll interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppSample {
    pub app: String,
    pub window_start: SystemTime,
    pub window_end: SystemTime,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// System-wide traffic for one poll interval, summed across all apps and
/// unattributed flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalSample {
    pub window_start: SystemTime,
    pub window_end: SystemTime,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// One interval's complete sample emission, delivered as a unit.
///
/// `window_end` doubles as the idempotence marker: windows are emitted with
/// strictly increasing ends, so a redelivered batch is detectable.
#[derive(Debug, Clone)]
pub struct SampleBatch {
    pub window_start: SystemTime,
    pub window_end: SystemTime,
    pub apps: Vec<AppSample>,
    pub global: GlobalSample,
}

/// A rollup bucket increment or stored row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupBucket {
    pub granularity: Granularity,
    pub bucket_start: SystemTime,
    pub bucket_end: SystemTime,
    /// `None` for the global (system-wide) series.
    pub app: Option<String>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}
