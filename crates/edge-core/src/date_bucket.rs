//! Calendar-day buckets used as the dedup window.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::sync::Mutex;

pub const DEFAULT_TIMEZONE: &str = "Asia/Shanghai";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BucketZone {
    Named(Tz),
    Utc,
}

impl BucketZone {
    /// Unknown identifiers fall back to UTC.
    pub fn parse(name: &str) -> Self {
        match name.trim().parse::<Tz>() {
            Ok(tz) => BucketZone::Named(tz),
            Err(err) => {
                tracing::warn!(timezone = name, error = %err, "unknown timezone, bucketing by UTC");
                BucketZone::Utc
            }
        }
    }
}

impl Default for BucketZone {
    fn default() -> Self {
        BucketZone::Named(chrono_tz::Asia::Shanghai)
    }
}

/// `YYYY-MM-DD` of `instant` as seen in `zone`.
pub fn date_bucket(zone: BucketZone, instant: DateTime<Utc>) -> String {
    match zone {
        BucketZone::Named(tz) => instant.with_timezone(&tz).format("%Y-%m-%d").to_string(),
        BucketZone::Utc => instant.format("%Y-%m-%d").to_string(),
    }
}

pub fn current_date(zone: BucketZone) -> String {
    date_bucket(zone, Utc::now())
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        let mut guard = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
