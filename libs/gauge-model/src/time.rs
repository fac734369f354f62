//! Time provider abstraction for reading timestamps
//!
//! Producers stamp readings through a [`TimeProvider`] so tests can pin the
//! acquisition time.

use chrono::{DateTime, TimeZone, Utc};
use std::time::{SystemTime, UNIX_EPOCH};

/// Time provider trait for generating timestamps
pub trait TimeProvider: Send + Sync + 'static {
    /// Current timestamp in milliseconds since Unix epoch
    fn now_millis(&self) -> u64;
}

/// System time provider using local clock
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now_millis(&self) -> u64 {
        // A clock set before 1970 reports the epoch rather than panicking
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Fixed time provider for testing
#[derive(Clone, Copy, Debug)]
pub struct FixedTimeProvider {
    timestamp_ms: u64,
}

impl FixedTimeProvider {
    pub fn new(timestamp_ms: u64) -> Self {
        Self { timestamp_ms }
    }
}

impl TimeProvider for FixedTimeProvider {
    fn now_millis(&self) -> u64 {
        self.timestamp_ms
    }
}

/// Convert epoch milliseconds into a UTC datetime
///
/// Returns `None` for values chrono cannot represent.
pub fn to_datetime(timestamp_ms: u64) -> Option<DateTime<Utc>> {
    let millis = i64::try_from(timestamp_ms).ok()?;
    Utc.timestamp_millis_opt(millis).single()
}
