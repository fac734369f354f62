//! Canonical thickness reading

use chrono::{DateTime, Utc};
use errors::{GatewayError, GatewayResult};
use serde::Serialize;
use std::fmt;

use crate::status::Status;
use crate::time;

/// One thickness sample, independent of the protocol it arrived on
///
/// Immutable once built; construct through [`CanonicalReading::new`] so the
/// finite-thickness invariant always holds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CanonicalReading {
    thickness: f32,
    timestamp_ms: u64,
    status: Status,
    sequence: u32,
}

impl CanonicalReading {
    /// Build a reading, rejecting NaN and infinite thickness
    pub fn new(
        thickness: f32,
        timestamp_ms: u64,
        status: Status,
        sequence: u32,
    ) -> GatewayResult<Self> {
        if !thickness.is_finite() {
            return Err(GatewayError::malformed(
                "thickness is not finite",
                "finite f32",
                format!("{} (0x{:08X})", thickness, thickness.to_bits()),
            ));
        }
        Ok(Self {
            thickness,
            timestamp_ms,
            status,
            sequence,
        })
    }

    /// Thickness in millimeters
    pub fn thickness(&self) -> f32 {
        self.thickness
    }

    /// Acquisition time, Unix epoch milliseconds
    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// `false` until the producer has published its first sample
    pub fn has_sample(&self) -> bool {
        self.sequence != 0
    }

    pub fn acquired_at(&self) -> Option<DateTime<Utc>> {
        time::to_datetime(self.timestamp_ms)
    }
}

impl fmt::Display for CanonicalReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "seq={} thickness={:.3}mm status={}",
            self.sequence, self.thickness, self.status
        )?;
        match self.acquired_at() {
            Some(at) => write!(f, " at={}", at.format("%Y-%m-%dT%H:%M:%S%.3fZ")),
            None => write!(f, " ts={}", self.timestamp_ms),
        }
    }
}
