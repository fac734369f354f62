//! Synthetic reading producer
//!
//! Feeds the mock endpoints with readings whose sequence increments and
//! whose thickness drifts along a triangle wave, so a consumer has something
//! to detect.

use std::sync::Arc;
use std::time::Duration;

use errors::GatewayResult;
use gauge_model::{
    CanonicalReading, ErrorCode, SequenceWidth, Status, SystemTimeProvider, TimeProvider,
};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocols::ReadingPublisher;

pub struct SyntheticProducer {
    width: SequenceWidth,
    base_thickness: f32,
    amplitude: f32,
    /// Samples per triangle period
    period: u32,
    time: Arc<dyn TimeProvider>,
    sequence: u32,
    step: u32,
    /// Every n-th sample carries a timeout error code
    fault_every: Option<u32>,
}

impl Default for SyntheticProducer {
    fn default() -> Self {
        Self::new(SequenceWidth::Bits16)
    }
}

impl SyntheticProducer {
    pub fn new(width: SequenceWidth) -> Self {
        Self {
            width,
            base_thickness: 50.0,
            amplitude: 2.5,
            period: 40,
            time: Arc::new(SystemTimeProvider),
            sequence: 0,
            step: 0,
            fault_every: None,
        }
    }

    /// Non-finite values make every reading fail to build
    pub fn with_thickness(mut self, base: f32, amplitude: f32) -> Self {
        self.base_thickness = base;
        self.amplitude = amplitude;
        self
    }

    pub fn with_time_provider(mut self, time: Arc<dyn TimeProvider>) -> Self {
        self.time = time;
        self
    }

    pub fn with_fault_every(mut self, every: Option<u32>) -> Self {
        self.fault_every = every.filter(|n| *n > 0);
        self
    }

    /// Start after `sequence`; the next reading carries its successor
    pub fn starting_after(mut self, sequence: u32) -> Self {
        self.sequence = self.width.truncate(sequence);
        self
    }

    fn thickness_at(&self, step: u32) -> f32 {
        let half = (self.period / 2).max(1);
        let phase = step % (half * 2);
        // Triangle wave in [-1, 1]
        let ramp = if phase < half {
            phase as f32 / half as f32
        } else {
            2.0 - phase as f32 / half as f32
        };
        self.base_thickness + self.amplitude * (2.0 * ramp - 1.0)
    }

    pub fn next_reading(&mut self) -> GatewayResult<CanonicalReading> {
        self.sequence = self.width.successor(self.sequence);
        let step = self.step;
        self.step = self.step.wrapping_add(1);

        let faulted = self
            .fault_every
            .is_some_and(|every| step.wrapping_add(1) % every == 0);
        let status = if faulted {
            Status::HEALTHY.with_error(Some(ErrorCode::Timeout))
        } else {
            Status::HEALTHY
        };

        CanonicalReading::new(
            self.thickness_at(step),
            self.time.now_millis(),
            status,
            self.sequence,
        )
    }

    /// Publish a reading every `interval` until cancelled
    pub async fn run(
        mut self,
        interval: Duration,
        token: CancellationToken,
        publisher: Arc<dyn ReadingPublisher>,
    ) {
        info!("Synthetic producer started ({:?} interval)", interval);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {},
            }
            match self.next_reading() {
                Ok(reading) => {
                    debug!("Publishing {}", reading);
                    publisher.publish(&reading);
                },
                Err(e) => warn!("Skipping synthetic sample: {}", e),
            }
        }
        info!("Synthetic producer stopped at sequence {}", self.sequence);
    }
}
