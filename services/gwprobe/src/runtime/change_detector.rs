//! Sequence-based change detection
//!
//! A reading is new when its sequence differs from the last one emitted.
//! Sequence 0 means the producer has not written a sample yet.

use gauge_model::CanonicalReading;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// What to do when the sequence steps backwards
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WrapPolicy {
    /// Any different sequence is a new sample
    #[default]
    Accept,
    /// A backward step becomes the new baseline without an event
    Suppress,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorOptions {
    /// Emit only after two consecutive polls agree on a sequence
    pub strict_consistency: bool,
    pub wrap_policy: WrapPolicy,
}

/// Outcome of one decoded poll
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    /// Sequence 0, nothing published yet
    Empty,
    Unchanged,
    /// New sequence held until the next poll confirms it
    Pending,
    /// Backward step taken as the new baseline
    Rebased,
    Emit(CanonicalReading),
}

#[derive(Debug, Default)]
pub struct ChangeDetector {
    options: DetectorOptions,
    last_sequence: u32,
    pending: Option<u32>,
}

impl ChangeDetector {
    pub fn new(options: DetectorOptions) -> Self {
        Self {
            options,
            last_sequence: 0,
            pending: None,
        }
    }

    /// Sequence of the last emitted (or rebased) reading, 0 before any
    pub fn last_sequence(&self) -> u32 {
        self.last_sequence
    }

    pub fn observe(&mut self, reading: CanonicalReading) -> Observation {
        let sequence = reading.sequence();
        if sequence == 0 {
            self.pending = None;
            return Observation::Empty;
        }
        if sequence == self.last_sequence {
            self.pending = None;
            return Observation::Unchanged;
        }

        if self.options.wrap_policy == WrapPolicy::Suppress
            && self.last_sequence != 0
            && sequence < self.last_sequence
        {
            info!(
                "Sequence stepped back {} -> {}, taking it as the new baseline",
                self.last_sequence, sequence
            );
            self.last_sequence = sequence;
            self.pending = None;
            return Observation::Rebased;
        }

        if self.options.strict_consistency && self.pending != Some(sequence) {
            if let Some(dropped) = self.pending.replace(sequence) {
                debug!("Provisional sequence {} superseded by {}", dropped, sequence);
            }
            return Observation::Pending;
        }

        self.pending = None;
        self.last_sequence = sequence;
        Observation::Emit(reading)
    }
}
