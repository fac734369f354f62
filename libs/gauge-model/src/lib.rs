//! Thickness gauge reading model
//!
//! The protocol-independent record every codec produces, plus the helpers
//! for its status bitfield, sequence counter width and timestamps.

pub mod reading;
pub mod sequence;
pub mod status;
pub mod time;

pub use reading::CanonicalReading;
pub use sequence::SequenceWidth;
pub use status::{ErrorCode, Status};
pub use time::{FixedTimeProvider, SystemTimeProvider, TimeProvider};
