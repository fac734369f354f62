//! Consumer runtime
//!
//! The polling loop, its change detector, reconnect backoff and the sinks
//! that receive emitted readings.

pub mod change_detector;
pub mod consumer;
pub mod reconnect;
pub mod sink;

pub use change_detector::{ChangeDetector, DetectorOptions, Observation, WrapPolicy};
pub use consumer::{ConsumerOptions, ConsumerState, ConsumerStats, PollingConsumer};
pub use reconnect::{ReconnectError, ReconnectHelper, ReconnectPolicy};
pub use sink::{ChannelSink, LimitSink, ReadingSink, SinkFlow, TracingSink};
