//! Transport sessions and mock endpoints
//!
//! A [`TransportSession`] owns one connection and hands raw frames to a
//! codec. Every protocol has exactly one client; the mock servers exist so
//! the clients can be exercised over real sockets.

use async_trait::async_trait;
use errors::GatewayResult;
use gauge_model::CanonicalReading;

pub mod modbus;
#[cfg(feature = "opcua")]
pub mod opcua;
pub mod s7;
pub mod variable_space;

/// Connection to one protocol endpoint
#[async_trait]
pub trait TransportSession: Send {
    /// Raw frame type this session produces
    type Frame: Send;

    /// Endpoint description for logs and errors
    fn endpoint(&self) -> String;

    /// Establish the session; a failure is a `Connection` error
    async fn connect(&mut self) -> GatewayResult<()>;

    /// Read one raw frame
    ///
    /// `TransientRead` for a failed poll, `Connection` when the transport
    /// is gone, `FatalIncompatibility` when the endpoint cannot serve frames.
    async fn fetch(&mut self) -> GatewayResult<Self::Frame>;

    /// Release the session; safe to call when not connected
    async fn close(&mut self);

    fn is_connected(&self) -> bool;
}

/// Endpoint that accepts whole readings from a producer
///
/// Implemented by the mock endpoints so the synthetic producer can feed any
/// of them.
pub trait ReadingPublisher: Send + Sync {
    fn publish(&self, reading: &CanonicalReading);
}
