//! Destinations for emitted readings

use async_trait::async_trait;
use gauge_model::CanonicalReading;
use tokio::sync::mpsc;
use tracing::info;

/// Whether the consumer keeps polling after a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkFlow {
    Continue,
    Stop,
}

#[async_trait]
pub trait ReadingSink: Send {
    async fn deliver(&mut self, reading: CanonicalReading) -> SinkFlow;
}

/// Logs each reading at info level
#[derive(Debug, Clone)]
pub struct TracingSink {
    source: String,
}

impl TracingSink {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

#[async_trait]
impl ReadingSink for TracingSink {
    async fn deliver(&mut self, reading: CanonicalReading) -> SinkFlow {
        info!(
            source = %self.source,
            sequence = reading.sequence(),
            thickness = reading.thickness(),
            timestamp_ms = reading.timestamp_ms(),
            status = %reading.status(),
            "New reading"
        );
        SinkFlow::Continue
    }
}

/// Forwards readings into an mpsc channel; stops when the receiver is gone
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<CanonicalReading>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<CanonicalReading>) -> Self {
        Self { tx }
    }

    /// Sink plus its receiving end
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<CanonicalReading>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl ReadingSink for ChannelSink {
    async fn deliver(&mut self, reading: CanonicalReading) -> SinkFlow {
        match self.tx.send(reading).await {
            Ok(()) => SinkFlow::Continue,
            Err(_) => SinkFlow::Stop,
        }
    }
}

/// Stops the consumer after `limit` deliveries
#[derive(Debug)]
pub struct LimitSink<S> {
    inner: S,
    remaining: Option<u64>,
}

impl<S: ReadingSink> LimitSink<S> {
    /// `None` never stops
    pub fn new(inner: S, limit: Option<u64>) -> Self {
        Self {
            inner,
            remaining: limit,
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<S: ReadingSink> ReadingSink for LimitSink<S> {
    async fn deliver(&mut self, reading: CanonicalReading) -> SinkFlow {
        if self.remaining == Some(0) {
            return SinkFlow::Stop;
        }
        let flow = self.inner.deliver(reading).await;
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                return SinkFlow::Stop;
            }
        }
        flow
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use gauge_model::Status;
    use tracing_test::traced_test;

    fn reading(sequence: u32) -> CanonicalReading {
        CanonicalReading::new(1.5, 42, Status::HEALTHY, sequence).unwrap()
    }

    #[tokio::test]
    async fn test_limit_sink_stops_after_limit() {
        let (sink, mut rx) = ChannelSink::channel(8);
        let mut sink = LimitSink::new(sink, Some(2));

        assert_eq!(sink.deliver(reading(1)).await, SinkFlow::Continue);
        assert_eq!(sink.deliver(reading(2)).await, SinkFlow::Stop);
        assert_eq!(sink.deliver(reading(3)).await, SinkFlow::Stop);

        assert_eq!(rx.recv().await.unwrap().sequence(), 1);
        assert_eq!(rx.recv().await.unwrap().sequence(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_channel_sink_stops_when_receiver_dropped() {
        let (mut sink, rx) = ChannelSink::channel(1);
        drop(rx);
        assert_eq!(sink.deliver(reading(1)).await, SinkFlow::Stop);
    }

    #[traced_test]
    #[tokio::test]
    async fn test_tracing_sink_logs_reading() {
        let mut sink = TracingSink::new("modbus");
        assert_eq!(sink.deliver(reading(7)).await, SinkFlow::Continue);
        assert!(logs_contain("New reading"));
        assert!(logs_contain("sequence=7"));
    }
}
