//! Polling consumer
//!
//! Drives one transport session through
//! `Disconnected → Connecting → Connected`, polling at a fixed interval and
//! passing each decoded reading through the change detector. Every await is
//! raced against the cancellation token; the session is closed on every
//! exit path.

use std::time::Duration;

use errors::{ErrorCategory, GatewayError, GatewayResult};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};

use super::change_detector::{ChangeDetector, DetectorOptions, Observation};
use super::reconnect::{ReconnectError, ReconnectHelper, ReconnectPolicy};
use super::sink::{ReadingSink, SinkFlow};
use crate::codec::Codec;
use crate::protocols::TransportSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Connected,
    Stopped,
}

/// Counters reported when the consumer stops
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub polls: u64,
    pub emitted: u64,
    pub unchanged: u64,
    pub empty: u64,
    pub pending: u64,
    pub rebased: u64,
    pub transient_errors: u64,
    pub malformed_frames: u64,
    pub reconnects: u64,
    /// Sequence of the last emitted reading
    pub last_sequence: u32,
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub poll_interval: Duration,
    pub detector: DetectorOptions,
    pub reconnect: ReconnectPolicy,
}

impl ConsumerOptions {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            detector: DetectorOptions::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Why the connected loop returned
enum SessionEnd {
    Cancelled,
    SinkStopped,
    Lost,
}

pub struct PollingConsumer<T, C, S>
where
    T: TransportSession,
    C: Codec<Frame = T::Frame>,
    S: ReadingSink,
{
    session: T,
    codec: C,
    sink: S,
    options: ConsumerOptions,
    detector: ChangeDetector,
    reconnect: ReconnectHelper,
    stats: ConsumerStats,
    state_tx: watch::Sender<ConsumerState>,
}

impl<T, C, S> PollingConsumer<T, C, S>
where
    T: TransportSession,
    C: Codec<Frame = T::Frame>,
    S: ReadingSink,
{
    pub fn new(session: T, codec: C, sink: S, options: ConsumerOptions) -> Self {
        let (state_tx, _) = watch::channel(ConsumerState::Disconnected);
        Self {
            detector: ChangeDetector::new(options.detector),
            reconnect: ReconnectHelper::new(options.reconnect.clone()),
            session,
            codec,
            sink,
            options,
            stats: ConsumerStats::default(),
            state_tx,
        }
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<ConsumerState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> ConsumerState {
        *self.state_tx.borrow()
    }

    pub fn stats(&self) -> &ConsumerStats {
        &self.stats
    }

    fn set_state(&self, state: ConsumerState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!("{}: {:?} -> {:?}", self.session.endpoint(), current, state);
            *current = state;
            true
        });
    }

    /// Run until cancelled, stopped by the sink, or a fatal error
    ///
    /// Returns the statistics on a clean stop. Fatal errors and exhaustion
    /// of a bounded reconnect policy are returned as errors; the session is
    /// closed in every case.
    pub async fn run(&mut self, token: CancellationToken) -> GatewayResult<ConsumerStats> {
        info!(
            "Consuming {} as {} every {:?}",
            self.session.endpoint(),
            self.codec.name(),
            self.options.poll_interval
        );
        let result = self.run_inner(&token).await;

        self.session.close().await;
        self.set_state(ConsumerState::Stopped);
        self.stats.last_sequence = self.detector.last_sequence();

        match &result {
            Ok(()) => info!(
                "Consumer for {} stopped: {} polls, {} emitted, {} reconnects",
                self.session.endpoint(),
                self.stats.polls,
                self.stats.emitted,
                self.stats.reconnects
            ),
            Err(e) => error!(
                error_code = e.error_code(),
                "Consumer for {} failed: {}",
                self.session.endpoint(),
                e
            ),
        }
        result.map(|()| self.stats.clone())
    }

    async fn run_inner(&mut self, token: &CancellationToken) -> GatewayResult<()> {
        loop {
            if !self.establish(token).await? {
                return Ok(());
            }
            match self.poll_connected(token).await? {
                SessionEnd::Cancelled | SessionEnd::SinkStopped => return Ok(()),
                SessionEnd::Lost => {
                    self.session.close().await;
                    self.set_state(ConsumerState::Disconnected);
                    self.stats.reconnects += 1;
                },
            }
        }
    }

    /// Connect with backoff; `false` when cancelled first
    async fn establish(&mut self, token: &CancellationToken) -> GatewayResult<bool> {
        loop {
            self.set_state(ConsumerState::Connecting);
            match self.reconnect.wait_for_attempt(token).await {
                Ok(_) => {},
                Err(ReconnectError::Cancelled) => return Ok(false),
                Err(ReconnectError::MaxAttemptsExceeded(n)) => {
                    return Err(GatewayError::connection(
                        self.session.endpoint(),
                        format!("gave up after {} attempts", n),
                    ));
                },
            }

            let attempt = tokio::select! {
                _ = token.cancelled() => return Ok(false),
                result = self.session.connect() => result,
            };
            match attempt {
                Ok(()) => {
                    self.reconnect.mark_connected();
                    self.set_state(ConsumerState::Connected);
                    return Ok(true);
                },
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    self.reconnect.mark_failed(&e);
                    self.session.close().await;
                },
            }
        }
    }

    async fn poll_connected(&mut self, token: &CancellationToken) -> GatewayResult<SessionEnd> {
        let mut ticker = tokio::time::interval(self.options.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(SessionEnd::Cancelled),
                _ = ticker.tick() => {},
            }

            let fetched = tokio::select! {
                _ = token.cancelled() => return Ok(SessionEnd::Cancelled),
                fetched = self.session.fetch() => fetched,
            };
            self.stats.polls += 1;

            let frame = match fetched {
                Ok(frame) => {
                    // The peer answered, so the next loss starts a fresh backoff
                    self.reconnect.mark_stable();
                    frame
                },
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    let endpoint = self.session.endpoint();
                    match e.category() {
                        ErrorCategory::Connection => {
                            report(&endpoint, "connection lost", &e);
                            return Ok(SessionEnd::Lost);
                        },
                        ErrorCategory::Decode => {
                            self.stats.malformed_frames += 1;
                            report(&endpoint, "discarding sample", &e);
                        },
                        _ => {
                            self.stats.transient_errors += 1;
                            report(&endpoint, "poll failed", &e);
                        },
                    }
                    continue;
                },
            };

            let reading = match self.codec.decode(&frame) {
                Ok(reading) => reading,
                Err(e) => {
                    self.stats.malformed_frames += 1;
                    report(&self.session.endpoint(), "discarding sample", &e);
                    continue;
                },
            };

            match self.detector.observe(reading) {
                Observation::Empty => self.stats.empty += 1,
                Observation::Unchanged => self.stats.unchanged += 1,
                Observation::Pending => self.stats.pending += 1,
                Observation::Rebased => self.stats.rebased += 1,
                Observation::Emit(reading) => {
                    self.stats.emitted += 1;
                    if self.sink.deliver(reading).await == SinkFlow::Stop {
                        debug!("Sink requested stop after sequence {}", reading.sequence());
                        return Ok(SessionEnd::SinkStopped);
                    }
                },
            }
        }
    }
}

/// Log at the level the error's category calls for, tagged with its code
fn report(endpoint: &str, context: &str, e: &GatewayError) {
    if e.log_level() == Level::ERROR {
        error!(error_code = e.error_code(), "{}: {}: {}", endpoint, context, e);
    } else {
        warn!(error_code = e.error_code(), "{}: {}: {}", endpoint, context, e);
    }
}
