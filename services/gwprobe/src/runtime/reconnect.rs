//! Reconnection backoff
//!
//! Exponential backoff with optional ±25% jitter. The first attempt of a
//! sequence goes out immediately; every later one waits, and the wait is raced
//! against the consumer's cancellation token.
//!
//! A sequence only ends once a session has delivered data
//! ([`ReconnectHelper::mark_stable`]). A peer that accepts the connection and
//! drops it on the first request keeps backing off.

use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ReconnectConfig;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ReconnectError {
    /// Maximum retry attempts exceeded
    #[error("Maximum reconnection attempts ({0}) exceeded")]
    MaxAttemptsExceeded(u32),

    /// Backoff wait interrupted by shutdown
    #[error("Reconnection cancelled")]
    Cancelled,
}

/// Reconnection policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Maximum retry attempts (0 means unlimited)
    pub max_attempts: u32,
    /// Initial delay between attempts
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Backoff multiplier for exponential delay
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_multiplier: config.backoff_multiplier,
            jitter: config.jitter,
        }
    }

    fn attempts_label(&self) -> String {
        if self.max_attempts == 0 {
            "∞".to_string()
        } else {
            self.max_attempts.to_string()
        }
    }
}

/// Reconnection statistics tracking
#[derive(Debug, Default, Clone)]
pub struct ReconnectStats {
    pub total_attempts: u64,
    pub successful_connects: u64,
    pub failed_attempts: u64,
    pub last_connected: Option<Instant>,
}

/// Tracks attempts of one connect sequence
#[derive(Debug)]
pub struct ReconnectHelper {
    policy: ReconnectPolicy,
    current_attempt: u32,
    stats: ReconnectStats,
}

impl ReconnectHelper {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            current_attempt: 0,
            stats: ReconnectStats::default(),
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn stats(&self) -> &ReconnectStats {
        &self.stats
    }

    /// Attempts made in the current sequence
    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }

    /// Delay before the current attempt
    pub fn calculate_next_delay(&self) -> Duration {
        let attempt = self.current_attempt.saturating_sub(1);
        let multiplier = self.policy.backoff_multiplier;

        // delay = initial_delay * (multiplier ^ attempt), capped
        let factor = multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.policy.initial_delay.as_secs_f64() * factor;
        let mut delay = if secs.is_finite() && secs < self.policy.max_delay.as_secs_f64() {
            Duration::from_secs_f64(secs.max(0.0))
        } else {
            self.policy.max_delay
        };

        // Add jitter (±25% of delay)
        if self.policy.jitter && !delay.is_zero() {
            let jitter_range = delay.as_millis() as f64 * 0.25;
            if jitter_range > 0.0 {
                let jitter = rand::thread_rng().gen_range(-jitter_range..jitter_range);
                let delay_ms = (delay.as_millis() as f64 + jitter).max(0.0);
                delay = Duration::from_millis(delay_ms as u64);
            }
        }

        delay
    }

    /// Start the next attempt, sleeping for its backoff first
    ///
    /// Returns the 1-based attempt number.
    pub async fn wait_for_attempt(
        &mut self,
        token: &CancellationToken,
    ) -> Result<u32, ReconnectError> {
        if self.policy.max_attempts > 0 && self.current_attempt >= self.policy.max_attempts {
            warn!(
                "Maximum reconnection attempts ({}) exceeded",
                self.policy.max_attempts
            );
            return Err(ReconnectError::MaxAttemptsExceeded(self.policy.max_attempts));
        }

        self.current_attempt += 1;
        self.stats.total_attempts += 1;

        if self.current_attempt > 1 {
            let delay = self.calculate_next_delay();
            info!(
                "Waiting {:?} before connection attempt {}/{}",
                delay,
                self.current_attempt,
                self.policy.attempts_label()
            );
            tokio::select! {
                _ = token.cancelled() => return Err(ReconnectError::Cancelled),
                _ = tokio::time::sleep(delay) => {},
            }
        } else {
            debug!("Connection attempt 1/{}", self.policy.attempts_label());
        }

        Ok(self.current_attempt)
    }

    /// Connection established; the attempt count is kept until the session
    /// proves stable
    pub fn mark_connected(&mut self) {
        if self.current_attempt > 1 {
            info!("Connected after {} attempts", self.current_attempt);
        }
        self.stats.successful_connects += 1;
        self.stats.last_connected = Some(Instant::now());
    }

    /// The session delivered data; the next loss starts a fresh sequence
    pub fn mark_stable(&mut self) {
        if self.current_attempt > 0 {
            debug!("Session stable, backoff reset");
            self.current_attempt = 0;
        }
    }

    pub fn mark_failed(&mut self, reason: &impl std::fmt::Display) {
        self.stats.failed_attempts += 1;
        warn!(
            "Connection attempt {}/{} failed: {}",
            self.current_attempt,
            self.policy.attempts_label(),
            reason
        );
    }
}
