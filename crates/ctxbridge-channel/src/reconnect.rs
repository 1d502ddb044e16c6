//! Reconnection policy for port clients.
//!
//! After an unexpected disconnect the client waits `reconnect_delay *
//! 2^(attempt-1)`, capped at `max_reconnect_delay`, and opens a new port. The
//! attempt counter resets as soon as the new port sees the server. Once
//! `max_reconnect_attempts` consecutive attempts have been made without
//! success the channel gives up and closes.

use std::time::Duration;

use crate::error::{ChannelError, Result};

/// Backoff settings for automatic reconnection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Reconnect automatically after an unexpected disconnect.
    pub auto_reconnect: bool,
    /// Delay before the first reconnect attempt.
    pub reconnect_delay: Duration,
    /// Upper bound for the exponential backoff.
    pub max_reconnect_delay: Duration,
    /// Consecutive attempts before giving up.
    pub max_reconnect_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            max_reconnect_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// A policy that never reconnects.
    pub fn disabled() -> Self {
        Self {
            auto_reconnect: false,
            ..Self::default()
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_max_reconnect_delay(mut self, delay: Duration) -> Self {
        self.max_reconnect_delay = delay;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Delay before reconnect attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.reconnect_delay
            .saturating_mul(factor)
            .min(self.max_reconnect_delay)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_reconnect_delay < self.reconnect_delay {
            return Err(ChannelError::Config(format!(
                "max reconnect delay {:?} is below reconnect delay {:?}",
                self.max_reconnect_delay, self.reconnect_delay
            )));
        }
        Ok(())
    }
}

/// Attempt counter driven by a [`ReconnectPolicy`].
#[derive(Debug, Clone)]
pub struct Reconnector {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl Reconnector {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, or `None` when reconnection is disabled
    /// or the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.policy.auto_reconnect || self.attempts >= self.policy.max_reconnect_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.policy.delay_for(self.attempts))
    }

    /// Forget previous attempts after a successful reconnect.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Attempts made since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }
}
