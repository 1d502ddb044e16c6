//! Readiness handshake driving.
//!
//! Starting order between client and server is arbitrary, so both sides
//! announce themselves:
//! - the server posts `mcp-server-ready` when it starts and in reply to every
//!   `mcp-check-ready`
//! - the client posts `mcp-check-ready` when it starts and repeats it every
//!   [`HandshakeConfig::retry_interval`] until the [`ReadySignal`] leaves
//!   `Pending` or the channel is cancelled
//!
//! [`ReadinessProbe`] runs the client half. [`spawn_keep_alive`] runs the
//! optional periodic liveness probe of port clients.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{ChannelError, Result};
use crate::ready::ReadySignal;

/// Default interval between readiness probes.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for the client side of the readiness handshake.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Delay between `mcp-check-ready` probes while the server is unseen.
    pub retry_interval: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

impl HandshakeConfig {
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.retry_interval.is_zero() {
            return Err(ChannelError::Config(
                "handshake retry interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Repeats a readiness probe until the peer answers.
pub struct ReadinessProbe {
    interval: Duration,
    task: Mutex<Option<AbortHandle>>,
}

impl ReadinessProbe {
    pub fn new(config: &HandshakeConfig) -> Self {
        Self {
            interval: config.retry_interval,
            task: Mutex::new(None),
        }
    }

    /// (Re)start probing: `probe` runs immediately, then once per interval
    /// until `ready` leaves `Pending` or `cancel` fires.
    ///
    /// A probe loop that was already running is replaced.
    pub fn restart(
        &self,
        ready: ReadySignal,
        cancel: CancellationToken,
        probe: impl Fn() + Send + 'static,
    ) {
        let interval = self.interval;
        let handle = tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                attempt += 1;
                trace!(attempt, "sending readiness probe");
                probe();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ready.wait() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        })
        .abort_handle();

        if let Some(previous) = self.slot().replace(handle) {
            previous.abort();
        }
    }

    /// Stop probing.
    pub fn stop(&self) {
        if let Some(task) = self.slot().take() {
            task.abort();
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<AbortHandle>> {
        self.task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for ReadinessProbe {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for ReadinessProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadinessProbe")
            .field("interval", &self.interval)
            .field("running", &self.slot().is_some())
            .finish()
    }
}

/// Run `probe` every `interval` until `cancel` fires.
pub fn spawn_keep_alive(
    interval: Duration,
    cancel: CancellationToken,
    probe: impl Fn() + Send + 'static,
) -> AbortHandle {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => probe(),
            }
        }
    })
    .abort_handle()
}
