//! Write-side backpressure for stream channels.
//!
//! The controller counts bytes handed to the writer task that have not been
//! flushed yet. Once that count reaches the high-water mark, a sender waits
//! for the writer to drain below it before queueing its message. A sender
//! that gives up waiting has queued nothing.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::trace;

use crate::error::{ChannelError, Result};

/// Default high-water mark: 64 KiB of unflushed output.
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024;

/// Default time a sender waits for the writer to drain.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct Shared {
    buffered: AtomicUsize,
    closed: AtomicBool,
    drained: Notify,
}

/// Tracks unflushed bytes and makes senders wait for drain.
#[derive(Debug, Clone)]
pub struct BackpressureController {
    shared: Arc<Shared>,
    high_water_mark: usize,
    drain_timeout: Duration,
}

impl BackpressureController {
    pub fn new(high_water_mark: usize) -> Self {
        Self::with_timeout(high_water_mark, DEFAULT_DRAIN_TIMEOUT)
    }

    pub fn with_timeout(high_water_mark: usize, drain_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                buffered: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                drained: Notify::new(),
            }),
            high_water_mark,
            drain_timeout,
        }
    }

    /// Account for `len` bytes queued for writing.
    ///
    /// Returns false when the buffer is now at or above the high-water mark
    /// and the caller should [`wait_for_drain`](Self::wait_for_drain).
    pub fn enqueue(&self, len: usize) -> bool {
        let buffered = self.shared.buffered.fetch_add(len, Ordering::AcqRel) + len;
        buffered < self.high_water_mark
    }

    /// Account for `len` bytes flushed by the writer.
    pub fn complete(&self, len: usize) {
        let previous = self
            .shared
            .buffered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(len))
            })
            .unwrap_or_default();
        let buffered = previous.saturating_sub(len);
        if buffered < self.high_water_mark {
            self.shared.drained.notify_waiters();
        }
    }

    /// Wait until the buffer is below the high-water mark.
    pub async fn wait_for_drain(&self) -> Result<()> {
        let wait = async {
            loop {
                let notified = self.shared.drained.notified();
                if self.shared.closed.load(Ordering::Acquire) {
                    return Err(ChannelError::Disconnected(
                        "stream closed while waiting for drain".to_string(),
                    ));
                }
                if self.buffered() < self.high_water_mark {
                    return Ok(());
                }
                trace!(buffered = self.buffered(), "waiting for write drain");
                notified.await;
            }
        };

        tokio::time::timeout(self.drain_timeout, wait)
            .await
            .map_err(|_| ChannelError::DrainTimeout(self.drain_timeout))?
    }

    /// Release every waiter with an error. Further waits fail immediately.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.drained.notify_waiters();
    }

    /// Bytes queued but not yet flushed.
    pub fn buffered(&self) -> usize {
        self.shared.buffered.load(Ordering::Acquire)
    }

    /// Returns true while the buffer is at or above the high-water mark.
    pub fn is_active(&self) -> bool {
        self.buffered() >= self.high_water_mark
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }
}

impl Default for BackpressureController {
    fn default() -> Self {
        Self::new(DEFAULT_HIGH_WATER_MARK)
    }
}
