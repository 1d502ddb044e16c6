//! One-shot-per-connection readiness signal.
//!
//! Clients hold sends until the server has been seen. The signal is `Pending`
//! until the first server-ready control signal (or any valid server message)
//! arrives; it can go back to `Pending` when the server announces it stopped or
//! a port reconnects, and it fails permanently when the channel closes.

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{ChannelError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum ReadyState {
    Pending,
    Ready,
    Failed(String),
}

/// Shared readiness flag with async waiters.
#[derive(Debug, Clone)]
pub struct ReadySignal {
    tx: Arc<watch::Sender<ReadyState>>,
}

impl ReadySignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ReadyState::Pending);
        Self { tx: Arc::new(tx) }
    }

    /// Mark the peer ready. Returns true if this call changed the state.
    pub fn signal_ready(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == ReadyState::Pending {
                *state = ReadyState::Ready;
                true
            } else {
                false
            }
        })
    }

    /// Fail every current and future waiter. No effect once already failed.
    pub fn signal_failed(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.tx.send_if_modified(|state| {
            if matches!(state, ReadyState::Failed(_)) {
                false
            } else {
                *state = ReadyState::Failed(reason);
                true
            }
        });
    }

    /// Go back to `Pending` after the peer went away. No effect once failed.
    pub fn reset(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == ReadyState::Ready {
                *state = ReadyState::Pending;
                true
            } else {
                false
            }
        })
    }

    pub fn is_ready(&self) -> bool {
        *self.tx.borrow() == ReadyState::Ready
    }

    pub fn is_failed(&self) -> bool {
        matches!(*self.tx.borrow(), ReadyState::Failed(_))
    }

    /// Wait until the peer is ready.
    ///
    /// Fails with [`ChannelError::ClosedBeforeReady`] if the signal fails first.
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.tx.subscribe();
        let state = rx
            .wait_for(|state| *state != ReadyState::Pending)
            .await
            .map(|state| state.clone())
            .map_err(|_| ChannelError::ClosedBeforeReady("readiness signal dropped".to_string()))?;

        match state {
            ReadyState::Ready => Ok(()),
            ReadyState::Failed(reason) => Err(ChannelError::ClosedBeforeReady(reason)),
            ReadyState::Pending => Err(ChannelError::ClosedBeforeReady(
                "readiness still pending".to_string(),
            )),
        }
    }
}

impl Default for ReadySignal {
    fn default() -> Self {
        Self::new()
    }
}
