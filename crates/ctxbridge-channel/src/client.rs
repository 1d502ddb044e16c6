//! Client-side state shared by the envelope-carrying channels.

use std::time::Duration;

use ctxbridge_envelope::Message;
use tracing::{debug, warn};

use crate::error::Result;
use crate::handshake::{HandshakeConfig, ReadinessProbe};
use crate::ready::ReadySignal;
use crate::timeout::{RequestTimeoutTracker, Resolution};

/// Readiness, probing and request timeouts of one client endpoint.
#[derive(Debug)]
pub(crate) struct ClientState {
    pub(crate) ready: ReadySignal,
    pub(crate) probe: ReadinessProbe,
    pub(crate) timeouts: Option<RequestTimeoutTracker>,
}

impl ClientState {
    pub(crate) fn new(handshake: &HandshakeConfig, request_timeout: Option<Duration>) -> Self {
        Self {
            ready: ReadySignal::new(),
            probe: ReadinessProbe::new(handshake),
            timeouts: request_timeout.map(RequestTimeoutTracker::new),
        }
    }

    /// Arm the request timer (for requests) and wait until the server is ready.
    ///
    /// Returns false when a request timed out before the server was ever
    /// seen: its timeout response has been delivered and it must not be
    /// transmitted.
    pub(crate) async fn prepare_send(
        &self,
        message: &Message,
        deliver: impl FnOnce(Message) + Send + 'static,
    ) -> Result<bool> {
        let (Message::Request(request), Some(tracker)) = (message, &self.timeouts) else {
            self.ready.wait().await?;
            return Ok(true);
        };

        tracker.track(request, deliver);
        match tokio::time::timeout(tracker.timeout(), self.ready.wait()).await {
            Ok(ready) => ready.map(|()| true),
            Err(_) => {
                debug!(id = %request.id, method = %request.method, "server never became ready; request answered by timeout");
                Ok(false)
            }
        }
    }

    /// Account for an inbound message from the server.
    ///
    /// Any valid server message proves readiness. Returns `None` for a
    /// response whose request has already been answered by a timeout.
    pub(crate) fn accept_inbound(&self, message: Message) -> Option<Message> {
        self.ready.signal_ready();
        if let (Message::Response(response), Some(tracker)) = (&message, &self.timeouts) {
            if tracker.resolve(&response.id) == Resolution::Expired {
                warn!(id = %response.id, "dropping response that arrived after its timeout");
                return None;
            }
        }
        Some(message)
    }

    /// Stop probing, cancel timers and fail pending readiness waiters.
    pub(crate) fn shutdown(&self, reason: &str) {
        self.probe.stop();
        if let Some(tracker) = &self.timeouts {
            tracker.clear();
        }
        self.ready.signal_failed(reason);
    }
}
