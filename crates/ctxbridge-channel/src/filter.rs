//! Inbound acceptance rules for envelope-carrying media.
//!
//! A broadcast medium delivers everything posted to a context, so every
//! receiver filters before interpreting anything:
//! 1. the sender origin must be allowed (`*` allows all)
//! 2. the value must be an envelope
//! 3. its channel must equal ours
//! 4. its direction must be the one this role receives
//!
//! Anything that fails is dropped silently; on a shared medium it is someone
//! else's traffic, not an error.

use ctxbridge_envelope::{Direction, Envelope};
use ctxbridge_medium::WILDCARD_ORIGIN;
use serde_json::Value;
use tracing::trace;

/// Origin, channel and direction checks for one channel endpoint.
#[derive(Debug, Clone)]
pub struct InboundFilter {
    channel_id: String,
    expected: Direction,
    allowed_origins: Vec<String>,
}

impl InboundFilter {
    pub fn new(
        channel_id: impl Into<String>,
        expected: Direction,
        allowed_origins: Vec<String>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            expected,
            allowed_origins,
        }
    }

    /// Returns true if `origin` passes the allow-list.
    ///
    /// An unknown origin only passes a wildcard list.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        self.allowed_origins.iter().any(|allowed| {
            allowed == WILDCARD_ORIGIN || origin.is_some_and(|origin| origin == allowed)
        })
    }

    /// Apply every check, returning the envelope if it is ours.
    pub fn accept(&self, origin: Option<&str>, data: &Value) -> Option<Envelope> {
        if !self.origin_allowed(origin) {
            trace!(?origin, channel = %self.channel_id, "dropping message from disallowed origin");
            return None;
        }
        let envelope = Envelope::from_value(data)?;
        if envelope.channel != self.channel_id {
            trace!(got = %envelope.channel, want = %self.channel_id, "dropping envelope for other channel");
            return None;
        }
        if envelope.direction != self.expected {
            trace!(direction = %envelope.direction, channel = %self.channel_id, "dropping envelope travelling the other way");
            return None;
        }
        Some(envelope)
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn allowed_origins(&self) -> &[String] {
        &self.allowed_origins
    }
}
