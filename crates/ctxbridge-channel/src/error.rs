use std::time::Duration;

/// Errors that can occur on a channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Delivery medium error.
    #[error("medium error: {0}")]
    Medium(#[from] ctxbridge_medium::MediumError),

    /// Message or envelope could not be parsed or framed.
    #[error("envelope error: {0}")]
    Envelope(#[from] ctxbridge_envelope::EnvelopeError),

    /// Configuration rejected at construction time.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// `start` was called on a channel that is already running.
    #[error("channel already started")]
    AlreadyStarted,

    /// `send` was called before `start` or after `close`.
    #[error("channel not started")]
    NotStarted,

    /// `start` was called on a channel that has been closed.
    #[error("channel closed")]
    Closed,

    /// The channel closed while a send was waiting for the peer.
    #[error("channel closed before peer became ready: {0}")]
    ClosedBeforeReady(String),

    /// The peer went away.
    #[error("peer disconnected: {0}")]
    Disconnected(String),

    /// A port client used up its reconnect attempts.
    #[error("max reconnection attempts reached ({0})")]
    ReconnectExhausted(u32),

    /// Waiting for the write side to drain took too long; the message was not sent.
    #[error("write buffer did not drain within {0:?}")]
    DrainTimeout(Duration),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Stream I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ChannelError>;
