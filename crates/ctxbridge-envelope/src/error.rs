/// Errors that can occur while parsing or framing messages.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// The value is not a well-formed JSON-RPC message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The payload is a string but not one of the known control signals.
    #[error("unknown control signal '{0}'")]
    UnknownControlSignal(String),

    /// A stream line exceeds the configured maximum length.
    #[error("line too long ({size} bytes, max {max})")]
    LineTooLong { size: usize, max: usize },

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An I/O error occurred while reading or writing a stream.
    #[error("codec I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EnvelopeError>;
