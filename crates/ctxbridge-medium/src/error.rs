/// Errors that can occur on an underlying delivery medium.
#[derive(Debug, thiserror::Error)]
pub enum MediumError {
    /// The port (or its remote end) has been disconnected.
    #[error("port disconnected")]
    Disconnected,

    /// A listener is already registered under this port name.
    #[error("a listener is already registered for port name '{0}'")]
    AlreadyListening(String),

    /// The listener for this port name has been dropped.
    #[error("listener for port name '{0}' is closed")]
    ListenerClosed(String),

    /// Failed to spawn a child process.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    /// The child process stdio handles were already taken.
    #[error("child process stdio already taken")]
    StdioTaken,

    /// An I/O error occurred on the medium.
    #[error("medium I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MediumError>;
