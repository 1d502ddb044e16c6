use std::fmt;
use std::io;

use ctxbridge_channel::ChannelError;
use ctxbridge_medium::MediumError;

// Process exit codes. 124 matches timeout(1).
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::NotFound | io::ErrorKind::BrokenPipe => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn medium_error(context: &str, err: MediumError) -> CliError {
    match err {
        MediumError::Spawn { source, .. } | MediumError::Io(source) => io_error(context, source),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn channel_error(context: &str, err: ChannelError) -> CliError {
    match err {
        ChannelError::Medium(err) => medium_error(context, err),
        ChannelError::Io(err) => io_error(context, err),
        ChannelError::Config(_) => CliError::new(USAGE, format!("{context}: {err}")),
        ChannelError::Envelope(_) | ChannelError::Json(_) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        ChannelError::DrainTimeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        ChannelError::Disconnected(_)
        | ChannelError::ClosedBeforeReady(_)
        | ChannelError::Closed
        | ChannelError::ReconnectExhausted(_) => {
            CliError::new(TRANSPORT_ERROR, format!("{context}: {err}"))
        }
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn channel_errors_map_to_exit_codes() {
        assert_eq!(
            channel_error("x", ChannelError::Config("bad".into())).code,
            USAGE
        );
        assert_eq!(
            channel_error("x", ChannelError::DrainTimeout(Duration::from_secs(1))).code,
            TIMEOUT
        );
        assert_eq!(
            channel_error("x", ChannelError::Disconnected("gone".into())).code,
            TRANSPORT_ERROR
        );
        assert_eq!(
            channel_error("x", ChannelError::ReconnectExhausted(10)).code,
            TRANSPORT_ERROR
        );
        assert_eq!(channel_error("x", ChannelError::NotStarted).code, INTERNAL);
    }

    #[test]
    fn spawn_failure_maps_through_io_kind() {
        let err = ChannelError::Medium(MediumError::Spawn {
            program: "missing".into(),
            source: io::Error::from(io::ErrorKind::NotFound),
        });
        let cli = channel_error("spawn failed", err);
        assert_eq!(cli.code, TRANSPORT_ERROR);
        assert!(cli.message.starts_with("spawn failed: "));
    }
}
