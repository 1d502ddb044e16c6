use std::time::Duration;

use clap::{Args, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::exit::{io_error, CliError, CliResult, INTERNAL, USAGE};
use crate::output::OutputFormat;

pub mod call;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve JSON-RPC on stdin/stdout (ping, echo, initialize, sleep).
    Serve(ServeArgs),
    /// Spawn a stdio server, send one request, and print the response.
    Call(CallArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args),
        Command::Call(args) => call::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Longest accepted request line, in bytes.
    #[arg(long, value_name = "BYTES")]
    pub max_line_length: Option<usize>,
    /// Name reported in the `initialize` result.
    #[arg(long, default_value = "ctxbridge")]
    pub server_name: String,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Method to invoke.
    #[arg(long, short = 'm')]
    pub method: String,
    /// JSON params for the request.
    #[arg(long, short = 'p')]
    pub params: Option<String>,
    /// Request timeout (e.g. 10s, 500ms).
    #[arg(long, default_value = "10s")]
    pub timeout: String,
    /// Send a notification instead of a request and exit once it is written.
    #[arg(long)]
    pub notify: bool,
    /// Server program followed by its arguments.
    #[arg(last = true, required = true, num_args = 1.., value_name = "PROGRAM")]
    pub server: Vec<String>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(match unit {
        "ms" => Duration::from_millis(value),
        _ => Duration::from_secs(value),
    })
}

/// Runtime for one subcommand. The commands talk to a single peer, so a
/// current-thread runtime is enough.
pub(crate) fn runtime() -> CliResult<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| io_error("runtime setup failed", err))
}

pub(crate) fn install_ctrlc_handler(cancel: CancellationToken) -> CliResult<()> {
    ctrlc::set_handler(move || {
        cancel.cancel();
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
        assert_eq!(parse_duration("").unwrap_err().code, USAGE);
    }
}
