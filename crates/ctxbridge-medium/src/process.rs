//! Child processes whose stdin/stdout carry a byte stream.

use std::fmt;
use std::process::Stdio;

use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info};

use crate::error::{MediumError, Result};

/// A spawned child process with piped stdin/stdout.
///
/// stderr is inherited so the child's logs stay visible. The child is killed
/// when this handle is dropped.
pub struct ChildProcess {
    program: String,
    child: Child,
}

impl ChildProcess {
    /// Spawn `program` with `args`.
    pub fn spawn<I, S>(program: &str, args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| MediumError::Spawn {
                program: program.to_string(),
                source,
            })?;

        info!(program, pid = child.id(), "spawned child process");
        Ok(Self {
            program: program.to_string(),
            child,
        })
    }

    /// Take the child's stdin (write side) and stdout (read side).
    ///
    /// Fails with [`MediumError::StdioTaken`] on the second call.
    pub fn take_stdio(&mut self) -> Result<(ChildStdin, ChildStdout)> {
        match (self.child.stdin.take(), self.child.stdout.take()) {
            (Some(stdin), Some(stdout)) => Ok((stdin, stdout)),
            _ => Err(MediumError::StdioTaken),
        }
    }

    /// OS process id, if the child is still running.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Program name the child was spawned from.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Kill the child and wait for it to exit.
    pub async fn kill(&mut self) -> Result<()> {
        debug!(program = %self.program, "killing child process");
        match self.child.kill().await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(err) => Err(MediumError::Io(err)),
        }
    }

    /// Ask the child to exit without waiting for it.
    pub fn start_kill(&mut self) -> Result<()> {
        match self.child.start_kill() {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(err) => Err(MediumError::Io(err)),
        }
    }

    /// Wait for the child to exit and return its exit code, if any.
    pub async fn wait(&mut self) -> Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }
}

impl fmt::Debug for ChildProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildProcess")
            .field("program", &self.program)
            .field("pid", &self.child.id())
            .finish()
    }
}
