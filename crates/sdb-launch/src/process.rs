//! Spawning and tearing down the game process in launch mode.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

use crate::resolver::LaunchTarget;
use crate::{LaunchError, Result};

/// How long [`TargetProcess::terminate`] waits after `SIGTERM` by default.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of game output, without its trailing newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub line: String,
}

pub type OutputCallback = Arc<dyn Fn(OutputLine) + Send + Sync>;

/// A running game started from a [`LaunchTarget`].
///
/// Dropping it kills the game's process group unless [`TargetProcess::release`]
/// was called first.
#[derive(Debug)]
pub struct TargetProcess {
    child: Child,
    pid: Option<u32>,
    command: String,
    released: bool,
}

/// Start the game described by `target`, streaming its stdout and stderr to
/// `on_output` line by line.
///
/// Must be called from within a tokio runtime.
pub fn spawn_target(target: &LaunchTarget, on_output: OutputCallback) -> Result<TargetProcess> {
    let command_line = target.display_command();
    let Some(executable) = target.executable_path() else {
        return Err(LaunchError::ProjectResolution(
            "attach targets have no executable to spawn".to_owned(),
        ));
    };

    let mut cmd = Command::new(executable);
    cmd.args(target.arguments())
        .current_dir(target.working_directory())
        .envs(target.environment().iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // Own process group, so teardown reaches anything the game (or a wrapper
    // script) starts.
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
        command: command_line.clone(),
        source,
    })?;
    let pid = child.id();

    if let Some(stdout) = child.stdout.take() {
        forward_lines(stdout, OutputStream::Stdout, on_output.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        forward_lines(stderr, OutputStream::Stderr, on_output);
    }

    tracing::info!(target: "sdb.launch", pid = ?pid, command = %command_line, "spawned game");
    Ok(TargetProcess {
        child,
        pid,
        command: command_line,
        released: false,
    })
}

fn forward_lines<R>(reader: R, stream: OutputStream, on_output: OutputCallback)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    while matches!(buf.last(), Some(b'\n' | b'\r')) {
                        buf.pop();
                    }
                    on_output(OutputLine {
                        stream,
                        line: String::from_utf8_lossy(&buf).into_owned(),
                    });
                }
                Err(err) => {
                    tracing::debug!(target: "sdb.launch", ?stream, error = %err, "output pipe failed");
                    break;
                }
            }
        }
    });
}

impl TargetProcess {
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Wait for the game to exit. Cancel safe.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    pub fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Ask the game to stop, escalating to `SIGKILL` after `grace`.
    pub async fn terminate(&mut self, grace: Duration) -> io::Result<ExitStatus> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status);
        }

        #[cfg(unix)]
        if let Some(pid) = self.pid {
            signal_group(pid, libc::SIGTERM);
            if let Ok(status) = tokio::time::timeout(grace, self.child.wait()).await {
                return status;
            }
            tracing::debug!(target: "sdb.launch", pid, "game ignored SIGTERM; killing");
            signal_group(pid, libc::SIGKILL);
            return self.child.wait().await;
        }

        let _ = grace;
        self.child.start_kill()?;
        self.child.wait().await
    }

    /// Let the game keep running after this handle is gone.
    pub fn release(mut self) {
        self.released = true;
        tracing::debug!(target: "sdb.launch", pid = ?self.pid, "leaving game running");
    }
}

impl Drop for TargetProcess {
    fn drop(&mut self) {
        if self.released || !matches!(self.child.try_wait(), Ok(None)) {
            return;
        }
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            signal_group(pid, libc::SIGKILL);
            return;
        }
        let _ = self.child.start_kill();
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // Negative pid addresses the process group created by `process_group(0)`.
    // SAFETY: `kill` has no memory-safety preconditions.
    unsafe {
        let _ = libc::kill(-pid, signal);
    }
}

