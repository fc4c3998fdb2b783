//! Shell execution of received commands.

use bytes::Bytes;
use std::process::{ExitStatus, Stdio};
use std::str::FromStr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;

use crate::config::schema::ExecutorConfig;
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::protocol::error::{ProtocolError, ProtocolResult};
use crate::protocol::listener::{Command, CommandListener, OutputSink};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecError {
    #[error("unsupported shell: {0}")]
    UnsupportedShell(String),
}

/// Shells commands may run under. Both take the command text after `-c`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    Sh,
    Bash,
}

impl Shell {
    pub fn program(&self) -> &'static str {
        match self {
            Shell::Sh => "sh",
            Shell::Bash => "bash",
        }
    }
}

impl FromStr for Shell {
    type Err = ExecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sh" => Ok(Shell::Sh),
            "bash" => Ok(Shell::Bash),
            other => Err(ExecError::UnsupportedShell(other.to_string())),
        }
    }
}

/// Runs each [`Command`] as `<shell> -c <input>` and streams its output into
/// the command's sinks.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: Shell,
    read_buffer_size: usize,
}

impl ShellExecutor {
    pub fn new(shell: Shell, read_buffer_size: usize) -> Self {
        Self {
            shell,
            read_buffer_size: read_buffer_size.max(1),
        }
    }

    pub fn from_config(config: &ExecutorConfig) -> Result<Self, ExecError> {
        Ok(Self::new(config.shell.parse()?, config.read_buffer_size))
    }

    pub fn shell(&self) -> Shell {
        self.shell
    }

    /// Execute commands from `listener` until shutdown, each on its own tracked task.
    pub async fn serve(&self, mut listener: CommandListener, shutdown: &Shutdown) -> ProtocolResult<()> {
        let cancel = shutdown.token();
        tracing::info!(
            shell = self.shell.program(),
            client_id = %listener.client_id(),
            "Listening to remote commands"
        );

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                next = listener.next_command() => next,
            };

            match next {
                Some(Ok(command)) => {
                    let executor = self.clone();
                    let cancel = shutdown.child_token();
                    shutdown
                        .tracker()
                        .spawn(async move { executor.execute(command, cancel).await });
                }
                Some(Err(e)) => return Err(e),
                None if cancel.is_cancelled() => return Ok(()),
                None => return Err(ProtocolError::ListenerClosed),
            }
        }
    }

    /// Run one command to completion. Both sinks are closed on every path.
    pub async fn execute(&self, command: Command, cancel: CancellationToken) {
        let Command {
            id,
            input,
            stdout,
            stderr,
        } = command;
        let script = String::from_utf8_lossy(&input).into_owned();
        tracing::info!(message_id = %id, command = %script, "Executing command");

        let mut child = match tokio::process::Command::new(self.shell.program())
            .arg("-c")
            .arg(&script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(message_id = %id, error = %e, "Failed to spawn shell");
                metrics::record_command("spawn_failed");
                let _ = stdout.close().await;
                fail(stderr, e.to_string()).await;
                return;
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err("cancelled".to_string()),
            outcome = self.drive(&mut child, &stdout, &stderr) => outcome,
        };

        let _ = stdout.close().await;
        match outcome {
            Ok(status) if status.success() => {
                metrics::record_command("success");
                tracing::info!(message_id = %id, "Command finished");
                let _ = stderr.close().await;
            }
            Ok(status) => {
                metrics::record_command("failed");
                tracing::info!(message_id = %id, status = %status, "Command exited unsuccessfully");
                fail(stderr, status.to_string()).await;
            }
            Err(reason) => {
                metrics::record_command("error");
                tracing::warn!(message_id = %id, reason = %reason, "Command aborted");
                let _ = child.start_kill();
                fail(stderr, reason).await;
            }
        }
    }

    async fn drive(
        &self,
        child: &mut Child,
        stdout: &OutputSink,
        stderr: &OutputSink,
    ) -> Result<ExitStatus, String> {
        let out = pipe(child.stdout.take(), stdout, self.read_buffer_size);
        let err = pipe(child.stderr.take(), stderr, self.read_buffer_size);
        let (out, err) = tokio::join!(out, err);
        out?;
        err?;
        child.wait().await.map_err(|e| e.to_string())
    }
}

/// Forward one pipe into a sink until EOF.
async fn pipe<R>(reader: Option<R>, sink: &OutputSink, buffer_size: usize) -> Result<(), String>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(());
    };
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = reader.read(&mut buf).await.map_err(|e| e.to_string())?;
        if n == 0 {
            return Ok(());
        }
        sink.write(Bytes::copy_from_slice(&buf[..n]))
            .await
            .map_err(|e| e.to_string())?;
    }
}

/// Report `reason` on stderr, then close it with the error.
async fn fail(stderr: OutputSink, reason: String) {
    let _ = stderr.write(reason.clone()).await;
    let _ = stderr.close_with_error(reason).await;
}
