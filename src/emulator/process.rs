//! Process execution - Running console and device-bridge binaries

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::platform;

/// One external program invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_directory: PathBuf,
    /// Collect stdout/stderr instead of discarding them
    pub capture: bool,
}

impl CommandRequest {
    pub fn new(program: impl Into<PathBuf>, working_directory: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_directory: working_directory.into(),
            capture: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn captured(mut self) -> Self {
        self.capture = true;
        self
    }

    /// Program and arguments joined for log messages
    pub fn display(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Result of an invocation. Spawn failures and cancellation are folded into
/// an unsuccessful output so callers never have to handle an error path.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: Vec<u8>,
    pub stderr: String,
    /// Why the process could not run to completion
    pub failure: Option<String>,
}

impl CommandOutput {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            failure: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }
}

/// Executes external programs
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, request: CommandRequest, cancel: &CancellationToken) -> CommandOutput;
}

/// Runs requests as real child processes
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, request: CommandRequest, cancel: &CancellationToken) -> CommandOutput {
        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args)
            .current_dir(&request.working_directory)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if request.capture {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        platform::hide_console_window(&mut cmd);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if platform::is_elevation_error(&e) => {
                return CommandOutput::failed(
                    "The requested operation requires elevation. Configure the emulator to run without administrator privileges.",
                );
            }
            Err(e) => return CommandOutput::failed(format!("Failed to start process: {}", e)),
        };

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let collect = async {
            let mut out = Vec::new();
            let mut err = Vec::new();
            let read_out = async {
                if let Some(pipe) = stdout.as_mut() {
                    let _ = pipe.read_to_end(&mut out).await;
                }
            };
            let read_err = async {
                if let Some(pipe) = stderr.as_mut() {
                    let _ = pipe.read_to_end(&mut err).await;
                }
            };
            tokio::join!(read_out, read_err);
            let status = child.wait().await;
            (status, out, err)
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Cancelled while waiting for {}", request.display());
                // kill_on_drop reaps the child once `collect` is dropped
                CommandOutput::failed("cancelled")
            }
            (status, out, err) = collect => match status {
                Ok(status) => CommandOutput {
                    success: status.success(),
                    stdout: out,
                    stderr: String::from_utf8_lossy(&err).trim().to_string(),
                    failure: None,
                },
                Err(e) => CommandOutput::failed(format!("Failed to wait for process: {}", e)),
            },
        }
    }
}
