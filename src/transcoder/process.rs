//! # Transcoder Process Manager
//!
//! Owns the external transcoder subprocess of one session and its three pipes:
//! - **input sink** (stdin, write-only): handed to the input forwarder
//! - **output source** (stdout, read-only): handed to the output forwarder
//! - **diagnostic source** (stderr, read-only): drained by a background task and logged
//!
//! ## Lifecycle:
//! 1. `start()` builds the command line from config + header and spawns the process
//! 2. the session takes the input and output pipes
//! 3. `stop()` closes stdin (if still held), waits up to a grace period, then kills
//!
//! `stop()` is idempotent: later calls return the first outcome without touching the process.

use crate::audio::ContainerHeader;
use crate::config::TranscoderConfig;
use crate::error::SessionError;
use crate::transcoder::command::TranscoderCommand;

use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// How the process ended when `stop()` was called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited on its own within the grace period
    Exited(ExitStatus),
    /// Still running after the grace period and was killed
    Killed,
    /// Waiting on the process failed; it was killed as a precaution
    Unknown,
}

impl StopOutcome {
    /// Exit status when the process exited by itself.
    pub fn status(&self) -> Option<ExitStatus> {
        match self {
            StopOutcome::Exited(status) => Some(*status),
            _ => None,
        }
    }
}

pub struct TranscoderProcess {
    child: Child,
    pid: Option<u32>,
    input: Option<ChildStdin>,
    output: Option<ChildStdout>,
    diagnostics: Option<JoinHandle<()>>,
    stopped: Option<StopOutcome>,
}

impl TranscoderProcess {
    /// Build the command for `header` and spawn it.
    ///
    /// ## Errors:
    /// - **InvalidFormat**: the header's sample layout has no raw input format
    /// - **ProcessStart**: the executable is missing or the spawn call failed
    pub fn start(header: &ContainerHeader, config: &TranscoderConfig) -> Result<Self, SessionError> {
        let command = TranscoderCommand::build(config, header)?;
        Self::spawn(&command)
    }

    pub fn spawn(command: &TranscoderCommand) -> Result<Self, SessionError> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SessionError::ProcessStart(format!("{}: {}", command.program, e)))?;

        let pid = child.id();
        let input = child.stdin.take();
        let output = child.stdout.take();
        let diagnostics = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(drain_diagnostics(stderr).in_current_span()));

        if input.is_none() || output.is_none() {
            return Err(SessionError::ProcessStart(
                "transcoder pipes were not captured".to_string(),
            ));
        }

        info!(pid = ?pid, command = %command.display(), "Transcoder started");

        Ok(Self {
            child,
            pid,
            input,
            output,
            diagnostics,
            stopped: None,
        })
    }

    /// Take the input sink. Returns `None` after the first call.
    pub fn take_input(&mut self) -> Option<ChildStdin> {
        self.input.take()
    }

    /// Take the output source. Returns `None` after the first call.
    pub fn take_output(&mut self) -> Option<ChildStdout> {
        self.output.take()
    }

    /// Signal end-of-input, wait up to `grace` for the process to exit, then kill it.
    ///
    /// The input sink is always closed before any kill, so the transcoder gets
    /// the chance to flush pending output.
    pub async fn stop(&mut self, grace: Duration) -> StopOutcome {
        if let Some(outcome) = self.stopped {
            return outcome;
        }

        // Dropping stdin closes the pipe (EOF for the transcoder)
        drop(self.input.take());

        let outcome = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => StopOutcome::Exited(status),
            Ok(Err(err)) => {
                warn!(pid = ?self.pid, error = %err, "Failed to wait for transcoder, killing");
                self.kill().await;
                StopOutcome::Unknown
            }
            Err(_) => {
                warn!(
                    pid = ?self.pid,
                    grace_ms = grace.as_millis() as u64,
                    "Transcoder still running after grace period, killing"
                );
                self.kill().await;
                StopOutcome::Killed
            }
        };

        // stderr reaches EOF once the process is gone
        if let Some(handle) = self.diagnostics.take() {
            if tokio::time::timeout(grace, handle).await.is_err() {
                debug!(pid = ?self.pid, "Diagnostic drain did not finish in time");
            }
        }

        debug!(pid = ?self.pid, outcome = ?outcome, "Transcoder stopped");
        self.stopped = Some(outcome);
        outcome
    }

    async fn kill(&mut self) {
        if let Err(err) = self.child.kill().await {
            debug!(pid = ?self.pid, error = %err, "Kill failed (process already gone?)");
        }
    }
}

/// Read the diagnostic stream until EOF so the transcoder never blocks on a full stderr pipe.
async fn drain_diagnostics(stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end();
                if !text.is_empty() {
                    debug!(target: "transcoder", "{}", text);
                }
            }
            Err(err) => {
                debug!(target: "transcoder", error = %err, "Diagnostic stream read failed");
                break;
            }
        }
    }
}
