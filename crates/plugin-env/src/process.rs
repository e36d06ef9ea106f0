//! Bounded external process execution.

use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::warn;

/// Exit code reported when a process exceeds its timeout
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code reported when a process was terminated by a signal
pub const SIGNAL_EXIT_CODE: i32 = -1;

/// Captured result of a finished (or timed out) process
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// Exit code (0 = success)
    pub exit_code: i32,

    /// Captured stdout
    pub stdout: String,

    /// Captured stderr
    pub stderr: String,

    /// Duration in milliseconds
    pub duration_ms: u64,

    /// Whether the timeout expired before the process exited
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Last non-empty stderr line, falling back to stdout; used in diagnostics
    pub fn tail(&self) -> String {
        let pick = |s: &str| {
            s.lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .map(|l| l.trim().to_string())
        };
        pick(&self.stderr)
            .or_else(|| pick(&self.stdout))
            .unwrap_or_default()
    }
}

/// Run `command` to completion, killing it if `timeout` expires.
///
/// Expiry is reported as exit code [`TIMEOUT_EXIT_CODE`] rather than an error,
/// so callers treat it exactly like a non-zero exit.
pub async fn run_bounded(
    mut command: Command,
    label: &str,
    timeout: Option<Duration>,
) -> std::io::Result<ProcessOutput> {
    let start = Instant::now();

    let child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let waited = match timeout {
        Some(limit) if !limit.is_zero() => {
            match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(result) => Some(result?),
                Err(_) => None,
            }
        }
        _ => Some(child.wait_with_output().await?),
    };

    let duration_ms = start.elapsed().as_millis() as u64;

    match waited {
        Some(output) => Ok(ProcessOutput {
            exit_code: output.status.code().unwrap_or(SIGNAL_EXIT_CODE),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms,
            timed_out: false,
        }),
        None => {
            warn!(command = label, duration_ms, "Process timed out and was killed");
            Ok(ProcessOutput {
                exit_code: TIMEOUT_EXIT_CODE,
                stdout: String::new(),
                stderr: format!("{} timed out after {}ms", label, duration_ms),
                duration_ms,
                timed_out: true,
            })
        }
    }
}
