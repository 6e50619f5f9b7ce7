//! Runs external programs off the event loop with timeout and capture.
//!
//! Callers must not hold a database handle across `run`; the persistence
//! layer's transaction ceiling makes a violation fail loudly. Arguments may
//! contain file paths but never secrets.

use crate::programs::Invocation;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Captured stdout/stderr are truncated beyond this many bytes.
pub const CAPTURE_LIMIT: usize = 1024 * 1024;

const TRUNCATION_MARKER: &str = "\n[output truncated]";

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("{program} timed out after {timeout:?} (args: {args:?})")]
    Timeout {
        program: String,
        args: Vec<String>,
        timeout: Duration,
    },

    #[error("{program} exited with code {code} (args: {args:?}): {stderr}")]
    NonZeroExit {
        program: String,
        args: Vec<String>,
        code: i32,
        stderr: String,
    },

    #[error("failed to spawn {program} (args: {args:?}): {source}")]
    SpawnFailed {
        program: String,
        args: Vec<String>,
        #[source]
        source: std::io::Error,
    },
}

/// Successful run of an external program.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

pub struct Supervisor {
    scripts_dir: PathBuf,
    capture_limit: usize,
}

impl Supervisor {
    pub fn new(scripts_dir: impl Into<PathBuf>) -> Self {
        Self {
            scripts_dir: scripts_dir.into(),
            capture_limit: CAPTURE_LIMIT,
        }
    }

    #[cfg(test)]
    fn with_capture_limit(mut self, limit: usize) -> Self {
        self.capture_limit = limit;
        self
    }

    pub fn scripts_dir(&self) -> &Path {
        &self.scripts_dir
    }

    /// Run a pipeline program with its own timeout.
    pub async fn run_invocation(&self, invocation: &Invocation) -> Result<RunOutput, RunnerError> {
        self.run(
            invocation.program.script_name(),
            &invocation.args,
            invocation.program.timeout(),
        )
        .await
    }

    /// Run `scripts_dir/<program>` with the given argv and wall-clock
    /// timeout. The child runs in its own process group; on timeout the
    /// whole group is killed.
    pub async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<RunOutput, RunnerError> {
        let path = self.scripts_dir.join(program);
        let started = Instant::now();

        let mut child = Command::new(&path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0)
            .spawn()
            .map_err(|source| RunnerError::SpawnFailed {
                program: program.to_string(),
                args: args.to_vec(),
                source,
            })?;

        let pid = child.id();
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let limit = self.capture_limit;
        let stdout_task =
            tokio::spawn(async move { read_capped(stdout_pipe, limit).await });
        let stderr_task =
            tokio::spawn(async move { read_capped(stderr_pipe, limit).await });

        let wait = tokio::time::timeout(timeout, child.wait()).await;

        let status = match wait {
            Err(_) => {
                warn!(program, timeout_secs = timeout.as_secs(), "killing timed-out program group");
                kill_group(pid);
                let _ = child.wait().await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(RunnerError::Timeout {
                    program: program.to_string(),
                    args: args.to_vec(),
                    timeout,
                });
            }
            Ok(Err(source)) => {
                return Err(RunnerError::SpawnFailed {
                    program: program.to_string(),
                    args: args.to_vec(),
                    source,
                });
            }
            Ok(Ok(status)) => status,
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let duration = started.elapsed();

        // Both streams are retained for logging regardless of exit code.
        debug!(
            program,
            exit_code = status.code().unwrap_or(-1),
            duration_ms = duration.as_millis() as u64,
            stdout_bytes = stdout.len(),
            stderr_bytes = stderr.len(),
            "program finished"
        );

        let code = status.code().unwrap_or(-1);
        if code != 0 {
            return Err(RunnerError::NonZeroExit {
                program: program.to_string(),
                args: args.to_vec(),
                code,
                stderr,
            });
        }

        Ok(RunOutput {
            exit_code: code,
            stdout,
            stderr,
            duration,
        })
    }
}

/// Read a pipe to EOF, keeping at most `limit` bytes and draining the rest
/// so the child never blocks on a full pipe.
async fn read_capped<R>(pipe: Option<R>, limit: usize) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(mut pipe) = pipe else {
        return String::new();
    };

    let mut kept: Vec<u8> = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if kept.len() < limit {
                    let take = n.min(limit - kept.len());
                    kept.extend_from_slice(&buf[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }

    let mut text = String::from_utf8_lossy(&kept).into_owned();
    if truncated {
        text.push_str(TRUNCATION_MARKER);
    }
    text
}

fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // The child was started as its own process group leader.
        unsafe {
            libc::killpg(pid as i32, libc::SIGKILL);
        }
    }
}
