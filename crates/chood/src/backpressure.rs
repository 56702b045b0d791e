//! Backpressure: the shell command that validates a task's completion.
//!
//! Commands run via `sh -c` in the worktree with stdout and stderr merged,
//! under a per-invocation timeout. Exit 0 passes; anything else, including
//! timeout, fails. The full combined output comes back for diagnostics.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum BackpressureError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, BackpressureError>;

/// Outcome of a backpressure command.
#[derive(Debug, Clone)]
pub struct BackpressureResult {
    pub ok: bool,
    /// Exit code; `None` on timeout or signal death.
    pub exit_code: Option<i32>,
    /// Interleaved stdout + stderr.
    pub combined_output: String,
    pub duration: Duration,
    pub timed_out: bool,
}

/// Run `command` via the shell in `workdir`, enforcing `timeout`.
pub async fn run(
    cancel: &CancellationToken,
    command: &str,
    workdir: &Path,
    timeout: Duration,
) -> Result<BackpressureResult> {
    debug!(command, workdir = %workdir.display(), "running backpressure");
    let start = Instant::now();

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();

    let collect = async {
        let mut out_buf = Vec::new();
        let mut err_buf = Vec::new();
        let out = async {
            if let Some(out) = stdout.as_mut() {
                out.read_to_end(&mut out_buf).await.map(|_| ())
            } else {
                Ok(())
            }
        };
        let err = async {
            if let Some(err) = stderr.as_mut() {
                err.read_to_end(&mut err_buf).await.map(|_| ())
            } else {
                Ok(())
            }
        };
        let (out, err) = tokio::join!(out, err);
        out?;
        err?;
        let status = child.wait().await?;
        Ok::<_, std::io::Error>((status, out_buf, err_buf))
    };

    let outcome = tokio::select! {
        result = tokio::time::timeout(timeout, collect) => result,
        () = cancel.cancelled() => return Err(BackpressureError::Cancelled),
    };

    let duration = start.elapsed();
    match outcome {
        Ok(Ok((status, out_buf, err_buf))) => {
            let combined_output = merge_output(&out_buf, &err_buf);
            let exit_code = status.code();
            let ok = exit_code == Some(0);
            if !ok {
                debug!(exit_code = ?exit_code, "backpressure failed");
            }
            Ok(BackpressureResult {
                ok,
                exit_code,
                combined_output,
                duration,
                timed_out: false,
            })
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_elapsed) => {
            warn!(command, timeout_sec = timeout.as_secs(), "backpressure timed out");
            Ok(BackpressureResult {
                ok: false,
                exit_code: None,
                combined_output: format!("timed out after {}s", timeout.as_secs()),
                duration,
                timed_out: true,
            })
        }
    }
}

/// Merge stdout and stderr; stderr appended after stdout when both present.
fn merge_output(stdout: &[u8], stderr: &[u8]) -> String {
    let out = String::from_utf8_lossy(stdout);
    if stderr.is_empty() {
        out.into_owned()
    } else {
        let err = String::from_utf8_lossy(stderr);
        if out.is_empty() {
            err.into_owned()
        } else {
            format!("{out}{err}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn exit_zero_is_success() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let result = run(&cancel, "exit 0", dir.path(), TIMEOUT).await.unwrap();
        assert!(result.ok);
        assert_eq!(result.exit_code, Some(0));
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn nonzero_exit_is_failure_with_output() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let result = run(&cancel, "echo bad fmt; exit 1", dir.path(), TIMEOUT)
            .await
            .unwrap();
        assert!(!result.ok);
        assert_eq!(result.exit_code, Some(1));
        assert_eq!(result.combined_output, "bad fmt\n");
    }

    #[tokio::test]
    async fn merges_stdout_and_stderr() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let result = run(&cancel, "echo to-out; echo to-err >&2; exit 2", dir.path(), TIMEOUT)
            .await
            .unwrap();
        assert!(result.combined_output.contains("to-out"));
        assert!(result.combined_output.contains("to-err"));
    }

    #[tokio::test]
    async fn runs_in_workdir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();
        let cancel = CancellationToken::new();
        let result = run(&cancel, "test -f marker.txt", dir.path(), TIMEOUT)
            .await
            .unwrap();
        assert!(result.ok);
    }

    #[tokio::test]
    async fn timeout_is_failure() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let result = run(&cancel, "sleep 30", dir.path(), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(!result.ok);
        assert!(result.timed_out);
        assert!(result.exit_code.is_none());
        assert!(result.combined_output.contains("timed out"));
    }

    #[tokio::test]
    async fn cancellation_aborts_promptly() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel_clone.cancel();
        });

        let started = Instant::now();
        let result = run(&cancel, "sleep 30", dir.path(), TIMEOUT).await;
        assert!(matches!(result, Err(BackpressureError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn reports_duration() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let result = run(&cancel, "sleep 0.1", dir.path(), TIMEOUT).await.unwrap();
        assert!(result.duration >= Duration::from_millis(90));
    }
}
