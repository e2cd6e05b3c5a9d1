//! Scoped execution of external tools.

use std::ffi::OsStr;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::StageError;

/// Captured result of a finished tool run.
#[derive(Debug)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// Last non-empty stderr line, for error messages.
    pub fn stderr_tail(&self) -> &str {
        self.stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("no output")
    }
}

fn tool_name(program: &Path) -> String {
    program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.display().to_string())
}

/// Run `program` to completion, killing and reaping it if `timeout` elapses.
///
/// The child never outlives this call: it is killed on timeout and, should
/// the future be dropped early, on drop.
pub async fn run_tool<I, S>(
    program: &Path,
    args: I,
    timeout: Duration,
) -> Result<ToolOutput, StageError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let tool = tool_name(program);
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| StageError::tool(&tool, format!("failed to start: {e}")))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| StageError::tool(&tool, "stdout not captured"))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| StageError::tool(&tool, "stderr not captured"))?;

    let finished = tokio::time::timeout(timeout, async {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let (out_res, err_res, status) = tokio::join!(
            stdout.read_to_end(&mut out),
            stderr.read_to_end(&mut err),
            child.wait()
        );
        out_res?;
        err_res?;
        Ok::<_, std::io::Error>((status?, out, err))
    })
    .await;

    match finished {
        Ok(Ok((status, out, err))) => {
            debug!(tool = %tool, %status, "tool finished");
            Ok(ToolOutput {
                status,
                stdout: String::from_utf8_lossy(&out).into_owned(),
                stderr: String::from_utf8_lossy(&err).into_owned(),
            })
        }
        Ok(Err(e)) => {
            if let Err(kill_err) = child.kill().await {
                warn!(tool = %tool, error = %kill_err, "failed to kill tool after i/o error");
            }
            Err(StageError::tool(&tool, format!("i/o error: {e}")))
        }
        Err(_) => {
            if let Err(kill_err) = child.kill().await {
                warn!(tool = %tool, error = %kill_err, "failed to kill timed out tool");
            }
            Err(StageError::ToolTimeout { tool, timeout })
        }
    }
}

/// Like [`run_tool`], but a non-zero exit status is an error.
pub async fn run_tool_checked<I, S>(
    program: &Path,
    args: I,
    timeout: Duration,
) -> Result<ToolOutput, StageError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_tool(program, args, timeout).await?;
    if !output.status.success() {
        return Err(StageError::tool(
            tool_name(program),
            format!("{}: {}", output.status, output.stderr_tail()),
        ));
    }
    Ok(output)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_output() {
        let script = ["-c", "echo hello; echo oops >&2"];
        let out = run_tool_checked(Path::new("sh"), script, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr_tail(), "oops");
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error() {
        let script = ["-c", "echo broken >&2; exit 3"];
        let err = run_tool_checked(Path::new("sh"), script, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Tool { ref message, .. } if message.contains("broken")));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let started = std::time::Instant::now();
        let err = run_tool(Path::new("sleep"), ["30"], Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::ToolTimeout { ref tool, .. } if tool == "sleep"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn missing_binary_is_a_tool_error() {
        let err = run_tool(Path::new("/nonexistent/podforge-tool"), ["x"], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Tool { .. }));
    }
}
