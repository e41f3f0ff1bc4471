//! Helpers for running child processes with timeouts and bounded output.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

use crate::core::types::ProcessOutcome;

/// How long to wait for the output readers after the child has exited. A
/// grandchild that inherited the pipes can keep them open indefinitely.
const READER_GRACE: Duration = Duration::from_secs(5);

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
/// A child still running at the deadline is killed and reported with `timed_out = true`.
///
/// Returns `Err` only if the child could not be started or waited on.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub async fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<ProcessOutcome> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        // Written from its own task so a child that fills its stdout before
        // reading stdin cannot deadlock us.
        tokio::spawn(async move {
            if let Err(e) = child_stdin.write_all(&input).await {
                warn!(err = %e, "failed to write child stdin");
            }
        });
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = tokio::spawn(read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = tokio::spawn(read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status.context("wait for command")?,
        Err(_) => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            child.kill().await.context("kill command")?;
            child.wait().await.context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle, "stdout").await;
    let (stderr, stderr_truncated) = join_output(stderr_handle, "stderr").await;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(ProcessOutcome {
        success: status.success() && !timed_out,
        exit_code: status.code(),
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        timed_out,
        stdout_truncated,
        stderr_truncated,
    })
}

/// Collect a reader's output; a reader that fails or outlives the grace period yields nothing.
async fn join_output(
    mut handle: JoinHandle<Result<(Vec<u8>, usize)>>,
    stream: &'static str,
) -> (Vec<u8>, usize) {
    match tokio::time::timeout(READER_GRACE, &mut handle).await {
        Ok(Ok(Ok(output))) => output,
        Ok(Ok(Err(e))) => {
            warn!(stream, err = %e, "failed to read output");
            (Vec::new(), 0)
        }
        Ok(Err(e)) => {
            warn!(stream, err = %e, "output reader task failed");
            (Vec::new(), 0)
        }
        Err(_) => {
            warn!(stream, "output still open after exit, abandoning reader");
            handle.abort();
            (Vec::new(), 0)
        }
    }
}

async fn read_stream_limited<R: AsyncRead + Unpin>(
    mut reader: R,
    limit: usize,
) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await.context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
