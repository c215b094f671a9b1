//! Subprocess one-shot executor.
//!
//! Runs the rendered one-shot script under a local `python3` with a
//! restricted environment. This gives process isolation only — no filesystem
//! or network isolation — so it is a development backend: the policy
//! validator is the sole barrier here and always runs in full, and this path
//! must never be selected as a silent fallback in a deployment that carries
//! a security contract.

use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::BufReader;
use tokio::process::Command;

use crate::agent;
use crate::agent::read_result_file;
use crate::error::ExecuteErr;
use crate::error::Result;
use crate::serializer::Serializer;
use datalab_protocol::ResultEnvelope;

// Maximum we keep for each stream, whichever cap is hit first.
const MAX_STREAM_OUTPUT: usize = 10 * 1024;
const MAX_STREAM_OUTPUT_LINES: usize = 256;

pub struct ProcessExecutor {
    python_bin: PathBuf,
    serializer: Serializer,
}

impl ProcessExecutor {
    pub fn new(python_bin: PathBuf, serializer: Serializer) -> Self {
        Self {
            python_bin,
            serializer,
        }
    }

    /// Run `code` once in a scratch directory and return the normalized
    /// envelope. The scratch directory is deleted on every path.
    pub async fn run(
        &self,
        code: &str,
        data: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<ResultEnvelope> {
        let scratch = tempfile::Builder::new().prefix("datalab-exec-").tempdir()?;

        if let Some(bytes) = data {
            tokio::fs::write(scratch.path().join(agent::DATA_FILE_NAME), bytes).await?;
        }
        let script = agent::render_one_shot_script(code);
        tokio::fs::write(scratch.path().join(agent::SCRIPT_FILE_NAME), script).await?;

        let child = self.spawn(scratch.path())?;
        let output = consume_with_timeout(child, timeout).await?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.exit_ok {
            return Ok(ResultEnvelope {
                stdout,
                stderr,
                success: false,
                ..Default::default()
            });
        }

        let envelope = match read_result_file(&scratch.path().join(agent::RESULT_FILE_NAME)).await?
        {
            Some((variables, visualizations)) => self.serializer.envelope_from_parts(
                variables,
                visualizations,
                stdout,
                stderr,
                true,
            ),
            // A clean exit without a result file is an empty envelope.
            None => ResultEnvelope {
                stdout,
                stderr,
                success: true,
                ..Default::default()
            },
        };
        Ok(envelope)
    }

    fn spawn(&self, scratch: &Path) -> Result<tokio::process::Child> {
        let mut cmd = Command::new(&self.python_bin);
        cmd.arg(agent::SCRIPT_FILE_NAME);
        cmd.current_dir(scratch);

        // Hand the child a minimal environment rather than the host's.
        cmd.env_clear();
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }
        cmd.env("HOME", scratch);
        cmd.env("PYTHONDONTWRITEBYTECODE", "1");
        cmd.env("MPLBACKEND", "Agg");

        // No stdin: scripts that probe it would otherwise hang forever.
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        Ok(cmd.spawn()?)
    }
}

struct ProcessOutput {
    exit_ok: bool,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

/// Consume the child's output with caps and enforce the deadline. On expiry
/// the child is killed and `Timeout` returned.
async fn consume_with_timeout(
    mut child: tokio::process::Child,
    timeout: Duration,
) -> Result<ProcessOutput> {
    let stdout_reader = child.stdout.take().ok_or_else(|| {
        ExecuteErr::Io(io::Error::other(
            "stdout pipe was unexpectedly not available",
        ))
    })?;
    let stderr_reader = child.stderr.take().ok_or_else(|| {
        ExecuteErr::Io(io::Error::other(
            "stderr pipe was unexpectedly not available",
        ))
    })?;

    let stdout_handle = tokio::spawn(read_capped(
        BufReader::new(stdout_reader),
        MAX_STREAM_OUTPUT,
        MAX_STREAM_OUTPUT_LINES,
    ));
    let stderr_handle = tokio::spawn(read_capped(
        BufReader::new(stderr_reader),
        MAX_STREAM_OUTPUT,
        MAX_STREAM_OUTPUT_LINES,
    ));

    let exit_status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status?,
        Err(_) => {
            child.start_kill()?;
            return Err(ExecuteErr::Timeout);
        }
    };

    let stdout = stdout_handle.await??;
    let stderr = stderr_handle.await??;

    Ok(ProcessOutput {
        exit_ok: exit_status.success(),
        stdout,
        stderr,
    })
}

async fn read_capped<R: AsyncRead + Unpin>(
    mut reader: R,
    max_output: usize,
    max_lines: usize,
) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(max_output.min(8 * 1024));
    let mut tmp = [0u8; 8192];

    let mut remaining_bytes = max_output;
    let mut remaining_lines = max_lines;

    loop {
        let n = reader.read(&mut tmp).await?;
        if n == 0 {
            break;
        }

        // Copy into the buffer only while we still have byte and line budget.
        if remaining_bytes > 0 && remaining_lines > 0 {
            let mut copy_len = 0;
            for &b in &tmp[..n] {
                if remaining_bytes == 0 || remaining_lines == 0 {
                    break;
                }
                copy_len += 1;
                remaining_bytes -= 1;
                if b == b'\n' {
                    remaining_lines -= 1;
                }
            }
            buf.extend_from_slice(&tmp[..copy_len]);
        }
        // Keep reading to EOF to avoid back-pressure, but discard once the
        // caps are hit.
    }

    Ok(buf)
}
