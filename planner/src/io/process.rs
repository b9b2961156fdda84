//! Helpers for running child processes with timeouts and bounded output.

use std::io::{self, Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Tail of stderr for error messages, at most `max` bytes.
    pub fn stderr_tail(&self, max: usize) -> String {
        let text = String::from_utf8_lossy(&self.stderr);
        let trimmed = text.trim();
        if trimmed.len() <= max {
            return trimmed.to_string();
        }
        let mut start = trimmed.len() - max;
        while !trimmed.is_char_boundary(start) {
            start += 1;
        }
        format!("...{}", &trimmed[start..])
    }
}

/// Run `cmd` until it exits or `timeout` passes, then kill it.
///
/// Oracle prompts arrive on `stdin`; setup commands get none. Each stream keeps
/// at most `output_limit_bytes`. Blocks, so async callers use `spawn_blocking`.
#[instrument(skip_all, fields(program = ?cmd.get_program(), timeout_secs = timeout.as_secs()))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .inspect_err(|e| error!(err = %e, "spawn failed"))
        .context("spawn command")?;

    let stdout = drain(child.stdout.take(), output_limit_bytes)?;
    let stderr = drain(child.stderr.take(), output_limit_bytes)?;
    // Dropping the pipe at the end of this block sends EOF.
    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input).context("write stdin")?;
    }

    let (status, timed_out) = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => (status, false),
        None => {
            warn!("command timed out, killing");
            child.kill().context("kill command")?;
            (child.wait().context("reap killed command")?, true)
        }
    };
    let (stdout, stdout_truncated) = collect(stdout).context("stdout")?;
    let (stderr, stderr_truncated) = collect(stderr).context("stderr")?;
    debug!(
        exit_code = ?status.code(),
        timed_out,
        stdout_truncated,
        stderr_truncated,
        "command finished"
    );
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

type Drained = thread::JoinHandle<Result<(Vec<u8>, usize)>>;

/// Read a pipe on its own thread so a chatty child never blocks on a full pipe.
fn drain<R: Read + Send + 'static>(pipe: Option<R>, limit: usize) -> Result<Drained> {
    let pipe = pipe.ok_or_else(|| anyhow!("output was not piped"))?;
    Ok(thread::spawn(move || read_bounded(pipe, limit)))
}

fn collect(handle: Drained) -> Result<(Vec<u8>, usize)> {
    handle
        .join()
        .map_err(|_| anyhow!("output reader thread panicked"))?
}

/// First `limit` bytes of `reader`, plus how many bytes after them were dropped.
fn read_bounded<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut kept = Vec::new();
    reader
        .by_ref()
        .take(limit as u64)
        .read_to_end(&mut kept)
        .context("read output")?;
    let dropped = io::copy(&mut reader, &mut io::sink()).context("drain output")?;
    Ok((kept, dropped as usize))
}
