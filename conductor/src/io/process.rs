//! Child processes with hard timeouts and bounded output.

use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

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
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    /// Stdout followed by stderr, with truncation notices.
    pub fn combined_text(&self) -> String {
        let mut buf = String::from_utf8_lossy(&self.stdout).into_owned();
        if self.stdout_truncated > 0 {
            buf.push_str(&format!("\n[stdout truncated {} bytes]\n", self.stdout_truncated));
        }
        if !self.stderr.is_empty() {
            if !buf.is_empty() && !buf.ends_with('\n') {
                buf.push('\n');
            }
            buf.push_str(&String::from_utf8_lossy(&self.stderr));
        }
        if self.stderr_truncated > 0 {
            buf.push_str(&format!("\n[stderr truncated {} bytes]\n", self.stderr_truncated));
        }
        buf
    }
}

/// Run `sh -c <script>` in `workdir`.
pub fn run_shell(
    script: &str,
    workdir: &Path,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(script).current_dir(workdir);
    run_command_with_timeout(cmd, None, timeout, output_limit_bytes)
        .with_context(|| format!("run `{script}` in {}", workdir.display()))
}

/// Run `cmd` to completion or until `timeout`, feeding it `stdin` if given.
///
/// Both output streams are drained on their own threads while the child
/// runs, so a chatty child never blocks on a full pipe. Each stream keeps at
/// most `output_limit_bytes`; the rest is only counted. A child still running
/// at the deadline is killed and reported with `timed_out = true`.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let started = Instant::now();
    let mut child = cmd.spawn().map_err(|err| {
        error!(err = %err, "failed to spawn command");
        anyhow::Error::new(err).context("spawn command")
    })?;

    let stdout = capture(child.stdout.take(), "stdout", output_limit_bytes)?;
    let stderr = capture(child.stderr.take(), "stderr", output_limit_bytes)?;
    let writer = match stdin {
        Some(input) => {
            let mut pipe = child.stdin.take().ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            // Dropping the pipe at the end of the thread closes the child's stdin.
            Some(thread::spawn(move || pipe.write_all(&input)))
        }
        None => None,
    };

    let (status, timed_out) = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => (status, false),
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            child.kill().context("kill command")?;
            (child.wait().context("wait command after kill")?, true)
        }
    };

    if let Some(writer) = writer {
        match writer.join() {
            Ok(Ok(())) => {}
            // A child that exits without reading all of its input is not our failure.
            Ok(Err(err)) => debug!(err = %err, "stdin closed early"),
            Err(_) => return Err(anyhow!("stdin writer thread panicked")),
        }
    }
    let stdout = stdout.join()?;
    let stderr = stderr.join()?;

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout: stdout.bytes,
        stderr: stderr.bytes,
        stdout_truncated: stdout.dropped,
        stderr_truncated: stderr.dropped,
        timed_out,
        duration: started.elapsed(),
    })
}

/// Bytes kept from one output stream, plus how many were discarded.
#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    dropped: usize,
}

impl Captured {
    fn push(&mut self, chunk: &[u8], limit: usize) {
        let keep = chunk.len().min(limit.saturating_sub(self.bytes.len()));
        self.bytes.extend_from_slice(&chunk[..keep]);
        self.dropped += chunk.len() - keep;
    }
}

struct Capture {
    stream: &'static str,
    handle: thread::JoinHandle<Result<Captured>>,
}

impl Capture {
    fn join(self) -> Result<Captured> {
        self.handle
            .join()
            .map_err(|_| anyhow!("{} reader thread panicked", self.stream))?
            .with_context(|| format!("read {}", self.stream))
    }
}

fn capture<R: Read + Send + 'static>(pipe: Option<R>, stream: &'static str, limit: usize) -> Result<Capture> {
    let mut reader = pipe.ok_or_else(|| anyhow!("{stream} was not piped"))?;
    let handle = thread::spawn(move || -> Result<Captured> {
        let mut captured = Captured::default();
        let mut chunk = [0u8; 8192];
        loop {
            let n = reader.read(&mut chunk)?;
            if n == 0 {
                return Ok(captured);
            }
            captured.push(&chunk[..n], limit);
        }
    });
    Ok(Capture { stream, handle })
}
