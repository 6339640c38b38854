//! Child process execution with a timeout and bounded output capture.
//!
//! Both process-backed adapters (the execution backend and the agent
//! executor) go through [`run_with_timeout`], so timeout enforcement lives in
//! the adapters and never in the workflow core.

use std::io::{ErrorKind, Read, Write};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
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
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    /// Render stdout/stderr as a log block, noting any truncation.
    pub fn render_log(&self, label: &str) -> String {
        let mut buf = String::new();
        buf.push_str("=== stdout ===\n");
        buf.push_str(&self.stdout_text());
        if self.stdout_truncated > 0 {
            buf.push_str(&format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        buf.push_str("\n=== stderr ===\n");
        buf.push_str(&self.stderr_text());
        if self.stderr_truncated > 0 {
            buf.push_str(&format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        if self.timed_out {
            buf.push_str(&format!("\n[{label} timed out]\n"));
        }
        buf
    }
}

/// Run a command with a timeout, feeding `stdin` and capturing stdout/stderr.
///
/// Input is written and output is read on helper threads while the child
/// runs, so the timeout covers the whole exchange even when the child never
/// drains its stdin. `output_limit_bytes` bounds how much of each stream is
/// kept; the rest is drained and counted. A timed-out child is killed and
/// reported with `timed_out = true`, not as an error.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!(program = ?cmd.get_program(), "spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        reap(&mut child);
        return Err(anyhow!("stdout/stderr were not piped"));
    };
    let stdout_handle = thread::spawn(move || read_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_limited(stderr, output_limit_bytes));

    if let Some(input) = stdin {
        let Some(child_stdin) = child.stdin.take() else {
            reap(&mut child);
            return Err(anyhow!("stdin was not piped"));
        };
        spawn_writer(child_stdin, input.to_vec());
    }

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout) {
        Ok(Some(status)) => status,
        Ok(None) => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            if let Err(err) = child.kill() {
                reap(&mut child);
                return Err(err).context("kill command");
            }
            child.wait().context("wait command after kill")?
        }
        Err(err) => {
            reap(&mut child);
            return Err(err).context("wait for command");
        }
    };

    let (stdout, stdout_truncated) = join_reader(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_reader(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// Write `input` and close the pipe. A child that exits without reading
/// everything closes its end first; that is not an error.
fn spawn_writer(mut pipe: ChildStdin, input: Vec<u8>) {
    thread::spawn(move || {
        if let Err(err) = pipe.write_all(&input)
            && err.kind() != ErrorKind::BrokenPipe
        {
            warn!(err = %err, "failed to write child stdin");
        }
    });
}

/// Kill and wait on an error path so the child is never left unreaped.
fn reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn join_reader(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        let keep = n.min(remaining);
        buf.extend_from_slice(&chunk[..keep]);
        truncated += n - keep;
    }

    Ok((buf, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_stdin_roundtrip() {
        let output = run_with_timeout(sh("cat"), Some(b"hello"), Duration::from_secs(5), 1024)
            .expect("run");
        assert!(output.succeeded());
        assert_eq!(output.stdout_text(), "hello");
    }

    #[test]
    fn truncates_beyond_limit() {
        let output = run_with_timeout(sh("printf 0123456789"), None, Duration::from_secs(5), 4)
            .expect("run");
        assert_eq!(output.stdout, b"0123");
        assert_eq!(output.stdout_truncated, 6);
        assert!(output.render_log("backend").contains("truncated 6 bytes"));
    }

    #[test]
    fn reports_timeout_without_error() {
        let output =
            run_with_timeout(sh("sleep 5"), None, Duration::from_millis(100), 1024).expect("run");
        assert!(output.timed_out);
        assert!(!output.succeeded());
    }

    #[test]
    fn timeout_covers_stdin_the_child_never_reads() {
        let input = vec![b'x'; 1 << 20];
        let started = Instant::now();
        let output = run_with_timeout(sh("exec sleep 3"), Some(&input), Duration::from_millis(200), 1024)
            .expect("run");
        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
    }

    #[test]
    fn large_stdin_and_stdout_do_not_deadlock() {
        let input = vec![b'y'; 1 << 20];
        let output =
            run_with_timeout(sh("cat"), Some(&input), Duration::from_secs(10), 1024).expect("run");
        assert!(output.succeeded());
        assert_eq!(output.stdout.len(), 1024);
        assert_eq!(output.stdout_truncated, (1 << 20) - 1024);
    }

    #[test]
    fn child_exiting_early_is_not_a_write_error() {
        let input = vec![b'z'; 1 << 20];
        let output =
            run_with_timeout(sh("exit 0"), Some(&input), Duration::from_secs(5), 1024).expect("run");
        assert!(output.succeeded());
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let err = run_with_timeout(
            Command::new("definitely-not-a-real-binary-fixloop"),
            None,
            Duration::from_secs(1),
            16,
        )
        .unwrap_err();
        assert!(err.to_string().contains("spawn command"));
    }
}
