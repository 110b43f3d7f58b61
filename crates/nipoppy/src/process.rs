//! Shell command execution with output capture and cancellation.
//!
//! Commands run synchronously through `sh -c`. A caller-supplied
//! [`CancelToken`] is observed while waiting on the child: on
//! cancellation the child receives SIGTERM, then SIGKILL after a grace
//! period. Per-pipeline time limits are not enforced here — they belong
//! to the HPC script.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Cooperative cancellation signal, observed between units and while
/// waiting on a child process.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct ShellOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub cancelled: bool,
    pub duration: Duration,
}

/// Run a shell command with extra environment variables, capturing
/// stdout and stderr.
pub fn run_shell(
    command: &str,
    working_dir: &Path,
    env_vars: &BTreeMap<String, String>,
    cancel: &CancelToken,
) -> Result<ShellOutput> {
    let start = Instant::now();

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(working_dir)
        .envs(env_vars)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn command {command:?}"))?;

    let (exit_code, cancelled) = loop {
        match child.try_wait().context("failed to poll command")? {
            Some(status) => break (status.code().unwrap_or(-1), false),
            None => {
                if cancel.is_cancelled() {
                    terminate(&mut child);
                    let _ = child.wait();
                    break (-1, true);
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    };

    let mut stdout_bytes = Vec::new();
    let mut stderr_bytes = Vec::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = out.read_to_end(&mut stdout_bytes);
    }
    if let Some(mut err) = child.stderr.take() {
        let _ = err.read_to_end(&mut stderr_bytes);
    }

    let mut stderr = String::from_utf8_lossy(&stderr_bytes).to_string();
    if cancelled {
        stderr.push_str("\ncommand cancelled before completion\n");
    }

    Ok(ShellOutput {
        exit_code,
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr,
        cancelled,
        duration: start.elapsed(),
    })
}

/// SIGTERM, a grace period, then SIGKILL.
#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let pid = Pid::from_raw(child.id() as i32);
    let _ = kill(pid, Signal::SIGTERM);

    let deadline = Instant::now() + TERM_GRACE;
    while Instant::now() < deadline {
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    let _ = child.kill();
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.kill();
}
