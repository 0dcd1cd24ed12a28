//! Low-level shell execution
//!
//! Runs one command under `sh -c` in its own process group so timeout and
//! cancellation can terminate every descendant, not just the direct
//! child. Output is captured fully here; truncation and filtering happen
//! in the observation builder.

use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};

use crate::cancel::CancellationRegistry;

use super::CommandResult;

const TIMEOUT_KILL_GRACE_MS: u64 = 800;
const READER_JOIN_TIMEOUT_MS: u64 = 2_000;

fn build_shell_command(run: &str, shell: Option<&str>, cwd: Option<&str>) -> Command {
    let shell = match shell.map(str::trim) {
        Some("bash") => "bash",
        _ => "sh",
    };

    let mut cmd = Command::new(shell);
    cmd.arg("-c").arg(run);
    cmd.env("NO_COLOR", "1");

    if let Some(cwd) = cwd.map(str::trim).filter(|cwd| !cwd.is_empty() && *cwd != ".") {
        cmd.current_dir(cwd);
    }

    #[cfg(unix)]
    {
        cmd.process_group(0);
    }

    cmd
}

#[cfg(unix)]
fn signal_process_group(pid: u32, signal: &str) -> bool {
    let pgid = format!("-{pid}");
    std::process::Command::new("kill")
        .arg(signal)
        .arg(&pgid)
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(unix)]
async fn terminate_unix_process_tree(pid: u32) {
    if !signal_process_group(pid, "-TERM") {
        let _ = std::process::Command::new("kill")
            .arg("-TERM")
            .arg(pid.to_string())
            .status();
    }

    sleep(Duration::from_millis(200)).await;

    let still_running = std::process::Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .status()
        .map(|status| status.success())
        .unwrap_or(false);

    if still_running {
        signal_process_group(pid, "-KILL");
        let _ = std::process::Command::new("kill")
            .arg("-KILL")
            .arg(pid.to_string())
            .status();
    }
}

async fn terminate_process_tree(child: &mut Child) {
    let Some(pid) = child.id() else {
        let _ = child.kill().await;
        return;
    };

    #[cfg(unix)]
    terminate_unix_process_tree(pid).await;

    #[cfg(not(unix))]
    {
        let _ = child.kill().await;
    }

    if timeout(Duration::from_millis(TIMEOUT_KILL_GRACE_MS), child.wait())
        .await
        .is_err()
    {
        let _ = child.kill().await;
        let _ = child.wait().await;
    }
}

async fn read_stream<R>(pipe: Option<R>) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let mut buffer = Vec::new();
    let _ = pipe.read_to_end(&mut buffer).await;
    String::from_utf8_lossy(&buffer).into_owned()
}

async fn join_reader(handle: tokio::task::JoinHandle<String>) -> String {
    match timeout(Duration::from_millis(READER_JOIN_TIMEOUT_MS), handle).await {
        Ok(Ok(output)) => output,
        _ => String::new(),
    }
}

/// Execute one shell command with an explicit timeout, honoring the
/// cancellation registry while the process runs.
pub async fn run_command(
    run: &str,
    cwd: Option<&str>,
    timeout_sec: u64,
    shell: Option<&str>,
    registry: &CancellationRegistry,
) -> Result<CommandResult> {
    let started = Instant::now();

    let mut cmd = build_shell_command(run, shell, cwd);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().context("failed to spawn command")?;
    let pid = child.id();

    let operation = registry.register(format!("shell command: {run}"));
    if let Some(pid) = pid {
        operation.set_cancel_callback(move |_reason| {
            #[cfg(unix)]
            {
                if !signal_process_group(pid, "-TERM") {
                    let _ = std::process::Command::new("kill")
                        .arg("-TERM")
                        .arg(pid.to_string())
                        .status();
                }
            }
        });
    }

    let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
    let stderr_task = tokio::spawn(read_stream(child.stderr.take()));

    let timeout_duration = Duration::from_secs(timeout_sec.max(1));
    let waited = tokio::select! {
        waited = timeout(timeout_duration, child.wait()) => Some(waited),
        _ = operation.cancelled() => None,
    };

    let (exit_code, killed) = match waited {
        // Normal completion (or signal death, where `code()` is None).
        Some(Ok(Ok(status))) => (status.code(), false),
        Some(Ok(Err(err))) => {
            operation.unregister();
            return Err(err).context("failed to wait for command");
        }
        // Timeout elapsed.
        Some(Err(_)) => {
            terminate_process_tree(&mut child).await;
            (None, true)
        }
        // Canceled; the cancel callback already sent TERM to the group.
        None => {
            terminate_process_tree(&mut child).await;
            (None, true)
        }
    };

    operation.unregister();

    let stdout = join_reader(stdout_task).await;
    let stderr = join_reader(stderr_task).await;

    Ok(CommandResult {
        stdout,
        stderr,
        exit_code,
        runtime_ms: started.elapsed().as_millis() as u64,
        killed,
    })
}
