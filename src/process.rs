use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Configuration for spawning a child process.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub timeout: Option<Duration>,
    pub log_prefix: String,
    pub env: Vec<(String, String)>,
}

/// Output from a completed (or timed-out) child process.
#[derive(Debug)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub timed_out: bool,
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
    pub duration: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.signal.is_none() && !self.timed_out
    }

    pub fn stdout(&self) -> String {
        self.stdout_lines.join("\n")
    }

    pub fn stderr(&self) -> String {
        self.stderr_lines.join("\n")
    }
}

fn stream_lines<R>(reader: R, prefix: String, is_err: bool) -> JoinHandle<Vec<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = Vec::new();
        let mut reader = BufReader::new(reader).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            if is_err {
                warn!("[{prefix}] {line}");
            } else {
                info!("[{prefix}] {line}");
            }
            lines.push(line);
        }
        lines
    })
}

#[cfg(unix)]
fn kill_group(pgid: i32, sig: i32) {
    unsafe {
        libc::killpg(pgid, sig);
    }
}

/// Spawn a child process, stream its output line-by-line into the log, and
/// wait for completion.
///
/// The child gets its own process group on Unix; SIGINT/SIGTERM received by
/// the parent are forwarded to it so cancellation reaches agent sessions and
/// test runners. A timeout sends SIGTERM, then SIGKILL after a grace period,
/// and is reported via `timed_out` rather than an error.
pub async fn spawn_and_stream(config: ProcessConfig) -> Result<ProcessOutput> {
    let started = Instant::now();

    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .current_dir(&config.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Process(format!("failed to spawn '{}': {e}", config.command)))?;

    let pid = child
        .id()
        .ok_or_else(|| Error::Process("child has no pid".into()))? as i32;

    let stdout = child.stdout.take().expect("stdout is piped");
    let stderr = child.stderr.take().expect("stderr is piped");
    let stdout_task = stream_lines(stdout, config.log_prefix.clone(), false);
    let stderr_task = stream_lines(stderr, config.log_prefix.clone(), true);

    #[cfg(unix)]
    let signal_task = tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");
        loop {
            tokio::select! {
                _ = sigint.recv() => kill_group(pid, libc::SIGINT),
                _ = sigterm.recv() => kill_group(pid, libc::SIGTERM),
            }
        }
    });

    let mut timed_out = false;
    let status = match config.timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(result) => result.map_err(|e| Error::Process(format!("wait error: {e}")))?,
            Err(_) => {
                warn!(
                    "[{}] timed out after {limit:?}, terminating",
                    config.log_prefix
                );
                timed_out = true;
                #[cfg(unix)]
                kill_group(pid, libc::SIGTERM);
                tokio::time::sleep(Duration::from_millis(500)).await;
                #[cfg(unix)]
                kill_group(pid, libc::SIGKILL);
                child
                    .wait()
                    .await
                    .map_err(|e| Error::Process(format!("wait error: {e}")))?
            }
        },
        None => child
            .wait()
            .await
            .map_err(|e| Error::Process(format!("wait error: {e}")))?,
    };

    #[cfg(unix)]
    signal_task.abort();

    let stdout_lines = stdout_task
        .await
        .map_err(|e| Error::Process(format!("stdout reader failed: {e}")))?;
    let stderr_lines = stderr_task
        .await
        .map_err(|e| Error::Process(format!("stderr reader failed: {e}")))?;

    let (exit_code, signal) = exit_info(&status);

    Ok(ProcessOutput {
        exit_code,
        signal,
        timed_out,
        stdout_lines,
        stderr_lines,
        duration: started.elapsed(),
    })
}

fn exit_info(status: &std::process::ExitStatus) -> (i32, Option<i32>) {
    if let Some(code) = status.code() {
        return (code, None);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return (128 + sig, Some(sig));
        }
    }
    (-1, None)
}
