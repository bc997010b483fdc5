//! Child-process tunnel handle.
//!
//! The tunnel process runs in its own process group so a stop reaches the
//! whole tree (`gcloud` and the `ssh` it launches). A reaper task owns the
//! `Child`, waits for it and publishes the exit on a watch channel:
//!
//! - stderr is drained into a bounded tail that becomes the exit diagnostic
//! - stop sends SIGTERM to the group, then kills it after the grace period
//! - dropping an unstopped handle kills the group
//! - when the process exits on its own, the rest of its group is killed too

use std::collections::VecDeque;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::traits::{Liveness, TunnelHandle};

/// Number of stderr lines kept for diagnostics
const STDERR_TAIL_LINES: usize = 20;

/// Lines of the stderr tail included in an exit diagnostic
const DIAGNOSTIC_LINES: usize = 3;

/// How long the reaper waits for stderr to drain after the process exits
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// How long a forced kill may take before stop gives up
const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct StderrTail {
    lines: VecDeque<String>,
}

impl StderrTail {
    fn push_line(&mut self, line: String) {
        self.lines.push_back(line);
        while self.lines.len() > STDERR_TAIL_LINES {
            self.lines.pop_front();
        }
    }

    fn summary(&self) -> Option<String> {
        let start = self.lines.len().saturating_sub(DIAGNOSTIC_LINES);
        let recent: Vec<&str> = self
            .lines
            .iter()
            .skip(start)
            .map(String::as_str)
            .collect();
        if recent.is_empty() {
            None
        } else {
            Some(recent.join(" | "))
        }
    }
}

/// A tunnel backed by a supervised child process.
pub struct ProcessTunnel {
    id: String,
    pid: Option<u32>,
    liveness_rx: watch::Receiver<Liveness>,
    kill: CancellationToken,
}

impl ProcessTunnel {
    /// Spawn `command` as a tunnel process.
    ///
    /// stdin/stdout are detached and stderr is captured; the child is placed
    /// in a new process group on unix.
    pub fn spawn(mut command: Command, program: &str) -> Result<Self, String> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| format!("Failed to launch {}: {}", program, e))?;

        let id = Uuid::new_v4().to_string();
        let pid = child.id();
        let tail = Arc::new(Mutex::new(StderrTail::default()));
        let reader = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(collect_stderr(stderr, tail.clone(), id.clone())));

        let (liveness_tx, liveness_rx) = watch::channel(Liveness::Alive);
        let kill = CancellationToken::new();

        debug!("Tunnel {} spawned {} (pid {:?})", id, program, pid);

        tokio::spawn(reap(
            child,
            pid,
            kill.clone(),
            liveness_tx,
            reader,
            tail,
            id.clone(),
        ));

        Ok(Self {
            id,
            pid,
            liveness_rx,
            kill,
        })
    }
}

impl Drop for ProcessTunnel {
    fn drop(&mut self) {
        // No-op if the reaper already finished
        self.kill.cancel();
    }
}

#[async_trait]
impl TunnelHandle for ProcessTunnel {
    fn id(&self) -> &str {
        &self.id
    }

    fn liveness(&self) -> Liveness {
        self.liveness_rx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Liveness> {
        self.liveness_rx.clone()
    }

    async fn stop(&self, grace: Duration) -> Result<(), String> {
        if self.liveness().is_exited() {
            return Ok(());
        }

        let mut rx = self.liveness_rx.clone();

        if !grace.is_zero() && terminate_group(self.pid) {
            if tokio::time::timeout(grace, wait_exited(&mut rx))
                .await
                .is_ok()
            {
                info!("Tunnel {} exited gracefully", self.id);
                return Ok(());
            }
            warn!(
                "Tunnel {} did not exit within {:?}, killing it",
                self.id, grace
            );
        }

        self.kill.cancel();
        match tokio::time::timeout(KILL_CONFIRM_TIMEOUT, wait_exited(&mut rx)).await {
            Ok(_) => Ok(()),
            Err(_) => Err(format!(
                "Tunnel {} did not exit within {:?} of being killed",
                self.id, KILL_CONFIRM_TIMEOUT
            )),
        }
    }
}

async fn wait_exited(rx: &mut watch::Receiver<Liveness>) -> bool {
    rx.wait_for(Liveness::is_exited).await.is_ok()
}

async fn collect_stderr(stderr: ChildStderr, tail: Arc<Mutex<StderrTail>>, id: String) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                debug!("Tunnel {} stderr: {}", id, line);
                tail.lock().await.push_line(line);
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Tunnel {} stderr read ended: {}", id, e);
                break;
            }
        }
    }
}

async fn reap(
    mut child: Child,
    pid: Option<u32>,
    kill: CancellationToken,
    liveness_tx: watch::Sender<Liveness>,
    reader: Option<JoinHandle<()>>,
    tail: Arc<Mutex<StderrTail>>,
    id: String,
) {
    let status = tokio::select! {
        status = child.wait() => {
            // Leftover group members (the ssh gcloud launched) may still hold the port
            kill_group(pid);
            status
        }
        _ = kill.cancelled() => {
            kill_group(pid);
            if let Err(e) = child.start_kill() {
                debug!("Tunnel {} start_kill: {}", id, e);
            }
            child.wait().await
        }
    };

    if let Some(reader) = reader {
        // stderr can stay open while grandchildren are alive
        let _ = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, reader).await;
    }

    let diagnostic = describe_exit(&status, tail.lock().await.summary());
    debug!("Tunnel {} exited: {}", id, diagnostic);
    let _ = liveness_tx.send(Liveness::Exited(diagnostic));
}

fn describe_exit(status: &io::Result<ExitStatus>, stderr: Option<String>) -> String {
    let head = match status {
        Ok(status) => status.to_string(),
        Err(e) => format!("Failed to wait for tunnel process: {}", e),
    };
    match stderr {
        Some(stderr) => format!("{}: {}", head, stderr),
        None => head,
    }
}

/// Send SIGTERM to the tunnel's process group. Returns whether a signal was
/// delivered.
#[cfg(unix)]
fn terminate_group(pid: Option<u32>) -> bool {
    signal_group(pid, nix::sys::signal::Signal::SIGTERM)
}

#[cfg(not(unix))]
fn terminate_group(_pid: Option<u32>) -> bool {
    false
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    signal_group(pid, nix::sys::signal::Signal::SIGKILL);
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: nix::sys::signal::Signal) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return false;
    };

    match killpg(Pid::from_raw(pid), signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            debug!("Failed to send {} to process group {}: {}", signal, pid, e);
            false
        }
    }
}
