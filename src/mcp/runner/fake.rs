//! In-process runner for tests.
//!
//! Each started tunnel binds a real listener on the local port, so
//! connection tests see a live bridge.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::traits::{Liveness, TunnelHandle, TunnelRunner, TunnelTarget};

#[derive(Default)]
pub(crate) struct FakeRunner {
    /// Delay between binding the port and reporting success
    pub start_delay: Duration,
    /// How long each stop takes
    pub stop_delay: Duration,
    /// Diagnostics returned by the next starts, in order
    failures: StdMutex<VecDeque<String>>,
    starts: AtomicUsize,
    tunnels: StdMutex<Vec<Arc<FakeTunnel>>>,
}

impl FakeRunner {
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn with_stop_delay(mut self, delay: Duration) -> Self {
        self.stop_delay = delay;
        self
    }

    pub fn fail_next(&self, diagnostic: &str) {
        self.failures
            .lock()
            .unwrap()
            .push_back(diagnostic.to_string());
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Tunnels that started successfully, oldest first.
    pub fn tunnels(&self) -> Vec<Arc<FakeTunnel>> {
        self.tunnels.lock().unwrap().clone()
    }

    pub fn last_tunnel(&self) -> Arc<FakeTunnel> {
        self.tunnels().last().cloned().expect("a tunnel was started")
    }
}

#[async_trait]
impl TunnelRunner for FakeRunner {
    async fn start(&self, target: &TunnelTarget) -> Result<Arc<dyn TunnelHandle>, String> {
        self.starts.fetch_add(1, Ordering::SeqCst);

        let listener = TcpListener::bind(("127.0.0.1", target.local_port))
            .await
            .map_err(|e| format!("Local port {} is already in use: {}", target.local_port, e))?;
        let tunnel = Arc::new(FakeTunnel::serve(listener, self.stop_delay));

        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }

        let failure = self.failures.lock().unwrap().pop_front();
        if let Some(diagnostic) = failure {
            tunnel.crash(&diagnostic).await;
            return Err(diagnostic);
        }

        self.tunnels.lock().unwrap().push(tunnel.clone());
        Ok(tunnel)
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

pub(crate) struct FakeTunnel {
    id: String,
    liveness_tx: watch::Sender<Liveness>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    stop_delay: StdMutex<Duration>,
    stops: AtomicUsize,
}

impl FakeTunnel {
    fn serve(listener: TcpListener, stop_delay: Duration) -> Self {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => {
                        if accepted.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Self {
            id: Uuid::new_v4().to_string(),
            liveness_tx: watch::channel(Liveness::Alive).0,
            shutdown,
            task: Mutex::new(Some(task)),
            stop_delay: StdMutex::new(stop_delay),
            stops: AtomicUsize::new(0),
        }
    }

    /// Simulate the bridge dying on its own.
    pub async fn crash(&self, diagnostic: &str) {
        self.close_listener().await;
        self.liveness_tx
            .send_replace(Liveness::Exited(diagnostic.to_string()));
    }

    /// Override how long stopping this tunnel takes.
    pub fn set_stop_delay(&self, delay: Duration) {
        *self.stop_delay.lock().unwrap() = delay;
    }

    /// Number of stops that actually terminated this tunnel.
    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Stop accepting connections without reporting an exit.
    pub async fn close_listener(&self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

impl Drop for FakeTunnel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl TunnelHandle for FakeTunnel {
    fn id(&self) -> &str {
        &self.id
    }

    fn liveness(&self) -> Liveness {
        self.liveness_tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Liveness> {
        self.liveness_tx.subscribe()
    }

    async fn stop(&self, _grace: Duration) -> Result<(), String> {
        if self.liveness().is_exited() {
            return Ok(());
        }
        self.stops.fetch_add(1, Ordering::SeqCst);
        let delay = *self.stop_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.close_listener().await;
        self.liveness_tx
            .send_replace(Liveness::Exited("stopped".to_string()));
        Ok(())
    }
}

/// A throwaway `/bin/sh` script standing in for the `gcloud` executable.
///
/// `$PIDFILE` in the body names a file next to the script, for tests that
/// need to find the processes it started.
#[cfg(unix)]
pub(crate) struct StubGcloud {
    dir: tempfile::TempDir,
}

#[cfg(unix)]
impl StubGcloud {
    pub fn new(body: &str) -> Self {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("create stub directory");
        let script = dir.path().join("gcloud");
        let pidfile = dir.path().join("pid");
        std::fs::write(
            &script,
            format!("#!/bin/sh\nPIDFILE='{}'\n{}\n", pidfile.display(), body),
        )
        .expect("write stub script");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .expect("make stub executable");
        Self { dir }
    }

    pub fn path(&self) -> String {
        self.dir.path().join("gcloud").to_string_lossy().into_owned()
    }

    /// Pid the script wrote to `$PIDFILE`, if it got that far.
    pub fn recorded_pid(&self) -> Option<i32> {
        std::fs::read_to_string(self.dir.path().join("pid"))
            .ok()?
            .trim()
            .parse()
            .ok()
    }
}

/// Whether `pid` names a live process. Zombies count as gone.
#[cfg(target_os = "linux")]
pub(crate) fn process_alive(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        // The state letter follows the parenthesised command name
        Ok(stat) => stat
            .rsplit_once(')')
            .is_some_and(|(_, rest)| !rest.trim_start().starts_with('Z')),
        Err(_) => false,
    }
}

/// Poll until `pid` is gone, for up to two seconds.
#[cfg(target_os = "linux")]
pub(crate) async fn wait_until_gone(pid: i32) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if !process_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
