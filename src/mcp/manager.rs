//! Port forward manager.
//!
//! Owns the registry, drives each forward through its lifecycle and keeps one
//! supervisor per running tunnel.
//!
//! # Concurrency
//!
//! - A start claims its port with a compare-and-set in the registry before
//!   doing any work, so exactly one of two concurrent starts wins.
//! - Start and stop attempts then run under the entry's operation lock, giving
//!   a total order of mutations per port. Different ports never share a lock.
//! - Attempts run in detached tasks. A caller deadline cancels a start (the
//!   in-flight tunnel is dropped and killed) but never strands a stop: a timed
//!   out stop keeps running and the forward still reaches `Stopped`.
//! - Supervisor updates are generation-guarded, so a watcher of a superseded
//!   tunnel cannot clobber a newer state.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::mcp::config::{
    MAX_RETRY_DELAY, resolve_max_retries, resolve_retry_delay, resolve_shutdown_timeout,
    resolve_start_timeout, resolve_stop_grace, resolve_stop_timeout, resolve_test_timeout,
};
use crate::mcp::error::{ForwardError, is_retryable_diagnostic};
use crate::mcp::runner::{TunnelHandle, TunnelRunner, TunnelTarget};
use crate::mcp::storage::{
    DashMapForwardStorage, ForwardStorage, StatusChange, StorageError,
};
use crate::mcp::supervisor::spawn_supervisor;
use crate::mcp::tester;
use crate::mcp::types::{ForwardInfo, ForwardStatus, PortForwardConfig};

/// Poll interval of a stop waiting for a racing start to back off
const STARTING_BACKOFF: Duration = Duration::from_millis(25);

/// Timeouts and retry policy of a [`PortForwardManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerSettings {
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub stop_grace: Duration,
    pub test_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub shutdown_timeout: Duration,
}

impl ManagerSettings {
    /// Resolve every setting from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            start_timeout: resolve_start_timeout(None),
            stop_timeout: resolve_stop_timeout(None),
            stop_grace: resolve_stop_grace(None),
            test_timeout: resolve_test_timeout(None),
            max_retries: resolve_max_retries(None),
            retry_delay: resolve_retry_delay(None),
            shutdown_timeout: resolve_shutdown_timeout(None),
        }
    }
}

/// Orchestrates port forwards on top of a [`TunnelRunner`].
///
/// Cheap to clone; clones share the registry and runner.
#[derive(Clone)]
pub struct PortForwardManager {
    registry: Arc<dyn ForwardStorage>,
    runner: Arc<dyn TunnelRunner>,
    settings: ManagerSettings,
    shutdown: CancellationToken,
}

impl PortForwardManager {
    pub fn new(runner: Arc<dyn TunnelRunner>, settings: ManagerSettings) -> Self {
        Self::with_storage(Arc::new(DashMapForwardStorage::new()), runner, settings)
    }

    pub fn with_storage(
        registry: Arc<dyn ForwardStorage>,
        runner: Arc<dyn TunnelRunner>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            registry,
            runner,
            settings,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Start a forward and wait until the attempt concludes.
    ///
    /// Returns the `Running` entry, or the establishment failure (the entry
    /// then stays visible as `Error` with its diagnostic). When `timeout`
    /// elapses first the attempt is cancelled and [`ForwardError::Timeout`]
    /// is returned.
    pub async fn start(
        &self,
        config: PortForwardConfig,
        timeout: Option<Duration>,
    ) -> Result<ForwardInfo, ForwardError> {
        config.validate().map_err(ForwardError::InvalidConfig)?;
        let port = config.local_port;

        if self.shutdown.is_cancelled() {
            return Err(ForwardError::TunnelEstablishFailed {
                port,
                diagnostic: "port forward manager is shutting down".to_string(),
            });
        }

        let claimed = self
            .registry
            .upsert(config.clone(), self.shutdown.child_token())
            .map_err(|e| match e {
                StorageError::Occupied { .. } => ForwardError::PortInUse(port),
                other => ForwardError::Internal {
                    port,
                    message: other.to_string(),
                },
            })?;
        let generation = claimed.info.generation;

        info!(
            "Starting port forward localhost:{} -> {}:{} (generation {}, runner {})",
            port,
            config.instance,
            config.remote_port,
            generation,
            self.runner.name()
        );

        let attempt = claimed.cancel.child_token();
        let mut task = tokio::spawn({
            let manager = self.clone();
            let attempt = attempt.clone();
            async move {
                manager
                    .run_start(config, generation, claimed.op_lock, claimed.cancel, attempt)
                    .await
            }
        });

        let timeout = timeout.unwrap_or(self.settings.start_timeout);
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(joined) => joined.unwrap_or_else(|e| {
                Err(ForwardError::Internal {
                    port,
                    message: format!("start task failed: {}", e),
                })
            }),
            Err(_) => {
                warn!(
                    "Start of port forward on local port {} timed out after {:?}, cancelling",
                    port, timeout
                );
                attempt.cancel();
                // The attempt may have won the race with the deadline
                match task.await {
                    Ok(Ok(info)) => Ok(info),
                    _ => Err(ForwardError::Timeout {
                        operation: "start",
                        port,
                        timeout,
                    }),
                }
            }
        }
    }

    async fn run_start(
        &self,
        config: PortForwardConfig,
        generation: u64,
        op_lock: Arc<Mutex<()>>,
        cancel: CancellationToken,
        attempt: CancellationToken,
    ) -> Result<ForwardInfo, ForwardError> {
        let port = config.local_port;

        let _guard = tokio::select! {
            guard = op_lock.lock() => guard,
            _ = attempt.cancelled() => {
                return self.fail_start(port, generation, "start cancelled before launch".to_string());
            }
        };
        if attempt.is_cancelled() {
            return self.fail_start(port, generation, "start cancelled before launch".to_string());
        }

        let target = TunnelTarget::from(&config);
        let last_failure = StdMutex::new(None);
        let outcome = tokio::select! {
            result = self.start_with_retry(&target, &last_failure) => Some(result),
            _ = attempt.cancelled() => None,
        };
        // A deadline hit between retries keeps the runner's own diagnostic
        let outcome = outcome.unwrap_or_else(|| {
            Err(last_failure
                .lock()
                .ok()
                .and_then(|mut last| last.take())
                .unwrap_or_else(|| "start cancelled before the tunnel became ready".to_string()))
        });

        let handle = match outcome {
            Ok(handle) => handle,
            Err(diagnostic) => return self.fail_start(port, generation, diagnostic),
        };

        match self.registry.compare_and_set_status(
            port,
            generation,
            StatusChange::Running(handle.clone()),
        ) {
            Ok(info) => {
                spawn_supervisor(
                    self.registry.clone(),
                    port,
                    generation,
                    handle.subscribe(),
                    cancel,
                );
                info!(
                    "Port forward on local port {} is running (tunnel {})",
                    port,
                    handle.id()
                );
                Ok(info)
            }
            Err(e) => {
                warn!(
                    "Discarding tunnel {} for local port {}: {}",
                    handle.id(),
                    port,
                    e
                );
                if let Err(stop_err) = handle.stop(self.settings.stop_grace).await {
                    warn!("Failed to stop discarded tunnel {}: {}", handle.id(), stop_err);
                }
                Err(ForwardError::TunnelEstablishFailed {
                    port,
                    diagnostic: e.to_string(),
                })
            }
        }
    }

    /// Launch the tunnel, retrying transient failures with exponential backoff.
    /// Every failed attempt is recorded in `last_failure`.
    async fn start_with_retry(
        &self,
        target: &TunnelTarget,
        last_failure: &StdMutex<Option<String>>,
    ) -> Result<Arc<dyn TunnelHandle>, String> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.settings.retry_delay)
            .with_max_delay(MAX_RETRY_DELAY)
            .with_max_times(self.settings.max_retries as usize)
            .with_jitter();

        let runner = self.runner.clone();
        (|| async {
            let result = runner.start(target).await;
            if let Err(diagnostic) = &result
                && let Ok(mut last) = last_failure.lock()
            {
                *last = Some(diagnostic.clone());
            }
            result
        })
            .retry(backoff)
            .when(|diagnostic: &String| is_retryable_diagnostic(diagnostic))
            .notify(|diagnostic: &String, delay: Duration| {
                warn!(
                    "Tunnel start on local port {} failed ({}), retrying in {:?}",
                    target.local_port, diagnostic, delay
                );
            })
            .await
    }

    fn fail_start(
        &self,
        port: u16,
        generation: u64,
        diagnostic: String,
    ) -> Result<ForwardInfo, ForwardError> {
        warn!(
            "Failed to start port forward on local port {}: {}",
            port, diagnostic
        );
        if let Err(e) = self.registry.compare_and_set_status(
            port,
            generation,
            StatusChange::Failed(diagnostic.clone()),
        ) {
            debug!(
                "Could not record start failure on local port {}: {}",
                port, e
            );
        }
        Err(ForwardError::TunnelEstablishFailed { port, diagnostic })
    }

    /// Stop a forward and reset it to `Stopped`.
    ///
    /// Stopping a `Stopped` forward is a no-op. A stop issued while the
    /// forward is `Starting` cancels the attempt. When `timeout` elapses the
    /// stop continues in the background and [`ForwardError::Timeout`] is
    /// returned.
    pub async fn stop(
        &self,
        local_port: u16,
        timeout: Option<Duration>,
    ) -> Result<ForwardInfo, ForwardError> {
        let entry = self
            .registry
            .get(local_port)
            .map_err(|_| ForwardError::NotFound(local_port))?;
        if entry.info.status() == ForwardStatus::Stopped {
            return Ok(entry.info);
        }

        let task = tokio::spawn({
            let manager = self.clone();
            async move { manager.run_stop(local_port, entry.op_lock).await }
        });

        let timeout = timeout.unwrap_or(self.settings.stop_timeout);
        match tokio::time::timeout(timeout, task).await {
            Ok(joined) => joined.unwrap_or_else(|e| {
                Err(ForwardError::Internal {
                    port: local_port,
                    message: format!("stop task failed: {}", e),
                })
            }),
            Err(_) => {
                warn!(
                    "Stop of port forward on local port {} exceeded {:?}, continuing in background",
                    local_port, timeout
                );
                Err(ForwardError::Timeout {
                    operation: "stop",
                    port: local_port,
                    timeout,
                })
            }
        }
    }

    async fn run_stop(
        &self,
        local_port: u16,
        op_lock: Arc<Mutex<()>>,
    ) -> Result<ForwardInfo, ForwardError> {
        loop {
            // A start holds the lock for its whole attempt; cancel it first
            if let Ok(entry) = self.registry.get(local_port)
                && entry.info.status() == ForwardStatus::Starting
            {
                entry.cancel.cancel();
            }

            let guard = op_lock.lock().await;
            let entry = self
                .registry
                .get(local_port)
                .map_err(|_| ForwardError::NotFound(local_port))?;
            let generation = entry.info.generation;

            match entry.info.status() {
                // Claimed by a start that has not taken the lock yet
                ForwardStatus::Starting => {
                    drop(guard);
                    tokio::time::sleep(STARTING_BACKOFF).await;
                    continue;
                }
                // Coalesced with a stop that finished first
                ForwardStatus::Stopped => return Ok(entry.info),
                ForwardStatus::Error => match self.finish_stop(local_port, generation) {
                    Some(result) => return result,
                    None => continue,
                },
                ForwardStatus::Running | ForwardStatus::Stopping => {
                    if entry.info.status() == ForwardStatus::Running {
                        match self.registry.compare_and_set_status(
                            local_port,
                            generation,
                            StatusChange::Stopping,
                        ) {
                            Ok(_) => {}
                            Err(StorageError::NotFound) => {
                                return Err(ForwardError::NotFound(local_port));
                            }
                            // The supervisor recorded a crash since the read
                            Err(e) => {
                                debug!(
                                    "Stop on local port {} raced a status change: {}",
                                    local_port, e
                                );
                                drop(guard);
                                continue;
                            }
                        }
                    }
                    info!("Stopping port forward on local port {}", local_port);

                    if let Some(handle) = &entry.handle
                        && let Err(e) = handle.stop(self.settings.stop_grace).await
                    {
                        warn!(
                            "Tunnel {} on local port {} did not stop cleanly: {}",
                            handle.id(),
                            local_port,
                            e
                        );
                    }
                    entry.cancel.cancel();
                    match self.finish_stop(local_port, generation) {
                        Some(result) => return result,
                        None => continue,
                    }
                }
            }
        }
    }

    /// Reset the entry to `Stopped`. `None` means the entry changed under us
    /// and the stop has to look again.
    fn finish_stop(
        &self,
        local_port: u16,
        generation: u64,
    ) -> Option<Result<ForwardInfo, ForwardError>> {
        match self
            .registry
            .compare_and_set_status(local_port, generation, StatusChange::Stopped)
        {
            Ok(info) => {
                info!("Port forward on local port {} stopped", local_port);
                Some(Ok(info))
            }
            Err(StorageError::NotFound) => Some(Err(ForwardError::NotFound(local_port))),
            Err(e) => {
                debug!(
                    "Stop on local port {} raced a status change: {}",
                    local_port, e
                );
                None
            }
        }
    }

    /// Snapshot of every forward, ordered by local port.
    pub fn list(&self) -> Vec<ForwardInfo> {
        self.registry.list()
    }

    pub fn get(&self, local_port: u16) -> Result<ForwardInfo, ForwardError> {
        self.registry
            .get(local_port)
            .map(|entry| entry.info)
            .map_err(|_| ForwardError::NotFound(local_port))
    }

    pub fn get_status(&self, local_port: u16) -> Result<ForwardStatus, ForwardError> {
        self.get(local_port).map(|info| info.status())
    }

    /// Dial `localhost:local_port` regardless of the recorded status. A
    /// failed dial does not change the status.
    pub async fn test_connection(
        &self,
        local_port: u16,
        timeout: Option<Duration>,
    ) -> Result<bool, ForwardError> {
        self.get(local_port)?;
        let timeout = timeout.unwrap_or(self.settings.test_timeout);
        Ok(tester::test_connection(local_port, timeout).await)
    }

    /// Forget a `Stopped` or `Error` forward.
    pub async fn remove(&self, local_port: u16) -> Result<ForwardInfo, ForwardError> {
        let entry = self
            .registry
            .get(local_port)
            .map_err(|_| ForwardError::NotFound(local_port))?;
        let _guard = entry.op_lock.lock().await;

        match self.registry.remove(local_port) {
            Ok(info) => {
                info!("Removed port forward on local port {}", local_port);
                Ok(info)
            }
            Err(StorageError::Occupied { .. }) => Err(ForwardError::PortInUse(local_port)),
            Err(_) => Err(ForwardError::NotFound(local_port)),
        }
    }

    /// Stop every active forward, bounded by `timeout` in total. New starts
    /// are refused afterwards. Returns how many forwards were stopped before
    /// the deadline.
    pub async fn shutdown_all(&self, timeout: Duration) -> usize {
        self.shutdown.cancel();

        let active: Vec<u16> = self
            .registry
            .list()
            .into_iter()
            .filter(|info| !info.status().is_quiescent())
            .map(|info| info.local_port())
            .collect();
        if active.is_empty() {
            return 0;
        }

        info!("Stopping {} active port forward(s)", active.len());
        let mut stops: FuturesUnordered<_> = active
            .iter()
            .map(|&port| async move { (port, self.stop(port, Some(timeout)).await) })
            .collect();

        let mut stopped = 0;
        let drained = tokio::time::timeout(timeout, async {
            while let Some((port, result)) = stops.next().await {
                match result {
                    Ok(_) => stopped += 1,
                    Err(e) => warn!("Failed to stop local port {} on shutdown: {}", port, e),
                }
            }
        })
        .await;

        if drained.is_err() {
            let remaining: Vec<u16> = self
                .registry
                .list()
                .into_iter()
                .filter(|info| !info.status().is_quiescent())
                .map(|info| info.local_port())
                .collect();
            warn!(
                "Shutdown did not finish within {:?}; {} of {} forward(s) stopped, still active: {:?}",
                timeout,
                stopped,
                active.len(),
                remaining
            );
        }
        stopped
    }
}
