//! `gcloud`-backed tunnel runners.
//!
//! Two transports reach an instance through Identity-Aware Proxy:
//!
//! - [`GcloudTransport::Ssh`]: `gcloud compute ssh --tunnel-through-iap` with
//!   an `ssh -L` local forward and no remote command (`-N`)
//! - [`GcloudTransport::IapTunnel`]: `gcloud compute start-iap-tunnel`, a
//!   plain TCP tunnel that does not need an sshd on the instance
//!
//! In both cases the process stays in the foreground so its liveness can be
//! supervised. A start succeeds once the process is alive and the local port
//! accepts connections.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable};
use tokio::net::TcpListener;
use tokio::process::Command;
use tracing::{info, warn};

use super::process::ProcessTunnel;
use super::traits::{Liveness, TunnelHandle, TunnelRunner, TunnelTarget};
use crate::mcp::config::{resolve_gcloud_path, resolve_ready_timeout, resolve_use_iap_transport};
use crate::mcp::tester::test_connection;

/// Interval between readiness probes
const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Timeout of a single readiness probe
const READY_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcloudTransport {
    Ssh,
    IapTunnel,
}

/// Runner that launches one `gcloud` process per tunnel.
#[derive(Debug, Clone)]
pub struct GcloudRunner {
    gcloud_path: String,
    transport: GcloudTransport,
    ready_timeout: Duration,
}

impl GcloudRunner {
    pub fn new(
        gcloud_path: impl Into<String>,
        transport: GcloudTransport,
        ready_timeout: Duration,
    ) -> Self {
        Self {
            gcloud_path: gcloud_path.into(),
            transport,
            ready_timeout,
        }
    }

    /// Build a runner from `GCLOUD_PATH`, `FORWARD_TRANSPORT` and
    /// `FORWARD_READY_TIMEOUT`.
    pub fn from_env() -> Self {
        let transport = if resolve_use_iap_transport(None) {
            GcloudTransport::IapTunnel
        } else {
            GcloudTransport::Ssh
        };
        Self::new(resolve_gcloud_path(None), transport, resolve_ready_timeout(None))
    }

    pub fn transport(&self) -> GcloudTransport {
        self.transport
    }

    pub(crate) fn build_args(&self, target: &TunnelTarget) -> Vec<String> {
        match self.transport {
            GcloudTransport::Ssh => ssh_args(target),
            GcloudTransport::IapTunnel => iap_tunnel_args(target),
        }
    }
}

#[async_trait]
impl TunnelRunner for GcloudRunner {
    async fn start(&self, target: &TunnelTarget) -> Result<Arc<dyn TunnelHandle>, String> {
        ensure_port_free(target.local_port).await?;

        let mut command = Command::new(&self.gcloud_path);
        command.args(self.build_args(target));

        info!(
            "Launching {} tunnel localhost:{} -> {}:{} (project {}, zone {})",
            self.name(),
            target.local_port,
            target.instance,
            target.remote_port,
            target.project_id,
            target.zone
        );

        let tunnel = ProcessTunnel::spawn(command, &self.gcloud_path)?;

        match wait_until_ready(&tunnel, target.local_port, self.ready_timeout).await {
            Ok(()) => Ok(Arc::new(tunnel)),
            Err(diagnostic) => {
                if let Err(e) = tunnel.stop(Duration::ZERO).await {
                    warn!("Failed to clean up tunnel {}: {}", tunnel.id(), e);
                }
                Err(diagnostic)
            }
        }
    }

    fn name(&self) -> &'static str {
        match self.transport {
            GcloudTransport::Ssh => "gcloud-ssh",
            GcloudTransport::IapTunnel => "gcloud-iap-tunnel",
        }
    }
}

fn ssh_args(target: &TunnelTarget) -> Vec<String> {
    vec![
        "compute".to_string(),
        "ssh".to_string(),
        target.instance.clone(),
        format!("--zone={}", target.zone),
        format!("--project={}", target.project_id),
        "--tunnel-through-iap".to_string(),
        "--quiet".to_string(),
        "--ssh-flag=-N".to_string(),
        format!(
            "--ssh-flag=-L {}:localhost:{}",
            target.local_port, target.remote_port
        ),
        "--ssh-flag=-oExitOnForwardFailure=yes".to_string(),
        "--ssh-flag=-oServerAliveInterval=30".to_string(),
    ]
}

fn iap_tunnel_args(target: &TunnelTarget) -> Vec<String> {
    vec![
        "compute".to_string(),
        "start-iap-tunnel".to_string(),
        target.instance.clone(),
        target.remote_port.to_string(),
        format!("--local-host-port=localhost:{}", target.local_port),
        format!("--zone={}", target.zone),
        format!("--project={}", target.project_id),
    ]
}

/// Fail fast when another process already owns the local port.
pub(crate) async fn ensure_port_free(port: u16) -> Result<(), String> {
    match TcpListener::bind(("127.0.0.1", port)).await {
        Ok(listener) => {
            drop(listener);
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => Err(format!(
            "Local port {} is already in use by another process",
            port
        )),
        Err(e) => Err(format!("Cannot bind local port {}: {}", port, e)),
    }
}

#[derive(Debug)]
enum Readiness {
    NotReady,
    Exited(String),
}

/// Poll until the tunnel accepts connections on `port`, the tunnel exits, or
/// `ready_timeout` elapses.
pub(crate) async fn wait_until_ready(
    handle: &dyn TunnelHandle,
    port: u16,
    ready_timeout: Duration,
) -> Result<(), String> {
    let attempts = (ready_timeout.as_millis() / READY_POLL_INTERVAL.as_millis()).max(1) as usize;
    let backoff = ConstantBuilder::default()
        .with_delay(READY_POLL_INTERVAL)
        .with_max_times(attempts);

    let result = (|| async move {
        if let Liveness::Exited(diagnostic) = handle.liveness() {
            return Err(Readiness::Exited(diagnostic));
        }
        if test_connection(port, READY_PROBE_TIMEOUT).await {
            Ok(())
        } else {
            Err(Readiness::NotReady)
        }
    })
    .retry(backoff)
    .when(|e| matches!(e, Readiness::NotReady))
    .await;

    match result {
        Ok(()) => Ok(()),
        Err(Readiness::Exited(diagnostic)) => Err(format!(
            "Tunnel process exited before becoming ready: {}",
            diagnostic
        )),
        Err(Readiness::NotReady) => Err(format!(
            "Tunnel did not accept connections within {:?}",
            ready_timeout
        )),
    }
}
