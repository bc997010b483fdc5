//! Tunnel runner trait definitions.
//!
//! A runner turns a [`TunnelTarget`] into a live bridge from
//! `localhost:local_port` to `instance:remote_port`. Transports are
//! interchangeable behind [`TunnelRunner`]; the manager never knows which one
//! it drives.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::mcp::types::PortForwardConfig;

/// Where a tunnel should go. Immutable once a forward is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    pub local_port: u16,
    pub remote_port: u16,
    pub project_id: String,
    pub zone: String,
    pub instance: String,
}

impl From<&PortForwardConfig> for TunnelTarget {
    fn from(config: &PortForwardConfig) -> Self {
        Self {
            local_port: config.local_port,
            remote_port: config.remote_port,
            project_id: config.project_id.clone(),
            zone: config.zone.clone(),
            instance: config.instance.clone(),
        }
    }
}

/// Liveness of a started tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// The bridge is gone; carries the exit diagnostic
    Exited(String),
}

impl Liveness {
    pub fn is_exited(&self) -> bool {
        matches!(self, Liveness::Exited(_))
    }
}

/// Handle to one started tunnel.
///
/// Dropping a handle that was never stopped must not leave the underlying
/// bridge running.
#[async_trait]
pub trait TunnelHandle: Send + Sync {
    /// Unique identifier of this tunnel instance.
    fn id(&self) -> &str;

    /// Current liveness snapshot.
    fn liveness(&self) -> Liveness;

    /// Subscribe to liveness changes. The channel ends on `Exited`.
    fn subscribe(&self) -> watch::Receiver<Liveness>;

    /// Terminate the tunnel: graceful first, forced once `grace` elapses.
    ///
    /// Calling this on a tunnel that already exited is a no-op.
    async fn stop(&self, grace: Duration) -> Result<(), String>;
}

/// A transport able to establish tunnels.
#[async_trait]
pub trait TunnelRunner: Send + Sync {
    /// Establish a tunnel and resolve once it is usable or has failed.
    async fn start(&self, target: &TunnelTarget) -> Result<Arc<dyn TunnelHandle>, String>;

    /// Get the name of this transport.
    ///
    /// Used for logging and debugging purposes.
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_from_config() {
        let config = PortForwardConfig::new(8080, 3306, "p1", "us-central1-a", "db-1");
        let target = TunnelTarget::from(&config);

        assert_eq!(target.local_port, 8080);
        assert_eq!(target.remote_port, 3306);
        assert_eq!(target.project_id, "p1");
        assert_eq!(target.zone, "us-central1-a");
        assert_eq!(target.instance, "db-1");
    }

    #[test]
    fn test_liveness_is_exited() {
        assert!(!Liveness::Alive.is_exited());
        assert!(Liveness::Exited("exit status: 0".to_string()).is_exited());
    }
}
