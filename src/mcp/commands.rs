//! MCP port forward commands implementation.
//!
//! This module provides the MCP tool implementations:
//!
//! - `start_port_forward`: Open a tunnel and wait until it runs or fails
//! - `stop_port_forward`: Tear a tunnel down (idempotent)
//! - `list_port_forwards`: Snapshot of every forward
//! - `get_port_forward_status`: Status of one forward
//! - `test_connection`: Dial the local end of a forward
//! - `remove_port_forward`: Forget a stopped or failed forward
//! - `check_gcloud_auth`, `authenticate_gcloud`, `get_active_project`,
//!   `set_active_project`, `get_gcp_projects`, `get_zones`,
//!   `get_compute_instances`: gcloud identity and inventory passthrough

use std::sync::Arc;
use std::time::Duration;

use poem_mcpserver::{Tools, content::Text, tool::StructuredContent};
use tracing::info;

use super::inventory::CloudInventory;
use super::manager::PortForwardManager;
use super::types::{
    AuthStatusResponse, ConnectionTestResponse, NameListResponse, PortForwardConfig,
    PortForwardListResponse, PortForwardResponse, PortForwardStatusResponse, ProjectListResponse,
};

/// MCP port forward tool implementation.
///
/// Cloning is cheap; every MCP session gets a clone sharing one manager.
#[derive(Clone)]
pub struct McpForwardCommands {
    manager: PortForwardManager,
    inventory: Arc<dyn CloudInventory>,
}

impl McpForwardCommands {
    pub fn new(manager: PortForwardManager, inventory: Arc<dyn CloudInventory>) -> Self {
        Self { manager, inventory }
    }
}

#[Tools]
impl McpForwardCommands {
    /// Forward localhost:local_port to instance:remote_port through IAP.
    ///
    /// Waits until the tunnel accepts connections (status `Running`) or the
    /// attempt fails. A failed forward stays listed with status `Error` and a
    /// diagnostic. Fails if the local port is already forwarded; stop it first
    /// to change the target.
    async fn start_port_forward(
        &self,
        /// Local port to listen on (1-65535)
        local_port: u16,
        /// Port on the remote instance (1-65535)
        remote_port: u16,
        /// Google Cloud project ID
        project_id: String,
        /// Compute zone of the instance (e.g., "us-central1-a")
        zone: String,
        /// Compute instance name
        instance: String,
        /// Deadline for establishing the tunnel in seconds (default: 60, env: FORWARD_START_TIMEOUT)
        timeout_secs: Option<u64>,
    ) -> Result<StructuredContent<PortForwardResponse>, String> {
        let config = PortForwardConfig::new(local_port, remote_port, project_id, zone, instance);
        let forward = self
            .manager
            .start(config, timeout_secs.map(Duration::from_secs))
            .await
            .map_err(|e| e.to_string())?;

        Ok(StructuredContent(PortForwardResponse {
            message: format!(
                "Forwarding localhost:{} to {}:{}",
                forward.local_port(),
                forward.config.instance,
                forward.config.remote_port
            ),
            forward,
        }))
    }

    /// Stop the forward on a local port.
    ///
    /// Stopping an already stopped forward succeeds. A forward that is still
    /// starting is cancelled.
    async fn stop_port_forward(
        &self,
        /// Local port of the forward
        local_port: u16,
        /// Deadline for the teardown in seconds (default: 15, env: FORWARD_STOP_TIMEOUT)
        timeout_secs: Option<u64>,
    ) -> Result<StructuredContent<PortForwardResponse>, String> {
        let forward = self
            .manager
            .stop(local_port, timeout_secs.map(Duration::from_secs))
            .await
            .map_err(|e| e.to_string())?;

        Ok(StructuredContent(PortForwardResponse {
            message: format!("Port forward on localhost:{} stopped", local_port),
            forward,
        }))
    }

    /// List all port forwards ordered by local port, including stopped and
    /// failed ones.
    async fn list_port_forwards(&self) -> StructuredContent<PortForwardListResponse> {
        let forwards = self.manager.list();
        StructuredContent(PortForwardListResponse {
            count: forwards.len(),
            forwards,
        })
    }

    /// Get the lifecycle status (Stopped, Starting, Running, Error, Stopping)
    /// of a forward, with the failure diagnostic if any.
    async fn get_port_forward_status(
        &self,
        /// Local port of the forward
        local_port: u16,
    ) -> Result<StructuredContent<PortForwardStatusResponse>, String> {
        let forward = self.manager.get(local_port).map_err(|e| e.to_string())?;
        Ok(StructuredContent(PortForwardStatusResponse {
            local_port,
            status: forward.status(),
            diagnostic: forward.diagnostic,
        }))
    }

    /// Check whether localhost:local_port accepts TCP connections.
    ///
    /// The dial is authoritative regardless of the recorded status, and a
    /// failed dial does not change the status.
    async fn test_connection(
        &self,
        /// Local port of the forward
        local_port: u16,
        /// Dial timeout in milliseconds (default: 2000, env: FORWARD_TEST_TIMEOUT_MS)
        timeout_ms: Option<u64>,
    ) -> Result<StructuredContent<ConnectionTestResponse>, String> {
        let timeout = timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.manager.settings().test_timeout);
        let reachable = self
            .manager
            .test_connection(local_port, Some(timeout))
            .await
            .map_err(|e| e.to_string())?;

        Ok(StructuredContent(ConnectionTestResponse {
            local_port,
            reachable,
            timeout_ms: timeout.as_millis() as u64,
        }))
    }

    /// Forget a stopped or failed forward so it no longer shows up in
    /// `list_port_forwards`.
    async fn remove_port_forward(
        &self,
        /// Local port of the forward
        local_port: u16,
    ) -> Result<Text<String>, String> {
        self.manager
            .remove(local_port)
            .await
            .map_err(|e| e.to_string())?;
        Ok(Text(format!(
            "Port forward on localhost:{} removed",
            local_port
        )))
    }

    /// Check whether gcloud has an active authenticated account.
    async fn check_gcloud_auth(&self) -> Result<StructuredContent<AuthStatusResponse>, String> {
        let authenticated = self.inventory.check_authenticated().await?;
        Ok(StructuredContent(AuthStatusResponse { authenticated }))
    }

    /// Run `gcloud auth login`. Completes once the browser flow finishes.
    async fn authenticate_gcloud(&self) -> Result<Text<String>, String> {
        self.inventory.authenticate().await?;
        Ok(Text("gcloud authentication completed".to_string()))
    }

    /// Get the active gcloud project ID.
    async fn get_active_project(&self) -> Result<Text<String>, String> {
        self.inventory.get_active_project().await.map(Text)
    }

    /// Set the active gcloud project.
    async fn set_active_project(
        &self,
        /// Google Cloud project ID to activate
        project_id: String,
    ) -> Result<Text<String>, String> {
        self.inventory.set_active_project(&project_id).await?;
        info!("Active project set to {}", project_id);
        Ok(Text(format!("Active project set to {}", project_id)))
    }

    /// List the Google Cloud projects visible to the active account.
    async fn get_gcp_projects(&self) -> Result<StructuredContent<ProjectListResponse>, String> {
        let projects = self.inventory.list_projects().await?;
        Ok(StructuredContent(ProjectListResponse {
            count: projects.len(),
            projects,
        }))
    }

    /// List the compute zones of a project.
    async fn get_zones(
        &self,
        /// Google Cloud project ID
        project_id: String,
    ) -> Result<StructuredContent<NameListResponse>, String> {
        let names = self.inventory.list_zones(&project_id).await?;
        Ok(StructuredContent(NameListResponse {
            count: names.len(),
            names,
        }))
    }

    /// List the compute instances of a project in one zone.
    async fn get_compute_instances(
        &self,
        /// Google Cloud project ID
        project_id: String,
        /// Compute zone (e.g., "us-central1-a")
        zone: String,
    ) -> Result<StructuredContent<NameListResponse>, String> {
        let names = self.inventory.list_instances(&project_id, &zone).await?;
        Ok(StructuredContent(NameListResponse {
            count: names.len(),
            names,
        }))
    }
}
