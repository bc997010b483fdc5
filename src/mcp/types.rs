//! Serializable data model and response types for the port forward tools.
//!
//! Field names use camelCase on the wire (`localPort`, `projectId`, ...).
//! Status is a closed enum inside the crate; its string form only appears at
//! the serialization boundary.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a port forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ForwardStatus {
    /// No tunnel is running (initial and terminal state)
    #[default]
    Stopped,
    /// A tunnel is being established
    Starting,
    /// The tunnel is live
    Running,
    /// The tunnel failed to start or exited unexpectedly (see diagnostic)
    Error,
    /// The tunnel is being torn down
    Stopping,
}

impl ForwardStatus {
    /// Whether a new start may claim an entry in this state.
    pub fn is_quiescent(self) -> bool {
        matches!(self, ForwardStatus::Stopped | ForwardStatus::Error)
    }

    /// Allowed edges of the lifecycle state machine.
    pub fn can_transition_to(self, next: ForwardStatus) -> bool {
        use ForwardStatus::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Error, Starting)
                | (Error, Stopped)
                | (Starting, Running)
                | (Starting, Error)
                | (Running, Stopping)
                | (Running, Error)
                | (Stopping, Stopped)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ForwardStatus::Stopped => "Stopped",
            ForwardStatus::Starting => "Starting",
            ForwardStatus::Running => "Running",
            ForwardStatus::Error => "Error",
            ForwardStatus::Stopping => "Stopping",
        }
    }
}

impl fmt::Display for ForwardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ForwardStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stopped" => Ok(ForwardStatus::Stopped),
            "starting" => Ok(ForwardStatus::Starting),
            "running" => Ok(ForwardStatus::Running),
            "error" => Ok(ForwardStatus::Error),
            "stopping" => Ok(ForwardStatus::Stopping),
            other => Err(format!("Unknown port forward status: {}", other)),
        }
    }
}

/// One configured forward from `localhost:local_port` to
/// `instance:remote_port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardConfig {
    pub local_port: u16,
    pub remote_port: u16,
    pub project_id: String,
    pub zone: String,
    pub instance: String,
    /// Managed by the forward manager; any value supplied by a caller is ignored
    #[serde(default)]
    pub status: ForwardStatus,
}

impl PortForwardConfig {
    pub fn new(
        local_port: u16,
        remote_port: u16,
        project_id: impl Into<String>,
        zone: impl Into<String>,
        instance: impl Into<String>,
    ) -> Self {
        Self {
            local_port,
            remote_port,
            project_id: project_id.into(),
            zone: zone.into(),
            instance: instance.into(),
            status: ForwardStatus::Stopped,
        }
    }

    /// Check ports and target identifiers before a start is attempted.
    pub fn validate(&self) -> Result<(), String> {
        if self.local_port == 0 {
            return Err("localPort must be between 1 and 65535".to_string());
        }
        if self.remote_port == 0 {
            return Err("remotePort must be between 1 and 65535".to_string());
        }
        for (field, value) in [
            ("projectId", &self.project_id),
            ("zone", &self.zone),
            ("instance", &self.instance),
        ] {
            if value.trim().is_empty() {
                return Err(format!("{} must not be empty", field));
            }
            if value.starts_with('-') {
                return Err(format!("{} must not start with '-'", field));
            }
        }
        Ok(())
    }
}

/// Snapshot of a registry entry as seen by callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ForwardInfo {
    #[serde(flatten)]
    pub config: PortForwardConfig,
    /// Start attempt counter for this local port
    pub generation: u64,
    /// Why the forward is in `Error` (cleared on restart)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    /// Identifier of the live tunnel, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_id: Option<String>,
    /// Time of the last status change (RFC3339 format)
    pub updated_at: String,
}

impl ForwardInfo {
    pub fn status(&self) -> ForwardStatus {
        self.config.status
    }

    pub fn local_port(&self) -> u16 {
        self.config.local_port
    }
}

/// Response from start_port_forward and stop_port_forward
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct PortForwardResponse {
    pub forward: ForwardInfo,
    pub message: String,
}

/// Response from list_port_forwards
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct PortForwardListResponse {
    /// Forwards ordered by ascending local port
    pub forwards: Vec<ForwardInfo>,
    pub count: usize,
}

/// Response from get_port_forward_status
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardStatusResponse {
    pub local_port: u16,
    pub status: ForwardStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

/// Response from test_connection
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionTestResponse {
    pub local_port: u16,
    pub reachable: bool,
    pub timeout_ms: u64,
}

/// A Google Cloud project as reported by the inventory collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GcpProject {
    pub project_id: String,
    pub project_name: String,
    pub is_active: bool,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ProjectListResponse {
    pub projects: Vec<GcpProject>,
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct NameListResponse {
    pub names: Vec<String>,
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct AuthStatusResponse {
    pub authenticated: bool,
}
