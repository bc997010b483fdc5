//! Cloud identity and inventory collaborator.
//!
//! Plain request/response calls to the `gcloud` CLI. Nothing here is cached
//! and the port forward manager never calls it; the tool layer passes the
//! identifiers it returns through verbatim.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use crate::mcp::config::resolve_gcloud_path;
use crate::mcp::types::GcpProject;

/// Bound on a single inventory call
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// `gcloud auth login` waits for the operator to finish in a browser
const AUTH_TIMEOUT: Duration = Duration::from_secs(300);

#[async_trait]
pub trait CloudInventory: Send + Sync {
    /// Whether an account is active.
    async fn check_authenticated(&self) -> Result<bool, String>;

    async fn authenticate(&self) -> Result<(), String>;

    async fn get_active_project(&self) -> Result<String, String>;

    async fn set_active_project(&self, project_id: &str) -> Result<(), String>;

    async fn list_projects(&self) -> Result<Vec<GcpProject>, String>;

    async fn list_zones(&self, project_id: &str) -> Result<Vec<String>, String>;

    async fn list_instances(&self, project_id: &str, zone: &str) -> Result<Vec<String>, String>;
}

/// Inventory backed by the `gcloud` executable.
#[derive(Debug, Clone)]
pub struct GcloudInventory {
    gcloud_path: String,
}

impl GcloudInventory {
    pub fn new(gcloud_path: impl Into<String>) -> Self {
        Self {
            gcloud_path: gcloud_path.into(),
        }
    }

    /// Build from `GCLOUD_PATH`.
    pub fn from_env() -> Self {
        Self::new(resolve_gcloud_path(None))
    }

    /// Run `gcloud` with `args` and return its stdout.
    async fn run(&self, args: &[&str], timeout: Duration) -> Result<String, String> {
        debug!("Running {} {}", self.gcloud_path, args.join(" "));

        let mut command = Command::new(&self.gcloud_path);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| format!("gcloud {} timed out after {:?}", args.join(" "), timeout))?
            .map_err(|e| format!("Failed to launch {}: {}", self.gcloud_path, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "gcloud {} failed ({}): {}",
                args.join(" "),
                output.status,
                stderr.trim()
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl CloudInventory for GcloudInventory {
    async fn check_authenticated(&self) -> Result<bool, String> {
        let accounts = self
            .run(
                &["auth", "list", "--filter=status:ACTIVE", "--format=value(account)"],
                COMMAND_TIMEOUT,
            )
            .await?;
        Ok(!accounts.trim().is_empty())
    }

    async fn authenticate(&self) -> Result<(), String> {
        info!("Starting gcloud auth login");
        self.run(&["auth", "login"], AUTH_TIMEOUT).await.map(|_| ())
    }

    async fn get_active_project(&self) -> Result<String, String> {
        let project = self
            .run(&["config", "get-value", "project"], COMMAND_TIMEOUT)
            .await?;
        Ok(project.trim().to_string())
    }

    async fn set_active_project(&self, project_id: &str) -> Result<(), String> {
        info!("Setting active gcloud project to {}", project_id);
        self.run(&["config", "set", "project", project_id], COMMAND_TIMEOUT)
            .await
            .map(|_| ())
    }

    async fn list_projects(&self) -> Result<Vec<GcpProject>, String> {
        let json = self
            .run(&["projects", "list", "--format=json"], COMMAND_TIMEOUT)
            .await?;
        // No active project is not an error for listing
        let active = self.get_active_project().await.unwrap_or_default();
        parse_projects_json(&json, &active)
    }

    async fn list_zones(&self, project_id: &str) -> Result<Vec<String>, String> {
        let project = format!("--project={}", project_id);
        let names = self
            .run(
                &["compute", "zones", "list", &project, "--format=value(name)"],
                COMMAND_TIMEOUT,
            )
            .await?;
        Ok(parse_name_lines(&names))
    }

    async fn list_instances(&self, project_id: &str, zone: &str) -> Result<Vec<String>, String> {
        let project = format!("--project={}", project_id);
        let zones = format!("--zones={}", zone);
        let names = self
            .run(
                &[
                    "compute",
                    "instances",
                    "list",
                    &project,
                    &zones,
                    "--format=value(name)",
                ],
                COMMAND_TIMEOUT,
            )
            .await?;
        Ok(parse_name_lines(&names))
    }
}

/// One line per name; blank output means none.
pub(crate) fn parse_name_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectRecord {
    project_id: String,
    #[serde(default)]
    name: Option<String>,
}

/// Parse `gcloud projects list --format=json`.
pub(crate) fn parse_projects_json(json: &str, active: &str) -> Result<Vec<GcpProject>, String> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let records: Vec<ProjectRecord> =
        serde_json::from_str(json).map_err(|e| format!("Unexpected gcloud project list: {}", e))?;

    Ok(records
        .into_iter()
        .map(|record| GcpProject {
            is_active: record.project_id == active,
            project_name: record.name.unwrap_or_else(|| record.project_id.clone()),
            project_id: record.project_id,
        })
        .collect())
}
