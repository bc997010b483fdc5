//! MCP port forward module providing tunnel management tools for Google
//! Cloud compute instances.
//!
//! This module is organized into the following submodules:
//!
//! - `types`: Data model and serializable response types
//! - `config`: Configuration resolution with environment variable support
//! - `error`: Error taxonomy and diagnostic classification for retry logic
//! - `storage`: Registry of forwards keyed by local port
//! - `runner`: Tunnel runners (`gcloud` child processes)
//! - `supervisor`: Crash detection for running tunnels
//! - `tester`: Bounded TCP reachability checks
//! - `manager`: Lifecycle orchestration
//! - `inventory`: gcloud identity and inventory calls
//! - `commands`: MCP tool implementations

pub mod commands;
pub(crate) mod config;
pub mod error;
pub mod inventory;
pub mod manager;
pub mod runner;
pub mod shutdown;
pub mod storage;
pub(crate) mod supervisor;
pub mod tester;
pub mod types;

pub use commands::McpForwardCommands;
pub use error::ForwardError;
pub use inventory::{CloudInventory, GcloudInventory};
pub use manager::{ManagerSettings, PortForwardManager};
