#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use dotenv::dotenv;
use gcp_port_forward::mcp::runner::GcloudRunner;
use gcp_port_forward::mcp::shutdown::wait_for_signal;
use gcp_port_forward::mcp::{
    GcloudInventory, ManagerSettings, McpForwardCommands, PortForwardManager,
};
use poem_mcpserver::McpServer;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // stdout carries the protocol, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings = ManagerSettings::from_env();
    let shutdown_timeout = settings.shutdown_timeout;
    let manager = PortForwardManager::new(Arc::new(GcloudRunner::from_env()), settings);
    let commands = McpForwardCommands::new(manager.clone(), Arc::new(GcloudInventory::from_env()));

    tokio::select! {
        result = poem_mcpserver::stdio::stdio(McpServer::new().tools(commands)) => result?,
        _ = wait_for_signal() => {}
    }

    let stopped = manager.shutdown_all(shutdown_timeout).await;
    info!("Stopped {} port forward(s), exiting", stopped);
    Ok(())
}
