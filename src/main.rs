#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use dotenv::dotenv;
use gcp_port_forward::mcp::runner::GcloudRunner;
use gcp_port_forward::mcp::shutdown::wait_for_signal;
use gcp_port_forward::mcp::{
    GcloudInventory, ManagerSettings, McpForwardCommands, PortForwardManager,
};
use poem::{EndpointExt, Route, Server, listener::TcpListener, middleware::Tracing};
use poem_mcpserver::{McpServer, streamable_http};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Initialize logging with proper tracing default
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let runner = GcloudRunner::from_env();
    let settings = ManagerSettings::from_env();
    let shutdown_timeout = settings.shutdown_timeout;
    info!("Using {:?} tunnel transport", runner.transport());

    let manager = PortForwardManager::new(Arc::new(runner), settings);
    let commands = McpForwardCommands::new(manager.clone(), Arc::new(GcloudInventory::from_env()));

    // Setup MCP server
    let mcp_port: u16 = std::env::var("MCP_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);
    let mcp_addr = format!("0.0.0.0:{}", mcp_port);
    info!("Starting MCP server on {}", mcp_addr);

    // Every MCP session shares the same manager
    let app = Route::new()
        .at(
            "/",
            streamable_http::endpoint(move |_| McpServer::new().tools(commands.clone())),
        )
        .with(Tracing);

    info!("Use start_port_forward to open a tunnel to a compute instance");

    Server::new(TcpListener::bind(mcp_addr))
        .name("GCP Port Forward MCP Server")
        .run_with_graceful_shutdown(app, wait_for_signal(), Some(shutdown_timeout))
        .await?;

    let stopped = manager.shutdown_all(shutdown_timeout).await;
    info!("Stopped {} port forward(s), exiting", stopped);

    Ok(())
}
