use std::env;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

use drivesearch_core::{
    connectors::onedrive::OneDriveConnector,
    mcp_server::{JsonRpcHandler, McpServer},
    oauth::ClientCredentialsTokenProvider,
    transport::StdioTransport,
    ProviderRegistry,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Log to stderr; stdout carries the MCP protocol stream.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    info!("Starting DriveSearch MCP server");

    let tenant_id = require_env("TENANT_ID")?;
    let client_id = require_env("CLIENT_ID")?;
    let client_secret = require_env("CLIENT_SECRET")?;

    let tokens = ClientCredentialsTokenProvider::new(tenant_id, client_id, client_secret);
    let mut connector = OneDriveConnector::new(Arc::new(tokens))?;
    if let Ok(base_url) = env::var("GRAPH_BASE_URL") {
        connector = connector.with_graph_base(&base_url);
    }

    let mut registry = ProviderRegistry::new();
    registry.register_provider(Box::new(connector));
    let registry = Arc::new(Mutex::new(registry));

    let server = McpServer::new(registry);
    let handler = JsonRpcHandler::new(server);
    let transport = StdioTransport::new(handler);

    info!("MCP server ready, listening on stdio");

    transport.run().await?;

    Ok(())
}

fn require_env(name: &str) -> Result<String, String> {
    env::var(name).map_err(|_| format!("Missing required environment variable: {}", name))
}
