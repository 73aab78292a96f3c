use std::io;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, error, info};

use crate::mcp_server::JsonRpcHandler;

/// Stdio transport for the MCP server: one JSON-RPC message per line on
/// stdin, one response per line on stdout. Logging goes to stderr so the
/// protocol stream stays clean.
pub struct StdioTransport {
    handler: JsonRpcHandler,
}

impl StdioTransport {
    pub fn new(handler: JsonRpcHandler) -> Self {
        Self { handler }
    }

    pub async fn run(&self) -> io::Result<()> {
        info!("Starting stdio transport");

        let mut reader = BufReader::new(tokio::io::stdin());
        let mut stdout = tokio::io::stdout();
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    debug!("EOF reached on stdin");
                    break;
                }
                Ok(_) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let response = match serde_json::from_str::<serde_json::Value>(&line) {
                        Ok(request) => self.handler.handle_request(request).await,
                        Err(e) => {
                            error!("Failed to parse JSON-RPC request: {}", e);
                            serde_json::json!({
                                "jsonrpc": "2.0",
                                "error": {
                                    "code": -32700,
                                    "message": "Parse error",
                                    "data": e.to_string()
                                },
                                "id": null
                            })
                        }
                    };
                    let response_str = serde_json::to_string(&response)?;
                    stdout.write_all(response_str.as_bytes()).await?;
                    stdout.write_all(b"\n").await?;
                    stdout.flush().await?;
                    debug!("Sent response: {}", response_str);
                }
                Err(e) => {
                    error!("Error reading from stdin: {}", e);
                    break;
                }
            }
        }

        Ok(())
    }
}
