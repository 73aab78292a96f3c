use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::{
    auth::AuthDetails,
    capabilities::{ConnectorConfigSchema, FieldType},
    utils::structured_result,
    ConnectorError, ProviderRegistry,
};
use rmcp::model::*;

/// MCP server that routes requests to the connectors in a [`ProviderRegistry`].
pub struct McpServer {
    registry: Arc<Mutex<ProviderRegistry>>,
}

impl McpServer {
    pub fn new(registry: Arc<Mutex<ProviderRegistry>>) -> Self {
        Self { registry }
    }

    /// Aggregate capabilities across all registered connectors.
    pub async fn get_capabilities(&self) -> ServerCapabilities {
        let registry = self.registry.lock().await;
        let mut capabilities = ServerCapabilities::default();

        for (_name, connector) in registry.providers.iter() {
            let conn = connector.lock().await;
            let conn_caps = conn.capabilities().await;
            if conn_caps.tools.is_some() {
                capabilities.tools = conn_caps.tools;
            }
            if conn_caps.resources.is_some() {
                capabilities.resources = conn_caps.resources;
            }
            if conn_caps.prompts.is_some() {
                capabilities.prompts = conn_caps.prompts;
            }
        }

        capabilities
    }

    pub async fn handle_initialize(
        &self,
        _request: InitializeRequestParam,
    ) -> Result<InitializeResult, ConnectorError> {
        info!("MCP server initializing");

        Ok(InitializeResult {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: self.get_capabilities().await,
            server_info: Implementation {
                name: "drivesearch".to_string(),
                title: None,
                version: env!("CARGO_PKG_VERSION").to_string(),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "OneDrive file search over Microsoft Graph. Tools are namespaced as 'connector/tool'."
                    .to_string(),
            ),
        })
    }

    pub async fn handle_list_resources(
        &self,
        request: Option<PaginatedRequestParam>,
    ) -> Result<ListResourcesResult, ConnectorError> {
        let registry = self.registry.lock().await;
        let mut all_resources = Vec::new();

        for (name, connector) in registry.providers.iter() {
            let c = connector.lock().await;
            match c.list_resources(request.clone()).await {
                Ok(response) => all_resources.extend(response.resources),
                Err(e) => error!("Error listing resources from connector {}: {:?}", name, e),
            }
        }

        Ok(ListResourcesResult {
            resources: all_resources,
            next_cursor: None,
        })
    }

    /// Route a resource read to the first connector that recognizes the URI.
    pub async fn handle_read_resource(
        &self,
        request: ReadResourceRequestParam,
    ) -> Result<Vec<ResourceContents>, ConnectorError> {
        let registry = self.registry.lock().await;

        for (_name, connector) in registry.providers.iter() {
            let c = connector.lock().await;
            match c.read_resource(request.clone()).await {
                Ok(contents) => return Ok(contents),
                Err(ConnectorError::ResourceNotFound) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(ConnectorError::ResourceNotFound)
    }

    /// Aggregate tools across connectors, prefixing each tool name with its
    /// connector name, and append the generic credential-administration tools.
    pub async fn handle_list_tools(
        &self,
        request: Option<PaginatedRequestParam>,
    ) -> Result<ListToolsResult, ConnectorError> {
        let registry = self.registry.lock().await;
        let mut all_tools = Vec::new();

        for (connector_name, connector) in registry.providers.iter() {
            let c = connector.lock().await;
            match c.list_tools(request.clone()).await {
                Ok(response) => {
                    let prefixed: Vec<Tool> = response
                        .tools
                        .into_iter()
                        .map(|mut tool| {
                            tool.name = format!("{}/{}", connector_name, tool.name).into();
                            tool
                        })
                        .collect();
                    all_tools.extend(prefixed);
                }
                Err(e) => {
                    error!(
                        "Error listing tools from connector {}: {:?}",
                        connector_name, e
                    );
                }
            }
        }

        for (connector_name, connector) in registry.providers.iter() {
            let c = connector.lock().await;
            let schema = c.config_schema();
            drop(c);

            all_tools.push(Tool {
                name: format!("auth/{}/set", connector_name).into(),
                title: None,
                description: Some(
                    format!("Set credentials for '{}' (application registration values).", connector_name).into(),
                ),
                input_schema: Arc::new(config_schema_to_jsonschema(&schema)),
                output_schema: None,
                annotations: None,
                icons: None,
            });
            all_tools.push(Tool {
                name: format!("auth/{}/test", connector_name).into(),
                title: None,
                description: Some("Test authentication for the connector.".into()),
                input_schema: Arc::new(empty_object_schema()),
                output_schema: None,
                annotations: None,
                icons: None,
            });
            all_tools.push(Tool {
                name: format!("auth/{}/get_schema", connector_name).into(),
                title: None,
                description: Some(
                    "Return JSON schema for connector credentials (fields/types).".into(),
                ),
                input_schema: Arc::new(empty_object_schema()),
                output_schema: None,
                annotations: None,
                icons: None,
            });
        }

        Ok(ListToolsResult {
            tools: all_tools,
            next_cursor: None,
        })
    }

    /// Route a tool call, either to a connector ('connector/tool') or to the
    /// credential administration surface ('auth/<provider>/<action>').
    pub async fn handle_call_tool(
        &self,
        request: CallToolRequestParam,
    ) -> Result<CallToolResult, ConnectorError> {
        if request.name.starts_with("auth/") {
            let parts: Vec<&str> = request.name.split('/').collect();
            if parts.len() != 3 {
                return Err(ConnectorError::InvalidInput(
                    "Auth tool must be 'auth/<provider>/<action>'".into(),
                ));
            }
            let provider = parts[1];
            let action = parts[2];

            let registry = self.registry.lock().await;
            let connector = registry
                .providers
                .get(provider)
                .ok_or_else(|| {
                    ConnectorError::InvalidInput(format!("Unknown connector: {}", provider))
                })?
                .clone();
            drop(registry);

            return match action {
                "set" => {
                    let args_map = request.arguments.unwrap_or_default();
                    let mut details = AuthDetails::new();
                    for (k, v) in args_map.into_iter() {
                        if let Some(s) = v.as_str() {
                            details.insert(k, s.to_string());
                        } else if v.is_number() || v.is_boolean() {
                            details.insert(k, v.to_string());
                        }
                    }
                    let mut c = connector.lock().await;
                    c.set_auth_details(details).await?;
                    structured_result(&json!({"ok": true}))
                }
                "test" => {
                    let c = connector.lock().await;
                    c.test_auth().await?;
                    structured_result(&json!({"ok": true}))
                }
                "get_schema" => {
                    let c = connector.lock().await;
                    let schema = c.config_schema();
                    let js = config_schema_to_jsonschema(&schema);
                    structured_result(&json!({"schema": js}))
                }
                _ => Err(ConnectorError::ToolNotFound),
            };
        }

        let parts: Vec<&str> = request.name.split('/').collect();
        if parts.len() != 2 {
            return Err(ConnectorError::InvalidInput(format!(
                "Tool name must be in format 'connector/tool' or 'auth/<provider>/<action>', got: {}",
                request.name
            )));
        }

        let connector_name = parts[0];
        let tool_name = parts[1];

        let registry = self.registry.lock().await;

        if let Some(connector) = registry.providers.get(connector_name) {
            let unprefixed_request = CallToolRequestParam {
                name: tool_name.to_string().into(),
                arguments: request.arguments,
            };

            let c = connector.lock().await;
            c.call_tool(unprefixed_request).await
        } else {
            Err(ConnectorError::InvalidInput(format!(
                "Unknown connector: {}",
                connector_name
            )))
        }
    }

    pub async fn handle_list_prompts(
        &self,
        request: Option<PaginatedRequestParam>,
    ) -> Result<ListPromptsResult, ConnectorError> {
        let registry = self.registry.lock().await;
        let mut all_prompts = Vec::new();

        for (connector_name, connector) in registry.providers.iter() {
            let c = connector.lock().await;
            match c.list_prompts(request.clone()).await {
                Ok(response) => {
                    let prefixed: Vec<Prompt> = response
                        .prompts
                        .into_iter()
                        .map(|mut prompt| {
                            prompt.name = format!("{}/{}", connector_name, prompt.name);
                            prompt
                        })
                        .collect();
                    all_prompts.extend(prefixed);
                }
                Err(e) => {
                    error!(
                        "Error listing prompts from connector {}: {:?}",
                        connector_name, e
                    );
                }
            }
        }

        Ok(ListPromptsResult {
            prompts: all_prompts,
            next_cursor: None,
        })
    }

    pub async fn handle_get_prompt(&self, name: &str) -> Result<Prompt, ConnectorError> {
        let parts: Vec<&str> = name.split('/').collect();
        if parts.len() != 2 {
            return Err(ConnectorError::InvalidInput(format!(
                "Prompt name must be in format 'connector/prompt', got: {}",
                name
            )));
        }

        let registry = self.registry.lock().await;

        if let Some(connector) = registry.providers.get(parts[0]) {
            let c = connector.lock().await;
            let mut prompt = c.get_prompt(parts[1]).await?;
            prompt.name = name.to_string();
            Ok(prompt)
        } else {
            Err(ConnectorError::InvalidInput(format!(
                "Unknown connector: {}",
                parts[0]
            )))
        }
    }
}

fn empty_object_schema() -> serde_json::Map<String, Value> {
    json!({"type": "object", "properties": {}})
        .as_object()
        .expect("Schema must be an object")
        .clone()
}

fn config_schema_to_jsonschema(
    schema: &ConnectorConfigSchema,
) -> serde_json::Map<String, Value> {
    let mut props = serde_json::Map::new();
    let mut required: Vec<String> = Vec::new();
    for f in &schema.fields {
        let (ty, extra) = match &f.field_type {
            FieldType::Text => ("string", json!({})),
            FieldType::Secret => ("string", json!({"format": "password"})),
            FieldType::Select { options } => ("string", json!({"enum": options.clone()})),
        };
        let mut obj = serde_json::Map::new();
        obj.insert("type".to_string(), json!(ty));
        if let Some(desc) = &f.description {
            obj.insert("description".to_string(), json!(desc));
        }
        for (k, v) in extra
            .as_object()
            .expect("Schema extra properties must be an object")
            .iter()
        {
            obj.insert(k.clone(), v.clone());
        }
        props.insert(f.name.clone(), Value::Object(obj));
        if f.required {
            required.push(f.name.clone());
        }
    }
    let mut root = serde_json::Map::new();
    root.insert("type".to_string(), json!("object"));
    root.insert("properties".to_string(), Value::Object(props));
    if !required.is_empty() {
        root.insert("required".to_string(), json!(required));
    }
    root
}

/// JSON-RPC message handler for the MCP server.
pub struct JsonRpcHandler {
    server: McpServer,
}

impl JsonRpcHandler {
    pub fn new(server: McpServer) -> Self {
        Self { server }
    }

    /// Process one JSON-RPC request and return the response envelope.
    pub async fn handle_request(&self, request: Value) -> Value {
        debug!("Handling JSON-RPC request: {:?}", request);

        let id = request.get("id").cloned();
        let method = request.get("method").and_then(|m| m.as_str()).unwrap_or("");
        let params = request.get("params").cloned().unwrap_or(json!({}));

        let result = match method {
            "initialize" => match serde_json::from_value::<InitializeRequestParam>(params) {
                Ok(req) => self
                    .server
                    .handle_initialize(req)
                    .await
                    .and_then(|r| serde_json::to_value(r).map_err(ConnectorError::SerdeJson))
                    .map_err(|e| e.to_jsonrpc_error()),
                Err(e) => Err(ConnectorError::SerdeJson(e).to_jsonrpc_error()),
            },
            "resources/list" => {
                match serde_json::from_value::<Option<PaginatedRequestParam>>(params) {
                    Ok(req) => self
                        .server
                        .handle_list_resources(req)
                        .await
                        .and_then(|r| serde_json::to_value(r).map_err(ConnectorError::SerdeJson))
                        .map_err(|e| e.to_jsonrpc_error()),
                    Err(e) => Err(ConnectorError::SerdeJson(e).to_jsonrpc_error()),
                }
            }
            "resources/read" => match serde_json::from_value::<ReadResourceRequestParam>(params) {
                Ok(req) => self
                    .server
                    .handle_read_resource(req)
                    .await
                    .and_then(|r| serde_json::to_value(r).map_err(ConnectorError::SerdeJson))
                    .map_err(|e| e.to_jsonrpc_error()),
                Err(e) => Err(ConnectorError::SerdeJson(e).to_jsonrpc_error()),
            },
            "tools/list" => match serde_json::from_value::<Option<PaginatedRequestParam>>(params) {
                Ok(req) => self
                    .server
                    .handle_list_tools(req)
                    .await
                    .and_then(|r| serde_json::to_value(r).map_err(ConnectorError::SerdeJson))
                    .map_err(|e| e.to_jsonrpc_error()),
                Err(e) => Err(ConnectorError::SerdeJson(e).to_jsonrpc_error()),
            },
            "tools/call" => match serde_json::from_value::<CallToolRequestParam>(params) {
                Ok(req) => self
                    .server
                    .handle_call_tool(req)
                    .await
                    .and_then(|r| serde_json::to_value(r).map_err(ConnectorError::SerdeJson))
                    .map_err(|e| e.to_jsonrpc_error()),
                Err(e) => Err(ConnectorError::SerdeJson(e).to_jsonrpc_error()),
            },
            "prompts/list" => {
                match serde_json::from_value::<Option<PaginatedRequestParam>>(params) {
                    Ok(req) => self
                        .server
                        .handle_list_prompts(req)
                        .await
                        .and_then(|r| serde_json::to_value(r).map_err(ConnectorError::SerdeJson))
                        .map_err(|e| e.to_jsonrpc_error()),
                    Err(e) => Err(ConnectorError::SerdeJson(e).to_jsonrpc_error()),
                }
            }
            "prompts/get" => match params.get("name").and_then(|n| n.as_str()) {
                Some(name) => self
                    .server
                    .handle_get_prompt(name)
                    .await
                    .and_then(|r| serde_json::to_value(r).map_err(ConnectorError::SerdeJson))
                    .map_err(|e| e.to_jsonrpc_error()),
                None => Err(
                    ConnectorError::InvalidInput("Missing 'name' parameter".to_string())
                        .to_jsonrpc_error(),
                ),
            },
            _ => Err(ConnectorError::MethodNotFound.to_jsonrpc_error()),
        };

        match result {
            Ok(result) => json!({
                "jsonrpc": "2.0",
                "result": result,
                "id": id,
            }),
            Err(error) => json!({
                "jsonrpc": "2.0",
                "error": error,
                "id": id,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::onedrive::OneDriveConnector;
    use crate::oauth::TokenSource;
    use async_trait::async_trait;

    struct StaticToken;

    #[async_trait]
    impl TokenSource for StaticToken {
        async fn acquire(&self) -> Result<String, ConnectorError> {
            Ok("test-token".to_string())
        }
    }

    fn handler() -> JsonRpcHandler {
        let mut registry = ProviderRegistry::new();
        let connector = OneDriveConnector::new(Arc::new(StaticToken)).unwrap();
        registry.register_provider(Box::new(connector));
        JsonRpcHandler::new(McpServer::new(Arc::new(Mutex::new(registry))))
    }

    #[tokio::test]
    async fn lists_prefixed_and_auth_tools() {
        let response = handler()
            .handle_request(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
            .await;
        let names: Vec<&str> = response["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"onedrive/search_drive_items"));
        assert!(names.contains(&"auth/onedrive/set"));
        assert!(names.contains(&"auth/onedrive/test"));
    }

    #[tokio::test]
    async fn unknown_method_yields_error_envelope() {
        let response = handler()
            .handle_request(json!({"jsonrpc": "2.0", "id": 7, "method": "nonsense"}))
            .await;
        assert_eq!(response["error"]["code"], json!(-32601));
        assert_eq!(response["id"], json!(7));
    }

    #[tokio::test]
    async fn unprefixed_tool_name_is_rejected() {
        let response = handler()
            .handle_request(json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "tools/call",
                "params": {"name": "search_drive_items", "arguments": {"query": "x"}}
            }))
            .await;
        assert_eq!(response["error"]["code"], json!(-32602));
    }

    #[tokio::test]
    async fn empty_query_is_rejected_with_invalid_params() {
        let response = handler()
            .handle_request(json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "tools/call",
                "params": {"name": "onedrive/search_drive_items", "arguments": {"query": ""}}
            }))
            .await;
        assert_eq!(response["error"]["code"], json!(-32602));
        assert!(response["error"]["message"]
            .as_str()
            .unwrap()
            .contains("non-empty"));
    }
}
