use crate::auth::AuthDetails;
use crate::capabilities::{ConnectorConfigSchema, Field, FieldType};
use crate::error::ConnectorError;
use crate::graph::GraphClient;
use crate::oauth::{ClientCredentialsTokenProvider, TokenSource};
use crate::utils::structured_result;
use crate::Connector;
use async_trait::async_trait;
use rmcp::model::*;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::borrow::Cow;
use std::sync::Arc;

// Upper bound for the fallback root listing; Graph caps $top at 999.
const FALLBACK_PAGE_SIZE: u32 = 999;

const SENTINEL_TEXT: &str = "No files found.";
const SENTINEL_MIME: &str = "text/plain";

// Items without a file facet are folders or packages; their webUrl opens a
// browser page.
const DEFAULT_ITEM_MIME: &str = "text/html";

// --- Raw Graph records, defensively optional ---
//
// The search and children endpoints return overlapping but not identical
// item shapes, so every field may be absent.

#[derive(Debug, Deserialize)]
struct DirectoryUserList {
    #[serde(default)]
    value: Vec<DirectoryUser>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DirectoryUser {
    id: String,
    display_name: Option<String>,
    user_principal_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DriveItemList {
    #[serde(default)]
    value: Vec<DriveItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveItem {
    name: Option<String>,
    web_url: Option<String>,
    id: Option<String>,
    size: Option<i64>,
    file: Option<FileFacet>,
    created_by: Option<IdentitySet>,
    last_modified_by: Option<IdentitySet>,
    last_modified_date_time: Option<String>,
    shared: Option<SharedFacet>,
    #[serde(rename = "@microsoft.graph.downloadUrl")]
    download_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileFacet {
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdentitySet {
    user: Option<Identity>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Identity {
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SharedFacet {
    scope: Option<String>,
}

// --- Uniform result shape ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResultEntry {
    pub kind: &'static str,
    pub text: String,
    pub uri: String,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResultMetadata>,
}

impl SearchResultEntry {
    /// True for the placeholder entry that stands in for an empty result set.
    pub fn is_sentinel(&self) -> bool {
        self.metadata.is_none() && self.mime_type == SENTINEL_MIME
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    pub created_by: String,
    pub last_modified_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    pub shared: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchOutcome {
    pub results: Vec<SearchResultEntry>,
    pub used_fallback: bool,
    pub result_count: usize,
    pub query: String,
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
struct SearchDriveItemsArgs {
    query: String,
    #[serde(default)]
    user: Option<String>,
}

/// OneDrive file search over Microsoft Graph, with a listing fallback for
/// tenants where the drive search endpoint is unavailable.
pub struct OneDriveConnector {
    graph: GraphClient,
    tokens: Arc<dyn TokenSource>,
    auth: AuthDetails,
}

impl OneDriveConnector {
    pub fn new(tokens: Arc<dyn TokenSource>) -> Result<Self, ConnectorError> {
        Ok(Self {
            graph: GraphClient::new()?,
            tokens,
            auth: AuthDetails::new(),
        })
    }

    /// Point the connector at a different Graph base URL (tests, sovereign clouds).
    pub fn with_graph_base(mut self, base_url: &str) -> Self {
        self.graph = self.graph.with_base_url(base_url);
        self
    }

    fn drive_root_url(&self, user_id: &str) -> String {
        format!("{}/users/{}/drive/root", self.graph.base_url(), user_id)
    }

    fn search_path(user_id: &str, query: &str) -> String {
        format!(
            "/users/{}/drive/root/search(q='{}')",
            user_id,
            urlencoding::encode(query)
        )
    }

    /// Run the whole pipeline for one request: resolve the target user,
    /// search their drive (falling back to a filtered root listing when the
    /// search endpoint is unavailable) and normalize the results.
    pub async fn search(
        &self,
        query: &str,
        user: Option<&str>,
    ) -> Result<SearchOutcome, ConnectorError> {
        if query.trim().is_empty() {
            return Err(ConnectorError::InvalidParams(
                "query must be a non-empty string".to_string(),
            ));
        }
        if let Some(u) = user {
            if u.trim().is_empty() {
                return Err(ConnectorError::InvalidParams(
                    "user, when given, must be a non-empty string".to_string(),
                ));
            }
        }

        let token = self.tokens.acquire().await?;
        let user_id = self.resolve_user(&token, user).await?;
        let (items, used_fallback) = self.search_drive(&token, &user_id, query).await;
        let results = normalize_items(items, &self.drive_root_url(&user_id));

        Ok(SearchOutcome {
            result_count: results.len(),
            results,
            used_fallback,
            query: query.to_string(),
            user_id,
        })
    }

    /// Target the caller-supplied user verbatim, or default to the first
    /// user the directory lists.
    async fn resolve_user(
        &self,
        token: &str,
        requested: Option<&str>,
    ) -> Result<String, ConnectorError> {
        if let Some(user) = requested {
            return Ok(user.to_string());
        }

        let resp = self
            .graph
            .get(
                token,
                "/users?$top=1&$select=id,displayName,userPrincipalName",
                &[],
            )
            .await?;
        if !resp.is_success() {
            return Err(ConnectorError::DirectoryQuery(resp.status_text()));
        }
        let listing: DirectoryUserList = resp.json()?;
        let first = listing
            .value
            .into_iter()
            .next()
            .ok_or(ConnectorError::NoUsersFound)?;
        tracing::info!(
            display_name = first.display_name.as_deref().unwrap_or("?"),
            principal = first.user_principal_name.as_deref().unwrap_or("?"),
            "no user requested, defaulting to first directory user"
        );
        Ok(first.id)
    }

    /// Primary drive search, with a client-side filtered root listing as the
    /// fallback. The fallback fires only when the search call itself fails;
    /// an empty successful search is a legitimate "no matches".
    async fn search_drive(
        &self,
        token: &str,
        user_id: &str,
        query: &str,
    ) -> (Vec<DriveItem>, bool) {
        let path = Self::search_path(user_id, query);
        match self
            .graph
            .get(token, &path, &[("ConsistencyLevel", "eventual")])
            .await
        {
            Ok(resp) if resp.is_success() => match resp.json::<DriveItemList>() {
                Ok(listing) => return (listing.value, false),
                Err(err) => {
                    tracing::warn!(user = user_id, error = %err, "undecodable drive search response");
                }
            },
            Ok(resp) => {
                tracing::warn!(
                    user = user_id,
                    status = %resp.status,
                    "drive search unavailable, listing root children instead"
                );
            }
            Err(err) => {
                tracing::warn!(user = user_id, error = %err, "drive search request failed");
            }
        }

        (self.list_root_filtered(token, user_id, query).await, true)
    }

    /// Bounded listing of the drive root, filtered by name. Degrades to an
    /// empty set on any failure; the caller renders the sentinel instead.
    async fn list_root_filtered(&self, token: &str, user_id: &str, query: &str) -> Vec<DriveItem> {
        let path = format!(
            "/users/{}/drive/root/children?$top={}",
            user_id, FALLBACK_PAGE_SIZE
        );
        let listing = match self.graph.get(token, &path, &[]).await {
            Ok(resp) if resp.is_success() => match resp.json::<DriveItemList>() {
                Ok(listing) => listing,
                Err(err) => {
                    tracing::warn!(user = user_id, error = %err, "undecodable root listing");
                    return Vec::new();
                }
            },
            Ok(resp) => {
                tracing::warn!(
                    user = user_id,
                    status = %resp.status,
                    "root listing failed, degrading to empty result set"
                );
                return Vec::new();
            }
            Err(err) => {
                tracing::warn!(user = user_id, error = %err, "root listing request failed");
                return Vec::new();
            }
        };
        filter_items_by_name(listing.value, query)
    }
}

fn filter_items_by_name(items: Vec<DriveItem>, query: &str) -> Vec<DriveItem> {
    let needle = query.to_lowercase();
    items
        .into_iter()
        .filter(|item| {
            item.name
                .as_deref()
                .map(|name| name.to_lowercase().contains(&needle))
                .unwrap_or(false)
        })
        .collect()
}

/// Map raw drive items onto the uniform result shape, preserving order.
/// An empty input produces exactly one sentinel entry so consumers always
/// have something to render.
fn normalize_items(items: Vec<DriveItem>, drive_root_url: &str) -> Vec<SearchResultEntry> {
    if items.is_empty() {
        return vec![SearchResultEntry {
            kind: "resource",
            text: SENTINEL_TEXT.to_string(),
            uri: drive_root_url.to_string(),
            mime_type: SENTINEL_MIME.to_string(),
            metadata: None,
        }];
    }
    items.into_iter().map(normalize_item).collect()
}

fn normalize_item(item: DriveItem) -> SearchResultEntry {
    let mime_type = item
        .file
        .as_ref()
        .and_then(|f| f.mime_type.clone())
        .unwrap_or_else(|| DEFAULT_ITEM_MIME.to_string());
    SearchResultEntry {
        kind: "resource",
        text: item.name.unwrap_or_default(),
        uri: item.web_url.unwrap_or_default(),
        mime_type,
        metadata: Some(ResultMetadata {
            id: item.id,
            size: item.size,
            created_by: display_name_or_unknown(item.created_by),
            last_modified_by: display_name_or_unknown(item.last_modified_by),
            last_modified: item.last_modified_date_time,
            shared: item
                .shared
                .and_then(|s| s.scope)
                .unwrap_or_else(|| "private".to_string()),
            download_url: item.download_url,
        }),
    }
}

fn display_name_or_unknown(identity: Option<IdentitySet>) -> String {
    identity
        .and_then(|set| set.user)
        .and_then(|user| user.display_name)
        .unwrap_or_else(|| "Unknown".to_string())
}

#[async_trait]
impl Connector for OneDriveConnector {
    fn name(&self) -> &'static str {
        "onedrive"
    }

    fn description(&self) -> &'static str {
        "Microsoft 365 OneDrive file search via Microsoft Graph (application credentials)."
    }

    async fn capabilities(&self) -> ServerCapabilities {
        ServerCapabilities {
            tools: Some(Default::default()),
            ..Default::default()
        }
    }

    async fn initialize(
        &self,
        _request: InitializeRequestParam,
    ) -> Result<InitializeResult, ConnectorError> {
        Ok(InitializeResult {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: self.capabilities().await,
            server_info: Implementation {
                name: self.name().to_string(),
                title: None,
                version: "0.1.0".to_string(),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Use `search_drive_items` to find files in a tenant's OneDrive. Omit `user` to search the first directory user's drive."
                    .to_string(),
            ),
        })
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParam>,
    ) -> Result<ListResourcesResult, ConnectorError> {
        Ok(ListResourcesResult {
            resources: vec![],
            next_cursor: None,
        })
    }

    async fn read_resource(
        &self,
        _request: ReadResourceRequestParam,
    ) -> Result<Vec<ResourceContents>, ConnectorError> {
        Err(ConnectorError::ResourceNotFound)
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
    ) -> Result<ListToolsResult, ConnectorError> {
        let tools = vec![Tool {
            name: Cow::Borrowed("search_drive_items"),
            title: None,
            description: Some(Cow::Borrowed(
                "Search for files in a Microsoft 365 tenant's OneDrive. Falls back to a filtered root listing when the drive search endpoint is unavailable.",
            )),
            input_schema: Arc::new(
                json!({
                    "type": "object",
                    "properties": {
                        "query": {
                            "type": "string",
                            "description": "The search term (e.g. 'report.xlsx')."
                        },
                        "user": {
                            "type": "string",
                            "description": "UPN or directory ID of the drive owner. Defaults to the first user in the directory."
                        }
                    },
                    "required": ["query"]
                })
                .as_object()
                .expect("Schema object")
                .clone(),
            ),
            output_schema: None,
            annotations: None,
            icons: None,
        }];

        Ok(ListToolsResult {
            tools,
            next_cursor: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
    ) -> Result<CallToolResult, ConnectorError> {
        let args = request.arguments.unwrap_or_default();
        match request.name.as_ref() {
            "search_drive_items" => {
                let args: SearchDriveItemsArgs =
                    serde_json::from_value(json!(args)).map_err(|e| {
                        ConnectorError::InvalidParams(format!("Invalid arguments: {}", e))
                    })?;
                let outcome = self.search(&args.query, args.user.as_deref()).await?;
                structured_result(&outcome)
            }
            _ => Err(ConnectorError::ToolNotFound),
        }
    }

    async fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParam>,
    ) -> Result<ListPromptsResult, ConnectorError> {
        Ok(ListPromptsResult {
            prompts: vec![],
            next_cursor: None,
        })
    }

    async fn get_prompt(&self, _name: &str) -> Result<Prompt, ConnectorError> {
        Err(ConnectorError::InvalidParams(
            "Prompt not found".to_string(),
        ))
    }

    async fn get_auth_details(&self) -> Result<AuthDetails, ConnectorError> {
        Ok(self.auth.clone())
    }

    async fn set_auth_details(&mut self, details: AuthDetails) -> Result<(), ConnectorError> {
        let client_id = details.get("client_id").cloned().ok_or_else(|| {
            ConnectorError::InvalidParams("client_id is required".to_string())
        })?;
        let client_secret = details.get("client_secret").cloned().ok_or_else(|| {
            ConnectorError::InvalidParams("client_secret is required".to_string())
        })?;
        let tenant_id = details.get("tenant_id").cloned().unwrap_or_default();
        self.tokens = Arc::new(ClientCredentialsTokenProvider::new(
            tenant_id,
            client_id,
            client_secret,
        ));
        self.auth = details;
        Ok(())
    }

    async fn test_auth(&self) -> Result<(), ConnectorError> {
        self.tokens.acquire().await.map(|_| ())
    }

    fn config_schema(&self) -> ConnectorConfigSchema {
        ConnectorConfigSchema {
            fields: vec![
                Field {
                    name: "tenant_id".to_string(),
                    label: "Tenant ID".to_string(),
                    field_type: FieldType::Text,
                    required: false,
                    description: Some("Azure Entra tenant ID (optional for common).".to_string()),
                },
                Field {
                    name: "client_id".to_string(),
                    label: "Client ID".to_string(),
                    field_type: FieldType::Text,
                    required: true,
                    description: Some("App registration client ID.".to_string()),
                },
                Field {
                    name: "client_secret".to_string(),
                    label: "Client Secret".to_string(),
                    field_type: FieldType::Secret,
                    required: true,
                    description: Some("Client secret for the client credentials flow.".to_string()),
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(value: serde_json::Value) -> DriveItem {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn search_path_percent_encodes_query() {
        let path = OneDriveConnector::search_path("u1", "q4 report");
        assert_eq!(path, "/users/u1/drive/root/search(q='q4%20report')");
    }

    #[test]
    fn normalization_defaults_missing_fields() {
        let raw = item(json!({
            "name": "report.xlsx",
            "webUrl": "https://x",
            "file": {"mimeType": "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"}
        }));
        let entry = normalize_item(raw);
        assert_eq!(entry.text, "report.xlsx");
        assert_eq!(entry.uri, "https://x");
        assert!(entry.mime_type.starts_with("application/vnd."));
        let meta = entry.metadata.unwrap();
        assert_eq!(meta.created_by, "Unknown");
        assert_eq!(meta.last_modified_by, "Unknown");
        assert_eq!(meta.shared, "private");
        assert!(meta.id.is_none());
        assert!(meta.download_url.is_none());
    }

    #[test]
    fn normalization_keeps_present_metadata() {
        let raw = item(json!({
            "name": "deck.pptx",
            "webUrl": "https://y",
            "id": "item-1",
            "size": 1024,
            "file": {"mimeType": "application/vnd.ms-powerpoint"},
            "createdBy": {"user": {"displayName": "Ada"}},
            "lastModifiedBy": {"user": {"displayName": "Grace"}},
            "lastModifiedDateTime": "2024-05-01T12:00:00Z",
            "shared": {"scope": "organization"},
            "@microsoft.graph.downloadUrl": "https://dl"
        }));
        let meta = normalize_item(raw).metadata.unwrap();
        assert_eq!(meta.id.as_deref(), Some("item-1"));
        assert_eq!(meta.size, Some(1024));
        assert_eq!(meta.created_by, "Ada");
        assert_eq!(meta.last_modified_by, "Grace");
        assert_eq!(meta.shared, "organization");
        assert_eq!(meta.download_url.as_deref(), Some("https://dl"));
    }

    #[test]
    fn item_without_file_facet_defaults_to_html() {
        let entry = normalize_item(item(json!({"name": "Documents", "webUrl": "https://z"})));
        assert_eq!(entry.mime_type, "text/html");
        assert!(!entry.is_sentinel());
    }

    #[test]
    fn empty_input_normalizes_to_sentinel() {
        let results = normalize_items(Vec::new(), "https://graph.test/v1.0/users/u1/drive/root");
        assert_eq!(results.len(), 1);
        let sentinel = &results[0];
        assert!(sentinel.is_sentinel());
        assert_eq!(sentinel.text, "No files found.");
        assert_eq!(sentinel.mime_type, "text/plain");
        assert_eq!(sentinel.uri, "https://graph.test/v1.0/users/u1/drive/root");
    }

    #[test]
    fn fallback_filter_is_case_insensitive_substring() {
        let items = vec![
            item(json!({"name": "Budget-Final.XLSX"})),
            item(json!({"name": "notes.txt"})),
            item(json!({"webUrl": "https://nameless"})),
        ];
        let kept = filter_items_by_name(items, "budget");
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name.as_deref(), Some("Budget-Final.XLSX"));
    }

    #[test]
    fn outcome_serializes_camel_case() {
        let outcome = SearchOutcome {
            results: normalize_items(Vec::new(), "https://root"),
            used_fallback: true,
            result_count: 1,
            query: "x".to_string(),
            user_id: "u1".to_string(),
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["usedFallback"], json!(true));
        assert_eq!(value["resultCount"], json!(1));
        assert_eq!(value["userId"], json!("u1"));
        assert_eq!(value["results"][0]["mimeType"], json!("text/plain"));
        // The sentinel carries no metadata block.
        assert!(value["results"][0].get("metadata").is_none());
    }
}
