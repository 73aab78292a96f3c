use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::ConnectorError;

pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";

const GRAPH_DEFAULT_SCOPE: &str = "https://graph.microsoft.com/.default";

// Tokens are considered expired this many seconds before the lifetime the
// token endpoint reported, so a token never dies mid-request.
const EXPIRY_MARGIN_SECS: i64 = 120;

/// Supplies a bearer token for Microsoft Graph on demand.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn acquire(&self) -> Result<String, ConnectorError>;
}

struct CachedToken {
    value: String,
    expires_at: i64,
}

/// OAuth2 client-credentials token provider for Azure Entra ID.
///
/// Posts to `{authority}/{tenant}/oauth2/v2.0/token` with the `.default`
/// Graph scope and caches the resulting token until shortly before expiry.
/// The cache is the only state shared across search invocations.
pub struct ClientCredentialsTokenProvider {
    http: reqwest::Client,
    authority: String,
    tenant_id: String,
    client_id: String,
    client_secret: String,
    cached: Mutex<Option<CachedToken>>,
}

impl ClientCredentialsTokenProvider {
    pub fn new(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            authority: DEFAULT_AUTHORITY.to_string(),
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            cached: Mutex::new(None),
        }
    }

    /// Override the login authority, e.g. for sovereign clouds or tests.
    pub fn with_authority(mut self, authority: &str) -> Self {
        self.authority = authority.trim_end_matches('/').to_string();
        self
    }

    fn token_url(&self) -> String {
        let tenant = if self.tenant_id.is_empty() {
            "common"
        } else {
            &self.tenant_id
        };
        format!("{}/{}/oauth2/v2.0/token", self.authority, tenant)
    }

    async fn request_token(&self) -> Result<CachedToken, ConnectorError> {
        let body = [
            ("grant_type", "client_credentials".to_string()),
            ("client_id", self.client_id.clone()),
            ("client_secret", self.client_secret.clone()),
            ("scope", GRAPH_DEFAULT_SCOPE.to_string()),
        ];
        let resp = self
            .http
            .post(self.token_url())
            .form(&body)
            .send()
            .await
            .map_err(ConnectorError::HttpRequest)?;
        let status = resp.status();
        let v = resp
            .json::<serde_json::Value>()
            .await
            .map_err(|e| ConnectorError::Authentication(format!("token response unreadable: {}", e)))?;
        if !status.is_success() {
            return Err(ConnectorError::Authentication(format!(
                "token request failed ({}): {}",
                status, v
            )));
        }
        let access_token = v["access_token"].as_str().unwrap_or_default().to_string();
        if access_token.is_empty() {
            return Err(ConnectorError::Authentication(
                "token response carried no usable access token".to_string(),
            ));
        }
        let expires_in = v.get("expires_in").and_then(|i| i.as_i64()).unwrap_or(3600);
        Ok(CachedToken {
            value: access_token,
            expires_at: now_epoch() + expires_in - EXPIRY_MARGIN_SECS,
        })
    }
}

#[async_trait]
impl TokenSource for ClientCredentialsTokenProvider {
    async fn acquire(&self) -> Result<String, ConnectorError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > now_epoch() {
                return Ok(token.value.clone());
            }
        }
        let fresh = self.request_token().await?;
        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(value)
    }
}

fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider_for(server: &MockServer) -> ClientCredentialsTokenProvider {
        ClientCredentialsTokenProvider::new("tenant-1", "client-1", "secret-1")
            .with_authority(&server.uri())
    }

    #[tokio::test]
    async fn acquires_and_caches_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tenant-1/oauth2/v2.0/token"))
            .and(body_string_contains("grant_type=client_credentials"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "tok-1",
                "expires_in": 3600,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        assert_eq!(provider.acquire().await.unwrap(), "tok-1");
        // Second acquire must come from the cache; the mock allows one hit.
        assert_eq!(provider.acquire().await.unwrap(), "tok-1");
    }

    #[tokio::test]
    async fn non_success_status_is_authentication_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": "invalid_client"
            })))
            .mount(&server)
            .await;

        let err = provider_for(&server).acquire().await.unwrap_err();
        assert!(matches!(err, ConnectorError::Authentication(_)));
        assert!(err.to_string().contains("invalid_client"));
    }

    #[tokio::test]
    async fn empty_access_token_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;

        let err = provider_for(&server).acquire().await.unwrap_err();
        assert!(matches!(err, ConnectorError::Authentication(_)));
    }
}
