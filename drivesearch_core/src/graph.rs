use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use crate::error::ConnectorError;

pub const DEFAULT_GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0";

/// Thin authenticated GET helper for Microsoft Graph.
///
/// Non-2xx statuses are reported through [`GraphResponse::status`] rather
/// than raised; only transport-level failures become errors. The search
/// pipeline decides what a bad status means for each endpoint.
pub struct GraphClient {
    http: reqwest::Client,
    base_url: String,
}

impl GraphClient {
    pub fn new() -> Result<Self, ConnectorError> {
        let http = reqwest::Client::builder()
            .user_agent("drivesearch/0.1.0")
            .build()
            .map_err(|e| ConnectorError::Other(e.to_string()))?;
        Ok(Self {
            http,
            base_url: DEFAULT_GRAPH_BASE.to_string(),
        })
    }

    /// Point the client at a different Graph base URL (tests, sovereign clouds).
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Issue a bearer-authenticated GET against `{base_url}{path_and_query}`.
    pub async fn get(
        &self,
        token: &str,
        path_and_query: &str,
        headers: &[(&str, &str)],
    ) -> Result<GraphResponse, ConnectorError> {
        let url = format!("{}{}", self.base_url, path_and_query);
        let mut request = self.http.get(&url).bearer_auth(token);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        let response = request.send().await.map_err(ConnectorError::HttpRequest)?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Ok(GraphResponse { status, body })
    }
}

pub struct GraphResponse {
    pub status: StatusCode,
    body: String,
}

impl GraphResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Status line suitable for diagnostics, e.g. `"503 Service Unavailable"`.
    pub fn status_text(&self) -> String {
        match self.status.canonical_reason() {
            Some(reason) => format!("{} {}", self.status.as_u16(), reason),
            None => self.status.as_u16().to_string(),
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ConnectorError> {
        serde_json::from_str(&self.body)
            .map_err(|e| ConnectorError::Other(format!("failed to decode Graph response: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_trailing_slash_from_base_url() {
        let client = GraphClient::new().unwrap().with_base_url("http://localhost:9/v1.0/");
        assert_eq!(client.base_url(), "http://localhost:9/v1.0");
    }

    #[tokio::test]
    async fn reports_non_success_status_instead_of_raising() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = GraphClient::new().unwrap().with_base_url(&server.uri());
        let resp = client.get("tok", "/users", &[]).await.unwrap();
        assert!(!resp.is_success());
        assert_eq!(resp.status_text(), "503 Service Unavailable");
    }
}
