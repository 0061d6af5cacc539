//! Graph Client
//!
//! Main client for the remote API, combining the base URL, the bearer
//! token and the HTTP wrapper. Paths handed to it are relative to the API
//! root; absolute URLs (such as `@odata.nextLink`) are used as-is.

use super::http::GraphHttpClient;
use crate::error::{EngineError, Result};
use crate::resource::HttpMethod;
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use url::Url;

/// Main API client
#[derive(Clone)]
pub struct GraphClient {
    pub http: GraphHttpClient,
    base_url: Arc<str>,
    token: Arc<str>,
}

impl GraphClient {
    /// Create a new client for `base_url`
    pub fn new(base_url: &str, token: &str, http: GraphHttpClient) -> Result<Self> {
        let parsed = Url::parse(base_url)
            .map_err(|e| EngineError::validation("base_url", e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(EngineError::validation(
                "base_url",
                format!("unsupported scheme '{}'", parsed.scheme()),
            ));
        }

        Ok(Self {
            http,
            base_url: Arc::from(base_url.trim_end_matches('/')),
            token: Arc::from(token),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build a full URL for an API path
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Issue a request with any method
    pub async fn send(&self, method: HttpMethod, path: &str, body: Option<&Value>) -> Result<Value> {
        self.http
            .request(Method::from(method), &self.url(path), &self.token, body)
            .await
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        self.send(HttpMethod::Get, path, None).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        self.send(HttpMethod::Post, path, Some(body)).await
    }

    pub async fn patch(&self, path: &str, body: &Value) -> Result<Value> {
        self.send(HttpMethod::Patch, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value> {
        self.send(HttpMethod::Delete, path, None).await
    }

    /// GET a binary sub-resource
    pub async fn get_bytes(&self, path: &str) -> Result<Vec<u8>> {
        self.http.get_bytes(&self.url(path), &self.token).await
    }
}

/// Join an entity URI and a relative suffix
pub fn join_uri(base: &str, suffix: &str) -> String {
    let suffix = suffix.trim_matches('/');
    if suffix.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn client(base: &str) -> Result<GraphClient> {
        let http = GraphHttpClient::new(Duration::from_secs(5), "graphrecon-test")?;
        GraphClient::new(base, "t", http)
    }

    #[test]
    fn test_url_building() {
        let client = client("https://graph.example.com/beta/").unwrap();
        assert_eq!(
            client.url("/deviceManagement/scripts"),
            "https://graph.example.com/beta/deviceManagement/scripts"
        );
        assert_eq!(
            client.url("https://graph.example.com/beta/next?$skiptoken=1"),
            "https://graph.example.com/beta/next?$skiptoken=1"
        );
    }

    #[test]
    fn test_rejects_bad_base_url() {
        assert!(client("not a url").is_err());
        assert!(client("ftp://example.com").is_err());
    }

    #[test]
    fn test_join_uri() {
        assert_eq!(join_uri("/a/1", "assign"), "/a/1/assign");
        assert_eq!(join_uri("/a/1/", "/members/"), "/a/1/members");
        assert_eq!(join_uri("/a/1", ""), "/a/1");
    }
}
