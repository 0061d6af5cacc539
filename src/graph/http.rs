//! HTTP utilities for OData REST API calls

use crate::error::{EngineError, Result};
use crate::resource::HttpMethod;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;

/// Maximum length of response body to log (to avoid logging sensitive data)
const MAX_LOG_BODY_LENGTH: usize = 200;

/// Sanitize response body for logging
/// Truncates long responses and strips control characters
pub fn sanitize_for_log(body: &str) -> String {
    let truncated = match body.char_indices().nth(MAX_LOG_BODY_LENGTH) {
        Some((cut, _)) => format!("{}... [truncated, {} bytes total]", &body[..cut], body.len()),
        None => body.to_string(),
    };

    truncated.replace(|c: char| !c.is_ascii_graphic() && c != ' ', "")
}

/// Pull `error.message` (or `error.code`) out of an OData error body
fn odata_error_message(body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let error = parsed.as_ref().and_then(|v| v.get("error"));
    let message = error
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .or_else(|| error.and_then(|e| e.get("code")).and_then(Value::as_str));
    match message {
        Some(m) => m.to_string(),
        None => sanitize_for_log(body),
    }
}

impl From<HttpMethod> for Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Patch => Method::PATCH,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Delete => Method::DELETE,
        }
    }
}

/// HTTP client wrapper for API calls
#[derive(Clone)]
pub struct GraphHttpClient {
    client: Client,
}

impl GraphHttpClient {
    /// Create a new HTTP client with a per-call timeout
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;

        Ok(Self { client })
    }

    async fn execute(
        &self,
        method: Method,
        url: &str,
        token: &str,
        body: Option<&Value>,
    ) -> Result<(StatusCode, Vec<u8>)> {
        tracing::debug!("{} {}", method, url);

        let mut request = self.client.request(method.clone(), url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?.to_vec();

        if status == StatusCode::NOT_FOUND {
            tracing::debug!("{} {} returned 404", method, url);
            return Err(EngineError::NotFound {
                uri: url.to_string(),
            });
        }
        if !status.is_success() {
            let text = String::from_utf8_lossy(&bytes);
            // Only log sanitized/truncated error body to avoid leaking sensitive data
            tracing::error!("API error: {} - {}", status, sanitize_for_log(&text));
            return Err(EngineError::Remote {
                status: status.as_u16(),
                method: method.to_string(),
                uri: url.to_string(),
                message: odata_error_message(&text),
            });
        }

        Ok((status, bytes))
    }

    /// Issue a JSON request; an empty response body yields `Value::Null`
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        token: &str,
        body: Option<&Value>,
    ) -> Result<Value> {
        let (_, bytes) = self.execute(method, url, token, body).await?;

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }

        Ok(serde_json::from_slice(&bytes)?)
    }

    /// GET raw bytes (binary sub-resources)
    pub async fn get_bytes(&self, url: &str, token: &str) -> Result<Vec<u8>> {
        let (_, bytes) = self.execute(Method::GET, url, token, None).await?;
        Ok(bytes)
    }
}

/// Format an engine error for display
/// Remote failures are mapped to short user-facing messages by status
pub fn describe_error(error: &EngineError) -> String {
    if error.is_validation() {
        return error.to_string();
    }

    let hint = match error.status() {
        Some(401) => "Authentication failed. Check the bearer token.",
        Some(403) => "Permission denied. Check the token's granted scopes.",
        Some(404) => "Resource not found.",
        Some(409) => "Resource conflict. The resource may already exist or be in use.",
        Some(429) => "Rate limit exceeded. Please try again later.",
        Some(400) => "Invalid request. The API rejected the payload.",
        Some(500) | Some(502) | Some(503) => "Service temporarily unavailable. Please try again.",
        _ => "",
    };

    let detail = error
        .to_string()
        .chars()
        .filter(|c| !c.is_control())
        .take(160)
        .collect::<String>();

    if hint.is_empty() {
        detail
    } else {
        format!("{} ({})", hint, detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_truncates_long_bodies() {
        let body = "x".repeat(500);
        let out = sanitize_for_log(&body);
        assert!(out.starts_with(&"x".repeat(200)));
        assert!(out.contains("truncated, 500 bytes total"));
    }

    #[test]
    fn test_sanitize_strips_control_chars() {
        assert_eq!(sanitize_for_log("a\nb\tc d"), "abc d");
    }

    #[test]
    fn test_odata_error_message() {
        let body = r#"{"error":{"code":"BadRequest","message":"Invalid priority"}}"#;
        assert_eq!(odata_error_message(body), "Invalid priority");
        let body = r#"{"error":{"code":"Conflict","message":""}}"#;
        assert_eq!(odata_error_message(body), "Conflict");
        assert_eq!(odata_error_message("oops"), "oops");
    }

    #[test]
    fn test_describe_error() {
        let err = EngineError::Remote {
            status: 403,
            method: "PATCH".into(),
            uri: "/x".into(),
            message: "denied".into(),
        };
        assert!(describe_error(&err).starts_with("Permission denied."));

        let err = EngineError::validation("settings.platform", "bad");
        assert_eq!(describe_error(&err), "settings.platform: bad");
    }
}
