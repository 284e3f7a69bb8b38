//! JSON-RPC transports for MCP servers.
//!
//! Three channels share one request/notify surface:
//! - [`StdioTransport`]: line-delimited JSON over a child process's stdio
//! - [`SseTransport`]: a server-sent-event stream plus a POST back-channel
//! - [`StreamableHttpTransport`]: one POST per message, answered with JSON or SSE
//!
//! Network transports map HTTP 401 to the typed [`McpError::Unauthorized`].

pub mod event_stream;
pub mod http;
pub mod pending;
pub mod sse;
pub mod stdio;

use std::sync::atomic::{AtomicU64, Ordering};

use super::errors::McpError;
use super::types::JsonRpcResponse;

pub use http::StreamableHttpTransport;
pub use sse::SseTransport;
pub use stdio::StdioTransport;

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// An open channel to one MCP server.
pub enum Transport {
    Stdio(StdioTransport),
    Sse(SseTransport),
    Http(StreamableHttpTransport),
}

impl Transport {
    /// Send a request and wait for the matching response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        match self {
            Transport::Stdio(t) => t.request(method, params).await,
            Transport::Sse(t) => t.request(method, params).await,
            Transport::Http(t) => t.request(method, params).await,
        }
    }

    /// Send a request and unwrap its `result`.
    pub async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        let response = self.request(method, params).await?;
        extract_result(response)
    }

    /// Send a notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        match self {
            Transport::Stdio(t) => t.notify(method, params).await,
            Transport::Sse(t) => t.notify(method, params).await,
            Transport::Http(t) => t.notify(method, params).await,
        }
    }

    /// Best-effort close. Never fails.
    pub async fn close(&self) {
        match self {
            Transport::Stdio(t) => t.close().await,
            Transport::Sse(t) => t.close(),
            Transport::Http(t) => t.close().await,
        }
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Transport::Stdio(_) => "stdio",
            Transport::Sse(_) => "sse",
            Transport::Http(_) => "streaming-http",
        }
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: super::types::error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

/// Map a non-success HTTP status to a transport error, or to the typed
/// unauthorized error for 401.
pub(crate) async fn check_http_status(
    server: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, McpError> {
    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        let www_authenticate = response
            .headers()
            .get(reqwest::header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        return Err(McpError::Unauthorized {
            server: server.to_string(),
            www_authenticate,
        });
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let mut body = body.trim().to_string();
        if body.len() > 500 {
            let mut cut = 500;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        return Err(McpError::TransportError {
            server: server.to_string(),
            reason: format!("HTTP {status}: {body}"),
        });
    }
    Ok(response)
}

/// Build a `HeaderMap` from configured headers plus an optional bearer token.
pub(crate) fn build_headers(
    server: &str,
    extra: &std::collections::HashMap<String, String>,
    bearer: Option<&str>,
) -> Result<reqwest::header::HeaderMap, McpError> {
    use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};

    let invalid = |reason: String| McpError::InvalidConfig {
        name: server.to_string(),
        reason,
    };

    let mut headers = HeaderMap::new();
    for (key, value) in extra {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| invalid(format!("bad header name '{key}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| invalid(format!("bad header value for '{key}': {e}")))?;
        headers.insert(name, value);
    }
    if let Some(token) = bearer {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| invalid(format!("bad bearer token: {e}")))?;
        headers.insert(AUTHORIZATION, value);
    }
    Ok(headers)
}

fn transport_error(server: &str, reason: impl Into<String>) -> McpError {
    McpError::TransportError {
        server: server.to_string(),
        reason: reason.into(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_request_id_is_monotonic() {
        let id1 = next_request_id();
        let id2 = next_request_id();
        assert!(id2 > id1);
    }

    #[test]
    fn test_extract_result_success() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 1,
            method: None,
            result: Some(serde_json::json!({"text": "hello"})),
            error: None,
        };
        let result = extract_result(resp).unwrap();
        assert_eq!(result["text"], "hello");
    }

    #[test]
    fn test_extract_result_error() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 1,
            method: None,
            result: None,
            error: Some(super::super::types::JsonRpcError {
                code: -32601,
                message: "Method not found".into(),
                data: None,
            }),
        };
        let err = extract_result(resp).unwrap_err();
        match err {
            McpError::ServerError { code, message, .. } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            _ => panic!("expected ServerError"),
        }
    }

    #[test]
    fn test_extract_result_missing_both() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 1,
            method: None,
            result: None,
            error: None,
        };
        let err = extract_result(resp).unwrap_err();
        assert!(matches!(err, McpError::ServerError { .. }));
    }

    #[test]
    fn test_build_headers_adds_bearer() {
        let mut extra = std::collections::HashMap::new();
        extra.insert("X-Api-Version".to_string(), "3".to_string());
        let headers = build_headers("remote", &extra, Some("tok")).unwrap();
        assert_eq!(headers["authorization"], "Bearer tok");
        assert_eq!(headers["x-api-version"], "3");
    }

    #[test]
    fn test_build_headers_rejects_bad_name() {
        let mut extra = std::collections::HashMap::new();
        extra.insert("bad header".to_string(), "x".to_string());
        let err = build_headers("remote", &extra, None).unwrap_err();
        assert!(matches!(err, McpError::InvalidConfig { .. }));
    }
}
