//! Streamable HTTP transport.
//!
//! Every JSON-RPC message is a `POST` to the server endpoint. The server
//! answers with either a single JSON body or an SSE stream that carries the
//! response. The `Mcp-Session-Id` header issued at `initialize` is echoed on
//! every later request.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use futures::StreamExt;

use super::super::errors::McpError;
use super::super::types::{notification, JsonRpcRequest, JsonRpcResponse};
use super::event_stream::sse_events;
use super::{build_headers, check_http_status, next_request_id, transport_error};

const SESSION_HEADER: &str = "mcp-session-id";

/// Timeout for the best-effort session `DELETE` on close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// JSON-RPC transport over the MCP streamable HTTP binding.
pub struct StreamableHttpTransport {
    server_name: String,
    client: reqwest::Client,
    url: url::Url,
    headers: reqwest::header::HeaderMap,
    session_id: Mutex<Option<String>>,
}

impl StreamableHttpTransport {
    pub fn new(
        server_name: &str,
        url: &str,
        extra_headers: &HashMap<String, String>,
        bearer: Option<&str>,
    ) -> Result<Self, McpError> {
        let url = url::Url::parse(url).map_err(|e| McpError::InvalidConfig {
            name: server_name.to_string(),
            reason: format!("unparseable url '{url}': {e}"),
        })?;
        Ok(Self {
            server_name: server_name.to_string(),
            client: reqwest::Client::new(),
            url,
            headers: build_headers(server_name, extra_headers, bearer)?,
            session_id: Mutex::new(None),
        })
    }

    /// Post a request and read the matching response from the reply body.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = next_request_id();
        let req = JsonRpcRequest::new(id, method, params);
        let body = serde_json::to_value(&req).map_err(|e| {
            transport_error(&self.server_name, format!("failed to serialize request: {e}"))
        })?;

        let response = self.post(&body).await?;

        let is_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("text/event-stream"))
            .unwrap_or(false);

        if is_stream {
            let mut events = Box::pin(sse_events(
                response.bytes_stream(),
                self.server_name.clone(),
            ));
            while let Some(event) = events.next().await {
                let event = event?;
                if !event.is_message() {
                    continue;
                }
                if let Some(resp) = JsonRpcResponse::parse(&event.data) {
                    if resp.id == id {
                        return Ok(resp);
                    }
                }
            }
            return Err(transport_error(
                &self.server_name,
                "response stream ended without a reply",
            ));
        }

        let text = response.text().await.map_err(|e| {
            transport_error(&self.server_name, format!("failed to read response body: {e}"))
        })?;
        // Batched replies are arrays; pick ours.
        if let Ok(batch) = serde_json::from_str::<Vec<serde_json::Value>>(&text) {
            for item in batch {
                if let Some(resp) = JsonRpcResponse::parse(&item.to_string()) {
                    if resp.id == id {
                        return Ok(resp);
                    }
                }
            }
        } else if let Some(resp) = JsonRpcResponse::parse(&text) {
            if resp.id == id {
                return Ok(resp);
            }
        }

        Err(transport_error(
            &self.server_name,
            format!("no response for request {id} in reply body"),
        ))
    }

    /// Post a notification. Servers answer `202 Accepted` with no body.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        self.post(&notification(method, params)).await?;
        Ok(())
    }

    /// End the server-side session, if one was issued. Best effort.
    pub async fn close(&self) {
        let session = self.current_session();
        let Some(session) = session else {
            return;
        };
        let request = self
            .client
            .delete(self.url.clone())
            .headers(self.headers.clone())
            .header(SESSION_HEADER, session)
            .timeout(CLOSE_TIMEOUT)
            .send();
        if let Err(e) = request.await {
            tracing::debug!(server = %self.server_name, error = %e, "session DELETE failed");
        }
    }

    fn current_session(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response, McpError> {
        let mut builder = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .header(
                reqwest::header::ACCEPT,
                "application/json, text/event-stream",
            )
            .json(body);
        if let Some(session) = self.current_session() {
            builder = builder.header(SESSION_HEADER, session);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| transport_error(&self.server_name, format!("POST failed: {e}")))?;
        let response = check_http_status(&self.server_name, response).await?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self
                .session_id
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(session.to_string());
        }

        Ok(response)
    }
}
