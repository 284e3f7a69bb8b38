//! HTTP+SSE transport.
//!
//! The client holds a long-lived `GET` event stream. The server first sends
//! an `endpoint` event naming the URL to `POST` messages to; responses then
//! arrive as `message` events on the stream and are routed by request id.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::super::errors::McpError;
use super::super::types::{notification, JsonRpcRequest, JsonRpcResponse};
use super::event_stream::sse_events;
use super::pending::PendingRequests;
use super::{build_headers, check_http_status, next_request_id, transport_error};

/// JSON-RPC transport over a server-sent-event stream.
pub struct SseTransport {
    server_name: String,
    client: reqwest::Client,
    headers: reqwest::header::HeaderMap,
    /// URL announced by the server's `endpoint` event.
    post_url: url::Url,
    pending: Arc<PendingRequests>,
    reader: JoinHandle<()>,
}

impl SseTransport {
    /// Open the event stream and wait for the `endpoint` event.
    ///
    /// The caller bounds this with the handshake timeout.
    pub async fn connect(
        server_name: &str,
        url: &str,
        extra_headers: &HashMap<String, String>,
        bearer: Option<&str>,
    ) -> Result<Self, McpError> {
        let base = url::Url::parse(url).map_err(|e| McpError::InvalidConfig {
            name: server_name.to_string(),
            reason: format!("unparseable url '{url}': {e}"),
        })?;
        let headers = build_headers(server_name, extra_headers, bearer)?;
        let client = reqwest::Client::new();

        let response = client
            .get(base.clone())
            .headers(headers.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| transport_error(server_name, format!("failed to open event stream: {e}")))?;
        let response = check_http_status(server_name, response).await?;

        let pending = PendingRequests::new();
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();
        let reader = tokio::spawn(read_events(
            server_name.to_string(),
            response,
            Arc::clone(&pending),
            endpoint_tx,
        ));

        let endpoint = match endpoint_rx.await {
            Ok(endpoint) => endpoint,
            Err(_) => {
                reader.abort();
                return Err(transport_error(
                    server_name,
                    "event stream closed before the endpoint event",
                ));
            }
        };

        let post_url = match base.join(endpoint.trim()) {
            Ok(u) => u,
            Err(e) => {
                reader.abort();
                return Err(transport_error(
                    server_name,
                    format!("bad endpoint '{endpoint}': {e}"),
                ));
            }
        };

        tracing::debug!(server = server_name, endpoint = %post_url, "SSE endpoint received");

        Ok(Self {
            server_name: server_name.to_string(),
            client,
            headers,
            post_url,
            pending,
            reader,
        })
    }

    /// Post a request and wait for its response on the event stream.
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

        // Registered before posting: the response event can beat the POST reply.
        let waiter = self
            .pending
            .register(id)
            .ok_or_else(|| transport_error(&self.server_name, "event stream is closed"))?;
        self.post(&body).await?;

        waiter.wait().await.ok_or_else(|| {
            transport_error(&self.server_name, "event stream closed before the response")
        })
    }

    /// Post a notification.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        self.post(&notification(method, params)).await
    }

    /// Stop reading the event stream. Dropping the response closes the socket.
    pub fn close(&self) {
        self.reader.abort();
        self.pending.close();
    }

    async fn post(&self, body: &serde_json::Value) -> Result<(), McpError> {
        let response = self
            .client
            .post(self.post_url.clone())
            .headers(self.headers.clone())
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(&self.server_name, format!("POST failed: {e}")))?;
        check_http_status(&self.server_name, response).await?;
        Ok(())
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Background reader: forwards the endpoint once, then routes responses.
async fn read_events(
    server: String,
    response: reqwest::Response,
    pending: Arc<PendingRequests>,
    endpoint_tx: oneshot::Sender<String>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut events = Box::pin(sse_events(response.bytes_stream(), server.clone()));

    while let Some(event) = events.next().await {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "SSE stream error");
                break;
            }
        };

        if event.event.as_deref() == Some("endpoint") {
            if let Some(tx) = endpoint_tx.take() {
                let _ = tx.send(event.data);
            }
            continue;
        }

        if !event.is_message() {
            continue;
        }

        if let Some(resp) = JsonRpcResponse::parse(&event.data) {
            pending.resolve(resp);
        }
    }

    tracing::debug!(server = %server, "SSE stream ended");
    pending.close();
}
