//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with MCP server child processes:
//! - Writing JSON-RPC requests to stdin
//! - Reading JSON-RPC responses from stdout on a background task
//! - Line-delimited JSON protocol (one JSON object per line)
//!
//! Writes are serialized; responses are routed by id, so a health probe is
//! answered while a slow tool call is still running.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::super::errors::McpError;
use super::super::types::{notification, JsonRpcRequest, JsonRpcResponse};
use super::pending::PendingRequests;
use super::{next_request_id, transport_error};

const STDOUT_CLOSED: &str = "server stdout closed (process may have exited)";

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    /// `None` once the transport is closed (stdin dropped → EOF for the server).
    writer: Mutex<Option<ChildStdin>>,
    pending: Arc<PendingRequests>,
    reader: JoinHandle<()>,
}

impl StdioTransport {
    /// Create a new transport from a child process's stdin/stdout.
    ///
    /// Starts the stdout reader, so this must run inside a Tokio runtime.
    pub fn new(server_name: &str, stdin: ChildStdin, stdout: ChildStdout) -> Self {
        let pending = PendingRequests::new();
        let reader = tokio::spawn(read_responses(
            server_name.to_string(),
            stdout,
            Arc::clone(&pending),
        ));
        Self {
            server_name: server_name.to_string(),
            writer: Mutex::new(Some(stdin)),
            pending,
            reader,
        }
    }

    /// Send a JSON-RPC request and wait for the matching response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = next_request_id();
        let req = JsonRpcRequest::new(id, method, params);

        let mut json = serde_json::to_string(&req).map_err(|e| {
            transport_error(&self.server_name, format!("failed to serialize request: {e}"))
        })?;
        json.push('\n');

        let waiter = self
            .pending
            .register(id)
            .ok_or_else(|| transport_error(&self.server_name, STDOUT_CLOSED))?;
        self.write_line(&json).await?;

        waiter
            .wait()
            .await
            .ok_or_else(|| transport_error(&self.server_name, STDOUT_CLOSED))
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let mut json = serde_json::to_string(&notification(method, params)).map_err(|e| {
            transport_error(
                &self.server_name,
                format!("failed to serialize notification: {e}"),
            )
        })?;
        json.push('\n');
        self.write_line(&json).await
    }

    /// Drop stdin so the server sees EOF, and stop reading.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Some(mut stdin) = writer.take() {
            let _ = stdin.shutdown().await;
        }
        self.reader.abort();
        self.pending.close();
    }

    async fn write_line(&self, line: &str) -> Result<(), McpError> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| transport_error(&self.server_name, "transport is closed"))?;
        writer.write_all(line.as_bytes()).await.map_err(|e| {
            transport_error(&self.server_name, format!("failed to write to stdin: {e}"))
        })?;
        writer.flush().await.map_err(|e| {
            transport_error(&self.server_name, format!("failed to flush stdin: {e}"))
        })?;
        Ok(())
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Background reader: routes each response line to its waiter until EOF.
async fn read_responses(server: String, stdout: ChildStdout, pending: Arc<PendingRequests>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                // Server-initiated messages and plain log output are skipped.
                if let Some(resp) = JsonRpcResponse::parse(trimmed) {
                    let id = resp.id;
                    if !pending.resolve(resp) {
                        tracing::debug!(server = %server, id, "response with no waiter");
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "failed to read from stdout");
                break;
            }
        }
    }
    tracing::debug!(server = %server, "stdout closed");
    pending.close();
}
