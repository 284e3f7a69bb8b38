//! MCP Client error types.

use thiserror::Error;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// The connection definition is malformed. Never retried.
    #[error("invalid config for server '{name}': {reason}")]
    InvalidConfig {
        name: String,
        reason: String,
    },

    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// JSON-RPC communication error (malformed message, I/O error, closed stream).
    #[error("transport error for server '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// A bounded step (handshake, discovery, probe, call) exceeded its timeout.
    #[error("{operation} for server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        operation: String,
        timeout_ms: u64,
    },

    /// The remote endpoint rejected the request with HTTP 401.
    ///
    /// Produced only at the transport boundary. The orchestrator converts it
    /// into [`McpError::AuthorizationRequired`].
    #[error("server '{server}' rejected the request as unauthorized")]
    Unauthorized {
        server: String,
        www_authenticate: Option<String>,
    },

    /// The server needs an OAuth authorization round trip before it can connect.
    ///
    /// `stale_credential` is set when a freshly issued credential was rejected.
    #[error("server '{name}' requires authorization")]
    AuthorizationRequired {
        name: String,
        stale_credential: bool,
    },

    /// The authorization flow itself failed.
    #[error("authorization for server '{name}' failed: {reason}")]
    AuthorizationFailed {
        name: String,
        reason: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Tool not found in the aggregated registry.
    #[error("unknown tool: '{name}'")]
    UnknownTool {
        name: String,
    },

    /// The tool's owning server has no live connection.
    #[error("server '{name}' is not connected")]
    ServerNotConnected {
        name: String,
    },

    /// Tool call arguments failed schema validation.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments {
        tool: String,
        reason: String,
    },

    /// A liveness probe failed. Logged by the health monitor, never returned
    /// from `connect`.
    #[error("health check for server '{name}' failed: {reason}")]
    HealthCheckFailed {
        name: String,
        reason: String,
    },
}

impl McpError {
    /// Whether this error is the typed transport-level 401.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, McpError::Unauthorized { .. })
    }

    /// Whether this error means a bound was exceeded.
    pub fn is_timeout(&self) -> bool {
        matches!(self, McpError::Timeout { .. })
    }
}
