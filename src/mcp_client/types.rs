//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types, MCP protocol structures, and the
//! per-server connection definition.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::errors::McpError;
use crate::oauth::TokenSet;

/// MCP protocol revision sent in the `initialize` handshake.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// Build a JSON-RPC notification (no `id`, no response expected).
pub fn notification(method: &str, params: Option<serde_json::Value>) -> serde_json::Value {
    match params {
        Some(params) => serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        }),
        None => serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
        }),
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[allow(dead_code)]
    pub jsonrpc: String,
    pub id: u64,
    /// Present when the peer sent a request of its own rather than a response.
    #[serde(default)]
    pub method: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Parse one wire message as a response, ignoring server-initiated requests
    /// and notifications.
    pub fn parse(raw: &str) -> Option<Self> {
        match serde_json::from_str::<JsonRpcResponse>(raw) {
            Ok(resp) if resp.method.is_none() => Some(resp),
            _ => None,
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// MCP tool definition as returned by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "inputSchema")]
    pub input_schema: serde_json::Value,
}

/// `tools/list` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<McpToolDefinition>,
    #[serde(default, alias = "nextCursor")]
    pub next_cursor: Option<String>,
}

/// MCP initialize response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// Parameters sent with the `initialize` request.
pub fn initialize_params() -> serde_json::Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

// ─── Registry Types ──────────────────────────────────────────────────────────

/// One invocable capability, owned by a live connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub server_id: String,
}

impl ToolDescriptor {
    /// Attach a wire definition to its owning server.
    pub fn from_definition(server_id: &str, def: McpToolDefinition) -> Self {
        Self {
            name: def.name,
            description: def.description,
            input_schema: def.input_schema,
            server_id: server_id.to_string(),
        }
    }
}

/// Result of a tool call execution.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallResult {
    pub tool_name: String,
    pub server_id: String,
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

// ─── Connection Config ───────────────────────────────────────────────────────

/// Which channel a server is reached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Local child process speaking line-delimited JSON-RPC on stdio.
    #[serde(alias = "stdio")]
    Subprocess,
    /// Remote server-sent-event stream with a POST back-channel.
    Sse,
    /// Remote streamable HTTP endpoint.
    #[serde(alias = "http", alias = "streamable-http")]
    StreamingHttp,
}

impl TransportKind {
    pub fn is_network(self) -> bool {
        !matches!(self, TransportKind::Subprocess)
    }
}

/// Definition of a single connection attempt. Immutable per attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConnectionConfig {
    pub id: String,
    pub transport: TransportKind,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub url: Option<String>,
    /// Extra request headers for network transports.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl ServerConnectionConfig {
    /// Subprocess definition.
    pub fn subprocess(id: &str, command: &str, args: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            transport: TransportKind::Subprocess,
            command: Some(command.to_string()),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: HashMap::new(),
            url: None,
            headers: HashMap::new(),
        }
    }

    /// Network definition (SSE or streaming HTTP).
    pub fn network(id: &str, transport: TransportKind, url: &str) -> Self {
        Self {
            id: id.to_string(),
            transport,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            url: Some(url.to_string()),
            headers: HashMap::new(),
        }
    }

    /// Check that the fields present match the transport kind.
    pub fn validate(&self) -> Result<(), McpError> {
        let invalid = |reason: &str| McpError::InvalidConfig {
            name: self.id.clone(),
            reason: reason.to_string(),
        };

        if self.id.trim().is_empty() {
            return Err(invalid("server id must not be empty"));
        }

        match self.transport {
            TransportKind::Subprocess => {
                let command = self.command.as_deref().unwrap_or("").trim();
                if command.is_empty() {
                    return Err(invalid("subprocess transport requires a command"));
                }
                if self.url.is_some() {
                    return Err(invalid("subprocess transport does not take a url"));
                }
            }
            TransportKind::Sse | TransportKind::StreamingHttp => {
                let raw = self
                    .url
                    .as_deref()
                    .ok_or_else(|| invalid("network transport requires a url"))?;
                let parsed = url::Url::parse(raw)
                    .map_err(|e| invalid(&format!("unparseable url '{raw}': {e}")))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(invalid(&format!(
                        "unsupported url scheme '{}'",
                        parsed.scheme()
                    )));
                }
                if self.command.is_some() {
                    return Err(invalid("network transport does not take a command"));
                }
            }
        }

        Ok(())
    }
}

// ─── Credentials ─────────────────────────────────────────────────────────────

/// How a connection attempt authenticates against a network server.
#[derive(Debug, Clone, PartialEq)]
pub enum CredentialProvider {
    /// No credential supplied by the caller. Persisted tokens are used when
    /// present, and a 401 parks the config for an interactive authorization.
    Interactive,
    /// An already-issued token set. A 401 means the token is stale.
    Static(TokenSet),
}

// ─── Standard MCP Error Codes ────────────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_rpc_request_serialization() {
        let req = JsonRpcRequest::new(1, "initialize", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"method\":\"initialize\""));
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_notification_has_no_id() {
        let n = notification("notifications/initialized", None);
        assert!(n.get("id").is_none());
        assert_eq!(n["method"], "notifications/initialized");
    }

    #[test]
    fn test_parse_skips_server_requests() {
        let ping = r#"{"jsonrpc":"2.0","id":7,"method":"ping"}"#;
        assert!(JsonRpcResponse::parse(ping).is_none());

        let resp = r#"{"jsonrpc":"2.0","id":7,"result":{}}"#;
        assert_eq!(JsonRpcResponse::parse(resp).unwrap().id, 7);

        assert!(JsonRpcResponse::parse("hello").is_none());
    }

    #[test]
    fn test_json_rpc_error_response() {
        let json = r#"{
            "jsonrpc": "2.0",
            "id": 2,
            "result": null,
            "error": {"code": -32601, "message": "Method not found"}
        }"#;
        let resp: JsonRpcResponse = serde_json::from_str(json).unwrap();
        let err = resp.error.unwrap();
        assert_eq!(err.code, error_codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_list_tools_result_camel_case() {
        let json = r#"{
            "tools": [{"name": "read_file", "inputSchema": {"type": "object"}}],
            "nextCursor": "page-2"
        }"#;
        let result: ListToolsResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.tools.len(), 1);
        assert_eq!(result.tools[0].description, "");
        assert_eq!(result.tools[0].input_schema["type"], "object");
        assert_eq!(result.next_cursor.as_deref(), Some("page-2"));
    }

    #[test]
    fn test_transport_kind_aliases() {
        let kind: TransportKind = serde_json::from_str("\"stdio\"").unwrap();
        assert_eq!(kind, TransportKind::Subprocess);
        let kind: TransportKind = serde_json::from_str("\"http\"").unwrap();
        assert_eq!(kind, TransportKind::StreamingHttp);
        let kind: TransportKind = serde_json::from_str("\"streaming-http\"").unwrap();
        assert_eq!(kind, TransportKind::StreamingHttp);
    }

    #[test]
    fn test_validate_subprocess_requires_command() {
        let mut cfg = ServerConnectionConfig::subprocess("fs", "npx", &[]);
        assert!(cfg.validate().is_ok());

        cfg.command = Some("  ".into());
        assert!(matches!(cfg.validate(), Err(McpError::InvalidConfig { .. })));
    }

    #[test]
    fn test_validate_network_requires_http_url() {
        let cfg = ServerConnectionConfig::network("r", TransportKind::Sse, "https://x.dev/sse");
        assert!(cfg.validate().is_ok());

        let mut bad = cfg.clone();
        bad.url = Some("ftp://x.dev".into());
        assert!(matches!(bad.validate(), Err(McpError::InvalidConfig { .. })));

        let mut missing = cfg;
        missing.url = None;
        assert!(matches!(missing.validate(), Err(McpError::InvalidConfig { .. })));
    }

    #[test]
    fn test_validate_rejects_mixed_shape() {
        let mut cfg = ServerConnectionConfig::subprocess("fs", "node", &["index.js"]);
        cfg.url = Some("http://localhost:1".into());
        assert!(cfg.validate().is_err());

        let mut cfg = ServerConnectionConfig::subprocess("", "node", &[]);
        cfg.id = " ".into();
        assert!(cfg.validate().is_err());
    }
}
