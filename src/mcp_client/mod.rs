//! MCP Client: connection lifecycle for MCP tool servers.
//!
//! This module handles:
//! - Opening subprocess, SSE and streamable HTTP transports
//! - The MCP initialization handshake and paginated tool discovery
//! - Per-connection health monitoring and teardown
//! - Tool aggregation across servers and call routing
//! - Per-server stderr log buffers and change notifications
//!
//! [`McpClient`] is the entry point; everything else is its machinery.

pub mod client;
pub mod connection;
pub mod errors;
pub mod events;
pub mod health;
pub mod lifecycle;
pub mod logs;
pub mod registry;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use client::{McpClient, McpClientOptions};
pub use errors::McpError;
pub use events::McpEvent;
pub use registry::{ToolRegistry, ToolResolution};
pub use types::{
    CredentialProvider, ServerConnectionConfig, ToolCallResult, ToolDescriptor, TransportKind,
};
