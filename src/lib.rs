pub mod logging;
pub mod mcp_client;
pub mod oauth;
pub mod resolver;
pub mod settings;

use std::path::PathBuf;

pub use mcp_client::{
    CredentialProvider, McpClient, McpClientOptions, McpError, McpEvent, ServerConnectionConfig,
    ToolDescriptor, TransportKind,
};
pub use oauth::{CredentialStore, OAuthError, SystemBrowser};
pub use resolver::{resolve_executable_path, CommandResolver};
pub use settings::{load_settings, McpSettings};

/// Return the platform-standard data directory.
///
/// - macOS: `~/Library/Application Support/com.mcp-conduit.app/`
/// - Windows: `{FOLDERID_RoamingAppData}\com.mcp-conduit.app\`
/// - Linux: `$XDG_DATA_HOME/com.mcp-conduit.app/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.mcp-conduit/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("com.mcp-conduit.app");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-conduit")
}

/// Path of the OAuth credential database.
pub fn credentials_db_path() -> PathBuf {
    data_dir().join("credentials.db")
}
