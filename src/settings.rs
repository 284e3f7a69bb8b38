//! Server settings file.
//!
//! A JSON (or YAML, by extension) document listing the MCP servers to
//! connect at startup:
//!
//! ```json
//! {
//!   "servers": [
//!     { "id": "fs", "command": "npx", "args": ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"] },
//!     { "id": "remote", "transport": "streaming-http", "url": "https://mcp.example.com/mcp" }
//!   ],
//!   "disabledIds": ["remote"]
//! }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mcp_client::types::{ServerConnectionConfig, TransportKind};

/// Environment variable that overrides the settings file location.
pub const SETTINGS_ENV_VAR: &str = "MCP_CONDUIT_SETTINGS";

const SETTINGS_FILE_NAME: &str = "mcp-servers.json";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse settings {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },
}

// ─── Types ───────────────────────────────────────────────────────────────────

/// The whole settings document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpSettings {
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
    #[serde(default, alias = "disabledIds")]
    pub disabled_ids: Vec<String>,
}

/// One configured server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub id: String,
    #[serde(default = "default_transport")]
    pub transport: TransportKind,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_transport() -> TransportKind {
    TransportKind::Subprocess
}

fn default_enabled() -> bool {
    true
}

impl ServerEntry {
    pub fn to_connection_config(&self) -> ServerConnectionConfig {
        ServerConnectionConfig {
            id: self.id.clone(),
            transport: self.transport,
            command: self.command.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
        }
    }
}

impl McpSettings {
    /// Servers that are enabled and not listed in `disabled_ids`, in file order.
    pub fn enabled_configs(&self) -> Vec<ServerConnectionConfig> {
        self.servers
            .iter()
            .filter(|s| s.enabled && !self.disabled_ids.contains(&s.id))
            .map(ServerEntry::to_connection_config)
            .collect()
    }

    pub fn find(&self, id: &str) -> Option<&ServerEntry> {
        self.servers.iter().find(|s| s.id == id)
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Settings file location: `$MCP_CONDUIT_SETTINGS`, else the data directory.
pub fn settings_path() -> PathBuf {
    match std::env::var_os(SETTINGS_ENV_VAR) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => crate::data_dir().join(SETTINGS_FILE_NAME),
    }
}

/// Parse a settings file. `.yaml`/`.yml` are read as YAML, anything else as JSON.
pub fn load_settings(path: &Path) -> Result<McpSettings, SettingsError> {
    let raw = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let is_yaml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"));

    let parsed = if is_yaml {
        serde_yaml::from_str::<McpSettings>(&raw).map_err(|e| e.to_string())
    } else {
        serde_json::from_str::<McpSettings>(&raw).map_err(|e| e.to_string())
    };
    let settings = parsed.map_err(|reason| SettingsError::Parse {
        path: path.to_path_buf(),
        reason,
    })?;

    tracing::info!(
        path = %path.display(),
        servers = settings.servers.len(),
        disabled = settings.disabled_ids.len(),
        "loaded MCP settings"
    );
    Ok(settings)
}

/// Like [`load_settings`], but a missing file yields empty settings.
pub fn load_or_default(path: &Path) -> Result<McpSettings, SettingsError> {
    match load_settings(path) {
        Err(SettingsError::Read { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no settings file, starting with no servers");
            Ok(McpSettings::default())
        }
        other => other,
    }
}
