//! Authorization subsystem error types.

use thiserror::Error;

/// Errors raised while authorizing against a remote MCP server.
#[derive(Debug, Error)]
pub enum OAuthError {
    /// The server URL could not be parsed or is not http(s).
    #[error("invalid server url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// No loopback port in the scanned range could be bound.
    #[error("no free callback port in {first}..={last}")]
    NoCallbackPort { first: u16, last: u16 },

    /// Dynamic client registration was unavailable or rejected.
    #[error("client registration failed: {reason}")]
    RegistrationFailed { reason: String },

    /// The authorization server refused the code or refresh token.
    #[error("token request failed with HTTP {status}: {body}")]
    TokenRequestFailed { status: u16, body: String },

    /// The callback carried a state token with no pending record.
    #[error("unknown or already used authorization state")]
    UnknownState,

    /// The user or the authorization server aborted the flow.
    #[error("authorization denied: {error}")]
    Denied {
        error: String,
        description: Option<String>,
    },

    /// No usable token is stored for the server.
    #[error("no stored credential for server '{server_id}'")]
    NoCredential { server_id: String },

    /// HTTP request failed (network, TLS, timeout, body decode).
    #[error("HTTP request failed: {reason}")]
    Http { reason: String },

    /// Credential database operation failed.
    #[error("credential store error: {reason}")]
    Store { reason: String },

    /// The callback listener could not be started.
    #[error("callback listener error: {reason}")]
    Listener { reason: String },

    /// The system browser could not be launched.
    #[error("failed to open browser: {reason}")]
    Browser { reason: String },
}

impl From<rusqlite::Error> for OAuthError {
    fn from(e: rusqlite::Error) -> Self {
        OAuthError::Store {
            reason: e.to_string(),
        }
    }
}

impl From<reqwest::Error> for OAuthError {
    fn from(e: reqwest::Error) -> Self {
        OAuthError::Http {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for OAuthError {
    fn from(e: serde_json::Error) -> Self {
        OAuthError::Store {
            reason: format!("serialization error: {e}"),
        }
    }
}
