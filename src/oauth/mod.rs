//! OAuth 2.0 authorization for remote MCP servers.
//!
//! Architecture:
//! - `metadata`: RFC 9728 / RFC 8414 discovery with conventional fallbacks
//! - `pkce`: S256 verifier/challenge pairs and state tokens
//! - `store`: SQLite persistence for registrations, tokens and pending flows
//! - `callback`: single-use loopback HTTP listener for the redirect
//! - `browser`: opens the authorization URL
//! - `flow`: the per-server state machine tying it together

pub mod browser;
pub mod callback;
pub mod errors;
pub mod flow;
pub mod metadata;
pub mod pkce;
pub mod store;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub use browser::{BrowserLauncher, SystemBrowser};
pub use errors::OAuthError;
pub use flow::{AuthPhase, AuthorizationComplete, OAuthManager};
pub use store::CredentialStore;

/// Tokens within this window of expiry are treated as expired.
const EXPIRY_SKEW_SECS: i64 = 30;

// ─── Types ───────────────────────────────────────────────────────────────────

/// An issued credential for one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_at: Option<DateTime<Utc>>,
    /// Client the tokens were issued to. Refreshes must present the same one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl TokenSet {
    /// Bearer token without expiry, for callers that already hold one.
    pub fn bearer(access_token: &str) -> Self {
        Self {
            access_token: access_token.to_string(),
            refresh_token: None,
            token_type: "Bearer".into(),
            expires_at: None,
            client_id: None,
        }
    }

    /// Whether the token is expired (or about to be) at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .map(|at| at - Duration::seconds(EXPIRY_SKEW_SECS) <= now)
            .unwrap_or(false)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Token endpoint response body (RFC 6749 §5.1).
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".into()
}

impl TokenResponse {
    /// Convert to a stored token set issued to `client_id`. A refresh
    /// response without a new refresh token keeps `previous_refresh`.
    pub fn into_token_set(
        self,
        client_id: &str,
        issued_at: DateTime<Utc>,
        previous_refresh: Option<String>,
    ) -> TokenSet {
        TokenSet {
            access_token: self.access_token,
            refresh_token: self.refresh_token.or(previous_refresh),
            token_type: self.token_type,
            expires_at: self
                .expires_in
                .map(|secs| issued_at + Duration::seconds(secs)),
            client_id: Some(client_id.to_string()),
        }
    }
}

/// A client identity issued by an authorization server for one redirect URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRegistration {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    pub redirect_uri: String,
}

/// An in-flight authorization, keyed by its state token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAuthorization {
    pub state: String,
    pub server_id: String,
    pub server_url: String,
    pub code_verifier: String,
    pub port: u16,
}

impl PendingAuthorization {
    pub fn redirect_uri(&self) -> String {
        callback::redirect_uri(self.port)
    }
}
