//! Authorization server discovery.
//!
//! Discovery order:
//! 1. RFC 9728 protected-resource metadata on the MCP server's origin names
//!    the authorization server.
//! 2. RFC 8414 authorization-server metadata on that server.
//! 3. Convention-based `/authorize`, `/token`, `/register` on the
//!    authorization server (the MCP origin when step 1 found nothing).
//!
//! Any failed step falls through to the next; discovery only fails on an
//! unusable server URL.

use serde::{Deserialize, Serialize};
use url::Url;

use super::errors::OAuthError;

const PROTECTED_RESOURCE_PATH: &str = "/.well-known/oauth-protected-resource";
const AUTHORIZATION_SERVER_PATH: &str = "/.well-known/oauth-authorization-server";

/// Endpoints of an OAuth authorization server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthServerMetadata {
    #[serde(default)]
    pub issuer: Option<String>,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub registration_endpoint: Option<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
}

impl AuthServerMetadata {
    /// Conventional endpoints relative to `base`.
    pub fn fallback(base: &Url) -> Self {
        let origin = origin_of(base);
        Self {
            issuer: Some(origin.clone()),
            authorization_endpoint: format!("{origin}/authorize"),
            token_endpoint: format!("{origin}/token"),
            registration_endpoint: Some(format!("{origin}/register")),
            scopes_supported: Vec::new(),
            code_challenge_methods_supported: Vec::new(),
        }
    }
}

/// RFC 9728 document; only the fields used here.
#[derive(Debug, Deserialize)]
struct ProtectedResourceMetadata {
    #[serde(default)]
    authorization_servers: Vec<String>,
}

/// Parse and check an MCP server URL.
pub fn parse_server_url(server_url: &str) -> Result<Url, OAuthError> {
    let url = Url::parse(server_url).map_err(|e| OAuthError::InvalidUrl {
        url: server_url.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(OAuthError::InvalidUrl {
            url: server_url.to_string(),
            reason: "expected an http(s) url with a host".into(),
        });
    }
    Ok(url)
}

/// `scheme://host[:port]` of a URL.
fn origin_of(url: &Url) -> String {
    url.origin().ascii_serialization()
}

/// RFC 8414 well-known URL: the well-known segment goes between host and path.
pub fn well_known_url(base: &Url, well_known: &str) -> String {
    let path = base.path().trim_end_matches('/');
    format!("{}{well_known}{path}", origin_of(base))
}

/// Discover the authorization server for an MCP server.
pub async fn discover(
    http: &reqwest::Client,
    server_url: &str,
) -> Result<AuthServerMetadata, OAuthError> {
    let resource = parse_server_url(server_url)?;

    let auth_base = match fetch_json::<ProtectedResourceMetadata>(
        http,
        &format!("{}{PROTECTED_RESOURCE_PATH}", origin_of(&resource)),
    )
    .await
    .and_then(|doc| doc.authorization_servers.into_iter().next())
    .and_then(|issuer| Url::parse(&issuer).ok())
    {
        Some(issuer) => issuer,
        None => {
            let mut origin = resource.clone();
            origin.set_path("/");
            origin.set_query(None);
            origin.set_fragment(None);
            origin
        }
    };

    let metadata_url = well_known_url(&auth_base, AUTHORIZATION_SERVER_PATH);
    match fetch_json::<AuthServerMetadata>(http, &metadata_url).await {
        Some(metadata) => {
            tracing::debug!(server_url, issuer = ?metadata.issuer, "authorization server metadata found");
            Ok(metadata)
        }
        None => {
            tracing::debug!(server_url, base = %auth_base, "no authorization server metadata, using conventional endpoints");
            Ok(AuthServerMetadata::fallback(&auth_base))
        }
    }
}

/// GET a JSON document; any failure is `None`.
async fn fetch_json<T: serde::de::DeserializeOwned>(http: &reqwest::Client, url: &str) -> Option<T> {
    let response = match http
        .get(url)
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await
    {
        Ok(r) if r.status().is_success() => r,
        Ok(r) => {
            tracing::trace!(url, status = %r.status(), "metadata document unavailable");
            return None;
        }
        Err(e) => {
            tracing::trace!(url, error = %e, "metadata request failed");
            return None;
        }
    };
    response.json::<T>().await.ok()
}
