//! Per-server authorization state machine.
//!
//! `NoAuth → Initiating → AwaitingCallback → Exchanging → Authorized`, with
//! every failure edge returning to `NoAuth`. Every flow that reaches the
//! callback ends with one message on the reconnect hook: the issued tokens,
//! so the connection layer can retry the parked connection, or the reason
//! the flow failed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use super::browser::BrowserLauncher;
use super::callback::{
    bind_callback_port, redirect_uri, CallbackListener, CallbackOutcome, CALLBACK_BASE_PORT,
    CALLBACK_PORT_ATTEMPTS,
};
use super::errors::OAuthError;
use super::metadata::{discover, AuthServerMetadata};
use super::pkce::{generate_state, PkcePair, CHALLENGE_METHOD};
use super::store::CredentialStore;
use super::{ClientRegistration, PendingAuthorization, TokenResponse, TokenSet};

/// Timeout for every request to an authorization server.
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Error bodies beyond this many chars are truncated.
const MAX_ERROR_BODY: usize = 500;

static NEXT_FLOW_ID: AtomicU64 = AtomicU64::new(1);

// ─── Types ───────────────────────────────────────────────────────────────────

/// Where a server's authorization currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthPhase {
    NoAuth,
    Initiating,
    AwaitingCallback,
    Exchanging,
    Authorized,
}

/// Sent on the reconnect hook when a flow ends.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorizationComplete {
    pub server_id: String,
    /// Tokens issued and stored, or why the flow failed.
    pub result: Result<TokenSet, String>,
}

struct ActiveListener {
    flow_id: u64,
    listener: CallbackListener,
}

#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    client_id: String,
    #[serde(default)]
    client_secret: Option<String>,
}

// ─── OAuthManager ────────────────────────────────────────────────────────────

/// Drives authorizations for any number of servers.
pub struct OAuthManager {
    store: Arc<CredentialStore>,
    http: reqwest::Client,
    browser: Arc<dyn BrowserLauncher>,
    reconnect: mpsc::UnboundedSender<AuthorizationComplete>,
    phases: Mutex<HashMap<String, AuthPhase>>,
    listeners: Mutex<HashMap<String, ActiveListener>>,
    callback_base_port: u16,
    client_name: String,
}

impl OAuthManager {
    pub fn new(
        store: Arc<CredentialStore>,
        browser: Arc<dyn BrowserLauncher>,
        reconnect: mpsc::UnboundedSender<AuthorizationComplete>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "failed to build OAuth HTTP client, using defaults");
                reqwest::Client::new()
            });
        Self {
            store,
            http,
            browser,
            reconnect,
            phases: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            callback_base_port: CALLBACK_BASE_PORT,
            client_name: env!("CARGO_PKG_NAME").to_string(),
        }
    }

    /// Scan for callback ports starting at `port` instead of the default.
    pub fn with_callback_base_port(mut self, port: u16) -> Self {
        self.callback_base_port = port;
        self
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn phase(&self, server_id: &str) -> AuthPhase {
        lock(&self.phases)
            .get(server_id)
            .copied()
            .unwrap_or(AuthPhase::NoAuth)
    }

    /// Port of the callback listener still open for a server, if any.
    pub fn active_callback_port(&self, server_id: &str) -> Option<u16> {
        lock(&self.listeners)
            .get(server_id)
            .filter(|active| !active.listener.is_finished())
            .map(|active| active.listener.port())
    }

    fn set_phase(&self, server_id: &str, phase: AuthPhase) {
        tracing::debug!(server = server_id, ?phase, "authorization phase");
        lock(&self.phases).insert(server_id.to_string(), phase);
    }

    // ─── Initiating ──────────────────────────────────────────────────

    /// Start an authorization for `server_id` and open the browser.
    ///
    /// Returns the authorization URL. A flow already running for the same
    /// server is superseded: its listener closes and its state is dropped.
    pub async fn begin(self: &Arc<Self>, server_id: &str, server_url: &str) -> Result<String, OAuthError> {
        self.supersede(server_id);
        self.set_phase(server_id, AuthPhase::Initiating);

        let auth_url = match self.initiate(server_id, server_url).await {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(server = server_id, error = %e, "authorization could not start");
                self.set_phase(server_id, AuthPhase::NoAuth);
                return Err(e);
            }
        };

        if let Err(e) = self.browser.open(&auth_url) {
            // The URL is still returned so the user can open it by hand.
            tracing::warn!(server = server_id, error = %e, "failed to open browser");
        }
        tracing::info!(server = server_id, "authorization started, waiting for browser callback");
        Ok(auth_url)
    }

    async fn initiate(self: &Arc<Self>, server_id: &str, server_url: &str) -> Result<String, OAuthError> {
        let metadata = discover(&self.http, server_url).await?;
        let (tcp, port) = bind_callback_port(self.callback_base_port, CALLBACK_PORT_ATTEMPTS).await?;
        let redirect = redirect_uri(port);
        let registration = self.ensure_registration(server_id, &metadata, &redirect).await?;

        let pkce = PkcePair::generate();
        let state = generate_state();
        self.store.insert_pending(&PendingAuthorization {
            state: state.clone(),
            server_id: server_id.to_string(),
            server_url: server_url.to_string(),
            code_verifier: pkce.verifier.clone(),
            port,
        })?;

        let auth_url = authorization_url(&metadata, &registration, &pkce, &state, server_url)?;

        self.set_phase(server_id, AuthPhase::AwaitingCallback);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let listener = CallbackListener::serve(tcp, port, outcome_tx);
        let flow_id = NEXT_FLOW_ID.fetch_add(1, Ordering::Relaxed);
        let previous = lock(&self.listeners).insert(
            server_id.to_string(),
            ActiveListener { flow_id, listener },
        );
        if let Some(previous) = previous {
            previous.listener.close();
        }

        let manager = Arc::clone(self);
        let server_id = server_id.to_string();
        tokio::spawn(async move {
            manager
                .await_callback(server_id, state, flow_id, outcome_rx)
                .await;
        });

        Ok(auth_url)
    }

    /// Close a prior flow's listener and forget its pending state.
    fn supersede(&self, server_id: &str) {
        let previous = lock(&self.listeners).remove(server_id);
        if let Some(previous) = previous {
            tracing::info!(server = server_id, port = previous.listener.port(), "superseding earlier authorization");
            previous.listener.close();
        }
        if let Err(e) = self.store.delete_pending_for_server(server_id) {
            tracing::warn!(server = server_id, error = %e, "failed to drop pending authorization");
        }
    }

    async fn ensure_registration(
        &self,
        server_id: &str,
        metadata: &AuthServerMetadata,
        redirect: &str,
    ) -> Result<ClientRegistration, OAuthError> {
        if let Some(existing) = self.store.load_registration(server_id, redirect)? {
            return Ok(existing);
        }

        let endpoint = metadata
            .registration_endpoint
            .as_deref()
            .ok_or_else(|| OAuthError::RegistrationFailed {
                reason: "server does not support dynamic client registration".into(),
            })?;

        let body = serde_json::json!({
            "client_name": self.client_name,
            "redirect_uris": [redirect],
            "grant_types": ["authorization_code", "refresh_token"],
            "response_types": ["code"],
            "token_endpoint_auth_method": "none",
        });
        let response = self.http.post(endpoint).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = truncated_body(response).await;
            return Err(OAuthError::RegistrationFailed {
                reason: format!("HTTP {status}: {text}"),
            });
        }
        let issued: RegistrationResponse = response.json().await?;

        let registration = ClientRegistration {
            client_id: issued.client_id,
            client_secret: issued.client_secret,
            redirect_uri: redirect.to_string(),
        };
        self.store.save_registration(server_id, &registration)?;
        tracing::info!(server = server_id, client_id = %registration.client_id, "registered OAuth client");
        Ok(registration)
    }

    // ─── AwaitingCallback ────────────────────────────────────────────

    async fn await_callback(
        self: Arc<Self>,
        server_id: String,
        state: String,
        flow_id: u64,
        outcome_rx: oneshot::Receiver<CallbackOutcome>,
    ) {
        let outcome = outcome_rx.await;

        // The listener is already shutting down gracefully; let it finish.
        let finished = {
            let mut listeners = lock(&self.listeners);
            let ours = listeners
                .get(&server_id)
                .is_some_and(|active| active.flow_id == flow_id);
            if ours {
                listeners.remove(&server_id)
            } else {
                None
            }
        };
        if let Some(finished) = finished {
            finished.listener.detach();
        }

        match outcome {
            Ok(CallbackOutcome::Code { code, state: returned }) => {
                if let Err(e) = self.complete(&code, &returned).await {
                    tracing::warn!(server = %server_id, error = %e, "authorization failed");
                    // `complete` reports failures only once it has consumed the
                    // record; before that the flow is still awaiting its callback.
                    if self.phase(&server_id) == AuthPhase::AwaitingCallback {
                        if let Err(store_err) = self.store.delete_pending(&state) {
                            tracing::warn!(server = %server_id, error = %store_err, "failed to drop pending authorization");
                        }
                        self.set_phase(&server_id, AuthPhase::NoAuth);
                        self.report(&server_id, Err(e.to_string()));
                    }
                }
            }
            Ok(CallbackOutcome::Error { error, description }) => {
                let err = OAuthError::Denied { error, description };
                tracing::warn!(server = %server_id, error = %err, "authorization failed");
                if let Err(e) = self.store.delete_pending(&state) {
                    tracing::warn!(server = %server_id, error = %e, "failed to drop pending authorization");
                }
                self.set_phase(&server_id, AuthPhase::NoAuth);
                self.report(&server_id, Err(err.to_string()));
            }
            Err(_) => {
                tracing::debug!(server = %server_id, "callback listener closed before a redirect");
            }
        }
    }

    /// Tell the connection layer how a flow ended.
    fn report(&self, server_id: &str, result: Result<TokenSet, String>) {
        let done = AuthorizationComplete {
            server_id: server_id.to_string(),
            result,
        };
        if self.reconnect.send(done).is_err() {
            tracing::debug!(server = server_id, "no reconnect listener");
        }
    }

    // ─── Exchanging ──────────────────────────────────────────────────

    /// Redeem an authorization code for the flow identified by `state`.
    ///
    /// The pending record is consumed before anything else, so a replayed
    /// state fails with [`OAuthError::UnknownState`] and no side effects.
    pub async fn complete(&self, code: &str, state: &str) -> Result<TokenSet, OAuthError> {
        let Some(pending) = self.store.take_pending(state)? else {
            tracing::warn!("callback carried an unknown or already used state");
            return Err(OAuthError::UnknownState);
        };
        let server_id = pending.server_id.clone();
        self.set_phase(&server_id, AuthPhase::Exchanging);

        match self.exchange(&pending, code).await {
            Ok(tokens) => {
                self.set_phase(&server_id, AuthPhase::Authorized);
                tracing::info!(server = %server_id, "authorization complete");
                self.report(&server_id, Ok(tokens.clone()));
                Ok(tokens)
            }
            Err(e) => {
                self.set_phase(&server_id, AuthPhase::NoAuth);
                self.report(&server_id, Err(e.to_string()));
                Err(e)
            }
        }
    }

    async fn exchange(&self, pending: &PendingAuthorization, code: &str) -> Result<TokenSet, OAuthError> {
        let metadata = discover(&self.http, &pending.server_url).await?;
        let redirect = pending.redirect_uri();
        let registration = self
            .ensure_registration(&pending.server_id, &metadata, &redirect)
            .await?;

        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect.as_str()),
            ("client_id", registration.client_id.as_str()),
            ("code_verifier", pending.code_verifier.as_str()),
            ("resource", pending.server_url.as_str()),
        ];
        if let Some(secret) = registration.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }

        let issued_at = Utc::now();
        let response = self.post_token(&metadata.token_endpoint, &form).await?;
        let tokens = response.into_token_set(&registration.client_id, issued_at, None);
        self.store.save_tokens(&pending.server_id, &tokens)?;
        Ok(tokens)
    }

    async fn post_token(&self, endpoint: &str, form: &[(&str, &str)]) -> Result<TokenResponse, OAuthError> {
        let response = self
            .http
            .post(endpoint)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(form)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(OAuthError::TokenRequestFailed {
                status: status.as_u16(),
                body: truncated_body(response).await,
            });
        }
        Ok(response.json::<TokenResponse>().await?)
    }

    // ─── Stored Credentials ──────────────────────────────────────────

    /// Exchange the stored refresh token for a new token set.
    pub async fn refresh(&self, server_id: &str, server_url: &str) -> Result<TokenSet, OAuthError> {
        let no_credential = || OAuthError::NoCredential {
            server_id: server_id.to_string(),
        };
        let current = self.store.load_tokens(server_id)?.ok_or_else(no_credential)?;
        let refresh_token = current.refresh_token.ok_or_else(no_credential)?;
        let (client_id, client_secret) = match current.client_id {
            Some(client_id) => {
                let secret = self
                    .store
                    .registration_for_client(server_id, &client_id)?
                    .and_then(|r| r.client_secret);
                (client_id, secret)
            }
            // Tokens stored before issuers were recorded.
            None => {
                let registration = self.store.latest_registration(server_id)?.ok_or_else(|| {
                    OAuthError::RegistrationFailed {
                        reason: "no client registration stored".into(),
                    }
                })?;
                (registration.client_id, registration.client_secret)
            }
        };
        let metadata = discover(&self.http, server_url).await?;

        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", client_id.as_str()),
            ("resource", server_url),
        ];
        if let Some(secret) = client_secret.as_deref() {
            form.push(("client_secret", secret));
        }

        let issued_at = Utc::now();
        let response = self.post_token(&metadata.token_endpoint, &form).await?;
        let tokens = response.into_token_set(&client_id, issued_at, Some(refresh_token.clone()));
        self.store.save_tokens(server_id, &tokens)?;
        tracing::info!(server = server_id, client_id = %client_id, "access token refreshed");
        Ok(tokens)
    }

    /// A usable access token for a server, refreshing an expired one when a
    /// refresh token is stored. `None` when nothing usable is available.
    pub async fn access_token_for(&self, server_id: &str, server_url: &str) -> Option<String> {
        let tokens = match self.store.load_tokens(server_id) {
            Ok(Some(tokens)) => tokens,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(server = server_id, error = %e, "failed to load stored token");
                return None;
            }
        };

        if !tokens.is_expired() {
            return Some(tokens.access_token);
        }
        if tokens.refresh_token.is_none() {
            tracing::debug!(server = server_id, "stored token expired and cannot be refreshed");
            return None;
        }
        match self.refresh(server_id, server_url).await {
            Ok(fresh) => Some(fresh.access_token),
            Err(e) => {
                tracing::warn!(server = server_id, error = %e, "token refresh failed");
                None
            }
        }
    }

    /// Forget everything held for a server except its client registration.
    pub fn clear(&self, server_id: &str) -> Result<bool, OAuthError> {
        self.supersede(server_id);
        let had_tokens = self.store.delete_tokens(server_id)?;
        self.set_phase(server_id, AuthPhase::NoAuth);
        Ok(had_tokens)
    }
}

/// Build the authorization request URL (authorization code + PKCE).
fn authorization_url(
    metadata: &AuthServerMetadata,
    registration: &ClientRegistration,
    pkce: &PkcePair,
    state: &str,
    resource: &str,
) -> Result<String, OAuthError> {
    let mut url = url::Url::parse(&metadata.authorization_endpoint).map_err(|e| OAuthError::InvalidUrl {
        url: metadata.authorization_endpoint.clone(),
        reason: e.to_string(),
    })?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("response_type", "code")
            .append_pair("client_id", &registration.client_id)
            .append_pair("redirect_uri", &registration.redirect_uri)
            .append_pair("code_challenge", &pkce.challenge)
            .append_pair("code_challenge_method", CHALLENGE_METHOD)
            .append_pair("state", state)
            .append_pair("resource", resource);
        if !metadata.scopes_supported.is_empty() {
            query.append_pair("scope", &metadata.scopes_supported.join(" "));
        }
    }
    Ok(url.to_string())
}

async fn truncated_body(response: reqwest::Response) -> String {
    let mut body = response.text().await.unwrap_or_default().trim().to_string();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ─── Tests ──────────────────────────────────────────────────────────────────
