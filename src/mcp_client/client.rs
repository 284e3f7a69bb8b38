//! MCP Client: the connection orchestrator.
//!
//! Owns every live [`Connection`], the aggregated [`ToolRegistry`], the
//! per-server log buffers and the configs parked while an authorization is
//! outstanding. All of it sits behind one async mutex that is never held
//! across transport I/O. Same-id connects are not serialized: the last
//! writer wins, and epochs stop stale attempts and stale health monitors
//! from touching a newer connection.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, Mutex};

use super::connection::Connection;
use super::errors::McpError;
use super::events::{EventBus, McpEvent};
use super::health::{self, HealthConfig, DEFAULT_HEALTH_INTERVAL, DEFAULT_PROBE_TIMEOUT};
use super::lifecycle::{self, SpawnContext};
use super::logs::LogStore;
use super::registry::ToolRegistry;
use super::transport::extract_result;
use super::types::{CredentialProvider, ServerConnectionConfig, ToolCallResult, ToolDescriptor};
use crate::oauth::{AuthorizationComplete, BrowserLauncher, CredentialStore, OAuthManager};
use crate::resolver::CommandResolver;
use crate::settings::McpSettings;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default bound on capability discovery after the handshake.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Default timeout for tool call execution.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

// ─── Options ─────────────────────────────────────────────────────────────────

/// Runtime tunables for an [`McpClient`].
#[derive(Debug, Clone, Copy)]
pub struct McpClientOptions {
    pub health_interval: Duration,
    pub probe_timeout: Duration,
    pub discovery_timeout: Duration,
    pub call_timeout: Duration,
}

impl Default for McpClientOptions {
    fn default() -> Self {
        Self {
            health_interval: DEFAULT_HEALTH_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

impl McpClientOptions {
    fn health(&self) -> HealthConfig {
        HealthConfig {
            interval: self.health_interval,
            probe_timeout: self.probe_timeout,
        }
    }
}

// ─── McpClient ───────────────────────────────────────────────────────────────

/// Manages connections to many MCP servers and routes tool calls to them.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct McpClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    state: Mutex<ClientState>,
    logs: LogStore,
    events: EventBus,
    resolver: CommandResolver,
    options: McpClientOptions,
    auth: Option<Arc<OAuthManager>>,
    next_epoch: AtomicU64,
}

#[derive(Default)]
struct ClientState {
    connections: HashMap<String, Connection>,
    registry: ToolRegistry,
    /// Configs waiting on an authorization round trip, by server id.
    pending_auth: HashMap<String, ServerConnectionConfig>,
    /// Every id a connect was attempted for, live or not.
    known_ids: HashSet<String>,
}

impl ClientState {
    fn status_event(&self) -> McpEvent {
        let mut connected_ids: Vec<String> = self.connections.keys().cloned().collect();
        connected_ids.sort();
        McpEvent::Status {
            tools: self.registry.all_tools(),
            connected_ids,
        }
    }

    /// The server named by a `server.tool` prefix, when that server is known
    /// but has no live connection.
    fn unconnected_server_in(&self, name: &str) -> Option<String> {
        name.match_indices('.')
            .map(|(idx, _)| &name[..idx])
            .find(|server| self.known_ids.contains(*server) && !self.connections.contains_key(*server))
            .map(String::from)
    }
}

impl McpClient {
    /// Create a client. Without an [`OAuthManager`], 401s still park the
    /// config but [`McpClient::start_authorization`] is unavailable.
    pub fn new(
        options: McpClientOptions,
        resolver: CommandResolver,
        auth: Option<Arc<OAuthManager>>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                state: Mutex::new(ClientState::default()),
                logs: LogStore::new(),
                events: EventBus::new(),
                resolver,
                options,
                auth,
                next_epoch: AtomicU64::new(1),
            }),
        }
    }

    /// Create a client with OAuth support. Completed authorizations reconnect
    /// the parked config automatically. Must be called inside a Tokio runtime.
    pub fn with_oauth(
        options: McpClientOptions,
        resolver: CommandResolver,
        store: Arc<CredentialStore>,
        browser: Arc<dyn BrowserLauncher>,
    ) -> Self {
        let (reconnect_tx, reconnect_rx) = mpsc::unbounded_channel();
        let auth = Arc::new(OAuthManager::new(store, browser, reconnect_tx));
        let client = Self::new(options, resolver, Some(auth));
        client.spawn_reconnect_listener(reconnect_rx);
        client
    }

    fn spawn_reconnect_listener(&self, mut rx: mpsc::UnboundedReceiver<AuthorizationComplete>) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(done) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                McpClient { inner }.complete_authorization(done).await;
            }
        });
    }

    /// Receive every status, log and reconnect notification from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<McpEvent> {
        self.inner.events.subscribe()
    }

    pub fn auth(&self) -> Option<&Arc<OAuthManager>> {
        self.inner.auth.as_ref()
    }

    // ─── Connect ─────────────────────────────────────────────────────

    /// Connect to one server, replacing any existing connection for its id.
    ///
    /// Returns the server's tools. On failure nothing for this id is left
    /// behind except, for a 401, the parked config.
    pub async fn connect(
        &self,
        config: ServerConnectionConfig,
        credential: CredentialProvider,
    ) -> Result<Vec<ToolDescriptor>, McpError> {
        let id = config.id.clone();

        if self.remove_connection(&id, None).await {
            tracing::info!(server = %id, "replacing existing connection");
            self.emit_status().await;
        }

        config.validate()?;
        self.inner.state.lock().await.known_ids.insert(id.clone());

        match self.establish(&config, &credential).await {
            Ok(tools) => Ok(tools),
            Err(e) => Err(self.classify_failure(&config, &credential, e).await),
        }
    }

    async fn establish(
        &self,
        config: &ServerConnectionConfig,
        credential: &CredentialProvider,
    ) -> Result<Vec<ToolDescriptor>, McpError> {
        let id = config.id.as_str();
        let inner = &self.inner;
        let bearer = self.bearer_for(config, credential).await;
        let epoch = inner.next_epoch.fetch_add(1, Ordering::Relaxed);
        let connect_timeout = lifecycle::connect_timeout(config);

        inner.logs.clear(id);
        let ctx = SpawnContext {
            resolver: &inner.resolver,
            logs: &inner.logs,
            events: &inner.events,
        };

        // Open + handshake under one bound. A failed or abandoned attempt
        // drops its OpenedTransport, which stops the process.
        let attempt = async {
            let opened = lifecycle::open_transport(config, bearer.as_deref(), &ctx).await?;
            lifecycle::handshake(&opened.transport, id).await?;
            Ok::<_, McpError>(opened)
        };
        let opened = match tokio::time::timeout(connect_timeout, attempt).await {
            Ok(Ok(opened)) => opened,
            Ok(Err(e)) => {
                return Err(lifecycle::with_stderr_context(
                    e,
                    &lifecycle::stderr_tail(&inner.logs, id),
                ))
            }
            Err(_) => {
                return Err(McpError::Timeout {
                    server: id.to_string(),
                    operation: "connect".into(),
                    timeout_ms: connect_timeout.as_millis() as u64,
                })
            }
        };

        let mut connection = Connection::new(id, epoch, opened);
        let transport = connection.transport();
        let exit_signal = connection.take_exit_signal();
        let displaced = {
            let mut state = inner.state.lock().await;
            let displaced = state.connections.insert(id.to_string(), connection);
            if displaced.is_some() {
                state.registry.unregister_server(id);
            }
            displaced
        };
        if let Some(displaced) = displaced {
            tracing::info!(server = %id, epoch = displaced.epoch, "concurrent connect displaced");
            displaced.teardown().await;
        }

        let discovered = match tokio::time::timeout(
            inner.options.discovery_timeout,
            lifecycle::list_tools(&transport, id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(McpError::Timeout {
                server: id.to_string(),
                operation: "tools/list".into(),
                timeout_ms: inner.options.discovery_timeout.as_millis() as u64,
            }),
        };
        let tools = match discovered {
            Ok(tools) => tools,
            Err(e) => {
                let e = lifecycle::with_stderr_context(e, &lifecycle::stderr_tail(&inner.logs, id));
                self.remove_connection(id, Some(epoch)).await;
                return Err(e);
            }
        };

        let (tools, event) = {
            let mut state = inner.state.lock().await;
            let state = &mut *state;
            let Some(connection) = state
                .connections
                .get_mut(id)
                .filter(|c| c.epoch == epoch)
            else {
                return Err(McpError::TransportError {
                    server: id.to_string(),
                    reason: "connection was closed or replaced during discovery".into(),
                });
            };

            state.registry.replace_server_tools(id, tools);
            let tools = state.registry.tools_for_server(id).to_vec();
            connection.tools = tools.clone();
            connection.set_health_monitor(health::spawn_health_monitor(
                id.to_string(),
                transport,
                exit_signal,
                inner.options.health(),
                self.connection_lost_callback(id, epoch),
            ));
            state.pending_auth.remove(id);
            (tools, state.status_event())
        };
        inner.events.emit(event);

        tracing::info!(server = %id, epoch, tools = tools.len(), "server connected");
        Ok(tools)
    }

    /// Bearer token for a network connect, if any.
    async fn bearer_for(
        &self,
        config: &ServerConnectionConfig,
        credential: &CredentialProvider,
    ) -> Option<String> {
        match credential {
            CredentialProvider::Static(tokens) => Some(tokens.access_token.clone()),
            CredentialProvider::Interactive => {
                let auth = self.inner.auth.as_ref()?;
                let url = config.url.as_deref()?;
                if !config.transport.is_network() {
                    return None;
                }
                auth.access_token_for(&config.id, url).await
            }
        }
    }

    /// Decide what a failed connect reports, and whether the config is
    /// parked for authorization.
    async fn classify_failure(
        &self,
        config: &ServerConnectionConfig,
        credential: &CredentialProvider,
        err: McpError,
    ) -> McpError {
        let id = config.id.clone();
        let mut state = self.inner.state.lock().await;

        if !err.is_unauthorized() {
            state.pending_auth.remove(&id);
            tracing::warn!(server = %id, error = %err, "connect failed");
            return err;
        }

        state.pending_auth.insert(id.clone(), config.clone());
        let stale_credential = matches!(credential, CredentialProvider::Static(_));
        if stale_credential {
            tracing::warn!(server = %id, "server rejected a freshly issued credential");
        } else {
            tracing::info!(server = %id, "server requires authorization");
        }
        McpError::AuthorizationRequired {
            name: id,
            stale_credential,
        }
    }

    /// Failure callback for a health monitor. Runs inside the monitor task,
    /// so the teardown goes to a new task.
    fn connection_lost_callback(&self, id: &str, epoch: u64) -> impl FnOnce(String) + Send + 'static {
        let weak: Weak<ClientInner> = Arc::downgrade(&self.inner);
        let id = id.to_string();
        move |reason| {
            tokio::spawn(async move {
                if let Some(inner) = weak.upgrade() {
                    McpClient { inner }.handle_connection_lost(&id, epoch, reason).await;
                }
            });
        }
    }

    async fn handle_connection_lost(&self, id: &str, epoch: u64, reason: String) {
        let err = McpError::HealthCheckFailed {
            name: id.to_string(),
            reason,
        };
        if self.remove_connection(id, Some(epoch)).await {
            tracing::warn!(server = %id, epoch, error = %err, "connection lost, torn down");
            self.emit_status().await;
        } else {
            tracing::debug!(server = %id, epoch, error = %err, "stale health failure ignored");
        }
    }

    /// Remove and tear down the connection for `id`. With `epoch`, only that
    /// generation is removed. Returns whether anything was torn down.
    async fn remove_connection(&self, id: &str, epoch: Option<u64>) -> bool {
        let removed = {
            let mut state = self.inner.state.lock().await;
            let matches = state
                .connections
                .get(id)
                .is_some_and(|c| epoch.map_or(true, |e| c.epoch == e));
            if !matches {
                return false;
            }
            state.registry.unregister_server(id);
            state.connections.remove(id)
        };
        match removed {
            Some(connection) => {
                connection.teardown().await;
                true
            }
            None => false,
        }
    }

    async fn emit_status(&self) {
        let event = self.inner.state.lock().await.status_event();
        self.inner.events.emit(event);
    }

    // ─── Lifecycle ───────────────────────────────────────────────────

    /// Tear down one server. Unknown ids succeed without doing anything.
    pub async fn disconnect(&self, id: &str) {
        let removed = self.remove_connection(id, None).await;
        self.inner.state.lock().await.pending_auth.remove(id);
        if removed {
            tracing::info!(server = %id, "server disconnected");
            self.emit_status().await;
        }
    }

    /// Connect every enabled server concurrently.
    ///
    /// Returns the servers that failed; partial startup is OK.
    pub async fn connect_all(&self, settings: &McpSettings) -> Vec<(String, McpError)> {
        let attempts = settings.enabled_configs().into_iter().map(|config| {
            let id = config.id.clone();
            async move {
                let result = self.connect(config, CredentialProvider::Interactive).await;
                (id, result)
            }
        });

        let results = futures::future::join_all(attempts).await;
        let total = results.len();
        let failures: Vec<(String, McpError)> = results
            .into_iter()
            .filter_map(|(id, result)| result.err().map(|e| (id, e)))
            .collect();
        tracing::info!(
            connected = total - failures.len(),
            failed = failures.len(),
            "startup connections finished"
        );
        failures
    }

    /// Tear down every connection.
    pub async fn shutdown_all(&self) {
        let connections: Vec<Connection> = {
            let mut state = self.inner.state.lock().await;
            state.registry.clear();
            state.connections.drain().map(|(_, c)| c).collect()
        };
        if connections.is_empty() {
            return;
        }
        let count = connections.len();
        futures::future::join_all(connections.into_iter().map(Connection::teardown)).await;
        tracing::info!(count, "all servers shut down");
        self.emit_status().await;
    }

    // ─── Queries ─────────────────────────────────────────────────────

    /// Snapshot of every tool from every live connection.
    pub async fn get_tools(&self) -> Vec<ToolDescriptor> {
        self.inner.state.lock().await.registry.all_tools()
    }

    /// Retained stderr lines for a server, oldest first.
    pub fn get_logs(&self, id: &str) -> Vec<String> {
        self.inner.logs.lines(id)
    }

    pub async fn connected_ids(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        let mut ids: Vec<String> = state.connections.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn is_connected(&self, id: &str) -> bool {
        self.inner.state.lock().await.connections.contains_key(id)
    }

    /// Servers whose last connect stopped at a 401.
    pub async fn pending_authorization_ids(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        let mut ids: Vec<String> = state.pending_auth.keys().cloned().collect();
        ids.sort();
        ids
    }

    // ─── Tool Execution ──────────────────────────────────────────────

    /// Execute a tool call, routing to the owning server.
    ///
    /// `name` is either a bare tool name or `server.tool`. A tool-level
    /// failure (`isError` or a JSON-RPC error) is an unsuccessful result, not
    /// an `Err`.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallResult, McpError> {
        let start = Instant::now();

        let (tool, transport, epoch) = {
            let state = self.inner.state.lock().await;
            let tool = match state.registry.validate_tool_call(name, &arguments) {
                Ok(tool) => tool.clone(),
                Err(McpError::UnknownTool { name }) => {
                    return Err(match state.unconnected_server_in(&name) {
                        Some(server) => McpError::ServerNotConnected { name: server },
                        None => McpError::UnknownTool { name },
                    })
                }
                Err(e) => return Err(e),
            };
            let connection = state
                .connections
                .get(&tool.server_id)
                .ok_or_else(|| McpError::ServerNotConnected {
                    name: tool.server_id.clone(),
                })?;
            (tool, connection.transport(), connection.epoch)
        };

        let params = serde_json::json!({
            "name": tool.name,
            "arguments": arguments,
        });
        let call_timeout = self.inner.options.call_timeout;
        let response = match tokio::time::timeout(call_timeout, transport.request("tools/call", Some(params))).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(self.call_failure(&tool.server_id, epoch, e).await),
            Err(_) => {
                return Err(McpError::Timeout {
                    server: tool.server_id.clone(),
                    operation: format!("tools/call '{}'", tool.name),
                    timeout_ms: call_timeout.as_millis() as u64,
                })
            }
        };

        let elapsed = start.elapsed().as_millis() as u64;
        let outcome = |success: bool, result: Option<serde_json::Value>, error: Option<String>| ToolCallResult {
            tool_name: tool.name.clone(),
            server_id: tool.server_id.clone(),
            success,
            result,
            error,
            execution_time_ms: elapsed,
        };

        match extract_result(response) {
            Ok(result) => {
                let is_error = result
                    .get("isError")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                if is_error {
                    let message = first_text_content(&result)
                        .unwrap_or_else(|| "tool reported an error".into());
                    Ok(outcome(false, Some(result), Some(message)))
                } else {
                    Ok(outcome(true, Some(result), None))
                }
            }
            Err(McpError::ServerError { code, message, .. }) => {
                Ok(outcome(false, None, Some(format!("[{code}] {message}"))))
            }
            Err(e) => Err(e),
        }
    }

    /// A transport failure on a connection torn down mid-call means the
    /// server is gone, not that the channel misbehaved.
    async fn call_failure(&self, server_id: &str, epoch: u64, err: McpError) -> McpError {
        if !matches!(err, McpError::TransportError { .. }) {
            return err;
        }
        let state = self.inner.state.lock().await;
        let still_live = state
            .connections
            .get(server_id)
            .is_some_and(|c| c.epoch == epoch);
        if still_live {
            err
        } else {
            tracing::debug!(server = %server_id, error = %err, "tool call lost its connection");
            McpError::ServerNotConnected {
                name: server_id.to_string(),
            }
        }
    }

    // ─── Authorization ───────────────────────────────────────────────

    /// Begin an interactive authorization and open the browser.
    ///
    /// `url` names the server to authorize against. Without it, the URL of
    /// the config parked by the last 401 is used. Returns the authorization
    /// URL. Once the callback completes, a parked config reconnects on its
    /// own and the outcome arrives as [`McpEvent::AuthReconnectComplete`].
    pub async fn start_authorization(&self, id: &str, url: Option<&str>) -> Result<String, McpError> {
        let auth = self
            .inner
            .auth
            .as_ref()
            .ok_or_else(|| McpError::AuthorizationFailed {
                name: id.to_string(),
                reason: "authorization is not configured".into(),
            })?;

        let url = match url {
            Some(url) => Some(url.to_string()),
            None => {
                let state = self.inner.state.lock().await;
                state.pending_auth.get(id).and_then(|c| c.url.clone())
            }
        };
        let url = url.ok_or_else(|| McpError::AuthorizationFailed {
            name: id.to_string(),
            reason: "no server url given and no connection is waiting for authorization".into(),
        })?;

        auth.begin(id, &url)
            .await
            .map_err(|e| McpError::AuthorizationFailed {
                name: id.to_string(),
                reason: e.to_string(),
            })
    }

    /// Act on a finished authorization: retry the parked config with the
    /// issued tokens, or report why no tokens were issued. Either way the
    /// outcome is emitted as [`McpEvent::AuthReconnectComplete`].
    pub async fn complete_authorization(&self, done: AuthorizationComplete) {
        let AuthorizationComplete { server_id, result } = done;
        let tokens = match result {
            Ok(tokens) => tokens,
            Err(reason) => {
                let err = McpError::AuthorizationFailed {
                    name: server_id.clone(),
                    reason,
                };
                tracing::warn!(server = %server_id, error = %err, "authorization did not complete");
                self.inner.events.emit(McpEvent::AuthReconnectComplete {
                    id: server_id,
                    success: false,
                    error: Some(err.to_string()),
                });
                return;
            }
        };

        let config = self.inner.state.lock().await.pending_auth.get(&server_id).cloned();
        let Some(config) = config else {
            tracing::debug!(server = %server_id, "authorization completed with nothing to reconnect");
            return;
        };

        let result = self
            .connect(config, CredentialProvider::Static(tokens))
            .await;
        let error = result.as_ref().err().map(ToString::to_string);
        match &error {
            None => tracing::info!(server = %server_id, "reconnected after authorization"),
            Some(e) => tracing::warn!(server = %server_id, error = %e, "reconnect after authorization failed"),
        }
        self.inner.events.emit(McpEvent::AuthReconnectComplete {
            id: server_id,
            success: error.is_none(),
            error,
        });
    }
}

/// Text of the first `text` content block in a `tools/call` result.
fn first_text_content(result: &serde_json::Value) -> Option<String> {
    result
        .get("content")?
        .as_array()?
        .iter()
        .find(|block| block.get("type").and_then(|t| t.as_str()) == Some("text"))
        .and_then(|block| block.get("text"))
        .and_then(|t| t.as_str())
        .map(String::from)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::types::TransportKind;
    use crate::oauth::TokenSet;

    fn client_with(options: McpClientOptions) -> McpClient {
        McpClient::new(options, CommandResolver::new(None, None), None)
    }

    fn client() -> McpClient {
        client_with(McpClientOptions::default())
    }

    #[test]
    fn test_first_text_content() {
        let result = serde_json::json!({
            "content": [
                {"type": "image", "data": "..."},
                {"type": "text", "text": "boom"}
            ],
            "isError": true
        });
        assert_eq!(first_text_content(&result).as_deref(), Some("boom"));
        assert_eq!(first_text_content(&serde_json::json!({})), None);
    }

    #[tokio::test]
    async fn test_disconnect_unknown_is_noop() {
        let client = client();
        let mut events = client.subscribe();
        client.disconnect("nope").await;
        assert!(client.connected_ids().await.is_empty());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invalid_config_fails_fast() {
        let client = client();
        let config = ServerConnectionConfig::network("remote", TransportKind::Sse, "ftp://x");
        let err = client
            .connect(config, CredentialProvider::Interactive)
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::InvalidConfig { .. }));
    }

    #[tokio::test]
    async fn test_call_unknown_tool() {
        let client = client();
        let err = client
            .call_tool("nothing", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::UnknownTool { .. }));
    }

    #[tokio::test]
    async fn test_start_authorization_without_oauth() {
        let client = client();
        let err = client.start_authorization("remote", None).await.unwrap_err();
        assert!(matches!(err, McpError::AuthorizationFailed { .. }));
    }

    // ─── Subprocess Servers ──────────────────────────────────────────

    #[cfg(unix)]
    mod subprocess {
        use super::*;
        use std::path::Path;
        use tempfile::TempDir;

        /// A line-oriented MCP server. `tools/list` is answered only for the
        /// first `list_limit` requests so probes can be made to hang. The
        /// `slow` tool answers after a second without blocking other requests.
        fn fake_server(dir: &Path, list_limit: u32) -> ServerConnectionConfig {
            let script = format!(
                r#"n=0
echo "fake server starting" >&2
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"protocolVersion":"2025-03-26","capabilities":{{}},"serverInfo":{{"name":"fake","version":"1"}}}}}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      n=$((n+1))
      if [ "$n" -le {list_limit} ]; then
        printf '{{"jsonrpc":"2.0","id":%s,"result":{{"tools":[{{"name":"echo","description":"stale"}},{{"name":"slow","description":"Answers after a second"}},{{"name":"echo","description":"Echo text","inputSchema":{{"type":"object","required":["text"]}}}}]}}}}\n' "$id"
      fi ;;
    *'"method":"tools/call"'*'"name":"slow"'*)
      ( sleep 1; printf '{{"jsonrpc":"2.0","id":%s,"result":{{"content":[{{"type":"text","text":"done"}}]}}}}\n' "$id" ) & ;;
    *'"method":"tools/call"'*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"content":[{{"type":"text","text":"pong"}}]}}}}\n' "$id" ;;
  esac
done
"#
            );
            let path = dir.join("server.sh");
            std::fs::write(&path, script).unwrap();
            ServerConnectionConfig::subprocess("fake", "/bin/sh", &[path.to_str().unwrap()])
        }

        async fn next_status(rx: &mut broadcast::Receiver<McpEvent>) -> Vec<String> {
            loop {
                let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                    .await
                    .expect("no status event")
                    .unwrap();
                if let McpEvent::Status { connected_ids, .. } = event {
                    return connected_ids;
                }
            }
        }

        fn process_alive(pid: u32) -> bool {
            std::process::Command::new("kill")
                .args(["-0", &pid.to_string()])
                .status()
                .map(|s| s.success())
                .unwrap_or(false)
        }

        #[tokio::test]
        async fn test_connect_registers_tools_and_logs() {
            let tmp = TempDir::new().unwrap();
            let client = client();
            let mut events = client.subscribe();

            let tools = client
                .connect(fake_server(tmp.path(), 100), CredentialProvider::Interactive)
                .await
                .unwrap();
            assert_eq!(tools.len(), 2);
            assert_eq!(tools[0].server_id, "fake");
            assert_eq!(tools[0].description, "Echo text");
            assert_eq!(next_status(&mut events).await, vec!["fake".to_string()]);
            assert_eq!(client.get_tools().await, tools);

            for _ in 0..50 {
                if !client.get_logs("fake").is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            assert_eq!(client.get_logs("fake"), vec!["fake server starting".to_string()]);

            let result = client
                .call_tool("fake.echo", serde_json::json!({"text": "hi"}))
                .await
                .unwrap();
            assert!(result.success);
            assert_eq!(result.server_id, "fake");

            let missing = client.call_tool("echo", serde_json::json!({})).await;
            assert!(matches!(missing, Err(McpError::InvalidArguments { .. })));

            client.shutdown_all().await;
            assert!(client.connected_ids().await.is_empty());
            assert!(client.get_tools().await.is_empty());
        }

        #[tokio::test]
        async fn test_connect_twice_leaves_one_connection() {
            let tmp = TempDir::new().unwrap();
            let client = client();
            let config = fake_server(tmp.path(), 100);

            client
                .connect(config.clone(), CredentialProvider::Interactive)
                .await
                .unwrap();
            let first_pid = {
                let state = client.inner.state.lock().await;
                state.connections["fake"].pid().unwrap()
            };

            client
                .connect(config, CredentialProvider::Interactive)
                .await
                .unwrap();

            assert_eq!(client.connected_ids().await, vec!["fake".to_string()]);
            assert_eq!(client.get_tools().await.len(), 2);
            {
                let state = client.inner.state.lock().await;
                let connection = &state.connections["fake"];
                assert!(connection.has_health_monitor());
                assert_ne!(connection.pid(), Some(first_pid));
            }

            let mut gone = false;
            for _ in 0..100 {
                if !process_alive(first_pid) {
                    gone = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            assert!(gone, "first server process still running");
            client.shutdown_all().await;
        }

        #[tokio::test]
        async fn test_reconnect_releases_prior_monitor_before_next_tick() {
            let tmp = TempDir::new().unwrap();
            let interval = Duration::from_millis(300);
            let client = client_with(McpClientOptions {
                health_interval: interval,
                probe_timeout: Duration::from_millis(500),
                ..McpClientOptions::default()
            });
            let mut events = client.subscribe();
            let config = fake_server(tmp.path(), 100);

            client
                .connect(config.clone(), CredentialProvider::Interactive)
                .await
                .unwrap();
            assert_eq!(next_status(&mut events).await, vec!["fake".to_string()]);
            // Only the connection and its monitor hold the transport.
            let first_transport = {
                let state = client.inner.state.lock().await;
                Arc::downgrade(&state.connections["fake"].transport())
            };

            client
                .connect(config, CredentialProvider::Interactive)
                .await
                .unwrap();
            let replaced_at = Instant::now();
            assert!(next_status(&mut events).await.is_empty());
            assert_eq!(next_status(&mut events).await, vec!["fake".to_string()]);

            let mut released = false;
            while replaced_at.elapsed() < interval / 3 {
                if first_transport.upgrade().is_none() {
                    released = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            assert!(released, "first health monitor still holds its transport");

            // Several probe intervals later the new connection is untouched.
            let second_pid = {
                let state = client.inner.state.lock().await;
                state.connections["fake"].pid()
            };
            tokio::time::sleep(interval * 3).await;
            while let Ok(event) = events.try_recv() {
                assert!(!matches!(event, McpEvent::Status { .. }), "unexpected {event:?}");
            }
            let state = client.inner.state.lock().await;
            let connection = &state.connections["fake"];
            assert!(connection.has_health_monitor());
            assert_eq!(connection.pid(), second_pid);
            drop(state);
            client.shutdown_all().await;
        }

        #[tokio::test]
        async fn test_health_check_answered_during_slow_call() {
            let tmp = TempDir::new().unwrap();
            let client = client_with(McpClientOptions {
                health_interval: Duration::from_millis(100),
                probe_timeout: Duration::from_millis(300),
                ..McpClientOptions::default()
            });
            client
                .connect(fake_server(tmp.path(), 100), CredentialProvider::Interactive)
                .await
                .unwrap();

            let result = client
                .call_tool("fake.slow", serde_json::json!({}))
                .await
                .unwrap();
            assert!(result.success);
            assert!(result.execution_time_ms >= 900);
            assert!(client.is_connected("fake").await);
            client.shutdown_all().await;
        }

        #[tokio::test]
        async fn test_call_to_disconnected_server() {
            let tmp = TempDir::new().unwrap();
            let client = client();
            client
                .connect(fake_server(tmp.path(), 100), CredentialProvider::Interactive)
                .await
                .unwrap();
            client.disconnect("fake").await;

            let err = client
                .call_tool("fake.echo", serde_json::json!({"text": "hi"}))
                .await
                .unwrap_err();
            assert!(matches!(err, McpError::ServerNotConnected { ref name } if name == "fake"));

            let err = client
                .call_tool("other.echo", serde_json::json!({"text": "hi"}))
                .await
                .unwrap_err();
            assert!(matches!(err, McpError::UnknownTool { .. }));
        }

        #[tokio::test]
        async fn test_disconnect_during_call() {
            let tmp = TempDir::new().unwrap();
            let client = client();
            client
                .connect(fake_server(tmp.path(), 100), CredentialProvider::Interactive)
                .await
                .unwrap();

            let call = {
                let client = client.clone();
                tokio::spawn(async move { client.call_tool("slow", serde_json::json!({})).await })
            };
            tokio::time::sleep(Duration::from_millis(200)).await;
            client.disconnect("fake").await;

            let err = call.await.unwrap().unwrap_err();
            assert!(matches!(err, McpError::ServerNotConnected { .. }), "{err:?}");
        }

        #[tokio::test]
        async fn test_echo_is_not_an_mcp_server() {
            let client = client();
            let config = ServerConnectionConfig::subprocess("fs", "echo", &["hello"]);
            let err = client
                .connect(config, CredentialProvider::Interactive)
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                McpError::TransportError { .. } | McpError::Timeout { .. }
            ));
            assert!(client.connected_ids().await.is_empty());
            assert!(client.get_tools().await.is_empty());
            assert!(client.pending_authorization_ids().await.is_empty());
        }

        #[tokio::test]
        async fn test_failed_probe_tears_down_once() {
            let tmp = TempDir::new().unwrap();
            let client = client_with(McpClientOptions {
                health_interval: Duration::from_millis(100),
                probe_timeout: Duration::from_millis(200),
                ..McpClientOptions::default()
            });
            let mut events = client.subscribe();

            // Discovery consumes the only answered tools/list; the first probe hangs.
            client
                .connect(fake_server(tmp.path(), 1), CredentialProvider::Interactive)
                .await
                .unwrap();
            assert_eq!(next_status(&mut events).await, vec!["fake".to_string()]);
            assert!(next_status(&mut events).await.is_empty());

            assert!(client.get_tools().await.is_empty());
            assert!(!client.is_connected("fake").await);

            tokio::time::sleep(Duration::from_millis(500)).await;
            let mut extra = 0;
            while let Ok(event) = events.try_recv() {
                if matches!(event, McpEvent::Status { .. }) {
                    extra += 1;
                }
            }
            assert_eq!(extra, 0);
        }

        #[tokio::test]
        async fn test_process_exit_tears_down() {
            let client = client();
            let mut events = client.subscribe();
            let script = r#"read -r line
id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id"
read -r line
read -r line
id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[]}}\n' "$id"
exit 0
"#;
            let config = ServerConnectionConfig::subprocess("short", "/bin/sh", &["-c", script]);

            client
                .connect(config, CredentialProvider::Interactive)
                .await
                .unwrap();
            assert_eq!(next_status(&mut events).await, vec!["short".to_string()]);
            assert!(next_status(&mut events).await.is_empty());
            assert!(!client.is_connected("short").await);
        }
    }

    // ─── Network Servers ─────────────────────────────────────────────

    mod network {
        use super::*;
        use axum::http::{header, HeaderMap, StatusCode};
        use axum::response::{IntoResponse, Response};
        use axum::routing::post;
        use axum::{Json, Router};

        /// Streamable HTTP server that only accepts `Bearer good`.
        async fn mcp_endpoint(headers: HeaderMap, Json(body): Json<serde_json::Value>) -> Response {
            let authorized = headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                == Some("Bearer good");
            if !authorized {
                return (StatusCode::UNAUTHORIZED, [(header::WWW_AUTHENTICATE, "Bearer")]).into_response();
            }
            let Some(id) = body.get("id").cloned() else {
                return StatusCode::ACCEPTED.into_response();
            };
            let result = match body.get("method").and_then(|m| m.as_str()) {
                Some("initialize") => serde_json::json!({
                    "protocolVersion": "2025-03-26",
                    "capabilities": {},
                    "serverInfo": {"name": "remote", "version": "1"}
                }),
                Some("tools/list") => serde_json::json!({
                    "tools": [{"name": "search", "inputSchema": {"type": "object"}}]
                }),
                _ => serde_json::json!({}),
            };
            Json(serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result})).into_response()
        }

        async fn start_server() -> String {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let url = format!("http://{}/mcp", listener.local_addr().unwrap());
            let app = Router::new().route("/mcp", post(mcp_endpoint));
            tokio::spawn(async move {
                let _ = axum::serve(listener, app).await;
            });
            url
        }

        #[tokio::test]
        async fn test_unauthorized_parks_config() {
            let url = start_server().await;
            let client = client();
            let config = ServerConnectionConfig::network("remote", TransportKind::StreamingHttp, &url);

            let err = client
                .connect(config, CredentialProvider::Interactive)
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                McpError::AuthorizationRequired {
                    stale_credential: false,
                    ..
                }
            ));
            assert_eq!(client.pending_authorization_ids().await, vec!["remote".to_string()]);
            assert!(client.connected_ids().await.is_empty());
        }

        #[tokio::test]
        async fn test_rejected_static_credential_is_stale() {
            let url = start_server().await;
            let client = client();
            let config = ServerConnectionConfig::network("remote", TransportKind::StreamingHttp, &url);

            let err = client
                .connect(config, CredentialProvider::Static(TokenSet::bearer("bad")))
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                McpError::AuthorizationRequired {
                    stale_credential: true,
                    ..
                }
            ));
        }

        struct NoBrowser;

        impl crate::oauth::BrowserLauncher for NoBrowser {
            fn open(&self, _url: &str) -> Result<(), crate::oauth::OAuthError> {
                Ok(())
            }
        }

        fn client_with_auth() -> McpClient {
            let store = Arc::new(CredentialStore::open_in_memory().unwrap());
            let (tx, _rx) = mpsc::unbounded_channel();
            let auth = OAuthManager::new(store, Arc::new(NoBrowser), tx);
            McpClient::new(
                McpClientOptions::default(),
                CommandResolver::new(None, None),
                Some(Arc::new(auth)),
            )
        }

        #[tokio::test]
        async fn test_start_authorization_url_override() {
            let client = client_with_auth();

            let err = client.start_authorization("remote", None).await.unwrap_err();
            assert!(err.to_string().contains("no server url"), "{err}");

            // The given url is used even with nothing parked; discovery then fails.
            let err = client
                .start_authorization("remote", Some("http://127.0.0.1:9/mcp"))
                .await
                .unwrap_err();
            assert!(matches!(err, McpError::AuthorizationFailed { .. }));
            assert!(!err.to_string().contains("no server url"), "{err}");
        }

        #[tokio::test]
        async fn test_failed_authorization_is_reported() {
            let url = start_server().await;
            let client = client();
            let mut events = client.subscribe();
            let config = ServerConnectionConfig::network("remote", TransportKind::StreamingHttp, &url);
            let _ = client.connect(config, CredentialProvider::Interactive).await;

            client
                .complete_authorization(AuthorizationComplete {
                    server_id: "remote".into(),
                    result: Err("token request failed with HTTP 400: invalid_grant".into()),
                })
                .await;

            let mut reported = None;
            while let Ok(event) = events.try_recv() {
                if let McpEvent::AuthReconnectComplete { id, success, error } = event {
                    reported = Some((id, success, error));
                }
            }
            let (id, success, error) = reported.expect("no authorization outcome event");
            assert_eq!(id, "remote");
            assert!(!success);
            assert!(error.unwrap().contains("HTTP 400"));
            assert_eq!(client.pending_authorization_ids().await, vec!["remote".to_string()]);
            assert!(client.connected_ids().await.is_empty());
        }

        #[tokio::test]
        async fn test_completed_authorization_reconnects() {
            let url = start_server().await;
            let client = client();
            let mut events = client.subscribe();
            let config = ServerConnectionConfig::network("remote", TransportKind::StreamingHttp, &url);
            let _ = client.connect(config, CredentialProvider::Interactive).await;

            client
                .complete_authorization(AuthorizationComplete {
                    server_id: "remote".into(),
                    result: Ok(TokenSet::bearer("good")),
                })
                .await;

            let mut reconnect = None;
            while let Ok(event) = events.try_recv() {
                if let McpEvent::AuthReconnectComplete { id, success, error } = event {
                    reconnect = Some((id, success, error));
                }
            }
            assert_eq!(reconnect, Some(("remote".to_string(), true, None)));
            assert_eq!(client.connected_ids().await, vec!["remote".to_string()]);
            assert!(client.pending_authorization_ids().await.is_empty());
            assert_eq!(client.get_tools().await[0].name, "search");
            client.shutdown_all().await;
        }
    }
}
