//! Connection lifecycle steps.
//!
//! Opening transports (spawning subprocesses, dialing network endpoints),
//! the MCP initialization handshake, capability discovery, and the
//! per-launch-class connect timeouts. Each subprocess is owned by a watcher
//! task that reports unexpected exits and kills the process on shutdown.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::oneshot;

use super::connection::TaskGuard;
use super::errors::McpError;
use super::events::{EventBus, McpEvent};
use super::logs::LogStore;
use super::transport::{SseTransport, StdioTransport, StreamableHttpTransport, Transport};
use super::types::{
    initialize_params, InitializeResult, ListToolsResult, ServerConnectionConfig, ToolDescriptor,
    TransportKind,
};
use crate::resolver::CommandResolver;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for graceful shutdown before force-killing.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Stderr lines appended to a failed connect's error message.
const STDERR_CONTEXT_LINES: usize = 20;

/// Stderr context beyond this many chars is truncated.
const STDERR_CONTEXT_MAX_CHARS: usize = 2000;

/// Upper bound on `tools/list` pages followed during discovery.
const MAX_TOOL_PAGES: usize = 100;

/// Launchers that download or install a package before running it.
const PACKAGE_RUNNERS: &[&str] = &["npx", "npm", "pnpm", "pnpx", "yarn", "bunx", "uvx", "pipx"];

/// Language runtimes that load a script before speaking MCP.
const INTERPRETERS: &[&str] = &[
    "node", "python", "python3", "deno", "bun", "uv", "ruby", "php", "java", "dotnet",
];

// ─── Connect Timeouts ────────────────────────────────────────────────────────

/// How a server is launched, which decides how long the handshake may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchClass {
    /// `npx`, `uvx` and friends may fetch a package on first run.
    PackageRunner,
    /// A runtime loading a script.
    Interpreter,
    /// A native binary.
    Native,
    /// An SSE or streaming-HTTP endpoint.
    Network,
}

/// Handshake timeout per launch class.
const CONNECT_TIMEOUTS: [(LaunchClass, Duration); 4] = [
    (LaunchClass::PackageRunner, Duration::from_secs(60)),
    (LaunchClass::Interpreter, Duration::from_secs(30)),
    (LaunchClass::Native, Duration::from_secs(10)),
    (LaunchClass::Network, Duration::from_secs(20)),
];

impl LaunchClass {
    pub fn of(config: &ServerConnectionConfig) -> Self {
        if config.transport.is_network() {
            return LaunchClass::Network;
        }
        let stem = config
            .command
            .as_deref()
            .and_then(|c| Path::new(c).file_stem())
            .and_then(|s| s.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        if PACKAGE_RUNNERS.contains(&stem.as_str()) {
            LaunchClass::PackageRunner
        } else if INTERPRETERS.contains(&stem.as_str()) {
            LaunchClass::Interpreter
        } else {
            LaunchClass::Native
        }
    }

    pub fn connect_timeout(self) -> Duration {
        CONNECT_TIMEOUTS
            .iter()
            .find(|(class, _)| *class == self)
            .map(|(_, timeout)| *timeout)
            .unwrap_or(Duration::from_secs(10))
    }
}

/// Bound on opening the transport plus the initialize handshake.
pub fn connect_timeout(config: &ServerConnectionConfig) -> Duration {
    LaunchClass::of(config).connect_timeout()
}

// ─── ProcessHandle ───────────────────────────────────────────────────────────

/// Control handle for a subprocess owned by its watcher task.
///
/// Dropping the handle has the same effect as [`ProcessHandle::shutdown`].
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the watcher to stop the process: wait briefly for a clean exit
    /// after stdin closes, then kill.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Own `child` until it exits or a shutdown is requested.
///
/// An exit that was not requested is reported on `exit_tx`.
fn spawn_process_watcher(
    server: String,
    mut child: Child,
    exit_tx: oneshot::Sender<String>,
    kill_rx: oneshot::Receiver<()>,
) {
    tokio::spawn(async move {
        tokio::select! {
            status = child.wait() => {
                let reason = match status {
                    Ok(status) => format!("process exited ({status})"),
                    Err(e) => format!("failed to wait on process: {e}"),
                };
                tracing::warn!(server = %server, reason = %reason, "server process exited");
                let _ = exit_tx.send(reason);
            }
            _ = kill_rx => {
                match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
                    Ok(_) => tracing::debug!(server = %server, "server process stopped"),
                    Err(_) => {
                        tracing::warn!(server = %server, "server did not exit in time, killing");
                        let _ = child.kill().await;
                    }
                }
            }
        }
    });
}

/// Forward subprocess stderr into the log store and the event bus.
fn spawn_log_listener(
    server: String,
    stderr: ChildStderr,
    logs: LogStore,
    events: EventBus,
) -> TaskGuard {
    TaskGuard::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    tracing::debug!(server = %server, line = %line, "server stderr");
                    logs.append(&server, &line);
                    events.emit(McpEvent::Log {
                        id: server.clone(),
                        chunk: line,
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(server = %server, error = %e, "stderr read failed");
                    break;
                }
            }
        }
    })
}

// ─── Opening Transports ──────────────────────────────────────────────────────

/// Shared services a connect attempt needs.
pub struct SpawnContext<'a> {
    pub resolver: &'a CommandResolver,
    pub logs: &'a LogStore,
    pub events: &'a EventBus,
}

/// A transport that is open but not yet handshaken, plus what it owns.
///
/// Dropping it kills the process and stops the log listener.
pub struct OpenedTransport {
    pub transport: Transport,
    pub process: Option<ProcessHandle>,
    pub log_listener: Option<TaskGuard>,
    pub exit_rx: Option<oneshot::Receiver<String>>,
}

impl OpenedTransport {
    fn network(transport: Transport) -> Self {
        Self {
            transport,
            process: None,
            log_listener: None,
            exit_rx: None,
        }
    }
}

/// Open the channel described by `config`.
pub async fn open_transport(
    config: &ServerConnectionConfig,
    bearer: Option<&str>,
    ctx: &SpawnContext<'_>,
) -> Result<OpenedTransport, McpError> {
    let missing_url = || McpError::InvalidConfig {
        name: config.id.clone(),
        reason: "network transport requires a url".into(),
    };

    match config.transport {
        TransportKind::Subprocess => spawn_subprocess(config, ctx),
        TransportKind::Sse => {
            let url = config.url.as_deref().ok_or_else(missing_url)?;
            let transport = SseTransport::connect(&config.id, url, &config.headers, bearer).await?;
            Ok(OpenedTransport::network(Transport::Sse(transport)))
        }
        TransportKind::StreamingHttp => {
            let url = config.url.as_deref().ok_or_else(missing_url)?;
            let transport = StreamableHttpTransport::new(&config.id, url, &config.headers, bearer)?;
            Ok(OpenedTransport::network(Transport::Http(transport)))
        }
    }
}

/// Spawn a subprocess server with a resolved executable and augmented PATH.
fn spawn_subprocess(
    config: &ServerConnectionConfig,
    ctx: &SpawnContext<'_>,
) -> Result<OpenedTransport, McpError> {
    let name = config.id.as_str();
    let command = config.command.as_deref().ok_or_else(|| McpError::InvalidConfig {
        name: name.to_string(),
        reason: "subprocess transport requires a command".into(),
    })?;

    let executable = ctx.resolver.resolve(command);
    let mut cmd = Command::new(&executable);
    cmd.args(&config.args);

    // PATH is rebuilt, configured overrides first; everything else passes through.
    let path = ctx
        .resolver
        .augmented_path(config.env.get("PATH").map(String::as_str));
    cmd.env("PATH", path);
    for (key, value) in config.env.iter().filter(|(k, _)| k.as_str() != "PATH") {
        cmd.env(key, value);
    }

    if let Some(dir) = executable.parent().filter(|d| d.is_dir()) {
        cmd.current_dir(dir);
    }

    // Windows: prevent console window from appearing for child processes
    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
        name: name.to_string(),
        reason: format!("{}: {e}", executable.display()),
    })?;

    let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdin".into(),
    })?;
    let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdout".into(),
    })?;
    let log_listener = child.stderr.take().map(|stderr| {
        spawn_log_listener(
            name.to_string(),
            stderr,
            ctx.logs.clone(),
            ctx.events.clone(),
        )
    });

    let pid = child.id();
    let (exit_tx, exit_rx) = oneshot::channel();
    let (kill_tx, kill_rx) = oneshot::channel();
    spawn_process_watcher(name.to_string(), child, exit_tx, kill_rx);

    tracing::info!(
        server = name,
        command = %executable.display(),
        pid = ?pid,
        "spawned MCP server"
    );

    Ok(OpenedTransport {
        transport: Transport::Stdio(StdioTransport::new(name, stdin, stdout)),
        process: Some(ProcessHandle {
            pid,
            kill_tx: Some(kill_tx),
        }),
        log_listener,
        exit_rx: Some(exit_rx),
    })
}

// ─── Protocol Steps ──────────────────────────────────────────────────────────

/// Perform the MCP initialization handshake.
pub async fn handshake(transport: &Transport, server: &str) -> Result<InitializeResult, McpError> {
    let result = transport
        .call("initialize", Some(initialize_params()))
        .await?;

    let init: InitializeResult =
        serde_json::from_value(result).map_err(|e| McpError::TransportError {
            server: server.to_string(),
            reason: format!("failed to parse initialize response: {e}"),
        })?;

    transport.notify("notifications/initialized", None).await?;

    tracing::debug!(
        server,
        protocol = init.protocol_version.as_deref().unwrap_or("unknown"),
        server_name = init
            .server_info
            .as_ref()
            .and_then(|s| s.name.as_deref())
            .unwrap_or("unknown"),
        "handshake complete"
    );
    Ok(init)
}

/// Enumerate the server's tools, following pagination cursors.
pub async fn list_tools(transport: &Transport, server: &str) -> Result<Vec<ToolDescriptor>, McpError> {
    let mut tools = Vec::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_TOOL_PAGES {
        let params = cursor
            .as_ref()
            .map(|c| serde_json::json!({ "cursor": c }));
        let result = transport.call("tools/list", params).await?;
        let page: ListToolsResult =
            serde_json::from_value(result).map_err(|e| McpError::TransportError {
                server: server.to_string(),
                reason: format!("failed to parse tools/list response: {e}"),
            })?;

        tools.extend(
            page.tools
                .into_iter()
                .map(|def| ToolDescriptor::from_definition(server, def)),
        );

        match page.next_cursor {
            Some(next) if !next.is_empty() && cursor.as_deref() != Some(next.as_str()) => {
                cursor = Some(next);
            }
            _ => return Ok(tools),
        }
    }

    tracing::warn!(server, pages = MAX_TOOL_PAGES, "tools/list pagination cut short");
    Ok(tools)
}

/// Liveness probe: the same capability query used during discovery.
pub async fn probe(transport: &Transport) -> Result<(), McpError> {
    transport.call("tools/list", None).await.map(|_| ())
}

// ─── Failure Context ─────────────────────────────────────────────────────────

/// Append recent stderr to errors that stem from the process itself.
pub fn with_stderr_context(err: McpError, stderr_tail: &[String]) -> McpError {
    let suffix = format_stderr_suffix(stderr_tail);
    if suffix.is_empty() {
        return err;
    }
    match err {
        McpError::TransportError { server, reason } => McpError::TransportError {
            server,
            reason: format!("{reason}{suffix}"),
        },
        McpError::SpawnFailed { name, reason } => McpError::SpawnFailed {
            name,
            reason: format!("{reason}{suffix}"),
        },
        other => other,
    }
}

/// Recent stderr lines to attach to a failure.
pub fn stderr_tail(logs: &LogStore, server: &str) -> Vec<String> {
    logs.tail(server, STDERR_CONTEXT_LINES)
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(lines: &[String]) -> String {
    let mut joined = lines.join("\n").trim().to_string();
    if joined.is_empty() {
        return String::new();
    }
    if joined.len() > STDERR_CONTEXT_MAX_CHARS {
        let mut cut = STDERR_CONTEXT_MAX_CHARS;
        while !joined.is_char_boundary(cut) {
            cut -= 1;
        }
        joined.truncate(cut);
        joined.push_str("...(truncated)");
    }
    format!(" | stderr: {joined}")
}

// ─── Tests ───────────────────────────────────────────────────────────────────
