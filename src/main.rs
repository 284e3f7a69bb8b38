// mcp-conduit: connect the configured MCP servers and stream their events.
//
// Usage: mcp-conduit [SETTINGS_FILE]
//
// Events are written to stdout as JSON lines. Servers that need OAuth open
// the browser; the connection resumes once the redirect arrives.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;

use mcp_conduit::logging::init_tracing;
use mcp_conduit::settings::{load_or_default, settings_path};
use mcp_conduit::{
    credentials_db_path, CommandResolver, CredentialStore, McpClient, McpClientOptions, McpError,
    SystemBrowser,
};

#[tokio::main]
async fn main() -> Result<()> {
    let log_path = init_tracing().context("failed to initialize logging")?;
    eprintln!("logging to {}", log_path.display());

    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(settings_path);
    let settings = load_or_default(&path)?;

    let store = CredentialStore::open(&credentials_db_path())
        .context("failed to open credential store")?;
    let client = McpClient::with_oauth(
        McpClientOptions::default(),
        CommandResolver::default(),
        Arc::new(store),
        Arc::new(SystemBrowser),
    );

    let mut events = client.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => tracing::warn!(error = %e, "failed to serialize event"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event printer fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    for (id, err) in client.connect_all(&settings).await {
        match err {
            McpError::AuthorizationRequired { .. } => match client.start_authorization(&id, None).await {
                Ok(url) => eprintln!("[{id}] authorize in your browser: {url}"),
                Err(e) => eprintln!("[{id}] {e}"),
            },
            other => eprintln!("[{id}] {other}"),
        }
    }
    eprintln!("connected: {}", client.connected_ids().await.join(", "));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    eprintln!("shutting down");
    client.shutdown_all().await;
    printer.abort();
    Ok(())
}
