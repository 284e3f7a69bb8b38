//! A live connection and the background resources it owns.
//!
//! [`Connection::teardown`] is the only routine that stops a connection's
//! health monitor, log listener and process. Dropping a connection without
//! tearing it down still aborts its tasks and kills its process.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::lifecycle::{OpenedTransport, ProcessHandle};
use super::transport::Transport;
use super::types::ToolDescriptor;

/// Upper bound on closing a transport during teardown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

// ─── TaskGuard ───────────────────────────────────────────────────────────────

/// A spawned background task that is aborted when the guard is dropped.
#[derive(Debug)]
pub struct TaskGuard(JoinHandle<()>);

impl TaskGuard {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self(tokio::spawn(future))
    }

    pub fn abort(&self) {
        self.0.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

// ─── Connection ──────────────────────────────────────────────────────────────

/// One live, handshaken connection to an MCP server.
pub struct Connection {
    pub server_id: String,
    /// Generation stamp; a stale task holding an older epoch must not touch
    /// a newer connection stored under the same id.
    pub epoch: u64,
    transport: Arc<Transport>,
    pub tools: Vec<ToolDescriptor>,
    pub created_at: DateTime<Utc>,
    health: Option<TaskGuard>,
    log_listener: Option<TaskGuard>,
    process: Option<ProcessHandle>,
    /// Handed to the health monitor when it starts.
    exit_signal: Option<oneshot::Receiver<String>>,
}

impl Connection {
    pub fn new(server_id: &str, epoch: u64, opened: OpenedTransport) -> Self {
        let OpenedTransport {
            transport,
            process,
            log_listener,
            exit_rx,
        } = opened;
        Self {
            server_id: server_id.to_string(),
            epoch,
            transport: Arc::new(transport),
            tools: Vec::new(),
            created_at: Utc::now(),
            health: None,
            log_listener,
            process,
            exit_signal: exit_rx,
        }
    }

    pub fn transport(&self) -> Arc<Transport> {
        Arc::clone(&self.transport)
    }

    /// Process-exit notification, available once.
    pub fn take_exit_signal(&mut self) -> Option<oneshot::Receiver<String>> {
        self.exit_signal.take()
    }

    /// Install the health monitor. A previous monitor is aborted.
    pub fn set_health_monitor(&mut self, monitor: TaskGuard) {
        if let Some(previous) = self.health.replace(monitor) {
            previous.abort();
        }
    }

    pub fn has_health_monitor(&self) -> bool {
        self.health.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(ProcessHandle::pid)
    }

    /// Release everything this connection owns. Never fails.
    ///
    /// The health monitor is cancelled before anything else so it cannot
    /// fire against a half-closed transport.
    pub async fn teardown(mut self) {
        if let Some(health) = self.health.take() {
            health.abort();
        }
        if let Some(listener) = self.log_listener.take() {
            listener.abort();
        }
        if let Some(process) = self.process.take() {
            process.shutdown();
        }
        if tokio::time::timeout(CLOSE_TIMEOUT, self.transport.close())
            .await
            .is_err()
        {
            tracing::debug!(server = %self.server_id, "transport close timed out");
        }
        tracing::info!(
            server = %self.server_id,
            transport = self.transport.kind(),
            uptime_secs = (Utc::now() - self.created_at).num_seconds(),
            "connection torn down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_task_guard_aborts_on_drop() {
        let (tx, rx) = oneshot::channel::<()>();
        let guard = TaskGuard::spawn(async move {
            let _tx = tx;
            std::future::pending::<()>().await;
        });
        assert!(!guard.is_finished());
        drop(guard);
        // The sender is dropped once the aborted task is cleaned up.
        assert!(tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_teardown_stops_process_and_monitor() {
        use super::super::events::EventBus;
        use super::super::lifecycle::{open_transport, SpawnContext};
        use super::super::logs::LogStore;
        use super::super::types::ServerConnectionConfig;
        use crate::resolver::CommandResolver;

        let resolver = CommandResolver::new(None, None);
        let logs = LogStore::new();
        let events = EventBus::new();
        let ctx = SpawnContext {
            resolver: &resolver,
            logs: &logs,
            events: &events,
        };
        let cfg = ServerConnectionConfig::subprocess("cat", "/bin/cat", &[]);
        let opened = open_transport(&cfg, None, &ctx).await.unwrap();

        let mut connection = Connection::new("cat", 7, opened);
        let pid = connection.pid().unwrap();
        connection.set_health_monitor(TaskGuard::spawn(std::future::pending()));
        assert!(connection.has_health_monitor());

        connection.teardown().await;

        let mut alive = true;
        for _ in 0..100 {
            alive = std::process::Command::new("kill")
                .args(["-0", &pid.to_string()])
                .status()
                .map(|s| s.success())
                .unwrap_or(false);
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!alive, "process {pid} survived teardown");
    }
}
