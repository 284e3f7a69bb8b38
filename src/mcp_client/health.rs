//! Per-connection liveness monitoring.
//!
//! A monitor probes its connection on a fixed interval with a bounded
//! capability query and also watches for the process exiting. The first
//! failure hands a reason to the failure callback and ends the monitor; it
//! never tears anything down itself.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};

use super::connection::TaskGuard;
use super::lifecycle;
use super::transport::Transport;

/// Default interval between liveness probes.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(60);

/// Default bound on a single probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Probe schedule for one monitor.
#[derive(Debug, Clone, Copy)]
pub struct HealthConfig {
    pub interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_HEALTH_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

/// Start monitoring one connection.
///
/// `on_failure` runs at most once, from inside the monitor task. It must not
/// await the teardown of this monitor; hand that work to a new task.
pub fn spawn_health_monitor<F>(
    server_id: String,
    transport: Arc<Transport>,
    exit_signal: Option<oneshot::Receiver<String>>,
    config: HealthConfig,
    on_failure: F,
) -> TaskGuard
where
    F: FnOnce(String) + Send + 'static,
{
    TaskGuard::spawn(async move {
        let mut exit_signal = exit_signal;
        let mut ticker = tokio::time::interval_at(Instant::now() + config.interval, config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match tokio::time::timeout(config.probe_timeout, lifecycle::probe(&transport)).await {
                        Ok(Ok(())) => {
                            tracing::trace!(server = %server_id, "health probe ok");
                        }
                        Ok(Err(e)) => break e.to_string(),
                        Err(_) => {
                            break format!(
                                "probe timed out after {}ms",
                                config.probe_timeout.as_millis()
                            )
                        }
                    }
                }
                reason = process_exit(&mut exit_signal) => break reason,
            }
        };

        tracing::warn!(server = %server_id, reason = %reason, "health check failed");
        on_failure(reason);
    })
}

/// Resolves when the process reports an exit. Pends forever if there is no
/// process or its watcher went away without reporting one.
async fn process_exit(signal: &mut Option<oneshot::Receiver<String>>) -> String {
    if let Some(rx) = signal.as_mut() {
        if let Ok(reason) = rx.await {
            return reason;
        }
        *signal = None;
    }
    std::future::pending().await
}
