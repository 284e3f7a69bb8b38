//! Response routing for transports that read on a background task.
//!
//! A request registers a waiter under its id before anything is written.
//! The reader task hands each response to the matching waiter, so any
//! number of requests can be in flight on one channel. A waiter removes
//! itself when dropped, which covers requests abandoned by a timeout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;

use super::super::types::JsonRpcResponse;

#[derive(Default)]
struct Waiters {
    senders: HashMap<u64, oneshot::Sender<JsonRpcResponse>>,
    /// Set once the reader stops. No new waiters are accepted after that.
    closed: bool,
}

/// In-flight requests of one transport, by request id.
#[derive(Default)]
pub struct PendingRequests {
    waiters: Mutex<Waiters>,
}

impl PendingRequests {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a waiter for `id`. `None` once the reader has stopped.
    pub fn register(self: &Arc<Self>, id: u64) -> Option<PendingResponse> {
        let mut waiters = self.lock();
        if waiters.closed {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        waiters.senders.insert(id, tx);
        Some(PendingResponse {
            pending: Arc::clone(self),
            id,
            rx,
        })
    }

    /// Hand a response to its waiter. Returns `false` when nobody waits for it.
    pub fn resolve(&self, response: JsonRpcResponse) -> bool {
        let sender = self.lock().senders.remove(&response.id);
        match sender {
            Some(sender) => sender.send(response).is_ok(),
            None => false,
        }
    }

    /// Refuse new waiters and wake the current ones empty-handed.
    pub fn close(&self) {
        let mut waiters = self.lock();
        waiters.closed = true;
        waiters.senders.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Waiters> {
        self.waiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One registered waiter.
pub struct PendingResponse {
    pending: Arc<PendingRequests>,
    id: u64,
    rx: oneshot::Receiver<JsonRpcResponse>,
}

impl PendingResponse {
    /// Wait for the response. `None` if the reader stopped first.
    pub async fn wait(mut self) -> Option<JsonRpcResponse> {
        (&mut self.rx).await.ok()
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.pending.lock().senders.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn response(id: u64) -> JsonRpcResponse {
        JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id,
            method: None,
            result: Some(serde_json::json!({"id": id})),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_responses_reach_their_waiters_in_any_order() {
        let pending = PendingRequests::new();
        let first = pending.register(1).unwrap();
        let second = pending.register(2).unwrap();

        assert!(pending.resolve(response(2)));
        assert!(pending.resolve(response(1)));
        assert!(!pending.resolve(response(3)));

        assert_eq!(second.wait().await.map(|r| r.id), Some(2));
        assert_eq!(first.wait().await.map(|r| r.id), Some(1));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_waiter_is_removed() {
        let pending = PendingRequests::new();
        let waiter = pending.register(7).unwrap();
        assert_eq!(pending.len(), 1);

        let timed_out = tokio::time::timeout(Duration::from_millis(10), waiter.wait()).await;
        assert!(timed_out.is_err());
        assert!(pending.is_empty());
        assert!(!pending.resolve(response(7)));
    }

    #[tokio::test]
    async fn test_close_wakes_waiters_and_refuses_new_ones() {
        let pending = PendingRequests::new();
        let waiter = pending.register(1).unwrap();

        pending.close();
        assert!(waiter.wait().await.is_none());
        assert!(pending.register(2).is_none());
    }
}
