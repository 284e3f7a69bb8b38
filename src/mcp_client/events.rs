//! Notifications pushed to the presentation layer.

use serde::Serialize;
use tokio::sync::broadcast;

use super::types::ToolDescriptor;

/// Buffered events per subscriber before the slowest one starts lagging.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// One state change visible to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum McpEvent {
    /// The connection set or the aggregated tool list changed.
    Status {
        tools: Vec<ToolDescriptor>,
        connected_ids: Vec<String>,
    },
    /// New stderr output from a subprocess server.
    Log { id: String, chunk: String },
    /// A reconnect attempted after an authorization completed.
    AuthReconnectComplete {
        id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Fan-out of [`McpEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<McpEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<McpEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: McpEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serialization_shape() {
        let event = McpEvent::Status {
            tools: vec![],
            connected_ids: vec!["fs".into()],
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["connectedIds"][0], "fs");
    }

    #[test]
    fn test_auth_reconnect_omits_empty_error() {
        let event = McpEvent::AuthReconnectComplete {
            id: "remote".into(),
            success: true,
            error: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "auth-reconnect-complete");
        assert!(json.get("error").is_none());
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.emit(McpEvent::Log {
            id: "fs".into(),
            chunk: "x".into(),
        });
        let mut rx = bus.subscribe();
        bus.emit(McpEvent::Log {
            id: "fs".into(),
            chunk: "y".into(),
        });
        match rx.recv().await.unwrap() {
            McpEvent::Log { chunk, .. } => assert_eq!(chunk, "y"),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
