use std::sync::Arc;

use tokio::sync::broadcast;

use switchboard_core::events::RelayEvent;

use crate::client::ClientRegistry;

/// Forwards orchestrator events to the WebSocket clients subscribed to
/// the event's instance.
pub struct EventBridge {
    registry: Arc<ClientRegistry>,
}

impl EventBridge {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self { registry }
    }

    pub fn start(&self, mut rx: broadcast::Receiver<RelayEvent>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(&self.registry);

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Some(json) = serialize_event(&event) {
                            registry.broadcast_to_instance(event.instance_id(), &json);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "event bridge lagged, dropped events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("event bridge channel closed");
                        break;
                    }
                }
            }
        })
    }
}

pub fn create_bridge(
    registry: Arc<ClientRegistry>,
    rx: broadcast::Receiver<RelayEvent>,
) -> tokio::task::JoinHandle<()> {
    EventBridge::new(registry).start(rx)
}

/// Wire form of an event: the tagged JSON object.
pub fn serialize_event(event: &RelayEvent) -> Option<String> {
    serde_json::to_string(event).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use switchboard_core::ids::InstanceId;
    use switchboard_core::status::InstanceStatus;

    fn pairing(instance: &str) -> RelayEvent {
        RelayEvent::Pairing {
            instance_id: InstanceId::from_raw(instance),
            code: "ABC".into(),
            cycle: 1,
        }
    }

    #[test]
    fn serializes_tagged_events() {
        let json = serialize_event(&pairing("i1")).unwrap();
        assert!(json.contains("\"type\":\"pairing\""));
        assert!(json.contains("\"instance_id\":\"i1\""));

        let status = RelayEvent::Status {
            instance_id: InstanceId::from_raw("i1"),
            status: InstanceStatus::Connected,
            linked_phone_number: Some("5551234".into()),
            reason: None,
        };
        let json = serialize_event(&status).unwrap();
        assert!(json.contains("\"status\":\"connected\""));
        assert!(!json.contains("reason"));
    }

    #[tokio::test]
    async fn forwards_to_subscribers_only() {
        let registry = Arc::new(ClientRegistry::new(32));
        let (tx, rx) = broadcast::channel(16);

        let (watcher, mut watcher_rx) = registry.register();
        let (other, mut other_rx) = registry.register();
        registry.subscribe(&watcher, InstanceId::from_raw("i1"));
        registry.subscribe(&other, InstanceId::from_raw("i2"));

        let handle = create_bridge(Arc::clone(&registry), rx);
        tx.send(pairing("i1")).unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(1), watcher_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(msg.contains("\"code\":\"ABC\""));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(other_rx.try_recv().is_err());

        handle.abort();
    }
}
