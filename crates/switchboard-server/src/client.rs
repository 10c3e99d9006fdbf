use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use uuid::Uuid;

use switchboard_core::ids::InstanceId;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientId(pub String);

impl Default for ClientId {
    fn default() -> Self {
        Self(format!("client_{}", Uuid::now_v7()))
    }
}

impl ClientId {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A connected WebSocket subscriber.
pub struct Client {
    pub id: ClientId,
    subscriptions: RwLock<HashSet<InstanceId>>,
    tx: mpsc::Sender<String>,
    connected: AtomicBool,
    last_pong: AtomicU64,
}

impl Client {
    fn new(id: ClientId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            subscriptions: RwLock::new(HashSet::new()),
            tx,
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn is_subscribed(&self, instance_id: &InstanceId) -> bool {
        self.subscriptions.read().contains(instance_id)
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < CLIENT_TIMEOUT.as_secs()
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of connected clients and the instances each one follows.
pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<Client>>,
    max_send_queue: usize,
}

impl ClientRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            clients: DashMap::new(),
            max_send_queue,
        }
    }

    pub fn register(&self) -> (ClientId, mpsc::Receiver<String>) {
        let id = ClientId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        self.clients
            .insert(id.clone(), Arc::new(Client::new(id.clone(), tx)));
        (id, rx)
    }

    pub fn unregister(&self, id: &ClientId) {
        if let Some((_, client)) = self.clients.remove(id) {
            client.mark_disconnected();
        }
    }

    /// Start forwarding events of `instance_id` to the client.
    pub fn subscribe(&self, client_id: &ClientId, instance_id: InstanceId) -> bool {
        match self.clients.get(client_id) {
            Some(client) => {
                client.subscriptions.write().insert(instance_id);
                true
            }
            None => false,
        }
    }

    pub fn unsubscribe(&self, client_id: &ClientId, instance_id: &InstanceId) -> bool {
        self.clients
            .get(client_id)
            .is_some_and(|client| client.subscriptions.write().remove(instance_id))
    }

    /// Drop every subscription to a deleted instance.
    pub fn forget_instance(&self, instance_id: &InstanceId) {
        for entry in self.clients.iter() {
            entry.value().subscriptions.write().remove(instance_id);
        }
    }

    /// Queue a message for one client. Full queues drop the message.
    pub fn send_to(&self, client_id: &ClientId, message: String) -> bool {
        let Some(tx) = self.clients.get(client_id).map(|c| c.tx.clone()) else {
            return false;
        };
        match tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(
                    client_id = %client_id,
                    msg_len = msg.len(),
                    "send queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Deliver to every connected client subscribed to the instance.
    /// Returns how many clients accepted the message.
    pub fn broadcast_to_instance(&self, instance_id: &InstanceId, message: &str) -> usize {
        let mut delivered = 0;
        for entry in self.clients.iter() {
            let client = entry.value();
            if client.is_connected()
                && client.is_subscribed(instance_id)
                && client.tx.try_send(message.to_string()).is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }

    pub fn subscribers_of(&self, instance_id: &InstanceId) -> Vec<ClientId> {
        self.clients
            .iter()
            .filter(|entry| entry.value().is_subscribed(instance_id))
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn client(&self, id: &ClientId) -> Option<Arc<Client>> {
        self.clients.get(id).map(|c| Arc::clone(c.value()))
    }

    /// Remove clients that haven't answered pings within the timeout.
    pub fn cleanup_dead_clients(&self) -> usize {
        let dead: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|entry| !entry.value().is_alive())
            .map(|entry| entry.key().clone())
            .collect();

        for id in &dead {
            self.unregister(id);
            tracing::info!(client_id = %id, "cleaned up dead client");
        }
        dead.len()
    }
}

/// Drive one WebSocket: a writer fed from the client queue plus heartbeat
/// pings, and a reader that forwards text frames to the RPC processor.
pub async fn handle_ws_connection(
    socket: WebSocket,
    client_id: ClientId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<ClientRegistry>,
    on_message: mpsc::Sender<(ClientId, String)>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let client = registry.client(&client_id);

    let writer_cid = client_id.clone();
    let writer_client = client.clone();
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::<u8>::new().into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(client_id = %writer_cid, "sent ping");
                }
            }
        }

        if let Some(client) = writer_client {
            client.mark_disconnected();
        }
    });

    let reader_cid = client_id.clone();
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    if on_message
                        .send((reader_cid.clone(), text.to_string()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                WsMessage::Pong(_) => {
                    if let Some(client) = &client {
                        client.record_pong();
                    }
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    registry.unregister(&client_id);
    tracing::info!(client_id = %client_id, "client disconnected");
}

pub fn start_cleanup_task(registry: Arc<ClientRegistry>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = registry.cleanup_dead_clients();
            if removed > 0 {
                tracing::info!(removed, "dead client cleanup");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ids_are_unique() {
        let a = ClientId::new();
        let b = ClientId::new();
        assert_ne!(a, b);
        assert!(a.0.starts_with("client_"));
    }

    #[test]
    fn register_and_unregister() {
        let registry = ClientRegistry::new(32);
        let (id1, _rx1) = registry.register();
        let (id2, _rx2) = registry.register();
        assert_eq!(registry.count(), 2);

        registry.unregister(&id1);
        assert_eq!(registry.count(), 1);
        registry.unregister(&id2);
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn broadcast_reaches_only_subscribers() {
        let registry = ClientRegistry::new(32);
        let (a, mut rx_a) = registry.register();
        let (b, mut rx_b) = registry.register();
        let (_c, mut rx_c) = registry.register();
        let inst = InstanceId::from_raw("i1");

        assert!(registry.subscribe(&a, inst.clone()));
        assert!(registry.subscribe(&b, inst.clone()));
        registry.subscribe(&b, InstanceId::from_raw("i2"));

        assert_eq!(registry.broadcast_to_instance(&inst, "hello"), 2);
        assert_eq!(rx_a.try_recv().unwrap(), "hello");
        assert_eq!(rx_b.try_recv().unwrap(), "hello");
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn unsubscribe_and_forget() {
        let registry = ClientRegistry::new(32);
        let (a, _rx_a) = registry.register();
        let (b, _rx_b) = registry.register();
        let inst = InstanceId::from_raw("i1");
        registry.subscribe(&a, inst.clone());
        registry.subscribe(&b, inst.clone());

        assert!(registry.unsubscribe(&a, &inst));
        assert!(!registry.unsubscribe(&a, &inst));
        assert_eq!(registry.subscribers_of(&inst), vec![b]);

        registry.forget_instance(&inst);
        assert!(registry.subscribers_of(&inst).is_empty());
    }

    #[test]
    fn subscribe_unknown_client_fails() {
        let registry = ClientRegistry::new(32);
        assert!(!registry.subscribe(&ClientId::new(), InstanceId::from_raw("i1")));
    }

    #[test]
    fn send_to_full_queue_drops() {
        let registry = ClientRegistry::new(2);
        let (id, _rx) = registry.register();
        assert!(registry.send_to(&id, "msg1".into()));
        assert!(registry.send_to(&id, "msg2".into()));
        assert!(!registry.send_to(&id, "msg3".into()));
        assert!(!registry.send_to(&ClientId::new(), "msg".into()));
    }

    #[test]
    fn cleanup_dead_clients_removes_expired() {
        let registry = ClientRegistry::new(32);
        let (id, _rx) = registry.register();
        registry.client(&id).unwrap().last_pong.store(0, Ordering::Relaxed);

        assert_eq!(registry.cleanup_dead_clients(), 1);
        assert_eq!(registry.count(), 0);
    }
}
