//! In-process protocol engine.
//!
//! Sessions are backed by a plain channel that the owner of the engine
//! drives by hand: pairing codes, opens, closes and inbound messages are
//! pushed with [`LoopbackEngine::emit`], and every send is recorded. With
//! [`LoopbackEngine::auto`] the engine plays a phone that scans each code
//! after a delay, which is enough to exercise a deployment end to end.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::debug;

use switchboard_core::engine::{
    CredentialBlob, EngineEvent, EngineSession, MessagePayload, ProtocolEngine, ProtocolMessage,
    SentMessage, SessionHandle,
};
use switchboard_core::errors::ProtocolError;
use switchboard_core::ids::InstanceId;
use switchboard_core::status::Direction;

const EVENT_BUFFER: usize = 64;

pub struct LoopbackSession {
    events: Mutex<Option<mpsc::Sender<EngineEvent>>>,
    sent: Mutex<Vec<(String, String)>>,
    send_failure: Mutex<Option<ProtocolError>>,
    next_id: Mutex<Option<String>>,
    next_send: AtomicU64,
    closed: AtomicBool,
    logged_out: AtomicBool,
}

impl LoopbackSession {
    fn new(events: mpsc::Sender<EngineEvent>) -> Self {
        Self {
            events: Mutex::new(Some(events)),
            sent: Mutex::new(Vec::new()),
            send_failure: Mutex::new(None),
            next_id: Mutex::new(None),
            next_send: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            logged_out: AtomicBool::new(false),
        }
    }

    /// Deliver an event to the consumer. False once the stream is gone.
    pub async fn push(&self, event: EngineEvent) -> bool {
        let Some(tx) = self.events.lock().clone() else {
            return false;
        };
        tx.send(event).await.is_ok()
    }

    /// `(address, content)` pairs accepted by `send`, oldest first.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }

    /// Make the next `send` fail with `err`.
    pub fn fail_next_send(&self, err: ProtocolError) {
        *self.send_failure.lock() = Some(err);
    }

    /// Make the next successful `send` report `id` as its message id.
    pub fn assign_next_id(&self, id: impl Into<String>) {
        *self.next_id.lock() = Some(id.into());
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_logged_out(&self) -> bool {
        self.logged_out.load(Ordering::SeqCst)
    }

    fn hang_up(&self) {
        self.events.lock().take();
    }
}

#[async_trait]
impl SessionHandle for LoopbackSession {
    async fn send(&self, address: &str, content: &str) -> Result<SentMessage, ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::SessionClosed);
        }
        if let Some(err) = self.send_failure.lock().take() {
            return Err(err);
        }
        let seq = self.next_send.fetch_add(1, Ordering::Relaxed);
        self.sent.lock().push((address.to_string(), content.to_string()));
        let external_message_id = self
            .next_id
            .lock()
            .take()
            .unwrap_or_else(|| format!("LB{:012X}{seq:04}", rand::random::<u64>() >> 16));
        Ok(SentMessage { external_message_id })
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    async fn logout(&self) -> Result<(), ProtocolError> {
        self.logged_out.store(true, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct LoopbackEngine {
    sessions: DashMap<InstanceId, Arc<LoopbackSession>>,
    opens: DashMap<InstanceId, Vec<Option<String>>>,
    open_failure: Mutex<Option<ProtocolError>>,
    approve_after: Option<Duration>,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine that pairs on its own: every fresh session gets a code and
    /// is linked to a generated number after `approve_after`; sessions
    /// opened with credentials connect straight away.
    pub fn auto(approve_after: Duration) -> Self {
        Self {
            approve_after: Some(approve_after),
            ..Self::default()
        }
    }

    /// Most recently opened session of the instance.
    pub fn session(&self, instance_id: &InstanceId) -> Option<Arc<LoopbackSession>> {
        self.sessions.get(instance_id).map(|s| s.clone())
    }

    pub async fn emit(&self, instance_id: &InstanceId, event: EngineEvent) -> bool {
        match self.session(instance_id) {
            Some(session) => session.push(event).await,
            None => false,
        }
    }

    /// Simulate a successful scan: rotate credentials, then open.
    pub async fn approve(&self, instance_id: &InstanceId, linked_address: &str) {
        self.emit(
            instance_id,
            EngineEvent::CredentialsUpdated(CredentialBlob::new(linked_address)),
        )
        .await;
        self.emit(
            instance_id,
            EngineEvent::Open {
                linked_address: linked_address.to_string(),
            },
        )
        .await;
    }

    /// Drop the event stream of the current session without a close event.
    pub fn hang_up(&self, instance_id: &InstanceId) {
        if let Some(session) = self.session(instance_id) {
            session.hang_up();
        }
    }

    pub fn fail_next_open(&self, err: ProtocolError) {
        *self.open_failure.lock() = Some(err);
    }

    pub fn open_count(&self, instance_id: &InstanceId) -> usize {
        self.opens.get(instance_id).map_or(0, |o| o.len())
    }

    /// Credentials passed to each successful `open`, oldest first.
    pub fn opened_with(&self, instance_id: &InstanceId) -> Vec<Option<String>> {
        self.opens
            .get(instance_id)
            .map(|o| o.clone())
            .unwrap_or_default()
    }

    fn spawn_auto_pairing(
        tx: mpsc::Sender<EngineEvent>,
        credentials: Option<String>,
        approve_after: Duration,
    ) {
        let (code, linked) = {
            let mut rng = rand::thread_rng();
            let code: String = (&mut rng)
                .sample_iter(&Alphanumeric)
                .take(8)
                .map(char::from)
                .collect::<String>()
                .to_ascii_uppercase();
            let linked = format!("1555{:07}", rng.gen_range(0..10_000_000u32));
            (code, linked)
        };

        tokio::spawn(async move {
            if let Some(linked) = credentials {
                let _ = tx.send(EngineEvent::Open { linked_address: linked }).await;
                return;
            }
            if tx.send(EngineEvent::Pairing { code }).await.is_err() {
                return;
            }
            tokio::time::sleep(approve_after).await;
            let _ = tx
                .send(EngineEvent::CredentialsUpdated(CredentialBlob::new(linked.clone())))
                .await;
            let _ = tx.send(EngineEvent::Open { linked_address: linked }).await;
        });
    }
}

#[async_trait]
impl ProtocolEngine for LoopbackEngine {
    fn name(&self) -> &str {
        "loopback"
    }

    async fn open(
        &self,
        instance_id: &InstanceId,
        credentials: Option<CredentialBlob>,
    ) -> Result<EngineSession, ProtocolError> {
        if let Some(err) = self.open_failure.lock().take() {
            return Err(err);
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let session = Arc::new(LoopbackSession::new(tx.clone()));
        let credentials = credentials.map(|c| c.expose().to_string());

        self.opens
            .entry(instance_id.clone())
            .or_default()
            .push(credentials.clone());
        self.sessions.insert(instance_id.clone(), session.clone());
        debug!(instance_id = %instance_id, resuming = credentials.is_some(), "loopback session opened");

        if let Some(delay) = self.approve_after {
            Self::spawn_auto_pairing(tx, credentials, delay);
        }

        Ok(EngineSession {
            handle: session,
            events: rx,
        })
    }
}

/// Inbound text message from `from`, stamped now.
pub fn inbound_text(from: &str, external_message_id: &str, text: &str) -> ProtocolMessage {
    ProtocolMessage {
        direction: Direction::Inbound,
        remote_address: from.to_string(),
        external_message_id: external_message_id.to_string(),
        payload: MessagePayload::Text(text.to_string()),
        push_name: None,
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_opens_and_sends() {
        let engine = LoopbackEngine::new();
        let id = InstanceId::from_raw("I1");
        let session = engine.open(&id, Some(CredentialBlob::new("555"))).await.unwrap();

        let first = session.handle.send("5559999", "a").await.unwrap();
        let second = session.handle.send("5559999", "b").await.unwrap();
        assert_ne!(first.external_message_id, second.external_message_id);

        assert_eq!(engine.open_count(&id), 1);
        assert_eq!(engine.opened_with(&id), vec![Some("555".to_string())]);
        assert_eq!(engine.session(&id).unwrap().sent().len(), 2);
    }

    #[tokio::test]
    async fn injected_failures_fire_once() {
        let engine = LoopbackEngine::new();
        let id = InstanceId::from_raw("I1");
        engine.fail_next_open(ProtocolError::Timeout);
        assert!(engine.open(&id, None).await.is_err());
        let session = engine.open(&id, None).await.unwrap();

        let loopback = engine.session(&id).unwrap();
        loopback.fail_next_send(ProtocolError::SendRejected("no".into()));
        assert!(session.handle.send("1", "x").await.is_err());
        assert!(session.handle.send("1", "x").await.is_ok());

        session.handle.close().await;
        assert!(matches!(
            session.handle.send("1", "x").await,
            Err(ProtocolError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn emit_reaches_the_event_stream() {
        let engine = LoopbackEngine::new();
        let id = InstanceId::from_raw("I1");
        let mut session = engine.open(&id, None).await.unwrap();

        assert!(engine.emit(&id, EngineEvent::Pairing { code: "X".into() }).await);
        assert!(matches!(session.events.recv().await, Some(EngineEvent::Pairing { .. })));

        engine.hang_up(&id);
        assert!(session.events.recv().await.is_none());
        assert!(!engine.emit(&id, EngineEvent::Pairing { code: "Y".into() }).await);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_mode_pairs_then_opens() {
        let engine = LoopbackEngine::auto(Duration::from_secs(3));
        let id = InstanceId::from_raw("I1");
        let mut session = engine.open(&id, None).await.unwrap();

        let Some(EngineEvent::Pairing { code }) = session.events.recv().await else {
            panic!("expected a pairing code");
        };
        assert_eq!(code.len(), 8);
        assert!(matches!(
            session.events.recv().await,
            Some(EngineEvent::CredentialsUpdated(_))
        ));
        let Some(EngineEvent::Open { linked_address }) = session.events.recv().await else {
            panic!("expected open");
        };
        assert!(linked_address.starts_with("1555"));
    }

    #[tokio::test]
    async fn auto_mode_resumes_with_credentials() {
        let engine = LoopbackEngine::auto(Duration::from_secs(3));
        let id = InstanceId::from_raw("I1");
        let mut session = engine
            .open(&id, Some(CredentialBlob::new("15551230000")))
            .await
            .unwrap();
        let Some(EngineEvent::Open { linked_address }) = session.events.recv().await else {
            panic!("expected open");
        };
        assert_eq!(linked_address, "15551230000");
    }
}
