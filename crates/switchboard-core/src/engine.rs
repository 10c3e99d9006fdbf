//! Contract of the Protocol Session Engine.
//!
//! The engine speaks the wire protocol. The orchestrator only opens
//! sessions, sends through the returned handle, and consumes the event
//! stream; everything protocol-specific stays behind these traits.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;

use crate::errors::{CloseReason, ProtocolError};
use crate::ids::InstanceId;
use crate::status::Direction;

/// Opaque engine-specific key material. Redacted in `Debug`.
#[derive(Clone)]
pub struct CredentialBlob(SecretString);

impl CredentialBlob {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(SecretString::from(raw.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for CredentialBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CredentialBlob([REDACTED])")
    }
}

/// Payload of a protocol message as delivered by the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessagePayload {
    Text(String),
    Media { kind: String, caption: Option<String> },
    Unsupported,
}

/// Text stored for any payload that carries no readable text.
pub const MEDIA_PLACEHOLDER: &str = "[Media]";

impl MessagePayload {
    /// Normalized text for storage, falling back to [`MEDIA_PLACEHOLDER`].
    pub fn text(&self) -> String {
        let text = match self {
            Self::Text(body) => Some(body.as_str()),
            Self::Media { caption, .. } => caption.as_deref(),
            Self::Unsupported => None,
        };
        match text.map(str::trim) {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => MEDIA_PLACEHOLDER.to_string(),
        }
    }
}

/// One message event observed on a live session.
#[derive(Clone, Debug)]
pub struct ProtocolMessage {
    pub direction: Direction,
    pub remote_address: String,
    pub external_message_id: String,
    pub payload: MessagePayload,
    pub push_name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Events emitted by a live engine session, in delivery order.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    Pairing { code: String },
    Open { linked_address: String },
    Close { reason: CloseReason },
    Message(ProtocolMessage),
    /// The engine rotated its key material; must be persisted immediately.
    CredentialsUpdated(CredentialBlob),
}

impl EngineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Pairing { .. } => "pairing",
            Self::Open { .. } => "open",
            Self::Close { .. } => "close",
            Self::Message(_) => "message",
            Self::CredentialsUpdated(_) => "credentials_updated",
        }
    }
}

/// Result of a successful outbound send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentMessage {
    pub external_message_id: String,
}

/// Handle to one live connection.
#[async_trait]
pub trait SessionHandle: Send + Sync {
    async fn send(&self, address: &str, content: &str) -> Result<SentMessage, ProtocolError>;
    /// Close the connection, keeping the credential valid.
    async fn close(&self);
    /// Unlink the device; the credential becomes permanently invalid.
    async fn logout(&self) -> Result<(), ProtocolError>;
}

/// A freshly opened session: its handle plus the ordered event stream.
pub struct EngineSession {
    pub handle: Arc<dyn SessionHandle>,
    pub events: mpsc::Receiver<EngineEvent>,
}

#[async_trait]
pub trait ProtocolEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Open a connection. `None` credentials start a fresh pairing.
    ///
    /// Errors are open-time failures only; negotiation failures arrive
    /// later as `EngineEvent::Close`.
    async fn open(
        &self,
        instance_id: &InstanceId,
        credentials: Option<CredentialBlob>,
    ) -> Result<EngineSession, ProtocolError>;
}
