//! Inbound message ingestion.
//!
//! Turns one engine message event into ledger rows: scope check, contact
//! resolution, payload normalization, idempotent append, activity touch.
//! Publishing is left to the caller so the pipeline stays store-only.

use tracing::debug;

use switchboard_core::address;
use switchboard_core::engine::ProtocolMessage;
use switchboard_core::ids::{ContactId, InstanceId, MessageId};
use switchboard_core::status::Direction;
use switchboard_store::contacts::ContactRepo;
use switchboard_store::messages::{AppendOutcome, MessageRepo, NewMessage};
use switchboard_store::{Database, StoreError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    Stored {
        contact_id: ContactId,
        message_id: MessageId,
    },
    /// Re-delivery of an already stored external message id.
    Duplicate,
    Skipped(SkipReason),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// Our own traffic echoed back by the engine.
    OutboundEcho,
    /// Group, broadcast or channel traffic.
    NotDirect,
    /// The sender address normalizes to an empty contact key.
    NoAddress,
}

pub struct IngestPipeline {
    contacts: ContactRepo,
    messages: MessageRepo,
}

impl IngestPipeline {
    pub fn new(db: Database) -> Self {
        Self {
            contacts: ContactRepo::new(db.clone()),
            messages: MessageRepo::new(db),
        }
    }

    pub fn ingest(
        &self,
        instance_id: &InstanceId,
        msg: &ProtocolMessage,
    ) -> Result<IngestOutcome, StoreError> {
        if msg.direction == Direction::Outbound {
            return Ok(IngestOutcome::Skipped(SkipReason::OutboundEcho));
        }
        if !address::is_direct(&msg.remote_address) {
            debug!(instance_id = %instance_id, "skipping non-direct message");
            return Ok(IngestOutcome::Skipped(SkipReason::NotDirect));
        }

        let key = address::normalize(&msg.remote_address);
        if key.is_empty() {
            debug!(instance_id = %instance_id, "skipping message without a sender address");
            return Ok(IngestOutcome::Skipped(SkipReason::NoAddress));
        }
        let display_name = msg
            .push_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty());
        let contact = self.contacts.upsert(instance_id, &key, display_name)?;

        let content = msg.payload.text();
        let outcome = self.messages.append(&NewMessage {
            instance_id,
            contact_id: &contact.id,
            direction: Direction::Inbound,
            external_message_id: &msg.external_message_id,
            content: &content,
            created_at: msg.timestamp,
        })?;

        let row = match outcome {
            AppendOutcome::Inserted(row) => row,
            AppendOutcome::Duplicate => return Ok(IngestOutcome::Duplicate),
        };

        self.contacts.touch(instance_id, &contact.id, msg.timestamp)?;

        Ok(IngestOutcome::Stored {
            contact_id: contact.id,
            message_id: row.id,
        })
    }
}
