use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use switchboard_core::ids::{ContactId, InstanceId, MessageId};
use switchboard_core::status::Direction;

use crate::database::Database;
use crate::error::StoreError;
use crate::instances::timestamp;
use crate::columns::Columns;

/// Page size used when a caller does not ask for one.
pub const DEFAULT_LIST_LIMIT: u32 = 100;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: MessageId,
    pub instance_id: InstanceId,
    pub contact_id: ContactId,
    pub direction: Direction,
    pub external_message_id: String,
    pub content: String,
    pub created_at: String,
}

#[derive(Clone, Debug)]
pub struct NewMessage<'a> {
    pub instance_id: &'a InstanceId,
    pub contact_id: &'a ContactId,
    pub direction: Direction,
    /// Protocol-native id; empty when the engine supplied none.
    pub external_message_id: &'a str,
    pub content: &'a str,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted(MessageRow),
    /// A row with the same `(instance_id, external_message_id)` already exists.
    Duplicate,
}

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a message, skipping re-deliveries of a known external id.
    #[instrument(skip(self, msg), fields(instance_id = %msg.instance_id, direction = %msg.direction))]
    pub fn append(&self, msg: &NewMessage<'_>) -> Result<AppendOutcome, StoreError> {
        let id = MessageId::new();
        let created_at = timestamp(msg.created_at);

        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO messages
                    (id, instance_id, contact_id, direction, external_message_id, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    id.as_str(),
                    msg.instance_id.as_str(),
                    msg.contact_id.as_str(),
                    msg.direction.as_str(),
                    msg.external_message_id,
                    msg.content,
                    created_at,
                ],
            )?;

            if changed == 0 {
                debug!(external_message_id = msg.external_message_id, "duplicate message skipped");
                return Ok(AppendOutcome::Duplicate);
            }

            Ok(AppendOutcome::Inserted(MessageRow {
                id,
                instance_id: msg.instance_id.clone(),
                contact_id: msg.contact_id.clone(),
                direction: msg.direction,
                external_message_id: msg.external_message_id.to_string(),
                content: msg.content.to_string(),
                created_at,
            }))
        })
    }

    /// Messages of an instance, newest first, optionally for one contact.
    #[instrument(skip(self), fields(instance_id = %instance_id))]
    pub fn list(
        &self,
        instance_id: &InstanceId,
        contact_id: Option<&ContactId>,
        limit: u32,
    ) -> Result<Vec<MessageRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, instance_id, contact_id, direction, external_message_id, content, created_at
                 FROM messages
                 WHERE instance_id = ?1 AND (?2 IS NULL OR contact_id = ?2)
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?3",
            )?;
            let mut rows = stmt.query(rusqlite::params![
                instance_id.as_str(),
                contact_id.map(|c| c.as_str()),
                limit,
            ])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            Ok(results)
        })
    }

    /// The stored message carrying a protocol-native id.
    #[instrument(skip(self), fields(instance_id = %instance_id))]
    pub fn find_by_external_id(
        &self,
        instance_id: &InstanceId,
        external_message_id: &str,
    ) -> Result<MessageRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, instance_id, contact_id, direction, external_message_id, content, created_at
                 FROM messages
                 WHERE instance_id = ?1 AND external_message_id = ?2
                 ORDER BY created_at
                 LIMIT 1",
            )?;
            let mut rows = stmt.query([instance_id.as_str(), external_message_id])?;
            match rows.next()? {
                Some(row) => row_to_message(row),
                None => Err(StoreError::NotFound(format!(
                    "message {external_message_id} on {instance_id}"
                ))),
            }
        })
    }

    #[instrument(skip(self), fields(instance_id = %instance_id))]
    pub fn count(&self, instance_id: &InstanceId) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE instance_id = ?1",
                [instance_id.as_str()],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<MessageRow, StoreError> {
    let c = Columns::new(row, "messages");
    Ok(MessageRow {
        id: c.parse(0, "id")?,
        instance_id: c.parse(1, "instance_id")?,
        contact_id: c.parse(2, "contact_id")?,
        direction: c.parse(3, "direction")?,
        external_message_id: c.get(4, "external_message_id")?,
        content: c.get(5, "content")?,
        created_at: c.get(6, "created_at")?,
    })
}
