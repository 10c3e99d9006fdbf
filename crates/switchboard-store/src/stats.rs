use serde::{Deserialize, Serialize};
use tracing::instrument;

use switchboard_core::ids::OwnerId;

use crate::database::Database;
use crate::error::StoreError;

/// Dashboard counters for one tenant.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerStats {
    pub total_instances: u64,
    pub connected_instances: u64,
    pub total_messages: u64,
    pub total_contacts: u64,
}

pub struct StatsRepo {
    db: Database,
}

impl StatsRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(owner_id = %owner_id))]
    pub fn for_owner(&self, owner_id: &OwnerId) -> Result<OwnerStats, StoreError> {
        self.db.with_conn(|conn| {
            let (total_instances, connected_instances): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(status = 'connected'), 0)
                 FROM instances WHERE owner_id = ?1",
                [owner_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let total_messages: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages m
                 JOIN instances i ON i.id = m.instance_id
                 WHERE i.owner_id = ?1",
                [owner_id.as_str()],
                |row| row.get(0),
            )?;
            let total_contacts: i64 = conn.query_row(
                "SELECT COUNT(*) FROM contacts c
                 JOIN instances i ON i.id = c.instance_id
                 WHERE i.owner_id = ?1",
                [owner_id.as_str()],
                |row| row.get(0),
            )?;

            Ok(OwnerStats {
                total_instances: total_instances as u64,
                connected_instances: connected_instances as u64,
                total_messages: total_messages as u64,
                total_contacts: total_contacts as u64,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contacts::ContactRepo;
    use crate::instances::{InstanceRepo, InstanceUpdate};
    use crate::messages::{MessageRepo, NewMessage};
    use chrono::Utc;
    use switchboard_core::status::{Direction, InstanceStatus};

    #[test]
    fn empty_owner_has_zero_counts() {
        let db = Database::in_memory().unwrap();
        let stats = StatsRepo::new(db).for_owner(&OwnerId::new()).unwrap();
        assert_eq!(stats, OwnerStats::default());
    }

    #[test]
    fn counts_only_owned_rows() {
        let db = Database::in_memory().unwrap();
        let instances = InstanceRepo::new(db.clone());
        let contacts = ContactRepo::new(db.clone());
        let messages = MessageRepo::new(db.clone());
        let owner = OwnerId::new();
        let stranger = OwnerId::new();

        let a = instances.create(&owner, "a").unwrap();
        instances.create(&owner, "b").unwrap();
        let theirs = instances.create(&stranger, "c").unwrap();
        instances
            .update(&a.id, &InstanceUpdate::status(InstanceStatus::Connected))
            .unwrap();

        for (inst, ext) in [(&a.id, "m1"), (&a.id, "m2"), (&theirs.id, "m3")] {
            let contact = contacts.upsert(inst, "5559999", None).unwrap();
            messages
                .append(&NewMessage {
                    instance_id: inst,
                    contact_id: &contact.id,
                    direction: Direction::Inbound,
                    external_message_id: ext,
                    content: "hi",
                    created_at: Utc::now(),
                })
                .unwrap();
        }

        let stats = StatsRepo::new(db).for_owner(&owner).unwrap();
        assert_eq!(
            stats,
            OwnerStats {
                total_instances: 2,
                connected_instances: 1,
                total_messages: 2,
                total_contacts: 1,
            }
        );
    }
}
