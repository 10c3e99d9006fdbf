use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use switchboard_core::ids::{ContactId, InstanceId};

use crate::database::Database;
use crate::error::StoreError;
use crate::instances::timestamp;
use crate::columns::Columns;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRow {
    pub id: ContactId,
    pub instance_id: InstanceId,
    pub external_address: String,
    pub display_name: Option<String>,
    pub last_message_at: Option<String>,
    pub created_at: String,
}

const SELECT_COLUMNS: &str =
    "SELECT id, instance_id, external_address, display_name, last_message_at, created_at FROM contacts";

/// Contact side of the ledger. Every call is scoped by instance id.
pub struct ContactRepo {
    db: Database,
}

impl ContactRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Resolve the contact for `(instance_id, external_address)`, creating it
    /// on first sight. A supplied display name replaces the stored one; an
    /// absent one leaves it alone.
    #[instrument(skip(self), fields(instance_id = %instance_id))]
    pub fn upsert(
        &self,
        instance_id: &InstanceId,
        external_address: &str,
        display_name: Option<&str>,
    ) -> Result<ContactRow, StoreError> {
        let id = ContactId::new();
        let now = timestamp(Utc::now());

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO contacts (id, instance_id, external_address, display_name, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (instance_id, external_address) DO UPDATE
                 SET display_name = COALESCE(excluded.display_name, contacts.display_name)",
                rusqlite::params![id.as_str(), instance_id.as_str(), external_address, display_name, now],
            )?;

            let mut stmt = conn.prepare(&format!(
                "{SELECT_COLUMNS} WHERE instance_id = ?1 AND external_address = ?2"
            ))?;
            let mut rows = stmt.query([instance_id.as_str(), external_address])?;
            match rows.next()? {
                Some(row) => row_to_contact(row),
                None => Err(StoreError::NotFound(format!(
                    "contact {external_address} on {instance_id}"
                ))),
            }
        })
    }

    /// Fetch a contact, failing with NotFound unless it belongs to the instance.
    #[instrument(skip(self), fields(instance_id = %instance_id, contact_id = %contact_id))]
    pub fn get(&self, instance_id: &InstanceId, contact_id: &ContactId) -> Result<ContactRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("{SELECT_COLUMNS} WHERE id = ?1 AND instance_id = ?2"))?;
            let mut rows = stmt.query([contact_id.as_str(), instance_id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_contact(row),
                None => Err(StoreError::NotFound(format!("contact {contact_id} on {instance_id}"))),
            }
        })
    }

    /// Contacts of an instance, most recent conversation first.
    #[instrument(skip(self), fields(instance_id = %instance_id))]
    pub fn list(&self, instance_id: &InstanceId) -> Result<Vec<ContactRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_COLUMNS} WHERE instance_id = ?1
                 ORDER BY last_message_at DESC NULLS LAST, created_at DESC"
            ))?;
            let mut rows = stmt.query([instance_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_contact(row)?);
            }
            Ok(results)
        })
    }

    /// Record message activity on a contact.
    #[instrument(skip(self), fields(instance_id = %instance_id, contact_id = %contact_id))]
    pub fn touch(
        &self,
        instance_id: &InstanceId,
        contact_id: &ContactId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE contacts SET last_message_at = ?1 WHERE id = ?2 AND instance_id = ?3",
                rusqlite::params![timestamp(at), contact_id.as_str(), instance_id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("contact {contact_id} on {instance_id}")));
            }
            Ok(())
        })
    }
}

fn row_to_contact(row: &rusqlite::Row<'_>) -> Result<ContactRow, StoreError> {
    let c = Columns::new(row, "contacts");
    Ok(ContactRow {
        id: c.parse(0, "id")?,
        instance_id: c.parse(1, "instance_id")?,
        external_address: c.get(2, "external_address")?,
        display_name: c.get(3, "display_name")?,
        last_message_at: c.get(4, "last_message_at")?,
        created_at: c.get(5, "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instances::InstanceRepo;
    use chrono::TimeZone;
    use switchboard_core::ids::OwnerId;

    fn setup() -> (ContactRepo, InstanceId) {
        let db = Database::in_memory().unwrap();
        let inst = InstanceRepo::new(db.clone()).create(&OwnerId::new(), "x").unwrap();
        (ContactRepo::new(db), inst.id)
    }

    #[test]
    fn upsert_creates_once_per_address() {
        let (repo, inst) = setup();
        let first = repo.upsert(&inst, "5559999", None).unwrap();
        let second = repo.upsert(&inst, "5559999", None).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(repo.list(&inst).unwrap().len(), 1);
    }

    #[test]
    fn upsert_updates_display_name_only_when_given() {
        let (repo, inst) = setup();
        repo.upsert(&inst, "5559999", Some("Ana")).unwrap();
        let row = repo.upsert(&inst, "5559999", None).unwrap();
        assert_eq!(row.display_name.as_deref(), Some("Ana"));
        let row = repo.upsert(&inst, "5559999", Some("Ana B")).unwrap();
        assert_eq!(row.display_name.as_deref(), Some("Ana B"));
    }

    #[test]
    fn same_address_on_two_instances_is_two_contacts() {
        let db = Database::in_memory().unwrap();
        let instances = InstanceRepo::new(db.clone());
        let owner = OwnerId::new();
        let a = instances.create(&owner, "a").unwrap();
        let b = instances.create(&owner, "b").unwrap();
        let repo = ContactRepo::new(db);

        let ca = repo.upsert(&a.id, "5559999", None).unwrap();
        let cb = repo.upsert(&b.id, "5559999", None).unwrap();
        assert_ne!(ca.id, cb.id);
    }

    #[test]
    fn get_is_instance_scoped() {
        let db = Database::in_memory().unwrap();
        let instances = InstanceRepo::new(db.clone());
        let owner = OwnerId::new();
        let a = instances.create(&owner, "a").unwrap();
        let b = instances.create(&owner, "b").unwrap();
        let repo = ContactRepo::new(db);

        let contact = repo.upsert(&a.id, "5559999", None).unwrap();
        assert!(repo.get(&a.id, &contact.id).is_ok());
        assert!(repo.get(&b.id, &contact.id).unwrap_err().is_not_found());
    }

    #[test]
    fn list_orders_by_last_message() {
        let (repo, inst) = setup();
        let old = repo.upsert(&inst, "1111", None).unwrap();
        let recent = repo.upsert(&inst, "2222", None).unwrap();
        let silent = repo.upsert(&inst, "3333", None).unwrap();

        repo.touch(&inst, &old.id, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
            .unwrap();
        repo.touch(&inst, &recent.id, Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap())
            .unwrap();

        let ids: Vec<ContactId> = repo.list(&inst).unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![recent.id, old.id, silent.id]);
    }

    #[test]
    fn touch_unknown_contact_is_not_found() {
        let (repo, inst) = setup();
        let err = repo.touch(&inst, &ContactId::new(), Utc::now()).unwrap_err();
        assert!(err.is_not_found());
    }
}
