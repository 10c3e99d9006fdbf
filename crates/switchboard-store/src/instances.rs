use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use switchboard_core::engine::CredentialBlob;
use switchboard_core::ids::{InstanceId, OwnerId};
use switchboard_core::status::InstanceStatus;

use crate::database::Database;
use crate::error::StoreError;
use crate::columns::Columns;

/// Timestamps are stored as fixed-width RFC 3339 so they sort lexically.
pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Read-side projection of an instance. The credential blob never leaves
/// the store through this type; only its presence is reported.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRow {
    pub id: InstanceId,
    pub owner_id: OwnerId,
    pub name: String,
    pub status: InstanceStatus,
    pub pairing_code: Option<String>,
    pub linked_phone_number: Option<String>,
    pub has_credentials: bool,
    pub last_connected_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Partial update. `None` leaves a column untouched; for nullable columns
/// `Some(None)` clears it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstanceUpdate {
    pub status: Option<InstanceStatus>,
    pub pairing_code: Option<Option<String>>,
    pub linked_phone_number: Option<Option<String>>,
    pub last_connected_at: Option<DateTime<Utc>>,
}

impl InstanceUpdate {
    pub fn status(status: InstanceStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_pairing_code(mut self, code: Option<String>) -> Self {
        self.pairing_code = Some(code);
        self
    }

    pub fn with_linked_phone_number(mut self, number: Option<String>) -> Self {
        self.linked_phone_number = Some(number);
        self
    }

    pub fn with_last_connected_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_connected_at = Some(at);
        self
    }
}

const SELECT_COLUMNS: &str = "SELECT id, owner_id, name, status, pairing_code, linked_phone_number,
        credentials IS NOT NULL, last_connected_at, created_at, updated_at
 FROM instances";

pub struct InstanceRepo {
    db: Database,
}

impl InstanceRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Provision a new instance: disconnected, no credentials.
    #[instrument(skip(self), fields(owner_id = %owner_id))]
    pub fn create(&self, owner_id: &OwnerId, name: &str) -> Result<InstanceRow, StoreError> {
        let id = InstanceId::new();
        let now = timestamp(Utc::now());

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO instances (id, owner_id, name, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'disconnected', ?4, ?5)",
                rusqlite::params![id.as_str(), owner_id.as_str(), name, now, now],
            )?;

            Ok(InstanceRow {
                id,
                owner_id: owner_id.clone(),
                name: name.to_string(),
                status: InstanceStatus::Disconnected,
                pairing_code: None,
                linked_phone_number: None,
                has_credentials: false,
                last_connected_at: None,
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    #[instrument(skip(self), fields(instance_id = %id))]
    pub fn get(&self, id: &InstanceId) -> Result<InstanceRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_instance(row),
                None => Err(StoreError::NotFound(format!("instance {id}"))),
            }
        })
    }

    /// Instances owned by a tenant, newest first.
    #[instrument(skip(self), fields(owner_id = %owner_id))]
    pub fn list_for_owner(&self, owner_id: &OwnerId) -> Result<Vec<InstanceRow>, StoreError> {
        self.query_rows(
            &format!("{SELECT_COLUMNS} WHERE owner_id = ?1 ORDER BY created_at DESC, id DESC"),
            &[&owner_id.as_str()],
        )
    }

    /// Instances whose persisted status says a session was live or pairing
    /// when the process last ran.
    #[instrument(skip(self))]
    pub fn list_resumable(&self) -> Result<Vec<InstanceRow>, StoreError> {
        self.query_rows(
            &format!(
                "{SELECT_COLUMNS} WHERE status IN ('connected', 'qr_pending') ORDER BY created_at"
            ),
            &[],
        )
    }

    /// Apply a partial update.
    ///
    /// Moving to `connected` or `disconnected` always clears the pairing code.
    #[instrument(skip(self, update), fields(instance_id = %id, status = ?update.status))]
    pub fn update(&self, id: &InstanceId, update: &InstanceUpdate) -> Result<(), StoreError> {
        let mut sets: Vec<&str> = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(status) = update.status {
            sets.push("status");
            params.push(Box::new(status.as_str()));
        }
        let pairing_code = match (&update.pairing_code, update.status) {
            (Some(code), _) => Some(code.clone()),
            (None, Some(InstanceStatus::Connected | InstanceStatus::Disconnected)) => Some(None),
            (None, _) => None,
        };
        if let Some(code) = pairing_code {
            sets.push("pairing_code");
            params.push(Box::new(code));
        }
        if let Some(number) = &update.linked_phone_number {
            sets.push("linked_phone_number");
            params.push(Box::new(number.clone()));
        }
        if let Some(at) = update.last_connected_at {
            sets.push("last_connected_at");
            params.push(Box::new(timestamp(at)));
        }
        sets.push("updated_at");
        params.push(Box::new(timestamp(Utc::now())));

        let assignments: Vec<String> = sets
            .iter()
            .enumerate()
            .map(|(i, col)| format!("{col} = ?{}", i + 1))
            .collect();
        let sql = format!(
            "UPDATE instances SET {} WHERE id = ?{}",
            assignments.join(", "),
            params.len() + 1
        );
        params.push(Box::new(id.as_str().to_string()));

        self.db.with_conn(|conn| {
            let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                params.iter().map(|p| p.as_ref()).collect();
            let changed = conn.execute(&sql, param_refs.as_slice())?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("instance {id}")));
            }
            Ok(())
        })
    }

    /// Seal and persist the credential blob, replacing any previous one.
    #[instrument(skip(self, blob), fields(instance_id = %id))]
    pub fn save_credentials(&self, id: &InstanceId, blob: &CredentialBlob) -> Result<(), StoreError> {
        let sealed = self.db.sealer().seal(blob.expose())?;
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE instances SET credentials = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![sealed, timestamp(Utc::now()), id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("instance {id}")));
            }
            Ok(())
        })
    }

    #[instrument(skip(self), fields(instance_id = %id))]
    pub fn load_credentials(&self, id: &InstanceId) -> Result<Option<CredentialBlob>, StoreError> {
        let sealed: Option<String> = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT credentials FROM instances WHERE id = ?1")?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => Columns::new(row, "instances").get(0, "credentials"),
                None => Err(StoreError::NotFound(format!("instance {id}"))),
            }
        })?;

        match sealed {
            Some(sealed) => Ok(Some(CredentialBlob::new(self.db.sealer().open(&sealed)?))),
            None => Ok(None),
        }
    }

    /// Erase the credential blob. Returns whether one existed.
    #[instrument(skip(self), fields(instance_id = %id))]
    pub fn clear_credentials(&self, id: &InstanceId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE instances SET credentials = NULL, updated_at = ?1
                 WHERE id = ?2 AND credentials IS NOT NULL",
                rusqlite::params![timestamp(Utc::now()), id.as_str()],
            )?;
            Ok(changed > 0)
        })
    }

    /// Delete an instance together with its contacts and messages.
    #[instrument(skip(self), fields(instance_id = %id))]
    pub fn delete(&self, id: &InstanceId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM instances WHERE id = ?1", [id.as_str()])?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("instance {id}")));
            }
            Ok(())
        })
    }

    fn query_rows(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::types::ToSql],
    ) -> Result<Vec<InstanceRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query(params)?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_instance(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_instance(row: &rusqlite::Row<'_>) -> Result<InstanceRow, StoreError> {
    let c = Columns::new(row, "instances");
    Ok(InstanceRow {
        id: c.parse(0, "id")?,
        owner_id: c.parse(1, "owner_id")?,
        name: c.get(2, "name")?,
        status: c.parse(3, "status")?,
        pairing_code: c.get(4, "pairing_code")?,
        linked_phone_number: c.get(5, "linked_phone_number")?,
        has_credentials: c.get(6, "credentials")?,
        last_connected_at: c.get(7, "last_connected_at")?,
        created_at: c.get(8, "created_at")?,
        updated_at: c.get(9, "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Database, InstanceRepo, OwnerId) {
        let db = Database::in_memory().unwrap();
        let repo = InstanceRepo::new(db.clone());
        (db, repo, OwnerId::new())
    }

    #[test]
    fn create_and_get() {
        let (_db, repo, owner) = setup();
        let created = repo.create(&owner, "support line").unwrap();
        assert_eq!(created.status, InstanceStatus::Disconnected);
        assert!(!created.has_credentials);

        let fetched = repo.get(&created.id).unwrap();
        assert_eq!(fetched, created);
    }

    #[test]
    fn get_missing_is_not_found() {
        let (_db, repo, _owner) = setup();
        let err = repo.get(&InstanceId::new()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn list_for_owner_is_scoped() {
        let (_db, repo, owner) = setup();
        let other = OwnerId::new();
        repo.create(&owner, "a").unwrap();
        repo.create(&owner, "b").unwrap();
        repo.create(&other, "c").unwrap();

        let mine = repo.list_for_owner(&owner).unwrap();
        assert_eq!(mine.len(), 2);
        assert!(mine.iter().all(|i| i.owner_id == owner));
    }

    #[test]
    fn partial_update_leaves_other_columns() {
        let (_db, repo, owner) = setup();
        let inst = repo.create(&owner, "x").unwrap();

        repo.update(
            &inst.id,
            &InstanceUpdate::status(InstanceStatus::QrPending).with_pairing_code(Some("CODE1".into())),
        )
        .unwrap();
        let row = repo.get(&inst.id).unwrap();
        assert_eq!(row.status, InstanceStatus::QrPending);
        assert_eq!(row.pairing_code.as_deref(), Some("CODE1"));

        repo.update(
            &inst.id,
            &InstanceUpdate::default().with_linked_phone_number(Some("5551234".into())),
        )
        .unwrap();
        let row = repo.get(&inst.id).unwrap();
        assert_eq!(row.status, InstanceStatus::QrPending);
        assert_eq!(row.pairing_code.as_deref(), Some("CODE1"));
        assert_eq!(row.linked_phone_number.as_deref(), Some("5551234"));
    }

    #[test]
    fn connected_and_disconnected_clear_pairing_code() {
        let (_db, repo, owner) = setup();
        let inst = repo.create(&owner, "x").unwrap();

        for terminal in [InstanceStatus::Connected, InstanceStatus::Disconnected] {
            repo.update(
                &inst.id,
                &InstanceUpdate::status(InstanceStatus::QrPending).with_pairing_code(Some("C".into())),
            )
            .unwrap();
            repo.update(&inst.id, &InstanceUpdate::status(terminal)).unwrap();
            assert_eq!(repo.get(&inst.id).unwrap().pairing_code, None);
        }
    }

    #[test]
    fn update_missing_is_not_found() {
        let (_db, repo, _owner) = setup();
        let err = repo
            .update(&InstanceId::new(), &InstanceUpdate::status(InstanceStatus::Connected))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn credentials_are_sealed_at_rest() {
        let (db, repo, owner) = setup();
        let inst = repo.create(&owner, "x").unwrap();
        repo.save_credentials(&inst.id, &CredentialBlob::new("noise-key-material"))
            .unwrap();

        let raw: String = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT credentials FROM instances WHERE id = ?1",
                    [inst.id.as_str()],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert!(!raw.contains("noise-key-material"));

        let loaded = repo.load_credentials(&inst.id).unwrap().unwrap();
        assert_eq!(loaded.expose(), "noise-key-material");
        assert!(repo.get(&inst.id).unwrap().has_credentials);
    }

    #[test]
    fn projection_never_carries_the_blob() {
        let (_db, repo, owner) = setup();
        let inst = repo.create(&owner, "x").unwrap();
        repo.save_credentials(&inst.id, &CredentialBlob::new("noise-key-material"))
            .unwrap();
        let json = serde_json::to_string(&repo.get(&inst.id).unwrap()).unwrap();
        assert!(!json.contains("noise-key-material"));
        assert!(json.contains("\"has_credentials\":true"));
    }

    #[test]
    fn clear_credentials_reports_presence() {
        let (_db, repo, owner) = setup();
        let inst = repo.create(&owner, "x").unwrap();
        assert!(!repo.clear_credentials(&inst.id).unwrap());

        repo.save_credentials(&inst.id, &CredentialBlob::new("k")).unwrap();
        assert!(repo.clear_credentials(&inst.id).unwrap());
        assert!(repo.load_credentials(&inst.id).unwrap().is_none());
        assert!(!repo.get(&inst.id).unwrap().has_credentials);
    }

    #[test]
    fn list_resumable_picks_live_statuses() {
        let (_db, repo, owner) = setup();
        let a = repo.create(&owner, "a").unwrap();
        let b = repo.create(&owner, "b").unwrap();
        repo.create(&owner, "c").unwrap();
        repo.update(&a.id, &InstanceUpdate::status(InstanceStatus::Connected)).unwrap();
        repo.update(&b.id, &InstanceUpdate::status(InstanceStatus::QrPending)).unwrap();

        let ids: Vec<InstanceId> = repo.list_resumable().unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a.id));
        assert!(ids.contains(&b.id));
    }

    #[test]
    fn delete_removes_row() {
        let (_db, repo, owner) = setup();
        let inst = repo.create(&owner, "x").unwrap();
        repo.delete(&inst.id).unwrap();
        assert!(repo.get(&inst.id).unwrap_err().is_not_found());
        assert!(repo.delete(&inst.id).unwrap_err().is_not_found());
    }
}
