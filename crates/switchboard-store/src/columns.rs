//! Typed column access for the row mappers. Every failure is reported as
//! a corrupt row naming its table and column.

use std::str::FromStr;

use rusqlite::types::FromSql;
use rusqlite::Row;

use crate::error::StoreError;

pub(crate) struct Columns<'r, 's> {
    row: &'r Row<'s>,
    table: &'static str,
}

impl<'r, 's> Columns<'r, 's> {
    pub(crate) fn new(row: &'r Row<'s>, table: &'static str) -> Self {
        Self { row, table }
    }

    fn corrupt(&self, column: &'static str, detail: String) -> StoreError {
        StoreError::CorruptRow {
            table: self.table,
            column,
            detail,
        }
    }

    /// Nullable columns read as `Option<T>`.
    pub(crate) fn get<T: FromSql>(&self, idx: usize, column: &'static str) -> Result<T, StoreError> {
        self.row.get(idx).map_err(|e| self.corrupt(column, e.to_string()))
    }

    /// A text column holding an id or a status keyword.
    pub(crate) fn parse<T: FromStr>(&self, idx: usize, column: &'static str) -> Result<T, StoreError> {
        let raw: String = self.get(idx, column)?;
        raw.parse()
            .map_err(|_| self.corrupt(column, format!("unexpected value {raw:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use switchboard_core::ids::InstanceId;
    use switchboard_core::status::{Direction, InstanceStatus};

    fn read<T>(sql: &str, f: impl FnOnce(&Columns<'_, '_>) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let conn = Connection::open_in_memory().unwrap();
        let mut stmt = conn.prepare(sql).unwrap();
        let mut rows = stmt.query([]).unwrap();
        let row = rows.next().unwrap().unwrap();
        f(&Columns::new(row, "instances"))
    }

    #[test]
    fn parses_ids_and_keywords() {
        let (id, status, direction) = read("SELECT 'inst_1', 'qr_pending', 'outbound'", |c| {
            Ok((
                c.parse::<InstanceId>(0, "id")?,
                c.parse::<InstanceStatus>(1, "status")?,
                c.parse::<Direction>(2, "direction")?,
            ))
        })
        .unwrap();
        assert_eq!(id.as_str(), "inst_1");
        assert_eq!(status, InstanceStatus::QrPending);
        assert_eq!(direction, Direction::Outbound);
    }

    #[test]
    fn unknown_keyword_names_the_column() {
        let err = read("SELECT 'paused'", |c| c.parse::<InstanceStatus>(0, "status")).unwrap_err();
        assert!(matches!(
            err,
            StoreError::CorruptRow { table: "instances", column: "status", ref detail } if detail.contains("paused")
        ));
    }

    #[test]
    fn null_reads_as_none_but_fails_when_required() {
        let code: Option<String> = read("SELECT NULL", |c| c.get(0, "pairing_code")).unwrap();
        assert_eq!(code, None);

        let err = read("SELECT NULL", |c| c.get::<String>(0, "name")).unwrap_err();
        assert!(matches!(err, StoreError::CorruptRow { column: "name", .. }));
    }
}
