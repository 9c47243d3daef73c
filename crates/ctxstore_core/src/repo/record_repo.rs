//! Record repository contract and SQLite implementation.
//!
//! # Responsibility
//! - Provide insert/update/delete/lookup over the `records` table.
//! - Serialize record fields as JSON text.
//!
//! # Invariants
//! - `version` starts at 1 and increases by one on every update.
//! - Read paths reject invalid persisted state instead of masking it.

use crate::db::{StoreError, StoreResult};
use crate::model::record::{Record, RecordId};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::collections::BTreeMap;

const RECORD_SELECT_SQL: &str = "SELECT
    id,
    kind,
    fields,
    version
FROM records";

/// Repository interface for record persistence.
pub trait RecordRepository {
    /// Inserts a new record and returns its initial version.
    fn insert_record(&self, record: &Record) -> StoreResult<u64>;
    /// Replaces a record's kind and fields, returning the new version.
    ///
    /// With `expected_version`, fails with `StoreError::Conflict` when the
    /// stored version differs.
    fn update_record(&self, record: &Record, expected_version: Option<u64>) -> StoreResult<u64>;
    /// Deletes a record; returns whether a row was removed.
    fn delete_record(&self, id: &RecordId) -> StoreResult<bool>;
    fn get_record(&self, id: &RecordId) -> StoreResult<Option<Record>>;
    /// Lists every record of one kind, ordered by id.
    fn list_records(&self, kind: &str) -> StoreResult<Vec<Record>>;
}

/// SQLite-backed record repository.
pub struct SqliteRecordRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteRecordRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl RecordRepository for SqliteRecordRepository<'_> {
    fn insert_record(&self, record: &Record) -> StoreResult<u64> {
        self.conn.execute(
            "INSERT INTO records (id, kind, fields, version) VALUES (?1, ?2, ?3, 1);",
            params![
                record.id().as_str(),
                record.kind(),
                encode_fields(record.fields())?
            ],
        )?;
        Ok(1)
    }

    fn update_record(&self, record: &Record, expected_version: Option<u64>) -> StoreResult<u64> {
        let expected = expected_version.map(version_to_db).transpose()?;
        let changed = self.conn.execute(
            "UPDATE records
             SET
                kind = ?1,
                fields = ?2,
                version = version + 1,
                updated_at = (strftime('%s', 'now') * 1000)
             WHERE id = ?3
               AND (?4 IS NULL OR version = ?4);",
            params![
                record.kind(),
                encode_fields(record.fields())?,
                record.id().as_str(),
                expected
            ],
        )?;

        if changed == 0 {
            return match self.current_version(record.id())? {
                Some(_) => Err(StoreError::Conflict(vec![record.id().clone()])),
                None => Err(StoreError::NotFound(record.id().clone())),
            };
        }

        self.current_version(record.id())?
            .ok_or_else(|| StoreError::NotFound(record.id().clone()))
    }

    fn delete_record(&self, id: &RecordId) -> StoreResult<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM records WHERE id = ?1;", [id.as_str()])?;
        Ok(changed > 0)
    }

    fn get_record(&self, id: &RecordId) -> StoreResult<Option<Record>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{RECORD_SELECT_SQL} WHERE id = ?1;"))?;
        let mut rows = stmt.query([id.as_str()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_record_row(row)?));
        }
        Ok(None)
    }

    fn list_records(&self, kind: &str) -> StoreResult<Vec<Record>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{RECORD_SELECT_SQL} WHERE kind = ?1 ORDER BY id ASC;"))?;
        let mut rows = stmt.query([kind])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(parse_record_row(row)?);
        }
        Ok(records)
    }
}

impl SqliteRecordRepository<'_> {
    fn current_version(&self, id: &RecordId) -> StoreResult<Option<u64>> {
        let version = self
            .conn
            .query_row(
                "SELECT version FROM records WHERE id = ?1;",
                [id.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        version.map(version_from_db).transpose()
    }
}

fn parse_record_row(row: &Row<'_>) -> StoreResult<Record> {
    let id_text: String = row.get("id")?;
    let id = RecordId::parse(&id_text)
        .ok_or_else(|| StoreError::InvalidData("blank id in records.id".to_string()))?;

    let fields_text: String = row.get("fields")?;
    let fields = decode_fields(&fields_text).map_err(|message| {
        StoreError::InvalidData(format!("record `{id}` has invalid fields: {message}"))
    })?;

    let version = version_from_db(row.get::<_, i64>("version")?)?;
    Ok(Record::from_store(id, row.get("kind")?, fields, version))
}

fn encode_fields(fields: &BTreeMap<String, Value>) -> StoreResult<String> {
    serde_json::to_string(fields)
        .map_err(|err| StoreError::InvalidData(format!("fields are not serializable: {err}")))
}

fn decode_fields(text: &str) -> Result<BTreeMap<String, Value>, String> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Ok(map.into_iter().collect()),
        Ok(other) => Err(format!("expected a JSON object, got `{other}`")),
        Err(err) => Err(err.to_string()),
    }
}

fn version_from_db(value: i64) -> StoreResult<u64> {
    u64::try_from(value)
        .ok()
        .filter(|version| *version > 0)
        .ok_or_else(|| StoreError::InvalidData(format!("invalid version `{value}` in records.version")))
}

fn version_to_db(value: u64) -> StoreResult<i64> {
    i64::try_from(value)
        .map_err(|_| StoreError::InvalidData(format!("version `{value}` exceeds storage range")))
}

#[cfg(test)]
mod tests {
    use super::{RecordRepository, SqliteRecordRepository};
    use crate::db::{open_store, StoreError, StoreLocation};
    use crate::model::record::{Record, RecordId};
    use crate::model::schema::{EntityKind, Model};
    use serde_json::json;

    fn open() -> rusqlite::Connection {
        let model = Model::new("Repo", 1).with_kind(EntityKind::new("Note"));
        open_store(&StoreLocation::Memory, &model, false).unwrap()
    }

    #[test]
    fn insert_get_and_list_roundtrip() {
        let conn = open();
        let repo = SqliteRecordRepository::new(&conn);

        let record = Record::new("Note").with("title", "first");
        assert_eq!(repo.insert_record(&record).unwrap(), 1);
        repo.insert_record(&Record::new("Other")).unwrap();

        let loaded = repo.get_record(record.id()).unwrap().unwrap();
        assert_eq!(loaded.get("title"), Some(&json!("first")));
        assert_eq!(loaded.version(), 1);
        assert!(!loaded.has_changes());
        assert_eq!(repo.list_records("Note").unwrap().len(), 1);
    }

    #[test]
    fn update_bumps_version_and_detects_stale_writers() {
        let conn = open();
        let repo = SqliteRecordRepository::new(&conn);

        let mut record = Record::new("Note").with("title", "v1");
        repo.insert_record(&record).unwrap();
        record.set("title", "v2");
        assert_eq!(repo.update_record(&record, Some(1)).unwrap(), 2);

        let err = repo.update_record(&record, Some(1)).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(ids) if ids == vec![record.id().clone()]));

        assert_eq!(repo.update_record(&record, None).unwrap(), 3);
    }

    #[test]
    fn update_and_delete_missing_record() {
        let conn = open();
        let repo = SqliteRecordRepository::new(&conn);
        let missing = Record::with_id(RecordId::parse("ghost").unwrap(), "Note");

        let err = repo.update_record(&missing, None).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(!repo.delete_record(missing.id()).unwrap());
    }

    #[test]
    fn duplicate_insert_is_a_constraint_violation() {
        let conn = open();
        let repo = SqliteRecordRepository::new(&conn);
        let record = Record::new("Note");
        repo.insert_record(&record).unwrap();
        assert!(matches!(
            repo.insert_record(&record),
            Err(StoreError::Sqlite(_))
        ));
    }
}
