//! Store layout migrations and model stamping.
//!
//! # Responsibility
//! - Register layout migrations in strictly increasing order.
//! - Apply pending migrations atomically.
//! - Stamp a fresh store with the active model, or verify an existing stamp.
//!
//! # Invariants
//! - `version` values must remain monotonic.
//! - Applied migration version is mirrored to `PRAGMA user_version`.
//! - A store is only ever used by the model it was stamped with.

use crate::db::{StoreError, StoreResult};
use crate::model::schema::Model;
use rusqlite::{params, Connection, OptionalExtension};

#[derive(Debug, Clone, Copy)]
struct Migration {
    version: u32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: include_str!("0001_init.sql"),
}];

const META_MODEL_NAME: &str = "model_name";
const META_MODEL_VERSION: &str = "model_version";

/// Returns the latest layout version known by this binary.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |migration| migration.version)
}

/// Applies all pending layout migrations on the provided connection.
pub fn apply_migrations(conn: &mut Connection) -> StoreResult<()> {
    let current_version = current_user_version(conn)?;
    let latest = latest_version();

    if current_version > latest {
        return Err(StoreError::UnsupportedSchemaVersion {
            db_version: current_version,
            latest_supported: latest,
        });
    }

    if current_version == latest {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for migration in MIGRATIONS {
        if migration.version <= current_version {
            continue;
        }

        tx.execute_batch(migration.sql)?;
        tx.execute_batch(&format!("PRAGMA user_version = {};", migration.version))?;
    }
    tx.commit()?;

    Ok(())
}

/// Stamps an unstamped store with `model`, or checks an existing stamp.
pub fn verify_model(conn: &Connection, model: &Model) -> StoreResult<()> {
    let stored_name = read_meta(conn, META_MODEL_NAME)?;
    let stored_version = read_meta(conn, META_MODEL_VERSION)?;

    match (stored_name, stored_version) {
        (None, None) => {
            conn.execute(
                "INSERT INTO store_meta (key, value) VALUES (?1, ?2), (?3, ?4);",
                params![
                    META_MODEL_NAME,
                    model.name(),
                    META_MODEL_VERSION,
                    model.version().to_string()
                ],
            )?;
            Ok(())
        }
        (name, version) => {
            let stored_name = name.unwrap_or_default();
            let stored_version = version
                .as_deref()
                .and_then(|value| value.parse::<u32>().ok())
                .unwrap_or(0);
            if stored_name == model.name() && stored_version == model.version() {
                return Ok(());
            }
            Err(StoreError::ModelMismatch {
                stored_name,
                stored_version,
                expected_name: model.name().to_string(),
                expected_version: model.version(),
            })
        }
    }
}

fn read_meta(conn: &Connection, key: &str) -> StoreResult<Option<String>> {
    let value = conn
        .query_row(
            "SELECT value FROM store_meta WHERE key = ?1;",
            [key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(value)
}

fn current_user_version(conn: &Connection) -> StoreResult<u32> {
    let version = conn.query_row("PRAGMA user_version;", [], |row| row.get::<_, u32>(0))?;
    Ok(version)
}
