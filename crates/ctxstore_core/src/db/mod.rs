//! SQLite store bootstrap, layout migrations and the store error taxonomy.
//!
//! # Responsibility
//! - Open file-backed or in-memory SQLite connections for the record store.
//! - Apply layout migrations and stamp/verify the active model.
//! - Classify failures so open can recover from schema mismatches once.
//!
//! # Invariants
//! - Layout version is tracked via `PRAGMA user_version`.
//! - No record is read or written before migrations and the model check succeed.

use crate::context::queue::QueueError;
use crate::model::record::RecordId;
use crate::model::schema::RecordValidationError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod migrations;
mod open;

pub use open::{delete_store_files, open_store, StoreLocation};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
    UnsupportedSchemaVersion {
        db_version: u32,
        latest_supported: u32,
    },
    ModelMismatch {
        stored_name: String,
        stored_version: u32,
        expected_name: String,
        expected_version: u32,
    },
    Validation(RecordValidationError),
    /// Records changed in the store since the saving context loaded them.
    Conflict(Vec<RecordId>),
    NotFound(RecordId),
    InvalidData(String),
    Queue(QueueError),
    /// The store cannot be opened, even after one delete-and-recreate retry.
    Unrecoverable(Box<StoreError>),
}

impl StoreError {
    /// Whether this failure belongs to the schema/migration class that open
    /// recovers from by recreating the store file.
    pub fn is_migration_class(&self) -> bool {
        match self {
            Self::UnsupportedSchemaVersion { .. } | Self::ModelMismatch { .. } => true,
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => {
                err.code == rusqlite::ErrorCode::NotADatabase
            }
            _ => false,
        }
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::Io(err) => write!(f, "store file error: {err}"),
            Self::UnsupportedSchemaVersion {
                db_version,
                latest_supported,
            } => write!(
                f,
                "store layout version {db_version} is newer than supported {latest_supported}"
            ),
            Self::ModelMismatch {
                stored_name,
                stored_version,
                expected_name,
                expected_version,
            } => write!(
                f,
                "store was created by model `{stored_name}` v{stored_version}, expected `{expected_name}` v{expected_version}"
            ),
            Self::Validation(err) => write!(f, "{err}"),
            Self::Conflict(ids) => write!(f, "save conflict on {} record(s)", ids.len()),
            Self::NotFound(id) => write!(f, "record not found: {id}"),
            Self::InvalidData(message) => write!(f, "invalid persisted record data: {message}"),
            Self::Queue(err) => write!(f, "{err}"),
            Self::Unrecoverable(err) => write!(f, "store is unusable: {err}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            Self::Io(err) => Some(err),
            Self::Validation(err) => Some(err),
            Self::Queue(err) => Some(err),
            Self::Unrecoverable(err) => Some(err.as_ref()),
            Self::UnsupportedSchemaVersion { .. }
            | Self::ModelMismatch { .. }
            | Self::Conflict(_)
            | Self::NotFound(_)
            | Self::InvalidData(_) => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<RecordValidationError> for StoreError {
    fn from(value: RecordValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<QueueError> for StoreError {
    fn from(value: QueueError) -> Self {
        Self::Queue(value)
    }
}
