//! Store connection bootstrap with the one-shot recreate policy.
//!
//! # Responsibility
//! - Open file or in-memory SQLite connections for the record store.
//! - Recreate a durable store file once when it fails with a
//!   migration-class error.
//!
//! # Invariants
//! - Returned connections have migrations applied and the model verified.
//! - A store file is deleted at most once per open attempt.

use super::migrations::{apply_migrations, verify_model};
use super::{StoreError, StoreResult};
use crate::model::schema::Model;
use log::{error, info, warn};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Where the backing store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    File(PathBuf),
    Memory,
}

impl StoreLocation {
    pub fn mode(&self) -> &'static str {
        match self {
            Self::File(_) => "file",
            Self::Memory => "memory",
        }
    }
}

/// Opens the backing store and applies all pending migrations.
///
/// For file stores, `reset_on_open` deletes any existing file first, and a
/// migration-class failure on an existing file deletes it and retries once.
/// Every other failure, and a failed retry, is `StoreError::Unrecoverable`.
///
/// # Side effects
/// - Emits `store_open` logging events with duration and status.
pub fn open_store(
    location: &StoreLocation,
    model: &Model,
    reset_on_open: bool,
) -> StoreResult<Connection> {
    let started_at = Instant::now();
    info!(
        "event=store_open module=db status=start mode={} model={}",
        location.mode(),
        model.name()
    );

    let result = match location {
        StoreLocation::Memory => {
            open_memory(model).map_err(|err| StoreError::Unrecoverable(Box::new(err)))
        }
        StoreLocation::File(path) => {
            if reset_on_open {
                delete_store_files(path).map_err(|err| StoreError::Unrecoverable(Box::new(err)))?;
            }
            open_file_guarded(path, model, true)
        }
    };

    match &result {
        Ok(_) => info!(
            "event=store_open module=db status=ok mode={} duration_ms={}",
            location.mode(),
            started_at.elapsed().as_millis()
        ),
        Err(err) => error!(
            "event=store_open module=db status=error mode={} duration_ms={} error_code=store_unusable error={}",
            location.mode(),
            started_at.elapsed().as_millis(),
            err
        ),
    }
    result
}

/// Deletes a store file and its SQLite side files, ignoring missing ones.
pub fn delete_store_files(path: &Path) -> StoreResult<()> {
    for candidate in store_file_set(path) {
        match std::fs::remove_file(&candidate) {
            Ok(()) => info!(
                "event=store_delete module=db status=ok path={}",
                candidate.display()
            ),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn open_file_guarded(path: &Path, model: &Model, may_recreate: bool) -> StoreResult<Connection> {
    match open_file(path, model) {
        Ok(conn) => Ok(conn),
        Err(err) if may_recreate && err.is_migration_class() && path.exists() => {
            warn!(
                "event=store_recreate module=db status=start path={} reason={}",
                path.display(),
                err
            );
            delete_store_files(path).map_err(|err| StoreError::Unrecoverable(Box::new(err)))?;
            open_file_guarded(path, model, false)
        }
        Err(err) => Err(StoreError::Unrecoverable(Box::new(err))),
    }
}

fn open_file(path: &Path, model: &Model) -> StoreResult<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut conn = Connection::open(path)?;
    bootstrap_connection(&mut conn, model)?;
    Ok(conn)
}

fn open_memory(model: &Model) -> StoreResult<Connection> {
    let mut conn = Connection::open_in_memory()?;
    bootstrap_connection(&mut conn, model)?;
    Ok(conn)
}

fn bootstrap_connection(conn: &mut Connection, model: &Model) -> StoreResult<()> {
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.pragma_update_and_check(None, "journal_mode", "DELETE", |_| Ok(()))?;
    apply_migrations(conn)?;
    verify_model(conn, model)?;
    Ok(())
}

fn store_file_set(path: &Path) -> Vec<PathBuf> {
    let mut files = vec![path.to_path_buf()];
    for suffix in ["-journal", "-wal", "-shm"] {
        let mut side = path.as_os_str().to_owned();
        side.push(suffix);
        files.push(PathBuf::from(side));
    }
    files
}
