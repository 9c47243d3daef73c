//! Shared record helpers over the [`ManagedContext`] capability.
//!
//! The helpers are free functions so any context-like type gets them by
//! implementing the trait; [`Context`] is the production implementation.

use crate::context::Context;
use crate::db::StoreResult;
use crate::model::record::{Record, RecordId};
use crate::observe::live_query::LiveQuery;
use crate::observe::query::Query;
use log::{debug, warn};

/// What the helpers need from a context.
pub trait ManagedContext {
    /// Saves pending changes.
    fn save(&self) -> StoreResult<()>;

    /// Runs `job` on the context's queue without waiting.
    fn perform_on_queue<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static;

    /// Looks a record up by identity.
    fn lookup(&self, id: &RecordId) -> StoreResult<Option<Record>>;

    fn fetch_all(&self, query: &Query) -> StoreResult<Vec<Record>>;

    fn stage_insert(&self, record: Record) -> StoreResult<()>;

    fn stage_delete(&self, id: &RecordId) -> StoreResult<bool>;

    fn has_pending_changes(&self) -> StoreResult<bool>;
}

impl ManagedContext for Context {
    fn save(&self) -> StoreResult<()> {
        Context::save(self)
    }

    fn perform_on_queue<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.perform(move |_| job());
    }

    fn lookup(&self, id: &RecordId) -> StoreResult<Option<Record>> {
        self.find(id)
    }

    fn fetch_all(&self, query: &Query) -> StoreResult<Vec<Record>> {
        self.fetch(query)
    }

    fn stage_insert(&self, record: Record) -> StoreResult<()> {
        self.insert(record)
    }

    fn stage_delete(&self, id: &RecordId) -> StoreResult<bool> {
        self.delete(id)
    }

    fn has_pending_changes(&self) -> StoreResult<bool> {
        Ok(self.has_changes()?)
    }
}

/// The record of `kind` with identity `id`, if one exists.
pub fn existing_record<C: ManagedContext>(
    context: &C,
    kind: &str,
    id: &RecordId,
) -> StoreResult<Option<Record>> {
    Ok(context.lookup(id)?.filter(|record| record.kind() == kind))
}

/// The record of `kind` with identity `id`, inserting an empty one when it
/// does not exist yet.
pub fn record_or_insert<C: ManagedContext>(
    context: &C,
    kind: &str,
    id: &RecordId,
) -> StoreResult<Record> {
    if let Some(record) = existing_record(context, kind, id)? {
        return Ok(record);
    }
    let record = Record::with_id(id.clone(), kind);
    context.stage_insert(record.clone())?;
    Ok(record)
}

/// Stages a deletion of every record of `kind`; returns how many.
pub fn delete_all<C: ManagedContext>(context: &C, kind: &str) -> StoreResult<usize> {
    let mut deleted = 0;
    for record in context.fetch_all(&Query::all(kind))? {
        if context.stage_delete(record.id())? {
            deleted += 1;
        }
    }
    Ok(deleted)
}

/// Live query following a single record in `context`.
pub fn changes_for_record(context: &Context, record: &Record) -> LiveQuery {
    LiveQuery::new(context, Query::by_id(record.kind(), record.id().clone()))
}

/// Saves when there is something to save and logs a failure under `site`.
pub fn save_logged<C: ManagedContext>(context: &C, site: &str) -> StoreResult<()> {
    if !context.has_pending_changes()? {
        return Ok(());
    }
    match context.save() {
        Ok(()) => {
            debug!("event=save module=collection status=ok site={}", site);
            Ok(())
        }
        Err(err) => {
            warn!(
                "event=save module=collection status=error site={} error={}",
                site, err
            );
            Err(err)
        }
    }
}
