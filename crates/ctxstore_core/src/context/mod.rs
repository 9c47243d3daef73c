//! Contexts: serialized sessions over the shared store.
//!
//! # Responsibility
//! - Materialize records, stage inserts/updates/deletes and save them.
//! - Run every read and write on the context's own `SerialQueue`.
//! - Merge other contexts' saves and announce changes on the context's
//!   change feed, which live queries subscribe to.
//!
//! # Invariants
//! - State is only touched from jobs running on the context's queue.
//! - A root context saves into the store; a child context saves into its
//!   parent and never reaches the store directly.
//! - A context never merges its own saves.

pub mod propagation;
pub mod queue;
pub mod registry;
mod state;

use crate::db::{StoreError, StoreResult};
use crate::model::record::{Record, RecordId};
use crate::observe::query::Query;
use crate::store::coordinator::{CommitBatch, StoreCoordinator, StoreId};
use crate::store::feed::{ChangeFeed, ListenerId};
use crate::store::notification::{ChangeNotification, ContextRole};
use log::{debug, warn};
use parking_lot::Mutex;
use queue::{QueueError, SerialQueue, SerializationMode};
use state::{ContextState, PendingChanges};
use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(u64);

impl ContextId {
    fn next() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self(0)
    }
}

impl Display for ContextId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// How a context resolves its own edits against changes saved elsewhere.
///
/// Last writer wins at record level (`ContextWins`) or at field level
/// (`StoreWins` keeps local edits to fields the other save did not touch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Keep local edits as they are; a save over a newer store version fails
    /// with `StoreError::Conflict`.
    #[default]
    Error,
    /// Values saved elsewhere replace local edits of the same fields.
    StoreWins,
    /// Local edits are re-applied over values saved elsewhere and win at save.
    ContextWins,
}

struct ContextInner {
    id: ContextId,
    store: Arc<StoreCoordinator>,
    parent: Option<Context>,
    policy: ConflictPolicy,
    queue: SerialQueue,
    state: Mutex<ContextState>,
    changes: ChangeFeed<Arc<ChangeNotification>>,
}

/// Cloneable handle to one context.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

/// Non-owning handle, held by the registry.
#[derive(Clone)]
pub struct WeakContext(Weak<ContextInner>);

impl WeakContext {
    pub fn upgrade(&self) -> Option<Context> {
        self.0.upgrade().map(|inner| Context { inner })
    }

    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

impl Context {
    pub(crate) fn new(
        store: Arc<StoreCoordinator>,
        parent: Option<Context>,
        mode: SerializationMode,
        policy: ConflictPolicy,
    ) -> StoreResult<Self> {
        let id = ContextId::next();
        let queue = SerialQueue::new(format!("ctxstore-{id}"), mode)?;
        debug!(
            "event=context_create module=context status=ok context={} store={} role={:?} mode={:?}",
            id,
            store.id(),
            if parent.is_some() { ContextRole::Child } else { ContextRole::Root },
            mode
        );
        Ok(Self {
            inner: Arc::new(ContextInner {
                id,
                store,
                parent,
                policy,
                queue,
                state: Mutex::new(ContextState::default()),
                changes: ChangeFeed::new(),
            }),
        })
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn store_id(&self) -> StoreId {
        self.inner.store.id()
    }

    pub fn store(&self) -> &Arc<StoreCoordinator> {
        &self.inner.store
    }

    pub fn parent(&self) -> Option<&Context> {
        self.inner.parent.as_ref()
    }

    pub fn role(&self) -> ContextRole {
        if self.inner.parent.is_some() {
            ContextRole::Child
        } else {
            ContextRole::Root
        }
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.inner.policy
    }

    pub fn mode(&self) -> SerializationMode {
        self.inner.queue.mode()
    }

    pub fn downgrade(&self) -> WeakContext {
        WeakContext(Arc::downgrade(&self.inner))
    }

    /// Whether both handles refer to the same context.
    pub fn same_as(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether the calling thread is running this context's queue.
    pub fn is_on_queue(&self) -> bool {
        self.inner.queue.is_current()
    }

    /// Schedules `job` on the context's queue without waiting.
    pub fn perform(&self, job: impl FnOnce(&Context) + Send + 'static) {
        let context = self.clone();
        self.inner.queue.perform(move || job(&context));
    }

    /// Runs `job` on the context's queue and waits for its result.
    pub fn perform_and_wait<R, F>(&self, job: F) -> Result<R, QueueError>
    where
        R: Send + 'static,
        F: FnOnce(&Context) -> R + Send + 'static,
    {
        let context = self.clone();
        self.inner.queue.perform_and_wait(move || job(&context))
    }

    /// Waits until every job scheduled so far has run.
    pub fn drain(&self) {
        self.inner.queue.drain();
    }

    /// Stages a new record.
    pub fn insert(&self, record: Record) -> StoreResult<()> {
        self.run(move |context| {
            context.inner.state.lock().stage_insert(record);
            Ok(())
        })
    }

    /// Stages new values for an existing record.
    pub fn update(&self, record: Record) -> StoreResult<()> {
        self.run(move |context| context.update_on_queue(record))
    }

    /// Stages a deletion; returns `false` when the identity is unknown.
    pub fn delete(&self, id: &RecordId) -> StoreResult<bool> {
        let id = id.clone();
        self.run(move |context| context.delete_on_queue(&id))
    }

    /// Looks a record up by identity, local pending state first.
    pub fn find(&self, id: &RecordId) -> StoreResult<Option<Record>> {
        let id = id.clone();
        self.run(move |context| context.find_on_queue(&id))
    }

    /// Executes `query` against the store overlaid with pending changes.
    pub fn fetch(&self, query: &Query) -> StoreResult<Vec<Record>> {
        let query = query.clone();
        self.run(move |context| Ok(query.apply(context.records_of_kind_on_queue(query.kind())?)))
    }

    pub fn has_changes(&self) -> Result<bool, QueueError> {
        self.perform_and_wait(|context| context.inner.state.lock().has_changes())
    }

    /// Discards every pending change.
    pub fn rollback(&self) -> Result<(), QueueError> {
        self.perform_and_wait(|context| context.inner.state.lock().rollback())
    }

    /// Saves pending changes: into the store for a root context, into the
    /// parent for a child. Saving nothing succeeds without side effects.
    pub fn save(&self) -> StoreResult<()> {
        self.run(|context| context.save_on_queue())
    }

    /// Subscribes to every change this context observes: its own saves,
    /// merged sibling saves and child pushes. Listeners run on the queue.
    pub fn subscribe_changes(
        &self,
        listener: impl Fn(&Arc<ChangeNotification>) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.changes.subscribe(listener)
    }

    pub fn unsubscribe_changes(&self, id: ListenerId) -> bool {
        self.inner.changes.unsubscribe(id)
    }

    /// Schedules a merge of another context's save on this context's queue.
    pub(crate) fn schedule_merge(&self, notification: Arc<ChangeNotification>) {
        self.perform(move |context| context.merge_on_queue(&notification));
    }

    fn run<R, F>(&self, job: F) -> StoreResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&Context) -> StoreResult<R> + Send + 'static,
    {
        self.perform_and_wait(job)?
    }

    fn find_on_queue(&self, id: &RecordId) -> StoreResult<Option<Record>> {
        {
            let state = self.inner.state.lock();
            if state.is_deleted(id) {
                return Ok(None);
            }
            if let Some(record) = state.registered(id) {
                return Ok(Some(record.clone()));
            }
        }

        let loaded = match &self.inner.parent {
            Some(parent) => parent.find(id)?,
            None => self.inner.store.fetch_record(id)?,
        };
        let Some(mut record) = loaded else {
            return Ok(None);
        };
        record.clear_changes();
        self.inner.state.lock().register_clean(record.clone());
        Ok(Some(record))
    }

    fn update_on_queue(&self, mut record: Record) -> StoreResult<()> {
        let known_version = match self.find_on_queue(record.id())? {
            Some(known) => known.version(),
            None => return Err(StoreError::NotFound(record.id().clone())),
        };
        if record.version() == 0 {
            record.set_version(known_version);
        }
        self.inner.state.lock().stage_update(record);
        Ok(())
    }

    fn delete_on_queue(&self, id: &RecordId) -> StoreResult<bool> {
        if self.find_on_queue(id)?.is_none() {
            return Ok(false);
        }
        self.inner.state.lock().stage_delete(id);
        Ok(true)
    }

    pub(crate) fn records_of_kind(&self, kind: &str) -> StoreResult<Vec<Record>> {
        let kind = kind.to_string();
        self.run(move |context| context.records_of_kind_on_queue(&kind))
    }

    fn records_of_kind_on_queue(&self, kind: &str) -> StoreResult<Vec<Record>> {
        let base = match &self.inner.parent {
            Some(parent) => parent.records_of_kind(kind)?,
            None => self.inner.store.fetch_kind(kind)?,
        };
        Ok(self.inner.state.lock().overlay(kind, base))
    }

    fn save_on_queue(&self) -> StoreResult<()> {
        let started_at = Instant::now();
        let pending = {
            let state = self.inner.state.lock();
            if !state.has_changes() {
                return Ok(());
            }
            state.pending()
        };

        let notification = match &self.inner.parent {
            None => self.commit_to_store(pending)?,
            Some(parent) => {
                let origin = self.id();
                let notification =
                    parent.run(move |parent| Ok(parent.absorb_child_on_queue(origin, pending)))?;
                self.inner.state.lock().apply_pushed();
                notification
            }
        };

        debug!(
            "event=context_save module=context status=ok context={} role={:?} changes={} duration_ms={}",
            self.id(),
            self.role(),
            notification.len(),
            started_at.elapsed().as_millis()
        );
        if !notification.is_empty() {
            self.inner.changes.publish(&notification);
        }
        Ok(())
    }

    fn commit_to_store(&self, pending: PendingChanges) -> StoreResult<Arc<ChangeNotification>> {
        let outcome = self.inner.store.commit(CommitBatch {
            origin: self.id(),
            policy: self.inner.policy,
            inserts: pending.inserts,
            updates: pending.updates,
            deletes: pending.deletes,
        })?;

        let mut refreshed = Vec::with_capacity(outcome.stale.len());
        for id in outcome.stale {
            match self.inner.store.fetch_record(&id) {
                Ok(fresh) => refreshed.push((id, fresh)),
                Err(err) => {
                    warn!(
                        "event=context_refresh module=context status=error context={} record={} error={}",
                        self.id(),
                        id,
                        err
                    );
                    refreshed.push((id, None));
                }
            }
        }
        self.inner
            .state
            .lock()
            .apply_saved(&outcome.versions, refreshed);
        Ok(outcome.notification)
    }

    fn absorb_child_on_queue(
        &self,
        child: ContextId,
        pending: PendingChanges,
    ) -> Arc<ChangeNotification> {
        let mut notification = ChangeNotification::new(self.store_id(), child, ContextRole::Child);
        {
            let mut state = self.inner.state.lock();
            for record in pending.inserts {
                notification.record_insert(record.id().clone());
                state.stage_insert(record);
            }
            for record in pending.updates {
                notification.record_update(record.id().clone(), record.changed_fields());
                state.absorb_update(record);
            }
            for id in pending.deletes {
                state.stage_delete(&id);
                notification.record_delete(id);
            }
        }

        let notification = Arc::new(notification);
        self.inner.changes.publish(&notification);
        notification
    }

    /// Brings cached records up to date with a save made elsewhere, then
    /// announces it on this context's change feed.
    fn merge_on_queue(&self, notification: &Arc<ChangeNotification>) {
        if notification.origin() == self.id() {
            return;
        }

        let stale: Vec<RecordId> = {
            let state = self.inner.state.lock();
            state
                .registered_ids()
                .filter(|id| notification.touches(id))
                .cloned()
                .collect()
        };

        for id in stale {
            match self.inner.store.fetch_record(&id) {
                Ok(Some(fresh)) => {
                    self.inner
                        .state
                        .lock()
                        .refresh(fresh, notification, self.inner.policy);
                }
                Ok(None) => self.inner.state.lock().forget(&id),
                Err(err) => warn!(
                    "event=context_merge module=context status=error context={} record={} error={}",
                    self.id(),
                    id,
                    err
                ),
            }
        }

        {
            let mut state = self.inner.state.lock();
            for id in notification.deleted() {
                state.forget(id);
            }
        }

        debug!(
            "event=context_merge module=context status=ok context={} origin={} changes={}",
            self.id(),
            notification.origin(),
            notification.len()
        );
        self.inner.changes.publish(notification);
    }
}

impl Debug for Context {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("store", &self.inner.store.id())
            .field("role", &self.role())
            .field("policy", &self.inner.policy)
            .finish()
    }
}
