//! Store coordinator: the single owner of the backing store.
//!
//! # Responsibility
//! - Open the store (see `db::open_store`) and hold its only connection.
//! - Execute record lookups for contexts.
//! - Commit a context's pending changes in one transaction and publish the
//!   resulting `ChangeNotification` on the commit channel.
//!
//! # Invariants
//! - The connection lock covers SQL work only; subscribers run after it is
//!   released.
//! - Notifications are published in commit order.
//! - Empty commits publish nothing.

use crate::context::{ConflictPolicy, ContextId};
use crate::db::{open_store, StoreError, StoreLocation, StoreResult};
use crate::model::record::{Record, RecordId};
use crate::model::schema::Model;
use crate::repo::record_repo::{RecordRepository, SqliteRecordRepository};
use crate::store::feed::{ChangeFeed, ListenerId};
use crate::store::notification::{ChangeNotification, ContextRole};
use log::{debug, warn};
use parking_lot::{Mutex, ReentrantMutex};
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one opened store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoreId(u64);

impl Display for StoreId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "store-{}", self.0)
    }
}

#[cfg(test)]
impl StoreId {
    pub(crate) fn for_tests() -> Self {
        Self(0)
    }
}

/// Pending changes of one root context, handed to [`StoreCoordinator::commit`].
pub(crate) struct CommitBatch {
    pub origin: ContextId,
    pub policy: ConflictPolicy,
    pub inserts: Vec<Record>,
    pub updates: Vec<Record>,
    pub deletes: Vec<RecordId>,
}

pub(crate) struct CommitOutcome {
    pub notification: Arc<ChangeNotification>,
    /// New store version of every inserted or updated record.
    pub versions: BTreeMap<RecordId, u64>,
    /// Records whose committed value differs from the context's copy: updates
    /// dropped because the store won, or merged because the context won.
    pub stale: Vec<RecordId>,
}

pub struct StoreCoordinator {
    id: StoreId,
    model: Model,
    location: StoreLocation,
    conn: Mutex<Connection>,
    publish_order: ReentrantMutex<()>,
    commits: ChangeFeed<Arc<ChangeNotification>>,
}

impl StoreCoordinator {
    /// Opens the backing store; failures are `StoreError::Unrecoverable`.
    pub fn open(model: Model, location: StoreLocation, reset_on_open: bool) -> StoreResult<Self> {
        let conn = open_store(&location, &model, reset_on_open)?;
        Ok(Self {
            id: StoreId(NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed)),
            model,
            location,
            conn: Mutex::new(conn),
            publish_order: ReentrantMutex::new(()),
            commits: ChangeFeed::new(),
        })
    }

    pub fn id(&self) -> StoreId {
        self.id
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    pub fn fetch_record(&self, id: &RecordId) -> StoreResult<Option<Record>> {
        let conn = self.conn.lock();
        SqliteRecordRepository::new(&conn).get_record(id)
    }

    pub fn fetch_kind(&self, kind: &str) -> StoreResult<Vec<Record>> {
        let conn = self.conn.lock();
        SqliteRecordRepository::new(&conn).list_records(kind)
    }

    /// Subscribes to every non-empty commit on this store.
    pub fn subscribe(
        &self,
        listener: impl Fn(&Arc<ChangeNotification>) + Send + Sync + 'static,
    ) -> ListenerId {
        self.commits.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.commits.unsubscribe(id)
    }

    /// Commits one batch atomically and publishes what changed.
    ///
    /// Under `ConflictPolicy::Error` any stale update fails the whole batch
    /// with `StoreError::Conflict` and nothing is written.
    pub(crate) fn commit(&self, batch: CommitBatch) -> StoreResult<CommitOutcome> {
        let started_at = Instant::now();
        for record in batch.inserts.iter().chain(batch.updates.iter()) {
            self.model.validate(record)?;
        }

        let mut notification = ChangeNotification::new(self.id, batch.origin, ContextRole::Root);
        let mut versions = BTreeMap::new();
        let mut stale = Vec::new();
        let mut conflicts = Vec::new();

        // Taken before the connection and held through publication so that
        // publication order matches commit order. Re-entrant: a subscriber may
        // commit on the publishing thread.
        let _order = self.publish_order.lock();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let repo = SqliteRecordRepository::new(&tx);
            for record in &batch.inserts {
                let version = repo.insert_record(record)?;
                versions.insert(record.id().clone(), version);
                notification.record_insert(record.id().clone());
            }

            for record in &batch.updates {
                let expected = (record.version() > 0).then_some(record.version());
                match repo.update_record(record, expected) {
                    Ok(version) => {
                        versions.insert(record.id().clone(), version);
                        notification.record_update(record.id().clone(), record.changed_fields());
                    }
                    Err(StoreError::Conflict(_)) => match batch.policy {
                        ConflictPolicy::Error => conflicts.push(record.id().clone()),
                        ConflictPolicy::StoreWins => stale.push(record.id().clone()),
                        ConflictPolicy::ContextWins => {
                            let current = repo
                                .get_record(record.id())?
                                .ok_or_else(|| StoreError::NotFound(record.id().clone()))?;
                            let merged = record.reapply_changes(&current, None);
                            let version = repo.update_record(&merged, None)?;
                            versions.insert(record.id().clone(), version);
                            notification
                                .record_update(record.id().clone(), record.changed_fields());
                            stale.push(record.id().clone());
                        }
                    },
                    Err(err) => return Err(err),
                }
            }

            for id in &batch.deletes {
                if repo.delete_record(id)? {
                    notification.record_delete(id.clone());
                }
            }
        }

        if !conflicts.is_empty() {
            warn!(
                "event=store_commit module=store status=conflict store={} origin={} conflicts={}",
                self.id,
                batch.origin,
                conflicts.len()
            );
            return Err(StoreError::Conflict(conflicts));
        }
        tx.commit()?;
        drop(conn);

        debug!(
            "event=store_commit module=store status=ok store={} origin={} inserted={} updated={} deleted={} stale={} duration_ms={}",
            self.id,
            batch.origin,
            notification.inserted().len(),
            notification.updated().len(),
            notification.deleted().len(),
            stale.len(),
            started_at.elapsed().as_millis()
        );

        let notification = Arc::new(notification);
        if !notification.is_empty() {
            self.commits.publish(&notification);
        }

        Ok(CommitOutcome {
            notification,
            versions,
            stale,
        })
    }
}
