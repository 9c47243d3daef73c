//! Managed live queries of one context.
//!
//! # Responsibility
//! - Keep the registered queries, their handlers and in-flight sets.
//! - Re-evaluate every query after each change the context observes and
//!   hand the resulting per-record transitions to the query's handler.
//!
//! # Invariants
//! - Fetching and dispatch only happen on the context's queue.
//! - Transitions for identities in a query's in-flight set are never
//!   delivered.
//! - Handlers run with no controller lock held, so they may call back into
//!   the controller.

use super::live_query::{LiveQuery, LiveQueryId};
use crate::context::{Context, ContextId, WeakContext};
use crate::model::record::{Record, RecordId};
use crate::store::feed::ListenerId;
use crate::store::notification::ChangeNotification;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    Move,
}

/// One record's transition within a live query's results.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectChange {
    pub kind: ChangeKind,
    pub record: Record,
    /// Position in the previous results; `None` for inserts.
    pub old_index: Option<usize>,
    /// Position in the new results; `None` for deletes.
    pub new_index: Option<usize>,
}

/// Per-query callback; runs on the owning context's queue.
pub type ObjectHandler = Arc<dyn Fn(&LiveQuery, &ObjectChange) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Added,
    /// The query was already managed; the first handler stays in place.
    AlreadyRegistered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserveError {
    ContextMismatch {
        expected: ContextId,
        actual: ContextId,
    },
}

impl Display for ObserveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ContextMismatch { expected, actual } => write!(
                f,
                "live query belongs to context {actual}, controller observes {expected}"
            ),
        }
    }
}

impl std::error::Error for ObserveError {}

struct Managed {
    query: LiveQuery,
    handler: ObjectHandler,
    in_flight: BTreeSet<RecordId>,
}

#[derive(Default)]
struct Shared {
    managed: Mutex<Vec<Managed>>,
    listener: Mutex<Option<ListenerId>>,
}

impl Shared {
    fn dispatch_target(&self, id: LiveQueryId) -> Option<(ObjectHandler, BTreeSet<RecordId>)> {
        self.managed
            .lock()
            .iter()
            .find(|entry| entry.query.id() == id)
            .map(|entry| (Arc::clone(&entry.handler), entry.in_flight.clone()))
    }
}

/// Live-query observation layer bound to one context.
pub struct LiveQueryController {
    context: Context,
    shared: Arc<Shared>,
}

impl LiveQueryController {
    pub fn new(context: &Context) -> Self {
        Self {
            context: context.clone(),
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Starts managing `query` with an empty in-flight set.
    pub fn register(
        &self,
        query: &LiveQuery,
        handler: impl Fn(&LiveQuery, &ObjectChange) + Send + Sync + 'static,
    ) -> Result<Registration, ObserveError> {
        if !query.context().same_as(&self.context) {
            return Err(ObserveError::ContextMismatch {
                expected: self.context.id(),
                actual: query.context().id(),
            });
        }
        let mut managed = self.shared.managed.lock();
        if managed.iter().any(|entry| entry.query == *query) {
            return Ok(Registration::AlreadyRegistered);
        }
        managed.push(Managed {
            query: query.clone(),
            handler: Arc::new(handler),
            in_flight: BTreeSet::new(),
        });
        Ok(Registration::Added)
    }

    /// Drops `query`, its handler and its in-flight set.
    pub fn unregister(&self, query: &LiveQuery) -> bool {
        let mut managed = self.shared.managed.lock();
        let before = managed.len();
        managed.retain(|entry| entry.query != *query);
        managed.len() != before
    }

    pub fn managed_count(&self) -> usize {
        self.shared.managed.lock().len()
    }

    pub fn is_managed(&self, query: &LiveQuery) -> bool {
        self.shared
            .managed
            .lock()
            .iter()
            .any(|entry| entry.query == *query)
    }

    pub fn is_started(&self) -> bool {
        self.shared.listener.lock().is_some()
    }

    /// On the context's queue: attaches to the context's change feed,
    /// fetches every managed query and reports each result as an insert.
    pub fn start(&self) {
        let shared = Arc::downgrade(&self.shared);
        self.context.perform(move |context| {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            {
                let mut listener = shared.listener.lock();
                if listener.is_none() {
                    *listener = Some(attach(context, Arc::downgrade(&shared)));
                }
            }

            let queries: Vec<LiveQuery> = shared
                .managed
                .lock()
                .iter()
                .map(|entry| entry.query.clone())
                .collect();
            for query in queries {
                let records = match query.fetch() {
                    Ok(records) => records,
                    Err(err) => {
                        warn!(
                            "event=live_query_fetch module=observe status=error context={} error={}",
                            context.id(),
                            err
                        );
                        continue;
                    }
                };
                let changes = records
                    .into_iter()
                    .enumerate()
                    .map(|(index, record)| ObjectChange {
                        kind: ChangeKind::Insert,
                        record,
                        old_index: None,
                        new_index: Some(index),
                    })
                    .collect();
                dispatch(&shared, &query, changes);
            }
            debug!(
                "event=live_query_start module=observe status=ok context={}",
                context.id()
            );
        });
    }

    /// On the context's queue: detaches from the change feed. Managed queries
    /// and in-flight sets are kept.
    pub fn stop(&self) {
        let shared = Arc::downgrade(&self.shared);
        self.context.perform(move |context| {
            if let Some(shared) = shared.upgrade() {
                detach(context, &shared);
            }
        });
    }

    /// On the context's queue: forgets every managed query.
    pub fn clear(&self) {
        let shared = Arc::downgrade(&self.shared);
        self.context.perform(move |_| {
            if let Some(shared) = shared.upgrade() {
                shared.managed.lock().clear();
            }
        });
    }

    /// Adds or removes `id` from the in-flight set of `query`. Does nothing
    /// for an unmanaged query.
    pub fn mark_in_progress(&self, id: &RecordId, query: &LiveQuery, in_progress: bool) {
        let mut managed = self.shared.managed.lock();
        let Some(entry) = managed.iter_mut().find(|entry| entry.query == *query) else {
            return;
        };
        if in_progress {
            entry.in_flight.insert(id.clone());
        } else {
            entry.in_flight.remove(id);
        }
    }

    pub fn is_in_progress(&self, id: &RecordId, query: &LiveQuery) -> bool {
        self.shared
            .managed
            .lock()
            .iter()
            .find(|entry| entry.query == *query)
            .is_some_and(|entry| entry.in_flight.contains(id))
    }
}

impl Drop for LiveQueryController {
    fn drop(&mut self) {
        if let Some(listener) = self.shared.listener.lock().take() {
            self.context.unsubscribe_changes(listener);
        }
    }
}

fn attach(context: &Context, shared: Weak<Shared>) -> ListenerId {
    let weak_context: WeakContext = context.downgrade();
    context.subscribe_changes(move |notification| {
        let (Some(shared), Some(context)) = (shared.upgrade(), weak_context.upgrade()) else {
            return;
        };
        reevaluate(&context, &shared, notification);
    })
}

fn detach(context: &Context, shared: &Shared) {
    if let Some(listener) = shared.listener.lock().take() {
        context.unsubscribe_changes(listener);
        debug!(
            "event=live_query_stop module=observe status=ok context={}",
            context.id()
        );
    }
}

fn reevaluate(context: &Context, shared: &Shared, notification: &ChangeNotification) {
    let queries: Vec<LiveQuery> = shared
        .managed
        .lock()
        .iter()
        .map(|entry| entry.query.clone())
        .collect();

    for query in queries {
        let records = match context.fetch(query.query()) {
            Ok(records) => records,
            Err(err) => {
                warn!(
                    "event=live_query_fetch module=observe status=error context={} error={}",
                    context.id(),
                    err
                );
                continue;
            }
        };
        let previous = query.replace_snapshot(records.clone());
        let changes = diff(&previous, &records, notification);
        dispatch(shared, &query, changes);
    }
}

fn dispatch(shared: &Shared, query: &LiveQuery, changes: Vec<ObjectChange>) {
    if changes.is_empty() {
        return;
    }
    let Some((handler, in_flight)) = shared.dispatch_target(query.id()) else {
        return;
    };
    for change in changes {
        if in_flight.contains(change.record.id()) {
            continue;
        }
        handler(query, &change);
    }
}

/// Transitions turning `previous` into `current`: deletes in previous order,
/// then inserts, updates and moves in current order.
fn diff(previous: &[Record], current: &[Record], notification: &ChangeNotification) -> Vec<ObjectChange> {
    let old_positions: BTreeMap<&RecordId, usize> = previous
        .iter()
        .enumerate()
        .map(|(index, record)| (record.id(), index))
        .collect();
    let new_ids: BTreeSet<&RecordId> = current.iter().map(|record| record.id()).collect();

    let mut changes = Vec::new();
    for (index, record) in previous.iter().enumerate() {
        if !new_ids.contains(record.id()) {
            changes.push(ObjectChange {
                kind: ChangeKind::Delete,
                record: record.clone(),
                old_index: Some(index),
                new_index: None,
            });
        }
    }

    // Relative order of the records present on both sides; inserts and
    // deletes around a record do not count as a move.
    let surviving_before: Vec<&RecordId> = previous
        .iter()
        .map(|record| record.id())
        .filter(|id| new_ids.contains(id))
        .collect();
    let mut surviving_rank = 0usize;

    for (index, record) in current.iter().enumerate() {
        let Some(&old_index) = old_positions.get(record.id()) else {
            changes.push(ObjectChange {
                kind: ChangeKind::Insert,
                record: record.clone(),
                old_index: None,
                new_index: Some(index),
            });
            continue;
        };

        let moved = surviving_before.get(surviving_rank) != Some(&record.id());
        surviving_rank += 1;
        let touched = notification.touches(record.id())
            || previous[old_index].fields() != record.fields();
        let kind = if touched {
            ChangeKind::Update
        } else if moved {
            ChangeKind::Move
        } else {
            continue;
        };
        changes.push(ObjectChange {
            kind,
            record: record.clone(),
            old_index: Some(old_index),
            new_index: Some(index),
        });
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::{diff, ChangeKind};
    use crate::context::ContextId;
    use crate::model::record::{Record, RecordId};
    use crate::store::coordinator::StoreId;
    use crate::store::notification::{ChangeNotification, ContextRole};
    use std::collections::BTreeSet;

    fn record(id: &str, rank: i64) -> Record {
        Record::with_id(RecordId::parse(id).unwrap(), "Note").with("rank", rank)
    }

    fn empty_notification() -> ChangeNotification {
        ChangeNotification::new(StoreId::for_tests(), ContextId::for_tests(), ContextRole::Root)
    }

    #[test]
    fn diff_reports_insert_and_delete() {
        let previous = vec![record("a", 1), record("b", 2)];
        let current = vec![record("b", 2), record("c", 3)];
        let changes = diff(&previous, &current, &empty_notification());
        let kinds: Vec<_> = changes
            .iter()
            .map(|change| (change.kind, change.record.id().to_string()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (ChangeKind::Delete, "a".to_string()),
                (ChangeKind::Insert, "c".to_string()),
            ]
        );
        assert_eq!(changes[0].old_index, Some(0));
        assert_eq!(changes[1].new_index, Some(1));
    }

    #[test]
    fn diff_reports_update_for_notified_or_changed_records() {
        let previous = vec![record("a", 1), record("b", 2)];
        let current = vec![record("a", 1), record("b", 5)];
        let mut notification = empty_notification();
        let fields: BTreeSet<String> = ["title".to_string()].into_iter().collect();
        notification.record_update(RecordId::parse("a").unwrap(), &fields);
        let changes = diff(&previous, &current, &notification);
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|change| change.kind == ChangeKind::Update));
    }

    #[test]
    fn diff_reports_move_only_for_reordered_survivors() {
        let previous = vec![record("a", 1), record("b", 2), record("c", 3)];
        let current = vec![record("x", 0), record("b", 2), record("a", 1), record("c", 3)];
        let changes = diff(&previous, &current, &empty_notification());
        let kinds: Vec<_> = changes
            .iter()
            .map(|change| (change.kind, change.record.id().to_string()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (ChangeKind::Insert, "x".to_string()),
                (ChangeKind::Move, "b".to_string()),
                (ChangeKind::Move, "a".to_string()),
            ]
        );
    }

    #[test]
    fn diff_of_identical_results_is_empty() {
        let records = vec![record("a", 1), record("b", 2)];
        assert!(diff(&records, &records, &empty_notification()).is_empty());
    }
}
