//! Change notification produced by one successful save.

use crate::context::ContextId;
use crate::model::record::RecordId;
use crate::store::StoreId;
use std::collections::{BTreeMap, BTreeSet};

/// Whether a notification came from a root context (store commit) or from a
/// child context pushing into its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextRole {
    Root,
    Child,
}

/// Identities inserted, updated and deleted by one save.
///
/// Built once by the saver and then shared read-only (behind `Arc`) with
/// every consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    store: StoreId,
    origin: ContextId,
    origin_role: ContextRole,
    inserted: BTreeSet<RecordId>,
    updated: BTreeSet<RecordId>,
    deleted: BTreeSet<RecordId>,
    changed_fields: BTreeMap<RecordId, BTreeSet<String>>,
}

impl ChangeNotification {
    pub(crate) fn new(store: StoreId, origin: ContextId, origin_role: ContextRole) -> Self {
        Self {
            store,
            origin,
            origin_role,
            inserted: BTreeSet::new(),
            updated: BTreeSet::new(),
            deleted: BTreeSet::new(),
            changed_fields: BTreeMap::new(),
        }
    }

    pub(crate) fn record_insert(&mut self, id: RecordId) {
        self.inserted.insert(id);
    }

    pub(crate) fn record_update(&mut self, id: RecordId, fields: &BTreeSet<String>) {
        self.changed_fields
            .entry(id.clone())
            .or_default()
            .extend(fields.iter().cloned());
        self.updated.insert(id);
    }

    pub(crate) fn record_delete(&mut self, id: RecordId) {
        self.deleted.insert(id);
    }

    pub fn store(&self) -> StoreId {
        self.store
    }

    pub fn origin(&self) -> ContextId {
        self.origin
    }

    pub fn origin_role(&self) -> ContextRole {
        self.origin_role
    }

    pub fn inserted(&self) -> &BTreeSet<RecordId> {
        &self.inserted
    }

    pub fn updated(&self) -> &BTreeSet<RecordId> {
        &self.updated
    }

    pub fn deleted(&self) -> &BTreeSet<RecordId> {
        &self.deleted
    }

    /// Field names an update touched, when the identity was updated.
    pub fn changed_fields(&self, id: &RecordId) -> Option<&BTreeSet<String>> {
        self.changed_fields.get(id)
    }

    /// Whether `id` was inserted or updated by this save.
    pub fn touches(&self, id: &RecordId) -> bool {
        self.inserted.contains(id) || self.updated.contains(id)
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }
}
