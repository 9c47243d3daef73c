//! Pending-change bookkeeping of one context.
//!
//! # Invariants
//! - `inserted`, `updated` and `deleted` are pairwise disjoint.
//! - Every inserted or updated identity has its current value in `registered`.
//! - Deleted identities are absent from `registered`.

use crate::context::ConflictPolicy;
use crate::model::record::{Record, RecordId};
use crate::store::notification::ChangeNotification;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Default)]
pub(crate) struct ContextState {
    registered: BTreeMap<RecordId, Record>,
    inserted: BTreeSet<RecordId>,
    updated: BTreeSet<RecordId>,
    deleted: BTreeSet<RecordId>,
}

/// Pending changes copied out of a context for a save.
#[derive(Debug, Default)]
pub(crate) struct PendingChanges {
    pub inserts: Vec<Record>,
    pub updates: Vec<Record>,
    pub deletes: Vec<RecordId>,
}

impl ContextState {
    pub fn has_changes(&self) -> bool {
        !self.inserted.is_empty() || !self.updated.is_empty() || !self.deleted.is_empty()
    }

    pub fn is_deleted(&self, id: &RecordId) -> bool {
        self.deleted.contains(id)
    }

    pub fn is_dirty(&self, id: &RecordId) -> bool {
        self.inserted.contains(id) || self.updated.contains(id)
    }

    pub fn registered(&self, id: &RecordId) -> Option<&Record> {
        self.registered.get(id)
    }

    pub fn registered_ids(&self) -> impl Iterator<Item = &RecordId> {
        self.registered.keys()
    }

    /// Caches a record read from the store or the parent; pending identities
    /// keep their local value.
    pub fn register_clean(&mut self, mut record: Record) {
        if self.is_dirty(record.id()) || self.is_deleted(record.id()) {
            return;
        }
        record.clear_changes();
        self.registered.insert(record.id().clone(), record);
    }

    pub fn stage_insert(&mut self, record: Record) {
        let id = record.id().clone();
        if self.deleted.remove(&id) {
            self.updated.insert(id.clone());
        } else if !self.updated.contains(&id) {
            self.inserted.insert(id.clone());
        }
        self.registered.insert(id, record);
    }

    pub fn stage_update(&mut self, record: Record) {
        let id = record.id().clone();
        if !self.inserted.contains(&id) {
            self.updated.insert(id.clone());
        }
        self.registered.insert(id, record);
    }

    /// Stages a deletion. A pending insert is simply discarded.
    pub fn stage_delete(&mut self, id: &RecordId) {
        self.registered.remove(id);
        if self.inserted.remove(id) {
            return;
        }
        self.updated.remove(id);
        self.deleted.insert(id.clone());
    }

    /// Applies field-level changes pushed by a child context.
    pub fn absorb_update(&mut self, pushed: Record) {
        let mut target = match self.registered.get(pushed.id()) {
            Some(current) => current.clone(),
            None => {
                let mut base = pushed.clone();
                base.clear_changes();
                base
            }
        };
        for field in pushed.changed_fields() {
            match pushed.get(field) {
                Some(value) => target.set(field.clone(), value.clone()),
                None => {
                    target.remove(field);
                }
            }
        }
        self.stage_update(target);
    }

    /// Merges pending values over `base` records of `kind`.
    ///
    /// Pending deletes are hidden, dirty records use their local value, clean
    /// cached records are refreshed from `base`, and pending inserts of the
    /// kind are appended.
    pub fn overlay(&mut self, kind: &str, base: Vec<Record>) -> Vec<Record> {
        let mut seen = BTreeSet::new();
        let mut merged = Vec::with_capacity(base.len());
        for record in base {
            let id = record.id().clone();
            seen.insert(id.clone());
            if self.deleted.contains(&id) {
                continue;
            }
            if self.is_dirty(&id) {
                if let Some(local) = self.registered.get(&id) {
                    if local.kind() == kind {
                        merged.push(local.clone());
                    }
                }
                continue;
            }
            self.register_clean(record.clone());
            merged.push(record);
        }

        for id in self.inserted.iter().chain(self.updated.iter()) {
            if seen.contains(id) {
                continue;
            }
            if let Some(local) = self.registered.get(id) {
                if local.kind() == kind {
                    merged.push(local.clone());
                }
            }
        }
        merged
    }

    pub fn pending(&self) -> PendingChanges {
        let collect = |ids: &BTreeSet<RecordId>| -> Vec<Record> {
            ids.iter()
                .filter_map(|id| self.registered.get(id).cloned())
                .collect()
        };
        PendingChanges {
            inserts: collect(&self.inserted),
            updates: collect(&self.updated),
            deletes: self.deleted.iter().cloned().collect(),
        }
    }

    /// Marks a successful store save: saved records become clean at their
    /// new versions; discarded updates are replaced by `refreshed` values.
    pub fn apply_saved(
        &mut self,
        versions: &BTreeMap<RecordId, u64>,
        refreshed: Vec<(RecordId, Option<Record>)>,
    ) {
        for (id, version) in versions {
            if let Some(record) = self.registered.get_mut(id) {
                record.mark_saved(*version);
            }
        }
        self.inserted.clear();
        self.updated.clear();
        self.deleted.clear();

        for (id, fresh) in refreshed {
            match fresh {
                Some(record) => {
                    self.registered.insert(id, record);
                }
                None => {
                    self.registered.remove(&id);
                }
            }
        }
    }

    /// Marks a successful push into the parent: local values become clean.
    pub fn apply_pushed(&mut self) {
        for id in self.inserted.iter().chain(self.updated.iter()) {
            if let Some(record) = self.registered.get_mut(id) {
                record.clear_changes();
            }
        }
        self.inserted.clear();
        self.updated.clear();
        self.deleted.clear();
    }

    pub fn rollback(&mut self) {
        for id in self.inserted.iter().chain(self.updated.iter()) {
            self.registered.remove(id);
        }
        self.inserted.clear();
        self.updated.clear();
        self.deleted.clear();
    }

    /// Replaces a cached record with the store's current value, resolving a
    /// local edit of the same identity with `policy`.
    pub fn refresh(
        &mut self,
        fresh: Record,
        notification: &ChangeNotification,
        policy: ConflictPolicy,
    ) {
        let id = fresh.id().clone();
        if self.deleted.contains(&id) || self.inserted.contains(&id) {
            return;
        }
        if !self.updated.contains(&id) {
            if self.registered.contains_key(&id) {
                self.registered.insert(id, fresh);
            }
            return;
        }

        let Some(local) = self.registered.get(&id) else {
            return;
        };
        let merged = match policy {
            ConflictPolicy::Error => return,
            ConflictPolicy::ContextWins => local.reapply_changes(&fresh, None),
            ConflictPolicy::StoreWins => {
                local.reapply_changes(&fresh, notification.changed_fields(&id))
            }
        };
        if !merged.has_changes() {
            self.updated.remove(&id);
        }
        self.registered.insert(id, merged);
    }

    /// Drops every trace of an identity deleted elsewhere, except a pending
    /// local insert of the same identity.
    pub fn forget(&mut self, id: &RecordId) {
        if self.inserted.contains(id) {
            return;
        }
        self.registered.remove(id);
        self.updated.remove(id);
        self.deleted.remove(id);
    }
}
