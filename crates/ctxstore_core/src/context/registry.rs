//! Registry of live root contexts targeted by save propagation.
//!
//! # Responsibility
//! - Track which contexts should receive merges of other contexts' saves.
//! - Hand out sibling snapshots without holding the lock during propagation.
//!
//! # Invariants
//! - Registration is idempotent and limited to root contexts.
//! - Entries are weak: a dropped context disappears on the next snapshot or
//!   sibling lookup.
//! - The lock only guards membership bookkeeping.

use crate::context::{Context, ContextId, WeakContext};
use crate::store::coordinator::StoreId;
use parking_lot::Mutex;
use std::collections::BTreeMap;

struct Entry {
    store: StoreId,
    context: WeakContext,
}

#[derive(Default)]
pub struct ContextRegistry {
    members: Mutex<BTreeMap<ContextId, Entry>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a root context; returns `false` when it was already registered
    /// or is a child context.
    pub fn register(&self, context: &Context) -> bool {
        if context.parent().is_some() {
            return false;
        }
        let mut members = self.members.lock();
        if members.contains_key(&context.id()) {
            return false;
        }
        members.insert(
            context.id(),
            Entry {
                store: context.store_id(),
                context: context.downgrade(),
            },
        );
        true
    }

    /// Removes a context; unknown ids are ignored.
    pub fn unregister(&self, id: ContextId) -> bool {
        self.members.lock().remove(&id).is_some()
    }

    pub fn contains(&self, id: ContextId) -> bool {
        self.members.lock().contains_key(&id)
    }

    /// Number of registered contexts still alive.
    pub fn len(&self) -> usize {
        self.prune();
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live registered contexts, in registration order.
    pub fn snapshot(&self) -> Vec<Context> {
        self.live_members(|_, _| true)
    }

    /// Live contexts on `store`, excluding `origin`.
    pub fn siblings_of(&self, store: StoreId, origin: ContextId) -> Vec<Context> {
        self.live_members(|id, entry| id != origin && entry.store == store)
    }

    /// Drops dead entries, then upgrades the matching ones outside the lock.
    fn live_members(&self, keep: impl Fn(ContextId, &Entry) -> bool) -> Vec<Context> {
        let entries: Vec<WeakContext> = {
            let mut members = self.members.lock();
            members.retain(|_, entry| entry.context.is_alive());
            members
                .iter()
                .filter(|(id, entry)| keep(**id, entry))
                .map(|(_, entry)| entry.context.clone())
                .collect()
        };
        entries.iter().filter_map(WeakContext::upgrade).collect()
    }

    fn prune(&self) {
        self.members
            .lock()
            .retain(|_, entry| entry.context.is_alive());
    }
}

#[cfg(test)]
mod tests {
    use super::ContextRegistry;
    use crate::context::queue::SerializationMode;
    use crate::context::{ConflictPolicy, Context};
    use crate::db::StoreLocation;
    use crate::model::schema::Model;
    use crate::store::coordinator::StoreCoordinator;
    use std::sync::Arc;

    fn root(store: &Arc<StoreCoordinator>) -> Context {
        Context::new(
            Arc::clone(store),
            None,
            SerializationMode::PrivateQueue,
            ConflictPolicy::Error,
        )
        .unwrap()
    }

    #[test]
    fn propagation_lookups_drop_dead_entries() {
        let store = Arc::new(
            StoreCoordinator::open(Model::new("Notes", 1), StoreLocation::Memory, false).unwrap(),
        );
        let registry = ContextRegistry::new();
        let origin = root(&store);
        let kept = root(&store);
        let dropped = root(&store);
        registry.register(&origin);
        registry.register(&kept);
        registry.register(&dropped);
        let dropped_id = dropped.id();
        drop(dropped);

        let siblings = registry.siblings_of(store.id(), origin.id());
        assert_eq!(siblings.len(), 1);
        assert!(siblings[0].same_as(&kept));
        assert!(!registry.contains(dropped_id));
        assert_eq!(registry.members.lock().len(), 2);

        drop(kept);
        drop(siblings);
        assert_eq!(registry.snapshot().len(), 1);
        assert_eq!(registry.members.lock().len(), 1);
    }
}
