//! Save propagation between sibling root contexts.
//!
//! # Responsibility
//! - Listen on a store's commit channel.
//! - Schedule a merge of every root save on each other registered root
//!   context of the same store, on that context's own queue.
//!
//! # Invariants
//! - Child-origin notifications are never propagated.
//! - Propagation never blocks: merges are fire-and-forget per sibling.
//! - Per-sibling merge order equals commit order, because commits are
//!   published in order and each sibling's queue is serial.

use crate::context::registry::ContextRegistry;
use crate::store::coordinator::StoreCoordinator;
use crate::store::feed::ListenerId;
use crate::store::notification::{ChangeNotification, ContextRole};
use log::debug;
use std::sync::Arc;

pub struct SavePropagator {
    registry: Arc<ContextRegistry>,
}

impl SavePropagator {
    pub fn new(registry: Arc<ContextRegistry>) -> Self {
        Self { registry }
    }

    /// Subscribes a propagator to `store`'s commit channel.
    pub fn attach(store: &StoreCoordinator, registry: Arc<ContextRegistry>) -> ListenerId {
        let propagator = Self::new(registry);
        store.subscribe(move |notification| {
            propagator.on_save(notification);
        })
    }

    /// Schedules merges of `notification` on every sibling of its origin;
    /// returns how many were scheduled.
    pub fn on_save(&self, notification: &Arc<ChangeNotification>) -> usize {
        if notification.origin_role() == ContextRole::Child || notification.is_empty() {
            return 0;
        }

        let siblings = self
            .registry
            .siblings_of(notification.store(), notification.origin());
        for sibling in &siblings {
            sibling.schedule_merge(Arc::clone(notification));
        }

        debug!(
            "event=save_propagate module=context status=ok store={} origin={} siblings={} changes={}",
            notification.store(),
            notification.origin(),
            siblings.len(),
            notification.len()
        );
        siblings.len()
    }
}
