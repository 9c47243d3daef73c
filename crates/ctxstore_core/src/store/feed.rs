//! Typed publish/subscribe channel.
//!
//! Used twice: the store's commit channel and each context's change feed.
//! Subscribers are snapshotted before publishing and called with no lock
//! held, so a subscriber may subscribe or unsubscribe re-entrantly. A
//! subscriber removed during a publish round still sees that round.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Handle returned by [`ChangeFeed::subscribe`].
pub type ListenerId = u64;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct ChangeFeed<T> {
    listeners: Mutex<Vec<(ListenerId, Listener<T>)>>,
    next_id: AtomicU64,
}

impl<T> ChangeFeed<T> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Removes a subscriber; returns whether it was present.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    pub fn publish(&self, value: &T) {
        let snapshot: Vec<Listener<T>> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in snapshot {
            listener(value);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

impl<T> Default for ChangeFeed<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::ChangeFeed;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn publish_reaches_every_subscriber_until_unsubscribed() {
        let feed = ChangeFeed::<u32>::new();
        let total = Arc::new(AtomicUsize::new(0));

        let first = {
            let total = Arc::clone(&total);
            feed.subscribe(move |value| {
                total.fetch_add(*value as usize, Ordering::SeqCst);
            })
        };
        {
            let total = Arc::clone(&total);
            feed.subscribe(move |value| {
                total.fetch_add(*value as usize * 10, Ordering::SeqCst);
            });
        }

        feed.publish(&1);
        assert_eq!(total.load(Ordering::SeqCst), 11);

        assert!(feed.unsubscribe(first));
        assert!(!feed.unsubscribe(first));
        feed.publish(&1);
        assert_eq!(total.load(Ordering::SeqCst), 21);
        assert_eq!(feed.subscriber_count(), 1);
    }

    #[test]
    fn subscriber_may_unsubscribe_itself_while_publishing() {
        let feed = Arc::new(ChangeFeed::<()>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let slot = Arc::new(AtomicUsize::new(0));

        let id = {
            let feed_ref = Arc::downgrade(&feed);
            let calls = Arc::clone(&calls);
            let slot = Arc::clone(&slot);
            feed.subscribe(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(feed) = feed_ref.upgrade() {
                    feed.unsubscribe(slot.load(Ordering::SeqCst) as u64);
                }
            })
        };
        slot.store(id as usize, Ordering::SeqCst);

        feed.publish(&());
        feed.publish(&());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
