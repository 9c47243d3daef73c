//! Store coordinator, change notifications and the per-store commit channel.
//!
//! # Responsibility
//! - Own the backing connection and the active model for one store.
//! - Commit context batches transactionally and publish what changed.
//!
//! # Invariants
//! - Exactly one connection per store; commits are serialized on it.
//! - Notifications are published in commit order and never mutated.

pub mod coordinator;
pub mod feed;
pub mod notification;

pub use coordinator::{StoreCoordinator, StoreId};
pub use feed::{ChangeFeed, ListenerId};
pub use notification::{ChangeNotification, ContextRole};
