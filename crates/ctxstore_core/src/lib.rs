//! Multi-context persistence coordination over a shared record store.
//!
//! Contexts are serialized sessions over one store. Saving a root context
//! commits to the store and merges the change into every other root context
//! of that store on its own queue; live queries observe each context and
//! report per-record transitions.

pub mod collection;
pub mod context;
pub mod db;
pub mod logging;
pub mod model;
pub mod observe;
pub mod persistence;
pub mod repo;
pub mod store;

pub use collection::ManagedContext;
pub use context::queue::{QueueError, SerializationMode};
pub use context::registry::ContextRegistry;
pub use context::{ConflictPolicy, Context, ContextId, WeakContext};
pub use db::{StoreError, StoreLocation, StoreResult};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError, LoggingStatus};
pub use model::record::{Record, RecordId};
pub use model::schema::{EntityKind, Model, RecordValidationError};
pub use observe::{
    ChangeKind, LiveQuery, LiveQueryController, ObjectChange, ObserveError, Predicate, Query,
    Registration,
};
pub use persistence::{Persistence, PersistenceConfig, StoreKind};
pub use store::{ChangeNotification, ContextRole, StoreCoordinator, StoreId};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
