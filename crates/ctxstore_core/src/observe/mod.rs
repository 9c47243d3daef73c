//! Live-query observation.
//!
//! A [`LiveQuery`] binds a [`Query`] to one context; a
//! [`LiveQueryController`] keeps several of them current as the context
//! observes changes and reports per-record transitions to handlers.

pub mod controller;
pub mod live_query;
pub mod query;

pub use controller::{
    ChangeKind, LiveQueryController, ObjectChange, ObjectHandler, ObserveError, Registration,
};
pub use live_query::{LiveQuery, LiveQueryId, Section};
pub use query::{CompareOp, Predicate, Query, SortField, SortKey};
