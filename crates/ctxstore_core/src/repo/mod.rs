//! Repository layer over the record table.
//!
//! # Responsibility
//! - Define the record persistence contract used by the store coordinator.
//! - Keep SQL details inside the persistence boundary.
//!
//! # Invariants
//! - Updates are optimistic: an expected version that no longer matches is a
//!   conflict, never a silent overwrite.

pub mod record_repo;
