//! Record and schema model shared by every context.
//!
//! # Responsibility
//! - Define the record shape materialized in contexts and persisted in the store.
//! - Define the model (schema) the store coordinator validates saves against.
//!
//! # Invariants
//! - Every record is identified by a stable `RecordId`, independent of any
//!   engine-internal row pointer.
//! - Field mutations are tracked explicitly at mutation time.

pub mod record;
pub mod schema;
