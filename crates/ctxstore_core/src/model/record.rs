//! Record identity and field storage.
//!
//! # Responsibility
//! - Provide the externally stable string identity used for cross-context lookup.
//! - Track changed field names as an explicit value produced by mutations.
//!
//! # Invariants
//! - `RecordId` is never blank.
//! - `Record::changed_fields` contains exactly the fields touched through
//!   `set`/`remove` since the record was last loaded or saved.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Stable string identity of a persisted record.
///
/// Generated identities are UUID v4 strings; imported identities may be any
/// non-blank string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Generates a fresh identity from a random UUID.
    pub fn new() -> Self {
        Self::from_uuid(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid.to_string())
    }

    /// Accepts any non-blank identity string, trimmed.
    pub fn parse(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the UUID form when this identity was derived from one.
    pub fn uuid(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.0).ok()
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Uuid> for RecordId {
    fn from(value: Uuid) -> Self {
        Self::from_uuid(value)
    }
}

/// A materialized record of one entity kind.
///
/// A record value belongs to the context that produced it. The same identity
/// may exist as distinct values in several contexts, correlated only by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    id: RecordId,
    kind: String,
    fields: BTreeMap<String, Value>,
    /// Store version the record was loaded at; `0` until first persisted.
    #[serde(skip)]
    version: u64,
    #[serde(skip)]
    changed: BTreeSet<String>,
}

impl Record {
    /// Creates an unsaved record with a generated identity.
    pub fn new(kind: impl Into<String>) -> Self {
        Self::with_id(RecordId::new(), kind)
    }

    /// Creates an unsaved record with a caller-provided identity.
    pub fn with_id(id: RecordId, kind: impl Into<String>) -> Self {
        Self {
            id,
            kind: kind.into(),
            fields: BTreeMap::new(),
            version: 0,
            changed: BTreeSet::new(),
        }
    }

    pub(crate) fn from_store(
        id: RecordId,
        kind: String,
        fields: BTreeMap<String, Value>,
        version: u64,
    ) -> Self {
        Self {
            id,
            kind,
            fields,
            version,
            changed: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> &RecordId {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// Sets one field and records it as changed.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        let field = field.into();
        self.changed.insert(field.clone());
        self.fields.insert(field, value.into());
    }

    /// Builder-style variant of [`Record::set`].
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    /// Removes one field and records it as changed.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.changed.insert(field.to_string());
        self.fields.remove(field)
    }

    /// Field names touched since the record was loaded or last saved.
    pub fn changed_fields(&self) -> &BTreeSet<String> {
        &self.changed
    }

    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty()
    }

    pub(crate) fn mark_saved(&mut self, version: u64) {
        self.version = version;
        self.changed.clear();
    }

    pub(crate) fn clear_changes(&mut self) {
        self.changed.clear();
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    /// Copies this record's changed fields onto `base`, keeping `base`'s version.
    ///
    /// `skip` names fields that must keep the base value.
    pub(crate) fn reapply_changes(&self, base: &Record, skip: Option<&BTreeSet<String>>) -> Record {
        let mut merged = base.clone();
        merged.changed.clear();
        for field in &self.changed {
            if skip.is_some_and(|skipped| skipped.contains(field)) {
                continue;
            }
            match self.fields.get(field) {
                Some(value) => {
                    merged.fields.insert(field.clone(), value.clone());
                }
                None => {
                    merged.fields.remove(field);
                }
            }
            merged.changed.insert(field.clone());
        }
        merged
    }
}
