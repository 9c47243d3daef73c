//! Store model: entity kinds and save-time validation.

use crate::model::record::Record;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Validation failures reported when a context saves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordValidationError {
    UnknownKind {
        kind: String,
    },
    MissingField {
        kind: String,
        field: String,
        id: String,
    },
}

impl Display for RecordValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownKind { kind } => write!(f, "entity kind `{kind}` is not part of the model"),
            Self::MissingField { kind, field, id } => {
                write!(f, "{kind} `{id}` is missing required field `{field}`")
            }
        }
    }
}

impl Error for RecordValidationError {}

/// One persisted entity kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityKind {
    name: String,
    required: Vec<String>,
}

impl EntityKind {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: Vec::new(),
        }
    }

    /// Declares a field every record of this kind must carry.
    pub fn require(mut self, field: impl Into<String>) -> Self {
        self.required.push(field.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn required_fields(&self) -> &[String] {
        &self.required
    }
}

/// Named, versioned schema owned by the store coordinator.
///
/// The name and version are stamped into the store file; opening a file
/// stamped with a different model is treated as a schema mismatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    name: String,
    version: u32,
    kinds: BTreeMap<String, EntityKind>,
}

impl Model {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
            kinds: BTreeMap::new(),
        }
    }

    pub fn with_kind(mut self, kind: EntityKind) -> Self {
        self.kinds.insert(kind.name.clone(), kind);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn kind(&self, name: &str) -> Option<&EntityKind> {
        self.kinds.get(name)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &EntityKind> {
        self.kinds.values()
    }

    pub fn validate(&self, record: &Record) -> Result<(), RecordValidationError> {
        let kind = self
            .kind(record.kind())
            .ok_or_else(|| RecordValidationError::UnknownKind {
                kind: record.kind().to_string(),
            })?;

        for field in &kind.required {
            let present = record.get(field).is_some_and(|value| !value.is_null());
            if !present {
                return Err(RecordValidationError::MissingField {
                    kind: kind.name.clone(),
                    field: field.clone(),
                    id: record.id().to_string(),
                });
            }
        }
        Ok(())
    }
}
