//! Query description: entity kind, predicate, sort order and grouping key.

use crate::model::record::{Record, RecordId};
use serde_json::Value;
use std::cmp::Ordering;

/// Comparison applied by [`Predicate::Compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Record filter evaluated against field values.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    All,
    IdEquals(RecordId),
    Compare {
        field: String,
        op: CompareOp,
        value: Value,
    },
    /// Field is present and not null.
    Exists(String),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn id(id: RecordId) -> Self {
        Self::IdEquals(id)
    }

    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Eq, value)
    }

    pub fn compare(field: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Self::Compare {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Self::All => other,
            Self::And(mut parts) => {
                parts.push(other);
                Self::And(parts)
            }
            predicate => Self::And(vec![predicate, other]),
        }
    }

    pub fn all_of(parts: Vec<Predicate>) -> Self {
        Self::And(parts)
    }

    pub fn any_of(parts: Vec<Predicate>) -> Self {
        Self::Or(parts)
    }

    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Self::All => true,
            Self::IdEquals(id) => record.id() == id,
            Self::Compare { field, op, value } => {
                let ordering = compare_values(record.get(field), Some(value));
                match op {
                    CompareOp::Eq => ordering == Ordering::Equal,
                    CompareOp::Ne => ordering != Ordering::Equal,
                    // Ordered comparisons never match a missing field.
                    _ if record.get(field).is_none() => false,
                    CompareOp::Lt => ordering == Ordering::Less,
                    CompareOp::Le => ordering != Ordering::Greater,
                    CompareOp::Gt => ordering == Ordering::Greater,
                    CompareOp::Ge => ordering != Ordering::Less,
                }
            }
            Self::Exists(field) => record.get(field).is_some_and(|value| !value.is_null()),
            Self::And(parts) => parts.iter().all(|part| part.matches(record)),
            Self::Or(parts) => parts.iter().any(|part| part.matches(record)),
            Self::Not(inner) => !inner.matches(record),
        }
    }
}

/// What a sort key orders by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortField {
    Id,
    Field(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: SortField,
    pub ascending: bool,
}

/// Entity kind plus filter, sort order and optional grouping key.
///
/// Results are always totally ordered: ties after the declared keys are
/// broken by ascending identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    kind: String,
    predicate: Predicate,
    sort: Vec<SortKey>,
    group_by: Option<String>,
}

impl Query {
    /// Every record of `kind`, ordered by identity.
    pub fn all(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            predicate: Predicate::All,
            sort: Vec::new(),
            group_by: None,
        }
    }

    /// The single record with identity `id`.
    pub fn by_id(kind: impl Into<String>, id: RecordId) -> Self {
        Self::all(kind).filter(Predicate::id(id))
    }

    /// Narrows the query; successive calls are combined with AND.
    pub fn filter(mut self, predicate: Predicate) -> Self {
        let current = std::mem::replace(&mut self.predicate, Predicate::All);
        self.predicate = current.and(predicate);
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>, ascending: bool) -> Self {
        self.sort.push(SortKey {
            field: SortField::Field(field.into()),
            ascending,
        });
        self
    }

    pub fn sort_by_id(mut self, ascending: bool) -> Self {
        self.sort.push(SortKey {
            field: SortField::Id,
            ascending,
        });
        self
    }

    /// Groups results into sections by the value of `field`.
    pub fn group_by(mut self, field: impl Into<String>) -> Self {
        self.group_by = Some(field.into());
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    pub fn sort_keys(&self) -> &[SortKey] {
        &self.sort
    }

    pub fn group_key(&self) -> Option<&str> {
        self.group_by.as_deref()
    }

    pub fn matches(&self, record: &Record) -> bool {
        record.kind() == self.kind && self.predicate.matches(record)
    }

    /// Filters and sorts `records`.
    pub fn apply(&self, records: Vec<Record>) -> Vec<Record> {
        let mut matching: Vec<Record> = records
            .into_iter()
            .filter(|record| self.matches(record))
            .collect();
        matching.sort_by(|left, right| self.compare(left, right));
        matching
    }

    fn compare(&self, left: &Record, right: &Record) -> Ordering {
        for key in &self.sort {
            let ordering = match &key.field {
                SortField::Id => left.id().cmp(right.id()),
                SortField::Field(field) => compare_values(left.get(field), right.get(field)),
            };
            let ordering = if key.ascending {
                ordering
            } else {
                ordering.reverse()
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        left.id().cmp(right.id())
    }
}

/// Total order over optional JSON values: missing < null < bool < number <
/// string < array < object.
pub fn compare_values(left: Option<&Value>, right: Option<&Value>) -> Ordering {
    match (left, right) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(left), Some(right)) => {
            let rank = type_rank(left).cmp(&type_rank(right));
            if rank != Ordering::Equal {
                return rank;
            }
            match (left, right) {
                (Value::Bool(left), Value::Bool(right)) => left.cmp(right),
                (Value::Number(left), Value::Number(right)) => {
                    let left = left.as_f64().unwrap_or(f64::NAN);
                    let right = right.as_f64().unwrap_or(f64::NAN);
                    left.partial_cmp(&right).unwrap_or(Ordering::Equal)
                }
                (Value::String(left), Value::String(right)) => left.cmp(right),
                (left, right) => left.to_string().cmp(&right.to_string()),
            }
        }
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}
