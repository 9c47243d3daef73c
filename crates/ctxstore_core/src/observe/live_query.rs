use super::query::{compare_values, Query};
use crate::context::Context;
use crate::db::StoreResult;
use crate::model::record::Record;
use parking_lot::Mutex;
use serde_json::Value;
use std::cmp::Ordering as CmpOrdering;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_LIVE_QUERY_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LiveQueryId(u64);

struct LiveQueryInner {
    id: LiveQueryId,
    query: Query,
    context: Context,
    snapshot: Mutex<Vec<Record>>,
}

/// A query bound to one context together with its last fetched results.
///
/// Clones share identity and snapshot. The snapshot only changes when the
/// query is fetched on its context's queue.
#[derive(Clone)]
pub struct LiveQuery {
    inner: Arc<LiveQueryInner>,
}

/// Records sharing one grouping key, in result order.
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    /// `None` when the query has no grouping key or the field is missing.
    pub key: Option<Value>,
    pub records: Vec<Record>,
}

impl LiveQuery {
    pub fn new(context: &Context, query: Query) -> Self {
        Self {
            inner: Arc::new(LiveQueryInner {
                id: LiveQueryId(NEXT_LIVE_QUERY_ID.fetch_add(1, Ordering::Relaxed)),
                query,
                context: context.clone(),
                snapshot: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> LiveQueryId {
        self.inner.id
    }

    pub fn query(&self) -> &Query {
        &self.inner.query
    }

    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    /// Results of the last fetch; empty before the first one.
    pub fn fetched_records(&self) -> Vec<Record> {
        self.inner.snapshot.lock().clone()
    }

    /// Fetches the query now and stores the result as the new snapshot.
    pub fn fetch(&self) -> StoreResult<Vec<Record>> {
        let records = self.inner.context.fetch(&self.inner.query)?;
        *self.inner.snapshot.lock() = records.clone();
        Ok(records)
    }

    /// Swaps in `records` and returns the previous snapshot.
    pub(crate) fn replace_snapshot(&self, records: Vec<Record>) -> Vec<Record> {
        std::mem::replace(&mut *self.inner.snapshot.lock(), records)
    }

    /// Last fetched results grouped by the query's grouping key.
    ///
    /// Sections are ordered by key; records keep their result order inside a
    /// section. Without a grouping key the whole snapshot is one section.
    pub fn sections(&self) -> Vec<Section> {
        let records = self.fetched_records();
        let Some(field) = self.inner.query.group_key() else {
            if records.is_empty() {
                return Vec::new();
            }
            return vec![Section { key: None, records }];
        };

        let mut sections: Vec<Section> = Vec::new();
        for record in records {
            let key = record.get(field).cloned();
            match sections
                .iter_mut()
                .find(|section| compare_values(section.key.as_ref(), key.as_ref()) == CmpOrdering::Equal)
            {
                Some(section) => section.records.push(record),
                None => sections.push(Section {
                    key,
                    records: vec![record],
                }),
            }
        }
        sections.sort_by(|left, right| compare_values(left.key.as_ref(), right.key.as_ref()));
        sections
    }
}

impl PartialEq for LiveQuery {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for LiveQuery {}

impl Debug for LiveQuery {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveQuery")
            .field("id", &self.inner.id)
            .field("context", &self.inner.context.id())
            .field("query", &self.inner.query)
            .finish()
    }
}
