use std::sync::Arc;
use std::time::Instant;

use moka::sync::Cache;

use crate::proto::{Question, Sections};

/// Answers obtained from the upstream, keyed by the question that was
/// forwarded.
///
/// Entries carry no expiry of their own in moka; liveness comes from the
/// record TTLs and is checked on every lookup. The capacity bound only
/// protects memory against clients asking for many distinct names.
#[derive(Clone)]
pub struct AnswerCache {
    inner: Cache<Question, Arc<Sections>>,
}

impl AnswerCache {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            inner: Cache::builder().max_capacity(max_capacity).build(),
        }
    }

    /// Returns the cached sections only if every record is still live at
    /// `now`. A single expired record evicts the whole entry.
    pub fn lookup(&self, question: &Question, now: Instant) -> Option<Arc<Sections>> {
        let entry = self.inner.get(question)?;
        if entry.all_live(now) {
            Some(entry)
        } else {
            self.inner.invalidate(question);
            None
        }
    }

    /// Replaces whatever was cached for `question`.
    ///
    /// An empty reply (NXDOMAIN, or a SERVFAIL from the upstream) has no
    /// record to expire, so it stays until capacity eviction or the next
    /// store for the same question.
    pub fn store(&self, question: Question, sections: Sections) {
        self.inner.insert(question, Arc::new(sections));
    }

    #[allow(dead_code)]
    pub fn contains(&self, question: &Question) -> bool {
        self.inner.contains_key(question)
    }
}
