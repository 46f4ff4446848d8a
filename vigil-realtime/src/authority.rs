//! In-memory authority log: the fast path for duplicate suppression.
//!
//! Remembers recently applied event ids and business-level semantic keys so
//! that duplicates are dropped without a storage round trip. Bounded by both
//! capacity (oldest evicted first) and age.

use std::collections::{HashMap, VecDeque};

/// Outcome of [`AuthorityLog::inspect`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Never applied in this tab.
    Fresh,
    /// This exact event id was already applied in this tab.
    Seen,
    /// The business fact is already reflected locally; do not notify again.
    Suppressed(SuppressReason),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuppressReason {
    /// Semantic key already applied (e.g. badge already granted).
    Semantic,
    /// Event originated from this client and was applied optimistically.
    Echo,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum AuthorityKey {
    Event(String),
    Semantic(String),
}

pub struct AuthorityLog {
    capacity: usize,
    ttl_ms: i64,
    order: VecDeque<(AuthorityKey, i64)>,
    recorded: HashMap<AuthorityKey, i64>,
}

impl AuthorityLog {
    pub fn new(capacity: usize, ttl_ms: u64) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl_ms: ttl_ms.min(i64::MAX as u64) as i64,
            order: VecDeque::new(),
            recorded: HashMap::new(),
        }
    }

    /// Single check combining event id, semantic key and echo origin.
    ///
    /// An event id hit wins over the other inputs: the event itself already
    /// went through the pipeline, so nothing is left to do for it.
    pub fn inspect(
        &mut self,
        event_id: Option<&str>,
        semantic_key: Option<&str>,
        is_echo: bool,
        now_ms: i64,
    ) -> Verdict {
        self.purge(now_ms);

        if let Some(id) = event_id {
            if self.recorded.contains_key(&AuthorityKey::Event(id.to_string())) {
                return Verdict::Seen;
            }
        }
        if let Some(key) = semantic_key {
            if self.recorded.contains_key(&AuthorityKey::Semantic(key.to_string())) {
                return Verdict::Suppressed(SuppressReason::Semantic);
            }
        }
        if is_echo {
            return Verdict::Suppressed(SuppressReason::Echo);
        }
        Verdict::Fresh
    }

    /// Remembers an applied event and its semantic key.
    pub fn record(&mut self, event_id: Option<&str>, semantic_key: Option<&str>, now_ms: i64) {
        if let Some(id) = event_id {
            self.insert(AuthorityKey::Event(id.to_string()), now_ms);
        }
        if let Some(key) = semantic_key {
            self.insert(AuthorityKey::Semantic(key.to_string()), now_ms);
        }
        self.purge(now_ms);
    }

    pub fn contains_event(&self, event_id: &str) -> bool {
        self.recorded
            .contains_key(&AuthorityKey::Event(event_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.recorded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recorded.is_empty()
    }

    fn insert(&mut self, key: AuthorityKey, now_ms: i64) {
        if self.recorded.contains_key(&key) {
            return;
        }
        self.recorded.insert(key.clone(), now_ms);
        self.order.push_back((key, now_ms));
    }

    fn purge(&mut self, now_ms: i64) {
        while let Some((key, recorded_at)) = self.order.front() {
            let expired = recorded_at.saturating_add(self.ttl_ms) <= now_ms;
            if !expired && self.order.len() <= self.capacity {
                break;
            }
            self.recorded.remove(key);
            self.order.pop_front();
        }
    }
}
