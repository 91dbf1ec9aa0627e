//! Recency index of long-poll sessions.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use parley_core::SessionId;
use tokio::time::Instant;

/// Sessions ordered by last touch. Ties (same instant, e.g. under a paused
/// clock) are broken by touch order.
#[derive(Debug, Default)]
pub(crate) struct LruIndex {
    order: BTreeMap<(Instant, u64), SessionId>,
    index: HashMap<SessionId, (Instant, u64)>,
    next: u64,
}

impl LruIndex {
    /// Move `id` to the front, stamped with `at`.
    pub fn touch(&mut self, id: SessionId, at: Instant) {
        if let Some(key) = self.index.remove(&id) {
            let _ = self.order.remove(&key);
        }
        let key = (at, self.next);
        self.next += 1;
        let _ = self.order.insert(key, id.clone());
        let _ = self.index.insert(id, key);
    }

    pub fn remove(&mut self, id: &SessionId) -> bool {
        match self.index.remove(id) {
            Some(key) => {
                let _ = self.order.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Pop every entry from the back that was last touched more than
    /// `lifetime` before `now`.
    pub fn pop_expired(&mut self, now: Instant, lifetime: Duration) -> Vec<SessionId> {
        let mut expired = Vec::new();
        while let Some((&(touched, seq), _)) = self.order.first_key_value() {
            if now.saturating_duration_since(touched) <= lifetime {
                break;
            }
            if let Some(id) = self.order.remove(&(touched, seq)) {
                let _ = self.index.remove(&id);
                expired.push(id);
            }
        }
        expired
    }

    #[cfg(test)]
    fn contains(&self, id: &SessionId) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Most recently touched first.
    pub fn ids(&self) -> Vec<SessionId> {
        self.order.values().rev().cloned().collect()
    }
}
