//! Registry of live sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use parking_lot::RwLock;
use parley_core::protocol::ServerMessage;
use parley_core::{SessionId, Store};
use parley_telemetry::metrics::{
    SESSIONS_ACTIVE, SESSIONS_CLOSED_TOTAL, SESSIONS_CREATED_TOTAL, SESSIONS_EVICTED_TOTAL, SESSIONS_PAIRED_TOTAL,
};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::lru::LruIndex;
use super::{Session, Transport};
use crate::config::QueueCapacities;

/// Result of offering a session for pairing.
#[derive(Debug)]
pub enum PairOutcome {
    /// The slot was free; this session now waits in it.
    Waiting,
    /// Matched with the session that was waiting.
    Matched(Arc<Session>),
}

#[derive(Default)]
struct Inner {
    cache: HashMap<SessionId, Arc<Session>>,
    /// Long-poll sessions only.
    lru: LruIndex,
    pairs: HashMap<SessionId, SessionId>,
    need_pair: Option<SessionId>,
}

impl Inner {
    fn forget_pairing(&mut self, id: &SessionId) {
        if self.need_pair.as_ref() == Some(id) {
            self.need_pair = None;
        }
        if let Some(partner) = self.pairs.remove(id) {
            let _ = self.pairs.remove(&partner);
        }
    }
}

/// Owns every session after creation. All bookkeeping (cache, long-poll
/// LRU, pairing slot) sits behind one lock, taken exclusively by every
/// operation that touches it.
pub struct SessionStore {
    inner: RwLock<Inner>,
    /// How long an untouched long-poll session survives.
    lifetime: Duration,
    capacities: QueueCapacities,
    ids: Arc<dyn Store>,
}

impl SessionStore {
    pub fn new(ids: Arc<dyn Store>, lifetime: Duration, capacities: QueueCapacities) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            lifetime,
            capacities,
            ids,
        }
    }

    /// Register a new session. Creating a long-poll session also sweeps
    /// every long-poll session that outlived `lifetime`.
    #[instrument(skip_all, fields(transport = transport.kind().as_str()))]
    pub fn create(&self, transport: Transport, id: Option<SessionId>) -> Arc<Session> {
        let id = id.unwrap_or_else(|| SessionId::from_raw(self.ids.generate_unique_id()));
        let sess = Arc::new(Session::new(id.clone(), transport, self.capacities));

        let (replaced, evicted) = {
            let mut inner = self.inner.write();
            let replaced = inner.cache.insert(id.clone(), Arc::clone(&sess));
            if replaced.is_some() {
                let _ = inner.lru.remove(&id);
            }
            let mut evicted = Vec::new();
            if sess.is_long_poll() {
                let now = Instant::now();
                sess.touch(now);
                inner.lru.touch(id.clone(), now);
                for stale in inner.lru.pop_expired(now, self.lifetime) {
                    inner.forget_pairing(&stale);
                    if let Some(s) = inner.cache.remove(&stale) {
                        evicted.push(s);
                    }
                }
            }
            (replaced, evicted)
        };

        counter!(SESSIONS_CREATED_TOTAL, "transport" => sess.kind().as_str()).increment(1);
        if replaced.is_none() {
            gauge!(SESSIONS_ACTIVE).increment(1.0);
        }
        if let Some(old) = replaced {
            warn!(session_id = %id, "session id reused, dropping previous session");
            teardown(old);
        }
        if !evicted.is_empty() {
            info!(count = evicted.len(), "evicted idle long-poll sessions");
            counter!(SESSIONS_EVICTED_TOTAL).increment(evicted.len() as u64);
            gauge!(SESSIONS_ACTIVE).decrement(evicted.len() as f64);
            counter!(SESSIONS_CLOSED_TOTAL, "reason" => "evicted").increment(evicted.len() as u64);
            for s in evicted {
                teardown(s);
            }
        }
        debug!(session_id = %id, "session created");
        sess
    }

    /// Look up a session. A long-poll hit counts as activity: it moves to
    /// the LRU front and its lifetime restarts.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        let mut inner = self.inner.write();
        let sess = inner.cache.get(id).cloned()?;
        if sess.is_long_poll() {
            let now = Instant::now();
            sess.touch(now);
            inner.lru.touch(sess.id().clone(), now);
        }
        Some(sess)
    }

    /// Remove `sess` if it is still the registered session for its id.
    pub fn delete(&self, sess: &Session) -> bool {
        let removed = {
            let mut inner = self.inner.write();
            let current = inner
                .cache
                .get(sess.id())
                .is_some_and(|cached| std::ptr::eq(Arc::as_ptr(cached), sess));
            if current {
                let _ = inner.cache.remove(sess.id());
                let _ = inner.lru.remove(sess.id());
                inner.forget_pairing(sess.id());
            }
            current
        };
        if removed {
            gauge!(SESSIONS_ACTIVE).decrement(1.0);
            counter!(SESSIONS_CLOSED_TOTAL, "reason" => "closed").increment(1);
            debug!(session_id = %sess.id(), "session removed");
        }
        removed
    }

    /// Queue one shutdown notice on every live session. Does not wait for
    /// the notices to be written. Returns how many were queued.
    pub fn shutdown(&self) -> usize {
        let frame = match ServerMessage::shutdown().encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "failed to encode shutdown notice");
                return 0;
            }
        };

        let inner = self.inner.write();
        let mut queued = 0;
        for sess in inner.cache.values() {
            // A full mailbox gets the notice as the writer's last frame.
            let delivered = match sess.try_queue_out(Arc::clone(&frame)) {
                Ok(()) => true,
                Err(_) => sess.stop(Some(Arc::clone(&frame))),
            };
            if delivered {
                queued += 1;
            } else {
                warn!(session_id = %sess.id(), "could not queue shutdown notice");
            }
        }
        info!(sessions = inner.cache.len(), queued, "shutdown notice queued");
        queued
    }

    /// Offer `sess` for pairing. Either it takes the free slot or it is
    /// matched with the occupant and the slot is cleared. Stale occupants
    /// (closed or already deleted) are replaced.
    pub fn pair(&self, sess: &Arc<Session>) -> PairOutcome {
        let mut inner = self.inner.write();
        let id = sess.id().clone();
        let partner = match inner.need_pair.take() {
            Some(waiting) if waiting != id => inner.cache.get(&waiting).filter(|p| !p.is_closed()).cloned(),
            _ => None,
        };
        match partner {
            Some(partner) => {
                let _ = inner.pairs.insert(id.clone(), partner.id().clone());
                let _ = inner.pairs.insert(partner.id().clone(), id);
                counter!(SESSIONS_PAIRED_TOTAL).increment(1);
                PairOutcome::Matched(partner)
            }
            None => {
                inner.need_pair = Some(id);
                PairOutcome::Waiting
            }
        }
    }

    #[cfg(test)]
    fn paired_with(&self, id: &SessionId) -> Option<SessionId> {
        self.inner.read().pairs.get(id).cloned()
    }

    pub fn pending_pair(&self) -> Option<SessionId> {
        self.inner.read().need_pair.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn lru_ids(&self) -> Vec<SessionId> {
        self.inner.read().lru.ids()
    }
}

/// Close a session dropped by the store and leave its topics.
fn teardown(sess: Arc<Session>) {
    sess.terminate();
    let _ = sess.stop(None);
    match tokio::runtime::Handle::try_current() {
        Ok(rt) => {
            let _ = rt.spawn(async move { sess.leave_all().await });
        }
        Err(_) => debug!(session_id = %sess.id(), "no runtime, topics not notified"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::MemoryStore;
    use serde_json::Value;

    fn store_with(lifetime: Duration) -> SessionStore {
        SessionStore::new(
            Arc::new(MemoryStore::new()),
            lifetime,
            QueueCapacities {
                outbound: 4,
                detach: 2,
            },
        )
    }

    fn lp() -> Transport {
        Transport::LongPoll { remote_addr: None }
    }

    fn ws() -> Transport {
        Transport::WebSocket { remote_addr: None }
    }

    #[tokio::test(start_paused = true)]
    async fn create_generates_ids() {
        let store = store_with(Duration::from_secs(70));
        let a = store.create(ws(), None);
        let b = store.create(ws(), None);
        assert_ne!(a.id(), b.id());
        assert_eq!(store.len(), 2);
        assert!(Arc::ptr_eq(&store.get(a.id().as_str()).unwrap(), &a));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_long_poll_sessions_are_evicted_by_next_create() {
        let lifetime = Duration::from_secs(70);
        let store = store_with(lifetime);
        let stale: Vec<_> = (0..5).map(|_| store.create(lp(), None)).collect();
        tokio::time::advance(Duration::from_secs(60)).await;
        let fresh = store.create(lp(), None);
        let ws_sess = store.create(ws(), None);

        tokio::time::advance(Duration::from_secs(15)).await;
        let trigger = store.create(lp(), None);

        for s in &stale {
            assert!(store.get(s.id().as_str()).is_none());
            assert!(s.is_closed());
        }
        assert!(store.get(fresh.id().as_str()).is_some());
        assert!(store.get(trigger.id().as_str()).is_some());
        assert!(store.get(ws_sess.id().as_str()).is_some());
        assert_eq!(store.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn get_refreshes_long_poll_lifetime() {
        let lifetime = Duration::from_secs(70);
        let store = store_with(lifetime);
        let a = store.create(lp(), None);
        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(store.get(a.id().as_str()).is_some());
        assert_eq!(a.last_touched(), Instant::now());

        tokio::time::advance(Duration::from_secs(50)).await;
        let _ = store.create(lp(), None);
        assert!(store.get(a.id().as_str()).is_some(), "touched session must survive");
    }

    #[tokio::test(start_paused = true)]
    async fn get_moves_long_poll_to_front() {
        let store = store_with(Duration::from_secs(70));
        let a = store.create(lp(), None);
        let b = store.create(lp(), None);
        assert_eq!(store.lru_ids(), vec![b.id().clone(), a.id().clone()]);
        let _ = store.get(a.id().as_str());
        assert_eq!(store.lru_ids(), vec![a.id().clone(), b.id().clone()]);
    }

    #[tokio::test(start_paused = true)]
    async fn websocket_sessions_never_enter_the_lru() {
        let store = store_with(Duration::from_secs(1));
        let w = store.create(ws(), None);
        let _ = store.get(w.id().as_str());
        assert!(store.lru_ids().is_empty());

        tokio::time::advance(Duration::from_secs(10)).await;
        let _ = store.create(lp(), None);
        assert!(store.get(w.id().as_str()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn delete_removes_from_cache_and_lru() {
        let store = store_with(Duration::from_secs(70));
        let a = store.create(lp(), None);
        assert!(store.delete(&a));
        assert!(!store.delete(&a));
        assert!(store.get(a.id().as_str()).is_none());
        assert!(store.lru_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn delete_ignores_replaced_session() {
        let store = store_with(Duration::from_secs(70));
        let id = SessionId::from_raw("fixed");
        let old = store.create(ws(), Some(id.clone()));
        let new = store.create(ws(), Some(id.clone()));
        assert!(old.is_closed());
        assert!(!store.delete(&old));
        assert!(Arc::ptr_eq(&store.get("fixed").unwrap(), &new));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_queues_exactly_one_notice_per_session() {
        let store = store_with(Duration::from_secs(70));
        let sessions: Vec<_> = (0..3).map(|_| store.create(ws(), None)).collect();
        let mut queues = Vec::new();
        for s in &sessions {
            queues.push(s.take_queues().await.unwrap());
        }

        assert_eq!(store.shutdown(), 3);

        for q in &mut queues {
            let frame = q.send.try_recv().unwrap();
            let json: Value = serde_json::from_str(&frame).unwrap();
            assert_eq!(json["ctrl"]["code"], 205);
            assert_eq!(json["ctrl"]["text"], "shutdown");
            assert!(q.send.try_recv().is_err());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_falls_back_to_stop_when_mailbox_is_full() {
        let store = store_with(Duration::from_secs(70));
        let s = store.create(ws(), None);
        let mut q = s.take_queues().await.unwrap();
        for i in 0..4 {
            s.try_queue_out(Arc::from(format!("{i}"))).unwrap();
        }
        assert_eq!(store.shutdown(), 1);
        let last = q.stop.try_recv().unwrap().unwrap();
        assert!(last.contains("shutdown"));
        for _ in 0..4 {
            assert!(!q.send.try_recv().unwrap().contains("shutdown"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pairing_a_b_then_c() {
        let store = store_with(Duration::from_secs(70));
        let a = store.create(ws(), None);
        let b = store.create(ws(), None);
        let c = store.create(ws(), None);

        assert!(matches!(store.pair(&a), PairOutcome::Waiting));
        assert_eq!(store.pending_pair().as_ref(), Some(a.id()));

        match store.pair(&b) {
            PairOutcome::Matched(partner) => assert!(Arc::ptr_eq(&partner, &a)),
            PairOutcome::Waiting => panic!("b should match a"),
        }
        assert!(store.pending_pair().is_none());
        assert_eq!(store.paired_with(a.id()).as_ref(), Some(b.id()));
        assert_eq!(store.paired_with(b.id()).as_ref(), Some(a.id()));

        assert!(matches!(store.pair(&c), PairOutcome::Waiting));
        assert_eq!(store.pending_pair().as_ref(), Some(c.id()));
        assert!(store.paired_with(c.id()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn deleted_occupant_is_not_matched() {
        let store = store_with(Duration::from_secs(70));
        let a = store.create(ws(), None);
        let b = store.create(ws(), None);
        assert!(matches!(store.pair(&a), PairOutcome::Waiting));
        assert!(store.delete(&a));
        assert!(store.pending_pair().is_none());
        assert!(matches!(store.pair(&b), PairOutcome::Waiting));
        assert_eq!(store.pending_pair().as_ref(), Some(b.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn delete_clears_pair_entries() {
        let store = store_with(Duration::from_secs(70));
        let a = store.create(ws(), None);
        let b = store.create(ws(), None);
        let _ = store.pair(&a);
        let _ = store.pair(&b);
        assert!(store.delete(&b));
        assert!(store.paired_with(a.id()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn pairing_twice_keeps_single_occupant() {
        let store = store_with(Duration::from_secs(70));
        let a = store.create(ws(), None);
        assert!(matches!(store.pair(&a), PairOutcome::Waiting));
        assert!(matches!(store.pair(&a), PairOutcome::Waiting));
        assert_eq!(store.pending_pair().as_ref(), Some(a.id()));
    }
}
