//! Client sessions.
//!
//! A [`Session`] is one client connection, independent of the transport
//! carrying it. Topic actors push encoded frames into its outbound mailbox;
//! exactly one consumer drains that mailbox: the WebSocket writer task, or
//! whichever long-poll request currently holds the queues.

pub mod dispatch;
mod lru;
mod store;

pub use store::{PairOutcome, SessionStore};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use parley_core::protocol::ServerMessage;
use parley_core::{ProtocolError, SessionId, Uid};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::QueueCapacities;
use crate::errors::SessionClosed;
use crate::topic::{SessionLeave, TopicHandle};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    WebSocket,
    LongPoll,
    None,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WebSocket => "ws",
            Self::LongPoll => "lp",
            Self::None => "none",
        }
    }
}

/// What a session is created from. Long-poll has no persistent handle: the
/// HTTP request changes with every poll.
#[derive(Clone, Copy, Debug)]
pub enum Transport {
    WebSocket { remote_addr: Option<SocketAddr> },
    LongPoll { remote_addr: Option<SocketAddr> },
    /// Server-internal session with no peer.
    None,
}

impl Transport {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::WebSocket { .. } => TransportKind::WebSocket,
            Self::LongPoll { .. } => TransportKind::LongPoll,
            Self::None => TransportKind::None,
        }
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::WebSocket { remote_addr } | Self::LongPoll { remote_addr } => *remote_addr,
            Self::None => None,
        }
    }
}

/// A topic actor evicting this session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Detach {
    pub topic: String,
    /// Id of the actor that sent it; a newer actor's subscription survives.
    pub actor: u64,
}

/// Consumer side of a session's mailboxes.
pub struct SessionQueues {
    pub send: mpsc::Receiver<Arc<str>>,
    /// Stop request with an optional last frame to write.
    pub stop: mpsc::Receiver<Option<Arc<str>>>,
    pub detach: mpsc::Receiver<Detach>,
}

struct Outbound {
    send: mpsc::Sender<Arc<str>>,
    stop: mpsc::Sender<Option<Arc<str>>>,
    detach: mpsc::Sender<Detach>,
}

pub struct Session {
    id: SessionId,
    kind: TransportKind,
    remote_addr: Option<SocketAddr>,
    outbound: Option<Outbound>,
    queues: tokio::sync::Mutex<Option<SessionQueues>>,
    last_touched: Mutex<Instant>,
    user: RwLock<Option<Uid>>,
    user_agent: RwLock<Option<String>>,
    /// Canonical topic name → actor the session is attached to.
    subs: Mutex<HashMap<String, TopicHandle>>,
    closed: CancellationToken,
}

impl Session {
    /// Mailboxes are only allocated for connected transports.
    pub fn new(id: SessionId, transport: Transport, capacities: QueueCapacities) -> Self {
        let kind = transport.kind();
        let (outbound, queues) = if kind == TransportKind::None {
            (None, None)
        } else {
            let (send_tx, send_rx) = mpsc::channel(capacities.outbound);
            let (stop_tx, stop_rx) = mpsc::channel(QueueCapacities::STOP);
            let (detach_tx, detach_rx) = mpsc::channel(capacities.detach);
            (
                Some(Outbound {
                    send: send_tx,
                    stop: stop_tx,
                    detach: detach_tx,
                }),
                Some(SessionQueues {
                    send: send_rx,
                    stop: stop_rx,
                    detach: detach_rx,
                }),
            )
        };

        Self {
            id,
            kind,
            remote_addr: transport.remote_addr(),
            outbound,
            queues: tokio::sync::Mutex::new(queues),
            last_touched: Mutex::new(Instant::now()),
            user: RwLock::new(None),
            user_agent: RwLock::new(None),
            subs: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn is_long_poll(&self) -> bool {
        self.kind == TransportKind::LongPoll
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn last_touched(&self) -> Instant {
        *self.last_touched.lock()
    }

    pub(crate) fn touch(&self, at: Instant) {
        *self.last_touched.lock() = at;
    }

    // ── Identity ────────────────────────────────────────────────────

    pub fn user(&self) -> Option<Uid> {
        self.user.read().clone()
    }

    /// Bind the session to `uid`. Rebinding to the same user is a no-op.
    pub fn set_user(&self, uid: Uid) -> Result<(), ProtocolError> {
        let mut user = self.user.write();
        match user.as_ref() {
            Some(current) if *current != uid => Err(ProtocolError::AlreadyAuthenticated),
            Some(_) => Ok(()),
            None => {
                *user = Some(uid);
                Ok(())
            }
        }
    }

    pub fn user_agent(&self) -> Option<String> {
        self.user_agent.read().clone()
    }

    pub fn set_user_agent(&self, ua: String) {
        *self.user_agent.write() = Some(ua);
    }

    // ── Mailboxes ───────────────────────────────────────────────────

    /// Hand the consumer side to the WebSocket writer. Returns `None` if it
    /// was already taken or the session has no transport.
    pub async fn take_queues(&self) -> Option<SessionQueues> {
        self.queues.lock().await.take()
    }

    /// Shared access for long-poll requests, which drain the queues in turn.
    pub(crate) fn queues(&self) -> &tokio::sync::Mutex<Option<SessionQueues>> {
        &self.queues
    }

    /// Queue a frame, waiting while the mailbox is full. Fails once the
    /// session is closed. Sessions without a transport discard frames.
    pub async fn queue_out(&self, frame: Arc<str>) -> Result<(), SessionClosed> {
        let Some(out) = &self.outbound else {
            return Ok(());
        };
        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(SessionClosed),
            sent = out.send.send(frame) => sent.map_err(|_| SessionClosed),
        }
    }

    /// Queue without waiting.
    pub fn try_queue_out(&self, frame: Arc<str>) -> Result<(), TrySendError<Arc<str>>> {
        match &self.outbound {
            Some(out) => out.send.try_send(frame),
            None => Ok(()),
        }
    }

    /// Encode and queue. Returns `false` if the session is gone.
    pub async fn send_message(&self, msg: &ServerMessage) -> bool {
        let frame = match msg.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(session_id = %self.id, kind = msg.kind(), error = %e, "failed to encode server message");
                return true;
            }
        };
        match self.queue_out(frame).await {
            Ok(()) => true,
            Err(SessionClosed) => {
                debug!(session_id = %self.id, kind = msg.kind(), "dropping message for closed session");
                false
            }
        }
    }

    /// Ask the writer to exit, optionally writing `last` first. Never waits.
    pub fn stop(&self, last: Option<Arc<str>>) -> bool {
        match &self.outbound {
            Some(out) => out.stop.try_send(last).is_ok(),
            None => false,
        }
    }

    /// Tell the session that `topic` dropped it. When the mailbox is
    /// unavailable the subscription is removed right away.
    pub fn detach(&self, topic: &str, actor: u64) {
        let queued = self.outbound.as_ref().is_some_and(|out| {
            out.detach
                .try_send(Detach {
                    topic: topic.to_owned(),
                    actor,
                })
                .is_ok()
        });
        if !queued {
            let _ = self.del_sub_if(topic, actor);
        }
    }

    // ── Subscriptions ───────────────────────────────────────────────

    pub fn add_sub(&self, topic: &str, handle: TopicHandle) {
        let _ = self.subs.lock().insert(topic.to_owned(), handle);
    }

    pub fn del_sub(&self, topic: &str) -> Option<TopicHandle> {
        self.subs.lock().remove(topic)
    }

    /// Remove `topic` only if it is still served by `actor`.
    pub fn del_sub_if(&self, topic: &str, actor: u64) -> bool {
        let mut subs = self.subs.lock();
        if subs.get(topic).is_some_and(|h| h.id() == actor) {
            let _ = subs.remove(topic);
            true
        } else {
            false
        }
    }

    pub fn get_sub(&self, topic: &str) -> Option<TopicHandle> {
        self.subs.lock().get(topic).cloned()
    }

    pub fn sub_count(&self) -> usize {
        self.subs.lock().len()
    }

    pub(crate) fn apply_detach(&self, detach: &Detach) {
        if self.del_sub_if(&detach.topic, detach.actor) {
            debug!(session_id = %self.id, topic = %detach.topic, "detached by topic");
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Mark the session closed. Blocked producers give up and the
    /// transport tasks exit.
    pub fn terminate(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Leave every topic without unsubscribing: the connection is gone,
    /// the user's subscriptions stay.
    pub async fn leave_all(self: &Arc<Self>) {
        let subs: Vec<(String, TopicHandle)> = self.subs.lock().drain().collect();
        for (name, handle) in subs {
            let leave = SessionLeave {
                sess: Arc::clone(self),
                alias: name,
                id: None,
                unsub: false,
            };
            if handle.unreg.send(leave).await.is_err() {
                debug!(session_id = %self.id, topic = handle.name(), "topic already gone");
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
