//! Topic actors.
//!
//! Every live topic is one task that owns all of the topic's mutable state.
//! Sessions and the hub reach it only through the bounded mailboxes held by
//! a [`TopicHandle`]:
//!
//! | Mailbox | Carries |
//! |---|---|
//! | `broadcast` | published data, receipts, presence from other topics |
//! | `meta` | `get`/`set`/`del` |
//! | `reg` | subscribe |
//! | `unreg` | leave / unsubscribe |
//! | `ua` | user-agent changes (`me` topics only) |
//! | `exit` | shutdown |

mod actor;
mod state;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parley_core::protocol::{DelWhat, MsgGetQuery, MsgServerPres, MsgSetDesc, MsgSetSub, NoteWhat};
use parley_core::AccessMode;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::TopicConfig;
use crate::session::Session;

pub(crate) use actor::{spawn, TopicInit};
pub use state::session_alias;

/// A session asking to attach.
pub struct SessionJoin {
    pub sess: Arc<Session>,
    /// Canonical topic name.
    pub topic: String,
    /// Name the session uses for this topic (`me`, `usr<peer>`, ...).
    pub alias: String,
    pub id: Option<String>,
    pub mode: Option<AccessMode>,
    /// Metadata to send right after attaching.
    pub get: Option<MsgGetQuery>,
    /// Description of a topic created by this request.
    pub desc: Option<MsgSetDesc>,
    pub created: bool,
}

/// A session detaching. `id` is `None` when the connection dropped, in
/// which case no reply is sent.
pub struct SessionLeave {
    pub sess: Arc<Session>,
    pub alias: String,
    pub id: Option<String>,
    /// Also delete the user's subscription.
    pub unsub: bool,
}

pub enum BroadcastReq {
    Data {
        sess: Arc<Session>,
        /// Name the session uses for the topic.
        alias: String,
        id: Option<String>,
        noecho: bool,
        content: Value,
    },
    Note {
        sess: Arc<Session>,
        what: NoteWhat,
        seq: Option<i64>,
    },
    /// Presence forwarded from another topic.
    Pres(MsgServerPres),
}

pub struct MetaReq {
    pub sess: Arc<Session>,
    pub alias: String,
    pub id: Option<String>,
    pub action: MetaAction,
}

pub enum MetaAction {
    Get(MsgGetQuery),
    Set {
        desc: Option<MsgSetDesc>,
        sub: Option<MsgSetSub>,
    },
    Del {
        what: DelWhat,
        before: Option<i64>,
        hard: bool,
    },
}

/// Stop the actor. `del` marks the topic as deleted rather than the
/// process shutting down.
pub struct ShutDown {
    pub del: bool,
    pub done: Option<oneshot::Sender<()>>,
}

/// Cloneable address of a running topic actor.
#[derive(Clone)]
pub struct TopicHandle {
    name: Arc<str>,
    id: u64,
    pub(crate) broadcast: mpsc::Sender<BroadcastReq>,
    pub(crate) meta: mpsc::Sender<MetaReq>,
    pub(crate) reg: mpsc::Sender<SessionJoin>,
    pub(crate) unreg: mpsc::Sender<SessionLeave>,
    pub(crate) ua: mpsc::Sender<String>,
    pub(crate) exit: mpsc::Sender<ShutDown>,
    suspended: Arc<AtomicBool>,
    exited: CancellationToken,
}

impl TopicHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Distinguishes successive actors serving the same name.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The actor is tearing down and accepts no new work.
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub(crate) fn suspend(&self) {
        self.suspended.store(true, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn has_exited(&self) -> bool {
        self.exited.is_cancelled()
    }

    /// Resolves once the actor has left its loop and the hub dropped it.
    pub async fn exited(&self) {
        self.exited.cancelled().await;
    }

    pub(crate) fn exit_token(&self) -> CancellationToken {
        self.exited.clone()
    }
}

impl std::fmt::Debug for TopicHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicHandle")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("suspended", &self.is_suspended())
            .finish()
    }
}

/// Receiving halves, owned by the actor task.
pub(crate) struct TopicReceivers {
    pub broadcast: mpsc::Receiver<BroadcastReq>,
    pub meta: mpsc::Receiver<MetaReq>,
    pub reg: mpsc::Receiver<SessionJoin>,
    pub unreg: mpsc::Receiver<SessionLeave>,
    pub ua: mpsc::Receiver<String>,
    pub exit: mpsc::Receiver<ShutDown>,
}

impl TopicReceivers {
    /// Refuse further sends. Buffered requests can still be received.
    pub fn close(&mut self) {
        self.broadcast.close();
        self.meta.close();
        self.reg.close();
        self.unreg.close();
        self.ua.close();
        self.exit.close();
    }
}

pub(crate) fn channel(name: &str, id: u64, config: &TopicConfig) -> (TopicHandle, TopicReceivers) {
    let (broadcast_tx, broadcast_rx) = mpsc::channel(config.broadcast_capacity);
    let (meta_tx, meta_rx) = mpsc::channel(config.meta_capacity);
    let (reg_tx, reg_rx) = mpsc::channel(config.reg_capacity);
    let (unreg_tx, unreg_rx) = mpsc::channel(config.unreg_capacity);
    let (ua_tx, ua_rx) = mpsc::channel(config.ua_capacity);
    let (exit_tx, exit_rx) = mpsc::channel(TopicConfig::EXIT_CAPACITY);

    let handle = TopicHandle {
        name: Arc::from(name),
        id,
        broadcast: broadcast_tx,
        meta: meta_tx,
        reg: reg_tx,
        unreg: unreg_tx,
        ua: ua_tx,
        exit: exit_tx,
        suspended: Arc::new(AtomicBool::new(false)),
        exited: CancellationToken::new(),
    };
    let receivers = TopicReceivers {
        broadcast: broadcast_rx,
        meta: meta_rx,
        reg: reg_rx,
        unreg: unreg_rx,
        ua: ua_rx,
        exit: exit_rx,
    };
    (handle, receivers)
}
