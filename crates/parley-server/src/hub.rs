//! Directory of live topic actors.
//!
//! The hub starts an actor on the first subscribe to a topic and forgets it
//! when the actor exits. Everything else goes straight from sessions to the
//! actors through their handles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use metrics::counter;
use parking_lot::Mutex;
use parley_core::protocol::{MsgServerPres, ServerMessage};
use parley_core::{ProtocolError, Store, TopicCat, Uid};
use parley_telemetry::metrics::PRESENCE_DROPS_TOTAL;
use tokio::sync::{mpsc::error::SendError, oneshot};
use tracing::{debug, info, instrument, warn};

use crate::config::TopicConfig;
use crate::topic::{self, BroadcastReq, SessionJoin, ShutDown, TopicHandle, TopicInit};

pub struct Hub {
    topics: Mutex<HashMap<String, TopicHandle>>,
    store: Arc<dyn Store>,
    config: TopicConfig,
    next_id: AtomicU64,
    shutting_down: AtomicBool,
}

impl Hub {
    pub fn new(store: Arc<dyn Store>, config: TopicConfig) -> Arc<Self> {
        Arc::new(Self {
            topics: Mutex::new(HashMap::new()),
            store,
            config,
            next_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn config(&self) -> &TopicConfig {
        &self.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Route a subscribe to the topic's actor, starting one if needed.
    ///
    /// A request that lands on an actor which is tearing down waits for it
    /// to exit and is routed again, so it ends up on the successor.
    #[instrument(skip_all, fields(topic = %join.topic, session_id = %join.sess.id()))]
    pub async fn subscribe(self: &Arc<Self>, mut join: SessionJoin) {
        loop {
            if self.is_shutting_down() {
                reject(&join, &ProtocolError::TopicUnavailable).await;
                return;
            }
            let handle = match self.get_or_spawn(&join) {
                Ok(handle) => handle,
                Err(err) => {
                    reject(&join, &err).await;
                    return;
                }
            };
            match handle.reg.send(join).await {
                Ok(()) => return,
                Err(SendError(back)) => {
                    debug!(actor = handle.id(), "topic is exiting, rerouting subscribe");
                    handle.exited().await;
                    join = back;
                    join.created = false;
                }
            }
        }
    }

    fn get_or_spawn(self: &Arc<Self>, join: &SessionJoin) -> Result<TopicHandle, ProtocolError> {
        let cat = TopicCat::of(&join.topic).ok_or(ProtocolError::TopicNotFound)?;
        let mut topics = self.topics.lock();
        if let Some(handle) = topics.get(&join.topic) {
            return Ok(handle.clone());
        }

        let init = if join.created {
            let owner = join.sess.user().ok_or(ProtocolError::AuthRequired)?;
            TopicInit::Create {
                owner,
                desc: join.desc.clone(),
            }
        } else {
            TopicInit::Load
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = topic::spawn(Arc::clone(self), join.topic.clone(), cat, id, init);
        let _ = topics.insert(join.topic.clone(), handle.clone());
        debug!(actor = id, category = cat.as_str(), "topic actor spawned");
        Ok(handle)
    }

    /// Handle of a running actor that still accepts work.
    pub fn get(&self, name: &str) -> Option<TopicHandle> {
        self.topics.lock().get(name).filter(|h| !h.is_suspended()).cloned()
    }

    /// Deliver presence to a topic if it is running. Never waits; a full
    /// mailbox drops the notification.
    pub fn notify(&self, name: &str, pres: MsgServerPres) {
        let Some(handle) = self.get(name) else {
            return;
        };
        if handle.broadcast.try_send(BroadcastReq::Pres(pres)).is_err() {
            counter!(PRESENCE_DROPS_TOTAL).increment(1);
            debug!(topic = name, "presence dropped");
        }
    }

    /// Forward a user agent to the user's `me` topic if it is running.
    pub fn user_agent_changed(&self, uid: &Uid, ua: String) {
        if let Some(handle) = self.get(&uid.me_topic()) {
            let _ = handle.ua.try_send(ua);
        }
    }

    /// Called by an exiting actor. A newer actor under the same name stays.
    pub(crate) fn topic_exited(&self, name: &str, id: u64) {
        let mut topics = self.topics.lock();
        if topics.get(name).is_some_and(|h| h.id() == id) {
            let _ = topics.remove(name);
        }
    }

    pub fn len(&self) -> usize {
        self.topics.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.lock().is_empty()
    }

    /// Stop accepting subscribes and wait, up to `timeout`, for every actor
    /// to detach its sessions and exit.
    pub async fn shutdown(&self, timeout: Duration) {
        self.shutting_down.store(true, Ordering::Release);
        let handles: Vec<TopicHandle> = self.topics.lock().values().cloned().collect();
        info!(topics = handles.len(), "stopping topics");

        let stops = handles.into_iter().map(|handle| async move {
            let (done, stopped) = oneshot::channel();
            let req = ShutDown {
                del: false,
                done: Some(done),
            };
            if handle.exit.send(req).await.is_ok() {
                let _ = stopped.await;
            }
        });
        if tokio::time::timeout(timeout, join_all(stops)).await.is_err() {
            warn!(?timeout, "topics did not stop in time");
        }
        self.topics.lock().clear();
    }
}

async fn reject(join: &SessionJoin, err: &ProtocolError) {
    let msg = ServerMessage::error(join.id.as_deref(), Some(&join.alias), err);
    let _ = join.sess.send_message(&msg).await;
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("topics", &self.len())
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}
