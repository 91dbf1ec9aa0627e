//! The topic actor loop and its request handlers.
//!
//! All state in [`Topic`] is owned by the actor task. Requests are handled
//! one at a time, so sequence ids are assigned in arrival order and never
//! skip or repeat.

use std::collections::HashMap;
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;

use metrics::{counter, gauge};
use parley_core::protocol::{
    AccessSummary, DelWhat, MsgBrowseOpts, MsgGetQuery, MsgServerData, MsgServerInfo, MsgServerMeta, MsgServerPres,
    MsgSetDesc, MsgSetSub, NoteWhat, PresWhat, ServerMessage, TopicDesc, TopicSub,
};
use parley_core::store::{MessageQuery, MessageRecord, SubscriptionRecord, TopicRecord};
use parley_core::topic::{p2p_members, p2p_peer, personal_owner, ME_ALIAS};
use parley_core::{AccessMode, DefaultAccess, ProtocolError, SessionId, Store, TopicCat, Uid};
use parley_telemetry::metrics::{MESSAGES_PUBLISHED_TOTAL, TOPICS_ACTIVE, TOPICS_STARTED_TOTAL};
use serde_json::{json, Value};
use tokio::time::{sleep, Instant, Sleep};
use tracing::{debug, info, info_span, warn, Instrument};

use super::state::{alias_for, contact_key, Attached, Contact, PerUserData};
use super::{BroadcastReq, MetaAction, MetaReq, SessionJoin, SessionLeave, TopicHandle, TopicReceivers};
use crate::config::TopicConfig;
use crate::hub::Hub;
use crate::session::Session;

/// How a new actor obtains its state.
pub(crate) enum TopicInit {
    /// Create a group owned by `owner`.
    Create { owner: Uid, desc: Option<MsgSetDesc> },
    /// Load from the store. Personal, P2P and system topics are created on
    /// first use; unknown groups fail.
    Load,
}

/// Start an actor for `name`. The returned handle is live immediately;
/// requests queue up while the actor loads its state.
pub(crate) fn spawn(hub: Arc<Hub>, name: String, cat: TopicCat, id: u64, init: TopicInit) -> TopicHandle {
    let (handle, rx) = super::channel(&name, id, hub.config());
    let span = info_span!("topic", topic = %name, actor = id);
    let _ = tokio::spawn(run(hub, handle.clone(), rx, cat, init).instrument(span));
    handle
}

/// Removes the directory entry and signals `exited` when the task ends,
/// including by panic.
struct ExitGuard {
    hub: Arc<Hub>,
    handle: TopicHandle,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.handle.suspend();
        self.hub.topic_exited(self.handle.name(), self.handle.id());
        self.handle.exit_token().cancel();
    }
}

enum Exit {
    /// No sessions for the idle timeout. Carries subscribes that arrived
    /// during teardown.
    Idle(Vec<SessionJoin>),
    Shutdown,
    Deleted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Delete,
}

async fn run(hub: Arc<Hub>, handle: TopicHandle, mut rx: TopicReceivers, cat: TopicCat, init: TopicInit) {
    let guard = ExitGuard {
        hub: Arc::clone(&hub),
        handle: handle.clone(),
    };

    let loaded = match load(hub.store().as_ref(), handle.name(), cat, init, hub.config()) {
        Ok(loaded) => loaded,
        Err(err) => {
            debug!(error = %err, "topic not started");
            handle.suspend();
            rx.close();
            while let Ok(join) = rx.reg.try_recv() {
                reply_err(&join.sess, join.id.as_deref(), &join.alias, &err).await;
            }
            drop(guard);
            return;
        }
    };

    counter!(TOPICS_STARTED_TOTAL, "category" => cat.as_str()).increment(1);
    gauge!(TOPICS_ACTIVE).increment(1.0);
    debug!("topic started");

    let mut topic = Topic::new(Arc::clone(&hub), handle, cat, loaded);
    topic.announce_created();
    let exit = topic.run(&mut rx).await;

    gauge!(TOPICS_ACTIVE).decrement(1.0);
    drop(topic);
    drop(rx);
    drop(guard);

    match exit {
        Exit::Idle(pending) => {
            if !pending.is_empty() {
                debug!(count = pending.len(), "resubmitting subscribes to a fresh actor");
            }
            for mut join in pending {
                join.created = false;
                hub.subscribe(join).await;
            }
        }
        Exit::Shutdown => debug!("topic stopped"),
        Exit::Deleted => info!("topic deleted"),
    }
}

struct Loaded {
    record: TopicRecord,
    per_user: HashMap<Uid, PerUserData>,
    contacts: HashMap<String, Contact>,
    fresh: bool,
}

fn load(
    store: &dyn Store,
    name: &str,
    cat: TopicCat,
    init: TopicInit,
    config: &TopicConfig,
) -> Result<Loaded, ProtocolError> {
    let (record, fresh) = match init {
        TopicInit::Create { owner, desc } => {
            let mut record = TopicRecord::new(name, TopicCat::Group, Some(owner), config.group_access);
            if let Some(desc) = desc {
                if let Some(defacs) = desc.defacs {
                    record.access = defacs;
                }
                if let Some(public) = desc.public {
                    if !public.fits(TopicCat::Group) {
                        return Err(ProtocolError::InvalidPayload);
                    }
                    record.public = Some(public);
                }
            }
            store.create_topic(&record)?;
            (record, true)
        }
        TopicInit::Load => match store.load_topic(name)? {
            Some(record) => (record, false),
            None => {
                let record = first_use_record(name, cat, config)?;
                store.create_topic(&record)?;
                (record, true)
            }
        },
    };

    let mut per_user: HashMap<Uid, PerUserData> = store
        .topic_subscriptions(name)?
        .into_iter()
        .map(|sub| (sub.user.clone(), PerUserData::new(sub)))
        .collect();

    // Both sides of a conversation are subscribed from the start.
    if fresh && cat == TopicCat::P2P {
        if let Some((a, b)) = p2p_members(name) {
            let given = config.p2p_access.auth;
            for uid in [a, b] {
                let sub = SubscriptionRecord::new(name, uid.clone(), given, given);
                store.save_subscription(&sub)?;
                let _ = per_user.insert(uid, PerUserData::new(sub));
            }
        }
    }

    let contacts = match (cat, &record.owner) {
        (TopicCat::Me, Some(owner)) => load_contacts(store, owner)?,
        _ => HashMap::new(),
    };

    Ok(Loaded {
        record,
        per_user,
        contacts,
        fresh,
    })
}

fn first_use_record(name: &str, cat: TopicCat, config: &TopicConfig) -> Result<TopicRecord, ProtocolError> {
    let record = match cat {
        TopicCat::Group => return Err(ProtocolError::TopicNotFound),
        TopicCat::Me | TopicCat::Fnd => TopicRecord::new(name, cat, personal_owner(name), DefaultAccess::default()),
        TopicCat::P2P => TopicRecord::new(name, cat, None, config.p2p_access),
        TopicCat::Sys => TopicRecord::new(
            name,
            cat,
            None,
            DefaultAccess {
                auth: AccessMode::SYS,
                anon: AccessMode::NONE,
            },
        ),
    };
    Ok(record)
}

fn load_contacts(store: &dyn Store, owner: &Uid) -> Result<HashMap<String, Contact>, ProtocolError> {
    let mut contacts = HashMap::new();
    for sub in store.user_subscriptions(owner)? {
        let Some(key) = contact_key(&sub.topic, owner) else {
            continue;
        };
        let with = p2p_peer(&sub.topic, owner);
        let _ = contacts.insert(
            key,
            Contact {
                sub,
                online: false,
                with,
            },
        );
    }
    Ok(contacts)
}

async fn reply(sess: &Session, msg: ServerMessage) {
    let _ = sess.send_message(&msg).await;
}

async fn reply_err(sess: &Session, id: Option<&str>, alias: &str, err: &ProtocolError) {
    reply(sess, ServerMessage::error(id, Some(alias), err)).await;
}

async fn wait(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

struct Topic {
    hub: Arc<Hub>,
    store: Arc<dyn Store>,
    config: TopicConfig,
    handle: TopicHandle,
    cat: TopicCat,
    record: TopicRecord,
    per_user: HashMap<Uid, PerUserData>,
    /// `me` topics only: the owner's subscriptions keyed by the name the
    /// owner sees.
    contacts: HashMap<String, Contact>,
    sessions: HashMap<SessionId, Attached>,
    user_agent: Option<String>,
    /// Created during load; the first successful subscribe reports 201.
    fresh: bool,
    idle_timer: Option<Pin<Box<Sleep>>>,
    ua_timer: Option<Pin<Box<Sleep>>>,
}

impl Topic {
    fn new(hub: Arc<Hub>, handle: TopicHandle, cat: TopicCat, loaded: Loaded) -> Self {
        Self {
            store: Arc::clone(hub.store()),
            config: hub.config().clone(),
            hub,
            handle,
            cat,
            record: loaded.record,
            per_user: loaded.per_user,
            contacts: loaded.contacts,
            sessions: HashMap::new(),
            user_agent: None,
            fresh: loaded.fresh,
            idle_timer: None,
            ua_timer: None,
        }
    }

    fn name(&self) -> &str {
        self.handle.name()
    }

    async fn run(&mut self, rx: &mut TopicReceivers) -> Exit {
        self.arm_idle();
        loop {
            tokio::select! {
                Some(join) = rx.reg.recv() => self.handle_join(join).await,
                Some(leave) = rx.unreg.recv() => self.handle_leave(leave).await,
                Some(req) = rx.broadcast.recv() => self.handle_broadcast(req).await,
                Some(req) = rx.meta.recv() => {
                    if self.handle_meta(req).await == Flow::Delete {
                        self.stop(true).await;
                        self.reject_pending(rx).await;
                        return Exit::Deleted;
                    }
                }
                Some(ua) = rx.ua.recv() => self.handle_ua(ua),
                Some(req) = rx.exit.recv() => {
                    self.stop(req.del).await;
                    self.reject_pending(rx).await;
                    if let Some(done) = req.done {
                        let _ = done.send(());
                    }
                    return if req.del { Exit::Deleted } else { Exit::Shutdown };
                }
                () = wait(&mut self.idle_timer) => {
                    self.idle_timer = None;
                    if self.sessions.is_empty() {
                        return self.idle_exit(rx).await;
                    }
                }
                () = wait(&mut self.ua_timer) => {
                    self.ua_timer = None;
                    self.announce_to_contacts(PresWhat::Ua, self.user_agent.clone());
                }
            }

            if !self.sessions.is_empty() {
                self.idle_timer = None;
            } else if self.idle_timer.is_none() {
                self.arm_idle();
            } else if self.idle_elapsed() {
                // Timer ran out while a request was being handled.
                return self.idle_exit(rx).await;
            }
        }
    }

    fn arm_idle(&mut self) {
        self.idle_timer = Some(Box::pin(sleep(self.config.idle_timeout)));
    }

    fn idle_elapsed(&self) -> bool {
        self.idle_timer
            .as_ref()
            .is_some_and(|t| t.deadline() <= Instant::now())
    }

    async fn idle_exit(&mut self, rx: &mut TopicReceivers) -> Exit {
        info!(timeout = ?self.config.idle_timeout, "topic idle, shutting down");
        self.handle.suspend();
        Exit::Idle(self.drain(rx).await)
    }

    // ── Teardown ────────────────────────────────────────────────────

    /// Detach every session. With `del`, tell everyone the topic is gone
    /// and remove it from the store.
    async fn stop(&mut self, del: bool) {
        self.handle.suspend();
        if del {
            let gone = ServerMessage::Pres(ServerMessage::pres(self.name(), self.name(), PresWhat::Gone));
            self.fan_out(&gone, |_, _| true).await;
            for uid in self.per_user.keys() {
                self.notify_me(uid, PresWhat::Gone, None);
            }
            if let Err(e) = self.store.delete_topic(self.name()) {
                warn!(error = %e, "failed to delete topic from store");
            }
        }
        for att in self.sessions.values() {
            att.sess.detach(self.name(), self.handle.id());
        }
        self.sessions.clear();
    }

    /// Close the mailboxes and answer what is still buffered. Subscribes
    /// are returned to the caller.
    async fn drain(&mut self, rx: &mut TopicReceivers) -> Vec<SessionJoin> {
        rx.close();
        let mut joins = Vec::new();
        while let Ok(join) = rx.reg.try_recv() {
            joins.push(join);
        }
        while let Ok(leave) = rx.unreg.try_recv() {
            self.handle_leave(leave).await;
        }
        while let Ok(req) = rx.broadcast.try_recv() {
            if let BroadcastReq::Data { sess, alias, id, .. } = req {
                reply_err(&sess, id.as_deref(), &alias, &ProtocolError::TopicUnavailable).await;
            }
        }
        while let Ok(req) = rx.meta.try_recv() {
            reply_err(&req.sess, req.id.as_deref(), &req.alias, &ProtocolError::TopicUnavailable).await;
        }
        while let Ok(req) = rx.exit.try_recv() {
            if let Some(done) = req.done {
                let _ = done.send(());
            }
        }
        joins
    }

    async fn reject_pending(&mut self, rx: &mut TopicReceivers) {
        for join in self.drain(rx).await {
            reply_err(&join.sess, join.id.as_deref(), &join.alias, &ProtocolError::TopicUnavailable).await;
        }
    }

    // ── Subscribe / leave ───────────────────────────────────────────

    async fn handle_join(&mut self, join: SessionJoin) {
        let SessionJoin {
            sess,
            alias,
            id,
            mode,
            get,
            created,
            ..
        } = join;

        if self.sessions.contains_key(sess.id()) {
            reply(&sess, ServerMessage::already_subscribed(id.as_deref(), Some(&alias))).await;
            return;
        }

        let uid = sess.user();
        let (acs, sub_created) = match self.admit(uid.as_ref(), mode) {
            Ok(admitted) => admitted,
            Err(err) => {
                reply_err(&sess, id.as_deref(), &alias, &err).await;
                return;
            }
        };
        if !acs.mode.is_joiner() {
            reply_err(&sess, id.as_deref(), &alias, &ProtocolError::PermissionDenied).await;
            return;
        }

        sess.add_sub(self.name(), self.handle.clone());
        let _ = self.sessions.insert(
            sess.id().clone(),
            Attached {
                sess: Arc::clone(&sess),
                alias: alias.clone(),
                uid: uid.clone(),
                anon: uid.is_none().then_some(acs),
            },
        );
        debug!(session_id = %sess.id(), attached = self.sessions.len(), "session attached");

        let fresh = std::mem::take(&mut self.fresh);
        let created = created || sub_created || fresh;
        let ack = if created {
            ServerMessage::created(id.as_deref(), Some(&alias))
        } else {
            ServerMessage::ok(id.as_deref(), Some(&alias))
        };
        reply(&sess, ack.with_params(json!({ "acs": acs }))).await;

        if let Some(uid) = &uid {
            if sub_created && !self.cat.is_personal() {
                self.notify_me(uid, PresWhat::Acs, None);
            }
            self.session_online(uid).await;
        }

        if let Some(query) = get {
            if let Err(err) = self.answer_get(&sess, id.as_deref(), &alias, &query, false).await {
                reply_err(&sess, id.as_deref(), &alias, &err).await;
            }
        }
    }

    /// Find or create the caller's subscription. Returns its access and
    /// whether it was created.
    fn admit(&mut self, uid: Option<&Uid>, want: Option<AccessMode>) -> Result<(AccessSummary, bool), ProtocolError> {
        let Some(uid) = uid else {
            if self.cat.is_personal() || self.cat == TopicCat::P2P {
                return Err(ProtocolError::AuthRequired);
            }
            let given = self.record.access.anon;
            return Ok((AccessSummary::new(want.unwrap_or(given), given), false));
        };

        self.check_member(uid)?;

        if let Some(pud) = self.per_user.get_mut(uid) {
            if let Some(want) = want.filter(|w| *w != pud.sub.mode_want) {
                pud.sub.mode_want = want;
                pud.sub.updated = parley_core::now();
                self.store.save_subscription(&pud.sub)?;
            }
            return Ok((pud.summary(), false));
        }

        let given = self.default_given(uid);
        let sub = SubscriptionRecord::new(self.name(), uid.clone(), want.unwrap_or(given), given);
        self.store.save_subscription(&sub)?;
        let pud = PerUserData::new(sub);
        let acs = pud.summary();
        let _ = self.per_user.insert(uid.clone(), pud);
        debug!(user = %uid, acs = %acs.mode, "subscription created");
        Ok((acs, true))
    }

    fn check_member(&self, uid: &Uid) -> Result<(), ProtocolError> {
        let member = match self.cat {
            TopicCat::Me | TopicCat::Fnd => self.record.owner.as_ref() == Some(uid),
            TopicCat::P2P => p2p_peer(self.name(), uid).is_some(),
            TopicCat::Group | TopicCat::Sys => true,
        };
        if member {
            Ok(())
        } else {
            Err(ProtocolError::PermissionDenied)
        }
    }

    fn default_given(&self, uid: &Uid) -> AccessMode {
        match self.cat {
            TopicCat::Me | TopicCat::Fnd => AccessMode::FULL,
            TopicCat::Group if self.record.owner.as_ref() == Some(uid) => AccessMode::FULL,
            _ => self.record.access.auth,
        }
    }

    async fn handle_leave(&mut self, leave: SessionLeave) {
        let SessionLeave { sess, alias, id, unsub } = leave;

        let Some(att) = self.sessions.get(sess.id()) else {
            if id.is_some() {
                reply(&sess, ServerMessage::not_joined(id.as_deref(), Some(&alias))).await;
            }
            return;
        };
        let alias = att.alias.clone();

        if unsub {
            let result = match att.uid.clone() {
                Some(uid) => self.unsubscribe(&uid, sess.id()).await,
                None => Err(ProtocolError::AuthRequired),
            };
            if let Err(err) = result {
                // Still attached: give the subscription back to the session.
                sess.add_sub(self.name(), self.handle.clone());
                reply_err(&sess, id.as_deref(), &alias, &err).await;
                return;
            }
        } else {
            self.detach_session(sess.id()).await;
        }

        if id.is_some() {
            reply(&sess, ServerMessage::ok(id.as_deref(), Some(&alias))).await;
        }
    }

    /// Delete `uid`'s subscription and drop all of their sessions. The
    /// `leaving` session already forgot the topic and gets no detach.
    async fn unsubscribe(&mut self, uid: &Uid, leaving: &SessionId) -> Result<(), ProtocolError> {
        if self.cat.is_personal() {
            return Err(ProtocolError::NotAllowed);
        }
        if self.cat == TopicCat::Group && self.record.owner.as_ref() == Some(uid) {
            return Err(ProtocolError::PermissionDenied);
        }
        self.store.delete_subscription(self.name(), uid)?;

        let theirs: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, att)| att.uid.as_ref() == Some(uid))
            .map(|(sid, _)| sid.clone())
            .collect();
        for sid in theirs {
            if let Some(att) = self.sessions.remove(&sid) {
                if &sid != leaving {
                    att.sess.detach(self.name(), self.handle.id());
                }
            }
        }

        let was_online = self.per_user.remove(uid).is_some_and(|pud| pud.online > 0);
        if was_online {
            self.user_presence(uid, PresWhat::Off).await;
        }
        self.notify_me(uid, PresWhat::Gone, None);
        debug!(user = %uid, "unsubscribed");
        Ok(())
    }

    async fn session_online(&mut self, uid: &Uid) {
        let first = match self.per_user.get_mut(uid) {
            Some(pud) => {
                pud.online += 1;
                pud.online == 1
            }
            None => false,
        };
        if first {
            self.user_presence(uid, PresWhat::On).await;
        }
    }

    async fn detach_session(&mut self, sid: &SessionId) {
        let Some(att) = self.sessions.remove(sid) else {
            return;
        };
        debug!(session_id = %sid, attached = self.sessions.len(), "session detached");
        let Some(uid) = att.uid else {
            return;
        };
        let last = match self.per_user.get_mut(&uid) {
            Some(pud) => {
                pud.online = pud.online.saturating_sub(1);
                pud.online == 0
            }
            None => false,
        };
        if last {
            self.user_presence(&uid, PresWhat::Off).await;
        }
    }

    // ── Presence ────────────────────────────────────────────────────

    /// `uid` came online or went offline here.
    async fn user_presence(&mut self, uid: &Uid, what: PresWhat) {
        match self.cat {
            TopicCat::Me => self.announce_to_contacts(what, None),
            TopicCat::Fnd | TopicCat::Sys => {}
            TopicCat::P2P | TopicCat::Group => {
                let pres = ServerMessage::Pres(ServerMessage::pres(self.name(), &uid.me_topic(), what));
                self.fan_out(&pres, |att, mode| att.uid.as_ref() != Some(uid) && mode.is_presencer())
                    .await;
            }
        }
    }

    /// Tell the `me` topics of the owner's P2P contacts.
    fn announce_to_contacts(&self, what: PresWhat, ua: Option<String>) {
        let Some(owner) = &self.record.owner else {
            return;
        };
        let src = owner.me_topic();
        for peer in self.contacts.values().filter_map(|c| c.with.as_ref()) {
            let mut pres = ServerMessage::pres(ME_ALIAS, &src, what);
            pres.ua.clone_from(&ua);
            self.hub.notify(&peer.me_topic(), pres);
        }
    }

    /// Tell `uid`'s `me` topic about this topic.
    fn notify_me(&self, uid: &Uid, what: PresWhat, seq: Option<i64>) {
        let mut pres = ServerMessage::pres(ME_ALIAS, &alias_for(self.name(), self.cat, Some(uid)), what);
        pres.seq = seq;
        self.hub.notify(&uid.me_topic(), pres);
    }

    /// A fresh P2P topic subscribed both members; update their contact lists.
    fn announce_created(&self) {
        if self.fresh && self.cat == TopicCat::P2P {
            for uid in self.per_user.keys() {
                self.notify_me(uid, PresWhat::Acs, None);
            }
        }
    }

    fn handle_ua(&mut self, ua: String) {
        if self.cat != TopicCat::Me || self.user_agent.as_deref() == Some(ua.as_str()) {
            return;
        }
        self.user_agent = Some(ua);
        self.ua_timer = Some(Box::pin(sleep(self.config.ua_delay)));
    }

    async fn handle_pres(&mut self, pres: MsgServerPres) {
        if self.cat != TopicCat::Me {
            let msg = ServerMessage::Pres(pres);
            self.fan_out(&msg, |_, mode| mode.is_presencer()).await;
            return;
        }

        let forward = match pres.what {
            PresWhat::On | PresWhat::Off => {
                let on = pres.what == PresWhat::On;
                let Some(contact) = self.contacts.get_mut(&pres.src) else {
                    return;
                };
                if contact.online == on {
                    return;
                }
                contact.online = on;
                // Answer so the peer learns we are online too.
                if on && !self.sessions.is_empty() {
                    if let (Some(peer), Some(owner)) = (&contact.with, &self.record.owner) {
                        self.hub
                            .notify(&peer.me_topic(), ServerMessage::pres(ME_ALIAS, &owner.me_topic(), PresWhat::On));
                    }
                }
                true
            }
            PresWhat::Ua => self.contacts.get(&pres.src).is_some_and(|c| c.online),
            PresWhat::Acs => {
                self.reload_contacts();
                true
            }
            PresWhat::Gone => {
                let _ = self.contacts.remove(&pres.src);
                true
            }
            PresWhat::Msg | PresWhat::Upd => true,
        };
        if forward {
            let msg = ServerMessage::Pres(pres);
            self.fan_out(&msg, |_, mode| mode.is_presencer()).await;
        }
    }

    fn reload_contacts(&mut self) {
        let Some(owner) = &self.record.owner else {
            return;
        };
        match load_contacts(self.store.as_ref(), owner) {
            Ok(mut contacts) => {
                for (key, contact) in contacts.iter_mut() {
                    contact.online = self.contacts.get(key).is_some_and(|c| c.online);
                }
                self.contacts = contacts;
            }
            Err(err) => warn!(error = %err, "failed to reload contacts"),
        }
    }

    // ── Data ────────────────────────────────────────────────────────

    async fn handle_broadcast(&mut self, req: BroadcastReq) {
        match req {
            BroadcastReq::Data {
                sess,
                alias,
                id,
                noecho,
                content,
            } => self.publish(&sess, &alias, id.as_deref(), noecho, content).await,
            BroadcastReq::Note { sess, what, seq } => self.note(&sess, what, seq).await,
            BroadcastReq::Pres(pres) => self.handle_pres(pres).await,
        }
    }

    async fn publish(
        &mut self,
        sess: &Arc<Session>,
        alias: &str,
        id: Option<&str>,
        noecho: bool,
        content: Value,
    ) {
        let Some(att) = self.sessions.get(sess.id()) else {
            reply_err(sess, id, alias, &ProtocolError::AttachFirst).await;
            return;
        };
        let alias = att.alias.clone();
        let uid = att.uid.clone();
        let mode = self.mode_of(att);

        let denied = if self.cat.is_personal() {
            Some(ProtocolError::NotAllowed)
        } else if !mode.is_writer() {
            Some(ProtocolError::PermissionDenied)
        } else {
            None
        };
        if let Some(err) = denied {
            reply_err(sess, id, &alias, &err).await;
            return;
        }

        let seq = self.record.seq_id + 1;
        let msg = MessageRecord {
            topic: self.name().to_owned(),
            seq_id: seq,
            from: uid.clone(),
            created: parley_core::now(),
            content,
        };
        if let Err(e) = self.store.save_message(&msg) {
            warn!(error = %e, seq, "failed to persist message");
            reply_err(sess, id, &alias, &ProtocolError::Internal).await;
            return;
        }
        self.record.seq_id = seq;
        counter!(MESSAGES_PUBLISHED_TOTAL).increment(1);

        if let Some(pud) = uid.as_ref().and_then(|u| self.per_user.get_mut(u)) {
            pud.sub.recv_id = seq;
            pud.sub.read_id = seq;
            if let Err(e) = self.store.save_subscription(&pud.sub) {
                warn!(error = %e, "failed to save sender watermarks");
            }
        }

        reply(sess, ServerMessage::accepted(id, Some(&alias)).with_params(json!({ "seq": seq }))).await;

        let MessageRecord {
            from, created, content, ..
        } = msg;
        let data = ServerMessage::Data(MsgServerData {
            topic: self.name().to_owned(),
            from,
            ts: created,
            seq,
            content,
        });
        let sender = sess.id();
        self.fan_out(&data, |att, mode| {
            mode.is_reader() && !(noecho && att.sess.id() == sender)
        })
        .await;

        for (user, pud) in &self.per_user {
            if pud.online == 0 && Some(user) != uid.as_ref() && pud.mode().is_reader() {
                self.notify_me(user, PresWhat::Msg, Some(seq));
            }
        }
    }

    async fn note(&mut self, sess: &Arc<Session>, what: NoteWhat, seq: Option<i64>) {
        let Some(att) = self.sessions.get(sess.id()) else {
            return;
        };
        let Some(uid) = att.uid.clone() else {
            return;
        };
        if !self.mode_of(att).is_reader() {
            return;
        }

        if what != NoteWhat::Kp {
            let last = self.record.seq_id;
            let Some(seq) = seq.filter(|s| *s > 0 && *s <= last) else {
                return;
            };
            let Some(pud) = self.per_user.get_mut(&uid) else {
                return;
            };
            let advanced = match what {
                NoteWhat::Read if seq > pud.sub.read_id => {
                    pud.sub.read_id = seq;
                    pud.sub.recv_id = pud.sub.recv_id.max(seq);
                    true
                }
                NoteWhat::Recv if seq > pud.sub.recv_id => {
                    pud.sub.recv_id = seq;
                    true
                }
                _ => false,
            };
            if !advanced {
                return;
            }
            pud.sub.updated = parley_core::now();
            if let Err(e) = self.store.save_subscription(&pud.sub) {
                warn!(error = %e, "failed to save receipt");
            }
        }

        let info = ServerMessage::Info(MsgServerInfo {
            topic: self.name().to_owned(),
            from: uid,
            what,
            seq,
            ts: parley_core::now(),
        });
        let from = sess.id();
        self.fan_out(&info, |att, mode| att.sess.id() != from && mode.is_presencer())
            .await;
    }

    // ── Metadata ────────────────────────────────────────────────────

    async fn handle_meta(&mut self, req: MetaReq) -> Flow {
        let MetaReq { sess, alias, id, action } = req;
        let Some(att) = self.sessions.get(sess.id()) else {
            reply_err(&sess, id.as_deref(), &alias, &ProtocolError::AttachFirst).await;
            return Flow::Continue;
        };
        let alias = att.alias.clone();
        let uid = att.uid.clone();

        let result = match action {
            MetaAction::Get(query) => self
                .answer_get(&sess, id.as_deref(), &alias, &query, true)
                .await
                .map(|()| Flow::Continue),
            MetaAction::Set { desc, sub } => self
                .set(&sess, id.as_deref(), &alias, uid.as_ref(), desc, sub)
                .await
                .map(|()| Flow::Continue),
            MetaAction::Del { what, before, hard } => {
                self.del(&sess, id.as_deref(), &alias, uid.as_ref(), what, before, hard)
                    .await
            }
        };
        match result {
            Ok(flow) => flow,
            Err(err) => {
                reply_err(&sess, id.as_deref(), &alias, &err).await;
                Flow::Continue
            }
        }
    }

    /// Answer a `get`. With `ack`, a request without `data` still ends with
    /// a `ctrl 200`; the `get` folded into a subscribe skips it.
    async fn answer_get(
        &self,
        sess: &Session,
        id: Option<&str>,
        alias: &str,
        query: &MsgGetQuery,
        ack: bool,
    ) -> Result<(), ProtocolError> {
        let what = query.wants();
        if what.is_empty() {
            return Err(ProtocolError::Malformed);
        }
        let Some(att) = self.sessions.get(sess.id()) else {
            return Err(ProtocolError::AttachFirst);
        };
        let mode = self.mode_of(att);
        if what.data && !mode.is_reader() {
            return Err(ProtocolError::PermissionDenied);
        }

        if what.desc || what.sub {
            let meta = MsgServerMeta {
                id: id.map(str::to_owned),
                topic: alias.to_owned(),
                ts: parley_core::now(),
                desc: what.desc.then(|| self.describe(att)),
                sub: what.sub.then(|| self.subscribers(att.uid.as_ref())),
            };
            reply(sess, ServerMessage::Meta(meta)).await;
        }

        if what.data {
            let count = self
                .replay(sess, alias, att.uid.as_ref(), query.data.unwrap_or_default())
                .await?;
            let ctrl = if count == 0 {
                ServerMessage::no_content(id, Some(alias))
            } else {
                ServerMessage::ok(id, Some(alias)).with_params(json!({ "count": count }))
            };
            reply(sess, ctrl).await;
        } else if ack {
            reply(sess, ServerMessage::ok(id, Some(alias))).await;
        }
        Ok(())
    }

    fn describe(&self, att: &Attached) -> TopicDesc {
        let pud = att.uid.as_ref().and_then(|u| self.per_user.get(u));
        TopicDesc {
            created: self.record.created,
            updated: self.record.updated,
            defacs: (self.cat == TopicCat::Group).then_some(self.record.access),
            acs: pud.map(PerUserData::summary).or(att.anon),
            seq: self.record.seq_id,
            clear: self.record.clear_id,
            read: pud.map_or(0, |p| p.sub.read_id),
            recv: pud.map_or(0, |p| p.sub.recv_id),
            public: self.record.public.clone(),
            private: pud.and_then(|p| p.sub.private.clone()),
        }
    }

    fn subscribers(&self, caller: Option<&Uid>) -> Vec<TopicSub> {
        let mut subs: Vec<TopicSub> = if self.cat == TopicCat::Me {
            self.contacts.iter().map(|(key, c)| c.to_sub(key)).collect()
        } else {
            self.per_user
                .values()
                .map(|pud| pud.to_sub(Some(&pud.sub.user) == caller))
                .collect()
        };
        subs.sort_by(|a, b| (&a.user, &a.topic).cmp(&(&b.user, &b.topic)));
        subs
    }

    /// Send stored messages after every clear watermark that applies to
    /// the caller. Returns how many were sent.
    async fn replay(
        &self,
        sess: &Session,
        alias: &str,
        uid: Option<&Uid>,
        opts: MsgBrowseOpts,
    ) -> Result<usize, ProtocolError> {
        let user_clear = uid.and_then(|u| self.per_user.get(u)).map_or(0, |p| p.sub.clear_id);
        let since = opts.since.unwrap_or(0).max(self.record.clear_id).max(user_clear);
        let max = self.config.max_history;
        let query = MessageQuery {
            since,
            before: opts.before,
            limit: opts.limit.unwrap_or(max).clamp(1, max),
        };
        let messages = self.store.messages(self.name(), &query)?;
        for m in &messages {
            let data = ServerMessage::Data(MsgServerData {
                topic: alias.to_owned(),
                from: m.from.clone(),
                ts: m.created,
                seq: m.seq_id,
                content: m.content.clone(),
            });
            reply(sess, data).await;
        }
        Ok(messages.len())
    }

    async fn set(
        &mut self,
        sess: &Session,
        id: Option<&str>,
        alias: &str,
        uid: Option<&Uid>,
        desc: Option<MsgSetDesc>,
        sub: Option<MsgSetSub>,
    ) -> Result<(), ProtocolError> {
        let uid = uid.ok_or(ProtocolError::AuthRequired)?;
        if desc.is_none() && sub.is_none() {
            return Err(ProtocolError::Malformed);
        }

        let mut params = serde_json::Map::new();
        if let Some(desc) = desc {
            if self.set_desc(uid, desc)? {
                let upd = ServerMessage::Pres(ServerMessage::pres(self.name(), self.name(), PresWhat::Upd));
                let caller = sess.id();
                self.fan_out(&upd, |att, mode| att.sess.id() != caller && mode.is_presencer())
                    .await;
            }
        }
        if let Some(sub) = sub {
            let acs = self.set_sub(uid, sub)?;
            let _ = params.insert("acs".to_owned(), json!(acs));
        }

        let ok = ServerMessage::ok(id, Some(alias));
        let ok = if params.is_empty() { ok } else { ok.with_params(Value::Object(params)) };
        reply(sess, ok).await;
        Ok(())
    }

    /// Returns whether the topic itself (not only the caller's private
    /// data) changed.
    fn set_desc(&mut self, uid: &Uid, desc: MsgSetDesc) -> Result<bool, ProtocolError> {
        let MsgSetDesc { defacs, public, private } = desc;

        if (defacs.is_some() || public.is_some()) && self.record.owner.as_ref() != Some(uid) {
            return Err(ProtocolError::PermissionDenied);
        }
        if defacs.is_some() && self.cat != TopicCat::Group {
            return Err(ProtocolError::NotAllowed);
        }
        if public.as_ref().is_some_and(|p| !p.fits(self.cat)) {
            return Err(ProtocolError::InvalidPayload);
        }
        if private.as_ref().is_some_and(|p| !p.is_supported()) {
            return Err(ProtocolError::InvalidPayload);
        }

        if let Some(private) = private {
            let pud = self.per_user.get_mut(uid).ok_or(ProtocolError::PermissionDenied)?;
            pud.sub.private = Some(private);
            pud.sub.updated = parley_core::now();
            self.store.save_subscription(&pud.sub)?;
        }

        let changed = defacs.is_some() || public.is_some();
        if let Some(defacs) = defacs {
            self.record.access = defacs;
        }
        if let Some(public) = public {
            self.record.public = Some(public);
        }
        if changed {
            self.record.updated = parley_core::now();
            self.store.update_topic(&self.record)?;
        }
        Ok(changed)
    }

    /// Change the caller's wanted mode, or as a manager another user's
    /// granted mode. Granting to a non-subscriber invites them.
    fn set_sub(&mut self, uid: &Uid, sub: MsgSetSub) -> Result<AccessSummary, ProtocolError> {
        let mode = sub.mode.ok_or(ProtocolError::Malformed)?;
        let target = sub.user.unwrap_or_else(|| uid.clone());

        if &target == uid {
            let pud = self.per_user.get_mut(uid).ok_or(ProtocolError::PermissionDenied)?;
            pud.sub.mode_want = mode;
            pud.sub.updated = parley_core::now();
            self.store.save_subscription(&pud.sub)?;
            return Ok(pud.summary());
        }

        let caller_mode = self.per_user.get(uid).map_or(AccessMode::NONE, PerUserData::mode);
        if !caller_mode.is_manager() || self.cat.is_personal() {
            return Err(ProtocolError::PermissionDenied);
        }
        if self.record.owner.as_ref() == Some(&target) {
            return Err(ProtocolError::NotAllowed);
        }
        if Uid::parse(target.as_str()).is_none() {
            return Err(ProtocolError::Malformed);
        }
        self.check_member(&target)?;

        let acs = match self.per_user.get_mut(&target) {
            Some(pud) => {
                pud.sub.mode_given = mode;
                pud.sub.updated = parley_core::now();
                self.store.save_subscription(&pud.sub)?;
                pud.summary()
            }
            None => {
                let sub = SubscriptionRecord::new(self.name(), target.clone(), mode, mode);
                self.store.save_subscription(&sub)?;
                let pud = PerUserData::new(sub);
                let acs = pud.summary();
                let _ = self.per_user.insert(target.clone(), pud);
                acs
            }
        };
        self.notify_me(&target, PresWhat::Acs, None);
        Ok(acs)
    }

    #[allow(clippy::too_many_arguments)]
    async fn del(
        &mut self,
        sess: &Session,
        id: Option<&str>,
        alias: &str,
        uid: Option<&Uid>,
        what: DelWhat,
        before: Option<i64>,
        hard: bool,
    ) -> Result<Flow, ProtocolError> {
        let uid = uid.ok_or(ProtocolError::AuthRequired)?;
        match what {
            DelWhat::Msg => {
                let through = before.unwrap_or(self.record.seq_id).min(self.record.seq_id).max(0);
                if hard {
                    let mode = self.per_user.get(uid).map_or(AccessMode::NONE, PerUserData::mode);
                    if !mode.is_deleter() {
                        return Err(ProtocolError::PermissionDenied);
                    }
                    if through > self.record.clear_id {
                        let removed = self.store.delete_messages(self.name(), through)?;
                        self.record.clear_id = through;
                        self.record.updated = parley_core::now();
                        self.store.update_topic(&self.record)?;
                        debug!(removed, through, "messages hard-deleted");
                    }
                } else {
                    let pud = self.per_user.get_mut(uid).ok_or(ProtocolError::PermissionDenied)?;
                    if through > pud.sub.clear_id {
                        pud.sub.clear_id = through;
                        pud.sub.updated = parley_core::now();
                        self.store.save_subscription(&pud.sub)?;
                    }
                }
                reply(sess, ServerMessage::ok(id, Some(alias)).with_params(json!({ "clear": through }))).await;
                Ok(Flow::Continue)
            }
            DelWhat::Topic => {
                if self.cat != TopicCat::Group {
                    return Err(ProtocolError::NotAllowed);
                }
                if self.record.owner.as_ref() != Some(uid) {
                    return Err(ProtocolError::PermissionDenied);
                }
                reply(sess, ServerMessage::ok(id, Some(alias))).await;
                Ok(Flow::Delete)
            }
        }
    }

    // ── Fan-out ─────────────────────────────────────────────────────

    fn mode_of(&self, att: &Attached) -> AccessMode {
        match &att.uid {
            Some(uid) => self.per_user.get(uid).map_or(AccessMode::NONE, PerUserData::mode),
            None => att.anon.map_or(AccessMode::NONE, |a| a.mode),
        }
    }

    /// Queue `msg` on every attached session accepted by `filter`, with the
    /// topic rewritten to each session's alias. Waits on full mailboxes.
    async fn fan_out(&self, msg: &ServerMessage, filter: impl Fn(&Attached, AccessMode) -> bool) {
        let mut frames: HashMap<&str, Arc<str>> = HashMap::new();
        for att in self.sessions.values() {
            if !filter(att, self.mode_of(att)) {
                continue;
            }
            let frame = match frames.get(att.alias.as_str()) {
                Some(frame) => Arc::clone(frame),
                None => {
                    let mut aliased = msg.clone();
                    aliased.set_topic(&att.alias);
                    match aliased.encode() {
                        Ok(frame) => {
                            let _ = frames.insert(att.alias.as_str(), Arc::clone(&frame));
                            frame
                        }
                        Err(e) => {
                            warn!(error = %e, kind = msg.kind(), "failed to encode fan-out message");
                            return;
                        }
                    }
                }
            };
            if att.sess.queue_out(frame).await.is_err() {
                debug!(session_id = %att.sess.id(), "skipping closed session");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::ws_session;
    use crate::session::SessionQueues;
    use parley_core::MemoryStore;
    use std::time::Duration;

    fn hub() -> Arc<Hub> {
        Hub::new(Arc::new(MemoryStore::new()), TopicConfig::default())
    }

    async fn user_session(id: &str, user: &str) -> (Arc<Session>, SessionQueues) {
        let sess = ws_session(id);
        sess.set_user(Uid::from_raw(user)).unwrap();
        let queues = sess.take_queues().await.unwrap();
        (sess, queues)
    }

    fn join(sess: &Arc<Session>, topic: &str, alias: &str) -> SessionJoin {
        SessionJoin {
            sess: Arc::clone(sess),
            topic: topic.to_owned(),
            alias: alias.to_owned(),
            id: Some("sub".into()),
            mode: None,
            get: None,
            desc: None,
            created: false,
        }
    }

    fn create(sess: &Arc<Session>, topic: &str) -> SessionJoin {
        SessionJoin {
            created: true,
            ..join(sess, topic, topic)
        }
    }

    async fn next(queues: &mut SessionQueues) -> Value {
        let frame = queues.send.recv().await.unwrap();
        serde_json::from_str(&frame).unwrap()
    }

    fn publish(sess: &Arc<Session>, alias: &str, noecho: bool, content: Value) -> BroadcastReq {
        BroadcastReq::Data {
            sess: Arc::clone(sess),
            alias: alias.to_owned(),
            id: Some("pub".into()),
            noecho,
            content,
        }
    }

    fn meta(sess: &Arc<Session>, alias: &str, action: MetaAction) -> MetaReq {
        MetaReq {
            sess: Arc::clone(sess),
            alias: alias.to_owned(),
            id: Some("meta".into()),
            action,
        }
    }

    fn get(what: &str) -> MetaAction {
        MetaAction::Get(MsgGetQuery {
            what: what.to_owned(),
            data: None,
        })
    }

    /// Round-trip a `get desc` so every earlier request has been handled.
    async fn settle(handle: &TopicHandle, sess: &Arc<Session>, queues: &mut SessionQueues) -> Value {
        handle.meta.send(meta(sess, handle.name(), get("desc"))).await.unwrap();
        let desc = next(queues).await;
        assert_eq!(next(queues).await["ctrl"]["code"], 200);
        desc
    }

    #[tokio::test]
    async fn sequence_ids_are_gap_free_under_concurrency() {
        let hub = hub();
        let (alice, mut aq) = user_session("a1", "alice").await;
        hub.subscribe(create(&alice, "grpT")).await;
        assert_eq!(next(&mut aq).await["ctrl"]["code"], 201);
        let handle = alice.get_sub("grpT").unwrap();

        for i in 0..20 {
            let handle = handle.clone();
            let req = publish(&alice, "grpT", true, json!(i));
            let _ = tokio::spawn(async move { handle.broadcast.send(req).await.unwrap() });
        }

        let mut seqs = Vec::new();
        for _ in 0..20 {
            let ack = next(&mut aq).await;
            assert_eq!(ack["ctrl"]["code"], 202);
            seqs.push(ack["ctrl"]["params"]["seq"].as_i64().unwrap());
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=20).collect::<Vec<_>>());

        let query = MessageQuery {
            since: 0,
            before: None,
            limit: 100,
        };
        let stored = hub.store().messages("grpT", &query).unwrap();
        assert_eq!(stored.iter().map(|m| m.seq_id).collect::<Vec<_>>(), seqs);
    }

    #[tokio::test]
    async fn fan_out_honors_read_access_and_noecho() {
        let hub = hub();
        let (alice, mut aq) = user_session("a1", "alice").await;
        let (bob, mut bq) = user_session("b1", "bob").await;
        let (carol, mut cq) = user_session("c1", "carol").await;

        hub.subscribe(create(&alice, "grpT")).await;
        assert_eq!(next(&mut aq).await["ctrl"]["code"], 201);

        let mut write_only = join(&bob, "grpT", "grpT");
        write_only.mode = Some("JW".parse().unwrap());
        hub.subscribe(write_only).await;
        assert_eq!(next(&mut bq).await["ctrl"]["code"], 201);
        hub.subscribe(join(&carol, "grpT", "grpT")).await;
        assert_eq!(next(&mut cq).await["ctrl"]["code"], 201);

        let on_bob = next(&mut aq).await;
        assert_eq!(on_bob["pres"]["what"], "on");
        assert_eq!(on_bob["pres"]["src"], "usrbob");
        assert_eq!(next(&mut aq).await["pres"]["src"], "usrcarol");

        let handle = alice.get_sub("grpT").unwrap();
        handle.broadcast.send(publish(&alice, "grpT", true, json!("hi"))).await.unwrap();
        assert_eq!(next(&mut aq).await["ctrl"]["params"]["seq"], 1);
        let data = next(&mut cq).await;
        assert_eq!(data["data"]["seq"], 1);
        assert_eq!(data["data"]["from"], "alice");
        assert_eq!(data["data"]["content"], "hi");

        let _ = settle(&handle, &alice, &mut aq).await;
        assert!(bq.send.try_recv().is_err());
        assert!(aq.send.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_topic_exits_and_successor_reloads_state() {
        let hub = hub();
        let (alice, mut aq) = user_session("a1", "alice").await;
        hub.subscribe(create(&alice, "grpT")).await;
        assert_eq!(next(&mut aq).await["ctrl"]["code"], 201);
        let first = alice.get_sub("grpT").unwrap();

        first.broadcast.send(publish(&alice, "grpT", false, json!("hello"))).await.unwrap();
        assert_eq!(next(&mut aq).await["ctrl"]["code"], 202);
        assert_eq!(next(&mut aq).await["data"]["seq"], 1);

        let _ = alice.del_sub("grpT");
        let leave = SessionLeave {
            sess: Arc::clone(&alice),
            alias: "grpT".into(),
            id: Some("leave".into()),
            unsub: false,
        };
        first.unreg.send(leave).await.unwrap();
        assert_eq!(next(&mut aq).await["ctrl"]["code"], 200);

        tokio::time::advance(hub.config().idle_timeout + Duration::from_millis(10)).await;
        first.exited().await;
        assert!(hub.get("grpT").is_none());

        let mut again = join(&alice, "grpT", "grpT");
        again.get = Some(MsgGetQuery {
            what: "data".into(),
            data: None,
        });
        hub.subscribe(again).await;
        assert_eq!(next(&mut aq).await["ctrl"]["code"], 200);
        let replay = next(&mut aq).await;
        assert_eq!(replay["data"]["seq"], 1);
        assert_eq!(replay["data"]["content"], "hello");
        assert_eq!(next(&mut aq).await["ctrl"]["params"]["count"], 1);

        let second = alice.get_sub("grpT").unwrap();
        assert_ne!(first.id(), second.id());
    }

    #[tokio::test(start_paused = true)]
    async fn attached_topic_does_not_idle_out() {
        let hub = hub();
        let (alice, mut aq) = user_session("a1", "alice").await;
        hub.subscribe(create(&alice, "grpT")).await;
        assert_eq!(next(&mut aq).await["ctrl"]["code"], 201);

        tokio::time::advance(hub.config().idle_timeout * 3).await;
        let handle = alice.get_sub("grpT").unwrap();
        let _ = settle(&handle, &alice, &mut aq).await;
        assert!(!handle.has_exited());
        assert_eq!(hub.get("grpT").map(|h| h.id()), Some(handle.id()));
    }

    #[tokio::test]
    async fn offline_subscriber_hears_about_messages_on_me() {
        let hub = hub();
        let (alice, mut aq) = user_session("a1", "alice").await;
        let (bob_me, mut mq) = user_session("b1", "bob").await;
        let (bob, mut bq) = user_session("b2", "bob").await;

        hub.subscribe(join(&bob_me, "usrbob", "me")).await;
        assert_eq!(next(&mut mq).await["ctrl"]["code"], 201);

        hub.subscribe(create(&alice, "grpT")).await;
        assert_eq!(next(&mut aq).await["ctrl"]["code"], 201);
        hub.subscribe(join(&bob, "grpT", "grpT")).await;
        assert_eq!(next(&mut bq).await["ctrl"]["code"], 201);

        let acs = next(&mut mq).await;
        assert_eq!(acs["pres"]["topic"], "me");
        assert_eq!(acs["pres"]["src"], "grpT");
        assert_eq!(acs["pres"]["what"], "acs");

        let handle = bob.del_sub("grpT").unwrap();
        let leave = SessionLeave {
            sess: Arc::clone(&bob),
            alias: "grpT".into(),
            id: None,
            unsub: false,
        };
        handle.unreg.send(leave).await.unwrap();

        handle.broadcast.send(publish(&alice, "grpT", true, json!("ping"))).await.unwrap();
        assert_eq!(next(&mut aq).await["pres"]["what"], "on");
        assert_eq!(next(&mut aq).await["pres"]["what"], "off");
        assert_eq!(next(&mut aq).await["ctrl"]["code"], 202);

        let msg = next(&mut mq).await;
        assert_eq!(msg["pres"]["what"], "msg");
        assert_eq!(msg["pres"]["src"], "grpT");
        assert_eq!(msg["pres"]["seq"], 1);
        assert!(bq.send.try_recv().is_err());
    }

    #[tokio::test]
    async fn receipts_only_move_forward() {
        let hub = hub();
        let (alice, mut aq) = user_session("a1", "alice").await;
        hub.subscribe(create(&alice, "grpT")).await;
        assert_eq!(next(&mut aq).await["ctrl"]["code"], 201);
        let handle = alice.get_sub("grpT").unwrap();
        for i in 0..3 {
            handle.broadcast.send(publish(&alice, "grpT", true, json!(i))).await.unwrap();
            assert_eq!(next(&mut aq).await["ctrl"]["code"], 202);
        }

        let (bob, mut bq) = user_session("b1", "bob").await;
        hub.subscribe(join(&bob, "grpT", "grpT")).await;
        assert_eq!(next(&mut bq).await["ctrl"]["code"], 201);
        assert_eq!(next(&mut aq).await["pres"]["what"], "on");

        let note = |what, seq| BroadcastReq::Note {
            sess: Arc::clone(&bob),
            what,
            seq: Some(seq),
        };
        handle.broadcast.send(note(NoteWhat::Read, 2)).await.unwrap();
        handle.broadcast.send(note(NoteWhat::Recv, 1)).await.unwrap();
        handle.broadcast.send(note(NoteWhat::Read, 9)).await.unwrap();

        let info = next(&mut aq).await;
        assert_eq!(info["info"]["what"], "read");
        assert_eq!(info["info"]["from"], "bob");
        assert_eq!(info["info"]["seq"], 2);

        let desc = settle(&handle, &bob, &mut bq).await;
        assert_eq!(desc["meta"]["desc"]["read"], 2);
        assert_eq!(desc["meta"]["desc"]["recv"], 2);
        assert_eq!(desc["meta"]["desc"]["seq"], 3);
        assert!(aq.send.try_recv().is_err());
    }

    #[tokio::test]
    async fn hard_delete_clears_history() {
        let hub = hub();
        let (alice, mut aq) = user_session("a1", "alice").await;
        hub.subscribe(create(&alice, "grpT")).await;
        assert_eq!(next(&mut aq).await["ctrl"]["code"], 201);
        let handle = alice.get_sub("grpT").unwrap();
        for i in 0..2 {
            handle.broadcast.send(publish(&alice, "grpT", true, json!(i))).await.unwrap();
            assert_eq!(next(&mut aq).await["ctrl"]["code"], 202);
        }

        let del = MetaAction::Del {
            what: DelWhat::Msg,
            before: None,
            hard: true,
        };
        handle.meta.send(meta(&alice, "grpT", del)).await.unwrap();
        assert_eq!(next(&mut aq).await["ctrl"]["params"]["clear"], 2);

        handle.meta.send(meta(&alice, "grpT", get("data"))).await.unwrap();
        assert_eq!(next(&mut aq).await["ctrl"]["code"], 204);

        let desc = settle(&handle, &alice, &mut aq).await;
        assert_eq!(desc["meta"]["desc"]["clear"], 2);
        assert_eq!(desc["meta"]["desc"]["seq"], 2);
    }

    #[tokio::test]
    async fn owner_deletes_group() {
        let hub = hub();
        let (alice, mut aq) = user_session("a1", "alice").await;
        let (bob, mut bq) = user_session("b1", "bob").await;
        hub.subscribe(create(&alice, "grpT")).await;
        assert_eq!(next(&mut aq).await["ctrl"]["code"], 201);
        hub.subscribe(join(&bob, "grpT", "grpT")).await;
        assert_eq!(next(&mut bq).await["ctrl"]["code"], 201);
        assert_eq!(next(&mut aq).await["pres"]["what"], "on");
        let handle = alice.get_sub("grpT").unwrap();

        let del_topic = || MetaAction::Del {
            what: DelWhat::Topic,
            before: None,
            hard: true,
        };
        handle.meta.send(meta(&bob, "grpT", del_topic())).await.unwrap();
        assert_eq!(next(&mut bq).await["ctrl"]["code"], 403);

        handle.meta.send(meta(&alice, "grpT", del_topic())).await.unwrap();
        assert_eq!(next(&mut aq).await["ctrl"]["code"], 200);
        assert_eq!(next(&mut aq).await["pres"]["what"], "gone");
        assert_eq!(next(&mut bq).await["pres"]["what"], "gone");

        handle.exited().await;
        assert_eq!(bq.detach.recv().await.unwrap().topic, "grpT");
        assert!(hub.store().load_topic("grpT").unwrap().is_none());
    }

    #[tokio::test]
    async fn access_gates() {
        let hub = hub();
        let (alice, mut aq) = user_session("a1", "alice").await;
        hub.subscribe(create(&alice, "grpT")).await;
        assert_eq!(next(&mut aq).await["ctrl"]["code"], 201);
        let handle = alice.get_sub("grpT").unwrap();

        // anonymous users get nothing by default
        let anon = ws_session("anon");
        let mut nq = anon.take_queues().await.unwrap();
        hub.subscribe(join(&anon, "grpT", "grpT")).await;
        assert_eq!(next(&mut nq).await["ctrl"]["code"], 403);

        // the owner cannot walk away from their group
        let _ = alice.del_sub("grpT");
        let unsub = SessionLeave {
            sess: Arc::clone(&alice),
            alias: "grpT".into(),
            id: Some("leave".into()),
            unsub: true,
        };
        handle.unreg.send(unsub).await.unwrap();
        assert_eq!(next(&mut aq).await["ctrl"]["code"], 403);
        assert!(alice.get_sub("grpT").is_some());

        // someone else's P2P conversation
        let (mallory, mut mq) = user_session("m1", "mallory").await;
        hub.subscribe(join(&mallory, "p2palice.bob", "p2palice.bob")).await;
        assert_eq!(next(&mut mq).await["ctrl"]["code"], 403);

        // and someone else's me topic
        hub.subscribe(join(&mallory, "usralice", "usralice")).await;
        assert_eq!(next(&mut mq).await["ctrl"]["code"], 403);
    }

    #[tokio::test]
    async fn second_attach_is_not_modified() {
        let hub = hub();
        let (alice, mut aq) = user_session("a1", "alice").await;
        hub.subscribe(create(&alice, "grpT")).await;
        assert_eq!(next(&mut aq).await["ctrl"]["code"], 201);
        hub.subscribe(join(&alice, "grpT", "grpT")).await;
        assert_eq!(next(&mut aq).await["ctrl"]["code"], 304);
    }

    #[tokio::test]
    async fn only_first_attach_after_load_is_created() {
        let hub = hub();
        let (alice, mut aq) = user_session("a1", "alice").await;
        hub.subscribe(create(&alice, "grpT")).await;
        assert_eq!(next(&mut aq).await["ctrl"]["code"], 201);

        // same user on another device
        let (phone, mut pq) = user_session("a2", "alice").await;
        hub.subscribe(join(&phone, "grpT", "grpT")).await;
        assert_eq!(next(&mut pq).await["ctrl"]["code"], 200);
    }

    #[tokio::test]
    async fn errors_echo_the_session_alias() {
        let hub = hub();
        let (alice, mut aq) = user_session("a1", "alice").await;
        hub.subscribe(join(&alice, "p2palice.bob", "usrbob")).await;
        let reply = next(&mut aq).await;
        assert_eq!(reply["ctrl"]["code"], 201);
        assert_eq!(reply["ctrl"]["topic"], "usrbob");
        let handle = alice.get_sub("p2palice.bob").unwrap();

        let (bob, mut bq) = user_session("b1", "bob").await;
        handle.broadcast.send(publish(&bob, "usralice", true, json!("hi"))).await.unwrap();
        let err = next(&mut bq).await;
        assert_eq!(err["ctrl"]["code"], 409);
        assert_eq!(err["ctrl"]["topic"], "usralice");
    }

    #[tokio::test(start_paused = true)]
    async fn join_buffered_at_idle_exit_reaches_successor() {
        let hub = hub();
        let (alice, mut aq) = user_session("a1", "alice").await;
        hub.subscribe(create(&alice, "grpT")).await;
        assert_eq!(next(&mut aq).await["ctrl"]["code"], 201);
        let first = alice.get_sub("grpT").unwrap();

        let _ = alice.del_sub("grpT");
        let leave = SessionLeave {
            sess: Arc::clone(&alice),
            alias: "grpT".into(),
            id: Some("leave".into()),
            unsub: false,
        };
        first.unreg.send(leave).await.unwrap();
        assert_eq!(next(&mut aq).await["ctrl"]["code"], 200);

        // Park the actor on a reply to a full mailbox while the idle
        // deadline passes and a subscribe queues up behind it.
        let (bob, mut bq) = user_session("b1", "bob").await;
        for _ in 0..4 {
            bob.try_queue_out(Arc::from("{}")).unwrap();
        }
        first.meta.send(meta(&bob, "grpT", get("desc"))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        tokio::time::advance(hub.config().idle_timeout + Duration::from_millis(10)).await;

        let (carol, mut cq) = user_session("c1", "carol").await;
        hub.subscribe(join(&carol, "grpT", "grpT")).await;
        assert!(!first.is_suspended());

        let _ = bq.send.recv().await.unwrap();
        first.exited().await;

        assert_eq!(next(&mut cq).await["ctrl"]["code"], 201);
        let second = carol.get_sub("grpT").unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(hub.get("grpT").unwrap().id(), second.id());

        for _ in 0..3 {
            let _ = bq.send.recv().await.unwrap();
        }
        assert_eq!(next(&mut bq).await["ctrl"]["code"], 409);
    }
}
