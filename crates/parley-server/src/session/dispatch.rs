//! Decoding and routing of inbound client frames.
//!
//! Used by both transports. Every request either completes here (`hi`,
//! `login`) or is forwarded to a topic actor, which replies on its own.
//! Failures are reported to the client as a `ctrl` message and never end
//! the session.

use std::sync::Arc;

use metrics::counter;
use parley_core::protocol::{
    version_at_least, ClientMessage, MsgClientDel, MsgClientGet, MsgClientHi, MsgClientLeave, MsgClientLogin,
    MsgClientNote, MsgClientPub, MsgClientSet, MsgClientSub, ServerMessage, MIN_SUPPORTED_VERSION, SERVER_VERSION,
};
use parley_core::topic::{resolve, ResolvedTopic, NEW_ALIAS};
use parley_core::{ProtocolError, Uid};
use parley_telemetry::metrics::{CLIENT_MESSAGES_TOTAL, PROTOCOL_ERRORS_TOTAL};
use serde_json::json;
use tokio::sync::mpsc::error::SendError;
use tracing::{debug, instrument};

use super::Session;
use crate::context::ServerContext;
use crate::topic::{
    session_alias, BroadcastReq, MetaAction, MetaReq, SessionJoin, SessionLeave, TopicHandle,
};

/// Decode and handle one inbound frame. Undecodable input gets a
/// `ctrl 400` and the session carries on.
pub async fn dispatch_raw(ctx: &ServerContext, sess: &Arc<Session>, raw: &[u8]) {
    match ClientMessage::decode(raw) {
        Ok(msg) => dispatch(ctx, sess, msg).await,
        Err(err) => {
            debug!(session_id = %sess.id(), len = raw.len(), "undecodable client frame");
            counter!(PROTOCOL_ERRORS_TOTAL, "kind" => err.error_kind()).increment(1);
            let _ = sess.send_message(&ServerMessage::error(None, None, &err)).await;
        }
    }
}

#[instrument(skip_all, fields(session_id = %sess.id(), kind = msg.kind()))]
pub async fn dispatch(ctx: &ServerContext, sess: &Arc<Session>, msg: ClientMessage) {
    counter!(CLIENT_MESSAGES_TOTAL, "kind" => msg.kind()).increment(1);

    let id = msg.id().map(str::to_owned);
    let topic = msg.topic().map(str::to_owned);
    let is_note = matches!(msg, ClientMessage::Note(_));

    let result = match msg {
        ClientMessage::Hi(m) => hello(ctx, sess, m).await,
        ClientMessage::Login(m) => login(ctx, sess, m).await,
        ClientMessage::Sub(m) => subscribe(ctx, sess, m).await,
        ClientMessage::Leave(m) => leave(sess, m).await,
        ClientMessage::Pub(m) => publish(sess, m).await,
        ClientMessage::Get(m) => get(sess, m).await,
        ClientMessage::Set(m) => set(sess, m).await,
        ClientMessage::Del(m) => del(sess, m).await,
        ClientMessage::Note(m) => note(sess, m).await,
    };

    if let Err(err) = result {
        counter!(PROTOCOL_ERRORS_TOTAL, "kind" => err.error_kind()).increment(1);
        // Notes are fire-and-forget.
        if is_note {
            debug!(error = %err, "note dropped");
            return;
        }
        debug!(error = %err, "request failed");
        let _ = sess
            .send_message(&ServerMessage::error(id.as_deref(), topic.as_deref(), &err))
            .await;
    }
}

async fn hello(ctx: &ServerContext, sess: &Arc<Session>, m: MsgClientHi) -> Result<(), ProtocolError> {
    if let Some(ver) = m.ver.as_deref() {
        if !version_at_least(ver, MIN_SUPPORTED_VERSION) {
            return Err(ProtocolError::VersionNotSupported);
        }
    }
    if let Some(ua) = m.ua {
        sess.set_user_agent(ua.clone());
        if let Some(uid) = sess.user() {
            ctx.hub.user_agent_changed(&uid, ua);
        }
    }
    let reply = ServerMessage::created(m.id.as_deref(), None)
        .with_params(json!({ "ver": SERVER_VERSION, "sid": sess.id() }));
    let _ = sess.send_message(&reply).await;
    Ok(())
}

/// Bind the session to a user id. Authentication itself happens upstream.
async fn login(ctx: &ServerContext, sess: &Arc<Session>, m: MsgClientLogin) -> Result<(), ProtocolError> {
    let uid = Uid::parse(&m.user).ok_or(ProtocolError::Malformed)?;
    sess.set_user(uid.clone())?;
    if let Some(ua) = sess.user_agent() {
        ctx.hub.user_agent_changed(&uid, ua);
    }
    let reply = ServerMessage::ok(m.id.as_deref(), None).with_params(json!({ "user": uid }));
    let _ = sess.send_message(&reply).await;
    Ok(())
}

async fn subscribe(ctx: &ServerContext, sess: &Arc<Session>, m: MsgClientSub) -> Result<(), ProtocolError> {
    let user = sess.user();
    let resolved = resolve(&m.topic, user.as_ref(), || ctx.store.generate_unique_id())?;
    if resolved.created && user.is_none() {
        return Err(ProtocolError::AuthRequired);
    }
    if sess.get_sub(&resolved.name).is_some() {
        let reply = ServerMessage::already_subscribed(m.id.as_deref(), Some(&m.topic));
        let _ = sess.send_message(&reply).await;
        return Ok(());
    }

    let alias = session_alias(&resolved, user.as_ref());
    ctx.hub
        .subscribe(SessionJoin {
            sess: Arc::clone(sess),
            topic: resolved.name,
            alias,
            id: m.id,
            mode: m.mode,
            get: m.get,
            desc: m.desc,
            created: resolved.created,
        })
        .await;
    Ok(())
}

async fn leave(sess: &Arc<Session>, m: MsgClientLeave) -> Result<(), ProtocolError> {
    let user = sess.user();
    let resolved = resolve_existing(&m.topic, user.as_ref())?;
    let Some(handle) = sess.del_sub(&resolved.name) else {
        let reply = ServerMessage::not_joined(m.id.as_deref(), Some(&m.topic));
        let _ = sess.send_message(&reply).await;
        return Ok(());
    };

    let leave = SessionLeave {
        sess: Arc::clone(sess),
        alias: session_alias(&resolved, user.as_ref()),
        id: m.id.clone(),
        unsub: m.unsub,
    };
    if handle.unreg.send(leave).await.is_err() {
        // The actor already exited and dropped every session with it.
        if m.unsub {
            return Err(ProtocolError::TopicUnavailable);
        }
        let _ = sess.send_message(&ServerMessage::ok(m.id.as_deref(), Some(&m.topic))).await;
    }
    Ok(())
}

async fn publish(sess: &Arc<Session>, m: MsgClientPub) -> Result<(), ProtocolError> {
    let (alias, handle) = attached(sess, &m.topic)?;
    let req = BroadcastReq::Data {
        sess: Arc::clone(sess),
        alias,
        id: m.id,
        noecho: m.noecho,
        content: m.content,
    };
    forwarded(sess, &handle, handle.broadcast.send(req).await)
}

async fn get(sess: &Arc<Session>, m: MsgClientGet) -> Result<(), ProtocolError> {
    let (alias, handle) = attached(sess, &m.topic)?;
    let req = MetaReq {
        sess: Arc::clone(sess),
        alias,
        id: m.id,
        action: MetaAction::Get(m.query),
    };
    forwarded(sess, &handle, handle.meta.send(req).await)
}

async fn set(sess: &Arc<Session>, m: MsgClientSet) -> Result<(), ProtocolError> {
    let (alias, handle) = attached(sess, &m.topic)?;
    let req = MetaReq {
        sess: Arc::clone(sess),
        alias,
        id: m.id,
        action: MetaAction::Set {
            desc: m.desc,
            sub: m.sub,
        },
    };
    forwarded(sess, &handle, handle.meta.send(req).await)
}

async fn del(sess: &Arc<Session>, m: MsgClientDel) -> Result<(), ProtocolError> {
    let (alias, handle) = attached(sess, &m.topic)?;
    let req = MetaReq {
        sess: Arc::clone(sess),
        alias,
        id: m.id,
        action: MetaAction::Del {
            what: m.what,
            before: m.before,
            hard: m.hard,
        },
    };
    forwarded(sess, &handle, handle.meta.send(req).await)
}

async fn note(sess: &Arc<Session>, m: MsgClientNote) -> Result<(), ProtocolError> {
    let (_, handle) = attached(sess, &m.topic)?;
    let req = BroadcastReq::Note {
        sess: Arc::clone(sess),
        what: m.what,
        seq: m.seq,
    };
    forwarded(sess, &handle, handle.broadcast.send(req).await)
}

/// Resolve a name that must refer to an existing topic.
fn resolve_existing(requested: &str, user: Option<&Uid>) -> Result<ResolvedTopic, ProtocolError> {
    if requested == NEW_ALIAS {
        return Err(ProtocolError::AttachFirst);
    }
    resolve(requested, user, String::new)
}

/// The session's alias for `requested` and the actor serving it.
fn attached(sess: &Session, requested: &str) -> Result<(String, TopicHandle), ProtocolError> {
    let user = sess.user();
    let resolved = resolve_existing(requested, user.as_ref())?;
    let handle = sess.get_sub(&resolved.name).ok_or(ProtocolError::AttachFirst)?;
    Ok((session_alias(&resolved, user.as_ref()), handle))
}

/// A closed mailbox means the actor is gone; drop the stale subscription.
fn forwarded<T>(sess: &Session, handle: &TopicHandle, sent: Result<(), SendError<T>>) -> Result<(), ProtocolError> {
    if sent.is_err() {
        let _ = sess.del_sub_if(handle.name(), handle.id());
        return Err(ProtocolError::TopicUnavailable);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::session::{SessionQueues, Transport};
    use parley_core::MemoryStore;
    use serde_json::Value;

    fn context() -> ServerContext {
        ServerContext::new(ServerConfig::default(), Arc::new(MemoryStore::new()))
    }

    async fn connect(ctx: &ServerContext) -> (Arc<Session>, SessionQueues) {
        let sess = ctx.sessions.create(Transport::WebSocket { remote_addr: None }, None);
        let queues = sess.take_queues().await.unwrap();
        (sess, queues)
    }

    async fn send(ctx: &ServerContext, sess: &Arc<Session>, frame: Value) {
        dispatch_raw(ctx, sess, frame.to_string().as_bytes()).await;
    }

    async fn next(queues: &mut SessionQueues) -> Value {
        let frame = queues.send.recv().await.unwrap();
        serde_json::from_str(&frame).unwrap()
    }

    #[tokio::test]
    async fn garbage_gets_400_and_session_continues() {
        let ctx = context();
        let (sess, mut q) = connect(&ctx).await;
        dispatch_raw(&ctx, &sess, b"{not json").await;
        assert_eq!(next(&mut q).await["ctrl"]["code"], 400);

        send(&ctx, &sess, json!({ "hi": { "id": "1", "ver": "0.13" } })).await;
        let hi = next(&mut q).await;
        assert_eq!(hi["ctrl"]["code"], 201);
        assert_eq!(hi["ctrl"]["id"], "1");
        assert_eq!(hi["ctrl"]["params"]["sid"], sess.id().as_str());
        assert!(!sess.is_closed());
    }

    #[tokio::test]
    async fn old_client_version_is_rejected() {
        let ctx = context();
        let (sess, mut q) = connect(&ctx).await;
        send(&ctx, &sess, json!({ "hi": { "id": "1", "ver": "0.9" } })).await;
        assert_eq!(next(&mut q).await["ctrl"]["code"], 505);
    }

    #[tokio::test]
    async fn login_once_per_session() {
        let ctx = context();
        let (sess, mut q) = connect(&ctx).await;
        send(&ctx, &sess, json!({ "login": { "id": "1", "user": "alice" } })).await;
        let ok = next(&mut q).await;
        assert_eq!(ok["ctrl"]["code"], 200);
        assert_eq!(ok["ctrl"]["params"]["user"], "alice");

        send(&ctx, &sess, json!({ "login": { "id": "2", "user": "bob" } })).await;
        assert_eq!(next(&mut q).await["ctrl"]["code"], 409);

        send(&ctx, &sess, json!({ "login": { "id": "3", "user": "a.b" } })).await;
        assert_eq!(next(&mut q).await["ctrl"]["code"], 400);
    }

    #[tokio::test]
    async fn anonymous_cannot_create_or_use_me() {
        let ctx = context();
        let (sess, mut q) = connect(&ctx).await;
        send(&ctx, &sess, json!({ "sub": { "id": "1", "topic": "new" } })).await;
        assert_eq!(next(&mut q).await["ctrl"]["code"], 401);
        send(&ctx, &sess, json!({ "sub": { "id": "2", "topic": "me" } })).await;
        assert_eq!(next(&mut q).await["ctrl"]["code"], 401);
    }

    #[tokio::test]
    async fn publish_requires_attachment() {
        let ctx = context();
        let (sess, mut q) = connect(&ctx).await;
        send(&ctx, &sess, json!({ "login": { "user": "alice" } })).await;
        let _ = next(&mut q).await;

        send(&ctx, &sess, json!({ "pub": { "id": "1", "topic": "grpX", "content": "hi" } })).await;
        let err = next(&mut q).await;
        assert_eq!(err["ctrl"]["code"], 409);
        assert_eq!(err["ctrl"]["topic"], "grpX");

        send(&ctx, &sess, json!({ "pub": { "id": "2", "topic": "new", "content": "hi" } })).await;
        assert_eq!(next(&mut q).await["ctrl"]["code"], 409);

        // notes fail silently
        send(&ctx, &sess, json!({ "note": { "topic": "grpX", "what": "kp" } })).await;
        send(&ctx, &sess, json!({ "leave": { "id": "3", "topic": "grpX" } })).await;
        assert_eq!(next(&mut q).await["ctrl"]["code"], 304);
    }

    #[tokio::test]
    async fn create_publish_and_leave() {
        let ctx = context();
        let (sess, mut q) = connect(&ctx).await;
        send(&ctx, &sess, json!({ "login": { "user": "alice" } })).await;
        let _ = next(&mut q).await;

        send(&ctx, &sess, json!({ "sub": { "id": "1", "topic": "new" } })).await;
        let created = next(&mut q).await;
        assert_eq!(created["ctrl"]["code"], 201);
        let topic = created["ctrl"]["topic"].as_str().unwrap().to_owned();
        assert!(topic.starts_with("grp"));
        assert_eq!(created["ctrl"]["params"]["acs"]["mode"], "JRWPASDO");

        send(&ctx, &sess, json!({ "sub": { "id": "2", "topic": topic } })).await;
        assert_eq!(next(&mut q).await["ctrl"]["code"], 304);

        send(&ctx, &sess, json!({ "pub": { "id": "3", "topic": topic, "content": "hello" } })).await;
        let ack = next(&mut q).await;
        assert_eq!(ack["ctrl"]["code"], 202);
        assert_eq!(ack["ctrl"]["params"]["seq"], 1);
        let data = next(&mut q).await;
        assert_eq!(data["data"]["topic"], topic);
        assert_eq!(data["data"]["content"], "hello");

        send(&ctx, &sess, json!({ "leave": { "id": "4", "topic": topic } })).await;
        assert_eq!(next(&mut q).await["ctrl"]["code"], 200);
        assert!(sess.get_sub(&topic).is_none());
    }

    #[tokio::test]
    async fn p2p_topics_use_peer_alias() {
        let ctx = context();
        let (alice, mut aq) = connect(&ctx).await;
        let (bob, mut bq) = connect(&ctx).await;
        send(&ctx, &alice, json!({ "login": { "user": "alice" } })).await;
        send(&ctx, &bob, json!({ "login": { "user": "bob" } })).await;
        let _ = next(&mut aq).await;
        let _ = next(&mut bq).await;

        send(&ctx, &alice, json!({ "sub": { "id": "1", "topic": "usrbob" } })).await;
        let reply = next(&mut aq).await;
        assert_eq!(reply["ctrl"]["code"], 201);
        assert_eq!(reply["ctrl"]["topic"], "usrbob");
        assert!(alice.get_sub("p2palice.bob").is_some());

        send(&ctx, &bob, json!({ "sub": { "id": "1", "topic": "usralice" } })).await;
        assert_eq!(next(&mut bq).await["ctrl"]["code"], 200);
        assert_eq!(next(&mut aq).await["pres"]["src"], "usrbob");

        send(&ctx, &alice, json!({ "pub": { "topic": "usrbob", "content": "yo", "noecho": true } })).await;
        assert_eq!(next(&mut aq).await["ctrl"]["code"], 202);
        let data = next(&mut bq).await;
        assert_eq!(data["data"]["topic"], "usralice");
        assert_eq!(data["data"]["from"], "alice");
    }
}
