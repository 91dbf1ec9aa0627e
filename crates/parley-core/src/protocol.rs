//! JSON wire protocol.
//!
//! Every frame is an object with exactly one top-level key naming the
//! message kind, e.g. `{"sub": {"id": "1", "topic": "me"}}`. Server
//! messages always carry the topic they originate from (when there is one)
//! and a server timestamp.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::access::{AccessMode, DefaultAccess};
use crate::errors::ProtocolError;
use crate::ids::Uid;
use crate::payload::{PrivateData, PublicData};

/// Oldest client protocol version still accepted by `hi`.
pub const MIN_SUPPORTED_VERSION: &str = "0.13";
/// Protocol version reported to clients.
pub const SERVER_VERSION: &str = "0.13";

// ── Client → server ─────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientMessage {
    Hi(MsgClientHi),
    Login(MsgClientLogin),
    Sub(MsgClientSub),
    Leave(MsgClientLeave),
    Pub(MsgClientPub),
    Get(MsgClientGet),
    Set(MsgClientSet),
    Del(MsgClientDel),
    Note(MsgClientNote),
}

impl ClientMessage {
    /// Decode one inbound frame.
    pub fn decode(raw: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(raw).map_err(|_| ProtocolError::Malformed)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hi(_) => "hi",
            Self::Login(_) => "login",
            Self::Sub(_) => "sub",
            Self::Leave(_) => "leave",
            Self::Pub(_) => "pub",
            Self::Get(_) => "get",
            Self::Set(_) => "set",
            Self::Del(_) => "del",
            Self::Note(_) => "note",
        }
    }

    /// Client-chosen request id echoed in the `ctrl` response.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Hi(m) => m.id.as_deref(),
            Self::Login(m) => m.id.as_deref(),
            Self::Sub(m) => m.id.as_deref(),
            Self::Leave(m) => m.id.as_deref(),
            Self::Pub(m) => m.id.as_deref(),
            Self::Get(m) => m.id.as_deref(),
            Self::Set(m) => m.id.as_deref(),
            Self::Del(m) => m.id.as_deref(),
            Self::Note(_) => None,
        }
    }

    pub fn topic(&self) -> Option<&str> {
        match self {
            Self::Hi(_) | Self::Login(_) => None,
            Self::Sub(m) => Some(&m.topic),
            Self::Leave(m) => Some(&m.topic),
            Self::Pub(m) => Some(&m.topic),
            Self::Get(m) => Some(&m.topic),
            Self::Set(m) => Some(&m.topic),
            Self::Del(m) => Some(&m.topic),
            Self::Note(m) => Some(&m.topic),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct MsgClientHi {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub ver: Option<String>,
    #[serde(default)]
    pub ua: Option<String>,
}

/// Binds a user identity to the session. Credentials are checked upstream.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct MsgClientLogin {
    #[serde(default)]
    pub id: Option<String>,
    pub user: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct MsgClientSub {
    #[serde(default)]
    pub id: Option<String>,
    pub topic: String,
    /// Requested access mode; defaults to whatever is granted.
    #[serde(default)]
    pub mode: Option<AccessMode>,
    /// Metadata to send right after attaching.
    #[serde(default)]
    pub get: Option<MsgGetQuery>,
    /// Description for a topic being created with `new`.
    #[serde(default)]
    pub desc: Option<MsgSetDesc>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct MsgClientLeave {
    #[serde(default)]
    pub id: Option<String>,
    pub topic: String,
    /// Also drop the subscription itself, not only this session's attachment.
    #[serde(default)]
    pub unsub: bool,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct MsgClientPub {
    #[serde(default)]
    pub id: Option<String>,
    pub topic: String,
    /// Do not echo the message back to the publishing session.
    #[serde(default)]
    pub noecho: bool,
    pub content: Value,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct MsgClientGet {
    #[serde(default)]
    pub id: Option<String>,
    pub topic: String,
    #[serde(flatten)]
    pub query: MsgGetQuery,
}

/// `what` is a space-separated list of `desc`, `sub` and `data`.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct MsgGetQuery {
    pub what: String,
    #[serde(default)]
    pub data: Option<MsgBrowseOpts>,
}

impl MsgGetQuery {
    pub fn wants(&self) -> MetaWhat {
        let mut what = MetaWhat::default();
        for part in self.what.split_whitespace() {
            match part {
                "desc" => what.desc = true,
                "sub" => what.sub = true,
                "data" => what.data = true,
                _ => {}
            }
        }
        what
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetaWhat {
    pub desc: bool,
    pub sub: bool,
    pub data: bool,
}

impl MetaWhat {
    pub fn is_empty(&self) -> bool {
        !(self.desc || self.sub || self.data)
    }
}

/// History paging: messages with `since < seq < before`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct MsgBrowseOpts {
    #[serde(default)]
    pub since: Option<i64>,
    #[serde(default)]
    pub before: Option<i64>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct MsgClientSet {
    #[serde(default)]
    pub id: Option<String>,
    pub topic: String,
    #[serde(default)]
    pub desc: Option<MsgSetDesc>,
    #[serde(default)]
    pub sub: Option<MsgSetSub>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct MsgSetDesc {
    #[serde(default)]
    pub defacs: Option<DefaultAccess>,
    #[serde(default)]
    pub public: Option<PublicData>,
    #[serde(default)]
    pub private: Option<PrivateData>,
}

/// Change a subscription's mode. Without `user` it targets the caller.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct MsgSetSub {
    #[serde(default)]
    pub user: Option<Uid>,
    #[serde(default)]
    pub mode: Option<AccessMode>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DelWhat {
    Msg,
    Topic,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct MsgClientDel {
    #[serde(default)]
    pub id: Option<String>,
    pub topic: String,
    pub what: DelWhat,
    /// Delete messages with `seq <= before`; defaults to everything.
    #[serde(default)]
    pub before: Option<i64>,
    #[serde(default)]
    pub hard: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteWhat {
    /// Message received by the client.
    Recv,
    /// Message read by the user.
    Read,
    /// Key press: the user is typing.
    Kp,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct MsgClientNote {
    pub topic: String,
    pub what: NoteWhat,
    #[serde(default)]
    pub seq: Option<i64>,
}

// ── Server → client ─────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMessage {
    Ctrl(MsgServerCtrl),
    Data(MsgServerData),
    Meta(MsgServerMeta),
    Pres(MsgServerPres),
    Info(MsgServerInfo),
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct MsgServerCtrl {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    pub code: u16,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    pub ts: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct MsgServerData {
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Uid>,
    pub ts: DateTime<Utc>,
    pub seq: i64,
    pub content: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PresWhat {
    /// `src` came online.
    On,
    /// `src` went offline.
    Off,
    /// New message in `src`.
    Msg,
    /// `src` changed its user agent.
    Ua,
    /// Access mode of a subscription to `src` changed or was created.
    Acs,
    /// `src` was deleted or the subscription removed.
    Gone,
    /// Description of `src` updated.
    Upd,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct MsgServerPres {
    pub topic: String,
    pub src: String,
    pub what: PresWhat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ua: Option<String>,
    pub ts: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct MsgServerInfo {
    pub topic: String,
    pub from: Uid,
    pub what: NoteWhat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
    pub ts: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct MsgServerMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub topic: String,
    pub ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<TopicDesc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<Vec<TopicSub>>,
}

/// Requested, granted and effective modes of one subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct AccessSummary {
    pub want: AccessMode,
    pub given: AccessMode,
    pub mode: AccessMode,
}

impl AccessSummary {
    pub fn new(want: AccessMode, given: AccessMode) -> Self {
        Self {
            want,
            given,
            mode: want & given,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct TopicDesc {
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defacs: Option<DefaultAccess>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acs: Option<AccessSummary>,
    pub seq: i64,
    pub clear: i64,
    pub read: i64,
    pub recv: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public: Option<PublicData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<PrivateData>,
}

/// One row of a subscriber list, or for `me` topics one contact.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct TopicSub {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Uid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    pub updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acs: Option<AccessSummary>,
    #[serde(default)]
    pub read: i64,
    #[serde(default)]
    pub recv: i64,
    #[serde(default)]
    pub online: bool,
    /// Peer of a P2P contact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with: Option<Uid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<PrivateData>,
}

impl ServerMessage {
    pub fn ctrl(id: Option<&str>, topic: Option<&str>, code: u16, text: impl Into<String>) -> Self {
        Self::Ctrl(MsgServerCtrl {
            id: id.map(str::to_owned),
            topic: topic.map(str::to_owned),
            code,
            text: text.into(),
            params: None,
            ts: crate::now(),
        })
    }

    /// Attach `params` to a `ctrl` message; other kinds are returned as is.
    pub fn with_params(mut self, params: Value) -> Self {
        if let Self::Ctrl(ctrl) = &mut self {
            ctrl.params = Some(params);
        }
        self
    }

    pub fn error(id: Option<&str>, topic: Option<&str>, err: &ProtocolError) -> Self {
        Self::ctrl(id, topic, err.code(), err.to_string())
    }

    pub fn ok(id: Option<&str>, topic: Option<&str>) -> Self {
        Self::ctrl(id, topic, 200, "ok")
    }

    pub fn created(id: Option<&str>, topic: Option<&str>) -> Self {
        Self::ctrl(id, topic, 201, "created")
    }

    pub fn accepted(id: Option<&str>, topic: Option<&str>) -> Self {
        Self::ctrl(id, topic, 202, "accepted")
    }

    pub fn no_content(id: Option<&str>, topic: Option<&str>) -> Self {
        Self::ctrl(id, topic, 204, "no content")
    }

    /// Terminal notice pushed to every session when the server stops.
    pub fn shutdown() -> Self {
        Self::ctrl(None, None, 205, "shutdown")
    }

    pub fn already_subscribed(id: Option<&str>, topic: Option<&str>) -> Self {
        Self::ctrl(id, topic, 304, "already subscribed")
    }

    pub fn not_joined(id: Option<&str>, topic: Option<&str>) -> Self {
        Self::ctrl(id, topic, 304, "not joined")
    }

    pub fn pres(topic: &str, src: &str, what: PresWhat) -> MsgServerPres {
        MsgServerPres {
            topic: topic.to_owned(),
            src: src.to_owned(),
            what,
            seq: None,
            ua: None,
            ts: crate::now(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ctrl(_) => "ctrl",
            Self::Data(_) => "data",
            Self::Meta(_) => "meta",
            Self::Pres(_) => "pres",
            Self::Info(_) => "info",
        }
    }

    pub fn topic(&self) -> Option<&str> {
        match self {
            Self::Ctrl(m) => m.topic.as_deref(),
            Self::Data(m) => Some(&m.topic),
            Self::Meta(m) => Some(&m.topic),
            Self::Pres(m) => Some(&m.topic),
            Self::Info(m) => Some(&m.topic),
        }
    }

    /// Rewrite the topic name, e.g. to a session-relative alias.
    pub fn set_topic(&mut self, topic: &str) {
        match self {
            Self::Ctrl(m) => m.topic = Some(topic.to_owned()),
            Self::Data(m) => topic.clone_into(&mut m.topic),
            Self::Meta(m) => topic.clone_into(&mut m.topic),
            Self::Pres(m) => topic.clone_into(&mut m.topic),
            Self::Info(m) => topic.clone_into(&mut m.topic),
        }
    }

    pub fn ts(&self) -> DateTime<Utc> {
        match self {
            Self::Ctrl(m) => m.ts,
            Self::Data(m) => m.ts,
            Self::Meta(m) => m.ts,
            Self::Pres(m) => m.ts,
            Self::Info(m) => m.ts,
        }
    }

    /// Serialize into a shareable frame.
    pub fn encode(&self) -> Result<Arc<str>, serde_json::Error> {
        serde_json::to_string(self).map(Arc::from)
    }
}

/// Compare dotted version strings numerically (`0.9 < 0.13`).
pub fn version_at_least(ver: &str, min: &str) -> bool {
    fn parts(v: &str) -> Option<Vec<u32>> {
        v.trim().split('.').map(|p| p.parse().ok()).collect()
    }
    match (parts(ver), parts(min)) {
        (Some(v), Some(m)) => v >= m,
        _ => false,
    }
}
