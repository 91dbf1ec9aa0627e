//! Persistence collaborator used by topics and the session store.
//!
//! Implementations are synchronous: every call is a short, local operation
//! made from inside a single topic actor, so per-topic ordering is already
//! serialized by the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::access::{AccessMode, DefaultAccess};
use crate::errors::StoreResult;
use crate::ids::Uid;
use crate::payload::{PrivateData, PublicData};
use crate::topic::TopicCat;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TopicRecord {
    pub name: String,
    pub cat: TopicCat,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub owner: Option<Uid>,
    pub access: DefaultAccess,
    /// Id of the newest stored message.
    pub seq_id: i64,
    /// Messages with `seq <= clear_id` were hard-deleted.
    pub clear_id: i64,
    pub public: Option<PublicData>,
}

impl TopicRecord {
    pub fn new(name: impl Into<String>, cat: TopicCat, owner: Option<Uid>, access: DefaultAccess) -> Self {
        let now = crate::now();
        Self {
            name: name.into(),
            cat,
            created: now,
            updated: now,
            owner,
            access,
            seq_id: 0,
            clear_id: 0,
            public: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub topic: String,
    pub user: Uid,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub mode_want: AccessMode,
    pub mode_given: AccessMode,
    pub recv_id: i64,
    pub read_id: i64,
    /// Soft-delete watermark of this subscriber.
    pub clear_id: i64,
    pub private: Option<PrivateData>,
}

impl SubscriptionRecord {
    pub fn new(topic: impl Into<String>, user: Uid, want: AccessMode, given: AccessMode) -> Self {
        let now = crate::now();
        Self {
            topic: topic.into(),
            user,
            created: now,
            updated: now,
            mode_want: want,
            mode_given: given,
            recv_id: 0,
            read_id: 0,
            clear_id: 0,
            private: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub topic: String,
    pub seq_id: i64,
    pub from: Option<Uid>,
    pub created: DateTime<Utc>,
    pub content: Value,
}

/// Page of history: `since < seq_id < before`, oldest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageQuery {
    pub since: i64,
    pub before: Option<i64>,
    pub limit: usize,
}

pub trait Store: Send + Sync {
    /// Unique id for sessions and new group topics.
    fn generate_unique_id(&self) -> String;

    fn load_topic(&self, name: &str) -> StoreResult<Option<TopicRecord>>;
    /// Fails with `Conflict` if the topic already exists.
    fn create_topic(&self, topic: &TopicRecord) -> StoreResult<()>;
    fn update_topic(&self, topic: &TopicRecord) -> StoreResult<()>;
    /// Remove the topic with its subscriptions and messages.
    fn delete_topic(&self, name: &str) -> StoreResult<()>;

    fn topic_subscriptions(&self, topic: &str) -> StoreResult<Vec<SubscriptionRecord>>;
    fn user_subscriptions(&self, user: &Uid) -> StoreResult<Vec<SubscriptionRecord>>;
    /// Insert or replace.
    fn save_subscription(&self, sub: &SubscriptionRecord) -> StoreResult<()>;
    fn delete_subscription(&self, topic: &str, user: &Uid) -> StoreResult<()>;

    /// Store a message and advance the topic's `seq_id` to it.
    fn save_message(&self, msg: &MessageRecord) -> StoreResult<()>;
    fn messages(&self, topic: &str, query: &MessageQuery) -> StoreResult<Vec<MessageRecord>>;
    /// Hard-delete messages with `seq_id <= through`. Returns the count.
    fn delete_messages(&self, topic: &str, through: i64) -> StoreResult<usize>;
}
