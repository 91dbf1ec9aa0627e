use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use crate::errors::{StoreError, StoreResult};
use crate::ids::{unique_id, Uid};
use crate::store::{MessageQuery, MessageRecord, Store, SubscriptionRecord, TopicRecord};

#[derive(Default)]
struct Tables {
    topics: HashMap<String, TopicRecord>,
    subs: BTreeMap<(String, Uid), SubscriptionRecord>,
    messages: HashMap<String, BTreeMap<i64, MessageRecord>>,
}

/// Process-local [`Store`]; nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn generate_unique_id(&self) -> String {
        unique_id()
    }

    fn load_topic(&self, name: &str) -> StoreResult<Option<TopicRecord>> {
        Ok(self.tables.lock().topics.get(name).cloned())
    }

    fn create_topic(&self, topic: &TopicRecord) -> StoreResult<()> {
        let mut tables = self.tables.lock();
        if tables.topics.contains_key(&topic.name) {
            return Err(StoreError::Conflict(topic.name.clone()));
        }
        let _ = tables.topics.insert(topic.name.clone(), topic.clone());
        Ok(())
    }

    fn update_topic(&self, topic: &TopicRecord) -> StoreResult<()> {
        let mut tables = self.tables.lock();
        let slot = tables
            .topics
            .get_mut(&topic.name)
            .ok_or_else(|| StoreError::NotFound(topic.name.clone()))?;
        *slot = topic.clone();
        Ok(())
    }

    fn delete_topic(&self, name: &str) -> StoreResult<()> {
        let mut tables = self.tables.lock();
        let _ = tables.topics.remove(name);
        let _ = tables.messages.remove(name);
        tables.subs.retain(|(topic, _), _| topic != name);
        Ok(())
    }

    fn topic_subscriptions(&self, topic: &str) -> StoreResult<Vec<SubscriptionRecord>> {
        let tables = self.tables.lock();
        Ok(tables
            .subs
            .iter()
            .filter(|((t, _), _)| t == topic)
            .map(|(_, sub)| sub.clone())
            .collect())
    }

    fn user_subscriptions(&self, user: &Uid) -> StoreResult<Vec<SubscriptionRecord>> {
        let tables = self.tables.lock();
        Ok(tables
            .subs
            .values()
            .filter(|sub| &sub.user == user)
            .cloned()
            .collect())
    }

    fn save_subscription(&self, sub: &SubscriptionRecord) -> StoreResult<()> {
        let _ = self
            .tables
            .lock()
            .subs
            .insert((sub.topic.clone(), sub.user.clone()), sub.clone());
        Ok(())
    }

    fn delete_subscription(&self, topic: &str, user: &Uid) -> StoreResult<()> {
        let _ = self.tables.lock().subs.remove(&(topic.to_owned(), user.clone()));
        Ok(())
    }

    fn save_message(&self, msg: &MessageRecord) -> StoreResult<()> {
        let mut tables = self.tables.lock();
        let topic = tables
            .topics
            .get_mut(&msg.topic)
            .ok_or_else(|| StoreError::NotFound(msg.topic.clone()))?;
        topic.seq_id = topic.seq_id.max(msg.seq_id);
        topic.updated = msg.created;
        let _ = tables
            .messages
            .entry(msg.topic.clone())
            .or_default()
            .insert(msg.seq_id, msg.clone());
        Ok(())
    }

    fn messages(&self, topic: &str, query: &MessageQuery) -> StoreResult<Vec<MessageRecord>> {
        let tables = self.tables.lock();
        let Some(log) = tables.messages.get(topic) else {
            return Ok(Vec::new());
        };
        let upper = query.before.unwrap_or(i64::MAX);
        if query.since.saturating_add(1) >= upper {
            return Ok(Vec::new());
        }
        Ok(log
            .range(query.since.saturating_add(1)..upper)
            .take(query.limit)
            .map(|(_, m)| m.clone())
            .collect())
    }

    fn delete_messages(&self, topic: &str, through: i64) -> StoreResult<usize> {
        let mut tables = self.tables.lock();
        let Some(log) = tables.messages.get_mut(topic) else {
            return Ok(0);
        };
        let keep = log.split_off(&through.saturating_add(1));
        let removed = log.len();
        *log = keep;
        Ok(removed)
    }
}
