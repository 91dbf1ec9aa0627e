//! Per-subscriber caches held by a topic actor.

use std::sync::Arc;

use parley_core::protocol::{AccessSummary, TopicSub};
use parley_core::store::SubscriptionRecord;
use parley_core::topic::{p2p_peer, ResolvedTopic, FND_ALIAS, ME_ALIAS};
use parley_core::{AccessMode, TopicCat, Uid};

use crate::session::Session;

/// Cached subscription of one user plus how many of their sessions are
/// attached right now.
#[derive(Clone, Debug)]
pub(crate) struct PerUserData {
    pub sub: SubscriptionRecord,
    pub online: usize,
}

impl PerUserData {
    pub fn new(sub: SubscriptionRecord) -> Self {
        Self { sub, online: 0 }
    }

    pub fn summary(&self) -> AccessSummary {
        AccessSummary::new(self.sub.mode_want, self.sub.mode_given)
    }

    pub fn mode(&self) -> AccessMode {
        self.sub.mode_want & self.sub.mode_given
    }

    pub fn to_sub(&self, include_private: bool) -> TopicSub {
        TopicSub {
            user: Some(self.sub.user.clone()),
            topic: None,
            updated: self.sub.updated,
            acs: Some(self.summary()),
            read: self.sub.read_id,
            recv: self.sub.recv_id,
            online: self.online > 0,
            with: None,
            private: if include_private { self.sub.private.clone() } else { None },
        }
    }
}

/// One entry of a `me` topic's contact list.
#[derive(Clone, Debug)]
pub(crate) struct Contact {
    pub sub: SubscriptionRecord,
    /// The P2P peer's own `me` topic reported it is online.
    pub online: bool,
    pub with: Option<Uid>,
}

impl Contact {
    pub fn to_sub(&self, key: &str) -> TopicSub {
        TopicSub {
            user: None,
            topic: Some(key.to_owned()),
            updated: self.sub.updated,
            acs: Some(AccessSummary::new(self.sub.mode_want, self.sub.mode_given)),
            read: self.sub.read_id,
            recv: self.sub.recv_id,
            online: self.online,
            with: self.with.clone(),
            private: self.sub.private.clone(),
        }
    }
}

/// A session attached to the topic.
pub(crate) struct Attached {
    pub sess: Arc<Session>,
    pub alias: String,
    pub uid: Option<Uid>,
    /// Access of an anonymous session, which has no subscription record.
    pub anon: Option<AccessSummary>,
}

/// The name `user` sees for the canonical topic `name`.
pub(crate) fn alias_for(name: &str, cat: TopicCat, user: Option<&Uid>) -> String {
    match cat {
        TopicCat::Me => ME_ALIAS.to_owned(),
        TopicCat::Fnd => FND_ALIAS.to_owned(),
        TopicCat::P2P => user
            .and_then(|u| p2p_peer(name, u))
            .map(|peer| peer.me_topic())
            .unwrap_or_else(|| name.to_owned()),
        TopicCat::Group | TopicCat::Sys => name.to_owned(),
    }
}

/// Session-relative name of a resolved topic.
pub fn session_alias(resolved: &ResolvedTopic, user: Option<&Uid>) -> String {
    alias_for(&resolved.name, resolved.cat, user)
}

/// Key of a subscription in its owner's contact list, or `None` for the
/// owner's own personal topics.
pub(crate) fn contact_key(topic: &str, owner: &Uid) -> Option<String> {
    match TopicCat::of(topic)? {
        TopicCat::Me | TopicCat::Fnd => None,
        cat => Some(alias_for(topic, cat, Some(owner))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(s: &str) -> Uid {
        Uid::from_raw(s)
    }

    #[test]
    fn p2p_alias_names_the_peer() {
        let name = "p2palice.bob";
        assert_eq!(alias_for(name, TopicCat::P2P, Some(&uid("alice"))), "usrbob");
        assert_eq!(alias_for(name, TopicCat::P2P, Some(&uid("bob"))), "usralice");
        assert_eq!(alias_for(name, TopicCat::P2P, None), name);
    }

    #[test]
    fn personal_aliases_are_fixed() {
        assert_eq!(alias_for("usralice", TopicCat::Me, Some(&uid("alice"))), "me");
        assert_eq!(alias_for("fndalice", TopicCat::Fnd, Some(&uid("alice"))), "fnd");
        assert_eq!(alias_for("grpX", TopicCat::Group, None), "grpX");
    }

    #[test]
    fn contact_keys_skip_personal_topics() {
        let alice = uid("alice");
        assert_eq!(contact_key("p2palice.bob", &alice).as_deref(), Some("usrbob"));
        assert_eq!(contact_key("grpX", &alice).as_deref(), Some("grpX"));
        assert_eq!(contact_key("usralice", &alice), None);
        assert_eq!(contact_key("fndalice", &alice), None);
    }

    #[test]
    fn effective_mode_intersects() {
        let sub = SubscriptionRecord::new("grpX", uid("a"), "JRW".parse().unwrap(), AccessMode::PUBLIC);
        let pud = PerUserData::new(sub);
        assert!(pud.mode().is_writer());
        assert!(!pud.mode().is_presencer());
        assert_eq!(pud.summary().given, AccessMode::PUBLIC);
    }
}
