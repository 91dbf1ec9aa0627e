//! Topic categories and name resolution.
//!
//! Canonical names carry their category as a three-letter prefix:
//! `usr<uid>` (me), `fnd<uid>`, `p2p<a>.<b>`, `grp<id>` and `sys`.
//! Clients may also use session-relative aliases: `me`, `fnd`, `new` and
//! `usr<peer>` for a P2P conversation with `peer`.

use serde::{Deserialize, Serialize};

use crate::errors::ProtocolError;
use crate::ids::Uid;

pub const ME_ALIAS: &str = "me";
pub const FND_ALIAS: &str = "fnd";
pub const NEW_ALIAS: &str = "new";
pub const SYS_TOPIC: &str = "sys";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicCat {
    P2P,
    Group,
    Me,
    Fnd,
    Sys,
}

impl TopicCat {
    /// Category of a canonical topic name.
    pub fn of(name: &str) -> Option<Self> {
        if name == SYS_TOPIC {
            return Some(Self::Sys);
        }
        let (prefix, rest) = name.split_at_checked(3)?;
        if rest.is_empty() {
            return None;
        }
        match prefix {
            "usr" => Some(Self::Me),
            "fnd" => Some(Self::Fnd),
            "p2p" => Some(Self::P2P),
            "grp" => Some(Self::Group),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::P2P => "p2p",
            Self::Group => "grp",
            Self::Me => "me",
            Self::Fnd => "fnd",
            Self::Sys => "sys",
        }
    }

    /// Single-user topics: only their owner may attach.
    pub fn is_personal(self) -> bool {
        matches!(self, Self::Me | Self::Fnd)
    }
}

/// Canonical P2P topic name; independent of argument order.
pub fn p2p_name(a: &Uid, b: &Uid) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("p2p{lo}.{hi}")
}

/// The two members encoded in a P2P topic name.
pub fn p2p_members(name: &str) -> Option<(Uid, Uid)> {
    let rest = name.strip_prefix("p2p")?;
    let (a, b) = rest.split_once('.')?;
    Some((Uid::parse(a)?, Uid::parse(b)?))
}

/// The other side of a P2P conversation.
pub fn p2p_peer(name: &str, me: &Uid) -> Option<Uid> {
    let (a, b) = p2p_members(name)?;
    if &a == me {
        Some(b)
    } else if &b == me {
        Some(a)
    } else {
        None
    }
}

/// Owner of a `usr`/`fnd` topic.
pub fn personal_owner(name: &str) -> Option<Uid> {
    let rest = name.strip_prefix("usr").or_else(|| name.strip_prefix("fnd"))?;
    Uid::parse(rest)
}

pub fn group_name(id: &str) -> String {
    format!("grp{id}")
}

/// A client-supplied topic name resolved to its canonical form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedTopic {
    /// Canonical name used by the hub.
    pub name: String,
    pub cat: TopicCat,
    /// The topic does not exist yet and is being created by this request.
    pub created: bool,
}

/// Resolve what a client typed into a canonical topic name.
///
/// `new_id` is only called for `new`, which creates a group topic.
pub fn resolve(
    requested: &str,
    user: Option<&Uid>,
    new_id: impl FnOnce() -> String,
) -> Result<ResolvedTopic, ProtocolError> {
    let resolved = |name: String, cat| ResolvedTopic {
        name,
        cat,
        created: false,
    };

    match requested {
        ME_ALIAS => {
            let uid = user.ok_or(ProtocolError::AuthRequired)?;
            return Ok(resolved(uid.me_topic(), TopicCat::Me));
        }
        FND_ALIAS => {
            let uid = user.ok_or(ProtocolError::AuthRequired)?;
            return Ok(resolved(uid.fnd_topic(), TopicCat::Fnd));
        }
        NEW_ALIAS => {
            return Ok(ResolvedTopic {
                name: group_name(&new_id()),
                cat: TopicCat::Group,
                created: true,
            });
        }
        _ => {}
    }

    match TopicCat::of(requested) {
        Some(TopicCat::Me) => {
            let uid = user.ok_or(ProtocolError::AuthRequired)?;
            let peer = personal_owner(requested).ok_or(ProtocolError::TopicNotFound)?;
            if &peer == uid {
                Ok(resolved(uid.me_topic(), TopicCat::Me))
            } else {
                Ok(resolved(p2p_name(uid, &peer), TopicCat::P2P))
            }
        }
        Some(TopicCat::P2P) => {
            let uid = user.ok_or(ProtocolError::AuthRequired)?;
            p2p_peer(requested, uid).ok_or(ProtocolError::PermissionDenied)?;
            Ok(resolved(requested.to_owned(), TopicCat::P2P))
        }
        Some(TopicCat::Fnd) => {
            let uid = user.ok_or(ProtocolError::AuthRequired)?;
            if personal_owner(requested).as_ref() != Some(uid) {
                return Err(ProtocolError::PermissionDenied);
            }
            Ok(resolved(requested.to_owned(), TopicCat::Fnd))
        }
        Some(cat @ (TopicCat::Group | TopicCat::Sys)) => Ok(resolved(requested.to_owned(), cat)),
        None => Err(ProtocolError::TopicNotFound),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn uid(s: &str) -> Uid {
        Uid::parse(s).unwrap()
    }

    fn no_id() -> String {
        panic!("id requested")
    }

    #[test]
    fn category_from_prefix() {
        assert_eq!(TopicCat::of("usrabc"), Some(TopicCat::Me));
        assert_eq!(TopicCat::of("p2pa.b"), Some(TopicCat::P2P));
        assert_eq!(TopicCat::of("grpXYZ"), Some(TopicCat::Group));
        assert_eq!(TopicCat::of("fndabc"), Some(TopicCat::Fnd));
        assert_eq!(TopicCat::of("sys"), Some(TopicCat::Sys));
        assert_eq!(TopicCat::of("grp"), None);
        assert_eq!(TopicCat::of("xx"), None);
        assert_eq!(TopicCat::of("chatroom"), None);
    }

    #[test]
    fn p2p_name_is_symmetric() {
        let a = uid("alice");
        let b = uid("bob");
        assert_eq!(p2p_name(&a, &b), "p2palice.bob");
        assert_eq!(p2p_name(&b, &a), "p2palice.bob");
        assert_eq!(p2p_peer("p2palice.bob", &b), Some(a));
        assert_eq!(p2p_peer("p2palice.bob", &uid("carol")), None);
    }

    #[test]
    fn me_requires_login() {
        assert_matches!(resolve("me", None, no_id), Err(ProtocolError::AuthRequired));
        let r = resolve("me", Some(&uid("alice")), no_id).unwrap();
        assert_eq!(r.name, "usralice");
        assert_eq!(r.cat, TopicCat::Me);
    }

    #[test]
    fn usr_peer_becomes_p2p() {
        let r = resolve("usrbob", Some(&uid("alice")), no_id).unwrap();
        assert_eq!(r.name, "p2palice.bob");
        assert_eq!(r.cat, TopicCat::P2P);
        assert!(!r.created);
    }

    #[test]
    fn own_usr_is_me() {
        let r = resolve("usralice", Some(&uid("alice")), no_id).unwrap();
        assert_eq!(r.cat, TopicCat::Me);
    }

    #[test]
    fn new_generates_group_name() {
        let r = resolve("new", None, || "abc".into()).unwrap();
        assert_eq!(r.name, "grpabc");
        assert!(r.created);
    }

    #[test]
    fn foreign_p2p_and_fnd_are_denied() {
        let carol = uid("carol");
        assert_matches!(
            resolve("p2palice.bob", Some(&carol), no_id),
            Err(ProtocolError::PermissionDenied)
        );
        assert_matches!(
            resolve("fndalice", Some(&carol), no_id),
            Err(ProtocolError::PermissionDenied)
        );
    }

    #[test]
    fn unknown_prefix_is_not_found() {
        assert_matches!(resolve("lobby", None, no_id), Err(ProtocolError::TopicNotFound));
    }
}
