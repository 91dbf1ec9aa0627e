use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Longest user id accepted from a client.
pub const MAX_UID_LEN: usize = 32;

macro_rules! branded_id {
    ($name:ident) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(SessionId);
branded_id!(Uid);

impl Uid {
    /// Validate a client-supplied user id.
    ///
    /// Accepts 1..=32 characters from the URL-safe base64 alphabet, which is
    /// also what [`unique_id`] produces. The `.` separator used in P2P topic
    /// names can therefore never appear inside a uid.
    pub fn parse(s: &str) -> Option<Self> {
        let valid = !s.is_empty()
            && s.len() <= MAX_UID_LEN
            && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        valid.then(|| Self(s.to_owned()))
    }

    /// Name of this user's `me` topic.
    pub fn me_topic(&self) -> String {
        format!("usr{}", self.0)
    }

    /// Name of this user's `fnd` topic.
    pub fn fnd_topic(&self) -> String {
        format!("fnd{}", self.0)
    }
}

/// Time-ordered unique id rendered as 22 URL-safe characters.
pub fn unique_id() -> String {
    URL_SAFE_NO_PAD.encode(Uuid::now_v7().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn unique_ids_differ() {
        assert_ne!(unique_id(), unique_id());
    }

    #[test]
    fn unique_id_is_a_valid_uid() {
        let id = unique_id();
        assert_eq!(id.len(), 22);
        assert!(Uid::parse(&id).is_some(), "got: {id}");
    }

    #[test]
    fn uid_rejects_separator_and_empty() {
        assert!(Uid::parse("").is_none());
        assert!(Uid::parse("a.b").is_none());
        assert!(Uid::parse("has space").is_none());
        assert!(Uid::parse(&"x".repeat(33)).is_none());
        assert!(Uid::parse("alice_01-b").is_some());
    }

    #[test]
    fn uid_topic_names() {
        let uid = Uid::from_raw("alice");
        assert_eq!(uid.me_topic(), "usralice");
        assert_eq!(uid.fnd_topic(), "fndalice");
    }

    #[test]
    fn borrow_allows_str_lookup() {
        let mut map = HashMap::new();
        let _ = map.insert(SessionId::from_raw("s1"), 1);
        assert_eq!(map.get("s1"), Some(&1));
    }

    #[test]
    fn serde_is_transparent() {
        let id = SessionId::from_raw("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
    }
}
