//! Versioned descriptive data attached to topics and subscriptions.
//!
//! Each variant carries an explicit schema version `v`; new fields are added
//! behind a version bump rather than by accepting arbitrary JSON.

use serde::{Deserialize, Serialize};

use crate::topic::TopicCat;

pub const PUBLIC_SCHEMA_VERSION: u8 = 1;
pub const PRIVATE_SCHEMA_VERSION: u8 = 1;

/// Data visible to every subscriber of a topic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PublicData {
    /// Group topic card.
    Group {
        #[serde(default = "public_version")]
        v: u8,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    /// User card, stored on the user's `me` topic.
    User {
        #[serde(default = "public_version")]
        v: u8,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        photo: Option<String>,
    },
}

fn public_version() -> u8 {
    PUBLIC_SCHEMA_VERSION
}

impl PublicData {
    pub fn version(&self) -> u8 {
        match self {
            Self::Group { v, .. } | Self::User { v, .. } => *v,
        }
    }

    /// Whether this variant may be stored on a topic of `cat`.
    pub fn fits(&self, cat: TopicCat) -> bool {
        if self.version() > PUBLIC_SCHEMA_VERSION {
            return false;
        }
        matches!(
            (self, cat),
            (Self::Group { .. }, TopicCat::Group) | (Self::User { .. }, TopicCat::Me)
        )
    }
}

/// Per-subscriber data, visible only to that subscriber.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateData {
    #[serde(default = "private_version")]
    pub v: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default)]
    pub archived: bool,
}

fn private_version() -> u8 {
    PRIVATE_SCHEMA_VERSION
}

impl PrivateData {
    pub fn is_supported(&self) -> bool {
        self.v <= PRIVATE_SCHEMA_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn group_card_fits_group_only() {
        let card: PublicData = serde_json::from_value(json!({"kind": "group", "name": "Lobby"})).unwrap();
        assert_eq!(card.version(), 1);
        assert!(card.fits(TopicCat::Group));
        assert!(!card.fits(TopicCat::Me));
        assert!(!card.fits(TopicCat::P2P));
    }

    #[test]
    fn user_card_fits_me() {
        let card = PublicData::User {
            v: 1,
            name: "Alice".into(),
            photo: None,
        };
        assert!(card.fits(TopicCat::Me));
        assert_eq!(serde_json::to_value(&card).unwrap(), json!({"kind": "user", "v": 1, "name": "Alice"}));
    }

    #[test]
    fn future_versions_are_rejected() {
        let card: PublicData = serde_json::from_value(json!({"kind": "group", "v": 9, "name": "x"})).unwrap();
        assert!(!card.fits(TopicCat::Group));
        let private: PrivateData = serde_json::from_value(json!({"v": 2})).unwrap();
        assert!(!private.is_supported());
    }

    #[test]
    fn unknown_kind_fails_to_decode() {
        let res = serde_json::from_value::<PublicData>(json!({"kind": "blob", "name": "x"}));
        assert!(res.is_err());
    }
}
