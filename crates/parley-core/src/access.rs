//! Access modes: sets of permission bits rendered as letters.
//!
//! | Letter | Meaning |
//! |---|---|
//! | `J` | join (attach to the topic) |
//! | `R` | read data messages |
//! | `W` | write (publish) |
//! | `P` | receive presence |
//! | `A` | approve other subscribers |
//! | `S` | share (invite) |
//! | `D` | hard-delete messages |
//! | `O` | owner |
//!
//! `N` is the empty set.

use std::fmt;
use std::ops::{BitAnd, BitOr};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct AccessMode(u8);

const LETTERS: [(char, u8); 8] = [
    ('J', 0x01),
    ('R', 0x02),
    ('W', 0x04),
    ('P', 0x08),
    ('A', 0x10),
    ('S', 0x20),
    ('D', 0x40),
    ('O', 0x80),
];

impl AccessMode {
    pub const NONE: Self = Self(0);
    pub const JOIN: Self = Self(0x01);
    pub const READ: Self = Self(0x02);
    pub const WRITE: Self = Self(0x04);
    pub const PRES: Self = Self(0x08);
    pub const APPROVE: Self = Self(0x10);
    pub const SHARE: Self = Self(0x20);
    pub const DELETE: Self = Self(0x40);
    pub const OWNER: Self = Self(0x80);

    /// `JRWPS`: default for authenticated users of group topics.
    pub const PUBLIC: Self = Self(0x01 | 0x02 | 0x04 | 0x08 | 0x20);
    /// `JRWPA`: default for both sides of a P2P topic.
    pub const P2P: Self = Self(0x01 | 0x02 | 0x04 | 0x08 | 0x10);
    /// `JW`: write-only access to the system topic.
    pub const SYS: Self = Self(0x01 | 0x04);
    /// `JRWPASDO`
    pub const FULL: Self = Self(0xff);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn is_joiner(self) -> bool {
        self.contains(Self::JOIN)
    }

    pub fn is_reader(self) -> bool {
        self.contains(Self::READ)
    }

    pub fn is_writer(self) -> bool {
        self.contains(Self::WRITE)
    }

    pub fn is_presencer(self) -> bool {
        self.contains(Self::PRES)
    }

    pub fn is_approver(self) -> bool {
        self.contains(Self::APPROVE)
    }

    pub fn is_deleter(self) -> bool {
        self.contains(Self::DELETE)
    }

    pub fn is_owner(self) -> bool {
        self.contains(Self::OWNER)
    }

    /// Owners and approvers may change other users' granted modes.
    pub fn is_manager(self) -> bool {
        self.is_owner() || self.is_approver()
    }
}

impl BitOr for AccessMode {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitAnd for AccessMode {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        self.intersect(rhs)
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return f.write_str("N");
        }
        for (letter, bit) in LETTERS {
            if self.0 & bit != 0 {
                write!(f, "{letter}")?;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid access mode: {0:?}")]
pub struct InvalidAccessMode(pub String);

impl FromStr for AccessMode {
    type Err = InvalidAccessMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("n") {
            return Ok(Self::NONE);
        }
        let mut bits = 0u8;
        for c in trimmed.chars() {
            let upper = c.to_ascii_uppercase();
            let bit = LETTERS
                .iter()
                .find(|(letter, _)| *letter == upper)
                .map(|(_, bit)| *bit)
                .ok_or_else(|| InvalidAccessMode(s.to_owned()))?;
            bits |= bit;
        }
        Ok(Self(bits))
    }
}

impl Serialize for AccessMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AccessMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Default modes granted to new subscribers of a topic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultAccess {
    pub auth: AccessMode,
    pub anon: AccessMode,
}
