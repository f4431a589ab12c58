//! Topic keys: the routing vocabulary between broker and sessions.
//!
//! Serialized as `class:{classId}` or `user:{userId}`. Anything else fails
//! to parse.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ids::{ClassId, UserId};

const CLASS_PREFIX: &str = "class:";
const USER_PREFIX: &str = "user:";

/// A routing key identifying a class-scoped or user-scoped channel.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TopicKey {
    /// Every enrollment event for one class. Owners only.
    Class(ClassId),
    /// Decisions affecting one student. That student only.
    User(UserId),
}

impl TopicKey {
    /// Topic for a class.
    pub fn class(id: impl Into<ClassId>) -> Self {
        Self::Class(id.into())
    }

    /// Topic for a user.
    pub fn user(id: impl Into<UserId>) -> Self {
        Self::User(id.into())
    }
}

/// Error returned when a topic string is malformed.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid topic key: {0:?}")]
pub struct InvalidTopic(pub String);

impl FromStr for TopicKey {
    type Err = InvalidTopic;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(id) = s.strip_prefix(CLASS_PREFIX) {
            if !id.is_empty() {
                return Ok(Self::Class(ClassId::from(id)));
            }
        } else if let Some(id) = s.strip_prefix(USER_PREFIX) {
            if !id.is_empty() {
                return Ok(Self::User(UserId::from(id)));
            }
        }
        Err(InvalidTopic(s.to_owned()))
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Class(id) => write!(f, "{CLASS_PREFIX}{id}"),
            Self::User(id) => write!(f, "{USER_PREFIX}{id}"),
        }
    }
}

impl Serialize for TopicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TopicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
