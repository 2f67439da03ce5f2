use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Event names emitted and accepted by the HomeCon backend.
pub mod event_name {
    /// A single state, keyed by its numeric id.
    pub const STATE: &str = "state";
    /// The flat list of every state, keyed by the empty key.
    pub const STATE_LIST: &str = "state_list";
    /// The immediate children of a state, keyed by the parent id (empty for the root).
    pub const STATE_CHILDREN: &str = "state_children";
    /// The bare value of a state, keyed by its numeric id.
    pub const STATE_VALUE: &str = "state_value";

    const COMMAND_SUFFIX: &str = "_value";

    /// Returns the event name a write command for `event` is sent under.
    ///
    /// `state` becomes `state_value`; names already ending in `_value` are kept.
    pub fn command_event(event: &str) -> String {
        if event.ends_with(COMMAND_SUFFIX) {
            event.to_string()
        } else {
            format!("{event}{COMMAND_SUFFIX}")
        }
    }
}

/// The key part of an [`Identity`].
///
/// The backend sends numeric ids as JSON numbers but the dashboards pass them
/// around as attribute strings, so numeric strings are normalized to `Id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    /// Singleton or global scope (root of the state tree, full state list).
    #[default]
    Empty,
    Id(i64),
    Name(String),
}

impl Key {
    pub fn is_empty(&self) -> bool {
        matches!(self, Key::Empty)
    }

    pub fn as_id(&self) -> Option<i64> {
        match self {
            Key::Id(id) => Some(*id),
            _ => None,
        }
    }
}

impl From<i64> for Key {
    fn from(id: i64) -> Self {
        Key::Id(id)
    }
}

impl From<Option<i64>> for Key {
    fn from(id: Option<i64>) -> Self {
        id.map_or(Key::Empty, Key::Id)
    }
}

impl From<&str> for Key {
    fn from(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            Key::Empty
        } else if let Ok(id) = trimmed.parse::<i64>() {
            Key::Id(id)
        } else {
            Key::Name(trimmed.to_string())
        }
    }
}

impl From<String> for Key {
    fn from(raw: String) -> Self {
        Key::from(raw.as_str())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Key::Empty => Ok(()),
            Key::Id(id) => write!(f, "{id}"),
            Key::Name(name) => write!(f, "{name}"),
        }
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Key::Empty => serializer.serialize_str(""),
            Key::Id(id) => serializer.serialize_i64(*id),
            Key::Name(name) => serializer.serialize_str(name),
        }
    }
}

struct KeyVisitor;

impl<'de> Visitor<'de> for KeyVisitor {
    type Value = Key;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an integer id, a string key or null")
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Key, E> {
        Ok(Key::Id(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Key, E> {
        i64::try_from(v)
            .map(Key::Id)
            .map_err(|_| E::custom(format!("key {v} is out of range")))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Key, E> {
        if v.fract() == 0.0 && v >= i64::MIN as f64 && v <= i64::MAX as f64 {
            Ok(Key::Id(v as i64))
        } else {
            Err(E::custom(format!("key {v} is not an integer")))
        }
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Key, E> {
        Ok(Key::from(v))
    }

    fn visit_unit<E: de::Error>(self) -> Result<Key, E> {
        Ok(Key::Empty)
    }

    fn visit_none<E: de::Error>(self) -> Result<Key, E> {
        Ok(Key::Empty)
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(KeyVisitor)
    }
}

/// Addresses one subscribable server-side value or collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    pub event: String,
    #[serde(default)]
    pub key: Key,
}

impl Identity {
    pub fn new(event: impl Into<String>, key: impl Into<Key>) -> Self {
        Self {
            event: event.into(),
            key: key.into(),
        }
    }

    /// Identity with the empty key.
    pub fn global(event: impl Into<String>) -> Self {
        Self::new(event, Key::Empty)
    }

    pub fn state(id: i64) -> Self {
        Self::new(event_name::STATE, id)
    }

    pub fn state_children(parent: impl Into<Key>) -> Self {
        Self::new(event_name::STATE_CHILDREN, parent)
    }

    pub fn state_list() -> Self {
        Self::global(event_name::STATE_LIST)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.key.is_empty() {
            write!(f, "{}", self.event)
        } else {
            write!(f, "{}:{}", self.event, self.key)
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct IdentityParseError(String);

impl fmt::Display for IdentityParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid identity `{}`, expected event[:key]", self.0)
    }
}

impl std::error::Error for IdentityParseError {}

impl FromStr for Identity {
    type Err = IdentityParseError;

    /// Parses `event` or `event:key`, e.g. `state:7` or `state_list`.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (event, key) = raw.split_once(':').unwrap_or((raw, ""));
        let event = event.trim();
        if event.is_empty() {
            return Err(IdentityParseError(raw.to_string()));
        }
        Ok(Identity::new(event, key))
    }
}
