use crate::key::{event_name, Identity, Key};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Whether a subscription request adds or removes interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub action: Action,
    pub event: String,
    pub key: Key,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandData {
    pub id: Key,
    pub value: Value,
}

/// A write request, e.g. `{"event": "state_value", "data": {"id": 7, "value": 1}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub event: String,
    pub data: CommandData,
}

/// Frames the client writes on the persistent connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientMessage {
    Subscription(SubscriptionRequest),
    Command(Command),
}

impl ClientMessage {
    pub fn subscribe(identity: &Identity) -> Self {
        Self::subscription(Action::Subscribe, identity)
    }

    pub fn unsubscribe(identity: &Identity) -> Self {
        Self::subscription(Action::Unsubscribe, identity)
    }

    /// Builds the write command for the state addressed by `identity`.
    pub fn command(identity: &Identity, value: Value) -> Self {
        ClientMessage::Command(Command {
            event: event_name::command_event(&identity.event),
            data: CommandData {
                id: identity.key.clone(),
                value,
            },
        })
    }

    fn subscription(action: Action, identity: &Identity) -> Self {
        ClientMessage::Subscription(SubscriptionRequest {
            action,
            event: identity.event.clone(),
            key: identity.key.clone(),
        })
    }

    /// Short label used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Subscription(SubscriptionRequest {
                action: Action::Subscribe,
                ..
            }) => "subscribe",
            ClientMessage::Subscription(SubscriptionRequest {
                action: Action::Unsubscribe,
                ..
            }) => "unsubscribe",
            ClientMessage::Command(_) => "command",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Deserialize)]
struct RawPush {
    event: Option<String>,
    #[serde(default)]
    key: Option<Key>,
    #[serde(default)]
    data: Value,
}

/// A message pushed by the server for one identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerPush {
    pub event: String,
    pub key: Key,
    pub data: Value,
}

impl ServerPush {
    pub fn new(identity: Identity, data: Value) -> Self {
        Self {
            event: identity.event,
            key: identity.key,
            data,
        }
    }

    pub fn identity(&self) -> Identity {
        Identity::new(self.event.clone(), self.key.clone())
    }

    /// Parses one text frame.
    ///
    /// Returns `Ok(None)` for frames without an `event` field. Frames from the
    /// HomeCon backend that carry no top-level `key` but a `{id, value}` data
    /// object are normalized to key `data.id` and payload `data.value`.
    pub fn parse(text: &str) -> Result<Option<ServerPush>, serde_json::Error> {
        let raw: RawPush = serde_json::from_str(text)?;
        let Some(event) = raw.event else {
            return Ok(None);
        };

        if let Some(key) = raw.key {
            return Ok(Some(ServerPush {
                event,
                key,
                data: raw.data,
            }));
        }

        match raw.data {
            Value::Object(mut fields) if fields.contains_key("id") && fields.contains_key("value") => {
                let key: Key = fields
                    .remove("id")
                    .map(serde_json::from_value)
                    .transpose()?
                    .unwrap_or_default();
                let data = fields.remove("value").unwrap_or(Value::Null);
                Ok(Some(ServerPush { event, key, data }))
            }
            data => Ok(Some(ServerPush {
                event,
                key: Key::Empty,
                data,
            })),
        }
    }
}
