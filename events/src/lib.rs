//! Wire protocol shared by the HomeCon state-sync crates.
//!
//! This crate defines the typed frames exchanged over the single persistent
//! connection to the HomeCon backend, so that no other crate builds JSON by
//! hand.
//!
//! # Frames
//!
//! - **Subscribe / Unsubscribe** (client → server):
//!   `{"action": "subscribe", "event": <name>, "key": <key|"">}`
//! - **Push** (server → client): `{"event": <name>, "key": <key|"">, "data": <payload>}`
//! - **Command** (client → server): `{"event": "<name>_value", "data": {"id": <id>, "value": <v>}}`
//!
//! An [`Identity`] (event name + [`Key`]) addresses one subscribable value or
//! collection. The empty key addresses singleton scopes such as the full state
//! list or the root of the state tree.
//!
//! This crate has no dependencies on internal crates. Payloads are carried as
//! `serde_json::Value`.

pub mod key;
pub mod message;
pub mod state;

pub use key::{event_name, Identity, IdentityParseError, Key};
pub use message::{Action, ClientMessage, Command, CommandData, ServerPush, SubscriptionRequest};
pub use state::StateNode;
