//! Real-time state synchronization with the HomeCon backend.
//!
//! Many UI bindings share one persistent websocket. Each binding is a
//! [`SyncClient`] on an [`Identity`] (event name + key); the hub keeps exactly
//! one server-side subscription per identity, however many clients are bound
//! to it, and fans every push out to all of them.
//!
//! # Architecture
//!
//! - **One connection**: a background task owns the socket, answers pings,
//!   sends keepalives and reconnects with capped exponential backoff.
//! - **Reference-counted registry**: the first client on an identity sends the
//!   subscribe, the last one to leave sends the unsubscribe. The last pushed
//!   value is cached per identity and handed to clients that join later.
//! - **Single actor**: registrations, writes and inbound pushes are applied
//!   one at a time by the [`Manager`] task, so deliveries never interleave and
//!   a resubscribe burst after a reconnect completes before any later
//!   registration is handled.
//! - **Fire-and-forget writes**: a write is a command frame; the backend
//!   confirms it by pushing the new value on the normal subscription path.
//!
//! # Example
//!
//! ```rust,ignore
//! use sync::{BindOptions, Manager, Options};
//!
//! let manager = Manager::init(Options::from_config(&config));
//! let mut light = manager.bind(Identity::state(7), BindOptions::default()).await?;
//!
//! light.write(serde_json::json!(1)).await?;
//! let value = light.changed().await?;
//!
//! manager.shutdown().await;
//! ```
//!
//! # Modules
//!
//! - `connection`: websocket task, session status, backoff and the `Transport` seam
//! - `registry`: ref-counted subscriptions, value cache and fan-out
//! - `manager`: the hub actor and its handle
//! - `client`: per-binding `SyncClient`
//! - `tree`: `StateTree` arena and the `TreeProjector`
//! - `command`: write command dispatch

pub mod client;
pub mod command;
pub mod connection;
pub mod error;
pub mod manager;
pub mod registry;
pub mod tree;

pub use client::{BindOptions, SyncClient};
pub use connection::{Backoff, ConnectionOptions, SessionStatus, Transport, TransportEvent};
pub use error::{Error, ErrorKind};
pub use events::{Identity, Key, StateNode};
pub use manager::{Manager, Options};
pub use tree::{by_id, by_name, Source, StateTree, TreeProjector};
