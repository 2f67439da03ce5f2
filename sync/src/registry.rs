//! Reference-counted subscription registry.
//!
//! The registry is the only component that decides whether a subscribe or
//! unsubscribe frame goes out. Consumers come and go in any order; the server
//! sees exactly one subscription per identity that has at least one consumer.

use crate::connection::{Sequence, SessionStatus, StatusCell, Transport};
use crate::error::{error, not_connected, Error, ErrorKind};
use dashmap::{DashMap, DashSet};
use events::{ClientMessage, Identity, ServerPush};
use log::*;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

/// Unique identifier for one registered consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerId(Uuid);

impl ConsumerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConsumerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Returned by [`SubscriptionRegistry::register`]; needed to deregister.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerHandle {
    pub id: ConsumerId,
    pub identity: Identity,
}

/// Where a delivered value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOrigin {
    /// The cached value handed to a consumer when it registers.
    Cached,
    Push,
    /// A locally applied write that the server has not confirmed yet.
    Optimistic,
}

/// One value delivered to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub identity: Identity,
    pub payload: Value,
    pub origin: DeliveryOrigin,
}

pub type DeliverySender = UnboundedSender<Delivery>;

struct Subscription {
    /// Registration order is delivery order.
    consumers: Vec<(ConsumerId, DeliverySender)>,
    last_value: Option<Value>,
    last_sequence: Option<Sequence>,
}

impl Subscription {
    fn new() -> Self {
        Self {
            consumers: Vec::new(),
            last_value: None,
            last_sequence: None,
        }
    }
}

/// Registry of live subscriptions, keyed by identity, with a secondary index
/// from consumer to identity.
pub struct SubscriptionRegistry {
    subscriptions: DashMap<Identity, Subscription>,
    consumer_index: DashMap<ConsumerId, Identity>,
    /// Identities whose subscribe frame has not reached an open session yet.
    pending: DashSet<Identity>,
    status: StatusCell,
    transport: Arc<dyn Transport>,
}

impl SubscriptionRegistry {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let status = StatusCell::new(transport.status());
        Self {
            subscriptions: DashMap::new(),
            consumer_index: DashMap::new(),
            pending: DashSet::new(),
            status,
            transport,
        }
    }

    /// Adds `consumer` to the subscription for `identity`.
    ///
    /// The first consumer of an identity causes a subscribe frame (sent now if
    /// the session is open, otherwise on the next reconnect). A consumer
    /// joining an identity that already has a value receives it before this
    /// returns.
    pub fn register(
        &self,
        identity: Identity,
        consumer: ConsumerId,
        sender: DeliverySender,
    ) -> Result<ConsumerHandle, Error> {
        if self.consumer_index.contains_key(&consumer) {
            return Err(error(
                ErrorKind::DuplicateRegistration,
                &format!("consumer {consumer} is already registered"),
            ));
        }

        let first = {
            let mut subscription = self
                .subscriptions
                .entry(identity.clone())
                .or_insert_with(Subscription::new);

            if let Some(value) = &subscription.last_value {
                let cached = Delivery {
                    identity: identity.clone(),
                    payload: value.clone(),
                    origin: DeliveryOrigin::Cached,
                };
                if let Err(e) = sender.send(cached) {
                    warn!("Failed to deliver cached {identity} to consumer {consumer}: {e}");
                }
            }
            subscription.consumers.push((consumer, sender));
            subscription.consumers.len() == 1
        };
        self.consumer_index.insert(consumer, identity.clone());

        debug!("Registered consumer {consumer} for {identity}");

        if first {
            self.request_subscribe(&identity);
        }

        Ok(ConsumerHandle {
            id: consumer,
            identity,
        })
    }

    fn request_subscribe(&self, identity: &Identity) {
        if self.status.get() != SessionStatus::Open {
            debug!("Session not open, deferring subscribe for {identity}");
            self.pending.insert(identity.clone());
            return;
        }

        if let Err(e) = self.transport.send(&ClientMessage::subscribe(identity)) {
            warn!("Failed to subscribe to {identity}: {e}. Will retry on reconnect.");
            self.pending.insert(identity.clone());
        }
    }

    /// Removes one consumer. Unknown handles are ignored.
    ///
    /// When the last consumer of an identity leaves, the subscription and its
    /// cached value are discarded and an unsubscribe frame is sent if the
    /// server knows about the subscription.
    pub fn deregister(&self, handle: &ConsumerHandle) {
        if self.consumer_index.remove(&handle.id).is_none() {
            warn!(
                "Attempted to deregister unknown consumer {} for {}",
                handle.id, handle.identity
            );
            return;
        }

        let now_empty = match self.subscriptions.get_mut(&handle.identity) {
            Some(mut subscription) => {
                subscription.consumers.retain(|(id, _)| *id != handle.id);
                subscription.consumers.is_empty()
            }
            None => false,
        };

        if !now_empty {
            debug!("Deregistered consumer {} for {}", handle.id, handle.identity);
            return;
        }

        let removed = self
            .subscriptions
            .remove_if(&handle.identity, |_, subscription| {
                subscription.consumers.is_empty()
            })
            .is_some();
        if !removed {
            return;
        }

        let was_pending = self.pending.remove(&handle.identity).is_some();
        debug!("Last consumer left {}, discarding subscription", handle.identity);

        if was_pending || self.status.get() != SessionStatus::Open {
            return;
        }

        if let Err(e) = self
            .transport
            .send(&ClientMessage::unsubscribe(&handle.identity))
        {
            warn!("Failed to unsubscribe from {}: {e}", handle.identity);
        }
    }

    /// Delivers an inbound push to every consumer of its identity, in
    /// registration order. Returns the number of consumers it reached.
    ///
    /// Pushes for identities nobody is subscribed to, and pushes older than
    /// the value already held, are dropped.
    pub fn dispatch_incoming(&self, push: ServerPush, sequence: Sequence) -> usize {
        let identity = push.identity();

        let Some(mut subscription) = self.subscriptions.get_mut(&identity) else {
            warn!("Dropping push for {identity}: no active subscription");
            return 0;
        };

        if subscription
            .last_sequence
            .is_some_and(|last| sequence <= last)
        {
            debug!("Dropping stale push for {identity}");
            return 0;
        }

        subscription.last_sequence = Some(sequence);
        subscription.last_value = Some(push.data.clone());

        Self::fan_out(&identity, &subscription.consumers, &push.data, DeliveryOrigin::Push)
    }

    /// Applies a value locally without a server push.
    ///
    /// An object payload carrying a `value` field has that field replaced;
    /// any other payload is replaced wholesale. Returns the number of
    /// consumers reached; 0 if nobody is subscribed to `identity`.
    pub fn apply_local(&self, identity: &Identity, value: &Value) -> usize {
        let Some(mut subscription) = self.subscriptions.get_mut(identity) else {
            return 0;
        };

        let payload = match subscription.last_value.take() {
            Some(Value::Object(mut fields)) if fields.contains_key("value") => {
                fields.insert("value".to_string(), value.clone());
                Value::Object(fields)
            }
            _ => value.clone(),
        };
        subscription.last_value = Some(payload.clone());

        Self::fan_out(identity, &subscription.consumers, &payload, DeliveryOrigin::Optimistic)
    }

    fn fan_out(
        identity: &Identity,
        consumers: &[(ConsumerId, DeliverySender)],
        payload: &Value,
        origin: DeliveryOrigin,
    ) -> usize {
        let mut delivered = 0;
        for (consumer, sender) in consumers {
            let delivery = Delivery {
                identity: identity.clone(),
                payload: payload.clone(),
                origin,
            };
            match sender.send(delivery) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    "Failed to deliver {identity} to consumer {consumer}: {e}. Consumer will be cleaned up."
                ),
            }
        }
        delivered
    }

    /// Sends a frame on the current session.
    pub fn transmit(&self, message: &ClientMessage) -> Result<(), Error> {
        if self.status.get() != SessionStatus::Open {
            return Err(not_connected("websocket session is not open"));
        }
        self.transport.send(message)
    }

    pub fn on_connecting(&self) {
        self.status.set(SessionStatus::Connecting);
    }

    /// A new session is open: every live identity is subscribed again, once.
    pub fn on_reconnected(&self) {
        self.status.set(SessionStatus::Open);
        self.pending.clear();

        let identities = self.identities();
        info!("Session open, subscribing {} identities", identities.len());

        for identity in identities {
            if let Err(e) = self.transport.send(&ClientMessage::subscribe(&identity)) {
                warn!("Failed to resubscribe to {identity}: {e}");
                self.pending.insert(identity);
            }
        }
    }

    /// The session is gone. Subscriptions and cached values are kept; every
    /// live identity is subscribed again once a session opens.
    pub fn on_disconnected(&self) {
        self.status.set(SessionStatus::Closed);
        self.pending.clear();
        for entry in self.subscriptions.iter() {
            self.pending.insert(entry.key().clone());
        }
    }

    /// Unsubscribes every live identity (best effort) and forgets all state.
    pub fn shutdown(&self) {
        if self.status.get() == SessionStatus::Open {
            for identity in self.identities() {
                if self.pending.contains(&identity) {
                    continue;
                }
                if let Err(e) = self.transport.send(&ClientMessage::unsubscribe(&identity)) {
                    debug!("Skipping unsubscribe for {identity} on shutdown: {e}");
                }
            }
        }
        self.status.set(SessionStatus::Closed);
        self.subscriptions.clear();
        self.consumer_index.clear();
        self.pending.clear();
    }

    /// Number of live consumers for `identity`.
    pub fn ref_count(&self, identity: &Identity) -> usize {
        self.subscriptions
            .get(identity)
            .map(|subscription| subscription.consumers.len())
            .unwrap_or(0)
    }

    pub fn cached(&self, identity: &Identity) -> Option<Value> {
        self.subscriptions
            .get(identity)
            .and_then(|subscription| subscription.last_value.clone())
    }

    /// Every identity with at least one consumer, sorted.
    pub fn identities(&self) -> Vec<Identity> {
        let mut identities: Vec<Identity> = self
            .subscriptions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        identities.sort();
        identities
    }

    /// Identities waiting for an open session, sorted.
    pub fn pending(&self) -> Vec<Identity> {
        let mut pending: Vec<Identity> = self.pending.iter().map(|i| i.key().clone()).collect();
        pending.sort();
        pending
    }

    pub fn session_status(&self) -> SessionStatus {
        self.status.get()
    }
}
