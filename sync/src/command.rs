use crate::error::Error;
use crate::registry::SubscriptionRegistry;
use events::{event_name, ClientMessage, Identity};
use log::*;
use serde_json::Value;

/// Sends write commands for bound identities.
///
/// A command is fire-and-forget: the server confirms it, if at all, by pushing
/// the new value on the ordinary subscription path. With `optimistic` set the
/// value is also applied to the local cache right away, both for the identity
/// written and for its `_value` counterpart.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandDispatcher {
    optimistic: bool,
}

impl CommandDispatcher {
    pub fn new(optimistic: bool) -> Self {
        Self { optimistic }
    }

    pub fn dispatch(
        &self,
        registry: &SubscriptionRegistry,
        identity: &Identity,
        value: Value,
    ) -> Result<(), Error> {
        let message = ClientMessage::command(identity, value.clone());
        registry.transmit(&message)?;
        debug!("Sent {} command for {identity}", message.kind());

        if self.optimistic {
            let counterpart = Identity::new(
                event_name::command_event(&identity.event),
                identity.key.clone(),
            );
            let mut reached = registry.apply_local(identity, &value);
            if counterpart != *identity {
                reached += registry.apply_local(&counterpart, &value);
            }
            trace!("Applied {identity} locally to {reached} consumer(s)");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::SessionStatus;
    use crate::registry::tests::RecordingTransport;
    use crate::registry::{ConsumerId, DeliveryOrigin};
    use events::{Command, CommandData, Key};
    use serde_json::json;
    use tokio::sync::mpsc::unbounded_channel;

    #[test]
    fn test_dispatch_sends_command_frame() {
        let transport = RecordingTransport::new(SessionStatus::Open);
        let registry = SubscriptionRegistry::new(transport.clone());

        CommandDispatcher::new(false)
            .dispatch(&registry, &Identity::state(7), json!(1))
            .unwrap();

        assert_eq!(
            transport.take(),
            vec![ClientMessage::Command(Command {
                event: "state_value".to_string(),
                data: CommandData {
                    id: Key::Id(7),
                    value: json!(1),
                },
            })]
        );
    }

    #[test]
    fn test_dispatch_while_disconnected_fails_without_local_change() {
        let transport = RecordingTransport::new(SessionStatus::Closed);
        let registry = SubscriptionRegistry::new(transport.clone());
        let (tx, mut rx) = unbounded_channel();
        registry
            .register(Identity::state(7), ConsumerId::new(), tx)
            .unwrap();

        let err = CommandDispatcher::new(true)
            .dispatch(&registry, &Identity::state(7), json!(1))
            .unwrap_err();

        assert!(err.is_not_connected());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_optimistic_dispatch_updates_both_identities() {
        let transport = RecordingTransport::new(SessionStatus::Open);
        let registry = SubscriptionRegistry::new(transport.clone());
        let (state_tx, mut state_rx) = unbounded_channel();
        let (value_tx, mut value_rx) = unbounded_channel();
        registry
            .register(Identity::state(7), ConsumerId::new(), state_tx)
            .unwrap();
        registry
            .register(Identity::new("state_value", 7_i64), ConsumerId::new(), value_tx)
            .unwrap();

        CommandDispatcher::new(true)
            .dispatch(&registry, &Identity::state(7), json!(1))
            .unwrap();

        let state = state_rx.try_recv().unwrap();
        assert_eq!(state.origin, DeliveryOrigin::Optimistic);
        assert_eq!(state.payload, json!(1));
        assert_eq!(value_rx.try_recv().unwrap().payload, json!(1));
    }

    #[test]
    fn test_non_optimistic_dispatch_waits_for_push() {
        let transport = RecordingTransport::new(SessionStatus::Open);
        let registry = SubscriptionRegistry::new(transport.clone());
        let (tx, mut rx) = unbounded_channel();
        registry
            .register(Identity::state(7), ConsumerId::new(), tx)
            .unwrap();

        CommandDispatcher::default()
            .dispatch(&registry, &Identity::state(7), json!(1))
            .unwrap();

        assert!(rx.try_recv().is_err());
        assert_eq!(registry.cached(&Identity::state(7)), None);
    }
}
