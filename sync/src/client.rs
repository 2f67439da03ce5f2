use crate::error::{error, shutdown, Error, ErrorKind};
use crate::manager::Manager;
use crate::registry::{ConsumerHandle, ConsumerId, Delivery};
use events::Identity;
use log::*;
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindOptions {
    /// Subscribe as soon as the client is bound. Without it the client only
    /// reads through [`SyncClient::fetch`] until [`SyncClient::subscribe`] is called.
    pub auto: bool,
}

impl Default for BindOptions {
    fn default() -> Self {
        Self { auto: true }
    }
}

/// A value bound to one identity on the backend.
///
/// While subscribed, every push for the identity is queued on the client;
/// [`SyncClient::value`] returns the latest one and [`SyncClient::changed`]
/// waits for the next. Dropping the client unbinds it.
pub struct SyncClient {
    manager: Manager,
    identity: Identity,
    handle: Option<ConsumerHandle>,
    receiver: Option<mpsc::UnboundedReceiver<Delivery>>,
    value: Option<Value>,
    bound: bool,
}

impl SyncClient {
    pub async fn bind(
        manager: Manager,
        identity: Identity,
        options: BindOptions,
    ) -> Result<SyncClient, Error> {
        let mut client = SyncClient {
            manager,
            identity,
            handle: None,
            receiver: None,
            value: None,
            bound: true,
        };
        if options.auto {
            client.subscribe().await?;
        }
        Ok(client)
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    pub fn is_subscribed(&self) -> bool {
        self.handle.is_some()
    }

    /// Registers with the hub. A value the hub already holds is available from
    /// [`SyncClient::value`] as soon as this returns.
    pub async fn subscribe(&mut self) -> Result<(), Error> {
        self.ensure_bound()?;
        if self.handle.is_some() {
            return Ok(());
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = self
            .manager
            .register(self.identity.clone(), ConsumerId::new(), sender)
            .await?;
        self.handle = Some(handle);
        self.receiver = Some(receiver);
        self.drain();
        Ok(())
    }

    fn ensure_bound(&self) -> Result<(), Error> {
        if self.bound {
            Ok(())
        } else {
            Err(error(
                ErrorKind::NotBound,
                &format!("client for {} was unbound", self.identity),
            ))
        }
    }

    fn drain(&mut self) {
        if let Some(receiver) = self.receiver.as_mut() {
            while let Ok(delivery) = receiver.try_recv() {
                self.value = Some(delivery.payload);
            }
        }
    }

    /// Latest value delivered to this client.
    pub fn value(&mut self) -> Option<&Value> {
        self.drain();
        self.value.as_ref()
    }

    /// The `value` field of an object payload, or the payload itself.
    pub fn scalar(&mut self) -> Option<&Value> {
        self.drain();
        self.value.as_ref().map(|payload| match payload {
            Value::Object(fields) => fields.get("value").unwrap_or(payload),
            other => other,
        })
    }

    /// Waits for the next delivery and returns it.
    pub async fn changed(&mut self) -> Result<&Value, Error> {
        self.ensure_bound()?;
        let Some(receiver) = self.receiver.as_mut() else {
            return Err(error(
                ErrorKind::NotBound,
                &format!("client for {} is not subscribed", self.identity),
            ));
        };

        let delivery = receiver.recv().await.ok_or_else(shutdown)?;
        Ok(self.value.insert(delivery.payload))
    }

    /// Sends `value` to the backend without waiting for confirmation.
    ///
    /// Only a subscribed client may write.
    pub async fn write(&self, value: Value) -> Result<(), Error> {
        self.ensure_bound()?;
        if self.handle.is_none() {
            return Err(error(
                ErrorKind::NotBound,
                &format!("client for {} never subscribed", self.identity),
            ));
        }
        self.manager.write(self.identity.clone(), value).await
    }

    /// Reads the current value once.
    ///
    /// Uses the value the hub already holds when there is one. Otherwise the
    /// identity is subscribed just long enough to receive one push.
    pub async fn fetch(&mut self) -> Result<Value, Error> {
        self.ensure_bound()?;

        if let Some(value) = self.manager.cached(&self.identity) {
            self.value = Some(value.clone());
            return Ok(value);
        }

        let (sender, mut receiver) = mpsc::unbounded_channel();
        let handle = self
            .manager
            .register(self.identity.clone(), ConsumerId::new(), sender)
            .await?;

        let timeout = self.manager.fetch_timeout();
        let result = tokio::time::timeout(timeout, receiver.recv()).await;
        self.manager.deregister(handle);

        match result {
            Ok(Some(delivery)) => {
                self.value = Some(delivery.payload.clone());
                Ok(delivery.payload)
            }
            Ok(None) => Err(shutdown()),
            Err(_) => Err(error(
                ErrorKind::Timeout,
                &format!("no value for {} within {timeout:?}", self.identity),
            )),
        }
    }

    /// Deregisters from the hub. Calling it more than once is harmless.
    pub fn unbind(&mut self) {
        if !self.bound {
            return;
        }
        self.bound = false;
        self.receiver = None;
        if let Some(handle) = self.handle.take() {
            trace!("Unbinding consumer {} from {}", handle.id, handle.identity);
            self.manager.deregister(handle);
        }
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.unbind();
    }
}
