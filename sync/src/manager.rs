use crate::client::{BindOptions, SyncClient};
use crate::command::CommandDispatcher;
use crate::connection::{
    Backoff, Connection, ConnectionOptions, SessionStatus, Transport, TransportEvent,
};
use crate::error::{shutdown, Error};
use crate::registry::{ConsumerHandle, ConsumerId, DeliverySender, SubscriptionRegistry};
use crate::tree::{Comparator, Source, TreeProjector};
use events::Identity;
use log::*;
use serde_json::Value;
use service::config::Config;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Everything the hub needs to run, usually derived from [`Config`].
#[derive(Debug, Clone)]
pub struct Options {
    pub connection: ConnectionOptions,
    pub fetch_timeout: Duration,
    pub optimistic_writes: bool,
}

impl Options {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connection: ConnectionOptions {
                url: config.backend_url().to_string(),
                backoff: Backoff::new(config.reconnect_base_delay(), config.reconnect_max_delay()),
                keepalive_interval: config.keepalive_interval(),
                pong_timeout: config.pong_timeout(),
                connect_timeout: config.connect_timeout(),
                max_frame_bytes: config.max_frame_bytes,
            },
            fetch_timeout: config.fetch_timeout(),
            optimistic_writes: config.optimistic_writes,
        }
    }
}

enum Request {
    Register {
        identity: Identity,
        consumer: ConsumerId,
        sender: DeliverySender,
        reply: oneshot::Sender<Result<ConsumerHandle, Error>>,
    },
    Deregister {
        handle: ConsumerHandle,
    },
    Write {
        identity: Identity,
        value: Value,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct Inner {
    requests: mpsc::UnboundedSender<Request>,
    registry: Arc<SubscriptionRegistry>,
    fetch_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to the sync hub: one connection, one registry, one actor task that
/// applies every registration, write and inbound push in order.
///
/// Cloning is cheap; every clone talks to the same hub.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

impl Manager {
    /// Connects to the backend and starts the hub. Must be called from within
    /// a tokio runtime.
    pub fn init(options: Options) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (connection, connection_task) = Connection::spawn(options.connection.clone(), events_tx);

        info!("Starting sync hub for {}", options.connection.url);
        let manager = Self::with_transport(Arc::new(connection), events_rx, &options);
        manager.track(connection_task);
        manager
    }

    /// Starts the hub on top of an existing transport whose events arrive on
    /// `events`.
    pub fn with_transport(
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        options: &Options,
    ) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new(Arc::clone(&transport)));
        let dispatcher = CommandDispatcher::new(options.optimistic_writes);
        let (requests, requests_rx) = mpsc::unbounded_channel();

        let actor = tokio::spawn(run(
            Arc::clone(&registry),
            transport,
            dispatcher,
            requests_rx,
            events,
        ));

        Self {
            inner: Arc::new(Inner {
                requests,
                registry,
                fetch_timeout: options.fetch_timeout,
                tasks: Mutex::new(vec![actor]),
            }),
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            tasks.push(task);
        }
    }

    fn request(&self, request: Request) -> Result<(), Error> {
        self.inner.requests.send(request).map_err(|_| shutdown())
    }

    pub async fn register(
        &self,
        identity: Identity,
        consumer: ConsumerId,
        sender: DeliverySender,
    ) -> Result<ConsumerHandle, Error> {
        let (reply, response) = oneshot::channel();
        self.request(Request::Register {
            identity,
            consumer,
            sender,
            reply,
        })?;
        response.await.map_err(|_| shutdown())?
    }

    /// Queues a deregistration. Does not wait, so it can run from `Drop`.
    pub fn deregister(&self, handle: ConsumerHandle) {
        if self.request(Request::Deregister { handle }).is_err() {
            debug!("Sync hub already shut down, nothing to deregister");
        }
    }

    /// Sends a write command for `identity`. Returns once the frame is queued
    /// on the open session; the new value arrives through the push path.
    pub async fn write(&self, identity: Identity, value: Value) -> Result<(), Error> {
        let (reply, response) = oneshot::channel();
        self.request(Request::Write {
            identity,
            value,
            reply,
        })?;
        response.await.map_err(|_| shutdown())?
    }

    /// Resolves once every request and transport event queued before this
    /// call has been applied.
    pub async fn flush(&self) -> Result<(), Error> {
        let (reply, response) = oneshot::channel();
        self.request(Request::Flush { reply })?;
        response.await.map_err(|_| shutdown())
    }

    pub async fn bind(&self, identity: Identity, options: BindOptions) -> Result<SyncClient, Error> {
        SyncClient::bind(self.clone(), identity, options).await
    }

    pub async fn project(
        &self,
        source: Source,
        comparator: Comparator,
    ) -> Result<TreeProjector, Error> {
        TreeProjector::mount(self.clone(), source, comparator).await
    }

    pub fn ref_count(&self, identity: &Identity) -> usize {
        self.inner.registry.ref_count(identity)
    }

    pub fn cached(&self, identity: &Identity) -> Option<Value> {
        self.inner.registry.cached(identity)
    }

    pub fn identities(&self) -> Vec<Identity> {
        self.inner.registry.identities()
    }

    pub fn session_status(&self) -> SessionStatus {
        self.inner.registry.session_status()
    }

    pub fn fetch_timeout(&self) -> Duration {
        self.inner.fetch_timeout
    }

    /// Unsubscribes everything, closes the connection and waits for the hub
    /// tasks to finish. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        let (reply, response) = oneshot::channel();
        if self.request(Request::Shutdown { reply }).is_ok() {
            let _ = response.await;
        }

        let tasks = match self.inner.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Sync hub task ended abnormally: {e}");
            }
        }
        info!("Sync hub shut down");
    }
}

async fn run(
    registry: Arc<SubscriptionRegistry>,
    transport: Arc<dyn Transport>,
    dispatcher: CommandDispatcher,
    mut requests: mpsc::UnboundedReceiver<Request>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    let mut events_open = true;

    loop {
        tokio::select! {
            biased;

            event = events.recv(), if events_open => match event {
                Some(event) => handle_event(&registry, event),
                None => {
                    debug!("Transport event stream ended");
                    events_open = false;
                }
            },

            request = requests.recv() => match request {
                Some(Request::Register { identity, consumer, sender, reply }) => {
                    let _ = reply.send(registry.register(identity, consumer, sender));
                }
                Some(Request::Deregister { handle }) => registry.deregister(&handle),
                Some(Request::Write { identity, value, reply }) => {
                    let _ = reply.send(dispatcher.dispatch(&registry, &identity, value));
                }
                Some(Request::Flush { reply }) => {
                    let _ = reply.send(());
                }
                Some(Request::Shutdown { reply }) => {
                    registry.shutdown();
                    transport.close();
                    let _ = reply.send(());
                    return;
                }
                None => {
                    registry.shutdown();
                    transport.close();
                    return;
                }
            },
        }
    }
}

fn handle_event(registry: &SubscriptionRegistry, event: TransportEvent) {
    match event {
        TransportEvent::Connecting { attempt } => {
            trace!("Connecting (attempt {attempt})");
            registry.on_connecting();
        }
        TransportEvent::Opened { session } => {
            if session > 1 {
                info!("Reconnected (session {session})");
            }
            registry.on_reconnected();
        }
        TransportEvent::Closed { reason } => {
            debug!("Session closed: {reason}");
            registry.on_disconnected();
        }
        TransportEvent::Push { push, sequence } => {
            let reached = registry.dispatch_incoming(push, sequence);
            trace!("Push delivered to {reached} consumer(s)");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::connection::Sequence;
    use crate::error::ErrorKind;
    use crate::registry::tests::RecordingTransport;
    use crate::registry::DeliveryOrigin;
    use events::{Action, ServerPush};
    use serde_json::json;

    /// A hub wired to a recording transport, with a handle to inject
    /// transport events.
    pub(crate) struct Harness {
        pub(crate) manager: Manager,
        pub(crate) transport: Arc<RecordingTransport>,
        events: mpsc::UnboundedSender<TransportEvent>,
        session: u64,
        frame: u64,
    }

    impl Harness {
        pub(crate) fn new(status: SessionStatus) -> Self {
            Self::with_options(status, false)
        }

        pub(crate) fn with_options(status: SessionStatus, optimistic_writes: bool) -> Self {
            let transport = RecordingTransport::new(status);
            let (events, events_rx) = mpsc::unbounded_channel();
            let options = Options {
                connection: ConnectionOptions {
                    url: "ws://test".to_string(),
                    backoff: Backoff::new(Duration::from_millis(1), Duration::from_millis(1)),
                    keepalive_interval: None,
                    pong_timeout: Duration::from_secs(1),
                    connect_timeout: Duration::from_secs(1),
                    max_frame_bytes: 1024,
                },
                fetch_timeout: Duration::from_millis(200),
                optimistic_writes,
            };
            let manager = Manager::with_transport(transport.clone(), events_rx, &options);
            let mut harness = Self {
                manager,
                transport,
                events,
                session: 0,
                frame: 0,
            };
            if status == SessionStatus::Open {
                harness.open();
            }
            harness
        }

        pub(crate) fn open(&mut self) {
            self.session += 1;
            self.frame = 0;
            self.transport.set_status(SessionStatus::Open);
            let _ = self.events.send(TransportEvent::Opened {
                session: self.session,
            });
        }

        pub(crate) fn drop_connection(&self) {
            self.transport.set_status(SessionStatus::Closed);
            let _ = self.events.send(TransportEvent::Closed {
                reason: "test".to_string(),
            });
        }

        pub(crate) fn push(&mut self, identity: Identity, data: Value) {
            self.frame += 1;
            let _ = self.events.send(TransportEvent::Push {
                push: ServerPush::new(identity, data),
                sequence: Sequence {
                    session: self.session,
                    frame: self.frame,
                },
            });
        }

        /// Waits until the hub has handled everything sent so far.
        pub(crate) async fn settle(&self) {
            self.manager.flush().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_register_and_deregister_through_hub() {
        let harness = Harness::new(SessionStatus::Open);
        let identity = Identity::state(7);
        let (tx, _rx) = mpsc::unbounded_channel();

        let handle = harness
            .manager
            .register(identity.clone(), ConsumerId::new(), tx)
            .await
            .unwrap();
        assert_eq!(harness.manager.ref_count(&identity), 1);
        assert_eq!(harness.transport.count(Action::Subscribe, &identity), 1);

        harness.manager.deregister(handle);
        harness.settle().await;
        assert_eq!(harness.manager.ref_count(&identity), 0);
        assert_eq!(harness.transport.count(Action::Unsubscribe, &identity), 1);
    }

    #[tokio::test]
    async fn test_push_is_delivered_after_register() {
        let mut harness = Harness::new(SessionStatus::Open);
        let identity = Identity::state(7);
        let (tx, mut rx) = mpsc::unbounded_channel();
        harness
            .manager
            .register(identity.clone(), ConsumerId::new(), tx)
            .await
            .unwrap();

        harness.push(identity.clone(), json!({"value": 1}));

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.payload, json!({"value": 1}));
        assert_eq!(harness.manager.cached(&identity), Some(json!({"value": 1})));
    }

    #[tokio::test]
    async fn test_consumer_added_between_pushes_sees_only_later_push() {
        let mut harness = Harness::new(SessionStatus::Open);
        let identity = Identity::state(7);
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        harness
            .manager
            .register(identity.clone(), ConsumerId::new(), tx_a)
            .await
            .unwrap();

        harness.push(identity.clone(), json!(1));
        assert_eq!(rx_a.recv().await.unwrap().payload, json!(1));

        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        harness
            .manager
            .register(identity.clone(), ConsumerId::new(), tx_b)
            .await
            .unwrap();
        harness.push(identity.clone(), json!(2));
        harness.settle().await;

        let mut seen = Vec::new();
        while let Ok(delivery) = rx_b.try_recv() {
            seen.push((delivery.origin, delivery.payload));
        }
        assert_eq!(
            seen,
            vec![
                (DeliveryOrigin::Cached, json!(1)),
                (DeliveryOrigin::Push, json!(2)),
            ]
        );
        assert_eq!(rx_a.recv().await.unwrap().payload, json!(2));
    }

    #[tokio::test]
    async fn test_reconnect_through_hub_resubscribes() {
        let mut harness = Harness::new(SessionStatus::Open);
        let (tx, _rx) = mpsc::unbounded_channel();
        harness
            .manager
            .register(Identity::state_list(), ConsumerId::new(), tx)
            .await
            .unwrap();
        harness.transport.take();

        harness.drop_connection();
        harness.settle().await;
        assert_eq!(harness.manager.session_status(), SessionStatus::Closed);

        harness.open();
        harness.settle().await;
        assert_eq!(
            harness.transport.count(Action::Subscribe, &Identity::state_list()),
            1
        );
        assert_eq!(harness.manager.session_status(), SessionStatus::Open);
    }

    #[tokio::test]
    async fn test_socket_reconnect_resubscribes_shared_identity_once() {
        use crate::connection::tests::{accept, listen, local_options, next_text};

        let (listener, url) = listen().await;
        let manager = Manager::init(Options {
            connection: local_options(url),
            fetch_timeout: Duration::from_millis(200),
            optimistic_writes: false,
        });
        let identity = Identity::state(7);
        let _a = manager
            .bind(identity.clone(), BindOptions::default())
            .await
            .unwrap();
        let _b = manager
            .bind(identity.clone(), BindOptions::default())
            .await
            .unwrap();
        let subscribe = events::ClientMessage::subscribe(&identity).to_json().unwrap();
        let wait = Duration::from_secs(5);
        let quiet = Duration::from_millis(200);

        let mut first = accept(&listener).await;
        assert_eq!(next_text(&mut first, wait).await, Some(subscribe.clone()));
        assert_eq!(next_text(&mut first, quiet).await, None);
        drop(first);

        let mut second = accept(&listener).await;
        assert_eq!(next_text(&mut second, wait).await, Some(subscribe));
        assert_eq!(next_text(&mut second, quiet).await, None);
        assert_eq!(manager.ref_count(&identity), 2);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_write_while_disconnected_is_not_connected() {
        let harness = Harness::new(SessionStatus::Closed);

        let err = harness
            .manager
            .write(Identity::state(7), json!(5))
            .await
            .unwrap_err();

        assert!(err.is_not_connected());
    }

    #[tokio::test]
    async fn test_requests_after_shutdown_fail() {
        let harness = Harness::new(SessionStatus::Open);
        harness.manager.shutdown().await;

        let (tx, _rx) = mpsc::unbounded_channel();
        let err = harness
            .manager
            .register(Identity::state(1), ConsumerId::new(), tx)
            .await
            .unwrap_err();
        assert_eq!(err.error_kind, ErrorKind::Shutdown);

        // Second shutdown is a no-op.
        harness.manager.shutdown().await;
    }

    #[test]
    fn test_options_from_config() {
        use clap::Parser;

        let config = Config::parse_from([
            "homecon-sync",
            "--backend-url",
            "ws://10.0.0.2:9099",
            "--reconnect-base-delay-ms",
            "100",
            "--optimistic-writes",
        ]);
        let options = Options::from_config(&config);

        assert_eq!(options.connection.url, "ws://10.0.0.2:9099");
        assert_eq!(options.connection.backoff.delay(0), Duration::from_millis(100));
        assert_eq!(options.fetch_timeout, Duration::from_secs(5));
        assert!(options.optimistic_writes);
    }
}
