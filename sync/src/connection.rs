//! The persistent websocket connection to the HomeCon backend.
//!
//! One background task owns the socket. It is the only writer on it, it is the
//! only place reconnection happens, and it reports everything it observes as
//! [`TransportEvent`]s on a single channel consumed by the hub.

use crate::error::{error, not_connected, Error, ErrorKind, TransportErrorKind};
use events::{ClientMessage, ServerPush};
use futures_util::{SinkExt, StreamExt};
use log::*;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Stand-in deadline for timers that are currently disarmed.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365);

/// Lifecycle of a connection session: `connecting → open → closed → connecting → …`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Open,
    Closed,
}

impl SessionStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SessionStatus::Open,
            2 => SessionStatus::Closed,
            _ => SessionStatus::Connecting,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            SessionStatus::Connecting => 0,
            SessionStatus::Open => 1,
            SessionStatus::Closed => 2,
        }
    }
}

/// A `SessionStatus` shared between threads.
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn new(status: SessionStatus) -> Self {
        Self(AtomicU8::new(status.as_u8()))
    }

    pub fn get(&self) -> SessionStatus {
        SessionStatus::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Stores `status` and returns the previous one.
    pub fn set(&self, status: SessionStatus) -> SessionStatus {
        SessionStatus::from_u8(self.0.swap(status.as_u8(), Ordering::SeqCst))
    }
}

/// Position of an inbound push: the session it arrived on and its index in
/// that session. Later pushes always compare greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sequence {
    pub session: u64,
    pub frame: u64,
}

/// What the transport reports to the hub.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A connection attempt is starting. `attempt` counts the retries since
    /// the last open session, so only the very first attempt is 0.
    Connecting { attempt: u32 },
    /// A session is open. Every open after the first one is a reconnect.
    Opened { session: u64 },
    /// An open session was lost (or closed on shutdown).
    Closed { reason: String },
    Push { push: ServerPush, sequence: Sequence },
}

/// Outbound side of a persistent connection, as seen by the registry.
pub trait Transport: Send + Sync {
    fn status(&self) -> SessionStatus;

    /// Queues one frame on the current session.
    ///
    /// Fails with `NotConnected` when the session is not open; frames are
    /// never buffered across sessions.
    fn send(&self, message: &ClientMessage) -> Result<(), Error>;

    /// Asks the transport to close for good. The default does nothing.
    fn close(&self) {}
}

/// Exponential backoff capped at a ceiling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base: Duration,
    ceiling: Duration,
}

impl Backoff {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self {
            base,
            ceiling: ceiling.max(base),
        }
    }

    /// Delay before reconnection attempt `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.ceiling)
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub url: String,
    pub backoff: Backoff,
    /// `None` disables keepalive pings.
    pub keepalive_interval: Option<Duration>,
    pub pong_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_frame_bytes: usize,
}

enum Outbound {
    Frame(String),
    Close,
}

enum SessionEnd {
    Dropped(String),
    Shutdown,
}

/// Handle to the background connection task.
pub struct Connection {
    outbound: mpsc::UnboundedSender<Outbound>,
    status: Arc<StatusCell>,
}

impl Connection {
    /// Starts the connection task. Events are reported on `events` until the
    /// connection is closed or the receiving end is dropped.
    pub fn spawn(
        options: ConnectionOptions,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> (Connection, JoinHandle<()>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let status = Arc::new(StatusCell::new(SessionStatus::Connecting));

        let task = tokio::spawn(connection_task(
            options,
            outbound_rx,
            events,
            Arc::clone(&status),
        ));

        (Connection { outbound, status }, task)
    }
}

impl Transport for Connection {
    fn status(&self) -> SessionStatus {
        self.status.get()
    }

    fn send(&self, message: &ClientMessage) -> Result<(), Error> {
        if self.status.get() != SessionStatus::Open {
            return Err(not_connected("websocket session is not open"));
        }
        let payload = message.to_json()?;
        self.outbound
            .send(Outbound::Frame(payload))
            .map_err(|_| error(ErrorKind::Shutdown, "connection task is not running"))
    }

    fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

async fn establish(options: &ConnectionOptions) -> Result<Socket, Error> {
    debug!("Establishing websocket connection to {}", options.url);

    match tokio::time::timeout(
        options.connect_timeout,
        tokio_tungstenite::connect_async(options.url.as_str()),
    )
    .await
    {
        Ok(Ok((socket, _response))) => Ok(socket),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(error(
            ErrorKind::Transport(TransportErrorKind::ConnectTimeout),
            &format!("no connection after {:?}", options.connect_timeout),
        )),
    }
}

/// Drops frames that were queued against a session that no longer exists.
/// Returns `true` if a close was requested in the meantime.
fn discard_stale(outbound_rx: &mut mpsc::UnboundedReceiver<Outbound>) -> bool {
    let mut discarded = 0;
    while let Ok(outbound) = outbound_rx.try_recv() {
        match outbound {
            Outbound::Frame(_) => discarded += 1,
            Outbound::Close => return true,
        }
    }
    if discarded > 0 {
        warn!("Discarded {discarded} frame(s) queued on the previous session");
    }
    false
}

async fn connection_task(
    options: ConnectionOptions,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<TransportEvent>,
    status: Arc<StatusCell>,
) {
    let mut session: u64 = 0;
    let mut attempt: u32 = 0;

    loop {
        status.set(SessionStatus::Connecting);
        let _ = events.send(TransportEvent::Connecting { attempt });

        match establish(&options).await {
            Ok(socket) => {
                if discard_stale(&mut outbound_rx) {
                    status.set(SessionStatus::Closed);
                    return;
                }
                attempt = 0;
                session += 1;
                status.set(SessionStatus::Open);
                info!("Connected to {} (session {session})", options.url);
                if events.send(TransportEvent::Opened { session }).is_err() {
                    debug!("Transport event receiver dropped, closing connection");
                    status.set(SessionStatus::Closed);
                    return;
                }

                let end = run_session(socket, session, &options, &mut outbound_rx, &events).await;
                status.set(SessionStatus::Closed);
                match end {
                    SessionEnd::Shutdown => {
                        info!("Connection to {} closed", options.url);
                        let _ = events.send(TransportEvent::Closed {
                            reason: "client shutdown".to_string(),
                        });
                        return;
                    }
                    SessionEnd::Dropped(reason) => {
                        warn!("Connection to {} lost: {reason}", options.url);
                        let _ = events.send(TransportEvent::Closed { reason });
                    }
                }
            }
            Err(e) => {
                status.set(SessionStatus::Closed);
                warn!("Connection attempt {} failed: {e}", attempt + 1);
            }
        }

        let delay = options.backoff.delay(attempt);
        attempt = attempt.saturating_add(1);
        info!("Attempting reconnection in {delay:?} (attempt {attempt})");

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                outbound = outbound_rx.recv() => match outbound {
                    Some(Outbound::Frame(_)) => {
                        warn!("Dropping frame sent while disconnected");
                    }
                    Some(Outbound::Close) | None => return,
                },
                _ = &mut sleep => break,
            }
        }
    }
}

async fn run_session(
    mut socket: Socket,
    session: u64,
    options: &ConnectionOptions,
    outbound_rx: &mut mpsc::UnboundedReceiver<Outbound>,
    events: &mpsc::UnboundedSender<TransportEvent>,
) -> SessionEnd {
    let keepalive = options.keepalive_interval;
    let idle_period = keepalive.unwrap_or(FAR_FUTURE);
    let mut idle_deadline = Instant::now() + idle_period;
    let mut pong_deadline: Option<Instant> = None;
    let mut frame: u64 = 0;

    loop {
        let idle = tokio::time::sleep_until(idle_deadline);
        tokio::pin!(idle);
        let pong = tokio::time::sleep_until(pong_deadline.unwrap_or(idle_deadline + FAR_FUTURE));
        tokio::pin!(pong);

        tokio::select! {
            biased;

            _ = &mut pong, if pong_deadline.is_some() => {
                return SessionEnd::Dropped(format!(
                    "no response {:?} after keepalive ping",
                    options.pong_timeout
                ));
            }

            outbound = outbound_rx.recv() => match outbound {
                Some(Outbound::Frame(payload)) => {
                    if let Err(e) = socket.send(Message::Text(payload)).await {
                        return SessionEnd::Dropped(format!("send failed: {e}"));
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = socket.close(None).await;
                    return SessionEnd::Shutdown;
                }
            },

            _ = &mut idle, if keepalive.is_some() && pong_deadline.is_none() => {
                if let Err(e) = socket.send(Message::Ping(Vec::new())).await {
                    return SessionEnd::Dropped(format!("keepalive ping failed: {e}"));
                }
                pong_deadline = Some(Instant::now() + options.pong_timeout);
            }

            inbound = socket.next() => {
                idle_deadline = Instant::now() + idle_period;
                pong_deadline = None;

                let text = match inbound {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!("Skipping binary frame that is not UTF-8");
                            continue;
                        }
                    },
                    // tungstenite answers pings itself on the next read or write.
                    Some(Ok(Message::Ping(_)))
                    | Some(Ok(Message::Pong(_)))
                    | Some(Ok(Message::Frame(_))) => continue,
                    Some(Ok(Message::Close(close))) => {
                        let reason = close
                            .map(|f| format!("server closed connection ({}): {}", f.code, f.reason))
                            .unwrap_or_else(|| "server closed connection".to_string());
                        return SessionEnd::Dropped(reason);
                    }
                    Some(Err(e)) => return SessionEnd::Dropped(format!("websocket error: {e}")),
                    None => return SessionEnd::Dropped("websocket stream ended".to_string()),
                };

                if text.len() > options.max_frame_bytes {
                    warn!("Skipping oversized frame ({} bytes)", text.len());
                    continue;
                }

                match ServerPush::parse(&text) {
                    Ok(Some(push)) => {
                        frame += 1;
                        let sequence = Sequence { session, frame };
                        if events.send(TransportEvent::Push { push, sequence }).is_err() {
                            debug!("Transport event receiver dropped, closing connection");
                            let _ = socket.close(None).await;
                            return SessionEnd::Shutdown;
                        }
                    }
                    Ok(None) => debug!("Ignoring frame without event: {text}"),
                    Err(e) => warn!("Failed to parse frame: {e}"),
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use events::Identity;
    use serde_json::json;
    use tokio::net::TcpListener;

    pub(crate) type ServerSocket = WebSocketStream<TcpStream>;

    /// A local websocket endpoint for the connection to dial.
    pub(crate) async fn listen() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    pub(crate) async fn accept(listener: &TcpListener) -> ServerSocket {
        let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        tokio_tungstenite::accept_async(stream).await.unwrap()
    }

    /// Next text frame from the client, or `None` if nothing arrives in `wait`.
    pub(crate) async fn next_text(server: &mut ServerSocket, wait: Duration) -> Option<String> {
        match tokio::time::timeout(wait, server.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => Some(text),
            _ => None,
        }
    }

    pub(crate) fn local_options(url: String) -> ConnectionOptions {
        ConnectionOptions {
            url,
            backoff: Backoff::new(Duration::from_millis(10), Duration::from_millis(10)),
            keepalive_interval: None,
            pong_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
            max_frame_bytes: 64,
        }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_backoff_doubles_from_base() {
        let backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));

        assert_eq!(backoff.delay(0), Duration::from_millis(500));
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
        assert_eq!(backoff.delay(3), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_is_capped_at_ceiling() {
        let backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));

        assert_eq!(backoff.delay(10), Duration::from_secs(30));
        assert_eq!(backoff.delay(64), Duration::from_secs(30));
        assert_eq!(backoff.delay(u32::MAX), backoff.ceiling());
    }

    #[test]
    fn test_backoff_ceiling_never_below_base() {
        let backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(backoff.delay(0), Duration::from_secs(5));
    }

    #[test]
    fn test_status_cell_swaps() {
        let cell = StatusCell::new(SessionStatus::Connecting);
        assert_eq!(cell.set(SessionStatus::Open), SessionStatus::Connecting);
        assert_eq!(cell.get(), SessionStatus::Open);
        assert_eq!(cell.set(SessionStatus::Closed), SessionStatus::Open);
    }

    #[test]
    fn test_sequence_orders_sessions_before_frames() {
        let old = Sequence { session: 1, frame: 900 };
        let new = Sequence { session: 2, frame: 1 };
        assert!(new > old);
        assert!(Sequence { session: 2, frame: 2 } > new);
    }

    #[tokio::test]
    async fn test_send_fails_while_not_open() {
        let (events, _events_rx) = mpsc::unbounded_channel();
        let options = ConnectionOptions {
            // Nothing listens on port 9 of the loopback interface.
            url: "ws://127.0.0.1:9".to_string(),
            backoff: Backoff::new(Duration::from_secs(60), Duration::from_secs(60)),
            keepalive_interval: None,
            pong_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(1),
            max_frame_bytes: 1024,
        };
        let (connection, task) = Connection::spawn(options, events);

        let err = connection
            .send(&ClientMessage::subscribe(&events::Identity::state(1)))
            .unwrap_err();
        assert!(err.is_not_connected());

        connection.close();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_session_stamps_pushes_and_skips_oversized_frames() {
        let (listener, url) = listen().await;
        let (events, mut events_rx) = mpsc::unbounded_channel();
        let (connection, task) = Connection::spawn(local_options(url), events);

        let mut server = accept(&listener).await;
        assert_eq!(
            next_event(&mut events_rx).await,
            TransportEvent::Connecting { attempt: 0 }
        );
        assert_eq!(
            next_event(&mut events_rx).await,
            TransportEvent::Opened { session: 1 }
        );
        assert_eq!(connection.status(), SessionStatus::Open);

        server.send(Message::Text("x".repeat(128))).await.unwrap();
        server
            .send(Message::Text(
                r#"{"event":"state","key":7,"data":{"value":1}}"#.to_string(),
            ))
            .await
            .unwrap();

        assert_eq!(
            next_event(&mut events_rx).await,
            TransportEvent::Push {
                push: ServerPush::new(Identity::state(7), json!({"value": 1})),
                sequence: Sequence { session: 1, frame: 1 },
            }
        );

        connection.close();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_session_reconnects_as_new_session() {
        let (listener, url) = listen().await;
        let (events, mut events_rx) = mpsc::unbounded_channel();
        let (connection, task) = Connection::spawn(local_options(url), events);

        let server = accept(&listener).await;
        assert_eq!(
            next_event(&mut events_rx).await,
            TransportEvent::Connecting { attempt: 0 }
        );
        assert_eq!(
            next_event(&mut events_rx).await,
            TransportEvent::Opened { session: 1 }
        );

        drop(server);
        assert!(matches!(
            next_event(&mut events_rx).await,
            TransportEvent::Closed { .. }
        ));
        assert_eq!(
            next_event(&mut events_rx).await,
            TransportEvent::Connecting { attempt: 1 }
        );

        let mut server = accept(&listener).await;
        assert_eq!(
            next_event(&mut events_rx).await,
            TransportEvent::Opened { session: 2 }
        );

        server
            .send(Message::Text(
                r#"{"event":"state","key":7,"data":{"value":2}}"#.to_string(),
            ))
            .await
            .unwrap();
        assert_eq!(
            next_event(&mut events_rx).await,
            TransportEvent::Push {
                push: ServerPush::new(Identity::state(7), json!({"value": 2})),
                sequence: Sequence { session: 2, frame: 1 },
            }
        );

        connection.close();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_frames_reach_the_server_in_order() {
        let (listener, url) = listen().await;
        let (events, mut events_rx) = mpsc::unbounded_channel();
        let (connection, task) = Connection::spawn(local_options(url), events);

        let mut server = accept(&listener).await;
        while next_event(&mut events_rx).await != (TransportEvent::Opened { session: 1 }) {}

        let first = ClientMessage::subscribe(&Identity::state(1));
        let second = ClientMessage::subscribe(&Identity::state(2));
        connection.send(&first).unwrap();
        connection.send(&second).unwrap();

        let wait = Duration::from_secs(5);
        assert_eq!(next_text(&mut server, wait).await, Some(first.to_json().unwrap()));
        assert_eq!(next_text(&mut server, wait).await, Some(second.to_json().unwrap()));

        connection.close();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_ping_is_answered_once() {
        let (listener, url) = listen().await;
        let (events, mut events_rx) = mpsc::unbounded_channel();
        let (connection, task) = Connection::spawn(local_options(url), events);

        let mut server = accept(&listener).await;
        while next_event(&mut events_rx).await != (TransportEvent::Opened { session: 1 }) {}

        server.send(Message::Ping(b"hi".to_vec())).await.unwrap();
        let wait = Duration::from_secs(5);
        let pong = tokio::time::timeout(wait, server.next()).await.unwrap();
        assert!(matches!(pong, Some(Ok(Message::Pong(payload))) if payload == b"hi"));

        let frame = ClientMessage::subscribe(&Identity::state(1));
        connection.send(&frame).unwrap();
        assert_eq!(next_text(&mut server, wait).await, Some(frame.to_json().unwrap()));

        connection.close();
        task.await.unwrap();
    }
}
