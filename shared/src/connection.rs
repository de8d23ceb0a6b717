//! Connection pump: one read task and one write task per websocket.
//!
//! The read task decodes frames into [`Event`]s and forwards them, tagged with
//! the connection's identity, into a shared bounded inbound channel. The write
//! task drains a bounded outbound queue onto the socket. Neither task touches
//! any state beyond the socket halves it owns.
//!
//! Outbound policy: [`Connection::send`] never blocks. A full queue drops the
//! frame and reports [`SendError::Backpressure`]; a closed connection reports
//! [`SendError::Closed`]. Liveness pings wait up to `ping_wait` for queue space.

use crate::shutdown::{Shutdown, TaskSet};
use crate::{Event, PlayerId, ProtocolError};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, trace, warn};
use std::fmt;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::error::ProtocolError as WsProtocolError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

/// Upper bound on flushing the queue and the close frame once closed.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Opaque token naming one physical connection. Two connections claiming the
/// same player id still carry different tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Messages a pump delivers to its owner.
#[derive(Debug, Clone)]
pub enum Inbound {
    Event {
        from: PlayerId,
        conn: ConnectionId,
        event: Event,
    },
    /// The read side ended; the connection is gone.
    Closed { from: PlayerId, conn: ConnectionId },
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("connection closed")]
    Closed,

    #[error("outbound queue full, frame dropped")]
    Backpressure,

    #[error("peer silent for {0:?}")]
    Stale(Duration),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// How a transport ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    /// Normal close handshake or the stream already shut down.
    Expected,
    /// Peer vanished or closed with an error code.
    Abnormal,
    Unknown,
}

impl Disconnect {
    pub fn classify(err: &WsError) -> Self {
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => Disconnect::Expected,
            WsError::Protocol(WsProtocolError::ResetWithoutClosingHandshake) => {
                Disconnect::Abnormal
            }
            WsError::Io(e)
                if matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::BrokenPipe
                        | ErrorKind::UnexpectedEof
                ) =>
            {
                Disconnect::Abnormal
            }
            _ => Disconnect::Unknown,
        }
    }

    pub fn from_close_frame(frame: Option<&CloseFrame>) -> Self {
        match frame.map(|f| f.code) {
            None | Some(CloseCode::Normal) | Some(CloseCode::Away) => Disconnect::Expected,
            Some(
                CloseCode::Abnormal
                | CloseCode::Protocol
                | CloseCode::Invalid
                | CloseCode::Policy
                | CloseCode::Size
                | CloseCode::Unsupported
                | CloseCode::Error,
            ) => Disconnect::Abnormal,
            Some(_) => Disconnect::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    /// Depth of the outbound queue.
    pub outbound_queue: usize,
    /// A peer silent for longer than this fails its next ping.
    pub idle_timeout: Duration,
    /// How long a ping may wait for queue space.
    pub ping_wait: Duration,
    /// Upper bound on a single socket write.
    pub write_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_queue: 64,
            idle_timeout: Duration::from_secs(30),
            ping_wait: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Handle to a running pump. Cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct Connection {
    id: PlayerId,
    token: ConnectionId,
    outbound: mpsc::Sender<Message>,
    shutdown: Shutdown,
    tasks: TaskSet,
    opened_at: Instant,
    last_seen_ms: Arc<AtomicU64>,
    config: ConnectionConfig,
}

impl Connection {
    /// Splits the websocket and starts its read and write tasks.
    pub fn spawn<S>(
        id: PlayerId,
        ws: WebSocketStream<S>,
        inbound: mpsc::Sender<Inbound>,
        config: ConnectionConfig,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        let (outbound, outbound_rx) = mpsc::channel(config.outbound_queue.max(1));

        let connection = Arc::new(Self {
            id,
            token: ConnectionId::new(),
            outbound,
            shutdown: Shutdown::new(),
            tasks: TaskSet::new(),
            opened_at: Instant::now(),
            last_seen_ms: Arc::new(AtomicU64::new(0)),
            config,
        });

        connection.tasks.spawn(read_loop(
            connection.id.clone(),
            connection.token,
            stream,
            inbound,
            connection.shutdown.clone(),
            Arc::clone(&connection.last_seen_ms),
            connection.opened_at,
        ));
        connection.tasks.spawn(write_loop(
            connection.id.clone(),
            sink,
            outbound_rx,
            connection.shutdown.clone(),
            config.write_timeout,
        ));

        connection
    }

    pub fn id(&self) -> &PlayerId {
        &self.id
    }

    /// Token that tags everything this connection delivers inbound.
    pub fn connection_id(&self) -> ConnectionId {
        self.token
    }

    /// Queues an event without waiting.
    pub fn send(&self, event: &Event) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        let text = event.encode()?;
        match self.outbound.try_send(Message::text(text)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SendError::Backpressure),
            Err(TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    /// Queues a ping control frame. Any error means the peer should be dropped.
    pub async fn ping(&self) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        let idle = self.idle_for();
        if idle > self.config.idle_timeout {
            return Err(SendError::Stale(idle));
        }
        match self
            .outbound
            .send_timeout(Message::Ping(Default::default()), self.config.ping_wait)
            .await
        {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(SendError::Backpressure),
            Err(SendTimeoutError::Closed(_)) => Err(SendError::Closed),
        }
    }

    /// Time since the last frame of any kind arrived from the peer.
    pub fn idle_for(&self) -> Duration {
        let last_seen = Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        self.opened_at.elapsed().saturating_sub(last_seen)
    }

    /// Signals both tasks to stop. Returns true for the call that closed it.
    pub fn close(&self) -> bool {
        let first = self.shutdown.trigger();
        if first {
            debug!("Closing connection {}", self.id);
        }
        first
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Waits until both the read and write tasks have exited.
    pub async fn closed(&self) {
        self.tasks.join_all().await;
    }
}

fn log_disconnect(id: &PlayerId, kind: Disconnect, detail: &dyn std::fmt::Display) {
    match kind {
        Disconnect::Expected => debug!("Connection {} closed: {}", id, detail),
        Disconnect::Abnormal => warn!("Connection {} closed abnormally: {}", id, detail),
        Disconnect::Unknown => error!("Connection {} failed: {}", id, detail),
    }
}

async fn read_loop<S>(
    id: PlayerId,
    token: ConnectionId,
    mut stream: SplitStream<WebSocketStream<S>>,
    inbound: mpsc::Sender<Inbound>,
    shutdown: Shutdown,
    last_seen_ms: Arc<AtomicU64>,
    opened_at: Instant,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let next = tokio::select! {
            _ = shutdown.triggered() => break,
            next = stream.next() => next,
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                log_disconnect(&id, Disconnect::classify(&e), &e);
                break;
            }
            None => {
                debug!("Connection {} stream ended", id);
                break;
            }
        };
        let seen = u64::try_from(opened_at.elapsed().as_millis()).unwrap_or(u64::MAX);
        last_seen_ms.store(seen, Ordering::Relaxed);

        let decoded = match message {
            Message::Text(text) => Event::decode(text.as_str()),
            Message::Binary(bytes) => Event::decode_slice(&bytes),
            Message::Close(frame) => {
                let kind = Disconnect::from_close_frame(frame.as_ref());
                let detail = frame
                    .as_ref()
                    .map(|f| format!("{} {}", f.code, f.reason))
                    .unwrap_or_else(|| "no close frame".to_string());
                log_disconnect(&id, kind, &detail);
                break;
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };

        match decoded {
            Ok(event) => {
                trace!("Connection {} received {}", id, event.kind());
                let delivery = Inbound::Event {
                    from: id.clone(),
                    conn: token,
                    event,
                };
                let delivered = tokio::select! {
                    _ = shutdown.triggered() => false,
                    sent = inbound.send(delivery) => sent.is_ok(),
                };
                if !delivered {
                    break;
                }
            }
            Err(e) => warn!("Dropping frame from {}: {}", id, e),
        }
    }

    shutdown.trigger();
    // Waits for queue space; fails at once if the owner closed its receiver.
    let notice = Inbound::Closed {
        from: id.clone(),
        conn: token,
    };
    if inbound.send(notice).await.is_err() {
        trace!("Connection {} owner gone before close notice", id);
    }
    trace!("Connection {} read loop exited", id);
}

async fn write_loop<S>(
    id: PlayerId,
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outbound: mpsc::Receiver<Message>,
    shutdown: Shutdown,
    write_timeout: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let message = tokio::select! {
            biased;
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = shutdown.triggered() => break,
        };

        let written = tokio::select! {
            written = timeout(write_timeout, sink.send(message)) => written,
            _ = shutdown.triggered() => break,
        };
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log_disconnect(&id, Disconnect::classify(&e), &e);
                shutdown.trigger();
                return;
            }
            Err(_) => {
                warn!("Connection {} write stalled for {:?}", id, write_timeout);
                shutdown.trigger();
                return;
            }
        }
    }

    // Flush whatever was queued before the close, then say goodbye. A peer
    // that stopped reading gets at most CLOSE_GRACE.
    shutdown.trigger();
    outbound.close();
    let goodbye = Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    }));
    let flush = async {
        while let Ok(message) = outbound.try_recv() {
            sink.feed(message).await?;
        }
        sink.send(goodbye).await?;
        sink.close().await
    };
    match timeout(write_timeout.min(CLOSE_GRACE), flush).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Connection {} close handshake failed: {}", id, e),
        Err(_) => debug!("Connection {} peer stopped reading, dropping queue", id),
    }
    trace!("Connection {} write loop exited", id);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{ChatPayload, Payload};
    use tokio::io::DuplexStream;
    use tokio_test::{assert_err, assert_ok};
    use tokio_tungstenite::tungstenite::protocol::Role;

    /// Server and client ends of an in-memory websocket.
    pub(crate) async fn ws_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>)
    {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        (server, client)
    }

    fn chat(text: &str) -> Event {
        Event::new(Payload::SendMessage(ChatPayload {
            from: None,
            text: text.to_string(),
        }))
    }

    async fn next_text(peer: &mut WebSocketStream<DuplexStream>) -> String {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(1), peer.next())
                .await
                .expect("peer should receive a frame")
                .expect("stream open")
                .expect("valid frame");
            if let Message::Text(text) = message {
                return text.as_str().to_string();
            }
        }
    }

    async fn next_inbound(rx: &mut mpsc::Receiver<Inbound>) -> Inbound {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("inbound should arrive")
            .expect("channel open")
    }

    #[test]
    fn test_classify_transport_errors() {
        assert_eq!(
            Disconnect::classify(&WsError::ConnectionClosed),
            Disconnect::Expected
        );
        assert_eq!(
            Disconnect::classify(&WsError::Protocol(
                WsProtocolError::ResetWithoutClosingHandshake
            )),
            Disconnect::Abnormal
        );
        let reset = std::io::Error::new(ErrorKind::ConnectionReset, "reset");
        assert_eq!(Disconnect::classify(&WsError::Io(reset)), Disconnect::Abnormal);
        let other = std::io::Error::new(ErrorKind::Other, "weird");
        assert_eq!(Disconnect::classify(&WsError::Io(other)), Disconnect::Unknown);
    }

    #[test]
    fn test_classify_close_codes() {
        let frame = |code| CloseFrame {
            code,
            reason: "".into(),
        };
        assert_eq!(Disconnect::from_close_frame(None), Disconnect::Expected);
        assert_eq!(
            Disconnect::from_close_frame(Some(&frame(CloseCode::Away))),
            Disconnect::Expected
        );
        assert_eq!(
            Disconnect::from_close_frame(Some(&frame(CloseCode::Error))),
            Disconnect::Abnormal
        );
        assert_eq!(
            Disconnect::from_close_frame(Some(&frame(CloseCode::Library(4000)))),
            Disconnect::Unknown
        );
    }

    #[tokio::test]
    async fn test_send_reaches_peer() {
        let (server, mut client) = ws_pair().await;
        let (tx, _rx) = mpsc::channel(8);
        let conn = Connection::spawn(PlayerId::new("p1"), server, tx, ConnectionConfig::default());

        assert_ok!(conn.send(&chat("hello")));
        let decoded = Event::decode(&next_text(&mut client).await).unwrap();
        assert_eq!(decoded.kind(), crate::EventType::SendMessage);

        conn.close();
        conn.closed().await;
    }

    #[tokio::test]
    async fn test_inbound_events_tagged_with_identity() {
        let (server, mut client) = ws_pair().await;
        let (tx, mut rx) = mpsc::channel(8);
        let connection = Connection::spawn(PlayerId::new("p1"), server, tx, ConnectionConfig::default());

        client
            .send(Message::text(chat("hi").encode().unwrap()))
            .await
            .unwrap();

        match next_inbound(&mut rx).await {
            Inbound::Event { from, conn, event } => {
                assert_eq!(from, PlayerId::new("p1"));
                assert_eq!(conn, connection.connection_id());
                assert_eq!(event.kind(), crate::EventType::SendMessage);
            }
            other => panic!("unexpected inbound {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_frame_dropped_connection_survives() {
        let (server, mut client) = ws_pair().await;
        let (tx, mut rx) = mpsc::channel(8);
        let conn = Connection::spawn(PlayerId::new("p1"), server, tx, ConnectionConfig::default());

        client.send(Message::text("{not json")).await.unwrap();
        client
            .send(Message::text(
                r#"{"type":"warp","timestamp":"2024-05-01T12:00:00Z","data":{}}"#,
            ))
            .await
            .unwrap();
        client
            .send(Message::text(chat("still here").encode().unwrap()))
            .await
            .unwrap();

        match next_inbound(&mut rx).await {
            Inbound::Event { event, .. } => match event.payload {
                Payload::SendMessage(chat) => assert_eq!(chat.text, "still here"),
                other => panic!("unexpected payload {:?}", other),
            },
            other => panic!("unexpected inbound {:?}", other),
        }
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_peer_close_reports_closed() {
        let (server, mut client) = ws_pair().await;
        let (tx, mut rx) = mpsc::channel(8);
        let conn = Connection::spawn(PlayerId::new("p1"), server, tx, ConnectionConfig::default());

        client.close(None).await.unwrap();

        match next_inbound(&mut rx).await {
            Inbound::Closed { from, conn: tagged } => {
                assert_eq!(from, PlayerId::new("p1"));
                assert_eq!(tagged, conn.connection_id());
            }
            other => panic!("unexpected inbound {:?}", other),
        }
        conn.closed().await;
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_close_notice_waits_for_full_inbound_queue() {
        let (server, mut client) = ws_pair().await;
        let (tx, mut rx) = mpsc::channel(1);
        let conn = Connection::spawn(
            PlayerId::new("p1"),
            server,
            tx.clone(),
            ConnectionConfig::default(),
        );

        let earlier = ConnectionId::new();
        tx.try_send(Inbound::Closed {
            from: PlayerId::new("p0"),
            conn: earlier,
        })
        .unwrap();
        client.close(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        match next_inbound(&mut rx).await {
            Inbound::Closed { conn: queued, .. } => assert_eq!(queued, earlier),
            other => panic!("unexpected inbound {:?}", other),
        }
        match next_inbound(&mut rx).await {
            Inbound::Closed { from, conn: tagged } => {
                assert_eq!(from, PlayerId::new("p1"));
                assert_eq!(tagged, conn.connection_id());
            }
            other => panic!("unexpected inbound {:?}", other),
        }
        conn.closed().await;
    }

    #[test]
    fn test_connection_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_releases_transport() {
        let (server, mut client) = ws_pair().await;
        let (tx, _rx) = mpsc::channel(8);
        let conn = Connection::spawn(PlayerId::new("p1"), server, tx, ConnectionConfig::default());

        assert!(conn.close());
        assert!(!conn.close());
        conn.closed().await;
        conn.closed().await;

        // The peer sees a close frame, then the end of the stream.
        let mut saw_close = false;
        while let Ok(Some(message)) =
            tokio::time::timeout(Duration::from_secs(1), client.next()).await
        {
            match message {
                Ok(Message::Close(_)) => saw_close = true,
                Ok(_) => {}
                Err(_) => break,
            }
        }
        assert!(saw_close);
    }

    #[tokio::test]
    async fn test_send_after_close_is_refused() {
        let (server, _client) = ws_pair().await;
        let (tx, _rx) = mpsc::channel(8);
        let conn = Connection::spawn(PlayerId::new("p1"), server, tx, ConnectionConfig::default());

        conn.close();
        assert!(matches!(conn.send(&chat("late")), Err(SendError::Closed)));
        assert!(matches!(conn.ping().await, Err(SendError::Closed)));
    }

    #[tokio::test]
    async fn test_local_event_never_queued() {
        let (server, _client) = ws_pair().await;
        let (tx, _rx) = mpsc::channel(8);
        let conn = Connection::spawn(PlayerId::new("p1"), server, tx, ConnectionConfig::default());

        let local = Event::new(Payload::LocalMessage(crate::LocalMessagePayload {
            text: "typed".to_string(),
        }));
        assert!(matches!(conn.send(&local), Err(SendError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        // The peer never reads, so the writer stalls and the queue fills up.
        let (a, _b) = tokio::io::duplex(64);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let (tx, _rx) = mpsc::channel(8);
        let config = ConnectionConfig {
            outbound_queue: 2,
            ping_wait: Duration::from_millis(20),
            ..ConnectionConfig::default()
        };
        let conn = Connection::spawn(PlayerId::new("slow"), server, tx, config);

        let mut dropped = 0;
        for i in 0..50 {
            if let Err(e) = conn.send(&chat(&format!("message number {}", i))) {
                assert!(matches!(e, SendError::Backpressure));
                dropped += 1;
            }
        }
        assert!(dropped > 0);
        assert_err!(conn.ping().await);
    }

    #[tokio::test]
    async fn test_silent_peer_fails_ping() {
        let (server, _client) = ws_pair().await;
        let (tx, _rx) = mpsc::channel(8);
        let config = ConnectionConfig {
            idle_timeout: Duration::from_millis(10),
            ..ConnectionConfig::default()
        };
        let conn = Connection::spawn(PlayerId::new("quiet"), server, tx, config);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(matches!(conn.ping().await, Err(SendError::Stale(_))));
    }

    #[tokio::test]
    async fn test_ping_on_healthy_connection() {
        let (server, _client) = ws_pair().await;
        let (tx, _rx) = mpsc::channel(8);
        let conn = Connection::spawn(PlayerId::new("p1"), server, tx, ConnectionConfig::default());
        assert_ok!(conn.ping().await);
    }
}
