// =============================================================================
// Streaming Transport — reconnecting WebSocket client
// =============================================================================
//
// State machine:
//   Idle -> Connecting -> Open -> (Closing ->) Closed
//   Closed -> Connecting            automatic reconnect, per ReconnectPolicy
//
// - A successful open resets the attempt counter and flushes the outbound
//   queue in enqueue order before anything sent afterwards.
// - Errors are reported as events; the close that follows drives the state.
// - `close()` clears the queue, cancels a pending reconnect and never
//   reconnects.
// - `send` while not Open queues the frame instead of dropping it.
//
// All frames go out as binary. Text frames received are delivered as their
// UTF-8 bytes. Optional zstd decompression runs before delivery; a frame that
// fails to decompress is logged and dropped.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::backoff::ReconnectPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Zstd,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    pub url: String,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    #[serde(default)]
    pub compression: Compression,
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: ReconnectPolicy::default(),
            compression: Compression::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open,
    Message(Bytes),
    Error(String),
    Reconnecting { attempt: u32, delay: Duration },
    Closed { will_reconnect: bool },
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Frames waiting for an open connection, plus the live session's sender.
/// Both live under one lock so a send racing the open transition can never
/// overtake the queued backlog.
#[derive(Default)]
struct Outbound {
    queue: VecDeque<Bytes>,
    live: Option<mpsc::UnboundedSender<Bytes>>,
}

struct Inner {
    config: TransportConfig,
    state: RwLock<ConnectionState>,
    outbound: Mutex<Outbound>,
    events: broadcast::Sender<TransportEvent>,
    attempts: AtomicU32,
    close_requested: AtomicBool,
    shutdown: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct StreamingTransport {
    inner: Arc<Inner>,
}

impl StreamingTransport {
    pub fn new(config: TransportConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                state: RwLock::new(ConnectionState::Idle),
                outbound: Mutex::new(Outbound::default()),
                events,
                attempts: AtomicU32::new(0),
                close_requested: AtomicBool::new(false),
                shutdown,
                driver: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    pub fn url(&self) -> &str {
        &self.inner.config.url
    }

    /// Reconnects scheduled since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::Acquire)
    }

    pub fn queued(&self) -> usize {
        self.inner.outbound.lock().queue.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    /// Start connecting. A no-op unless the transport is Idle or Closed.
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) {
        let mut driver = self.inner.driver.lock();
        if driver.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        {
            let mut state = self.inner.state.write();
            if !matches!(*state, ConnectionState::Idle | ConnectionState::Closed) {
                return;
            }
            *state = ConnectionState::Connecting;
        }
        self.inner.close_requested.store(false, Ordering::Release);
        self.inner.shutdown.send_replace(false);
        let inner = self.inner.clone();
        *driver = Some(tokio::spawn(drive(inner)));
    }

    /// Send one frame, or queue it until the connection is open.
    pub fn send(&self, data: impl Into<Bytes>) {
        let data = data.into();
        let mut out = self.inner.outbound.lock();
        if let Some(live) = out.live.as_ref() {
            match live.send(data) {
                Ok(()) => return,
                Err(mpsc::error::SendError(data)) => out.queue.push_back(data),
            }
        } else {
            out.queue.push_back(data);
        }
    }

    /// Close explicitly: drop queued frames, cancel any pending reconnect and
    /// wait for the connection to wind down.
    pub async fn close(&self) {
        self.inner.close_requested.store(true, Ordering::Release);
        self.inner.outbound.lock().queue.clear();
        {
            let mut state = self.inner.state.write();
            if matches!(*state, ConnectionState::Connecting | ConnectionState::Open) {
                *state = ConnectionState::Closing;
            }
        }
        self.inner.shutdown.send_replace(true);

        let handle = self.inner.driver.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "transport driver ended abnormally");
            }
        }
        self.inner.set_state(ConnectionState::Closed);
    }
}

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write();
        if *state != next {
            debug!(from = ?*state, to = ?next, url = %self.config.url, "transport state");
            *state = next;
        }
    }

    fn emit(&self, event: TransportEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn closing(&self) -> bool {
        self.close_requested.load(Ordering::Acquire)
    }

    fn deliver(&self, payload: Bytes) {
        let payload = match self.config.compression {
            Compression::None => payload,
            Compression::Zstd => match zstd::decode_all(&payload[..]) {
                Ok(raw) => Bytes::from(raw),
                Err(e) => {
                    warn!(error = %e, len = payload.len(), "failed to decompress frame, dropping");
                    return;
                }
            },
        };
        self.emit(TransportEvent::Message(payload));
    }

    /// Transition to Open: everything queued goes into the session channel
    /// first, then later sends follow it.
    fn open_session(&self) -> mpsc::UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut out = self.outbound.lock();
        for frame in out.queue.drain(..) {
            let _ = tx.send(frame);
        }
        out.live = Some(tx);
        self.set_state(ConnectionState::Open);
        rx
    }

    /// Detach the session. Frames accepted but not written are re-queued
    /// ahead of anything sent since, unless the close was explicit.
    fn end_session(&self, mut rx: mpsc::UnboundedReceiver<Bytes>) {
        let mut out = self.outbound.lock();
        out.live = None;
        if self.closing() {
            out.queue.clear();
            return;
        }
        let mut unsent = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            unsent.push(frame);
        }
        for frame in unsent.into_iter().rev() {
            out.queue.push_front(frame);
        }
    }

    async fn session(&self, ws: WsStream, shutdown: &mut watch::Receiver<bool>) {
        let (mut sink, mut stream) = ws.split();
        let mut outgoing = self.open_session();
        self.attempts.store(0, Ordering::Release);
        info!(url = %self.config.url, "transport open");
        self.emit(TransportEvent::Open);

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(WsMessage::Binary(data))) => self.deliver(Bytes::from(data)),
                    Some(Ok(WsMessage::Text(text))) => self.deliver(Bytes::from(text.into_bytes())),
                    Some(Ok(WsMessage::Close(frame))) => {
                        debug!(frame = ?frame, "server closed connection");
                        break;
                    }
                    // Ping / Pong / raw frames: tungstenite answers pings itself.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, url = %self.config.url, "transport read error");
                        self.emit(TransportEvent::Error(e.to_string()));
                        break;
                    }
                    None => break,
                },
                frame = outgoing.recv() => {
                    let Some(frame) = frame else { break };
                    if let Err(e) = sink.send(WsMessage::Binary(frame.to_vec())).await {
                        warn!(error = %e, url = %self.config.url, "transport write error");
                        self.emit(TransportEvent::Error(e.to_string()));
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    self.set_state(ConnectionState::Closing);
                    // Frames already handed to the open session still go out.
                    while let Ok(frame) = outgoing.try_recv() {
                        if sink.send(WsMessage::Binary(frame.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    let _ = sink.send(WsMessage::Close(None)).await;
                    let _ = sink.close().await;
                    break;
                }
            }
        }

        self.end_session(outgoing);
    }
}

/// Connection driver: one task per `connect()`, alive until the transport
/// closes for good.
async fn drive(inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut announced_final = false;

    loop {
        if *shutdown.borrow() || inner.closing() {
            break;
        }
        inner.set_state(ConnectionState::Connecting);
        info!(url = %inner.config.url, attempt = inner.attempts.load(Ordering::Acquire), "transport connecting");

        let connected = tokio::select! {
            r = connect_async(inner.config.url.as_str()) => r,
            _ = shutdown.changed() => break,
        };
        match connected {
            Ok((ws, _response)) => inner.session(ws, &mut shutdown).await,
            Err(e) => {
                warn!(error = %e, url = %inner.config.url, "transport connect failed");
                inner.emit(TransportEvent::Error(e.to_string()));
            }
        }

        let attempt = inner.attempts.load(Ordering::Acquire);
        let will_reconnect = !inner.closing() && inner.config.reconnect.permits(attempt);
        inner.set_state(ConnectionState::Closed);
        inner.emit(TransportEvent::Closed { will_reconnect });
        if !will_reconnect {
            announced_final = true;
            if !inner.closing() {
                info!(url = %inner.config.url, attempts = attempt, "transport closed, not reconnecting");
            }
            break;
        }

        let delay = inner.config.reconnect.delay(attempt);
        inner.attempts.store(attempt + 1, Ordering::Release);
        info!(
            url = %inner.config.url,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "transport reconnecting"
        );
        inner.emit(TransportEvent::Reconnecting {
            attempt: attempt + 1,
            delay,
        });

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    inner.set_state(ConnectionState::Closed);
    if !announced_final {
        inner.emit(TransportEvent::Closed {
            will_reconnect: false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::backoff::Backoff;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::accept_async;

    type ServerSide = WebSocketStream<TcpStream>;

    /// Local WebSocket server handing each accepted connection to the test.
    async fn server() -> (String, mpsc::UnboundedReceiver<ServerSide>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                if let Ok(ws) = accept_async(tcp).await {
                    if tx.send(ws).is_err() {
                        break;
                    }
                }
            }
        });
        (format!("ws://{addr}"), rx)
    }

    fn fast_policy(attempts: Option<u32>) -> ReconnectPolicy {
        ReconnectPolicy {
            enabled: true,
            attempts,
            base_delay_ms: 10,
            max_delay_ms: 50,
            backoff: Backoff::Exponential,
        }
    }

    async fn wait_for<F>(rx: &mut broadcast::Receiver<TransportEvent>, mut pred: F) -> TransportEvent
    where
        F: FnMut(&TransportEvent) -> bool,
    {
        timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for transport event")
    }

    async fn next_binary(ws: &mut ServerSide) -> Vec<u8> {
        timeout(Duration::from_secs(5), async {
            loop {
                match ws.next().await.unwrap().unwrap() {
                    WsMessage::Binary(b) => return b,
                    _ => continue,
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn queued_frames_flush_in_order_on_open() {
        let (url, mut conns) = server().await;
        let transport = StreamingTransport::new(TransportConfig::new(url));
        let mut events = transport.subscribe();

        transport.send(Bytes::from_static(b"first"));
        transport.send("second");
        transport.send(vec![3u8]);
        assert_eq!(transport.queued(), 3);
        assert_eq!(transport.state(), ConnectionState::Idle);

        transport.connect();
        let mut ws = conns.recv().await.unwrap();
        wait_for(&mut events, |e| *e == TransportEvent::Open).await;
        assert_eq!(transport.state(), ConnectionState::Open);

        assert_eq!(next_binary(&mut ws).await, b"first");
        assert_eq!(next_binary(&mut ws).await, b"second");
        assert_eq!(next_binary(&mut ws).await, vec![3u8]);

        transport.send("live");
        assert_eq!(next_binary(&mut ws).await, b"live");

        ws.send(WsMessage::Binary(vec![9, 9])).await.unwrap();
        let got = wait_for(&mut events, |e| matches!(e, TransportEvent::Message(_))).await;
        assert_eq!(got, TransportEvent::Message(Bytes::from_static(&[9, 9])));

        transport.close().await;
    }

    #[tokio::test]
    async fn reconnects_after_server_drop_and_resets_attempts() {
        let (url, mut conns) = server().await;
        let mut config = TransportConfig::new(url);
        config.reconnect = fast_policy(None);
        let transport = StreamingTransport::new(config);
        let mut events = transport.subscribe();

        transport.connect();
        let first = conns.recv().await.unwrap();
        wait_for(&mut events, |e| *e == TransportEvent::Open).await;
        drop(first);

        let closed = wait_for(&mut events, |e| matches!(e, TransportEvent::Closed { .. })).await;
        assert_eq!(closed, TransportEvent::Closed { will_reconnect: true });
        let reconnecting =
            wait_for(&mut events, |e| matches!(e, TransportEvent::Reconnecting { .. })).await;
        assert_eq!(
            reconnecting,
            TransportEvent::Reconnecting {
                attempt: 1,
                delay: Duration::from_millis(10)
            }
        );

        let _second = conns.recv().await.unwrap();
        wait_for(&mut events, |e| *e == TransportEvent::Open).await;
        assert_eq!(transport.attempts(), 0);

        transport.close().await;
    }

    #[tokio::test]
    async fn explicit_close_never_reconnects() {
        let (url, mut conns) = server().await;
        let mut config = TransportConfig::new(url);
        config.reconnect = fast_policy(None);
        let transport = StreamingTransport::new(config);
        let mut events = transport.subscribe();

        transport.connect();
        let _ws = conns.recv().await.unwrap();
        wait_for(&mut events, |e| *e == TransportEvent::Open).await;

        transport.close().await;
        assert_eq!(transport.state(), ConnectionState::Closed);
        let closed = wait_for(&mut events, |e| matches!(e, TransportEvent::Closed { .. })).await;
        assert_eq!(closed, TransportEvent::Closed { will_reconnect: false });

        // Sends after close are held, not written.
        transport.send("late");
        assert_eq!(transport.queued(), 1);
        assert!(timeout(Duration::from_millis(150), conns.recv()).await.is_err());
    }

    #[tokio::test]
    async fn exhausted_attempts_stay_closed() {
        // Nothing listens on this port once the listener is dropped.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut config = TransportConfig::new(format!("ws://{addr}"));
        config.reconnect = fast_policy(Some(2));
        let transport = StreamingTransport::new(config);
        let mut events = transport.subscribe();
        transport.connect();

        let mut reconnects = Vec::new();
        timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await.unwrap() {
                    TransportEvent::Reconnecting { attempt, .. } => reconnects.push(attempt),
                    TransportEvent::Closed { will_reconnect: false } => break,
                    _ => {}
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(reconnects, vec![1, 2]);
        assert_eq!(transport.state(), ConnectionState::Closed);
        assert_eq!(transport.attempts(), 2);
    }

    #[tokio::test]
    async fn zstd_frames_are_decompressed_and_bad_ones_dropped() {
        let (url, mut conns) = server().await;
        let mut config = TransportConfig::new(url);
        config.compression = Compression::Zstd;
        let transport = StreamingTransport::new(config);
        let mut events = transport.subscribe();

        transport.connect();
        let mut ws = conns.recv().await.unwrap();
        wait_for(&mut events, |e| *e == TransportEvent::Open).await;

        ws.send(WsMessage::Binary(vec![1, 2, 3, 4])).await.unwrap();
        let packed = zstd::encode_all(&b"hello feed"[..], 0).unwrap();
        ws.send(WsMessage::Binary(packed)).await.unwrap();

        let got = wait_for(&mut events, |e| matches!(e, TransportEvent::Message(_))).await;
        assert_eq!(got, TransportEvent::Message(Bytes::from_static(b"hello feed")));

        transport.close().await;
    }
}
