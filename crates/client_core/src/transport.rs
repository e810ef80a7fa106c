use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use shared::{
    domain::{Identity, UserId},
    protocol::{ClientRequest, ServerEvent},
};

use crate::error::TransportError;

const EVENT_CAPACITY: usize = 256;
const OUTBOUND_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A (re)connect completed; the server re-pushes presence after this.
    Connected,
    Disconnected,
    Server(ServerEvent),
}

/// One persistent realtime connection per authenticated session.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Resolves once the frame has been written to the socket.
    async fn send(&self, request: ClientRequest) -> Result<(), TransportError>;
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
    fn state(&self) -> watch::Receiver<ConnectionState>;

    fn is_connected(&self) -> bool {
        *self.state().borrow() == ConnectionState::Connected
    }

    /// Declares interest in the room shared with `target`. The room is
    /// remembered and re-joined after every reconnect.
    async fn join_room(&self, target: &UserId) -> Result<(), TransportError>;
    /// Forgets a joined room so reconnects stop re-joining it. The protocol
    /// has no leave frame.
    fn leave_room(&self, target: &UserId);
    async fn close(&self);
}

/// Builds the websocket endpoint carrying the identity claims.
pub fn websocket_url(server_url: &str, identity: &Identity, token: Option<&str>) -> Result<Url> {
    let mut url =
        Url::parse(server_url).with_context(|| format!("invalid server url: {server_url}"))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => bail!("server_url must use http(s) or ws(s), got {other}"),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("cannot switch {server_url} to {scheme}"))?;
    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    {
        let mut query = url.query_pairs_mut();
        query
            .clear()
            .append_pair("userId", identity.user_id.as_str())
            .append_pair("role", identity.role.as_str())
            .append_pair("userName", &identity.user_name);
        if let Some(token) = token {
            query.append_pair("token", token);
        }
    }
    Ok(url)
}

struct OutboundFrame {
    text: String,
    ack: oneshot::Sender<Result<(), TransportError>>,
}

/// Websocket transport driven by a supervisor task that reconnects with
/// exponential backoff.
pub struct WsTransport {
    outbound: mpsc::Sender<OutboundFrame>,
    events: broadcast::Sender<TransportEvent>,
    state: watch::Receiver<ConnectionState>,
    joined: Arc<Mutex<BTreeSet<UserId>>>,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl WsTransport {
    /// Starts the supervisor. The first connection attempt happens in the
    /// background, so an unreachable server still yields a usable transport.
    pub fn spawn(url: Url, backoff: (Duration, Duration)) -> Self {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state_tx, state) = watch::channel(ConnectionState::Connecting);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let joined = Arc::new(Mutex::new(BTreeSet::new()));

        let supervisor = Supervisor {
            url,
            backoff,
            outbound: outbound_rx,
            events: events.clone(),
            state: state_tx,
            joined: Arc::clone(&joined),
            shutdown: shutdown_rx,
        };
        let handle = tokio::spawn(supervisor.run());

        Self {
            outbound,
            events,
            state,
            joined,
            shutdown,
            supervisor: Mutex::new(Some(handle)),
        }
    }
}

#[async_trait]
impl RealtimeTransport for WsTransport {
    async fn send(&self, request: ClientRequest) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let text = serde_json::to_string(&request)?;
        let (ack, written) = oneshot::channel();
        self.outbound
            .send(OutboundFrame { text, ack })
            .await
            .map_err(|_| TransportError::Closed)?;
        written.await.map_err(|_| TransportError::Closed)?
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    async fn join_room(&self, target: &UserId) -> Result<(), TransportError> {
        if let Ok(mut joined) = self.joined.lock() {
            joined.insert(target.clone());
        }
        if !self.is_connected() {
            debug!(target = %target, "realtime: join deferred until connected");
            return Ok(());
        }
        self.send(ClientRequest::JoinRoom {
            target_user_id: target.clone(),
        })
        .await
    }

    fn leave_room(&self, target: &UserId) {
        if let Ok(mut joined) = self.joined.lock() {
            if joined.remove(target) {
                debug!(target = %target, "realtime: room left");
            }
        }
    }

    async fn close(&self) {
        self.shutdown.send_replace(true);
        let handle = self.supervisor.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "realtime: supervisor ended abnormally");
            }
        }
    }
}

enum ConnectionEnd {
    Dropped,
    Shutdown,
}

struct Supervisor {
    url: Url,
    backoff: (Duration, Duration),
    outbound: mpsc::Receiver<OutboundFrame>,
    events: broadcast::Sender<TransportEvent>,
    state: watch::Sender<ConnectionState>,
    joined: Arc<Mutex<BTreeSet<UserId>>>,
    shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    async fn run(mut self) {
        let (initial, max) = self.backoff;
        let mut delay = initial;

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            self.state.send_replace(ConnectionState::Connecting);
            match connect_async(self.url.as_str()).await {
                Ok((stream, _)) => {
                    delay = initial;
                    info!(host = ?self.url.host_str(), "realtime: connected");
                    let end = self.drive(stream).await;
                    self.state.send_replace(ConnectionState::Disconnected);
                    let _ = self.events.send(TransportEvent::Disconnected);
                    if matches!(end, ConnectionEnd::Shutdown) {
                        break;
                    }
                    warn!("realtime: connection dropped");
                }
                Err(err) => {
                    self.state.send_replace(ConnectionState::Disconnected);
                    warn!(error = %err, retry_in_ms = delay.as_millis() as u64, "realtime: connect failed");
                }
            }

            if self.wait_before_retry(delay).await {
                break;
            }
            delay = (delay * 2).min(max);
        }

        self.state.send_replace(ConnectionState::Closed);
        info!("realtime: closed");
    }

    /// Sleeps for `delay`, rejecting sends meanwhile. Returns true on shutdown.
    async fn wait_before_retry(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return true;
                    }
                }
                frame = self.outbound.recv() => match frame {
                    Some(frame) => {
                        let _ = frame.ack.send(Err(TransportError::NotConnected));
                    }
                    None => return true,
                },
            }
        }
    }

    async fn drive(&mut self, stream: WebSocketStream<MaybeTlsStream<TcpStream>>) -> ConnectionEnd {
        let (mut writer, mut reader) = stream.split();

        let rooms: Vec<UserId> = self
            .joined
            .lock()
            .map(|joined| joined.iter().cloned().collect())
            .unwrap_or_default();
        for target in rooms {
            let frame = ClientRequest::JoinRoom {
                target_user_id: target.clone(),
            };
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if let Err(err) = writer.send(Message::Text(text)).await {
                warn!(target = %target, error = %err, "realtime: failed to replay join_room");
                return ConnectionEnd::Dropped;
            }
        }

        self.state.send_replace(ConnectionState::Connected);
        let _ = self.events.send(TransportEvent::Connected);

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        let _ = writer.send(Message::Close(None)).await;
                        return ConnectionEnd::Shutdown;
                    }
                }
                frame = self.outbound.recv() => {
                    let Some(frame) = frame else {
                        return ConnectionEnd::Shutdown;
                    };
                    let written = writer
                        .send(Message::Text(frame.text))
                        .await
                        .map_err(|_| TransportError::Closed);
                    let failed = written.is_err();
                    let _ = frame.ack.send(written);
                    if failed {
                        return ConnectionEnd::Dropped;
                    }
                }
                inbound = reader.next() => match inbound {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            let _ = self.events.send(TransportEvent::Server(event));
                        }
                        Err(err) => warn!(error = %err, "realtime: ignoring malformed server event"),
                    },
                    Some(Ok(Message::Close(_))) | None => return ConnectionEnd::Dropped,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "realtime: receive failed");
                        return ConnectionEnd::Dropped;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
