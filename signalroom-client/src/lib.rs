//! Signaling client for the `signalroom` relay.
//!
//! Connects to a relay over WebSocket, joins a room, and exchanges offers,
//! answers and ICE candidates with the other members. Negotiation payloads
//! are opaque JSON values produced and consumed by the caller's
//! peer-connection layer; this client only frames and routes them.
//!
//! ```no_run
//! # async fn demo() -> Result<(), signalroom_client::ClientError> {
//! use signalroom_client::{SignalEvent, SignalingClient};
//!
//! let client = SignalingClient::connect("ws://localhost:3001").await?;
//! client.join("lobby").await?;
//! while let Ok(event) = client.recv().await {
//!     if event == SignalEvent::Ready {
//!         client.send_offer(serde_json::json!({ "type": "offer", "sdp": "..." })).await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use signalroom_proto::codec::{self, CodecError};
use signalroom_proto::{Signal, SignalKind};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Default timeout for connecting to the relay server.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors returned by [`SignalingClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The relay URL is not a valid `ws://` or `wss://` URL.
    #[error("invalid relay URL {0:?}")]
    InvalidUrl(String),

    /// The relay could not be reached.
    #[error("relay at {0} is unreachable")]
    Unreachable(String),

    /// Connecting took longer than the connect timeout.
    #[error("relay connection timed out")]
    Timeout,

    /// The connection to the relay has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// A negotiation message was sent before joining a room.
    #[error("not in a room")]
    NotJoined,

    /// An outbound message could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// An underlying I/O or WebSocket error occurred.
    #[error("relay I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A message received from the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    /// Another peer joined the room; time to create an offer.
    Ready,
    /// A peer's offer, as sent (see [`Signal::body`]).
    Offer(Signal),
    /// A peer's answer, as sent.
    Answer(Signal),
    /// A peer's ICE candidate, as sent.
    IceCandidate(Signal),
    /// A peer left the room.
    PeerLeft,
}

impl SignalEvent {
    /// Maps a server-to-client message onto an event. Returns `None` for
    /// kinds the relay never sends.
    #[must_use]
    pub fn from_signal(signal: Signal) -> Option<Self> {
        match signal.kind {
            SignalKind::Ready => Some(Self::Ready),
            SignalKind::PeerLeft => Some(Self::PeerLeft),
            SignalKind::Offer => Some(Self::Offer(signal)),
            SignalKind::Answer => Some(Self::Answer(signal)),
            SignalKind::IceCandidate => Some(Self::IceCandidate(signal)),
            SignalKind::Join | SignalKind::Leave => None,
        }
    }
}

/// WebSocket signaling client.
///
/// Created via [`SignalingClient::connect`], which establishes the WebSocket
/// connection and spawns a background reader task. Methods take `&self` so
/// a client can be shared between a sending and a receiving task.
pub struct SignalingClient {
    /// The relay server URL (ws:// or wss://).
    relay_url: String,
    /// Write half of the WebSocket connection (shared for concurrent sends).
    ws_sender: Arc<Mutex<WsSender>>,
    /// Events decoded by the background reader task.
    incoming: Mutex<mpsc::Receiver<SignalEvent>>,
    /// Whether the WebSocket connection to the relay is active.
    connected: Arc<AtomicBool>,
    /// Room joined most recently, used to tag negotiation messages.
    room: parking_lot::Mutex<Option<String>>,
    /// Handle to the background reader task (kept alive for the client's lifetime).
    _reader_handle: tokio::task::JoinHandle<()>,
}

impl SignalingClient {
    /// Connect to a relay server.
    ///
    /// # Errors
    ///
    /// - [`ClientError::InvalidUrl`] if `relay_url` is not a ws/wss URL.
    /// - [`ClientError::Timeout`] if the connection is not established in time.
    /// - [`ClientError::Unreachable`] if nothing is listening at the URL.
    /// - [`ClientError::Io`] for TLS, HTTP upgrade or other transport failures.
    pub async fn connect(relay_url: &str) -> Result<Self, ClientError> {
        let parsed =
            url::Url::parse(relay_url).map_err(|_| ClientError::InvalidUrl(relay_url.to_string()))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(ClientError::InvalidUrl(relay_url.to_string()));
        }

        let (ws_stream, _response) =
            tokio::time::timeout(CONNECT_TIMEOUT, connect_async(relay_url))
                .await
                .map_err(|_| {
                    tracing::warn!(url = relay_url, "relay WebSocket connect timed out");
                    ClientError::Timeout
                })?
                .map_err(|e| {
                    tracing::warn!(url = relay_url, err = %e, "relay WebSocket connect failed");
                    map_ws_connect_error(relay_url, e)
                })?;

        let (ws_sender, ws_reader) = ws_stream.split();

        let (tx, rx) = mpsc::channel(256);
        let connected = Arc::new(AtomicBool::new(true));
        let reader_handle = tokio::spawn(reader_loop(ws_reader, tx, Arc::clone(&connected)));

        tracing::info!(url = relay_url, "connected to signaling relay");

        Ok(Self {
            relay_url: relay_url.to_string(),
            ws_sender: Arc::new(Mutex::new(ws_sender)),
            incoming: Mutex::new(rx),
            connected,
            room: parking_lot::Mutex::new(None),
            _reader_handle: reader_handle,
        })
    }

    /// Join `room`. Existing members will be sent `ready`.
    ///
    /// Joining while already in a room moves this client to the new room.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConnectionClosed`] if the relay connection is down.
    pub async fn join(&self, room: &str) -> Result<(), ClientError> {
        self.send(&Signal::join(room)).await?;
        *self.room.lock() = Some(room.to_string());
        Ok(())
    }

    /// Send a session description offer to the other room members.
    ///
    /// # Errors
    ///
    /// [`ClientError::NotJoined`] before [`Self::join`];
    /// [`ClientError::ConnectionClosed`] if the relay connection is down.
    pub async fn send_offer(&self, description: Value) -> Result<(), ClientError> {
        let room = self.current_room()?;
        self.send(&Signal::offer(room, description)).await
    }

    /// Send a session description answer to the other room members.
    ///
    /// # Errors
    ///
    /// Same as [`Self::send_offer`].
    pub async fn send_answer(&self, description: Value) -> Result<(), ClientError> {
        let room = self.current_room()?;
        self.send(&Signal::answer(room, description)).await
    }

    /// Send an ICE candidate to the other room members.
    ///
    /// # Errors
    ///
    /// Same as [`Self::send_offer`].
    pub async fn send_ice_candidate(&self, candidate: Value) -> Result<(), ClientError> {
        let room = self.current_room()?;
        self.send(&Signal::ice_candidate(room, candidate)).await
    }

    /// Send any signal as a text frame.
    ///
    /// # Errors
    ///
    /// - [`ClientError::ConnectionClosed`] if the relay connection is down.
    /// - [`ClientError::Codec`] if the signal cannot be encoded.
    pub async fn send(&self, signal: &Signal) -> Result<(), ClientError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(ClientError::ConnectionClosed);
        }

        let text = codec::encode(signal)?;
        let mut sender = self.ws_sender.lock().await;
        sender.send(Message::Text(text.into())).await.map_err(|e| {
            tracing::warn!(err = %e, "relay send failed");
            self.connected.store(false, Ordering::Relaxed);
            ClientError::ConnectionClosed
        })
    }

    /// Leave the current room and close the connection.
    ///
    /// The relay tells the remaining members `peer-left` and then closes its
    /// side. Leaving without having joined just closes.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConnectionClosed`] if the relay connection was
    /// already down.
    pub async fn leave(&self) -> Result<(), ClientError> {
        let room = self.room.lock().take();
        let signal = room.map_or_else(|| Signal::new(SignalKind::Leave), Signal::leave);
        self.send(&signal).await?;
        self.close().await;
        Ok(())
    }

    /// Close the connection without sending `leave`. The relay treats this
    /// exactly like a `leave`.
    pub async fn close(&self) {
        self.connected.store(false, Ordering::Relaxed);
        let mut sender = self.ws_sender.lock().await;
        if let Err(e) = sender.close().await {
            tracing::debug!(err = %e, "error while closing relay connection");
        }
    }

    /// Receive the next event from the relay.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConnectionClosed`] once the connection has been
    /// lost and every already-received event has been consumed.
    pub async fn recv(&self) -> Result<SignalEvent, ClientError> {
        let mut rx = self.incoming.lock().await;
        rx.recv().await.ok_or(ClientError::ConnectionClosed)
    }

    /// Whether the connection to the relay is still open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// The room most recently joined, if any.
    pub fn room(&self) -> Option<String> {
        self.room.lock().clone()
    }

    /// Return the relay server URL this client is connected to.
    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }

    fn current_room(&self) -> Result<String, ClientError> {
        self.room.lock().clone().ok_or(ClientError::NotJoined)
    }
}

/// Background task that reads WebSocket frames and dispatches events.
///
/// Malformed frames are logged and skipped; the task does not disconnect on
/// bad data. Sets `connected` to `false` when the WebSocket closes or errors
/// out.
async fn reader_loop(
    mut ws_reader: WsReader,
    tx: mpsc::Sender<SignalEvent>,
    connected: Arc<AtomicBool>,
) {
    while let Some(msg_result) = ws_reader.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                let signal = match codec::decode(text.as_str()) {
                    Ok(signal) => signal,
                    Err(e) => {
                        tracing::warn!(err = %e, "malformed relay frame, skipping");
                        continue;
                    }
                };
                let kind = signal.kind;
                let Some(event) = SignalEvent::from_signal(signal) else {
                    tracing::debug!(kind = %kind, "unexpected signal from relay, skipping");
                    continue;
                };
                if tx.send(event).await.is_err() {
                    // Receiver dropped: the client was dropped, exit.
                    break;
                }
            }
            Ok(Message::Close(_)) => {
                tracing::info!("relay WebSocket closed by server");
                break;
            }
            Ok(Message::Binary(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Err(e) => {
                tracing::warn!(err = %e, "relay WebSocket read error");
                break;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
    tracing::info!("relay reader task exiting");
}

/// Map a `tokio_tungstenite` connection error to a [`ClientError`].
fn map_ws_connect_error(url: &str, err: tokio_tungstenite::tungstenite::Error) -> ClientError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                ClientError::Unreachable(url.to_string())
            } else {
                ClientError::Io(io_err)
            }
        }
        WsError::Http(response) => ClientError::Io(std::io::Error::other(format!(
            "relay HTTP error: status {}",
            response.status()
        ))),
        other => ClientError::Io(std::io::Error::other(format!(
            "relay connection error: {other}"
        ))),
    }
}
