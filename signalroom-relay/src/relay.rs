//! Relay server core: shared state, WebSocket handler, per-connection
//! session, and message fan-out.
//!
//! Each accepted WebSocket gets a [`ConnectionId`] and two tasks: a reader
//! that feeds text frames through its [`Session`], and a writer that drains
//! the connection's outbound channel. The only state shared between
//! connections is the [`RelayState`]: the outbound channels by connection id
//! and the [`RoomDirectory`].
//!
//! Delivery is best-effort. A recipient whose channel is closed is skipped,
//! nothing is queued or retried, and the sender never gets an
//! acknowledgment. Connections that never leave or close stay members
//! indefinitely; there is no idle timeout.

use std::collections::HashMap;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use futures_util::{SinkExt, StreamExt};
use signalroom_proto::codec;
use signalroom_proto::{Signal, SignalKind};
use tokio::sync::{RwLock, mpsc};

use crate::rooms::{ConnectionId, Departure, RoomDirectory};

/// Default maximum accepted size of an inbound text frame (64 KB).
const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// How long a closing connection's writer may take to flush queued frames.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared relay server state holding the connection registry and room directory.
pub struct RelayState {
    /// Maps `ConnectionId` to a channel sender for delivering WebSocket messages.
    connections: RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<Message>>>,
    /// Room membership for every joined connection.
    pub rooms: RoomDirectory,
    /// Maximum accepted inbound text frame size in bytes.
    max_message_size: usize,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    /// Creates a new relay state with no connections, no rooms and the
    /// default message size limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Creates a new relay state with a custom inbound message size limit.
    #[must_use]
    pub fn with_config(max_message_size: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            rooms: RoomDirectory::new(),
            max_message_size,
        }
    }

    /// Maximum accepted inbound text frame size in bytes.
    #[must_use]
    pub const fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Registers a connection's outbound channel.
    pub async fn register(&self, conn_id: ConnectionId, sender: mpsc::UnboundedSender<Message>) {
        let mut conns = self.connections.write().await;
        conns.insert(conn_id, sender);
    }

    /// Removes a connection from the registry, returning its sender if it
    /// was registered.
    pub async fn unregister(&self, conn_id: ConnectionId) -> Option<mpsc::UnboundedSender<Message>> {
        let mut conns = self.connections.write().await;
        conns.remove(&conn_id)
    }

    /// Number of registered connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Sends `msg` to each of `recipients`, returning how many accepted it.
    ///
    /// Recipients that are unregistered or whose writer has gone away are
    /// skipped without affecting the others. This is the single place a
    /// delivery guarantee (acks, retries) would be added.
    pub async fn deliver(&self, recipients: &[ConnectionId], msg: &Message) -> usize {
        let senders: Vec<(ConnectionId, mpsc::UnboundedSender<Message>)> = {
            let conns = self.connections.read().await;
            recipients
                .iter()
                .filter_map(|id| conns.get(id).map(|tx| (*id, tx.clone())))
                .collect()
        };

        let mut delivered = 0;
        for (conn_id, sender) in senders {
            if sender.is_closed() || sender.send(msg.clone()).is_err() {
                tracing::debug!(conn_id = %conn_id, "recipient not open, skipping");
                continue;
            }
            delivered += 1;
        }
        delivered
    }

    /// Send a WebSocket Close frame to all connected clients.
    ///
    /// Each connection's writer forwards the close frame, the client closes
    /// its side, and the usual disconnect cleanup runs. Used for graceful
    /// shutdown.
    pub async fn close_all_connections(&self) {
        let conns = self.connections.read().await;
        for (conn_id, sender) in conns.iter() {
            tracing::info!(conn_id = %conn_id, "sending close frame");
            let _ = sender.send(Message::Close(None));
        }
    }
}

/// Lifecycle of one connection as seen by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, not in any room.
    Unjoined,
    /// Member of the named room.
    Joined(String),
    /// Left or disconnected; no further messages are processed.
    Terminated,
}

/// Per-connection message handler driving the [`SessionState`] machine.
///
/// Owned by the connection's reader task. All membership changes go through
/// the shared [`RoomDirectory`].
#[derive(Debug)]
pub struct Session {
    conn_id: ConnectionId,
    state: SessionState,
}

impl Session {
    /// Creates a session in the [`SessionState::Unjoined`] state.
    #[must_use]
    pub const fn new(conn_id: ConnectionId) -> Self {
        Self {
            conn_id,
            state: SessionState::Unjoined,
        }
    }

    /// This session's connection id.
    #[must_use]
    pub const fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> &SessionState {
        &self.state
    }

    /// Joins `room`, leaving the current room first if there is one.
    ///
    /// Existing members of `room` each get a `ready`; the joiner gets nothing.
    pub async fn join(&mut self, room: &str, state: &RelayState) {
        let outcome = state.rooms.join(self.conn_id, room).await;

        if let Some(previous) = outcome.previous {
            tracing::info!(
                conn_id = %self.conn_id,
                from = %previous.room,
                to = %room,
                "connection switching rooms"
            );
            notify_departure(state, self.conn_id, &previous).await;
        }

        tracing::info!(
            conn_id = %self.conn_id,
            room = %room,
            peers = outcome.peers.len() + 1,
            "connection joined room"
        );
        send_signal(state, &outcome.peers, &Signal::ready()).await;
        self.state = SessionState::Joined(room.to_string());
    }

    /// Forwards a negotiation frame verbatim to every other member of the
    /// session's room. Dropped silently if the session has not joined.
    pub async fn forward(&self, kind: SignalKind, text: Utf8Bytes, state: &RelayState) {
        let Some(fanout) = state.rooms.peers_of(self.conn_id).await else {
            tracing::debug!(conn_id = %self.conn_id, kind = %kind, "not in a room, dropping");
            return;
        };

        let delivered = state.deliver(&fanout.peers, &Message::Text(text)).await;
        tracing::debug!(
            conn_id = %self.conn_id,
            room = %fanout.room,
            kind = %kind,
            delivered = delivered,
            "forwarded signal"
        );
    }

    /// Leaves the current room (if any) and terminates the session.
    ///
    /// Performs the same cleanup whether triggered by an explicit `leave` or
    /// by the transport closing. Calling it again is a no-op.
    pub async fn terminate(&mut self, state: &RelayState) {
        if self.state == SessionState::Terminated {
            return;
        }
        depart(state, self.conn_id).await;
        self.state = SessionState::Terminated;
    }
}

/// Removes a connection from its room and tells the remaining members.
///
/// Returns the departure, or `None` if the connection was not in a room.
pub async fn depart(state: &RelayState, conn_id: ConnectionId) -> Option<Departure> {
    let departure = state.rooms.leave(conn_id).await?;
    notify_departure(state, conn_id, &departure).await;
    Some(departure)
}

async fn notify_departure(state: &RelayState, conn_id: ConnectionId, departure: &Departure) {
    tracing::info!(
        conn_id = %conn_id,
        room = %departure.room,
        remaining = departure.remaining.len(),
        "connection left room"
    );
    if departure.room_closed() {
        tracing::info!(room = %departure.room, "room empty, removed");
    }
    send_signal(state, &departure.remaining, &Signal::peer_left()).await;
}

/// Encodes a server notice and delivers it to `recipients`.
async fn send_signal(state: &RelayState, recipients: &[ConnectionId], signal: &Signal) {
    if recipients.is_empty() {
        return;
    }
    match codec::encode(signal) {
        Ok(text) => {
            state.deliver(recipients, &Message::Text(text.into())).await;
        }
        Err(e) => {
            tracing::error!(error = %e, kind = %signal.kind, "failed to encode server notice");
        }
    }
}

/// Handles one text frame from a connection.
///
/// Malformed, oversized or unexpected frames are logged and dropped; the
/// connection carries on. Returns [`ControlFlow::Break`] once the session is
/// terminated and the connection should be closed.
pub async fn handle_text_message(
    session: &mut Session,
    text: Utf8Bytes,
    state: &RelayState,
) -> ControlFlow<()> {
    let conn_id = session.conn_id();

    if *session.state() == SessionState::Terminated {
        tracing::debug!(conn_id = %conn_id, "session terminated, ignoring message");
        return ControlFlow::Break(());
    }

    if text.len() > state.max_message_size {
        tracing::warn!(
            conn_id = %conn_id,
            size = text.len(),
            max = state.max_message_size,
            "message exceeds size limit, dropping"
        );
        return ControlFlow::Continue(());
    }

    let signal = match codec::decode(text.as_str()) {
        Ok(signal) => signal,
        Err(e) => {
            tracing::warn!(conn_id = %conn_id, error = %e, "dropping malformed message");
            return ControlFlow::Continue(());
        }
    };

    match signal.kind {
        SignalKind::Join => {
            // `decode` guarantees a non-empty room on joins.
            if let Some(room) = signal.room {
                session.join(&room, state).await;
            }
            ControlFlow::Continue(())
        }
        SignalKind::Offer | SignalKind::Answer | SignalKind::IceCandidate => {
            session.forward(signal.kind, text, state).await;
            ControlFlow::Continue(())
        }
        SignalKind::Leave => {
            session.terminate(state).await;
            ControlFlow::Break(())
        }
        SignalKind::Ready | SignalKind::PeerLeft => {
            tracing::warn!(
                conn_id = %conn_id,
                kind = %signal.kind,
                "client sent a server-only message, dropping"
            );
            ControlFlow::Continue(())
        }
    }
}

/// Handles an upgraded WebSocket connection.
///
/// The connection lifecycle:
/// 1. Allocate a `ConnectionId` and register the outbound channel.
/// 2. Spawn a writer task draining the channel into the socket.
/// 3. Read frames through the connection's [`Session`] until `leave`, a
///    close frame, or a transport error.
/// 4. Leave the room (if still in one), notifying the remaining members,
///    and unregister.
pub async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let conn_id = ConnectionId::new();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    state.register(conn_id, tx.clone()).await;
    tracing::info!(conn_id = %conn_id, "connection opened");

    // Writer: forwards messages from the channel to the WebSocket. Stops
    // after sending a close frame.
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = ws_sender.send(msg).await {
                tracing::warn!(conn_id = %conn_id, error = %e, "WebSocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    // Reader: process incoming frames in arrival order.
    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        let mut session = Session::new(conn_id);
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    if handle_text_message(&mut session, text, &reader_state)
                        .await
                        .is_break()
                    {
                        let _ = tx.send(Message::Close(None));
                        break;
                    }
                }
                Message::Binary(data) => {
                    tracing::warn!(
                        conn_id = %conn_id,
                        size = data.len(),
                        "binary frames are not part of the protocol, dropping"
                    );
                }
                Message::Close(_) => {
                    tracing::info!(conn_id = %conn_id, "received close frame");
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
        session.terminate(&reader_state).await;
    });

    tokio::select! {
        _ = &mut read_task => {
            // Let the writer flush what is already queued, then stop it.
            state.unregister(conn_id).await;
            if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut write_task).await.is_err() {
                write_task.abort();
            }
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    // Covers a reader aborted before it could clean up.
    depart(&state, conn_id).await;
    state.unregister(conn_id).await;
    tracing::info!(conn_id = %conn_id, "connection closed");
}

/// Starts the relay server on the given address and returns the bound address
/// and a join handle.
///
/// This is the primary entry point used by test code.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(RelayState::new())).await
}

/// Starts the relay server with a pre-configured [`RelayState`].
///
/// Use [`RelayState::with_config`] to create a state with a custom message
/// size limit from the resolved [`crate::config::RelayConfig`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_shutdown(addr, state, std::future::pending()).await
}

/// Starts the relay server and stops it gracefully once `shutdown` resolves.
///
/// Every path on the listener upgrades to the signaling WebSocket; there is
/// no routing by path.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_shutdown<F>(
    addr: &str,
    state: Arc<RelayState>,
    shutdown: F,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = axum::Router::new()
        .fallback(ws_handler)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::error!(error = %e, "relay server error");
        }
    });

    Ok((bound_addr, handle))
}

/// Resolves on Ctrl-C after sending a close frame to every connection.
pub async fn shutdown_signal(state: Arc<RelayState>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    tracing::info!("shutdown requested, closing connections");
    state.close_all_connections().await;
}

/// Starts the relay server in-process for testing.
///
/// Binds to `127.0.0.1:0` (OS-assigned port) and returns the bound address
/// and a [`tokio::task::JoinHandle`] for cleanup.
#[cfg(test)]
pub async fn start_test_server(
    state: Arc<RelayState>,
) -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    start_server_with_state("127.0.0.1:0", state)
        .await
        .expect("failed to start test server")
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<RelayState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
