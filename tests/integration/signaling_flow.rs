//! Integration tests for room signaling through the relay.
//!
//! Runs the relay in-process and drives it with [`SignalingClient`]s and raw
//! WebSocket connections: join and `ready`, offer/answer/candidate fan-out,
//! departure notification, and resilience to malformed frames.
//!
//! Verification command: `cargo test --test signaling_flow`

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::tungstenite;

use signalroom_client::{SignalEvent, SignalingClient};
use signalroom_relay::relay::{RelayState, start_server_with_state};

// =============================================================================
// Helpers
// =============================================================================

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Starts a relay on a random port and returns its URL and shared state.
async fn start_relay() -> (String, Arc<RelayState>, tokio::task::JoinHandle<()>) {
    let state = Arc::new(RelayState::new());
    let (addr, handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start test relay");
    (format!("ws://{addr}"), state, handle)
}

async fn connect(url: &str) -> SignalingClient {
    SignalingClient::connect(url)
        .await
        .expect("client failed to connect")
}

async fn next_event(client: &SignalingClient) -> SignalEvent {
    tokio::time::timeout(Duration::from_secs(5), client.recv())
        .await
        .expect("timed out waiting for event")
        .expect("connection closed while waiting for event")
}

/// Asserts that nothing arrives for a short while.
async fn assert_no_event(client: &SignalingClient) {
    let result = tokio::time::timeout(Duration::from_millis(150), client.recv()).await;
    assert!(result.is_err(), "unexpected event: {result:?}");
}

/// Polls the relay until `room` has `count` members (0 meaning the room is gone).
async fn wait_for_members(state: &RelayState, room: &str, count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let current = state.rooms.members(room).await.map_or(0, |m| m.len());
        if current == count {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "room {room} has {current} members, expected {count}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn raw_connect(url: &str) -> WsStream {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

async fn raw_send(ws: &mut WsStream, text: &str) {
    ws.send(tungstenite::Message::Text(text.to_string().into()))
        .await
        .unwrap();
}

// =============================================================================
// Two-peer negotiation
// =============================================================================

#[tokio::test]
async fn two_peers_negotiate_and_part() {
    let (url, state, _handle) = start_relay().await;

    let alice = connect(&url).await;
    alice.join("r1").await.unwrap();
    wait_for_members(&state, "r1", 1).await;

    let bob = connect(&url).await;
    bob.join("r1").await.unwrap();

    // Existing member is told to start negotiating; the joiner is not.
    assert_eq!(next_event(&alice).await, SignalEvent::Ready);
    wait_for_members(&state, "r1", 2).await;
    assert_no_event(&bob).await;

    bob.send_offer(json!({"sdp": "X"})).await.unwrap();
    match next_event(&alice).await {
        SignalEvent::Offer(signal) => {
            assert_eq!(signal.body(), Some(&json!({"sdp": "X"})));
            assert_eq!(signal.room.as_deref(), Some("r1"));
        }
        other => panic!("expected offer, got {other:?}"),
    }

    alice.send_answer(json!({"sdp": "Y"})).await.unwrap();
    match next_event(&bob).await {
        SignalEvent::Answer(signal) => assert_eq!(signal.body(), Some(&json!({"sdp": "Y"}))),
        other => panic!("expected answer, got {other:?}"),
    }

    alice.close().await;
    assert_eq!(next_event(&bob).await, SignalEvent::PeerLeft);
    wait_for_members(&state, "r1", 1).await;

    bob.close().await;
    wait_for_members(&state, "r1", 0).await;
    assert!(!state.rooms.contains("r1").await);
}

#[tokio::test]
async fn candidates_are_not_echoed_to_sender() {
    let (url, state, _handle) = start_relay().await;

    let alice = connect(&url).await;
    let bob = connect(&url).await;
    alice.join("r1").await.unwrap();
    wait_for_members(&state, "r1", 1).await;
    bob.join("r1").await.unwrap();
    assert_eq!(next_event(&alice).await, SignalEvent::Ready);

    let candidate = json!({"candidate": "candidate:1 1 udp 2122260223 10.0.0.1 54321 typ host"});
    bob.send_ice_candidate(candidate.clone()).await.unwrap();

    match next_event(&alice).await {
        SignalEvent::IceCandidate(signal) => assert_eq!(signal.body(), Some(&candidate)),
        other => panic!("expected ice candidate, got {other:?}"),
    }
    assert_no_event(&bob).await;
}

// =============================================================================
// Fan-out and isolation
// =============================================================================

#[tokio::test]
async fn offer_fans_out_to_every_other_member() {
    let (url, state, _handle) = start_relay().await;

    let a = connect(&url).await;
    let b = connect(&url).await;
    let c = connect(&url).await;

    a.join("mesh").await.unwrap();
    wait_for_members(&state, "mesh", 1).await;
    b.join("mesh").await.unwrap();
    assert_eq!(next_event(&a).await, SignalEvent::Ready);
    wait_for_members(&state, "mesh", 2).await;
    c.join("mesh").await.unwrap();
    assert_eq!(next_event(&a).await, SignalEvent::Ready);
    assert_eq!(next_event(&b).await, SignalEvent::Ready);

    c.send_offer(json!({"sdp": "from-c"})).await.unwrap();

    for peer in [&a, &b] {
        assert!(matches!(next_event(peer).await, SignalEvent::Offer(_)));
    }
    assert_no_event(&c).await;
}

#[tokio::test]
async fn rooms_are_isolated() {
    let (url, state, _handle) = start_relay().await;

    let a = connect(&url).await;
    let b = connect(&url).await;
    let x = connect(&url).await;
    let y = connect(&url).await;

    a.join("alpha").await.unwrap();
    x.join("beta").await.unwrap();
    wait_for_members(&state, "alpha", 1).await;
    wait_for_members(&state, "beta", 1).await;

    b.join("alpha").await.unwrap();
    y.join("beta").await.unwrap();
    assert_eq!(next_event(&a).await, SignalEvent::Ready);
    assert_eq!(next_event(&x).await, SignalEvent::Ready);

    b.send_offer(json!({"sdp": "alpha-only"})).await.unwrap();
    assert!(matches!(next_event(&a).await, SignalEvent::Offer(_)));
    assert_no_event(&x).await;
    assert_no_event(&y).await;
}

// =============================================================================
// Departure
// =============================================================================

#[tokio::test]
async fn explicit_leave_matches_disconnect() {
    let (url, state, _handle) = start_relay().await;

    let stay = connect(&url).await;
    stay.join("r1").await.unwrap();
    wait_for_members(&state, "r1", 1).await;

    // Polite departure.
    let polite = connect(&url).await;
    polite.join("r1").await.unwrap();
    assert_eq!(next_event(&stay).await, SignalEvent::Ready);
    polite.leave().await.unwrap();
    assert_eq!(next_event(&stay).await, SignalEvent::PeerLeft);
    wait_for_members(&state, "r1", 1).await;

    // Abrupt departure: the socket is dropped without a leave.
    let mut abrupt = raw_connect(&url).await;
    raw_send(&mut abrupt, r#"{"type":"join","room":"r1"}"#).await;
    assert_eq!(next_event(&stay).await, SignalEvent::Ready);
    wait_for_members(&state, "r1", 2).await;
    drop(abrupt);
    assert_eq!(next_event(&stay).await, SignalEvent::PeerLeft);
    wait_for_members(&state, "r1", 1).await;

    assert_eq!(state.rooms.room_count().await, 1);
}

#[tokio::test]
async fn relay_closes_connection_after_leave() {
    let (url, state, _handle) = start_relay().await;

    let client = connect(&url).await;
    client.join("r1").await.unwrap();
    wait_for_members(&state, "r1", 1).await;

    let mut raw = raw_connect(&url).await;
    raw_send(&mut raw, r#"{"type":"join","room":"r1"}"#).await;
    assert_eq!(next_event(&client).await, SignalEvent::Ready);
    raw_send(&mut raw, r#"{"type":"leave","room":"r1"}"#).await;

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(frame) = raw.next().await {
            match frame {
                Ok(tungstenite::Message::Close(_)) | Err(_) => return true,
                Ok(_) => {}
            }
        }
        true
    })
    .await
    .expect("relay did not close the connection");
    assert!(closed);
    assert_eq!(next_event(&client).await, SignalEvent::PeerLeft);
}

#[tokio::test]
async fn switching_rooms_notifies_old_room() {
    let (url, state, _handle) = start_relay().await;

    let stay = connect(&url).await;
    let mover = connect(&url).await;
    stay.join("old").await.unwrap();
    wait_for_members(&state, "old", 1).await;
    mover.join("old").await.unwrap();
    assert_eq!(next_event(&stay).await, SignalEvent::Ready);

    mover.join("new").await.unwrap();

    assert_eq!(next_event(&stay).await, SignalEvent::PeerLeft);
    wait_for_members(&state, "new", 1).await;
    wait_for_members(&state, "old", 1).await;
    assert_eq!(mover.room().as_deref(), Some("new"));
}

// =============================================================================
// Malformed input
// =============================================================================

#[tokio::test]
async fn malformed_frames_are_dropped_without_disconnecting() {
    let (url, state, _handle) = start_relay().await;

    let peer = connect(&url).await;
    peer.join("r1").await.unwrap();
    wait_for_members(&state, "r1", 1).await;

    let mut raw = raw_connect(&url).await;
    raw_send(&mut raw, r#"{"type":"join","room":"r1"}"#).await;
    assert_eq!(next_event(&peer).await, SignalEvent::Ready);

    raw_send(&mut raw, "{{{ not json").await;
    raw_send(&mut raw, r#"{"type":"teleport"}"#).await;
    raw_send(&mut raw, r#"{"type":"ready"}"#).await;
    raw_send(&mut raw, r#"{"no_type":true}"#).await;
    raw.send(tungstenite::Message::Binary(vec![1, 2, 3].into()))
        .await
        .unwrap();
    assert_no_event(&peer).await;

    // The malformed sender is still connected and still in the room.
    raw_send(&mut raw, r#"{"type":"offer","offer":{"sdp":"still-here"}}"#).await;
    match next_event(&peer).await {
        SignalEvent::Offer(signal) => {
            assert_eq!(signal.body(), Some(&json!({"sdp": "still-here"})));
        }
        other => panic!("expected offer, got {other:?}"),
    }
    wait_for_members(&state, "r1", 2).await;
}

#[tokio::test]
async fn join_without_room_is_ignored() {
    let (url, state, _handle) = start_relay().await;

    let mut raw = raw_connect(&url).await;
    raw_send(&mut raw, r#"{"type":"join"}"#).await;
    raw_send(&mut raw, r#"{"type":"join","room":""}"#).await;

    // Still connected: a valid join afterwards works.
    raw_send(&mut raw, r#"{"type":"join","room":"late"}"#).await;
    wait_for_members(&state, "late", 1).await;
    assert_eq!(state.rooms.room_count().await, 1);
}

#[tokio::test]
async fn negotiation_before_join_reaches_nobody() {
    let (url, state, _handle) = start_relay().await;

    let member = connect(&url).await;
    member.join("r1").await.unwrap();
    wait_for_members(&state, "r1", 1).await;

    let mut outsider = raw_connect(&url).await;
    raw_send(&mut outsider, r#"{"type":"offer","room":"r1","offer":{"sdp":"Z"}}"#).await;

    assert_no_event(&member).await;
    wait_for_members(&state, "r1", 1).await;
}
