//! Relay tests against real websocket connections: room lifecycle,
//! envelope forwarding, and disconnect propagation.

use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use portal_core::signaling::{RoomCode, SignalEvent, SignalMsg, SignalingClient};
use portal_relay::Relay;

async fn start_relay() -> String {
    let relay = Relay::bind("127.0.0.1:0").await.expect("bind relay");
    let addr = relay.local_addr().expect("relay addr");
    tokio::spawn(relay.run());
    format!("ws://{addr}")
}

async fn next_msg(rx: &mut mpsc::UnboundedReceiver<SignalEvent>) -> SignalMsg {
    let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for envelope")
        .expect("signaling stream ended");
    match event {
        SignalEvent::Message(msg) => msg,
        SignalEvent::Closed => panic!("signaling connection closed unexpectedly"),
    }
}

/// Create a room on one client and join it from another.
async fn paired(
    addr: &str,
) -> (
    SignalingClient,
    mpsc::UnboundedReceiver<SignalEvent>,
    SignalingClient,
    mpsc::UnboundedReceiver<SignalEvent>,
    RoomCode,
) {
    let (creator, mut creator_rx) = SignalingClient::connect(addr).await.expect("creator");
    let code = creator.create_room().expect("create room");
    match next_msg(&mut creator_rx).await {
        SignalMsg::RoomCreated { room_code } => assert_eq!(room_code, code),
        other => panic!("expected room-created, got {other:?}"),
    }

    let (joiner, mut joiner_rx) = SignalingClient::connect(addr).await.expect("joiner");
    joiner.join_room(code.as_str()).expect("join room");
    assert!(matches!(
        next_msg(&mut joiner_rx).await,
        SignalMsg::RoomJoined { .. }
    ));
    assert!(matches!(
        next_msg(&mut creator_rx).await,
        SignalMsg::PeerJoined { .. }
    ));

    (creator, creator_rx, joiner, joiner_rx, code)
}

#[tokio::test]
async fn create_then_join_pairs_two_clients() {
    let addr = start_relay().await;
    let _ = paired(&addr).await;
}

#[tokio::test]
async fn joining_a_missing_room_is_an_error() {
    let addr = start_relay().await;
    let (client, mut rx) = SignalingClient::connect(&addr).await.expect("client");
    client.join_room("ZZZZ99").expect("join request");
    match next_msg(&mut rx).await {
        SignalMsg::Error { message } => assert!(message.contains("not found"), "{message}"),
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn creating_a_duplicate_room_is_an_error() {
    let addr = start_relay().await;
    let (creator, mut creator_rx) = SignalingClient::connect(&addr).await.expect("creator");
    let code = creator.create_room().expect("create");
    assert!(matches!(
        next_msg(&mut creator_rx).await,
        SignalMsg::RoomCreated { .. }
    ));

    let (other, mut other_rx) = SignalingClient::connect(&addr).await.expect("other");
    other.send(SignalMsg::CreateRoom { room_code: code });
    match next_msg(&mut other_rx).await {
        SignalMsg::Error { message } => assert!(message.contains("already exists"), "{message}"),
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn a_third_client_cannot_join_a_full_room() {
    let addr = start_relay().await;
    let (_creator, _creator_rx, _joiner, _joiner_rx, code) = paired(&addr).await;

    let (third, mut third_rx) = SignalingClient::connect(&addr).await.expect("third");
    third.join_room(code.as_str()).expect("join request");
    match next_msg(&mut third_rx).await {
        SignalMsg::Error { message } => assert!(message.contains("full"), "{message}"),
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn negotiation_envelopes_are_forwarded_verbatim() {
    let addr = start_relay().await;
    let (creator, mut creator_rx, joiner, mut joiner_rx, code) = paired(&addr).await;

    creator.send(SignalMsg::Offer {
        room_code: code.clone(),
        payload: json!({"type": "offer", "sdp": "v=0 creator"}),
    });
    match next_msg(&mut joiner_rx).await {
        SignalMsg::Offer { payload, .. } => assert_eq!(payload["sdp"], "v=0 creator"),
        other => panic!("expected offer, got {other:?}"),
    }

    joiner.send(SignalMsg::Answer {
        room_code: code.clone(),
        payload: json!({"type": "answer", "sdp": "v=0 joiner"}),
    });
    match next_msg(&mut creator_rx).await {
        SignalMsg::Answer { payload, .. } => assert_eq!(payload["sdp"], "v=0 joiner"),
        other => panic!("expected answer, got {other:?}"),
    }

    joiner.send(SignalMsg::IceCandidate {
        room_code: code,
        payload: json!({"candidate": "candidate:1 1 UDP 2122252543 ..."}),
    });
    assert!(matches!(
        next_msg(&mut creator_rx).await,
        SignalMsg::IceCandidate { .. }
    ));
}

#[tokio::test]
async fn a_connection_holds_at_most_one_room() {
    let addr = start_relay().await;
    let (creator, mut creator_rx) = SignalingClient::connect(&addr).await.expect("creator");
    creator.create_room().expect("create");
    assert!(matches!(
        next_msg(&mut creator_rx).await,
        SignalMsg::RoomCreated { .. }
    ));

    // A second create from the same connection is refused...
    let second = RoomCode::parse("AAAA11").expect("code");
    creator.send(SignalMsg::CreateRoom {
        room_code: second.clone(),
    });
    match next_msg(&mut creator_rx).await {
        SignalMsg::Error { message } => assert!(message.contains("already in a room"), "{message}"),
        other => panic!("expected error, got {other:?}"),
    }

    // ...and registers nothing.
    let (outsider, mut outsider_rx) = SignalingClient::connect(&addr).await.expect("client");
    outsider.join_room(second.as_str()).expect("join request");
    match next_msg(&mut outsider_rx).await {
        SignalMsg::Error { message } => assert!(message.contains("not found"), "{message}"),
        other => panic!("expected error, got {other:?}"),
    }

    // Joining another room while holding one is refused too.
    let other_code = outsider.create_room().expect("create");
    assert!(matches!(
        next_msg(&mut outsider_rx).await,
        SignalMsg::RoomCreated { .. }
    ));
    creator.send(SignalMsg::JoinRoom {
        room_code: other_code,
    });
    match next_msg(&mut creator_rx).await {
        SignalMsg::Error { message } => assert!(message.contains("already in a room"), "{message}"),
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn hangup_notifies_the_counterpart_and_frees_the_code() {
    let addr = start_relay().await;
    let (creator, mut creator_rx, joiner, joiner_rx, code) = paired(&addr).await;

    drop(joiner);
    drop(joiner_rx);
    assert!(matches!(
        next_msg(&mut creator_rx).await,
        SignalMsg::PeerDisconnected { .. }
    ));
    drop(creator);
    drop(creator_rx);

    // The room is gone, so the code can be reused.
    let (fresh, mut fresh_rx) = SignalingClient::connect(&addr).await.expect("fresh");
    fresh.send(SignalMsg::CreateRoom { room_code: code });
    assert!(matches!(
        next_msg(&mut fresh_rx).await,
        SignalMsg::RoomCreated { .. }
    ));
}
