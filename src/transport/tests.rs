use super::message::{ClientMessage, Handshake, ServerMessage, UpdatePayload};
use super::websocket::{Flow, handle_client_message};
use crate::config::Settings;
use crate::dispatcher::{Dispatcher, Peer};
use serde_json::json;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tungstenite::protocol::Message as WsMessage;

fn setup() -> (Mutex<Dispatcher>, String, mpsc::UnboundedReceiver<WsMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let peer = Peer::new(tx);
    let id = peer.id.clone();
    let mut dispatcher = Dispatcher::new();
    dispatcher.register_connection(peer);
    (Mutex::new(dispatcher), id, rx)
}

fn next_reply(rx: &mut mpsc::UnboundedReceiver<WsMessage>) -> ServerMessage {
    let frame = rx.try_recv().expect("expected a reply");
    serde_json::from_str(frame.to_text().unwrap()).unwrap()
}

fn handshake(dispatcher: &Mutex<Dispatcher>, id: &String, rx: &mut mpsc::UnboundedReceiver<WsMessage>) {
    let frame = json!({"event": "handshake", "data": {"auth": {"token": "abc"}}}).to_string();
    assert_eq!(
        handle_client_message(dispatcher, id, &frame, &Settings::default()),
        Flow::Continue
    );
    assert_eq!(next_reply(rx), ServerMessage::Connect);
}

#[test]
fn test_wire_format() {
    let join = serde_json::to_value(ClientMessage::JoinDate("2025-01-05".into())).unwrap();
    assert_eq!(join, json!({"event": "join:date", "data": "2025-01-05"}));

    let hs = serde_json::to_value(ClientMessage::Handshake(Handshake::bearer("t0k"))).unwrap();
    assert_eq!(hs, json!({"event": "handshake", "data": {"auth": {"token": "t0k"}}}));

    let connect: ServerMessage = serde_json::from_str(r#"{"event":"connect"}"#).unwrap();
    assert_eq!(connect, ServerMessage::Connect);

    let update: ServerMessage = serde_json::from_value(json!({
        "event": "delivery:update",
        "data": {"date": "2025-01-05", "data": {"id": "D1"}}
    }))
    .unwrap();
    assert_eq!(
        update,
        ServerMessage::DeliveryUpdate(UpdatePayload {
            date: "2025-01-05".into(),
            data: json!({"id": "D1"}),
        })
    );
}

#[test]
fn test_update_without_date_does_not_decode() {
    let result = serde_json::from_value::<ServerMessage>(json!({
        "event": "delivery:update",
        "data": {"data": {"id": "D1"}}
    }));
    assert!(result.is_err());
}

#[test]
fn test_handshake_then_join() {
    let (dispatcher, id, mut rx) = setup();
    handshake(&dispatcher, &id, &mut rx);

    let frame = json!({"event": "join:date", "data": "2025-01-05"}).to_string();
    handle_client_message(&dispatcher, &id, &frame, &Settings::default());

    let dispatcher = dispatcher.lock().unwrap();
    assert!(dispatcher.topics["2025-01-05"].subscribers.contains(&id));
}

#[test]
fn test_join_before_handshake_closes() {
    let (dispatcher, id, mut rx) = setup();

    let frame = json!({"event": "join:date", "data": "2025-01-05"}).to_string();
    let flow = handle_client_message(&dispatcher, &id, &frame, &Settings::default());

    assert_eq!(flow, Flow::Close);
    assert!(matches!(next_reply(&mut rx), ServerMessage::ConnectError { .. }));
    assert!(dispatcher.lock().unwrap().topics.is_empty());
}

#[test]
fn test_empty_token_is_rejected() {
    let (dispatcher, id, mut rx) = setup();

    let frame = json!({"event": "handshake", "data": {"auth": {"token": "  "}}}).to_string();
    let flow = handle_client_message(&dispatcher, &id, &frame, &Settings::default());

    assert_eq!(flow, Flow::Close);
    assert!(matches!(next_reply(&mut rx), ServerMessage::ConnectError { .. }));
}

#[test]
fn test_configured_token_must_match() {
    let (dispatcher, id, mut rx) = setup();
    let mut settings = Settings::default();
    settings.server.auth_token = Some("backend-secret".to_string());

    let wrong = json!({"event": "handshake", "data": {"auth": {"token": "guess"}}}).to_string();
    assert_eq!(
        handle_client_message(&dispatcher, &id, &wrong, &settings),
        Flow::Close
    );
    assert!(matches!(next_reply(&mut rx), ServerMessage::ConnectError { .. }));

    let right =
        json!({"event": "handshake", "data": {"auth": {"token": "backend-secret"}}}).to_string();
    assert_eq!(
        handle_client_message(&dispatcher, &id, &right, &settings),
        Flow::Continue
    );
    assert_eq!(next_reply(&mut rx), ServerMessage::Connect);
}

#[test]
fn test_invalid_date_gets_error_reply() {
    let (dispatcher, id, mut rx) = setup();
    handshake(&dispatcher, &id, &mut rx);

    let frame = json!({"event": "join:date", "data": "next week"}).to_string();
    let flow = handle_client_message(&dispatcher, &id, &frame, &Settings::default());

    assert_eq!(flow, Flow::Continue);
    assert!(matches!(next_reply(&mut rx), ServerMessage::Error { .. }));
}

#[test]
fn test_garbage_frame_gets_error_reply() {
    let (dispatcher, id, mut rx) = setup();

    let flow = handle_client_message(&dispatcher, &id, "{not json", &Settings::default());

    assert_eq!(flow, Flow::Continue);
    assert!(matches!(next_reply(&mut rx), ServerMessage::Error { .. }));
}

#[test]
fn test_publish_is_fanned_out_to_joined_connections() {
    let (dispatcher, id, mut rx) = setup();
    handshake(&dispatcher, &id, &mut rx);

    let join = json!({"event": "join:date", "data": "2025-03-10"}).to_string();
    handle_client_message(&dispatcher, &id, &join, &Settings::default());

    let publish = json!({
        "event": "delivery:publish",
        "data": {"date": "2025-03-10", "data": {"id": "D1"}}
    })
    .to_string();
    handle_client_message(&dispatcher, &id, &publish, &Settings::default());

    match next_reply(&mut rx) {
        ServerMessage::DeliveryUpdate(payload) => {
            assert_eq!(payload.date, "2025-03-10");
            assert_eq!(payload.data, json!({"id": "D1"}));
        }
        other => panic!("unexpected message {other:?}"),
    }
}
