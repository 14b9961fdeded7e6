//! WebSocket server
//!
//! Accepts dashboard and backend connections and translates protocol frames
//! into dispatcher operations:
//! - every connection gets a `Peer` registered with the `Dispatcher`
//! - the first frame must be a handshake carrying `auth.token`
//! - after the handshake, `join:date` / `leave:date` manage topic membership
//!   and `delivery:publish` fans a mutation out to the joined connections
//!
//! A writer task per connection drains the peer's channel into the socket so
//! the dispatcher lock is never held across network I/O.

use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::config::Settings;
use crate::dispatcher::{Dispatcher, Peer};
use crate::transport::message::{ClientMessage, Handshake, ServerMessage};
use crate::utils::FeedError;

/// What the read loop does after a frame.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Close,
}

pub async fn start_websocket_server(
    addr: String,
    dispatcher: Arc<Mutex<Dispatcher>>,
    settings: Settings,
) -> Result<(), FeedError> {
    let listener = TcpListener::bind(&addr).await?;
    serve(listener, dispatcher, settings).await
}

/// Runs the accept loop on an already bound listener.
pub async fn serve(
    listener: TcpListener,
    dispatcher: Arc<Mutex<Dispatcher>>,
    settings: Settings,
) -> Result<(), FeedError> {
    info!("WebSocket server listening on ws://{}", listener.local_addr()?);

    loop {
        let (stream, remote) = listener.accept().await?;
        debug!("accepted TCP connection from {remote}");
        tokio::spawn(handle_connection(
            stream,
            dispatcher.clone(),
            settings.clone(),
        ));
    }
}

async fn handle_connection(stream: TcpStream, dispatcher: Arc<Mutex<Dispatcher>>, settings: Settings) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake error: {e}");
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let peer = Peer::new(tx);
    let conn_id = peer.id.clone();
    lock(&dispatcher).register_connection(peer);

    let writer = {
        let conn_id = conn_id.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = ws_sender.send(msg).await {
                    warn!("failed to send to {conn_id}: {e}");
                    break;
                }
            }
            let _ = ws_sender.close().await;
            debug!("send loop closed for {conn_id}");
        })
    };

    while let Some(frame) = ws_receiver.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(e) => {
                warn!("read error on {conn_id}: {e}");
                break;
            }
        };
        if msg.is_close() {
            break;
        }
        if !msg.is_text() {
            continue;
        }
        let Ok(text) = msg.to_text() else {
            continue;
        };
        if handle_client_message(&dispatcher, &conn_id, text, &settings) == Flow::Close {
            break;
        }
    }

    // Dropping the peer drops the last sender, which ends the writer task
    // after it flushes anything still queued.
    lock(&dispatcher).cleanup_connection(&conn_id);
    let _ = writer.await;
    info!("{conn_id} disconnected");
}

/// Applies one client frame to the dispatcher and queues any reply.
pub(crate) fn handle_client_message(
    dispatcher: &Mutex<Dispatcher>,
    conn_id: &String,
    text: &str,
    settings: &Settings,
) -> Flow {
    let mut dispatcher = lock(dispatcher);

    let Some(authenticated) = dispatcher.connections.get(conn_id).map(|p| p.authenticated) else {
        error!("frame from unregistered connection {conn_id}");
        return Flow::Close;
    };

    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(err) => {
            warn!(
                "invalid client message from {conn_id}: {err} | {}",
                text.chars().take(100).collect::<String>()
            );
            reply(&dispatcher, conn_id, ServerMessage::Error {
                message: "invalid message".to_string(),
            });
            return Flow::Continue;
        }
    };

    match message {
        ClientMessage::Handshake(handshake) => {
            if !token_accepted(&handshake, settings) {
                warn!("{conn_id} rejected: bad credential");
                reply(&dispatcher, conn_id, ServerMessage::ConnectError {
                    message: "authentication failed".to_string(),
                });
                return Flow::Close;
            }
            if let Some(peer) = dispatcher.connections.get_mut(conn_id) {
                peer.authenticated = true;
            }
            info!("{conn_id} authenticated");
            reply(&dispatcher, conn_id, ServerMessage::Connect);
        }
        _ if !authenticated => {
            warn!("{conn_id} sent a message before the handshake");
            reply(&dispatcher, conn_id, ServerMessage::ConnectError {
                message: "handshake required".to_string(),
            });
            return Flow::Close;
        }
        ClientMessage::JoinDate(date) => match dispatcher.join(&date, conn_id) {
            Ok(topic) => debug!("{conn_id} joined {topic}"),
            Err(e) => reply(&dispatcher, conn_id, ServerMessage::Error {
                message: e.to_string(),
            }),
        },
        ClientMessage::LeaveDate(date) => match dispatcher.leave(&date, conn_id) {
            Ok(topic) => debug!("{conn_id} left {topic}"),
            Err(e) => reply(&dispatcher, conn_id, ServerMessage::Error {
                message: e.to_string(),
            }),
        },
        ClientMessage::Publish(payload) => {
            let date = payload.date.clone();
            match dispatcher.publish(payload) {
                Ok(count) => info!("{conn_id} published update for {date} to {count} connection(s)"),
                Err(e) => reply(&dispatcher, conn_id, ServerMessage::Error {
                    message: e.to_string(),
                }),
            }
        }
    }

    Flow::Continue
}

fn token_accepted(handshake: &Handshake, settings: &Settings) -> bool {
    let token = handshake.auth.token.trim();
    if token.is_empty() {
        return false;
    }
    match settings.server.auth_token.as_deref() {
        Some(expected) => token == expected,
        None => true,
    }
}

fn reply(dispatcher: &Dispatcher, conn_id: &String, message: ServerMessage) {
    let Some(peer) = dispatcher.connections.get(conn_id) else {
        return;
    };
    match serde_json::to_string(&message) {
        Ok(json) => {
            if let Err(e) = peer.sender.send(WsMessage::text(json)) {
                warn!("failed to queue reply for {conn_id}: {e}");
            }
        }
        Err(e) => error!("failed to serialize reply: {e}"),
    }
}

fn lock(dispatcher: &Mutex<Dispatcher>) -> MutexGuard<'_, Dispatcher> {
    dispatcher.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
