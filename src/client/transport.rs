//! Client transports.
//!
//! A [`Transport`] carries frames between a [`Connection`](super::Connection)
//! and the notification server and reports what happens on the wire through
//! an [`EventSink`]. Tests inject a fake; production code uses
//! [`WebSocketTransport`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::config::ClientSettings;
use crate::transport::message::{ClientMessage, Handshake, ServerMessage};
use crate::utils::FeedError;

/// Something that happened on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The server accepted the handshake.
    Connected,
    /// The link dropped. `will_retry` is true while the transport is
    /// reconnecting on its own.
    Disconnected { will_retry: bool },
    /// The server refused the handshake. The transport does not retry.
    Rejected(String),
    Message(ServerMessage),
}

pub type EventSink = Arc<dyn Fn(TransportEvent) + Send + Sync>;

pub trait Transport: Send + Sync {
    /// Starts connecting to `endpoint`. Progress is reported through `events`;
    /// this call does not wait for the server.
    fn open(&self, endpoint: &str, handshake: Handshake, events: EventSink) -> Result<(), FeedError>;

    /// Sends one frame on the live link.
    fn send(&self, message: ClientMessage) -> Result<(), FeedError>;

    /// Closes the link and stops reconnecting.
    fn close(&self);
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    /// Consecutive failed attempts tolerated before giving up.
    pub max_attempts: u32,
}

impl From<&ClientSettings> for ReconnectPolicy {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            delay: Duration::from_millis(settings.reconnect_delay_ms),
            max_attempts: settings.max_reconnect_attempts,
        }
    }
}

enum SessionEnd {
    /// Closed from our side.
    Closed,
    Rejected,
    /// The server went away after the handshake was accepted.
    Dropped,
}

/// A single persistent WebSocket link. No fallback transports.
pub struct WebSocketTransport {
    policy: ReconnectPolicy,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<WsMessage>>>>,
    /// Stop flag of the current connection loop. Each `open` gets its own.
    closed: Mutex<Arc<AtomicBool>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketTransport {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            outbound: Arc::new(Mutex::new(None)),
            closed: Mutex::new(Arc::new(AtomicBool::new(true))),
            task: Mutex::new(None),
        }
    }
}

impl Transport for WebSocketTransport {
    fn open(&self, endpoint: &str, handshake: Handshake, events: EventSink) -> Result<(), FeedError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| FeedError::Transport("opening a connection requires a tokio runtime".into()))?;

        let closed = Arc::new(AtomicBool::new(false));
        let previous = std::mem::replace(&mut *lock(&self.closed), closed.clone());
        previous.store(true, Ordering::SeqCst);

        let task = runtime.spawn(run(
            endpoint.to_string(),
            handshake,
            events,
            self.policy,
            self.outbound.clone(),
            closed,
        ));
        if let Some(old) = lock(&self.task).replace(task) {
            old.abort();
        }
        Ok(())
    }

    fn send(&self, message: ClientMessage) -> Result<(), FeedError> {
        let frame = WsMessage::text(serde_json::to_string(&message)?);
        match lock(&self.outbound).as_ref() {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| FeedError::Transport("connection closed".into())),
            None => Err(FeedError::Transport("not connected".into())),
        }
    }

    fn close(&self) {
        lock(&self.closed).store(true, Ordering::SeqCst);
        // Dropping the sender ends the session loop with a close frame.
        lock(&self.outbound).take();
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

async fn run(
    endpoint: String,
    handshake: Handshake,
    events: EventSink,
    policy: ReconnectPolicy,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<WsMessage>>>>,
    closed: Arc<AtomicBool>,
) {
    let mut failures = 0u32;

    loop {
        let end = session(&endpoint, &handshake, &events, &outbound, &closed).await;
        lock(&outbound).take();

        match end {
            Ok(SessionEnd::Closed) => {
                debug!("connection to {endpoint} closed");
                return;
            }
            Ok(SessionEnd::Rejected) => return,
            Ok(SessionEnd::Dropped) => {
                warn!("connection to {endpoint} dropped");
                failures = 0;
            }
            Err(e) => {
                warn!("connection to {endpoint} failed: {e}");
                failures += 1;
            }
        }

        if closed.load(Ordering::SeqCst) {
            return;
        }
        if failures > policy.max_attempts {
            warn!("giving up on {endpoint} after {failures} failed attempt(s)");
            events(TransportEvent::Disconnected { will_retry: false });
            return;
        }

        events(TransportEvent::Disconnected { will_retry: true });
        tokio::time::sleep(policy.delay).await;

        if closed.load(Ordering::SeqCst) {
            return;
        }
    }
}

async fn session(
    endpoint: &str,
    handshake: &Handshake,
    events: &EventSink,
    outbound: &Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
    closed: &AtomicBool,
) -> Result<SessionEnd, FeedError> {
    let (ws_stream, _response) = connect_async(endpoint).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let hello = ClientMessage::Handshake(handshake.clone());
    ws_sender
        .send(WsMessage::text(serde_json::to_string(&hello)?))
        .await?;

    // The only sender lives in `outbound`, so `close()` ends this loop.
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    *lock(outbound) = Some(tx);
    if closed.load(Ordering::SeqCst) {
        lock(outbound).take();
    }

    let mut established = false;

    loop {
        tokio::select! {
            outgoing = rx.recv() => match outgoing {
                Some(frame) => ws_sender.send(frame).await?,
                None => {
                    let _ = ws_sender.close().await;
                    return Ok(SessionEnd::Closed);
                }
            },
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(frame)) if frame.is_text() => {
                    match serde_json::from_str::<ServerMessage>(frame.to_text()?) {
                        Ok(ServerMessage::Connect) => {
                            info!("connected to {endpoint}");
                            established = true;
                            events(TransportEvent::Connected);
                        }
                        Ok(ServerMessage::ConnectError { message }) => {
                            events(TransportEvent::Rejected(message));
                            return Ok(SessionEnd::Rejected);
                        }
                        Ok(message) => events(TransportEvent::Message(message)),
                        Err(e) => warn!("ignoring malformed frame: {e}"),
                    }
                }
                Some(Ok(frame)) if frame.is_close() => break,
                Some(Ok(_)) => {}
                Some(Err(e)) if established => {
                    warn!("read error: {e}");
                    break;
                }
                Some(Err(e)) => return Err(e.into()),
                None => break,
            },
        }
    }

    if established {
        Ok(SessionEnd::Dropped)
    } else {
        Err(FeedError::Transport("closed before the handshake completed".into()))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
