//! The shared update connection and the manager that owns it.
//!
//! One `Connection` exists per `ConnectionManager`, and one manager can be
//! installed for the whole process. The connection keeps a count of every
//! topic join it forwarded so it can replay them after the transport
//! reconnects; the server forgets a connection's topics when it drops.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::transport::{EventSink, ReconnectPolicy, Transport, TransportEvent, WebSocketTransport};
use crate::config::ClientSettings;
use crate::persistence::{CredentialStore, SledCredentialStore};
use crate::topic::TopicDate;
use crate::transport::message::{ClientMessage, Handshake, ServerMessage, UpdatePayload};
use crate::utils::FeedError;

pub type UpdateHandler = Arc<dyn Fn(&UpdatePayload<Value>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Inner {
    state: ConnectionState,
    handshake: Option<Handshake>,
    joined: HashMap<String, usize>,
    handlers: Vec<(HandlerId, UpdateHandler)>,
    next_handler: u64,
}

pub struct Connection {
    endpoint: String,
    transport: Arc<dyn Transport>,
    inner: Mutex<Inner>,
    /// Held across every join, leave and replay send so control frames
    /// reach the transport in the order the bookkeeping changed.
    control: Mutex<()>,
}

impl Connection {
    /// Creates a disconnected handle. Nothing touches the network until
    /// [`connect`](Self::connect).
    pub fn new(endpoint: impl Into<String>, transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            endpoint: endpoint.into(),
            transport,
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                handshake: None,
                joined: HashMap::new(),
                handlers: Vec::new(),
                next_handler: 0,
            }),
            control: Mutex::new(()),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Attaches the bearer token sent with the next handshake.
    pub fn set_auth(&self, token: impl Into<String>) {
        self.lock().handshake = Some(Handshake::bearer(token));
    }

    /// Opens the transport when disconnected. No-op while connecting or connected.
    pub fn connect(self: &Arc<Self>) -> Result<(), FeedError> {
        let handshake = {
            let mut inner = self.lock();
            if inner.state != ConnectionState::Disconnected {
                return Ok(());
            }
            let handshake = inner
                .handshake
                .clone()
                .ok_or_else(|| FeedError::Transport("no credential attached".into()))?;
            inner.state = ConnectionState::Connecting;
            handshake
        };

        debug!("opening connection to {}", self.endpoint);
        if let Err(e) = self.transport.open(&self.endpoint, handshake, self.event_sink()) {
            self.lock().state = ConnectionState::Disconnected;
            return Err(e);
        }
        Ok(())
    }

    pub fn disconnect(&self) {
        self.transport.close();
        self.lock().state = ConnectionState::Disconnected;
        info!("disconnected from {}", self.endpoint);
    }

    /// Records a join of `topic` and emits `join:date` when connected.
    /// While not connected the join is sent once the link comes up.
    pub fn join(&self, topic: &TopicDate) {
        let key = topic.canonical();
        let _control = self.control();
        let connected = {
            let mut inner = self.lock();
            *inner.joined.entry(key.clone()).or_insert(0) += 1;
            inner.state == ConnectionState::Connected
        };
        if connected {
            self.send(ClientMessage::JoinDate(key));
        }
    }

    /// Releases one join of `topic` and emits `leave:date` when connected.
    pub fn leave(&self, topic: &TopicDate) {
        let key = topic.canonical();
        let _control = self.control();
        let connected = {
            let mut inner = self.lock();
            match inner.joined.get_mut(&key) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    inner.joined.remove(&key);
                }
                None => {
                    warn!("leave for {key} without a matching join");
                    return;
                }
            }
            inner.state == ConnectionState::Connected
        };
        if connected {
            self.send(ClientMessage::LeaveDate(key));
        }
    }

    pub fn joined_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.lock().joined.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn on_update(&self, handler: UpdateHandler) -> HandlerId {
        let mut inner = self.lock();
        let id = HandlerId(inner.next_handler);
        inner.next_handler += 1;
        inner.handlers.push((id, handler));
        id
    }

    /// Returns false if `id` was not registered.
    pub fn off_update(&self, id: HandlerId) -> bool {
        let mut inner = self.lock();
        let before = inner.handlers.len();
        inner.handlers.retain(|(h, _)| *h != id);
        inner.handlers.len() != before
    }

    pub fn handler_count(&self) -> usize {
        self.lock().handlers.len()
    }

    /// Applies a transport event. Handlers run without the state lock held.
    pub fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                let _control = self.control();
                let rejoin: Vec<(String, usize)> = {
                    let mut inner = self.lock();
                    inner.state = ConnectionState::Connected;
                    inner.joined.iter().map(|(k, n)| (k.clone(), *n)).collect()
                };
                info!("update connection established ({} topic(s) to join)", rejoin.len());
                for (topic, count) in rejoin {
                    for _ in 0..count {
                        self.send(ClientMessage::JoinDate(topic.clone()));
                    }
                }
            }
            TransportEvent::Disconnected { will_retry } => {
                self.lock().state = if will_retry {
                    ConnectionState::Connecting
                } else {
                    ConnectionState::Disconnected
                };
                warn!("update connection lost (reconnecting: {will_retry})");
            }
            TransportEvent::Rejected(reason) => {
                self.lock().state = ConnectionState::Disconnected;
                error!("update connection rejected: {reason}");
            }
            TransportEvent::Message(ServerMessage::DeliveryUpdate(payload)) => {
                let handlers: Vec<UpdateHandler> =
                    self.lock().handlers.iter().map(|(_, h)| h.clone()).collect();
                for handler in handlers {
                    handler(&payload);
                }
            }
            TransportEvent::Message(ServerMessage::Error { message }) => {
                warn!("server reported: {message}");
            }
            TransportEvent::Message(other) => {
                debug!("ignoring {other:?}");
            }
        }
    }

    fn send(&self, message: ClientMessage) {
        if let Err(e) = self.transport.send(message) {
            warn!("failed to send control message: {e}");
        }
    }

    fn event_sink(self: &Arc<Self>) -> EventSink {
        let weak: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |event| {
            if let Some(connection) = weak.upgrade() {
                connection.handle_event(event);
            }
        })
    }

    fn control(&self) -> MutexGuard<'_, ()> {
        self.control.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

static GLOBAL: OnceLock<Arc<ConnectionManager>> = OnceLock::new();

/// Owns the process's shared [`Connection`] and the credential it uses.
pub struct ConnectionManager {
    settings: ClientSettings,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialStore>,
    connection: OnceLock<Arc<Connection>>,
}

impl ConnectionManager {
    pub fn new(
        settings: ClientSettings,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            settings,
            transport,
            credentials,
            connection: OnceLock::new(),
        }
    }

    /// WebSocket transport plus the on-disk credential store.
    pub fn from_settings(settings: &ClientSettings) -> Result<Self, FeedError> {
        let credentials = SledCredentialStore::open(&settings.credential_path)?;
        let transport = WebSocketTransport::new(ReconnectPolicy::from(settings));
        Ok(Self::new(
            settings.clone(),
            Arc::new(transport),
            Arc::new(credentials),
        ))
    }

    /// Installs the process-wide manager. The first install wins; later calls
    /// return the one already installed.
    pub fn install_global(manager: ConnectionManager) -> Arc<ConnectionManager> {
        GLOBAL.get_or_init(|| Arc::new(manager)).clone()
    }

    pub fn global() -> Option<Arc<ConnectionManager>> {
        GLOBAL.get().cloned()
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// The shared connection, created on first use and never auto-connected.
    pub fn get_connection(&self) -> Arc<Connection> {
        self.connection
            .get_or_init(|| {
                debug!("creating update connection for {}", self.settings.backend_url);
                Connection::new(self.settings.backend_url.clone(), self.transport.clone())
            })
            .clone()
    }

    /// Reads the stored token, attaches it and connects if needed.
    ///
    /// Without a token nothing is opened and `MissingCredential` is returned.
    pub fn ensure_authenticated_and_connected(&self) -> Result<Arc<Connection>, FeedError> {
        let key = &self.settings.token_key;
        let Some(token) = self
            .credentials
            .get(key)
            .filter(|token| !token.trim().is_empty())
        else {
            error!("no access token found for the update connection");
            return Err(FeedError::MissingCredential(key.clone()));
        };

        let connection = self.get_connection();
        connection.set_auth(token);
        connection.connect()?;
        Ok(connection)
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("backend_url", &self.settings.backend_url)
            .field("connection", &self.connection.get())
            .finish()
    }
}
