//! Server-side view of one connected dashboard or backend.
//!
//! A `Peer` holds the sending half of the per-connection channel that the
//! WebSocket writer task drains, plus the topics the connection has joined.
//! Joins are counted: one connection can host several subscriptions to the
//! same date and stays joined until the last of them leaves.

use std::collections::HashMap;

use tokio::sync::mpsc::UnboundedSender;
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use super::topic::ConnectionId;

#[derive(Debug)]
pub struct Peer {
    pub id: ConnectionId,
    pub sender: UnboundedSender<WsMessage>,
    pub authenticated: bool,
    pub joined: HashMap<String, usize>,
}

impl Peer {
    pub fn new(sender: UnboundedSender<WsMessage>) -> Self {
        Self {
            id: format!("conn-{}", Uuid::new_v4()),
            sender,
            authenticated: false,
            joined: HashMap::new(),
        }
    }

    /// Returns true when this is the first join of `topic`.
    pub(crate) fn add_join(&mut self, topic: &str) -> bool {
        let count = self.joined.entry(topic.to_string()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Returns true when the last join of `topic` was released.
    pub(crate) fn release_join(&mut self, topic: &str) -> bool {
        match self.joined.get_mut(topic) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.joined.remove(topic);
                true
            }
            None => false,
        }
    }
}
