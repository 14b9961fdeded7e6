//! Update dispatcher engine
//!
//! Tracks which connections joined which date topic and fans delivery
//! updates out to them. The API is synchronous and meant to sit behind an
//! `Arc<Mutex<Dispatcher>>` owned by the transport layer; sends only push
//! into unbounded per-connection channels, so no network I/O happens while
//! the lock is held.
//!
//! Delivery is at-most-once. Nothing is replayed to connections that join
//! late or reconnect.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, warn};
use tungstenite::protocol::Message as WsMessage;

use super::peer::Peer;
use super::topic::{ConnectionId, Topic};
use crate::topic::TopicDate;
use crate::transport::message::{ServerMessage, UpdatePayload};
use crate::utils::FeedError;

#[derive(Debug, Default)]
pub struct Dispatcher {
    pub topics: HashMap<String, Topic>,
    pub connections: HashMap<ConnectionId, Peer>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_connection(&mut self, peer: Peer) {
        self.connections.insert(peer.id.clone(), peer);
    }

    pub fn remove_connection(&mut self, id: &ConnectionId) -> Option<Peer> {
        self.connections.remove(id)
    }

    /// Joins `date` for a registered connection. Returns the canonical topic.
    pub fn join(&mut self, date: &str, id: &ConnectionId) -> Result<TopicDate, FeedError> {
        let topic_date = TopicDate::parse(date)?;
        let key = topic_date.canonical();

        let Some(peer) = self.connections.get_mut(id) else {
            warn!("join from unknown connection {id}");
            return Ok(topic_date);
        };

        if peer.add_join(&key) {
            self.topics
                .entry(key.clone())
                .or_insert_with(|| Topic::new(&key))
                .subscribe(id.clone());
        }
        Ok(topic_date)
    }

    /// Releases one join of `date`. The connection leaves the topic when no
    /// joins remain, and empty topics are dropped.
    pub fn leave(&mut self, date: &str, id: &ConnectionId) -> Result<TopicDate, FeedError> {
        let topic_date = TopicDate::parse(date)?;
        let key = topic_date.canonical();

        let released = self
            .connections
            .get_mut(id)
            .map(|peer| peer.release_join(&key))
            .unwrap_or(false);

        if released {
            self.drop_subscriber(&key, id);
        }
        Ok(topic_date)
    }

    /// Sends `payload` to every connection joined to its date and returns how
    /// many connections it was queued for.
    pub fn publish(&self, payload: UpdatePayload<Value>) -> Result<usize, FeedError> {
        let topic_date = TopicDate::parse(&payload.date)
            .map_err(|_| FeedError::MalformedPayload(format!("bad date '{}'", payload.date)))?;
        let key = topic_date.canonical();

        let Some(topic) = self.topics.get(&key) else {
            debug!("no connections joined to {key}");
            return Ok(0);
        };

        let message = ServerMessage::DeliveryUpdate(UpdatePayload {
            date: key,
            data: payload.data,
        });
        let frame = WsMessage::text(serde_json::to_string(&message)?);

        let mut delivered = 0;
        for id in &topic.subscribers {
            match self.connections.get(id) {
                Some(peer) => match peer.sender.send(frame.clone()) {
                    Ok(()) => delivered += 1,
                    Err(e) => warn!("failed to queue update for {id}: {e}"),
                },
                None => warn!("no connection registered with id {id}"),
            }
        }
        Ok(delivered)
    }

    /// Removes a connection and every topic membership it held.
    pub fn cleanup_connection(&mut self, id: &ConnectionId) {
        if let Some(peer) = self.remove_connection(id) {
            for topic in peer.joined.keys() {
                self.drop_subscriber(topic, id);
            }
        }
        debug!("cleaned up connection {id}");
    }

    pub fn subscriber_count(&self, date: &str) -> usize {
        TopicDate::parse(date)
            .ok()
            .and_then(|d| self.topics.get(&d.canonical()))
            .map(|t| t.subscribers.len())
            .unwrap_or(0)
    }

    fn drop_subscriber(&mut self, key: &str, id: &ConnectionId) {
        if let Some(topic) = self.topics.get_mut(key) {
            topic.unsubscribe(id);
            if topic.is_empty() {
                self.topics.remove(key);
            }
        }
    }
}
