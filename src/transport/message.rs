//! Wire protocol.
//!
//! Every frame is a JSON text message shaped `{"event": <name>, "data": <payload>}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JOIN_DATE: &str = "join:date";
pub const LEAVE_DATE: &str = "leave:date";
pub const DELIVERY_UPDATE: &str = "delivery:update";

/// An update for one date. `data` is opaque to the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatePayload<T> {
    pub date: String,
    pub data: T,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Auth {
    pub token: String,
}

/// Handshake metadata, sent as the first frame of every connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    pub auth: Auth,
}

impl Handshake {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            auth: Auth {
                token: token.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientMessage {
    #[serde(rename = "handshake")]
    Handshake(Handshake),

    #[serde(rename = "join:date")]
    JoinDate(String),

    #[serde(rename = "leave:date")]
    LeaveDate(String),

    /// A delivery mutation reported by the backend.
    #[serde(rename = "delivery:publish")]
    Publish(UpdatePayload<Value>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerMessage {
    #[serde(rename = "connect")]
    Connect,

    #[serde(rename = "connect_error")]
    ConnectError { message: String },

    #[serde(rename = "error")]
    Error { message: String },

    #[serde(rename = "delivery:update")]
    DeliveryUpdate(UpdatePayload<Value>),
}
