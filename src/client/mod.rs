//! The `client` module is the dashboard side of the update channel.
//!
//! - `connection`: the shared, lazily created connection and its manager
//! - `subscription`: per-consumer date subscriptions on that connection
//! - `transport`: the network seam, with the WebSocket implementation

pub mod connection;
pub mod subscription;
pub mod transport;

pub use connection::{Connection, ConnectionManager, ConnectionState, HandlerId};
pub use subscription::DateSubscription;
pub use transport::{EventSink, ReconnectPolicy, Transport, TransportEvent, WebSocketTransport};

#[cfg(test)]
mod tests;
