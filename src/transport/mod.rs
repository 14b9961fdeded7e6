//! The `transport` module handles network communication for the dispatcher
//! side of the channel.
//!
//! It defines the JSON wire protocol shared by both ends and implements the
//! WebSocket server that enforces the handshake and forwards control frames
//! to the dispatcher.

pub mod message;
pub mod websocket;

pub use message::{ClientMessage, Handshake, ServerMessage, UpdatePayload};
pub use websocket::{serve, start_websocket_server};

#[cfg(test)]
mod tests;
