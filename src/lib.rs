//! # delivery-feed
//!
//! Live delivery updates for the dispatch dashboard. Dashboard views
//! subscribe to a calendar date and receive every delivery mutation for that
//! date over one shared, bearer-authenticated WebSocket connection.
//!
//! ## Core Modules
//!
//! - `client`: the shared connection, its manager, and per-consumer date subscriptions.
//! - `config`: loads settings from `config/default.toml` and the environment.
//! - `dispatcher`: server side, tracks topic joins and fans updates out.
//! - `persistence`: client-side credential storage backed by `sled`.
//! - `topic`: canonical `YYYY-MM-DD` topic keys.
//! - `transport`: the wire protocol and the WebSocket server.
//! - `utils`: error type and logging setup.
//!
//! Updates are additive: a consumer must fetch the baseline state for its
//! date separately, and again after a reconnect gap, since missed updates are
//! never replayed.

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod persistence;
pub mod topic;
pub mod transport;
pub mod utils;

pub use client::{ConnectionManager, DateSubscription};
pub use topic::TopicDate;
pub use transport::message::UpdatePayload;
pub use utils::FeedError;
