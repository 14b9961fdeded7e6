//! The `dispatcher` module is the server side of the update channel: it
//! keeps per-connection topic joins and republishes delivery mutations to
//! every connection joined to the affected date.

pub mod engine;
pub mod peer;
pub mod topic;

pub use engine::Dispatcher;
pub use peer::Peer;
