//! The `persistence` module provides the client-side credential storage the
//! connection reads its bearer token from.
//!
//! Tokens are kept in a `sled` database so they survive restarts, the way a
//! browser keeps them in local storage.

pub mod sled_store;

pub use sled_store::{CredentialStore, MemoryCredentialStore, SledCredentialStore};
