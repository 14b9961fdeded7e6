//! The `utils` module provides shared definitions used across the
//! `delivery-feed` crate: the crate-wide error type and logging setup.

pub mod error;
pub mod logging;

pub use error::FeedError;
