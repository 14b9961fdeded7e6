//! Date-scoped topics.
//!
//! Updates are partitioned by calendar date. A [`TopicDate`] is the canonical
//! `YYYY-MM-DD` key both ends of the channel agree on.

pub mod date;

pub use date::TopicDate;
