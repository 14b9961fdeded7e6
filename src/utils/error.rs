//! Error types for the delivery update channel.
//!
//! Every failure in the channel is represented by [`FeedError`]. The
//! subscription layer logs these and never hands them to the consumer.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("no access token stored under key '{0}'")]
    MissingCredential(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("invalid date '{0}'")]
    InvalidDate(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("credential storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tungstenite::Error> for FeedError {
    fn from(err: tungstenite::Error) -> Self {
        FeedError::Transport(err.to_string())
    }
}
