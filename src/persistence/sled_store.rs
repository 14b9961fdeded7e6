use std::collections::HashMap;
use std::sync::Mutex;

use sled::Db;
use tracing::warn;

use crate::utils::FeedError;

/// Key/value storage for client credentials.
pub trait CredentialStore: Send + Sync {
    /// Returns the stored value, or `None` when absent or unreadable.
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str) -> Result<(), FeedError>;

    fn remove(&self, key: &str) -> Result<(), FeedError>;
}

#[derive(Clone)]
pub struct SledCredentialStore {
    db: Db,
}

impl SledCredentialStore {
    pub fn open(path: &str) -> Result<Self, FeedError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }
}

impl CredentialStore for SledCredentialStore {
    fn get(&self, key: &str) -> Option<String> {
        match self.db.get(key) {
            Ok(Some(raw)) => match String::from_utf8(raw.to_vec()) {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("stored value for '{key}' is not UTF-8");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("failed to read '{key}' from credential store: {e}");
                None
            }
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), FeedError> {
        self.db.insert(key, value.as_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), FeedError> {
        self.db.remove(key)?;
        self.db.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for SledCredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledCredentialStore")
            .field("db", &"sled::Db")
            .finish()
    }
}

/// Volatile store, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(key: &str, value: &str) -> Self {
        let store = Self::new();
        store
            .values
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.to_string(), value.to_string());
        store
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), FeedError> {
        self.values
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), FeedError> {
        self.values
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key);
        Ok(())
    }
}
