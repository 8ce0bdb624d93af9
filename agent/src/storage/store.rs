//! Persistent key-value store
//!
//! One file per key under a base directory. Updates go through a temp file,
//! fsync, and an atomic rename, so a crash mid-write leaves either the
//! previous value or the new value.

use std::path::PathBuf;

use serde::{de::DeserializeOwned, Serialize};
use tokio::fs;
use tracing::debug;

use crate::errors::AgentError;
use crate::filesys::file::File;

/// Atomic key-value store backed by a directory.
#[derive(Debug, Clone)]
pub struct Store {
    dir: PathBuf,
}

impl Store {
    /// Open (and create if needed) a store at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, AgentError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn key_file(&self, key: &str) -> Result<File, AgentError> {
        if key.is_empty() || key.contains('/') {
            return Err(AgentError::ConfigError(format!("invalid store key: {:?}", key)));
        }
        Ok(File::new(self.dir.join(key)))
    }

    /// Get and deserialize the value stored under `key`.
    /// Returns `NotFound` if the key does not exist.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, AgentError> {
        let data = self.read_all(key).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Read the raw bytes stored under `key`.
    pub async fn read_all(&self, key: &str) -> Result<Vec<u8>, AgentError> {
        let file = self.key_file(key)?;
        if !file.exists().await {
            return Err(AgentError::NotFound(key.to_string()));
        }
        file.read_bytes().await
    }

    /// Serialize `value` and store it under `key`, atomically.
    pub async fn update<T: Serialize>(&self, key: &str, value: &T) -> Result<(), AgentError> {
        let file = self.key_file(key)?;
        let data = serde_json::to_vec(value)?;
        file.write_atomic(&data).await
    }

    /// Remove `key`. Removing a missing key is not an error.
    pub async fn remove(&self, key: &str) -> Result<(), AgentError> {
        self.key_file(key)?.delete().await
    }

    /// Whether `key` exists in the store.
    pub async fn contains(&self, key: &str) -> Result<bool, AgentError> {
        Ok(self.key_file(key)?.exists().await)
    }

    /// Close the store. All writes are already durable at this point; this
    /// exists so the daemon has an explicit release point.
    pub async fn close(&self) -> Result<(), AgentError> {
        debug!("closing store at {:?}", self.dir);
        Ok(())
    }
}
