//! Key/value storage backends for credential material.
//!
//! This module provides:
//! - `Storage`: the string key/value contract shared by every backend
//! - `MemoryStorage`: process-lifetime storage, used for the ephemeral scope
//! - `FileStorage`: durable JSON file in the cache directory
//! - `KeyringStorage`: durable storage in the OS keychain
//! - `SharedStorage`/`TabStorage`: origin-wide durable storage observed by
//!   several tabs, with change notifications delivered to every tab but the writer

pub mod file;
pub mod keychain;
pub mod memory;
pub mod shared;

use thiserror::Error;

pub use self::file::FileStorage;
pub use self::keychain::KeyringStorage;
pub use self::memory::MemoryStorage;
pub use self::shared::{SharedStorage, StorageEvent, StorageEvents, TabId, TabStorage};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),
}

/// String key/value storage with browser-storage semantics.
///
/// Removing a missing key is not an error.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    fn remove(&self, key: &str) -> Result<(), StorageError>;
}
