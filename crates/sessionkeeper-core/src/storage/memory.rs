use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::{Storage, StorageError};

/// In-memory storage that lives as long as its owner.
///
/// Backs the ephemeral scope: dropping it is the equivalent of closing the tab.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
    disabled: bool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage that rejects every operation, like a browser with storage disabled.
    pub fn unavailable() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            disabled: true,
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.disabled {
            Err(StorageError::Unavailable("storage is disabled".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.check()?;
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.check()?;
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.check()?;
        self.entries().remove(key);
        Ok(())
    }
}
