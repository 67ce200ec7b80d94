//! Per-key entry locks held while a retrieved entry is being read.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use super::types::CacheKey;

/// Shared table of locked keys with reader counts
#[derive(Debug, Clone, Default)]
pub struct LockTable {
    held: Arc<Mutex<HashMap<CacheKey, usize>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock `key` for the lifetime of the returned guard
    pub fn acquire(&self, key: &CacheKey) -> EntryLock {
        *self.held.lock().entry(key.clone()).or_insert(0) += 1;
        EntryLock {
            held: self.held.clone(),
            key: key.clone(),
        }
    }

    pub fn is_locked(&self, key: &CacheKey) -> bool {
        self.held.lock().contains_key(key)
    }

    /// Fail with `ResourceBusy` when a reader still holds `key`
    pub fn ensure_unlocked(&self, key: &CacheKey) -> io::Result<()> {
        if self.is_locked(key) {
            return Err(io::Error::new(
                io::ErrorKind::ResourceBusy,
                format!("cache entry {key} is locked by a reader"),
            ));
        }
        Ok(())
    }
}

/// Guard releasing one reader's hold on an entry when dropped
#[derive(Debug)]
pub struct EntryLock {
    held: Arc<Mutex<HashMap<CacheKey, usize>>>,
    key: CacheKey,
}

impl EntryLock {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

impl Drop for EntryLock {
    fn drop(&mut self) {
        let mut held = self.held.lock();
        if let Some(count) = held.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                held.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_released_after_last_guard() {
        let table = LockTable::new();
        let key = CacheKey::new("http://example.com/");
        let first = table.acquire(&key);
        let second = table.acquire(&key);
        assert!(table.ensure_unlocked(&key).is_err());
        drop(first);
        assert!(table.is_locked(&key));
        drop(second);
        assert!(table.ensure_unlocked(&key).is_ok());
    }
}
