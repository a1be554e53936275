//! In-memory key/value store with per-entry expiration.
//!
//! Holds the advertised agent payloads and the `AllNodes` directory. Readers
//! never observe a partially written value; expiry is enforced on read, and
//! [`Cache::purge`] drops dead entries to bound memory between reads.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

#[derive(Default)]
pub struct Cache {
    entries: RwLock<HashMap<String, Entry>>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert. A `ttl` of `None` means the entry never expires.
    pub fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) {
        let entry = Entry {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.write_entries().insert(key.to_string(), entry);
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get(key)?;
        if entry.expired(Instant::now()) {
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn delete(&self, key: &str) {
        self.write_entries().remove(key);
    }

    /// Drop entries past their deadline.
    pub fn purge(&self) {
        let now = Instant::now();
        self.write_entries().retain(|_, entry| !entry.expired(now));
    }

    fn write_entries(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Entry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}
