//! Response cache handed to the service explicitly; there is no process-wide
//! cache state.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;

pub trait Cache: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set_with_ttl(&self, key: &str, value: Value, ttl: Duration);
    fn delete(&self, key: &str);
}

struct CacheEntry {
    value: Value,
    expires_at: Instant,
}

/// In-process cache with per-entry expiry. Expired entries are dropped when
/// read and swept on every write.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: &str) -> Option<Value> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries
                .remove_if(key, |_, entry| entry.expires_at <= Instant::now());
        }
        None
    }

    fn set_with_ttl(&self, key: &str, value: Value, ttl: Duration) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: now + ttl,
            },
        );
    }

    fn delete(&self, key: &str) {
        self.entries.remove(key);
    }
}
