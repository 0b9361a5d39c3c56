//! In-process response cache with a per-entry time-to-live.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct TtlCache<K, V> {
    ttl: Mutex<Duration>,
    entries: Mutex<HashMap<K, (Instant, V)>>,
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl: Mutex::new(ttl), entries: Mutex::new(HashMap::new()) }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl.lock().map(|t| *t).unwrap_or_default()
    }

    pub fn set_ttl(&self, ttl: Duration) {
        if let Ok(mut current) = self.ttl.lock() {
            *current = ttl;
        }
    }

    /// Fresh value for `key`, if any. Expired entries are evicted.
    pub fn get(&self, key: &K) -> Option<V> {
        let ttl = self.ttl();
        let mut entries = self.entries.lock().ok()?;
        match entries.get(key) {
            Some((stored, value)) if stored.elapsed() < ttl => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store `value` and drop every entry that has already expired.
    pub fn insert(&self, key: K, value: V) {
        let ttl = self.ttl();
        if let Ok(mut entries) = self.entries.lock() {
            entries.retain(|_, (stored, _)| stored.elapsed() < ttl);
            entries.insert(key, (Instant::now(), value));
        }
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
