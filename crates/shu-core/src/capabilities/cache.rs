// Bounded TTL cache, one instance per plugin call chain
//
// Entries past their deadline are dropped on read; when the cache is full
// the oldest entry is evicted.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;

const DEFAULT_MAX_ENTRIES: usize = 256;
const DEFAULT_TTL: Duration = Duration::from_secs(300);

struct Entry {
    value: Value,
    inserted_at: Instant,
    expires_at: Instant,
}

pub struct CacheCapability {
    entries: Mutex<HashMap<String, Entry>>,
    max_entries: usize,
    default_ttl: Duration,
    plugin_name: String,
}

impl CacheCapability {
    pub fn new(plugin_name: &str) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: DEFAULT_MAX_ENTRIES,
            default_ttl: DEFAULT_TTL,
            plugin_name: plugin_name.to_string(),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, key: &str, value: Value) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    pub fn set_with_ttl(&self, key: &str, value: Value, ttl: Duration) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= self.max_entries && !entries.contains_key(key) {
            // Evict the oldest entry to stay bounded
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }
        let now = Instant::now();
        entries.insert(
            key.to_string(),
            Entry {
                value,
                inserted_at: now,
                expires_at: now + ttl,
            },
        );
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries.lock().unwrap().remove(key).is_some()
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }
}
