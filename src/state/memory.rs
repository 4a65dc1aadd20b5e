// src/state/memory.rs
// Expiry-aware in-process backend with the same semantics as the Redis
// store. Backs unit and integration tests; also usable for single-node dry
// runs where no external store is available.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use super::count_within_window;

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    values: HashMap<String, Entry>,
    counters: HashMap<String, Counter>,
    lists: HashMap<String, Vec<String>>,
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

struct Counter {
    value: u64,
    expires_at: Option<Instant>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn exists(&self, key: &str) -> bool {
        let mut inner = self.lock();
        match inner.values.get(key) {
            Some(entry) if !expired(entry.expires_at) => true,
            Some(_) => {
                inner.values.remove(key);
                false
            }
            None => false,
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut inner = self.lock();
        match inner.values.get(key) {
            Some(entry) if !expired(entry.expires_at) => Some(entry.value.clone()),
            Some(_) => {
                inner.values.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn set_with_ttl(&self, key: &str, value: &str, ttl_seconds: u64) {
        let mut inner = self.lock();
        inner.values.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_seconds)),
            },
        );
    }

    /// Blocklist semantics: refresh the value but never shorten the
    /// remaining lifetime.
    pub fn set_with_ttl_extend(&self, key: &str, value: &str, ttl_seconds: u64) {
        let mut inner = self.lock();
        let proposed = Instant::now() + Duration::from_secs(ttl_seconds);
        let expires_at = match inner.values.get(key) {
            Some(existing) if !expired(existing.expires_at) => match existing.expires_at {
                Some(current) => Some(current.max(proposed)),
                None => None,
            },
            _ => Some(proposed),
        };
        inner.values.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
    }

    pub fn incr_with_window(&self, key: &str, window_seconds: u64) -> u64 {
        let mut inner = self.lock();
        if let Some(counter) = inner.counters.get_mut(key) {
            if !expired(counter.expires_at) {
                counter.value += 1;
                return counter.value;
            }
        }
        inner.counters.insert(
            key.to_string(),
            Counter {
                value: 1,
                expires_at: Some(Instant::now() + Duration::from_secs(window_seconds)),
            },
        );
        1
    }

    pub fn counter_value(&self, key: &str) -> u64 {
        let mut inner = self.lock();
        match inner.counters.get(key) {
            Some(counter) if !expired(counter.expires_at) => counter.value,
            Some(_) => {
                inner.counters.remove(key);
                0
            }
            None => 0,
        }
    }

    pub fn push_and_count(
        &self,
        key: &str,
        stamp: &str,
        now: DateTime<Utc>,
        window_seconds: u64,
        max_len: isize,
    ) -> u32 {
        let mut inner = self.lock();
        let list = inner.lists.entry(key.to_string()).or_default();
        list.insert(0, stamp.to_string());
        list.truncate(max_len.max(0) as usize);
        count_within_window(list, now, window_seconds)
    }

    /// Remaining lifetime of a key, for assertions on TTL-extension
    /// semantics.
    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        let inner = self.lock();
        inner
            .values
            .get(key)
            .and_then(|entry| entry.expires_at)
            .and_then(|deadline| deadline.checked_duration_since(Instant::now()))
    }
}

fn expired(deadline: Option<Instant>) -> bool {
    match deadline {
        Some(deadline) => Instant::now() >= deadline,
        None => false,
    }
}
