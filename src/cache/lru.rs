//! Process-local LRU store (L1)
//!
//! Uses `IndexMap` for O(1) lookups with insertion order as recency order:
//! a hit moves the entry to the back, eviction removes from the front.
//! A reverse index maps each tag to the keys carrying it.

use bytes::Bytes;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

use super::pattern::GlobPattern;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Bytes,
    pub tags: Vec<String>,
    pub created_at: Instant,
    pub expires_at: Instant,
    pub access_count: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Bounded LRU map of cache entries
#[derive(Debug)]
pub struct LruStore {
    entries: IndexMap<String, CacheEntry>,
    tag_index: HashMap<String, HashSet<String>>,
    capacity: usize,
}

impl LruStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: IndexMap::with_capacity(capacity.min(4096)),
            tag_index: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a live entry and mark it most recently used
    ///
    /// Expired entries are removed and never returned.
    pub fn get(&mut self, key: &str) -> Option<Bytes> {
        let idx = self.entries.get_index_of(key)?;
        let now = Instant::now();

        let expired = self.entries.get_index(idx).map(|(_, e)| e.is_expired(now))?;
        if expired {
            self.remove(key);
            return None;
        }

        let last = self.entries.len() - 1;
        self.entries.move_index(idx, last);
        let (_, entry) = self.entries.get_index_mut(last)?;
        entry.access_count += 1;
        Some(entry.value.clone())
    }

    /// Whether a live entry exists, without touching recency
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(|e| !e.is_expired(Instant::now()))
    }

    /// Insert or replace an entry as most recently used
    ///
    /// Returns the key evicted to make room, if any.
    pub fn insert(&mut self, key: &str, value: Bytes, ttl: Duration, tags: &[String]) -> Option<String> {
        self.remove(key);

        let evicted = if self.entries.len() >= self.capacity {
            let (old_key, old_entry) = self.entries.shift_remove_index(0)?;
            self.unindex(&old_key, &old_entry.tags);
            Some(old_key)
        } else {
            None
        };

        for tag in tags {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        let now = Instant::now();
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                tags: tags.to_vec(),
                created_at: now,
                expires_at: now + ttl,
                access_count: 0,
            },
        );
        evicted
    }

    pub fn remove(&mut self, key: &str) -> bool {
        match self.entries.shift_remove(key) {
            Some(entry) => {
                self.unindex(key, &entry.tags);
                true
            }
            None => false,
        }
    }

    /// Keys currently tagged with `tag`
    pub fn keys_for_tag(&self, tag: &str) -> Vec<String> {
        self.tag_index
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn keys_matching(&self, pattern: &GlobPattern) -> Vec<String> {
        self.entries
            .keys()
            .filter(|k| pattern.matches(k))
            .cloned()
            .collect()
    }

    /// Drop every expired entry
    pub fn purge_expired(&mut self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    /// Keys from least to most recently used
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    fn unindex(&mut self, key: &str, tags: &[String]) {
        for tag in tags {
            if let Some(keys) = self.tag_index.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_index.remove(tag);
                }
            }
        }
    }
}
