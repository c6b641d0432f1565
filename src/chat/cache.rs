//! Relay-side message cache — duplicate suppression and backfill source.
//!
//! Bounded LRU keyed by `origin:sequence`, with an idle TTL measured from
//! the last access. A message seen again within the window is a duplicate
//! and must not be relayed; a message idle past the window is forgotten
//! and would relay again, which is the accepted trade-off for a bounded
//! cache.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

use super::packet::DataMessage;

/// Default capacity; the least recently used entry is evicted beyond this.
pub const DEFAULT_CAPACITY: usize = 5000;

/// Default idle TTL, measured from last access.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

struct Entry {
    message: DataMessage,
    last_access: Instant,
}

/// Bounded, idle-expiring store of recently relayed messages.
pub struct MessageCache {
    entries: LruCache<String, Entry>,
    ttl: Duration,
}

impl MessageCache {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_CAPACITY, DEFAULT_TTL)
    }

    pub fn with_limits(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
            ttl,
        }
    }

    /// Stores a message, silently overwriting any entry under the same key.
    pub fn insert(&mut self, message: DataMessage) {
        self.entries.put(
            message.key(),
            Entry {
                message,
                last_access: Instant::now(),
            },
        );
    }

    /// Stores a message unless its key is already live. Returns whether the
    /// message was new — i.e. whether the caller should relay it.
    pub fn insert_if_absent(&mut self, message: DataMessage) -> bool {
        if self.get(&message.key()).is_some() {
            return false;
        }
        self.insert(message);
        true
    }

    /// Looks up a live entry, refreshing its idle clock and recency.
    /// Entries idle past the TTL are dropped here.
    pub fn get(&mut self, key: &str) -> Option<&DataMessage> {
        let expired = match self.entries.peek(key) {
            None => return None,
            Some(entry) => entry.last_access.elapsed() >= self.ttl,
        };
        if expired {
            self.entries.pop(key);
            return None;
        }
        let entry = self.entries.get_mut(key)?;
        entry.last_access = Instant::now();
        Some(&entry.message)
    }

    /// Collects the cached messages of `origin` with sequences in
    /// `low..=high`, ascending, omitting any the cache no longer holds.
    /// Hits count as accesses; nothing is inserted or removed beyond
    /// ordinary idle expiry.
    ///
    /// The scanned window is clamped to the cache capacity: the cache
    /// cannot hold more hits than that, and an unclamped `low..=high`
    /// would let one request scan up to 2^64 keys.
    pub fn backfill(&mut self, origin: &str, low: u64, high: u64) -> Vec<DataMessage> {
        let cap = self.entries.cap().get() as u64;
        let high = high.min(low.saturating_add(cap - 1));
        let mut found = Vec::new();
        for sequence in low..=high {
            let key = format!("{origin}:{sequence}");
            if let Some(message) = self.get(&key) {
                found.push(message.clone());
            }
        }
        found
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MessageCache {
    fn default() -> Self {
        Self::new()
    }
}
