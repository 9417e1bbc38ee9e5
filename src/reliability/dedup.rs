//! Inbound message deduplication.
//!
//! The mesh is at-least-once: retries and flood routing surface the same
//! message more than once. Each peer (direct sender or channel) gets a
//! small LRU window of recently seen messages; anything already in the
//! window is dropped before it reaches persistence.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::types::KeyPrefix;

/// Identifies a dedup window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Peer {
    /// Direct messages from one sender (wire identity is the prefix).
    Direct(KeyPrefix),
    /// Messages on one channel.
    Channel(u8),
}

/// Per-peer LRU windows of recently seen message keys.
pub struct DedupCache {
    windows: HashMap<Peer, LruCache<String, ()>>,
    direct_cap: NonZeroUsize,
    channel_cap: NonZeroUsize,
}

impl DedupCache {
    /// Creates a cache with the given per-peer window sizes.
    #[must_use]
    pub fn new(direct_cap: usize, channel_cap: usize) -> Self {
        Self {
            windows: HashMap::new(),
            direct_cap: NonZeroUsize::new(direct_cap.max(1)).expect("capacity floor is 1"),
            channel_cap: NonZeroUsize::new(channel_cap.max(1)).expect("capacity floor is 1"),
        }
    }

    /// Records a message key. Returns `true` when the message is fresh,
    /// `false` when it was already in the window (a duplicate).
    ///
    /// Fresh and duplicate keys both count as a touch for LRU purposes.
    pub fn observe(&mut self, peer: Peer, key: &str) -> bool {
        let cap = match peer {
            Peer::Direct(_) => self.direct_cap,
            Peer::Channel(_) => self.channel_cap,
        };
        let window = self
            .windows
            .entry(peer)
            .or_insert_with(|| LruCache::new(cap));
        if window.get(key).is_some() {
            return false;
        }
        window.put(key.to_string(), ());
        true
    }
}

/// Key for a direct message window entry.
#[must_use]
pub fn direct_key(sender_ts: u32, text: &str) -> String {
    format!("{sender_ts}:{text}")
}

/// Key for a channel message window entry.
#[must_use]
pub fn channel_key(sender_ts: u32, sender_name: &str, text: &str) -> String {
    format!("{sender_ts}:{sender_name}:{text}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefix(byte: u8) -> KeyPrefix {
        KeyPrefix::from_bytes(&[byte; 6])
    }

    #[test]
    fn test_duplicate_detected() {
        let mut cache = DedupCache::new(5, 10);
        let key = direct_key(100, "hello");
        assert!(cache.observe(Peer::Direct(prefix(1)), &key));
        assert!(!cache.observe(Peer::Direct(prefix(1)), &key));
    }

    #[test]
    fn test_windows_are_per_peer() {
        let mut cache = DedupCache::new(5, 10);
        let key = direct_key(100, "hello");
        assert!(cache.observe(Peer::Direct(prefix(1)), &key));
        // Same content from a different peer is not a duplicate.
        assert!(cache.observe(Peer::Direct(prefix(2)), &key));
        assert!(cache.observe(Peer::Channel(0), &key));
    }

    #[test]
    fn test_lru_eviction_by_capacity() {
        let mut cache = DedupCache::new(2, 10);
        let peer = Peer::Direct(prefix(1));
        assert!(cache.observe(peer.clone(), &direct_key(1, "a")));
        assert!(cache.observe(peer.clone(), &direct_key(2, "b")));
        // Evicts "a" (least recent).
        assert!(cache.observe(peer.clone(), &direct_key(3, "c")));
        // "a" fell out of the window, so it reads as fresh again.
        assert!(cache.observe(peer.clone(), &direct_key(1, "a")));
        // "c" is still in the window.
        assert!(!cache.observe(peer, &direct_key(3, "c")));
    }

    #[test]
    fn test_touch_refreshes_recency() {
        let mut cache = DedupCache::new(2, 10);
        let peer = Peer::Direct(prefix(1));
        assert!(cache.observe(peer.clone(), &direct_key(1, "a")));
        assert!(cache.observe(peer.clone(), &direct_key(2, "b")));
        // Touch "a": now "b" is the eviction candidate.
        assert!(!cache.observe(peer.clone(), &direct_key(1, "a")));
        assert!(cache.observe(peer.clone(), &direct_key(3, "c")));
        assert!(!cache.observe(peer.clone(), &direct_key(1, "a")));
        assert!(cache.observe(peer, &direct_key(2, "b")));
    }

    #[test]
    fn test_channel_key_includes_sender() {
        let mut cache = DedupCache::new(5, 10);
        assert!(cache.observe(Peer::Channel(0), &channel_key(1, "alice", "hi")));
        assert!(cache.observe(Peer::Channel(0), &channel_key(1, "bob", "hi")));
        assert!(!cache.observe(Peer::Channel(0), &channel_key(1, "alice", "hi")));
    }
}
