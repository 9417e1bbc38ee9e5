//! Content-addressed emoji reactions on channel messages.
//!
//! A reaction is ordinary channel text of the form
//! `{emoji} @[{sender}] {preview} [{id}]` where `{id}` is the first 40
//! bits of `SHA-256(sender_ts_le ‖ text)` rendered as 8 Crockford-Base32
//! characters. Receivers resolve the target by looking up
//! `(channel, sender, hash)` in an LRU index of recent channel messages
//! and requiring an exact preview match. Reactions that arrive before
//! their target wait in a bounded TTL queue.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use unicode_segmentation::UnicodeSegmentation;
use uuid::Uuid;

/// Byte budget for generated previews, ellipsis included.
pub const PREVIEW_MAX_BYTES: usize = 32;

/// Crockford Base32 alphabet, lowercase (no i, l, o, u).
const ALPHABET: &[u8; 32] = b"0123456789abcdefghjkmnpqrstvwxyz";

const ELLIPSIS: &str = "\u{2026}";

/// Hashes message content into the 8-character reaction id.
#[must_use]
pub fn message_hash(text: &str, sender_ts: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sender_ts.to_le_bytes());
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();

    // First 40 bits, 5 bits per character, most significant first.
    let mut value = 0u64;
    for &b in &digest[..5] {
        value = (value << 8) | u64::from(b);
    }
    (0..8)
        .rev()
        .map(|i| ALPHABET[usize::try_from((value >> (i * 5)) & 0x1F).unwrap_or(0)] as char)
        .collect()
}

/// Normalizes a candidate reaction id: case-insensitive, `O`→`0`,
/// `I`/`L`→`1`. Returns `None` unless the result is exactly 8 characters
/// of the alphabet.
#[must_use]
pub fn normalize_hash(raw: &str) -> Option<String> {
    if raw.chars().count() != 8 {
        return None;
    }
    raw.chars()
        .map(|c| {
            let c = match c.to_ascii_lowercase() {
                'o' => '0',
                'i' | 'l' => '1',
                c => c,
            };
            ALPHABET.contains(&u32::from(c).try_into().ok()?).then_some(c)
        })
        .collect()
}

/// Truncates text to `max_bytes` UTF-8 bytes at a grapheme boundary,
/// appending an ellipsis when anything was cut. The ellipsis counts
/// toward the budget, so the result never exceeds `max_bytes`.
#[must_use]
pub fn preview(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }

    let budget = max_bytes.saturating_sub(ELLIPSIS.len());
    let mut out = String::new();
    for grapheme in text.graphemes(true) {
        if out.len() + grapheme.len() > budget {
            break;
        }
        out.push_str(grapheme);
    }
    if max_bytes >= ELLIPSIS.len() {
        out.push_str(ELLIPSIS);
    }
    out
}

/// A reaction parsed out of channel text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReaction {
    /// The reaction emoji (everything before the sender marker).
    pub emoji: String,
    /// Claimed sender of the target message.
    pub target_sender: String,
    /// Preview of the target text, compared byte-exact on resolution.
    pub content_preview: String,
    /// Normalized 8-character content hash.
    pub message_hash: String,
}

/// Parses `{emoji} @[{sender}] {preview} [{id}]`, or `None` for ordinary
/// text.
#[must_use]
pub fn parse_reaction(text: &str) -> Option<ParsedReaction> {
    let (emoji, rest) = text.split_once(" @[")?;
    if emoji.is_empty() {
        return None;
    }
    let (sender, rest) = rest.split_once("] ")?;
    if sender.is_empty() {
        return None;
    }
    let rest = rest.strip_suffix(']')?;
    let marker = rest.rfind(" [")?;
    let content_preview = &rest[..marker];
    if content_preview.is_empty() {
        return None;
    }
    let message_hash = normalize_hash(&rest[marker + 2..])?;

    Some(ParsedReaction {
        emoji: emoji.to_string(),
        target_sender: sender.to_string(),
        content_preview: content_preview.to_string(),
        message_hash,
    })
}

/// Renders a reaction to its target as channel text.
#[must_use]
pub fn compose_reaction(emoji: &str, target_sender: &str, target_text: &str, target_ts: u32) -> String {
    format!(
        "{emoji} @[{target_sender}] {} [{}]",
        preview(target_text, PREVIEW_MAX_BYTES),
        message_hash(target_text, target_ts)
    )
}

/// A channel message retained for reaction targeting.
#[derive(Debug, Clone)]
pub struct IndexedMessage {
    /// Persisted message id.
    pub message_id: Uuid,
    /// Channel the message was seen on.
    pub channel_index: u8,
    /// Sender display name.
    pub sender_name: String,
    /// Content hash of `(text, sender_ts)`.
    pub hash: String,
    /// Preview generated from the text.
    pub preview: String,
    /// When this entry was indexed.
    pub indexed_at: Instant,
}

impl IndexedMessage {
    /// Builds an index entry from a channel message.
    #[must_use]
    pub fn new(
        message_id: Uuid,
        channel_index: u8,
        sender_name: &str,
        text: &str,
        sender_ts: u32,
    ) -> Self {
        Self {
            message_id,
            channel_index,
            sender_name: sender_name.to_string(),
            hash: message_hash(text, sender_ts),
            preview: preview(text, PREVIEW_MAX_BYTES),
            indexed_at: Instant::now(),
        }
    }
}

/// A reaction whose target has not been seen yet.
#[derive(Debug, Clone)]
pub struct PendingReaction {
    /// The parsed reaction.
    pub parsed: ParsedReaction,
    /// Channel it arrived on.
    pub channel_index: u8,
    /// Node that sent the reaction.
    pub sender_name: String,
    /// Raw channel text it was parsed from.
    pub raw_text: String,
    /// Enqueue time, for TTL expiry.
    pub enqueued_at: Instant,
}

/// Outcome of resolving one inbound reaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The target is known.
    Resolved { target: Uuid },
    /// No candidate shares the hash yet; queued for later.
    Deferred,
    /// Candidates share the hash but none matches the preview. Dropped
    /// rather than guessed.
    Unresolvable,
}

/// LRU index of recent channel messages plus the pending-reaction queue.
pub struct ReactionIndex {
    entries: LruCache<Uuid, IndexedMessage>,
    pending: VecDeque<PendingReaction>,
    ttl: Duration,
}

impl ReactionIndex {
    /// Creates an index bounded to `capacity` messages with the given
    /// pending-reaction TTL.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity floor is 1");
        Self {
            entries: LruCache::new(capacity),
            pending: VecDeque::new(),
            ttl,
        }
    }

    /// Indexes a message and resolves any pending reactions it satisfies.
    pub fn insert(&mut self, message: IndexedMessage) -> Vec<(PendingReaction, Uuid)> {
        let target = message.message_id;
        let mut resolved = Vec::new();
        let mut keep = VecDeque::with_capacity(self.pending.len());
        while let Some(pending) = self.pending.pop_front() {
            if pending.channel_index == message.channel_index
                && pending.parsed.target_sender == message.sender_name
                && pending.parsed.message_hash == message.hash
                && pending.parsed.content_preview == message.preview
            {
                resolved.push((pending, target));
            } else {
                keep.push_back(pending);
            }
        }
        self.pending = keep;
        self.entries.put(target, message);
        resolved
    }

    /// Resolves a parsed reaction against the index.
    pub fn resolve(
        &mut self,
        parsed: &ParsedReaction,
        channel_index: u8,
        sender_name: &str,
        raw_text: &str,
    ) -> Resolution {
        let mut saw_hash = false;
        // Iteration is most-recently-indexed first, so the first preview
        // match is the right one on hash collisions.
        for (_, entry) in self.entries.iter() {
            if entry.channel_index != channel_index
                || entry.sender_name != parsed.target_sender
                || entry.hash != parsed.message_hash
            {
                continue;
            }
            saw_hash = true;
            if entry.preview == parsed.content_preview {
                return Resolution::Resolved {
                    target: entry.message_id,
                };
            }
        }

        if saw_hash {
            return Resolution::Unresolvable;
        }

        self.pending.push_back(PendingReaction {
            parsed: parsed.clone(),
            channel_index,
            sender_name: sender_name.to_string(),
            raw_text: raw_text.to_string(),
            enqueued_at: Instant::now(),
        });
        Resolution::Deferred
    }

    /// Removes and returns pending reactions older than the TTL.
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<PendingReaction> {
        let ttl = self.ttl;
        let mut expired = Vec::new();
        self.pending.retain(|p| {
            if now.duration_since(p.enqueued_at) > ttl {
                expired.push(p.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    /// Number of messages currently indexed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of reactions waiting for their target.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable_and_well_formed() {
        let a = message_hash("Hello world", 1_704_067_200);
        let b = message_hash("Hello world", 1_704_067_200);
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
        assert!(a.bytes().all(|c| ALPHABET.contains(&c)));

        assert_ne!(a, message_hash("Hello world", 1_704_067_201));
        assert_ne!(a, message_hash("Hello world!", 1_704_067_200));
    }

    #[test]
    fn test_normalize_hash_aliases() {
        assert_eq!(
            normalize_hash("O1IL2abc").as_deref(),
            Some("01112abc")
        );
        assert_eq!(normalize_hash("ABCDEFGH").as_deref(), Some("abcdefgh"));
        assert_eq!(normalize_hash("abcdefg"), None); // 7 chars
        assert_eq!(normalize_hash("abcdefguu"), None); // 9 chars
        assert_eq!(normalize_hash("abcdefgu"), None); // u excluded
    }

    #[test]
    fn test_preview_respects_byte_budget() {
        let cases = [
            ("short", 32),
            ("a much longer line of text that will not fit", 16),
            ("héllö wörld with äccents", 10),
            ("👍👍👍👍👍👍👍👍", 12),
            ("x", 0),
            ("family: 👨‍👩‍👧‍👦 emoji", 8),
        ];
        for (text, max_bytes) in cases {
            let p = preview(text, max_bytes);
            assert!(
                p.len() <= max_bytes || text.len() <= max_bytes,
                "preview({text:?}, {max_bytes}) = {p:?} is over budget"
            );
            assert!(p.len() <= max_bytes.max(text.len()));
        }
    }

    #[test]
    fn test_preview_unchanged_when_it_fits() {
        assert_eq!(preview("fits fine", 32), "fits fine");
    }

    #[test]
    fn test_preview_cuts_at_grapheme_boundary() {
        // Each thumbs-up is 4 bytes; budget 11 leaves 8 after the
        // ellipsis, i.e. two whole emoji.
        let p = preview("👍👍👍👍", 11);
        assert_eq!(p, "👍👍…");
    }

    #[test]
    fn test_parse_reaction_grammar() {
        let hash = message_hash("Hello world", 1_704_067_200);
        let text = format!("👍 @[AlphaNode] Hello world [{hash}]");
        let parsed = parse_reaction(&text).unwrap();
        assert_eq!(parsed.emoji, "👍");
        assert_eq!(parsed.target_sender, "AlphaNode");
        assert_eq!(parsed.content_preview, "Hello world");
        assert_eq!(parsed.message_hash, hash);
    }

    #[test]
    fn test_parse_reaction_normalizes_id() {
        let text = "🔥 @[Node] some text [O1ILabcd]";
        let parsed = parse_reaction(text).unwrap();
        assert_eq!(parsed.message_hash, "0111abcd");
    }

    #[test]
    fn test_parse_reaction_rejects_malformed() {
        assert!(parse_reaction("just a normal message").is_none());
        assert!(parse_reaction("👍 @[Node] [abcdefgh]").is_none()); // empty preview
        assert!(parse_reaction(" @[Node] text [abcdefgh]").is_none()); // empty emoji
        assert!(parse_reaction("👍 @[Node] text [toolonghash]").is_none());
        assert!(parse_reaction("👍 @[Node] text [abcdefgu]").is_none()); // bad alphabet
        assert!(parse_reaction("👍 @[Node] text abcdefgh").is_none()); // no brackets
    }

    #[test]
    fn test_compose_parse_roundtrip() {
        let text = compose_reaction("🎉", "Base-1", "deploy done", 1_700_000_000);
        let parsed = parse_reaction(&text).unwrap();
        assert_eq!(parsed.emoji, "🎉");
        assert_eq!(parsed.target_sender, "Base-1");
        assert_eq!(parsed.content_preview, "deploy done");
        assert_eq!(parsed.message_hash, message_hash("deploy done", 1_700_000_000));
    }

    fn index() -> ReactionIndex {
        ReactionIndex::new(512, Duration::from_secs(120))
    }

    #[test]
    fn test_resolve_indexed_message() {
        let mut idx = index();
        let id = Uuid::new_v4();
        idx.insert(IndexedMessage::new(
            id,
            0,
            "AlphaNode",
            "Hello world",
            1_704_067_200,
        ));

        let hash = message_hash("Hello world", 1_704_067_200);
        let text = format!("👍 @[AlphaNode] Hello world [{hash}]");
        let parsed = parse_reaction(&text).unwrap();

        assert_eq!(
            idx.resolve(&parsed, 0, "BetaNode", &text),
            Resolution::Resolved { target: id }
        );
    }

    #[test]
    fn test_resolve_requires_matching_preview() {
        let mut idx = index();
        idx.insert(IndexedMessage::new(
            Uuid::new_v4(),
            0,
            "AlphaNode",
            "Hello world",
            1_704_067_200,
        ));

        let hash = message_hash("Hello world", 1_704_067_200);
        let text = format!("👍 @[AlphaNode] Something else [{hash}]");
        let parsed = parse_reaction(&text).unwrap();

        // Same hash, wrong preview: refused rather than guessed.
        assert_eq!(
            idx.resolve(&parsed, 0, "BetaNode", &text),
            Resolution::Unresolvable
        );
        assert_eq!(idx.pending_len(), 0);
    }

    #[test]
    fn test_unknown_target_defers_then_resolves_on_index() {
        let mut idx = index();
        let hash = message_hash("late message", 50);
        let text = format!("👍 @[AlphaNode] late message [{hash}]");
        let parsed = parse_reaction(&text).unwrap();

        assert_eq!(idx.resolve(&parsed, 2, "BetaNode", &text), Resolution::Deferred);
        assert_eq!(idx.pending_len(), 1);

        let id = Uuid::new_v4();
        let resolved = idx.insert(IndexedMessage::new(id, 2, "AlphaNode", "late message", 50));
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].1, id);
        assert_eq!(idx.pending_len(), 0);
    }

    #[test]
    fn test_channel_must_match() {
        let mut idx = index();
        let id = Uuid::new_v4();
        idx.insert(IndexedMessage::new(id, 1, "AlphaNode", "hi", 10));

        let hash = message_hash("hi", 10);
        let text = format!("👍 @[AlphaNode] hi [{hash}]");
        let parsed = parse_reaction(&text).unwrap();
        assert_eq!(idx.resolve(&parsed, 0, "BetaNode", &text), Resolution::Deferred);
    }

    #[test]
    fn test_lru_eviction_caps_index() {
        let mut idx = ReactionIndex::new(2, Duration::from_secs(120));
        for i in 0..3u32 {
            idx.insert(IndexedMessage::new(
                Uuid::new_v4(),
                0,
                "Node",
                &format!("msg {i}"),
                i,
            ));
        }
        assert_eq!(idx.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_ttl_sweep() {
        let mut idx = ReactionIndex::new(16, Duration::from_secs(120));
        let hash = message_hash("gone", 1);
        let text = format!("👍 @[Node] gone [{hash}]");
        let parsed = parse_reaction(&text).unwrap();
        assert_eq!(idx.resolve(&parsed, 0, "Other", &text), Resolution::Deferred);

        tokio::time::advance(Duration::from_secs(119)).await;
        assert!(idx.sweep_expired(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        let expired = idx.sweep_expired(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(idx.pending_len(), 0);
    }
}
