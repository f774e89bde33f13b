//! Channel adapter: the uniform contract every chat provider implements.
//!
//! Generalizes `messaging::traits::Messaging`/`MessagingDyn`'s dual-trait
//! shape, but — for consistency with this crate's other object-safe
//! traits (`store::GroupStore`, `backend::Backend`) — uses `async_trait`
//! rather than reproducing the teacher's async-fn-in-trait-plus-blanket-
//! `*Dyn`-companion pattern (see `DESIGN.md` for this deviation).

pub mod discord;
pub mod reconnect;
pub mod signal;
pub mod slack;
pub mod telegram;
pub mod whatsapp;

pub use reconnect::Reconnector;

use crate::error::Result;
use crate::{Jid, OutboundResponse};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Callback invoked when a channel discovers a chat (group/DM) it has
/// access to, independent of whether that chat is registered yet.
pub type OnChatMetadata =
    Arc<dyn Fn(Jid, chrono::DateTime<chrono::Utc>, Option<String>, &'static str, bool) + Send + Sync>;

/// Callback invoked for every inbound message in a *registered* chat.
pub type OnMessage = Arc<dyn Fn(crate::InboundMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Invoked after a channel's watchdog successfully reconnects, so the
/// scheduler can re-enqueue chats that went stale during the outage.
pub type OnRecovery = Arc<dyn Fn(&'static str) -> BoxFuture<'static, ()> + Send + Sync>;

/// Shared callback bundle every channel adapter is constructed with.
#[derive(Clone)]
pub struct ChannelOpts {
    pub on_message: OnMessage,
    pub on_chat_metadata: OnChatMetadata,
    pub on_recovery: OnRecovery,
}

/// Result of a successful send: the provider's own message id/timestamp,
/// when the provider returns one synchronously.
#[derive(Debug, Clone, Default)]
pub struct SendReceipt {
    pub timestamp: Option<String>,
}

#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Unique adapter name (`"discord"`, `"slack"`, `"telegram"`, `"whatsapp"`, `"signal"`).
    fn name(&self) -> &'static str;

    /// Whether this channel owns `jid` (partitions the JID space by scheme).
    fn owns_jid(&self, jid: &Jid) -> bool {
        jid.scheme() == self.name()
    }

    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    fn is_connected(&self) -> bool;

    /// Send `response` to `jid`. Implementations split text exceeding the
    /// channel's per-message character cap.
    async fn send(&self, jid: &Jid, response: OutboundResponse) -> Result<SendReceipt>;

    /// Best-effort typing indicator; a no-op implementation is acceptable.
    async fn set_typing(&self, jid: &Jid, typing: bool) -> Result<()> {
        let _ = (jid, typing);
        Ok(())
    }
}

/// Per-channel character cap used to split outbound text before sending.
/// Splits on the nearest preceding newline within the cap when possible,
/// matching the word/line-boundary-aware chunking `messaging/discord.rs`'s
/// `split_message` uses.
pub fn split_message(text: &str, cap: usize) -> Vec<String> {
    if text.chars().count() <= cap {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        let char_count = remaining.chars().count();
        if char_count <= cap {
            chunks.push(remaining.to_string());
            break;
        }

        let boundary_byte = remaining
            .char_indices()
            .take(cap)
            .last()
            .map(|(idx, ch)| idx + ch.len_utf8())
            .unwrap_or(remaining.len());
        let window = &remaining[..boundary_byte];
        let split_at = window.rfind('\n').map(|idx| idx + 1).unwrap_or(boundary_byte);
        let split_at = if split_at == 0 { boundary_byte } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = &remaining[split_at..];
    }
    chunks
}

/// Uniform inbound-event dedup, shared by every adapter (spec §4.5): drops
/// an event seen twice within `ttl`, admits the same key again once it ages
/// out. Bounded to `max_entries` so a misbehaving upstream replaying old
/// events can't grow this without limit; the oldest entry is evicted first
/// when the cache is full, same as `queue`'s bounded-state tables.
pub struct DedupCache {
    ttl: Duration,
    max_entries: usize,
    seen: Mutex<VecDeque<(String, Instant)>>,
}

impl DedupCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self { ttl, max_entries, seen: Mutex::new(VecDeque::new()) }
    }

    /// Default policy spec §4.5 names: 5 minute TTL, bounded to 1000 entries.
    pub fn with_defaults() -> Self {
        Self::new(Duration::from_secs(5 * 60), 1000)
    }

    /// Returns `true` the first time `key` is seen within the TTL window,
    /// `false` on every repeat until the entry ages out.
    pub fn insert_if_new(&self, key: String) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock().expect("dedup cache mutex poisoned");
        seen.retain(|(_, at)| now.duration_since(*at) < self.ttl);
        if seen.iter().any(|(existing, _)| existing == &key) {
            return false;
        }
        if seen.len() >= self.max_entries {
            seen.pop_front();
        }
        seen.push_back((key, now));
        true
    }
}

/// Rate-limits ephemeral status updates (typing indicators) to at least
/// `min_gap` apart per chat, per spec §4.5.
pub struct TypingLimiter {
    min_gap: Duration,
    last_sent: Mutex<std::collections::HashMap<String, Instant>>,
}

impl TypingLimiter {
    pub fn new(min_gap: Duration) -> Self {
        Self { min_gap, last_sent: Mutex::new(std::collections::HashMap::new()) }
    }

    pub fn with_defaults() -> Self {
        Self::new(Duration::from_secs(4))
    }

    /// Whether a typing update for `jid` may be sent now; records the
    /// attempt as a side effect so the next call is gated correctly.
    pub fn should_send(&self, jid: &str) -> bool {
        let now = Instant::now();
        let mut last_sent = self.last_sent.lock().expect("typing limiter mutex poisoned");
        match last_sent.get(jid) {
            Some(at) if now.duration_since(*at) < self.min_gap => false,
            _ => {
                last_sent.insert(jid.to_string(), now);
                true
            }
        }
    }
}

/// Replace a channel's native bot-mention token (e.g. Discord's `<@id>`,
/// Slack's `<@Uxxxx>`) with a normalized `@bot` prefix so a group's trigger
/// regex matches the same literal text regardless of which channel carried
/// the mention (spec §4.5).
pub fn normalize_bot_mention(content: &str, raw_mention: &str) -> String {
    if raw_mention.is_empty() {
        return content.to_string();
    }
    content.replace(raw_mention, "@bot")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_not_split() {
        assert_eq!(split_message("hello", 2000), vec!["hello".to_string()]);
    }

    #[test]
    fn long_text_splits_on_newline_boundary_when_available() {
        let text = format!("{}\n{}", "a".repeat(10), "b".repeat(10));
        let chunks = split_message(&text, 15);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].ends_with('\n'));
    }

    #[test]
    fn long_text_without_newline_hard_splits_at_cap() {
        let text = "a".repeat(25);
        let chunks = split_message(&text, 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].chars().count(), 10);
    }

    #[test]
    fn dedup_cache_drops_repeat_within_ttl() {
        let cache = DedupCache::new(Duration::from_secs(300), 1000);
        assert!(cache.insert_if_new("slack:1".to_string()));
        assert!(!cache.insert_if_new("slack:1".to_string()));
    }

    #[test]
    fn dedup_cache_admits_key_after_ttl_elapses() {
        let cache = DedupCache::new(Duration::from_millis(5), 1000);
        assert!(cache.insert_if_new("slack:1".to_string()));
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.insert_if_new("slack:1".to_string()));
    }

    #[test]
    fn dedup_cache_evicts_oldest_once_bound_is_reached() {
        let cache = DedupCache::new(Duration::from_secs(300), 2);
        assert!(cache.insert_if_new("a".to_string()));
        assert!(cache.insert_if_new("b".to_string()));
        assert!(cache.insert_if_new("c".to_string()));
        // "a" was evicted to make room for "c", so it's admitted again.
        assert!(cache.insert_if_new("a".to_string()));
    }

    #[test]
    fn typing_limiter_rate_limits_to_min_gap() {
        let limiter = TypingLimiter::new(Duration::from_millis(50));
        assert!(limiter.should_send("slack:C1"));
        assert!(!limiter.should_send("slack:C1"));
        std::thread::sleep(Duration::from_millis(60));
        assert!(limiter.should_send("slack:C1"));
    }

    #[test]
    fn normalize_bot_mention_rewrites_native_token() {
        let normalized = normalize_bot_mention("<@U123> hello", "<@U123>");
        assert_eq!(normalized, "@bot hello");
    }
}
