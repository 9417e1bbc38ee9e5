//! Pending-ack bookkeeping and the retry ladder.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::config::Config;
use crate::types::PublicKey;

/// Base inter-attempt backoff; doubles per attempt.
const BACKOFF_BASE: Duration = Duration::from_millis(200);

/// What a pending send is addressed to.
#[derive(Debug, Clone)]
pub enum SendKind {
    /// Direct message; retries may escalate to flood.
    Direct {
        /// Recipient key, needed for resends and path discovery.
        recipient: PublicKey,
    },
    /// Channel message; already a broadcast, so no flood rungs.
    Channel {
        /// Channel index.
        index: u8,
    },
}

/// Where a pending send is in its delivery lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPhase {
    /// Waiting for the acknowledgement of the latest attempt.
    AwaitingAck,
    /// Attempt expired; holding off until the backoff elapses.
    BackingOff { until: Instant },
    /// A resend is in flight through the session.
    Resending,
}

/// One tracked outbound message.
#[derive(Debug, Clone)]
pub struct PendingSend {
    /// Persisted message id.
    pub message_id: Uuid,
    /// Addressing, for resends.
    pub kind: SendKind,
    /// Message text, for resends.
    pub text: String,
    /// Original sender timestamp; reused on every attempt so the content
    /// hash stays stable.
    pub sender_ts: u32,
    /// Attempts made so far (1-indexed).
    pub attempt: u8,
    /// Ack code of the latest attempt (little-endian decode).
    pub ack_code: u32,
    /// When the latest attempt was handed to the device.
    pub sent_at: Instant,
    /// Ack timeout for the latest attempt, buffer applied.
    pub timeout: Duration,
    /// Lifecycle phase.
    pub phase: SendPhase,
}

impl PendingSend {
    /// Deadline after which the current attempt counts as lost.
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.sent_at + self.timeout
    }

    /// True when the latest attempt expired unacknowledged.
    #[must_use]
    pub fn expired(&self, now: Instant) -> bool {
        self.phase == SendPhase::AwaitingAck && now > self.deadline()
    }
}

/// Backoff observed after attempt `k` (1-indexed): 200 ms doubling.
#[must_use]
pub fn backoff_after(attempt: u8) -> Duration {
    BACKOFF_BASE * 2u32.saturating_pow(u32::from(attempt.saturating_sub(1)))
}

/// Total attempts the ladder allows under this configuration.
#[must_use]
pub fn max_ladder_attempts(config: &Config, kind: &SendKind) -> u8 {
    match kind {
        SendKind::Direct { .. } if config.flood_fallback_on_retry => config
            .max_attempts
            .min(config.flood_after.saturating_add(config.max_flood_attempts)),
        SendKind::Direct { .. } => config.max_attempts.min(config.flood_after),
        SendKind::Channel { .. } => config.max_attempts,
    }
}

/// Whether attempt `k` (1-indexed) goes out via flood.
#[must_use]
pub fn is_flood_attempt(config: &Config, kind: &SendKind, attempt: u8) -> bool {
    matches!(kind, SendKind::Direct { .. })
        && config.flood_fallback_on_retry
        && attempt > config.flood_after
}

/// Applies the configured safety buffer to a device-suggested timeout.
#[must_use]
pub fn buffered_timeout(config: &Config, suggested_ms: u32) -> Duration {
    let ms = (f64::from(suggested_ms) * f64::from(config.ack_timeout_buffer_multiplier)).ceil();
    #[allow(clippy::cast_sign_loss)]
    Duration::from_millis(ms.max(0.0) as u64)
}

/// In-flight sends keyed by their expected ack code.
#[derive(Default)]
pub struct AckTracker {
    by_code: HashMap<u32, PendingSend>,
}

impl AckTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a send under its expected ack code.
    pub fn track(&mut self, send: PendingSend) {
        self.by_code.insert(send.ack_code, send);
    }

    /// Resolves an inbound ack code; the matched entry leaves the
    /// tracker.
    pub fn resolve(&mut self, code: u32) -> Option<PendingSend> {
        self.by_code.remove(&code)
    }

    /// All entries whose current attempt expired by `now`.
    pub fn expired(&self, now: Instant) -> Vec<u32> {
        self.by_code
            .iter()
            .filter(|(_, s)| s.expired(now))
            .map(|(code, _)| *code)
            .collect()
    }

    /// Mutable access by ack code.
    pub fn get_mut(&mut self, code: u32) -> Option<&mut PendingSend> {
        self.by_code.get_mut(&code)
    }

    /// Number of tracked sends.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    /// True when nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn direct_kind() -> SendKind {
        SendKind::Direct {
            recipient: PublicKey::from_bytes(&[9; 32]),
        }
    }

    #[test]
    fn test_backoff_doubles_from_200ms() {
        assert_eq!(backoff_after(1), Duration::from_millis(200));
        assert_eq!(backoff_after(2), Duration::from_millis(400));
        assert_eq!(backoff_after(3), Duration::from_millis(800));
        assert_eq!(backoff_after(4), Duration::from_millis(1600));
    }

    #[test]
    fn test_ladder_shape_with_defaults() {
        let config = Config::default();
        let kind = direct_kind();
        assert_eq!(max_ladder_attempts(&config, &kind), 4);
        assert!(!is_flood_attempt(&config, &kind, 1));
        assert!(!is_flood_attempt(&config, &kind, 2));
        assert!(is_flood_attempt(&config, &kind, 3));
        assert!(is_flood_attempt(&config, &kind, 4));
    }

    #[test]
    fn test_ladder_without_flood_fallback() {
        let config = Config {
            flood_fallback_on_retry: false,
            ..Config::default()
        };
        let kind = direct_kind();
        assert_eq!(max_ladder_attempts(&config, &kind), 2);
        assert!(!is_flood_attempt(&config, &kind, 3));
    }

    #[test]
    fn test_channel_sends_never_flood() {
        let config = Config::default();
        let kind = SendKind::Channel { index: 0 };
        assert_eq!(max_ladder_attempts(&config, &kind), 4);
        assert!(!is_flood_attempt(&config, &kind, 4));
    }

    #[test]
    fn test_buffered_timeout_applies_multiplier() {
        let config = Config::default();
        assert_eq!(buffered_timeout(&config, 1000), Duration::from_millis(1200));
        assert_eq!(buffered_timeout(&config, 0), Duration::from_millis(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracker_expiry() {
        let mut tracker = AckTracker::new();
        tracker.track(PendingSend {
            message_id: Uuid::new_v4(),
            kind: direct_kind(),
            text: "hi".into(),
            sender_ts: 1,
            attempt: 1,
            ack_code: 42,
            sent_at: Instant::now(),
            timeout: Duration::from_millis(1200),
            phase: SendPhase::AwaitingAck,
        });

        assert!(tracker.expired(Instant::now()).is_empty());
        tokio::time::advance(Duration::from_millis(1300)).await;
        assert_eq!(tracker.expired(Instant::now()), vec![42]);

        let resolved = tracker.resolve(42).unwrap();
        assert_eq!(resolved.ack_code, 42);
        assert!(tracker.is_empty());
        assert!(tracker.resolve(42).is_none());
    }
}
