//! Library configuration.
//!
//! A [`Config`] is built once and handed to [`Session::connect`] and
//! [`Engine::spawn`]; it is never mutated afterwards.
//!
//! [`Session::connect`]: crate::session::Session::connect
//! [`Engine::spawn`]: crate::reliability::Engine::spawn

use std::time::Duration;

/// Immutable configuration shared by the session and the reliability engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identity string sent in the `AppStart` handshake.
    pub app_name: String,
    /// Default timeout for a command round-trip.
    pub default_timeout: Duration,
    /// Timeout used while the transport may be mid-pairing.
    pub pairing_timeout: Duration,
    /// Total send attempts before a message is marked failed.
    pub max_attempts: u8,
    /// Attempts sent via the contact's current routing before flood fallback.
    pub flood_after: u8,
    /// Flood attempts allowed after the direct attempts are exhausted.
    pub max_flood_attempts: u8,
    /// Whether retries escalate to flood routing at all.
    pub flood_fallback_on_retry: bool,
    /// Issue a path discovery for the recipient after the last flood attempt.
    pub trigger_path_discovery_after_flood: bool,
    /// Dedup cache entries kept per direct peer.
    pub direct_dedup_cap: u16,
    /// Dedup cache entries kept per channel.
    pub channel_dedup_cap: u16,
    /// Channel messages kept in the reaction index.
    pub reaction_index_cap: u16,
    /// How long an unresolved reaction waits for its target message.
    pub pending_reaction_ttl: Duration,
    /// Safety factor applied to the device's suggested ack timeout.
    pub ack_timeout_buffer_multiplier: f32,
}

impl Config {
    /// Creates a configuration with the given handshake identity and
    /// defaults for everything else.
    #[must_use]
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            ..Self::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_name: "meshmate".into(),
            default_timeout: Duration::from_secs(5),
            pairing_timeout: Duration::from_secs(40),
            max_attempts: 4,
            flood_after: 2,
            max_flood_attempts: 2,
            flood_fallback_on_retry: true,
            trigger_path_discovery_after_flood: true,
            direct_dedup_cap: 5,
            channel_dedup_cap: 10,
            reaction_index_cap: 512,
            pending_reaction_ttl: Duration::from_secs(120),
            ack_timeout_buffer_multiplier: 1.2,
        }
    }
}
