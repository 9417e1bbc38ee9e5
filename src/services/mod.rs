//! Application services: thin facades over the session, engine and store.
//!
//! No service holds a reference to another; coordination happens through
//! the event bus, engine notifications and the store.

pub mod channel;
pub mod contact;
pub mod message;
pub mod remote;

pub use channel::ChannelService;
pub use contact::{ContactService, SyncReport};
pub use message::MessageService;
pub use remote::RemoteNodeService;

/// Current Unix time as the wire's u32 seconds.
pub(crate) fn now_ts() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or(0)
}
