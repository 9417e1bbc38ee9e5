//! Data types for mesh node entities.
//!
//! - Contacts and public keys
//! - Device information and channels
//! - Messages (wire events and the persistent entity)
//! - Remote status and statistics
//! - Telemetry

pub mod contact;
pub mod device;
pub mod message;
pub mod stats;
pub mod telemetry;

pub use contact::{Contact, ContactFlags, ContactType, KeyPrefix, PublicKey};
pub use device::{BatteryStatus, ChannelInfo, DeviceInfo, RadioConfig, SelfInfo};
pub use message::{
    Acknowledgement, ChannelMessage, ContactMessage, Direction, Message, MessageKind,
    MessageStatus, TextType, split_channel_text,
};
pub use stats::{DeviceStats, RemoteNodeStatus};
pub use telemetry::{TelemetryReading, TelemetryValue, parse_lpp};
