//! Parsed event algebra and the event bus.
//!
//! Every frame received from the node parses into exactly one [`Event`].
//! Solicited events satisfy session waiters; everything else fans out
//! through the [`bus::EventBus`] to filtered subscribers.

pub mod bus;
pub mod filter;

use bytes::Bytes;

use crate::types::{
    Acknowledgement, BatteryStatus, ChannelInfo, ChannelMessage, Contact, ContactMessage,
    DeviceInfo, DeviceStats, KeyPrefix, PublicKey, RemoteNodeStatus, SelfInfo, TelemetryReading,
};

pub use bus::{EventBus, Subscription};
pub use filter::Filter;

/// Result of a login attempt pushed by a remote node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginInfo {
    /// Whether the node granted admin rights.
    pub is_admin: bool,
    /// Prefix of the responding node.
    pub prefix: KeyPrefix,
    /// Server clock, when reported.
    pub server_ts: Option<u32>,
    /// Access control level, when reported.
    pub acl: Option<u8>,
    /// Remote firmware level, when reported.
    pub firmware_level: Option<u8>,
}

/// Every frame the node can send, as one closed sum.
#[derive(Debug, Clone)]
pub enum Event {
    /// Command completed successfully, optionally with a u32 value.
    Ok { value: Option<u32> },
    /// Command failed, optionally with a device error code.
    Error { code: Option<u8> },
    /// The requested feature is disabled on this device.
    Disabled,
    /// Device info (handshake step one).
    DeviceInfo(Box<DeviceInfo>),
    /// Self info (handshake step two).
    SelfInfo(Box<SelfInfo>),
    /// Current device time (Unix seconds).
    CurrentTime(u32),
    /// Battery and storage status.
    Battery(BatteryStatus),
    /// Start of a contact list (expected count follows).
    ContactsStart { count: u32 },
    /// One contact record.
    Contact(Box<Contact>),
    /// End of a contact list (device-side last modification timestamp).
    ContactsEnd { last_modified: u32 },
    /// Direct message received.
    ContactMessage(Box<ContactMessage>),
    /// Channel message received.
    ChannelMessage(Box<ChannelMessage>),
    /// The device accepted a send and expects this ack.
    MessageSent {
        /// Message type echo.
        text_type: u8,
        /// Raw 4-byte expected ack code.
        expected_ack: [u8; 4],
        /// Device-suggested ack timeout in milliseconds.
        suggested_timeout_ms: u32,
    },
    /// Delivery acknowledgement push.
    Acknowledgement(Acknowledgement),
    /// Messages are queued on the device.
    MessagesWaiting,
    /// The device message queue is drained.
    NoMoreMessages,
    /// Advertisement carrying a node key (or only its prefix on short
    /// frames).
    Advertisement {
        public_key: Option<PublicKey>,
        prefix: KeyPrefix,
    },
    /// Routing path for a node changed.
    PathUpdate {
        public_key: Option<PublicKey>,
        prefix: KeyPrefix,
    },
    /// Full contact advertisement push.
    NewAdvert(Box<Contact>),
    /// Remote node status response.
    StatusResponse(Box<RemoteNodeStatus>),
    /// Remote telemetry response.
    TelemetryResponse {
        prefix: KeyPrefix,
        readings: Vec<TelemetryReading>,
    },
    /// Binary response payload.
    BinaryResponse(Bytes),
    /// Path discovery response payload.
    PathDiscoveryResponse(Bytes),
    /// Control data push.
    ControlData {
        snr: f32,
        rssi: i8,
        path_len: u8,
        payload_type: u8,
        payload: Bytes,
    },
    /// Raw data push.
    RawData(Bytes),
    /// Device log line.
    LogData(String),
    /// Trace path data.
    TraceData(Bytes),
    /// Channel configuration.
    ChannelInfo(Box<ChannelInfo>),
    /// Device statistics.
    Stats(DeviceStats),
    /// Login accepted.
    LoginSuccess(LoginInfo),
    /// Login rejected.
    LoginFail { prefix: KeyPrefix },
    /// The frame could not be parsed. Not an error: counted by the
    /// session and visible to subscribers.
    ParseFailure { code: u8, reason: String },
}

impl Event {
    /// The sender/subject key prefix carried by this event, if any.
    #[must_use]
    pub fn prefix(&self) -> Option<KeyPrefix> {
        match self {
            Self::ContactMessage(msg) => Some(msg.sender_prefix),
            Self::Advertisement { prefix, .. } | Self::PathUpdate { prefix, .. } => Some(*prefix),
            Self::NewAdvert(contact) => Some(contact.public_key.prefix()),
            Self::StatusResponse(status) => Some(status.prefix),
            Self::TelemetryResponse { prefix, .. } => Some(*prefix),
            Self::LoginSuccess(info) => Some(info.prefix),
            Self::LoginFail { prefix } => Some(*prefix),
            _ => None,
        }
    }
}
