//! Response and push code definitions.
//!
//! The first byte of a frame received from the node selects how the rest
//! of the payload is parsed. Codes below 0x80 are solicited responses;
//! codes at or above 0x80 are unsolicited pushes.

/// Response and push frame codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    // Command responses (0x00-0x1F)
    /// Command executed successfully.
    Ok = 0x00,
    /// Command failed with error.
    Error = 0x01,
    /// Start of contact list.
    ContactsStart = 0x02,
    /// Contact data.
    Contact = 0x03,
    /// End of contact list.
    ContactsEnd = 0x04,
    /// Self device information.
    SelfInfo = 0x05,
    /// Message was sent (with ack code).
    MsgSent = 0x06,
    /// Received a contact message (legacy v1).
    ContactMsgRecv = 0x07,
    /// Received a channel message (legacy v1).
    ChannelMsgRecv = 0x08,
    /// Current device time.
    CurrentTime = 0x09,
    /// No more messages available.
    NoMoreMsgs = 0x0A,
    /// Battery and storage status.
    Battery = 0x0C,
    /// Device information.
    DeviceInfo = 0x0D,
    /// Feature is disabled.
    Disabled = 0x0F,
    /// Contact message with SNR (v3).
    ContactMsgRecvV3 = 0x10,
    /// Channel message with SNR (v3).
    ChannelMsgRecvV3 = 0x11,
    /// Channel information.
    ChannelInfo = 0x12,
    /// Statistics response.
    Stats = 0x18,

    // Push notifications (>= 0x80)
    /// Advertisement from another device.
    Advertisement = 0x80,
    /// Path update notification.
    PathUpdate = 0x81,
    /// Acknowledgment received.
    Ack = 0x82,
    /// Messages are waiting on the device.
    MessagesWaiting = 0x83,
    /// Raw data received.
    RawData = 0x84,
    /// Login successful.
    LoginSuccess = 0x85,
    /// Login failed.
    LoginFailed = 0x86,
    /// Remote node status response.
    StatusResponse = 0x87,
    /// Log data.
    LogData = 0x88,
    /// Trace data.
    TraceData = 0x89,
    /// New advertisement push (full contact or bare key).
    NewAdvert = 0x8A,
    /// Telemetry response.
    TelemetryResponse = 0x8B,
    /// Binary response.
    BinaryResponse = 0x8C,
    /// Path discovery response.
    PathDiscoveryResponse = 0x8D,
    /// Control data.
    ControlData = 0x8E,
}

impl PacketType {
    /// Attempts to parse a packet type from a byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Ok),
            0x01 => Some(Self::Error),
            0x02 => Some(Self::ContactsStart),
            0x03 => Some(Self::Contact),
            0x04 => Some(Self::ContactsEnd),
            0x05 => Some(Self::SelfInfo),
            0x06 => Some(Self::MsgSent),
            0x07 => Some(Self::ContactMsgRecv),
            0x08 => Some(Self::ChannelMsgRecv),
            0x09 => Some(Self::CurrentTime),
            0x0A => Some(Self::NoMoreMsgs),
            0x0C => Some(Self::Battery),
            0x0D => Some(Self::DeviceInfo),
            0x0F => Some(Self::Disabled),
            0x10 => Some(Self::ContactMsgRecvV3),
            0x11 => Some(Self::ChannelMsgRecvV3),
            0x12 => Some(Self::ChannelInfo),
            0x18 => Some(Self::Stats),
            0x80 => Some(Self::Advertisement),
            0x81 => Some(Self::PathUpdate),
            0x82 => Some(Self::Ack),
            0x83 => Some(Self::MessagesWaiting),
            0x84 => Some(Self::RawData),
            0x85 => Some(Self::LoginSuccess),
            0x86 => Some(Self::LoginFailed),
            0x87 => Some(Self::StatusResponse),
            0x88 => Some(Self::LogData),
            0x89 => Some(Self::TraceData),
            0x8A => Some(Self::NewAdvert),
            0x8B => Some(Self::TelemetryResponse),
            0x8C => Some(Self::BinaryResponse),
            0x8D => Some(Self::PathDiscoveryResponse),
            0x8E => Some(Self::ControlData),
            _ => None,
        }
    }

    /// Returns true if this is a push notification (unsolicited frame).
    #[must_use]
    pub const fn is_push(&self) -> bool {
        (*self as u8) >= 0x80
    }

    /// Returns true if this is a response to a command.
    #[must_use]
    pub const fn is_response(&self) -> bool {
        !self.is_push()
    }
}

impl From<PacketType> for u8 {
    fn from(pkt: PacketType) -> Self {
        pkt as Self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_type_from_byte() {
        assert_eq!(PacketType::from_byte(0x00), Some(PacketType::Ok));
        assert_eq!(PacketType::from_byte(0x80), Some(PacketType::Advertisement));
        assert_eq!(PacketType::from_byte(0xFF), None);
    }

    #[test]
    fn test_is_push() {
        assert!(!PacketType::Ok.is_push());
        assert!(!PacketType::SelfInfo.is_push());
        assert!(PacketType::Advertisement.is_push());
        assert!(PacketType::Ack.is_push());
        assert!(PacketType::NewAdvert.is_push());
    }
}
