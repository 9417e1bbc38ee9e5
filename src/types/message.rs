//! Wire message events and the persistent message entity.

use uuid::Uuid;

use crate::types::contact::{KeyPrefix, PublicKey};

/// Text type indicating message format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TextType {
    /// Plain text message.
    #[default]
    Plain = 0,
    /// CLI/command data.
    CliData = 1,
    /// Signed plain text with a signature prefix.
    SignedPlain = 2,
}

impl TextType {
    /// Parses text type from a byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Self {
        match byte {
            1 => Self::CliData,
            2 => Self::SignedPlain,
            _ => Self::Plain,
        }
    }
}

/// A message received from a contact (direct message).
#[derive(Debug, Clone)]
pub struct ContactMessage {
    /// 6-byte public key prefix of the sender.
    pub sender_prefix: KeyPrefix,
    /// Path length the message travelled.
    pub path_len: u8,
    /// Text type.
    pub text_type: TextType,
    /// Sender's timestamp (Unix seconds).
    pub sender_ts: u32,
    /// Message signature (if `text_type` is `SignedPlain`).
    pub signature: Option<[u8; 4]>,
    /// Message text.
    pub text: String,
    /// SNR in dB, present on v3 frames only.
    pub snr: Option<f32>,
}

/// A message received from a channel.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    /// Channel index.
    pub channel_index: u8,
    /// Path length the message travelled.
    pub path_len: u8,
    /// Text type.
    pub text_type: TextType,
    /// Sender's timestamp (Unix seconds).
    pub sender_ts: u32,
    /// Message text (by convention `"{sender}: {body}"`).
    pub text: String,
    /// SNR in dB, present on v3 frames only.
    pub snr: Option<f32>,
}

impl ChannelMessage {
    /// Splits the conventional `"{sender}: {body}"` channel text into
    /// sender name and body. Text without the separator yields an empty
    /// sender name.
    #[must_use]
    pub fn split_sender(&self) -> (&str, &str) {
        split_channel_text(&self.text)
    }
}

/// Splits `"{sender}: {body}"` on the first `": "`.
#[must_use]
pub fn split_channel_text(text: &str) -> (&str, &str) {
    match text.split_once(": ") {
        Some((sender, body)) => (sender, body),
        None => ("", text),
    }
}

/// Acknowledgment push for a sent message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledgement {
    /// Raw 4-byte ack code as it appeared on the wire.
    pub code: [u8; 4],
}

impl Acknowledgement {
    /// The code decoded as a little-endian u32 (the tracking key).
    #[must_use]
    pub const fn code_u32(&self) -> u32 {
        u32::from_le_bytes(self.code)
    }
}

/// Direction of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Authored locally.
    Sent,
    /// Received from the mesh.
    Received,
}

/// What a stored message is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// Direct message to/from a contact.
    Direct(PublicKey),
    /// Channel message on the given channel index.
    Channel(u8),
}

/// Delivery lifecycle of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    /// Persisted locally, not yet handed to the radio.
    Pending,
    /// The device accepted the send and returned an ack code.
    Sent,
    /// The matching acknowledgement arrived in time.
    Acked,
    /// All retry attempts were exhausted.
    Failed,
    /// Between attempts of the retry ladder.
    Retrying,
}

/// The persistent message entity.
#[derive(Debug, Clone)]
pub struct Message {
    /// Stable id.
    pub id: Uuid,
    /// Owning device (local node public key).
    pub device_id: PublicKey,
    /// Sent or received.
    pub direction: Direction,
    /// Direct or channel addressing.
    pub kind: MessageKind,
    /// Text type from the wire.
    pub text_type: TextType,
    /// Sender's timestamp (Unix seconds).
    pub sender_ts: u32,
    /// Message text.
    pub text: String,
    /// SNR in dB, if the frame carried one.
    pub snr: Option<f32>,
    /// Path length, if known.
    pub path_len: Option<u8>,
    /// Delivery status.
    pub status: MessageStatus,
    /// Ack code assigned by the device, once sent.
    pub ack_code: Option<u32>,
    /// Round-trip time to acknowledgement in milliseconds.
    pub rtt_ms: Option<u32>,
    /// Key used for inbound deduplication.
    pub dedup_key: String,
}

impl Message {
    /// Dedup key for a direct message.
    #[must_use]
    pub fn direct_dedup_key(contact: &PublicKey, sender_ts: u32, text: &str) -> String {
        format!("d:{}:{sender_ts}:{text}", contact.to_hex())
    }

    /// Dedup key for a channel message.
    #[must_use]
    pub fn channel_dedup_key(channel: u8, sender_ts: u32, sender_name: &str, text: &str) -> String {
        format!("c:{channel}:{sender_ts}:{sender_name}:{text}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_type_from_byte() {
        assert_eq!(TextType::from_byte(0), TextType::Plain);
        assert_eq!(TextType::from_byte(1), TextType::CliData);
        assert_eq!(TextType::from_byte(2), TextType::SignedPlain);
        assert_eq!(TextType::from_byte(7), TextType::Plain);
    }

    #[test]
    fn test_ack_code_little_endian() {
        let ack = Acknowledgement {
            code: [0xDE, 0xAD, 0xBE, 0xEF],
        };
        assert_eq!(ack.code_u32(), 0xEF_BE_AD_DE);
    }

    #[test]
    fn test_split_channel_text() {
        assert_eq!(split_channel_text("Alice: hi there"), ("Alice", "hi there"));
        assert_eq!(split_channel_text("no separator"), ("", "no separator"));
        assert_eq!(split_channel_text("a: b: c"), ("a", "b: c"));
    }

    #[test]
    fn test_dedup_keys_differ() {
        let pk = PublicKey::from_bytes(&[7u8; 32]);
        let a = Message::direct_dedup_key(&pk, 1, "x");
        let b = Message::direct_dedup_key(&pk, 2, "x");
        assert_ne!(a, b);
        let c = Message::channel_dedup_key(0, 1, "n", "x");
        assert_ne!(a, c);
    }
}
