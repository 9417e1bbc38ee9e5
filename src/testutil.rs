//! Shared helpers for session, engine and service tests.

use crate::config::Config;
use crate::event::EventBus;
use crate::session::Session;
use crate::transport::mock::{MockDevice, MockTransport};

/// Builds a `selfInfo` response frame for a node named `name` whose key
/// is `pk_byte` repeated.
pub(crate) fn self_info_frame(name: &str, pk_byte: u8) -> Vec<u8> {
    let mut frame = vec![0x05, 1, 22, 30];
    frame.extend_from_slice(&[pk_byte; 32]);
    frame.extend_from_slice(&0i32.to_le_bytes()); // lat unset
    frame.extend_from_slice(&0i32.to_le_bytes()); // lon unset
    frame.extend_from_slice(&[0; 4]); // flags
    frame.extend_from_slice(&869_525u32.to_le_bytes()); // freq
    frame.extend_from_slice(&250_000u32.to_le_bytes()); // bw
    frame.push(11); // sf
    frame.push(5); // cr
    frame.extend_from_slice(name.as_bytes());
    frame
}

/// Builds a minimal v1 `deviceInfo` response frame.
pub(crate) fn device_info_frame() -> Vec<u8> {
    vec![0x0D, 0x01]
}

/// Builds a `messageSent` response frame.
pub(crate) fn message_sent_frame(ack: [u8; 4], timeout_ms: u32) -> Vec<u8> {
    let mut frame = vec![0x06, 0x00];
    frame.extend_from_slice(&ack);
    frame.extend_from_slice(&timeout_ms.to_le_bytes());
    frame
}

/// Builds an acknowledgement push frame.
pub(crate) fn ack_frame(ack: [u8; 4]) -> Vec<u8> {
    let mut frame = vec![0x82];
    frame.extend_from_slice(&ack);
    frame
}

/// Builds a v1 channel message frame.
pub(crate) fn channel_message_frame(channel: u8, sender_ts: u32, text: &str) -> Vec<u8> {
    let mut frame = vec![0x08, channel, 0, 0];
    frame.extend_from_slice(&sender_ts.to_le_bytes());
    frame.extend_from_slice(text.as_bytes());
    frame
}

/// Builds a v1 contact message frame.
pub(crate) fn contact_message_frame(prefix: [u8; 6], sender_ts: u32, text: &str) -> Vec<u8> {
    let mut frame = vec![0x07];
    frame.extend_from_slice(&prefix);
    frame.push(0); // path len
    frame.push(0); // plain
    frame.extend_from_slice(&sender_ts.to_le_bytes());
    frame.extend_from_slice(text.as_bytes());
    frame
}

/// Reads write chunks until `len` bytes of one frame are assembled.
pub(crate) async fn read_frame_bytes(device: &mut MockDevice, len: usize) -> Vec<u8> {
    let mut frame = Vec::with_capacity(len);
    while frame.len() < len {
        frame.extend_from_slice(&device.next_write().await);
    }
    assert_eq!(frame.len(), len, "chunks crossed a frame boundary");
    frame
}

/// Connects a session over a mock transport, answering the handshake
/// with a node named "TestNode" whose key is `0x42` repeated.
pub(crate) async fn ready_session(mtu: usize, config: Config) -> (Session, MockDevice) {
    let (transport, mut device) = MockTransport::new(mtu);
    let bus = EventBus::new();
    let app_start_len = 1 + config.app_name.len();

    let connect = Session::connect(transport, config, bus);
    let script = async {
        let query = read_frame_bytes(&mut device, 2).await;
        assert_eq!(query[0], 0x16, "handshake starts with deviceQuery");
        device.push_frame(device_info_frame()).await;

        let start = read_frame_bytes(&mut device, app_start_len).await;
        assert_eq!(start[0], 0x01, "appStart follows deviceQuery");
        device.push_frame(self_info_frame("TestNode", 0x42)).await;
        device
    };

    let (session, device) = tokio::join!(connect, script);
    (session.expect("handshake scripted"), device)
}
