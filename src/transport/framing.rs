//! Length framing for stream transports.
//!
//! Notification transports (BLE) deliver one protocol frame per write; a
//! serial byte stream needs its own envelope: a marker byte, a
//! little-endian u16 payload length, then the payload. The deframer
//! tolerates any marker byte on input, so a stream that resyncs
//! mid-frame recovers on the next frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use thiserror::Error;

/// Marker byte starting every serial envelope.
pub const STREAM_MARKER: u8 = 0x3c;

/// Envelope overhead: marker plus the two length bytes.
const ENVELOPE_LEN: usize = 3;

/// Largest payload accepted. Protocol frames are far smaller; a bigger
/// declared length means the stream lost sync mid-frame.
pub const MAX_PAYLOAD_LEN: usize = 4096;

/// Stream deframing errors.
#[derive(Debug, Error)]
pub enum DeframeError {
    /// Declared payload length is out of range; the stream is desynced.
    #[error("declared payload of {declared} bytes exceeds {MAX_PAYLOAD_LEN}")]
    Oversize { declared: usize },
}

/// Wraps one protocol frame in the serial envelope.
///
/// # Panics
///
/// Panics if the payload exceeds [`MAX_PAYLOAD_LEN`].
#[must_use]
pub fn wrap(payload: &[u8]) -> Bytes {
    assert!(
        payload.len() <= MAX_PAYLOAD_LEN,
        "serial payload too large for one envelope"
    );
    let mut envelope = BytesMut::with_capacity(ENVELOPE_LEN + payload.len());
    envelope.put_u8(STREAM_MARKER);
    envelope.put_u16_le(payload.len() as u16);
    envelope.put_slice(payload);
    envelope.freeze()
}

/// Incremental deframer over an arbitrary chunking of the byte stream.
#[derive(Debug, Default)]
pub struct Deframer {
    pending: BytesMut,
}

impl Deframer {
    /// Creates an empty deframer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends freshly read bytes.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    /// Payload length declared by the buffered envelope head, once the
    /// head is complete. The marker byte itself is not validated.
    fn declared_len(&self) -> Option<usize> {
        let head = self.pending.get(1..ENVELOPE_LEN)?;
        Some(usize::from(u16::from_le_bytes([head[0], head[1]])))
    }

    /// Pops the next complete payload, or `Ok(None)` until one has fully
    /// arrived.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, DeframeError> {
        let Some(declared) = self.declared_len() else {
            return Ok(None);
        };
        if declared > MAX_PAYLOAD_LEN {
            return Err(DeframeError::Oversize { declared });
        }
        if self.pending.len() < ENVELOPE_LEN + declared {
            return Ok(None);
        }

        self.pending.advance(ENVELOPE_LEN);
        Ok(Some(self.pending.split_to(declared).freeze()))
    }

    /// Discards everything buffered, losing any partial frame.
    pub fn reset(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_layout() {
        let envelope = wrap(b"hello");
        assert_eq!(envelope[0], STREAM_MARKER);
        assert_eq!(envelope[1], 5);
        assert_eq!(envelope[2], 0);
        assert_eq!(&envelope[3..], b"hello");
    }

    #[test]
    fn test_deframe_complete_frame() {
        let mut deframer = Deframer::new();
        deframer.extend(&wrap(b"hello"));
        assert_eq!(
            deframer.next_frame().unwrap(),
            Some(Bytes::from_static(b"hello"))
        );
        assert_eq!(deframer.next_frame().unwrap(), None);
    }

    #[test]
    fn test_deframe_partial_frame() {
        let mut deframer = Deframer::new();
        deframer.extend(&[STREAM_MARKER, 0x05, 0x00, b'h', b'e']);
        assert_eq!(deframer.next_frame().unwrap(), None);

        deframer.extend(b"llo");
        assert_eq!(
            deframer.next_frame().unwrap(),
            Some(Bytes::from_static(b"hello"))
        );
    }

    #[test]
    fn test_deframe_ignores_marker_byte() {
        // Streams seen in the wild sometimes carry a different lead
        // byte; only the length field matters.
        let mut deframer = Deframer::new();
        deframer.extend(&[0x3e, 0x02, 0x00, b'o', b'k']);
        assert_eq!(
            deframer.next_frame().unwrap(),
            Some(Bytes::from_static(b"ok"))
        );
    }

    #[test]
    fn test_deframe_back_to_back_frames() {
        let mut deframer = Deframer::new();
        let mut stream = wrap(b"hi").to_vec();
        stream.extend_from_slice(&wrap(b"bye"));
        deframer.extend(&stream);

        assert_eq!(
            deframer.next_frame().unwrap(),
            Some(Bytes::from_static(b"hi"))
        );
        assert_eq!(
            deframer.next_frame().unwrap(),
            Some(Bytes::from_static(b"bye"))
        );
    }

    #[test]
    fn test_oversize_length_reports_desync() {
        let mut deframer = Deframer::new();
        deframer.extend(&[STREAM_MARKER, 0xFF, 0xFF, 0x00]);
        assert!(matches!(
            deframer.next_frame(),
            Err(DeframeError::Oversize { declared: 65535 })
        ));
    }

    #[test]
    fn test_reset_discards_partial_frame() {
        let mut deframer = Deframer::new();
        deframer.extend(&[STREAM_MARKER, 0x05, 0x00, b'h']);
        deframer.reset();
        deframer.extend(&wrap(b"ok"));
        assert_eq!(
            deframer.next_frame().unwrap(),
            Some(Bytes::from_static(b"ok"))
        );
    }
}
