//! Header plus payload.

use bytes::Bytes;

use crate::{FrameHeader, MessageType, ProtocolError, Result};

/// A complete wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Validated header
    pub header: FrameHeader,
    /// CBOR-encoded payload, exactly `header.payload_len()` bytes
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame, enforcing the payload limit.
    pub fn new(message_type: MessageType, payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        if payload.len() > FrameHeader::MAX_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: FrameHeader::MAX_PAYLOAD,
            });
        }

        let header = FrameHeader::new(message_type, payload.len() as u32);
        Ok(Self { header, payload })
    }

    /// Message type from the header.
    pub fn message_type(&self) -> Option<MessageType> {
        self.header.message_type()
    }

    /// Append the wire encoding to `dst`.
    pub fn encode(&self, dst: &mut Vec<u8>) {
        dst.reserve(FrameHeader::SIZE + self.payload.len());
        dst.extend_from_slice(&self.header.to_bytes());
        dst.extend_from_slice(&self.payload);
    }

    /// Decode one frame from the front of `bytes`.
    ///
    /// Returns the frame and the number of bytes it occupied.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let header = *FrameHeader::from_bytes(bytes)?;
        let expected = header.payload_len();
        let body = &bytes[FrameHeader::SIZE..];

        if body.len() < expected {
            return Err(ProtocolError::TruncatedPayload { expected, actual: body.len() });
        }

        let payload = Bytes::copy_from_slice(&body[..expected]);
        Ok((Self { header, payload }, FrameHeader::SIZE + expected))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn encode_then_decode_consumes_whole_frame() {
        let frame = Frame::new(MessageType::Ping, vec![1, 2, 3]).unwrap();
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        buf.extend_from_slice(&[9, 9]);

        let (decoded, used) = Frame::decode(&buf).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(used, FrameHeader::SIZE + 3);
    }

    #[test]
    fn decode_rejects_short_payload() {
        let frame = Frame::new(MessageType::Pong, vec![0; 10]).unwrap();
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        buf.truncate(FrameHeader::SIZE + 4);

        assert_eq!(
            Frame::decode(&buf),
            Err(ProtocolError::TruncatedPayload { expected: 10, actual: 4 })
        );
    }

    #[test]
    fn new_rejects_oversized_payload() {
        let result = Frame::new(MessageType::Error, vec![0; FrameHeader::MAX_PAYLOAD + 1]);
        assert!(matches!(result, Err(ProtocolError::PayloadTooLarge { .. })));
    }

    proptest! {
        #[test]
        fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = Frame::decode(&bytes);
        }
    }
}
