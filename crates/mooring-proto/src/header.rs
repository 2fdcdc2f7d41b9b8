//! Fixed-size frame header.
//!
//! ```text
//! 0       2               6
//! ┌───────┬───────────────┐
//! │ type  │  payload_len  │   big-endian
//! └───────┴───────────────┘
//! ```

use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::network_endian::{U16, U32},
};

use crate::{MessageType, ProtocolError, Result};

/// Frame header preceding every CBOR payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct FrameHeader {
    message_type: U16,
    payload_len: U32,
}

impl FrameHeader {
    /// Encoded size in bytes.
    pub const SIZE: usize = 6;

    /// Largest payload a frame may carry.
    pub const MAX_PAYLOAD: usize = 65_535;

    /// Header for a payload of `payload_len` bytes.
    ///
    /// The length is not checked here; [`crate::Frame::new`] enforces the
    /// limit before a header is built.
    pub fn new(message_type: MessageType, payload_len: u32) -> Self {
        Self { message_type: U16::new(message_type.to_u16()), payload_len: U32::new(payload_len) }
    }

    /// Parse and validate a header from the front of `bytes`.
    ///
    /// # Errors
    ///
    /// - `TruncatedHeader` if fewer than [`Self::SIZE`] bytes are available
    /// - `UnknownMessageType` if the type code is not in the closed set
    /// - `PayloadTooLarge` if the announced length exceeds the limit
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        let (header, _) = Self::ref_from_prefix(bytes).map_err(|_| {
            ProtocolError::TruncatedHeader { expected: Self::SIZE, actual: bytes.len() }
        })?;

        if header.message_type().is_none() {
            return Err(ProtocolError::UnknownMessageType(header.raw_message_type()));
        }

        let size = header.payload_len();
        if size > Self::MAX_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge { size, max: Self::MAX_PAYLOAD });
        }

        Ok(header)
    }

    /// Decoded message type, `None` for unknown codes.
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_u16(self.raw_message_type())
    }

    /// Raw type code as sent.
    pub fn raw_message_type(&self) -> u16 {
        self.message_type.get()
    }

    /// Announced payload length.
    pub fn payload_len(&self) -> usize {
        self.payload_len.get() as usize
    }

    /// Wire bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(self.as_bytes());
        out
    }
}
