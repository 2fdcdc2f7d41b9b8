//! Protocol error types.

use thiserror::Error;

use crate::MessageType;

/// Result alias for codec operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while encoding or decoding frames and payloads.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Fewer bytes than a full header were available
    #[error("frame header truncated: expected {expected} bytes, got {actual}")]
    TruncatedHeader {
        /// Header size
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Header announced more payload than the buffer holds
    #[error("frame truncated: header announces {expected} payload bytes, got {actual}")]
    TruncatedPayload {
        /// Payload length from the header
        expected: usize,
        /// Bytes available after the header
        actual: usize,
    },

    /// Payload exceeds the frame limit
    #[error("payload of {size} bytes exceeds limit of {max}")]
    PayloadTooLarge {
        /// Offending size
        size: usize,
        /// Maximum allowed
        max: usize,
    },

    /// Message type code outside the known set
    #[error("unknown message type {0}")]
    UnknownMessageType(u16),

    /// CBOR serialization failed
    #[error("failed to encode {message_type} payload: {reason}")]
    Encode {
        /// Message being encoded
        message_type: MessageType,
        /// Serializer diagnostic
        reason: String,
    },

    /// CBOR deserialization failed
    #[error("failed to decode {message_type} payload: {reason}")]
    Decode {
        /// Message being decoded
        message_type: MessageType,
        /// Deserializer diagnostic
        reason: String,
    },

    /// Bytes are not a valid compressed secp256k1 point
    #[error("invalid node id: {0}")]
    InvalidNodeId(String),
}
