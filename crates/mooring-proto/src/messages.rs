//! Message payloads and the tagged unions over them.
//!
//! Payload structs serialize as CBOR. [`Message::into_frame`] and
//! [`Message::from_frame`] are the only places that map between a payload
//! and its [`MessageType`] code.

use std::fmt;

use bitcoin::secp256k1::PublicKey;
use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{ChannelId, Frame, MessageType, NodeId, ProtocolError, Result};

/// Connection setup. Each side announces who it is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Init {
    /// Sender's node id
    pub node_id: NodeId,
    /// Feature bits, opaque to this layer
    pub features: Vec<u8>,
}

/// Error report from a peer.
///
/// # Protocol Flow
///
/// A node that cannot continue with a channel sends `error` instead of the
/// expected reply. The link stays open so the receiver can log or answer,
/// but the addressed channel must be treated as failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Addressed channel, or [`ChannelId::ALL`]
    pub channel_id: ChannelId,
    /// Diagnostic payload, usually UTF-8
    pub data: Vec<u8>,
}

/// What an [`ErrorMessage`] applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// A single channel
    Channel(ChannelId),
    /// Every channel with the peer
    All,
}

impl ErrorMessage {
    /// Build an error for `scope`.
    pub fn new(scope: ErrorScope, data: impl Into<Vec<u8>>) -> Self {
        let channel_id = match scope {
            ErrorScope::Channel(id) => id,
            ErrorScope::All => ChannelId::ALL,
        };
        Self { channel_id, data: data.into() }
    }

    /// Scope encoded in the channel id field.
    pub fn scope(&self) -> ErrorScope {
        if self.channel_id.is_all() { ErrorScope::All } else { ErrorScope::Channel(self.channel_id) }
    }
}

impl fmt::Display for ErrorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.data))
    }
}

/// Keepalive request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// Size of the `ignored` field the pong must carry
    pub num_pong_bytes: u16,
    /// Padding
    pub ignored: Vec<u8>,
}

/// Keepalive reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    /// Padding of the requested length
    pub ignored: Vec<u8>,
}

/// Funding transaction has reached the minimum depth on the sender's side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingLocked {
    /// Channel
    pub channel_id: ChannelId,
    /// Per-commitment point for the next commitment
    pub next_per_commitment_point: PublicKey,
}

/// Cooperative close request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shutdown {
    /// Channel
    pub channel_id: ChannelId,
    /// Where the sender wants its funds
    pub script_pubkey: Vec<u8>,
}

/// Signature over the receiver's next commitment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentSigned {
    /// Channel
    pub channel_id: ChannelId,
    /// Compact signature for the commitment
    pub signature: Vec<u8>,
    /// One compact signature per HTLC output
    pub htlc_signatures: Vec<Vec<u8>>,
}

/// Revocation of the sender's previous commitment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokeAndAck {
    /// Channel
    pub channel_id: ChannelId,
    /// Secret for the revoked commitment
    pub per_commitment_secret: [u8; 32],
    /// Point for the commitment after next
    pub next_per_commitment_point: PublicKey,
}

/// Commitment fee rate change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateFee {
    /// Channel
    pub channel_id: ChannelId,
    /// Satoshis per 1000 weight units
    pub feerate_per_kw: u32,
}

/// State synchronization after a reconnect.
///
/// # Protocol Flow
///
/// Both sides send this as the first channel message after a reconnect:
/// 1. Each side reports the next commitment number it expects to receive
/// 2. Each side reports the next revocation number it expects to receive
/// 3. Each side proves knowledge of the last secret it was sent
/// 4. Normal operation resumes once both messages have been exchanged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelReestablish {
    /// Channel
    pub channel_id: ChannelId,
    /// Next commitment number the sender expects
    pub next_commitment_number: u64,
    /// Next revocation number the sender expects
    pub next_revocation_number: u64,
    /// Last per-commitment secret the sender received
    pub your_last_per_commitment_secret: [u8; 32],
    /// Sender's current per-commitment point
    pub my_current_per_commitment_point: PublicKey,
}

/// Messages addressed to one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    /// Funding reached minimum depth
    FundingLocked(FundingLocked),
    /// Cooperative close
    Shutdown(Shutdown),
    /// Commitment signature
    CommitmentSigned(CommitmentSigned),
    /// Revocation
    RevokeAndAck(RevokeAndAck),
    /// Fee update
    UpdateFee(UpdateFee),
    /// Reconnect synchronization
    ChannelReestablish(ChannelReestablish),
}

impl ChannelMessage {
    /// Channel the message addresses.
    pub fn channel_id(&self) -> ChannelId {
        match self {
            Self::FundingLocked(m) => m.channel_id,
            Self::Shutdown(m) => m.channel_id,
            Self::CommitmentSigned(m) => m.channel_id,
            Self::RevokeAndAck(m) => m.channel_id,
            Self::UpdateFee(m) => m.channel_id,
            Self::ChannelReestablish(m) => m.channel_id,
        }
    }

    /// Wire type.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::FundingLocked(_) => MessageType::FundingLocked,
            Self::Shutdown(_) => MessageType::Shutdown,
            Self::CommitmentSigned(_) => MessageType::CommitmentSigned,
            Self::RevokeAndAck(_) => MessageType::RevokeAndAck,
            Self::UpdateFee(_) => MessageType::UpdateFee,
            Self::ChannelReestablish(_) => MessageType::ChannelReestablish,
        }
    }
}

/// Everything a peer may send on a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Connection setup
    Init(Init),
    /// Error report
    Error(ErrorMessage),
    /// Keepalive request
    Ping(Ping),
    /// Keepalive reply
    Pong(Pong),
    /// Channel-scoped message
    Channel(ChannelMessage),
}

impl Message {
    /// Wire type.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Init(_) => MessageType::Init,
            Self::Error(_) => MessageType::Error,
            Self::Ping(_) => MessageType::Ping,
            Self::Pong(_) => MessageType::Pong,
            Self::Channel(m) => m.message_type(),
        }
    }

    /// Serialize the payload and wrap it in a frame.
    pub fn into_frame(&self) -> Result<Frame> {
        let message_type = self.message_type();
        let payload = match self {
            Self::Init(m) => encode_payload(m, message_type)?,
            Self::Error(m) => encode_payload(m, message_type)?,
            Self::Ping(m) => encode_payload(m, message_type)?,
            Self::Pong(m) => encode_payload(m, message_type)?,
            Self::Channel(ChannelMessage::FundingLocked(m)) => encode_payload(m, message_type)?,
            Self::Channel(ChannelMessage::Shutdown(m)) => encode_payload(m, message_type)?,
            Self::Channel(ChannelMessage::CommitmentSigned(m)) => encode_payload(m, message_type)?,
            Self::Channel(ChannelMessage::RevokeAndAck(m)) => encode_payload(m, message_type)?,
            Self::Channel(ChannelMessage::UpdateFee(m)) => encode_payload(m, message_type)?,
            Self::Channel(ChannelMessage::ChannelReestablish(m)) => {
                encode_payload(m, message_type)?
            },
        };
        Frame::new(message_type, payload)
    }

    /// Decode a frame's payload according to its header type.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let message_type = frame
            .message_type()
            .ok_or(ProtocolError::UnknownMessageType(frame.header.raw_message_type()))?;
        let bytes = &frame.payload[..];

        Ok(match message_type {
            MessageType::Init => Self::Init(decode_payload(bytes, message_type)?),
            MessageType::Error => Self::Error(decode_payload(bytes, message_type)?),
            MessageType::Ping => Self::Ping(decode_payload(bytes, message_type)?),
            MessageType::Pong => Self::Pong(decode_payload(bytes, message_type)?),
            MessageType::FundingLocked => {
                ChannelMessage::FundingLocked(decode_payload(bytes, message_type)?).into()
            },
            MessageType::Shutdown => {
                ChannelMessage::Shutdown(decode_payload(bytes, message_type)?).into()
            },
            MessageType::CommitmentSigned => {
                ChannelMessage::CommitmentSigned(decode_payload(bytes, message_type)?).into()
            },
            MessageType::RevokeAndAck => {
                ChannelMessage::RevokeAndAck(decode_payload(bytes, message_type)?).into()
            },
            MessageType::UpdateFee => {
                ChannelMessage::UpdateFee(decode_payload(bytes, message_type)?).into()
            },
            MessageType::ChannelReestablish => {
                ChannelMessage::ChannelReestablish(decode_payload(bytes, message_type)?).into()
            },
        })
    }
}

impl From<ChannelMessage> for Message {
    fn from(message: ChannelMessage) -> Self {
        Self::Channel(message)
    }
}

impl From<ChannelReestablish> for Message {
    fn from(message: ChannelReestablish) -> Self {
        Self::Channel(ChannelMessage::ChannelReestablish(message))
    }
}

impl From<FundingLocked> for Message {
    fn from(message: FundingLocked) -> Self {
        Self::Channel(ChannelMessage::FundingLocked(message))
    }
}

impl From<ErrorMessage> for Message {
    fn from(message: ErrorMessage) -> Self {
        Self::Error(message)
    }
}

fn encode_payload<T: Serialize>(payload: &T, message_type: MessageType) -> Result<Bytes> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(payload, &mut buf)
        .map_err(|e| ProtocolError::Encode { message_type, reason: e.to_string() })?;
    Ok(Bytes::from(buf))
}

fn decode_payload<T: DeserializeOwned>(bytes: &[u8], message_type: MessageType) -> Result<T> {
    ciborium::de::from_reader(bytes)
        .map_err(|e| ProtocolError::Decode { message_type, reason: e.to_string() })
}

#[cfg(test)]
mod tests {
    use bitcoin::secp256k1::{Secp256k1, SecretKey};

    use super::*;

    fn point(byte: u8) -> PublicKey {
        let secp = Secp256k1::new();
        PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&[byte; 32]).unwrap())
    }

    #[test]
    fn reestablish_survives_framing() {
        let message = Message::from(ChannelReestablish {
            channel_id: ChannelId([3; 32]),
            next_commitment_number: 42,
            next_revocation_number: 41,
            your_last_per_commitment_secret: [9; 32],
            my_current_per_commitment_point: point(1),
        });

        let frame = message.into_frame().unwrap();
        assert_eq!(frame.message_type(), Some(MessageType::ChannelReestablish));
        assert_eq!(Message::from_frame(&frame).unwrap(), message);
    }

    #[test]
    fn payload_mismatching_header_type_is_a_decode_error() {
        let pong = Message::Pong(Pong { ignored: vec![0; 4] }).into_frame().unwrap();
        let forged = Frame::new(MessageType::FundingLocked, pong.payload).unwrap();

        let err = Message::from_frame(&forged).unwrap_err();
        assert!(matches!(err, ProtocolError::Decode { message_type: MessageType::FundingLocked, .. }));
    }

    #[test]
    fn error_scope_maps_to_reserved_channel_id() {
        let all = ErrorMessage::new(ErrorScope::All, b"bye".to_vec());
        assert_eq!(all.channel_id, ChannelId::ALL);
        assert_eq!(all.scope(), ErrorScope::All);

        let one = ErrorMessage::new(ErrorScope::Channel(ChannelId([5; 32])), b"bad sig".to_vec());
        assert_eq!(one.scope(), ErrorScope::Channel(ChannelId([5; 32])));
    }

    #[test]
    fn error_message_displays_data_lossily() {
        let err = ErrorMessage::new(ErrorScope::All, b"insufficient funds\xff".to_vec());
        insta::assert_snapshot!(err.to_string(), @"insufficient funds�");
    }

    #[test]
    fn channel_message_reports_its_channel() {
        let msg = ChannelMessage::UpdateFee(UpdateFee { channel_id: ChannelId([8; 32]), feerate_per_kw: 253 });
        assert_eq!(msg.channel_id(), ChannelId([8; 32]));
        assert_eq!(Message::from(msg).message_type(), MessageType::UpdateFee);
    }
}
