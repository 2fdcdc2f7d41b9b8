//! Wire vocabulary for payment-channel reconnection.
//!
//! Frames consist of a fixed 6-byte header (zero-copy binary) followed by a
//! variable-length CBOR payload. The header carries the message type and the
//! payload length, so a reader can reject unknown or oversized frames before
//! touching the payload.
//!
//! Messages form a closed set. [`Message`] covers everything a peer may send
//! on the link, [`ChannelMessage`] narrows it to the channel-scoped kinds that
//! the reestablishment handshake dispatches on. Both are matched exhaustively,
//! so adding a kind is a compile error everywhere it must be handled.
//!
//! # Security
//!
//! All header parsing uses compile-time verified layouts via `zerocopy`. We
//! enforce a 65 535 byte payload limit, the same ceiling a Lightning message
//! has on the wire.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod errors;
pub mod frame;
pub mod header;
pub mod ids;
pub mod message_type;
pub mod messages;

pub use errors::{ProtocolError, Result};
pub use frame::Frame;
pub use header::FrameHeader;
pub use ids::{ChannelId, NodeId};
pub use message_type::MessageType;
pub use messages::{
    ChannelMessage, ChannelReestablish, CommitmentSigned, ErrorMessage, ErrorScope, FundingLocked,
    Init, Message, Ping, Pong, RevokeAndAck, Shutdown, UpdateFee,
};
