//! Error taxonomy for links, reestablishment, and sessions.
//!
//! Every error answers [`PossibleBug::possible_bug`]. `true` means the
//! condition may come from a defect in this crate or one of its
//! collaborators and should raise an alert; `false` means an expected
//! operational condition (peer went away, peer refused) that the caller logs
//! and decides on. Composed errors take the flag of their cause.
//!
//! Internal invariant violations are not errors. They go through
//! [`invariant_violated`], which logs and panics.

use std::{fmt, io};

use mooring_proto::{ChannelMessage, ErrorMessage, MessageType, NodeId, ProtocolError};
use thiserror::Error;

use crate::store::StoreError;

/// Classifies an error for alerting.
pub trait PossibleBug {
    /// Whether this condition may indicate a bug rather than an environmental
    /// or peer-caused failure.
    fn possible_bug(&self) -> bool;
}

/// Failure of the underlying byte stream or its framing.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Transport I/O failed
    #[error("transport I/O failed: {0}")]
    Io(#[from] io::Error),

    /// Frame or payload could not be encoded or decoded
    #[error("codec failure: {0}")]
    Codec(#[from] ProtocolError),

    /// Peer closed the stream
    #[error("peer closed the connection")]
    Closed,
}

impl PossibleBug for LinkError {
    fn possible_bug(&self) -> bool {
        matches!(self, Self::Codec(_))
    }
}

/// Outcome of waiting for a channel message that did not produce one.
///
/// A peer `error` is reported apart from transport failures and hands the
/// link back, so the caller can still log, answer, or close it.
#[derive(Debug, Error)]
pub enum RecvMsgError<L> {
    /// Transport or codec failure
    #[error(transparent)]
    Link(#[from] LinkError),

    /// Peer answered with a protocol error
    #[error("peer sent error: {message}")]
    PeerError {
        /// Link after the error was received
        link: L,
        /// The peer's error
        message: ErrorMessage,
    },
}

impl<L> PossibleBug for RecvMsgError<L> {
    fn possible_bug(&self) -> bool {
        match self {
            Self::Link(err) => err.possible_bug(),
            Self::PeerError { .. } => false,
        }
    }
}

/// Failure to bring up an authenticated link.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Transport-level connect or accept failed
    #[error("transport connect failed: {0}")]
    Transport(#[from] io::Error),

    /// `init` exchange failed on the wire
    #[error("init exchange failed: {0}")]
    Handshake(#[from] LinkError),

    /// Peer sent something other than `init` first
    #[error("expected init, got {0}")]
    UnexpectedHandshakeMessage(MessageType),

    /// Peer is not the counterparty we expected
    #[error("peer identified as {actual}, expected {expected}")]
    NodeIdMismatch {
        /// Counterparty recorded for the channel
        expected: NodeId,
        /// Identity the peer announced
        actual: NodeId,
    },
}

impl PossibleBug for ConnectError {
    fn possible_bug(&self) -> bool {
        match self {
            Self::Handshake(err) => err.possible_bug(),
            Self::Transport(_) | Self::UnexpectedHandshakeMessage(_) | Self::NodeIdMismatch { .. } => {
                false
            },
        }
    }
}

/// Failure of the `channel_reestablish` handshake.
#[derive(Debug, Error)]
pub enum ReestablishError<L> {
    /// Our `channel_reestablish` could not be sent
    #[error("failed to send channel_reestablish: {0}")]
    SendReestablish(#[source] LinkError),

    /// Waiting for the peer's reply failed
    #[error("failed to receive channel_reestablish: {0}")]
    ReceiveReestablish(#[source] LinkError),

    /// Peer answered with a protocol error instead of reestablishing
    #[error("peer responded with error: {message}")]
    PeerErrorResponse {
        /// Link after the error was received, still usable for reporting
        link: L,
        /// The peer's error
        message: ErrorMessage,
    },

    /// After `funding_locked`, the next message was not `channel_reestablish`
    #[error("expected channel_reestablish, got {}", .received.message_type())]
    ExpectedReestablish {
        /// What arrived instead
        received: ChannelMessage,
    },

    /// First reply was neither `channel_reestablish` nor `funding_locked`
    #[error("expected channel_reestablish or funding_locked, got {}", .received.message_type())]
    ExpectedReestablishOrFundingLocked {
        /// What arrived instead
        received: ChannelMessage,
    },
}

impl<L> PossibleBug for ReestablishError<L> {
    fn possible_bug(&self) -> bool {
        match self {
            Self::SendReestablish(err) | Self::ReceiveReestablish(err) => err.possible_bug(),
            Self::PeerErrorResponse { .. }
            | Self::ExpectedReestablish { .. }
            | Self::ExpectedReestablishOrFundingLocked { .. } => false,
        }
    }
}

/// Failure to produce a reconnected [`crate::ChannelSession`].
///
/// No partial session exists after any of these; the channel stays closable
/// from its last persisted state.
#[derive(Debug, Error)]
pub enum ReconnectError<L> {
    /// Persisted channel could not be loaded
    #[error("failed to load channel: {0}")]
    Load(#[from] StoreError),

    /// Link to the counterparty could not be established
    #[error("failed to connect to counterparty: {0}")]
    Connect(#[from] ConnectError),

    /// Link came up but the handshake failed
    #[error("channel reestablishment failed: {0}")]
    Reestablish(#[from] ReestablishError<L>),
}

impl<L> PossibleBug for ReconnectError<L> {
    fn possible_bug(&self) -> bool {
        match self {
            Self::Load(err) => err.possible_bug(),
            Self::Connect(err) => err.possible_bug(),
            Self::Reestablish(err) => err.possible_bug(),
        }
    }
}

/// Abort on a broken internal invariant.
///
/// Reserved for conditions that mean this crate or a collaborator misbehaved
/// (a command producing an impossible result, a session without a channel
/// id). Never used for anything a peer or the network can cause.
#[cold]
#[track_caller]
#[allow(clippy::panic)]
pub(crate) fn invariant_violated(what: fmt::Arguments<'_>) -> ! {
    tracing::error!(violation = %what, "internal invariant violated");
    panic!("internal invariant violated: {what}");
}

#[cfg(test)]
mod tests {
    use mooring_proto::{ChannelId, ErrorScope, Shutdown};

    use super::*;

    #[test]
    fn peer_caused_failures_are_not_bugs() {
        let closed: ReestablishError<()> = ReestablishError::ReceiveReestablish(LinkError::Closed);
        assert!(!closed.possible_bug());

        let refused: ReestablishError<()> = ReestablishError::PeerErrorResponse {
            link: (),
            message: ErrorMessage::new(ErrorScope::All, b"no".to_vec()),
        };
        assert!(!refused.possible_bug());
    }

    #[test]
    fn codec_failures_are_flagged() {
        let codec = LinkError::Codec(ProtocolError::UnknownMessageType(9));
        assert!(codec.possible_bug());

        let wrapped: ReconnectError<()> =
            ReconnectError::Reestablish(ReestablishError::SendReestablish(codec));
        assert!(wrapped.possible_bug());
    }

    #[test]
    fn reconnect_flag_follows_its_cause() {
        let connect: ReconnectError<()> =
            ReconnectError::Connect(ConnectError::Transport(io::ErrorKind::ConnectionRefused.into()));
        assert!(!connect.possible_bug());

        let load: ReconnectError<()> = ReconnectError::Load(StoreError::ChannelIdMismatch {
            expected: ChannelId([1; 32]),
            actual: None,
        });
        assert!(load.possible_bug());
    }

    #[test]
    fn unexpected_message_names_what_arrived() {
        let err: ReestablishError<()> = ReestablishError::ExpectedReestablishOrFundingLocked {
            received: ChannelMessage::Shutdown(Shutdown {
                channel_id: ChannelId([2; 32]),
                script_pubkey: vec![],
            }),
        };
        insta::assert_snapshot!(err.to_string(), @"expected channel_reestablish or funding_locked, got shutdown");
    }

    #[test]
    #[should_panic(expected = "internal invariant violated: boom")]
    fn invariant_violation_panics() {
        invariant_violated(format_args!("boom"));
    }
}
