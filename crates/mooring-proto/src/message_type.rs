//! Message type codes.
//!
//! Codes follow the Lightning numbering so traces line up with other
//! implementations. The set is closed: an unknown code is a decode error, not
//! an ignorable extension.

use std::fmt;

/// Every message kind that can appear on a peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    /// Connection setup, carries the sender's node id
    Init = 16,
    /// Protocol-level error report
    Error = 17,
    /// Keepalive request
    Ping = 18,
    /// Keepalive reply
    Pong = 19,
    /// Funding transaction reached the minimum depth
    FundingLocked = 36,
    /// Cooperative close initiation
    Shutdown = 38,
    /// New commitment signature
    CommitmentSigned = 132,
    /// Revocation of the previous commitment
    RevokeAndAck = 133,
    /// Fee rate update for commitments
    UpdateFee = 134,
    /// Post-reconnect state synchronization
    ChannelReestablish = 136,
}

impl MessageType {
    /// Wire code.
    pub const fn to_u16(self) -> u16 {
        self as u16
    }

    /// Look up a wire code.
    pub const fn from_u16(code: u16) -> Option<Self> {
        Some(match code {
            16 => Self::Init,
            17 => Self::Error,
            18 => Self::Ping,
            19 => Self::Pong,
            36 => Self::FundingLocked,
            38 => Self::Shutdown,
            132 => Self::CommitmentSigned,
            133 => Self::RevokeAndAck,
            134 => Self::UpdateFee,
            136 => Self::ChannelReestablish,
            _ => return None,
        })
    }

    /// Lightning-style snake case name, used in logs and diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Error => "error",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::FundingLocked => "funding_locked",
            Self::Shutdown => "shutdown",
            Self::CommitmentSigned => "commitment_signed",
            Self::RevokeAndAck => "revoke_and_ack",
            Self::UpdateFee => "update_fee",
            Self::ChannelReestablish => "channel_reestablish",
        }
    }

    /// Whether messages of this kind address a single channel.
    pub const fn is_channel_scoped(self) -> bool {
        matches!(
            self,
            Self::FundingLocked
                | Self::Shutdown
                | Self::CommitmentSigned
                | Self::RevokeAndAck
                | Self::UpdateFee
                | Self::ChannelReestablish
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [MessageType; 10] = [
        MessageType::Init,
        MessageType::Error,
        MessageType::Ping,
        MessageType::Pong,
        MessageType::FundingLocked,
        MessageType::Shutdown,
        MessageType::CommitmentSigned,
        MessageType::RevokeAndAck,
        MessageType::UpdateFee,
        MessageType::ChannelReestablish,
    ];

    #[test]
    fn codes_are_bijective() {
        for ty in ALL {
            assert_eq!(MessageType::from_u16(ty.to_u16()), Some(ty));
        }
        assert_eq!(MessageType::from_u16(0), None);
        assert_eq!(MessageType::from_u16(135), None);
    }

    #[test]
    fn only_channel_messages_are_channel_scoped() {
        let scoped: Vec<_> = ALL.iter().filter(|ty| ty.is_channel_scoped()).collect();
        assert_eq!(scoped.len(), 6);
        assert!(!MessageType::Error.is_channel_scoped());
        assert!(!MessageType::Ping.is_channel_scoped());
    }
}
