//! Channel and node identifiers.

use std::fmt;

use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey, Signing};
use serde::{Deserialize, Serialize};

use crate::{ProtocolError, Result};

/// 32-byte channel identifier.
///
/// Assigned once funding has been negotiated. The all-zero value is reserved:
/// as the scope of an `error` message it addresses every channel with the
/// peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub [u8; 32]);

impl ChannelId {
    /// Reserved id meaning "all channels with this peer".
    pub const ALL: Self = Self([0; 32]);

    /// Build from a slice, `None` unless it is exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 32]>::try_from(bytes).ok().map(Self)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// True for the reserved all-channels id.
    pub fn is_all(&self) -> bool {
        *self == Self::ALL
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Identity of a Lightning node: its compressed secp256k1 public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub PublicKey);

impl NodeId {
    /// Node id belonging to `secret`.
    pub fn from_secret_key<C: Signing>(secp: &Secp256k1<C>, secret: &SecretKey) -> Self {
        Self(PublicKey::from_secret_key(secp, secret))
    }

    /// Parse a 33-byte compressed encoding.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        PublicKey::from_slice(bytes)
            .map(Self)
            .map_err(|e| ProtocolError::InvalidNodeId(e.to_string()))
    }

    /// Compressed 33-byte encoding.
    pub fn serialize(&self) -> [u8; 33] {
        self.0.serialize()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
