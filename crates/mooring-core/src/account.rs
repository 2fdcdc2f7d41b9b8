//! Wallet account seen from a channel.

use bitcoin::{Address, Network, secp256k1::SecretKey};
use thiserror::Error;

/// The account that owns a channel.
///
/// Read-only from this crate's side and shared between every session of the
/// account.
pub trait Account: Send + Sync + 'static {
    /// Stable identity of the account file, recorded with each channel.
    fn file_identity(&self) -> &str;

    /// Node key used to authenticate links.
    fn node_secret(&self) -> &SecretKey;

    /// Address the account receives swept funds on.
    fn receive_address(&self, network: Network) -> Result<Address, AccountError>;
}

/// Account could not produce what was asked.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccountError {
    /// Account does not hold keys for `network`
    #[error("account has no keys for {network}")]
    NetworkMismatch {
        /// Requested network
        network: Network,
    },

    /// Key derivation failed
    #[error("key derivation failed: {0}")]
    Derivation(String),
}
