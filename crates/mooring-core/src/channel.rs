//! Channel state machine capability.
//!
//! The channel state machine itself (funding, commitment updates, HTLCs) is
//! not implemented here. This module names the slice of it that
//! reconnection needs: restore from a snapshot, take a snapshot, execute a
//! command, and report identifiers.
//!
//! # Architecture: Command/Event
//!
//! - Callers hand the machine a [`ChannelCommand`]
//! - The machine returns its successor and the [`ChannelEvent`]s produced
//! - Callers act on the events (send the messages they carry)
//!
//! `execute` consumes the machine, so the pre-command state cannot be used
//! once the command has run.

use std::{fmt, sync::Arc};

use bitcoin::{Amount, Network, OutPoint, ScriptBuf, Transaction, Txid, secp256k1::SecretKey};
use mooring_proto::{ChannelId, ChannelReestablish, FundingLocked, NodeId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Commands the reconnection path issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelCommand {
    /// Produce our `channel_reestablish` and mark it sent
    CreateReestablish,
}

/// Outputs of [`ChannelStateMachine::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ChannelEvent {
    /// A `channel_reestablish` to transmit
    WeSentChannelReestablish(ChannelReestablish),
    /// A `funding_locked` to transmit
    WeSentFundingLocked(FundingLocked),
}

/// The on-chain output holding the channel's pooled funds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingOutput {
    /// Where the output lives
    pub outpoint: OutPoint,
    /// Channel capacity
    pub value: Amount,
    /// 2-of-2 witness script hash
    pub script_pubkey: ScriptBuf,
}

/// What a state machine asks for when it needs a funding transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundingRequest {
    /// Capacity to lock up
    pub channel_value: Amount,
    /// Funding output script
    pub script_pubkey: ScriptBuf,
}

/// Supplies funding transactions to a state machine during channel opening.
pub trait FundingProvider: Send + Sync {
    /// Build a transaction paying `request.channel_value` to
    /// `request.script_pubkey`.
    fn provide_funding(&self, request: &FundingRequest) -> Result<Transaction, FundingError>;
}

/// Funding could not be provided.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FundingError {
    /// Channel is past funding; asking again is a logic error
    #[error("channel {channel_id} is already funded")]
    AlreadyFunded {
        /// Channel that asked
        channel_id: ChannelId,
    },

    /// Wallet could not build the transaction
    #[error("wallet failed to fund channel: {0}")]
    Wallet(String),
}

/// Funding provider for channels restored after funding.
///
/// Every request fails with [`FundingError::AlreadyFunded`] and is logged as
/// an error: a restored channel asking for funds means its state machine is
/// confused.
#[derive(Debug, Clone, Copy)]
pub struct DisabledFundingProvider {
    channel_id: ChannelId,
}

impl DisabledFundingProvider {
    /// Provider for `channel_id`.
    pub fn new(channel_id: ChannelId) -> Self {
        Self { channel_id }
    }
}

impl FundingProvider for DisabledFundingProvider {
    fn provide_funding(&self, request: &FundingRequest) -> Result<Transaction, FundingError> {
        tracing::error!(
            channel_id = %self.channel_id,
            channel_value = %request.channel_value,
            "funding requested for an already funded channel"
        );
        Err(FundingError::AlreadyFunded { channel_id: self.channel_id })
    }
}

/// Identity and capabilities handed to a machine being restored.
#[derive(Clone)]
pub struct RestoreContext {
    /// Channel being restored
    pub channel_id: ChannelId,
    /// Counterparty
    pub remote_node_id: NodeId,
    /// Chain the channel lives on
    pub network: Network,
    /// Our node key
    pub node_secret: SecretKey,
    /// Funding capability; disabled for restored channels
    pub funding_provider: Arc<dyn FundingProvider>,
}

impl fmt::Debug for RestoreContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestoreContext")
            .field("channel_id", &self.channel_id)
            .field("remote_node_id", &self.remote_node_id)
            .field("network", &self.network)
            .finish_non_exhaustive()
    }
}

/// Opaque channel state machine.
pub trait ChannelStateMachine: Sized + Send + 'static {
    /// Failure to restore, snapshot, or execute.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Rebuild a machine from [`Self::snapshot`] output.
    fn restore(snapshot: &[u8], context: RestoreContext) -> Result<Self, Self::Error>;

    /// Serialize the durable state.
    ///
    /// Transient flags (such as "reestablish sent") are not part of it, so a
    /// restored and re-snapshotted machine yields the same bytes.
    fn snapshot(&self) -> Result<Vec<u8>, Self::Error>;

    /// Apply `command`, returning the successor state and what it produced.
    fn execute(self, command: ChannelCommand) -> Result<(Self, Vec<ChannelEvent>), Self::Error>;

    /// Channel id, once funding has been negotiated.
    fn channel_id(&self) -> Option<ChannelId>;

    /// Funding transaction id, once known.
    fn funding_txid(&self) -> Option<Txid>;

    /// Funding output, once confirmed.
    fn funding_output(&self) -> Option<FundingOutput>;

    /// Counterparty.
    fn remote_node_id(&self) -> NodeId;

    /// Chain the channel lives on.
    fn network(&self) -> Network;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_provider_refuses_funding() {
        let channel_id = ChannelId([7; 32]);
        let provider = DisabledFundingProvider::new(channel_id);
        let request = FundingRequest {
            channel_value: Amount::from_sat(1_000_000),
            script_pubkey: ScriptBuf::new(),
        };

        assert_eq!(
            provider.provide_funding(&request),
            Err(FundingError::AlreadyFunded { channel_id })
        );
    }

    #[test]
    fn already_funded_names_the_channel() {
        let err = FundingError::AlreadyFunded { channel_id: ChannelId([0xaa; 32]) };
        assert_eq!(err.to_string(), format!("channel {} is already funded", "aa".repeat(32)));
    }
}
