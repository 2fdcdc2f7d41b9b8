//! Channel reconnection and revoked-commitment punishment.
//!
//! The two highest-risk paths of a payment-channel client live here:
//! resynchronizing a channel with its counterparty after a disconnect, and
//! building the justice transaction that sweeps a counterparty who broadcast
//! a revoked commitment.
//!
//! # Architecture
//!
//! Everything this crate does not own sits behind a narrow trait: the channel
//! state machine ([`ChannelStateMachine`]), the authenticated peer link
//! ([`PeerLink`]), the network ([`Transport`]), persistence
//! ([`ChannelStore`]), the wallet ([`Account`]), fee estimation
//! ([`FeeOracle`]), and the revoked-output sweep and signing services
//! ([`RevokedCommitmentSweepBuilder`], [`SweepSigner`]).
//!
//! Links and state machines are move-only. Every send, receive, or command
//! consumes the old value and hands back its successor, so stale protocol
//! state cannot be acted on after a round-trip. Callers serialize all
//! operations on one session; independent sessions share nothing mutable.
//!
//! No operation retries internally. Timeouts and retry policy belong to the
//! caller, who may drop any in-flight future at a suspension point: the link
//! moved into it is dropped too, so a half-read frame is never observed.
//!
//! # Components
//!
//! - [`transport`]: Transport abstraction (accept/connect byte streams)
//! - [`link`]: Framed peer link with `init` exchange and ping handling
//! - [`channel`]: State machine capability, commands, events, funding
//! - [`reestablish`]: The `channel_reestablish` handshake
//! - [`session`]: Reconnected channel sessions (connect/accept/save)
//! - [`store`]: Persisted channel records (memory and redb backends)
//! - [`fee`]: Fee oracle, multi-source aggregation
//! - [`punishment`]: Justice transaction construction
//! - [`error`]: Shared error taxonomy

pub mod account;
pub mod channel;
pub mod error;
pub mod fee;
pub mod link;
pub mod punishment;
pub mod reestablish;
pub mod session;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod transport;

pub use account::{Account, AccountError};
pub use channel::{
    ChannelCommand, ChannelEvent, ChannelStateMachine, DisabledFundingProvider, FundingError,
    FundingOutput, FundingProvider, FundingRequest, RestoreContext,
};
pub use error::{ConnectError, LinkError, PossibleBug, ReconnectError, RecvMsgError, ReestablishError};
pub use fee::{
    FeeAggregator, FeeError, FeeOracle, FeeSource, MultiSourceFeeOracle, estimate_fee_rate, mean_fee_rate,
};
pub use link::{FramedLink, MAX_PONG_BYTES, PeerLink};
pub use punishment::{
    FinalizeError, LocalSigningKeys, PerCommitmentSecret, PunishmentConfig, PunishmentError,
    PunishmentRequest, PunishmentTransaction, PunishmentTxBuilder, RevokedCommitment,
    RevokedCommitmentSweepBuilder, RewardPolicy, SignError, SweepError, SweepInput, SweepSigner,
    SweepTemplate,
};
pub use reestablish::reestablish;
pub use session::ChannelSession;
pub use store::{ChannelStore, MemoryChannelStore, PersistedChannel, RedbChannelStore, StoreError};
pub use transport::{TcpTransport, Transport};
