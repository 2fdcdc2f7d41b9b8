//! Scripted collaborators for tests.
//!
//! Everything here is deterministic: links replay a fixed script of replies,
//! the channel machine answers from a serializable fixture, and the sweep,
//! signer, and fee doubles produce fixed shapes whose weights are known in
//! advance.
#![allow(clippy::expect_used)]

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use bitcoin::{
    Address, Amount, CompressedPublicKey, FeeRate, Network, OutPoint, ScriptBuf, Sequence,
    Transaction, TxIn, Txid, Weight, Witness,
    absolute::LockTime,
    address::NetworkUnchecked,
    secp256k1::{PublicKey, Secp256k1, SecretKey},
    transaction::Version,
};
use mooring_proto::{ChannelId, ChannelMessage, ChannelReestablish, ErrorMessage, FundingLocked, Message, NodeId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    account::{Account, AccountError},
    channel::{
        ChannelCommand, ChannelEvent, ChannelStateMachine, DisabledFundingProvider, FundingError,
        FundingOutput, FundingProvider, FundingRequest, RestoreContext,
    },
    error::{LinkError, RecvMsgError},
    fee::{FeeError, FeeOracle, FeeSource},
    link::PeerLink,
    punishment::{
        LocalSigningKeys, PerCommitmentSecret, RevokedCommitment, RevokedCommitmentSweepBuilder,
        SignError, SweepError, SweepInput, SweepSigner, SweepTemplate,
    },
};

/// One scripted answer to `recv_channel_msg`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Deliver this channel message
    Message(ChannelMessage),
    /// Peer sends `error`
    Error(ErrorMessage),
    /// Peer hangs up
    Closed,
}

/// What a [`ScriptedLink`] and its successors did.
#[derive(Debug, Default)]
pub struct Journal {
    /// Messages sent, in order
    pub sent: Vec<Message>,
    /// Receive calls made
    pub receives: usize,
    /// Whether `close` was called
    pub closed: bool,
}

/// Shared handle on a link's journal.
pub type SharedJournal = Arc<Mutex<Journal>>;

/// [`PeerLink`] that replays a fixed script.
///
/// An exhausted script behaves like a closed connection.
#[derive(Debug)]
pub struct ScriptedLink {
    replies: VecDeque<Reply>,
    journal: SharedJournal,
    remote_node_id: NodeId,
    remote_endpoint: SocketAddr,
    receives: usize,
    fail_sends: bool,
}

impl ScriptedLink {
    /// Link answering with `replies`, connected to the fixture counterparty.
    pub fn new(replies: impl IntoIterator<Item = Reply>) -> (Self, SharedJournal) {
        let journal = SharedJournal::default();
        let link = Self {
            replies: replies.into_iter().collect(),
            journal: Arc::clone(&journal),
            remote_node_id: fixtures::remote_node_id(),
            remote_endpoint: fixtures::remote_endpoint(),
            receives: 0,
            fail_sends: false,
        };
        (link, journal)
    }

    /// Make every send fail as if the peer had gone.
    pub fn failing_sends(mut self) -> Self {
        self.fail_sends = true;
        self
    }

    /// Receives made by this link and its predecessors.
    pub fn receives(&self) -> usize {
        self.receives
    }

    fn record(&self, update: impl FnOnce(&mut Journal)) {
        update(&mut self.journal.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

#[async_trait]
impl PeerLink for ScriptedLink {
    fn remote_node_id(&self) -> NodeId {
        self.remote_node_id
    }

    fn remote_endpoint(&self) -> SocketAddr {
        self.remote_endpoint
    }

    async fn send(self, message: Message) -> Result<Self, LinkError> {
        if self.fail_sends {
            return Err(LinkError::Closed);
        }
        self.record(|journal| journal.sent.push(message));
        Ok(self)
    }

    async fn recv_channel_msg(mut self) -> Result<(Self, ChannelMessage), RecvMsgError<Self>> {
        self.receives += 1;
        self.record(|journal| journal.receives += 1);

        match self.replies.pop_front() {
            Some(Reply::Message(message)) => Ok((self, message)),
            Some(Reply::Error(message)) => Err(RecvMsgError::PeerError { link: self, message }),
            Some(Reply::Closed) | None => Err(RecvMsgError::Link(LinkError::Closed)),
        }
    }

    async fn close(self) {
        self.record(|journal| journal.closed = true);
    }
}

/// Ways a [`ScriptedChannel`] can break its contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Misbehavior {
    /// `CreateReestablish` produces nothing
    SilentReestablish,
    /// `CreateReestablish` produces two messages
    DoubleReestablish,
    /// `CreateReestablish` also retransmits `funding_locked`
    ResendFundingLocked,
    /// Every command fails
    RejectCommands,
}

/// Durable state of a [`ScriptedChannel`]; its snapshot is this, CBOR-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelFixture {
    /// Assigned channel id
    pub channel_id: Option<ChannelId>,
    /// Confirmed funding output
    pub funding: Option<FundingOutput>,
    /// Reported in our `channel_reestablish`
    pub next_commitment_number: u64,
    /// Reported in our `channel_reestablish`
    pub next_revocation_number: u64,
    /// Contract violation to exhibit
    pub misbehavior: Option<Misbehavior>,
}

impl ChannelFixture {
    /// A funded, well-behaved channel.
    pub fn funded(channel_id: ChannelId) -> Self {
        Self {
            channel_id: Some(channel_id),
            funding: Some(fixtures::funding_output()),
            next_commitment_number: 5,
            next_revocation_number: 4,
            misbehavior: None,
        }
    }
}

/// [`ScriptedChannel`] failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptedChannelError {
    /// Snapshot could not be encoded or decoded
    #[error("snapshot codec: {0}")]
    Snapshot(String),

    /// Command refused
    #[error("command rejected")]
    Rejected,
}

/// Deterministic [`ChannelStateMachine`].
pub struct ScriptedChannel {
    fixture: ChannelFixture,
    remote_node_id: NodeId,
    network: Network,
    funding_provider: Arc<dyn FundingProvider>,
    reestablish_sent: bool,
}

impl std::fmt::Debug for ScriptedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedChannel")
            .field("fixture", &self.fixture)
            .field("reestablish_sent", &self.reestablish_sent)
            .finish_non_exhaustive()
    }
}

impl ScriptedChannel {
    /// Machine for `fixture` with the fixture counterparty on regtest.
    pub fn new(fixture: ChannelFixture) -> Self {
        let channel_id = fixture.channel_id.unwrap_or(ChannelId::ALL);
        Self {
            fixture,
            remote_node_id: fixtures::remote_node_id(),
            network: Network::Regtest,
            funding_provider: Arc::new(DisabledFundingProvider::new(channel_id)),
            reestablish_sent: false,
        }
    }

    /// Whether our `channel_reestablish` has been produced.
    pub fn reestablish_sent(&self) -> bool {
        self.reestablish_sent
    }

    /// Durable state.
    pub fn fixture(&self) -> &ChannelFixture {
        &self.fixture
    }

    /// Ask the funding provider for a funding transaction.
    pub fn request_funding(&self, channel_value: Amount) -> Result<Transaction, FundingError> {
        let script_pubkey = self.fixture.funding.as_ref().map(|f| f.script_pubkey.clone()).unwrap_or_default();
        self.funding_provider.provide_funding(&FundingRequest { channel_value, script_pubkey })
    }

    fn our_reestablish(&self) -> ChannelReestablish {
        ChannelReestablish {
            channel_id: self.fixture.channel_id.unwrap_or(ChannelId::ALL),
            next_commitment_number: self.fixture.next_commitment_number,
            next_revocation_number: self.fixture.next_revocation_number,
            your_last_per_commitment_secret: [0; 32],
            my_current_per_commitment_point: fixtures::point(0x77),
        }
    }
}

impl ChannelStateMachine for ScriptedChannel {
    type Error = ScriptedChannelError;

    fn restore(snapshot: &[u8], context: RestoreContext) -> Result<Self, Self::Error> {
        let fixture: ChannelFixture =
            ciborium::de::from_reader(snapshot).map_err(|e| ScriptedChannelError::Snapshot(e.to_string()))?;
        Ok(Self {
            fixture,
            remote_node_id: context.remote_node_id,
            network: context.network,
            funding_provider: context.funding_provider,
            reestablish_sent: false,
        })
    }

    fn snapshot(&self) -> Result<Vec<u8>, Self::Error> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&self.fixture, &mut buf)
            .map_err(|e| ScriptedChannelError::Snapshot(e.to_string()))?;
        Ok(buf)
    }

    fn execute(mut self, command: ChannelCommand) -> Result<(Self, Vec<ChannelEvent>), Self::Error> {
        match (command, self.fixture.misbehavior) {
            (_, Some(Misbehavior::RejectCommands)) => Err(ScriptedChannelError::Rejected),
            (ChannelCommand::CreateReestablish, Some(Misbehavior::SilentReestablish)) => {
                self.reestablish_sent = true;
                Ok((self, Vec::new()))
            },
            (ChannelCommand::CreateReestablish, Some(Misbehavior::DoubleReestablish)) => {
                let message = self.our_reestablish();
                self.reestablish_sent = true;
                let events = vec![
                    ChannelEvent::WeSentChannelReestablish(message.clone()),
                    ChannelEvent::WeSentChannelReestablish(message),
                ];
                Ok((self, events))
            },
            (ChannelCommand::CreateReestablish, Some(Misbehavior::ResendFundingLocked)) => {
                let message = self.our_reestablish();
                let locked = FundingLocked {
                    channel_id: message.channel_id,
                    next_per_commitment_point: fixtures::point(0x78),
                };
                self.reestablish_sent = true;
                let events =
                    vec![ChannelEvent::WeSentChannelReestablish(message), ChannelEvent::WeSentFundingLocked(locked)];
                Ok((self, events))
            },
            (ChannelCommand::CreateReestablish, None) => {
                let message = self.our_reestablish();
                self.reestablish_sent = true;
                Ok((self, vec![ChannelEvent::WeSentChannelReestablish(message)]))
            },
        }
    }

    fn channel_id(&self) -> Option<ChannelId> {
        self.fixture.channel_id
    }

    fn funding_txid(&self) -> Option<Txid> {
        self.fixture.funding.as_ref().map(|f| f.outpoint.txid)
    }

    fn funding_output(&self) -> Option<FundingOutput> {
        self.fixture.funding.clone()
    }

    fn remote_node_id(&self) -> NodeId {
        self.remote_node_id
    }

    fn network(&self) -> Network {
        self.network
    }
}

/// Single-key account paying to P2WPKH.
#[derive(Debug, Clone)]
pub struct StaticAccount {
    file: String,
    secret: SecretKey,
    network: Network,
}

impl StaticAccount {
    /// Account `file` holding `secret` on `network`.
    pub fn new(file: impl Into<String>, secret: SecretKey, network: Network) -> Self {
        Self { file: file.into(), secret, network }
    }
}

impl Account for StaticAccount {
    fn file_identity(&self) -> &str {
        &self.file
    }

    fn node_secret(&self) -> &SecretKey {
        &self.secret
    }

    fn receive_address(&self, network: Network) -> Result<Address, AccountError> {
        if network != self.network {
            return Err(AccountError::NetworkMismatch { network });
        }
        let key = CompressedPublicKey(PublicKey::from_secret_key(&Secp256k1::signing_only(), &self.secret));
        Ok(Address::p2wpkh(&key, network))
    }
}

/// Spends `to_local` at vout 0 and `to_remote` at vout 1 of the commitment.
///
/// Zero balances produce no input.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubSweepBuilder;

impl StubSweepBuilder {
    /// Witness weight of the revocation-path `to_local` spend.
    pub const TO_LOCAL_WEIGHT: Weight = Weight::from_wu(273);

    /// Witness weight of the `to_remote` spend.
    pub const TO_REMOTE_WEIGHT: Weight = Weight::from_wu(109);
}

impl RevokedCommitmentSweepBuilder for StubSweepBuilder {
    fn build_sweep(
        &self,
        _secret: &PerCommitmentSecret,
        commitment: &RevokedCommitment,
        _keys: &LocalSigningKeys,
        _network: Network,
    ) -> Result<SweepTemplate, SweepError> {
        let outputs = [
            (0, commitment.to_local, Self::TO_LOCAL_WEIGHT),
            (1, commitment.to_remote, Self::TO_REMOTE_WEIGHT),
        ];

        let inputs: Vec<_> = outputs
            .into_iter()
            .filter(|(_, value, _)| *value > Amount::ZERO)
            .map(|(vout, value, satisfaction_weight)| SweepInput {
                outpoint: OutPoint { txid: commitment.commitment_txid, vout },
                value,
                satisfaction_weight,
            })
            .collect();

        let transaction = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: inputs
                .iter()
                .map(|input| TxIn {
                    previous_output: input.outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                })
                .collect(),
            output: Vec::new(),
        };

        Ok(SweepTemplate { transaction, inputs })
    }
}

/// Attaches a witness of exactly the described weight to every input.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubSigner {
    skip: Option<usize>,
}

impl StubSigner {
    /// Signer that leaves input `index` without a witness.
    pub fn leaving_unsigned(index: usize) -> Self {
        Self { skip: Some(index) }
    }
}

impl SweepSigner for StubSigner {
    fn sign(
        &self,
        mut transaction: Transaction,
        inputs: &[SweepInput],
        _secret: &PerCommitmentSecret,
        _keys: &LocalSigningKeys,
    ) -> Result<Transaction, SignError> {
        if transaction.input.len() != inputs.len() {
            return Err(SignError(format!("{} inputs, {} descriptions", transaction.input.len(), inputs.len())));
        }

        for (index, (input, desc)) in transaction.input.iter_mut().zip(inputs).enumerate() {
            if self.skip != Some(index) {
                input.witness = Witness::from_slice(&fixtures::witness_for(desc.satisfaction_weight));
            }
        }
        Ok(transaction)
    }
}

/// Oracle returning fixed quotes.
#[derive(Debug, Clone, Default)]
pub struct FixedFeeOracle {
    quotes: Vec<FeeRate>,
}

impl FixedFeeOracle {
    /// Oracle answering `quotes` for every target.
    pub fn new(quotes: Vec<FeeRate>) -> Self {
        Self { quotes }
    }
}

#[async_trait]
impl FeeOracle for FixedFeeOracle {
    async fn estimate_fee_rates(&self, _target_blocks: u16) -> Result<Vec<FeeRate>, FeeError> {
        Ok(self.quotes.clone())
    }
}

/// Source answering one fixed rate.
#[derive(Debug, Clone)]
pub struct StaticFeeSource {
    name: String,
    rate: FeeRate,
}

impl StaticFeeSource {
    /// Source `name` quoting `rate`.
    pub fn new(name: impl Into<String>, rate: FeeRate) -> Self {
        Self { name: name.into(), rate }
    }
}

#[async_trait]
impl FeeSource for StaticFeeSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn quote(&self, _target_blocks: u16) -> Result<FeeRate, FeeError> {
        Ok(self.rate)
    }
}

/// Source that is always unreachable.
#[derive(Debug, Clone)]
pub struct FailingFeeSource {
    name: String,
}

impl FailingFeeSource {
    /// Failing source `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl FeeSource for FailingFeeSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn quote(&self, _target_blocks: u16) -> Result<FeeRate, FeeError> {
        Err(FeeError::Source { source_name: self.name.clone(), reason: "unreachable".to_string() })
    }
}

/// Fixed identities, records, and messages.
pub mod fixtures {
    use bitcoin::hashes::Hash as _;
    use mooring_proto::{FundingLocked, Shutdown};

    use super::{
        Address, Amount, ChannelFixture, ChannelId, ChannelMessage, ChannelReestablish,
        CompressedPublicKey, FundingOutput, LocalSigningKeys, Network, NetworkUnchecked, NodeId,
        OutPoint, PerCommitmentSecret, PublicKey, RevokedCommitment, ScriptBuf, Secp256k1,
        SecretKey, SocketAddr, StaticAccount, Txid, Weight,
    };
    use crate::{punishment::PunishmentRequest, store::PersistedChannel};

    /// Channel used throughout the tests.
    pub const CHANNEL: ChannelId = ChannelId([0xc1; 32]);

    /// Account file identity recorded with [`CHANNEL`].
    pub const ACCOUNT_FILE: &str = "wallet-a";

    /// Secret key with every byte set to `byte`.
    pub fn secret(byte: u8) -> SecretKey {
        SecretKey::from_slice(&[byte; 32]).expect("non-zero bytes below the curve order")
    }

    /// Public key of [`secret`].
    pub fn point(byte: u8) -> PublicKey {
        PublicKey::from_secret_key(&Secp256k1::signing_only(), &secret(byte))
    }

    /// Our node key.
    pub fn node_secret() -> SecretKey {
        secret(0x11)
    }

    /// Our node id.
    pub fn local_node_id() -> NodeId {
        NodeId(point(0x11))
    }

    /// Counterparty node key.
    pub fn remote_secret() -> SecretKey {
        secret(0x22)
    }

    /// Counterparty node id.
    pub fn remote_node_id() -> NodeId {
        NodeId(point(0x22))
    }

    /// Counterparty's last known address.
    pub fn remote_endpoint() -> SocketAddr {
        SocketAddr::from(([192, 0, 2, 7], 9735))
    }

    /// Confirmed funding output of [`CHANNEL`].
    pub fn funding_output() -> FundingOutput {
        let mut script = vec![0x00, 0x20];
        script.extend_from_slice(&[0xf1; 32]);
        FundingOutput {
            outpoint: OutPoint { txid: Txid::from_byte_array([0xf0; 32]), vout: 0 },
            value: Amount::from_sat(1_000_000),
            script_pubkey: ScriptBuf::from_bytes(script),
        }
    }

    /// Snapshot of a funded machine for `channel_id`.
    pub fn snapshot(channel_id: ChannelId) -> Vec<u8> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&ChannelFixture::funded(channel_id), &mut buf).expect("fixture encodes");
        buf
    }

    /// Stored record for `channel_id`.
    pub fn persisted(channel_id: ChannelId) -> PersistedChannel {
        PersistedChannel {
            channel_id,
            channel_index: 3,
            network: Network::Regtest,
            remote_node_id: remote_node_id(),
            state_snapshot: snapshot(channel_id),
            account_file: ACCOUNT_FILE.to_string(),
            remote_endpoint: remote_endpoint(),
            min_safe_depth: 3,
        }
    }

    /// Our regtest account.
    pub fn account() -> StaticAccount {
        account_on(Network::Regtest)
    }

    /// Our account on `network`.
    pub fn account_on(network: Network) -> StaticAccount {
        StaticAccount::new(ACCOUNT_FILE, node_secret(), network)
    }

    /// Counterparty's `channel_reestablish`.
    pub fn reestablish(channel_id: ChannelId) -> ChannelMessage {
        ChannelMessage::ChannelReestablish(ChannelReestablish {
            channel_id,
            next_commitment_number: 5,
            next_revocation_number: 4,
            your_last_per_commitment_secret: [0x5e; 32],
            my_current_per_commitment_point: point(0x23),
        })
    }

    /// Counterparty's `funding_locked`.
    pub fn funding_locked(channel_id: ChannelId) -> ChannelMessage {
        ChannelMessage::FundingLocked(FundingLocked { channel_id, next_per_commitment_point: point(0x24) })
    }

    /// Counterparty's `shutdown`.
    pub fn shutdown(channel_id: ChannelId) -> ChannelMessage {
        ChannelMessage::Shutdown(Shutdown { channel_id, script_pubkey: vec![0x00, 0x14] })
    }

    /// Revoked state with 100 000 sat to the cheater and 50 000 sat to us.
    pub fn revoked_commitment() -> RevokedCommitment {
        RevokedCommitment {
            commitment_number: 41,
            commitment_txid: Txid::from_byte_array([0xcc; 32]),
            to_local: Amount::from_sat(100_000),
            to_remote: Amount::from_sat(50_000),
        }
    }

    /// Our basepoint secrets.
    pub fn signing_keys() -> LocalSigningKeys {
        LocalSigningKeys { revocation_basepoint_secret: secret(0x33), payment_basepoint_secret: secret(0x44) }
    }

    /// Third-party reward address on regtest.
    pub fn reward_address() -> Address<NetworkUnchecked> {
        Address::p2wpkh(&CompressedPublicKey(point(0x66)), Network::Regtest).as_unchecked().clone()
    }

    /// Request punishing [`revoked_commitment`] on regtest.
    pub fn punishment_request(reward_address: Option<Address<NetworkUnchecked>>) -> PunishmentRequest {
        PunishmentRequest {
            secret: PerCommitmentSecret::new([0x55; 32]),
            commitment: revoked_commitment(),
            keys: signing_keys(),
            network: Network::Regtest,
            reward_address,
        }
    }

    /// Witness items whose serialization, item count included, weighs
    /// exactly `weight`: a 72-byte signature and a filler item.
    ///
    /// Valid for weights from 75 to 327.
    pub fn witness_for(weight: Weight) -> Vec<Vec<u8>> {
        let total = usize::try_from(weight.to_wu()).unwrap_or(usize::MAX);
        let filler = total.saturating_sub(1 + 1 + 72 + 1);
        vec![vec![0x30; 72], vec![0x51; filler]]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_channel_snapshot_survives_restore() {
        let snapshot = fixtures::snapshot(fixtures::CHANNEL);
        let context = RestoreContext {
            channel_id: fixtures::CHANNEL,
            remote_node_id: fixtures::remote_node_id(),
            network: Network::Regtest,
            node_secret: fixtures::node_secret(),
            funding_provider: Arc::new(DisabledFundingProvider::new(fixtures::CHANNEL)),
        };

        let machine = ScriptedChannel::restore(&snapshot, context).unwrap();
        let (machine, _) = machine.execute(ChannelCommand::CreateReestablish).unwrap();

        assert!(machine.reestablish_sent());
        assert_eq!(machine.snapshot().unwrap(), snapshot);
    }

    #[test]
    fn restored_channel_cannot_be_refunded() {
        let machine = ScriptedChannel::new(ChannelFixture::funded(fixtures::CHANNEL));
        let err = machine.request_funding(Amount::from_sat(10_000)).unwrap_err();
        assert_eq!(err, FundingError::AlreadyFunded { channel_id: fixtures::CHANNEL });
    }

    #[test]
    fn rejecting_channel_fails_commands() {
        let machine = ScriptedChannel::new(ChannelFixture {
            misbehavior: Some(Misbehavior::RejectCommands),
            ..ChannelFixture::funded(fixtures::CHANNEL)
        });
        assert!(matches!(
            machine.execute(ChannelCommand::CreateReestablish),
            Err(ScriptedChannelError::Rejected)
        ));
    }

    #[test]
    fn account_refuses_foreign_network() {
        let err = fixtures::account().receive_address(Network::Bitcoin).unwrap_err();
        assert_eq!(err, AccountError::NetworkMismatch { network: Network::Bitcoin });
    }
}
