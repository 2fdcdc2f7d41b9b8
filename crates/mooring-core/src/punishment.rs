//! Justice transactions for revoked commitments.
//!
//! When a counterparty broadcasts a commitment it has already revoked, the
//! per-commitment secret it handed over lets us claim every output of that
//! commitment. This module turns a revealed secret into a signed transaction
//! that does so.
//!
//! # Construction
//!
//! 1. The sweep builder produces a template spending the revoked outputs
//! 2. The destination is the account's own receive address
//! 3. An optional reward address is resolved on the same network
//! 4. The reward is a fixed fraction of the revoked state's balances
//! 5. Outputs are attached: reward (if any), then the remainder
//! 6. Fee quotes are gathered for a fast confirmation target and averaged
//! 7. The fee is computed for the predicted signed weight
//! 8. The fee is taken out of the remainder, never out of the reward
//! 9. The signer authorizes every input; the result is checked
//!
//! All amounts are whole satoshis. The reward fraction is applied in parts
//! per million on `u128` and rounded down; the fee rounds up.

use std::fmt;

use bitcoin::{
    Address, Amount, FeeRate, Network, OutPoint, ScriptBuf, Transaction, TxOut, Txid, Weight,
    address::NetworkUnchecked, consensus::encode, secp256k1::SecretKey,
};
use thiserror::Error;

use crate::{
    account::{Account, AccountError},
    error::PossibleBug,
    fee::{FeeAggregator, FeeError, FeeOracle, estimate_fee_rate, mean_fee_rate},
};

/// Segwit marker and flag bytes, counted once the first witness is attached.
const SEGWIT_MARKER_WEIGHT: Weight = Weight::from_wu(2);

/// Secret released when a commitment was revoked.
#[derive(Clone, PartialEq, Eq)]
pub struct PerCommitmentSecret([u8; 32]);

impl PerCommitmentSecret {
    /// Wrap raw secret bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for PerCommitmentSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PerCommitmentSecret(..)")
    }
}

/// The revoked commitment the counterparty broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevokedCommitment {
    /// Commitment number of the revoked state
    pub commitment_number: u64,
    /// Txid of the broadcast commitment
    pub commitment_txid: Txid,
    /// Counterparty's own balance at that state
    pub to_local: Amount,
    /// Our balance at that state
    pub to_remote: Amount,
}

/// Our basepoint secrets for the channel.
#[derive(Clone)]
pub struct LocalSigningKeys {
    /// Revocation basepoint secret
    pub revocation_basepoint_secret: SecretKey,
    /// Payment basepoint secret
    pub payment_basepoint_secret: SecretKey,
}

impl fmt::Debug for LocalSigningKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LocalSigningKeys(..)")
    }
}

/// One revoked output the template spends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepInput {
    /// Output being spent
    pub outpoint: OutPoint,
    /// Its value
    pub value: Amount,
    /// Weight of the finished witness, including the item count
    pub satisfaction_weight: Weight,
}

/// Unsigned transaction spending the revoked outputs, without outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepTemplate {
    /// Inputs in place, witnesses empty, no outputs
    pub transaction: Transaction,
    /// Description of each input, in input order
    pub inputs: Vec<SweepInput>,
}

/// Builds the spend of a revoked commitment's outputs.
pub trait RevokedCommitmentSweepBuilder: Send + Sync {
    /// Template spending every output of `commitment` that `secret` unlocks.
    fn build_sweep(
        &self,
        secret: &PerCommitmentSecret,
        commitment: &RevokedCommitment,
        keys: &LocalSigningKeys,
        network: Network,
    ) -> Result<SweepTemplate, SweepError>;
}

/// Sweep builder failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("sweep construction failed: {0}")]
pub struct SweepError(pub String);

/// Signs the inputs of a sweep.
pub trait SweepSigner: Send + Sync {
    /// Attach a witness to every input of `transaction`.
    fn sign(
        &self,
        transaction: Transaction,
        inputs: &[SweepInput],
        secret: &PerCommitmentSecret,
        keys: &LocalSigningKeys,
    ) -> Result<Transaction, SignError>;
}

/// Signer failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("signing failed: {0}")]
pub struct SignError(pub String);

/// Share of the revoked balances paid to a reward address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewardPolicy {
    /// Reward in millionths of `to_local + to_remote`
    pub parts_per_million: u32,
}

impl Default for RewardPolicy {
    fn default() -> Self {
        Self { parts_per_million: 1_000 }
    }
}

impl RewardPolicy {
    /// Reward for a commitment with the given balances, rounded down.
    pub fn reward_for(&self, to_local: Amount, to_remote: Amount) -> Amount {
        let total = u128::from(to_local.to_sat()) + u128::from(to_remote.to_sat());
        let reward = total * u128::from(self.parts_per_million) / 1_000_000;
        Amount::from_sat(u64::try_from(reward).unwrap_or(u64::MAX))
    }
}

/// Punishment builder configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PunishmentConfig {
    /// Confirmation target for fee estimation
    pub confirmation_target_blocks: u16,
    /// Reward share
    pub reward: RewardPolicy,
}

impl Default for PunishmentConfig {
    fn default() -> Self {
        Self { confirmation_target_blocks: 2, reward: RewardPolicy::default() }
    }
}

/// Everything needed to punish one revoked commitment.
#[derive(Debug, Clone)]
pub struct PunishmentRequest {
    /// Secret of the revoked state
    pub secret: PerCommitmentSecret,
    /// The broadcast commitment
    pub commitment: RevokedCommitment,
    /// Our signing material
    pub keys: LocalSigningKeys,
    /// Chain to build for
    pub network: Network,
    /// Third party paid a reward, if any
    pub reward_address: Option<Address<NetworkUnchecked>>,
}

/// A finished, signed justice transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PunishmentTransaction {
    /// Signed transaction
    pub transaction: Transaction,
    /// Fee it pays
    pub fee: Amount,
    /// Reward output value, if a reward address was given
    pub reward: Option<Amount>,
    /// Sum of the swept inputs
    pub swept_value: Amount,
}

impl PunishmentTransaction {
    /// Transaction id.
    pub fn txid(&self) -> Txid {
        self.transaction.compute_txid()
    }

    /// Consensus encoding, ready to broadcast.
    pub fn serialize(&self) -> Vec<u8> {
        encode::serialize(&self.transaction)
    }
}

/// Justice transaction construction failed. Nothing was broadcast.
#[derive(Debug, Error)]
pub enum PunishmentError {
    /// Sweep builder failed
    #[error(transparent)]
    Sweep(#[from] SweepError),

    /// Template inputs do not line up with their descriptions
    #[error("malformed sweep template: {0}")]
    MalformedTemplate(String),

    /// Template spends nothing
    #[error("sweep template has no inputs")]
    NoSweepInputs,

    /// Account could not provide a destination
    #[error("failed to resolve destination: {0}")]
    Destination(#[from] AccountError),

    /// Reward address is not valid on the channel's network
    #[error("reward address is not valid on {network}: {reason}")]
    RewardAddress {
        /// Channel network
        network: Network,
        /// Parse error
        reason: String,
    },

    /// Input values overflow
    #[error("swept value overflows")]
    ValueOverflow,

    /// Fee estimation failed
    #[error(transparent)]
    Fee(#[from] FeeError),

    /// Fee for the estimated rate overflows
    #[error("fee computation overflows")]
    FeeOverflow,

    /// Swept value cannot cover reward and fee
    #[error("swept value {} sat cannot cover {} sat", .available.to_sat(), .required.to_sat())]
    InsufficientValue {
        /// Value available
        available: Amount,
        /// Value needed
        required: Amount,
    },

    /// Remainder after fee is below the destination's dust limit
    #[error("remainder {} sat is below dust limit {} sat", .remainder.to_sat(), .dust.to_sat())]
    RemainderBelowDust {
        /// Remainder after fee
        remainder: Amount,
        /// Minimum non-dust value
        dust: Amount,
    },

    /// Signing or its checks failed
    #[error(transparent)]
    Finalize(#[from] FinalizeError),
}

/// Finalization failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FinalizeError {
    /// Signer failed
    #[error(transparent)]
    Signing(#[from] SignError),

    /// Signer altered inputs or outputs
    #[error("signer changed the transaction's inputs or outputs")]
    ShapeChanged,

    /// An input was left without a witness
    #[error("input {index} is not signed")]
    UnsignedInput {
        /// Input index
        index: usize,
    },
}

impl PossibleBug for FinalizeError {
    fn possible_bug(&self) -> bool {
        match self {
            Self::Signing(_) => false,
            Self::ShapeChanged | Self::UnsignedInput { .. } => true,
        }
    }
}

impl PossibleBug for PunishmentError {
    fn possible_bug(&self) -> bool {
        match self {
            Self::Sweep(_) | Self::MalformedTemplate(_) | Self::NoSweepInputs | Self::ValueOverflow => {
                true
            },
            Self::Finalize(err) => err.possible_bug(),
            Self::Destination(_)
            | Self::RewardAddress { .. }
            | Self::Fee(_)
            | Self::FeeOverflow
            | Self::InsufficientValue { .. }
            | Self::RemainderBelowDust { .. } => false,
        }
    }
}

/// Builds justice transactions.
pub struct PunishmentTxBuilder<B, S, O> {
    sweeper: B,
    signer: S,
    oracle: O,
    aggregate: FeeAggregator,
    config: PunishmentConfig,
}

impl<B, S, O> fmt::Debug for PunishmentTxBuilder<B, S, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PunishmentTxBuilder").field("config", &self.config).finish_non_exhaustive()
    }
}

impl<B, S, O> PunishmentTxBuilder<B, S, O>
where
    B: RevokedCommitmentSweepBuilder,
    S: SweepSigner,
    O: FeeOracle,
{
    /// Builder with the default config and mean fee aggregation.
    pub fn new(sweeper: B, signer: S, oracle: O) -> Self {
        Self { sweeper, signer, oracle, aggregate: mean_fee_rate, config: PunishmentConfig::default() }
    }

    /// Replace the config.
    pub fn with_config(mut self, config: PunishmentConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the fee aggregator.
    pub fn with_aggregator(mut self, aggregate: FeeAggregator) -> Self {
        self.aggregate = aggregate;
        self
    }

    /// Current config.
    pub fn config(&self) -> &PunishmentConfig {
        &self.config
    }

    /// Build and sign the justice transaction for `request`.
    ///
    /// Fails without retrying; re-quoting fees is the caller's decision.
    pub async fn build<A>(&self, account: &A, request: &PunishmentRequest) -> Result<PunishmentTransaction, PunishmentError>
    where
        A: Account + ?Sized,
    {
        let template = self.sweeper.build_sweep(
            &request.secret,
            &request.commitment,
            &request.keys,
            request.network,
        )?;
        let swept_value = check_template(&template)?;

        let destination = account.receive_address(request.network)?.script_pubkey();
        let reward_script = request
            .reward_address
            .clone()
            .map(|address| resolve_reward_address(address, request.network))
            .transpose()?;

        let reward = reward_script
            .as_ref()
            .map(|_| self.config.reward.reward_for(request.commitment.to_local, request.commitment.to_remote));
        let remainder = swept_value
            .checked_sub(reward.unwrap_or(Amount::ZERO))
            .ok_or(PunishmentError::InsufficientValue {
                available: swept_value,
                required: reward.unwrap_or(Amount::ZERO),
            })?;

        let mut transaction = template.transaction;
        if let (Some(script_pubkey), Some(value)) = (reward_script, reward) {
            transaction.output.push(TxOut { value, script_pubkey });
        }
        transaction.output.push(TxOut { value: remainder, script_pubkey: destination });

        let rate =
            estimate_fee_rate(&self.oracle, self.config.confirmation_target_blocks, self.aggregate).await?;
        let weight = predicted_weight(&transaction, &template.inputs);
        let fee = fee_for(rate, weight).ok_or(PunishmentError::FeeOverflow)?;

        let remainder_output = transaction.output.len() - 1;
        let destination_out = &mut transaction.output[remainder_output];
        let paid = destination_out.value.checked_sub(fee).ok_or(PunishmentError::InsufficientValue {
            available: swept_value,
            required: reward.unwrap_or(Amount::ZERO).checked_add(fee).unwrap_or(Amount::MAX),
        })?;
        let dust = destination_out.script_pubkey.minimal_non_dust();
        if paid < dust {
            return Err(PunishmentError::RemainderBelowDust { remainder: paid, dust });
        }
        destination_out.value = paid;

        tracing::debug!(
            commitment_number = request.commitment.commitment_number,
            sat_per_kwu = rate.to_sat_per_kwu(),
            weight_wu = weight.to_wu(),
            fee_sat = fee.to_sat(),
            "computed punishment fee"
        );

        let transaction = self.finalize(transaction, &template.inputs, request)?;
        let punishment = PunishmentTransaction { transaction, fee, reward, swept_value };

        tracing::info!(
            txid = %punishment.txid(),
            commitment_txid = %request.commitment.commitment_txid,
            swept_sat = swept_value.to_sat(),
            fee_sat = fee.to_sat(),
            reward_sat = reward.map(Amount::to_sat),
            "built punishment transaction"
        );
        Ok(punishment)
    }

    fn finalize(
        &self,
        unsigned: Transaction,
        inputs: &[SweepInput],
        request: &PunishmentRequest,
    ) -> Result<Transaction, FinalizeError> {
        let signed = self.signer.sign(unsigned.clone(), inputs, &request.secret, &request.keys)?;

        let same_inputs = signed.input.len() == unsigned.input.len()
            && signed.input.iter().zip(&unsigned.input).all(|(s, u)| s.previous_output == u.previous_output);
        if !same_inputs || signed.output != unsigned.output {
            return Err(FinalizeError::ShapeChanged);
        }

        if let Some(index) = signed.input.iter().position(|input| input.witness.is_empty()) {
            return Err(FinalizeError::UnsignedInput { index });
        }

        Ok(signed)
    }
}

/// Validate the template and return the total it sweeps.
fn check_template(template: &SweepTemplate) -> Result<Amount, PunishmentError> {
    let tx = &template.transaction;
    if tx.input.is_empty() {
        return Err(PunishmentError::NoSweepInputs);
    }
    if !tx.output.is_empty() {
        return Err(PunishmentError::MalformedTemplate(format!("template already has {} outputs", tx.output.len())));
    }
    if tx.input.len() != template.inputs.len() {
        return Err(PunishmentError::MalformedTemplate(format!(
            "{} inputs described for {} spent",
            template.inputs.len(),
            tx.input.len()
        )));
    }
    if let Some(index) = tx.input.iter().zip(&template.inputs).position(|(i, d)| i.previous_output != d.outpoint) {
        return Err(PunishmentError::MalformedTemplate(format!("input {index} spends an undescribed outpoint")));
    }

    template
        .inputs
        .iter()
        .try_fold(Amount::ZERO, |sum, input| sum.checked_add(input.value))
        .ok_or(PunishmentError::ValueOverflow)
}

fn resolve_reward_address(address: Address<NetworkUnchecked>, network: Network) -> Result<ScriptBuf, PunishmentError> {
    address
        .require_network(network)
        .map(|address| address.script_pubkey())
        .map_err(|e| PunishmentError::RewardAddress { network, reason: e.to_string() })
}

/// Weight once every input carries its witness.
fn predicted_weight(unsigned: &Transaction, inputs: &[SweepInput]) -> Weight {
    inputs
        .iter()
        .fold(unsigned.weight() + SEGWIT_MARKER_WEIGHT, |weight, input| weight + input.satisfaction_weight)
}

/// `rate * weight`, rounded up to the next satoshi.
fn fee_for(rate: FeeRate, weight: Weight) -> Option<Amount> {
    let sat_kwu = rate.to_sat_per_kwu().checked_mul(weight.to_wu())?;
    Some(Amount::from_sat(sat_kwu.div_ceil(1_000)))
}

#[cfg(test)]
mod tests {
    use bitcoin::Witness;

    use super::*;
    use crate::testing::{FixedFeeOracle, StubSigner, StubSweepBuilder, fixtures};

    type Builder = PunishmentTxBuilder<StubSweepBuilder, StubSigner, FixedFeeOracle>;

    fn builder(rates: &[u64]) -> Builder {
        PunishmentTxBuilder::new(
            StubSweepBuilder,
            StubSigner::default(),
            FixedFeeOracle::new(rates.iter().copied().map(FeeRate::from_sat_per_kwu).collect()),
        )
    }

    #[test]
    fn reward_is_a_tenth_of_a_percent_rounded_down() {
        let policy = RewardPolicy::default();
        assert_eq!(policy.reward_for(Amount::from_sat(100_000), Amount::from_sat(50_000)), Amount::from_sat(150));
        assert_eq!(policy.reward_for(Amount::from_sat(999), Amount::ZERO), Amount::ZERO);
        assert_eq!(policy.reward_for(Amount::from_sat(1_999), Amount::ZERO), Amount::from_sat(1));
    }

    #[test]
    fn reward_policy_is_configurable() {
        let policy = RewardPolicy { parts_per_million: 25_000 };
        assert_eq!(policy.reward_for(Amount::from_sat(40_000), Amount::ZERO), Amount::from_sat(1_000));
    }

    #[test]
    fn fee_rounds_up() {
        let rate = FeeRate::from_sat_per_kwu(253);
        assert_eq!(fee_for(rate, Weight::from_wu(1_000)), Some(Amount::from_sat(253)));
        assert_eq!(fee_for(rate, Weight::from_wu(1_001)), Some(Amount::from_sat(254)));
        assert_eq!(fee_for(FeeRate::from_sat_per_kwu(u64::MAX), Weight::from_wu(2)), None);
    }

    #[tokio::test]
    async fn rewarded_punishment_splits_value() {
        let request = fixtures::punishment_request(Some(fixtures::reward_address()));
        let punishment = builder(&[400, 500, 600]).build(&fixtures::account(), &request).await.unwrap();

        let outputs = &punishment.transaction.output;
        assert_eq!(outputs.len(), 2);
        assert_eq!(punishment.fee, Amount::from_sat(500));
        assert_eq!(punishment.reward, Some(Amount::from_sat(150)));
        assert_eq!(outputs[0].value, Amount::from_sat(150));
        assert_eq!(outputs[1].value, Amount::from_sat(150_000 - 150 - 500));
        assert_eq!(
            outputs[1].script_pubkey,
            fixtures::account().receive_address(Network::Regtest).unwrap().script_pubkey()
        );
    }

    #[tokio::test]
    async fn unrewarded_punishment_has_one_output() {
        let request = fixtures::punishment_request(None);
        let punishment = builder(&[500]).build(&fixtures::account(), &request).await.unwrap();

        assert_eq!(punishment.transaction.output.len(), 1);
        assert_eq!(punishment.reward, None);
        assert_eq!(punishment.fee, Amount::from_sat(438));
        assert_eq!(punishment.transaction.output[0].value, Amount::from_sat(150_000 - 438));
    }

    #[tokio::test]
    async fn every_input_is_signed() {
        let request = fixtures::punishment_request(None);
        let punishment = builder(&[500]).build(&fixtures::account(), &request).await.unwrap();

        assert!(punishment.transaction.input.iter().all(|input| !input.witness.is_empty()));
        assert_eq!(punishment.txid(), punishment.transaction.compute_txid());
        assert!(!punishment.serialize().is_empty());
    }

    #[tokio::test]
    async fn unsigned_input_fails_finalization() {
        let request = fixtures::punishment_request(None);
        let builder = PunishmentTxBuilder::new(
            StubSweepBuilder,
            StubSigner::leaving_unsigned(1),
            FixedFeeOracle::new(vec![FeeRate::from_sat_per_kwu(500)]),
        );

        let err = builder.build(&fixtures::account(), &request).await.unwrap_err();
        assert!(matches!(err, PunishmentError::Finalize(FinalizeError::UnsignedInput { index: 1 })));
        assert!(err.possible_bug());
    }

    #[tokio::test]
    async fn reward_address_on_wrong_network_is_rejected() {
        let mut request = fixtures::punishment_request(Some(fixtures::reward_address()));
        request.network = Network::Bitcoin;

        let err = builder(&[500]).build(&fixtures::account_on(Network::Bitcoin), &request).await.unwrap_err();
        assert!(matches!(err, PunishmentError::RewardAddress { network: Network::Bitcoin, .. }));
        assert!(!err.possible_bug());
    }

    #[tokio::test]
    async fn fee_larger_than_remainder_is_insufficient_value() {
        let mut request = fixtures::punishment_request(None);
        request.commitment.to_local = Amount::from_sat(200);
        request.commitment.to_remote = Amount::from_sat(100);

        let err = builder(&[10_000]).build(&fixtures::account(), &request).await.unwrap_err();
        assert!(matches!(err, PunishmentError::InsufficientValue { .. }));
    }

    #[tokio::test]
    async fn dust_remainder_is_rejected() {
        let mut request = fixtures::punishment_request(None);
        request.commitment.to_local = Amount::from_sat(400);
        request.commitment.to_remote = Amount::from_sat(300);

        let err = builder(&[500]).build(&fixtures::account(), &request).await.unwrap_err();
        match err {
            PunishmentError::RemainderBelowDust { remainder, dust } => {
                assert_eq!(remainder, Amount::from_sat(700 - 438));
                assert!(remainder < dust);
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn fee_failure_is_not_a_bug() {
        let request = fixtures::punishment_request(None);
        let err = builder(&[]).build(&fixtures::account(), &request).await.unwrap_err();

        assert!(matches!(err, PunishmentError::Fee(FeeError::NoEstimates { target_blocks: 2 })));
        assert!(!err.possible_bug());
    }

    #[test]
    fn template_with_mismatched_descriptions_is_malformed() {
        let mut template = StubSweepBuilder
            .build_sweep(
                &PerCommitmentSecret::new([1; 32]),
                &fixtures::revoked_commitment(),
                &fixtures::signing_keys(),
                Network::Regtest,
            )
            .unwrap();
        template.inputs.pop();

        assert!(matches!(check_template(&template), Err(PunishmentError::MalformedTemplate(_))));
    }

    #[test]
    fn predicted_weight_matches_signed_weight() {
        let template = StubSweepBuilder
            .build_sweep(
                &PerCommitmentSecret::new([1; 32]),
                &fixtures::revoked_commitment(),
                &fixtures::signing_keys(),
                Network::Regtest,
            )
            .unwrap();

        let mut signed = template.transaction.clone();
        for (input, desc) in signed.input.iter_mut().zip(&template.inputs) {
            input.witness = Witness::from_slice(&fixtures::witness_for(desc.satisfaction_weight));
        }

        assert_eq!(predicted_weight(&template.transaction, &template.inputs), signed.weight());
    }

    #[test]
    fn secrets_are_redacted_in_debug() {
        let secret = PerCommitmentSecret::new([0x42; 32]);
        assert_eq!(format!("{secret:?}"), "PerCommitmentSecret(..)");
        assert_eq!(format!("{:?}", fixtures::signing_keys()), "LocalSigningKeys(..)");
    }
}
