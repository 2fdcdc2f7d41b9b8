//! Fee-rate estimation.
//!
//! A [`FeeOracle`] returns one quote per source that answered; the caller
//! folds them into a single rate with a [`FeeAggregator`]. Rates are carried
//! as [`FeeRate`] (sat per 1000 weight units) end to end, so no floating
//! point is involved anywhere.

use async_trait::async_trait;
use bitcoin::FeeRate;
use futures::future::join_all;
use thiserror::Error;

/// Folds per-source quotes into one rate. `None` for an empty slice.
pub type FeeAggregator = fn(&[FeeRate]) -> Option<FeeRate>;

/// Fee estimation service.
#[async_trait]
pub trait FeeOracle: Send + Sync {
    /// One quote per responding source for confirmation within
    /// `target_blocks`.
    async fn estimate_fee_rates(&self, target_blocks: u16) -> Result<Vec<FeeRate>, FeeError>;
}

/// A single remote fee source.
#[async_trait]
pub trait FeeSource: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Rate for confirmation within `target_blocks`.
    async fn quote(&self, target_blocks: u16) -> Result<FeeRate, FeeError>;
}

/// Fee estimation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeeError {
    /// No source produced a quote
    #[error("no fee estimates available for a {target_blocks}-block target")]
    NoEstimates {
        /// Requested confirmation target
        target_blocks: u16,
    },

    /// One source failed
    #[error("fee source {source_name} failed: {reason}")]
    Source {
        /// Source that failed
        source_name: String,
        /// What went wrong
        reason: String,
    },

    /// Aggregator produced no rate from a non-empty set of quotes
    #[error("fee aggregation produced no rate")]
    Aggregation,
}

/// Queries every source concurrently and keeps the quotes that came back.
pub struct MultiSourceFeeOracle {
    sources: Vec<Box<dyn FeeSource>>,
}

impl std::fmt::Debug for MultiSourceFeeOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.sources.iter().map(|s| s.name()).collect();
        f.debug_struct("MultiSourceFeeOracle").field("sources", &names).finish()
    }
}

impl MultiSourceFeeOracle {
    /// Oracle over `sources`.
    pub fn new(sources: Vec<Box<dyn FeeSource>>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl FeeOracle for MultiSourceFeeOracle {
    async fn estimate_fee_rates(&self, target_blocks: u16) -> Result<Vec<FeeRate>, FeeError> {
        let results = join_all(
            self.sources.iter().map(|source| async move { (source.name(), source.quote(target_blocks).await) }),
        )
        .await;

        let mut quotes = Vec::with_capacity(results.len());
        for (name, result) in results {
            match result {
                Ok(rate) => {
                    tracing::debug!(source = name, sat_per_kwu = rate.to_sat_per_kwu(), "fee quote");
                    quotes.push(rate);
                },
                Err(err) => tracing::warn!(source = name, error = %err, "fee source failed"),
            }
        }

        if quotes.is_empty() {
            return Err(FeeError::NoEstimates { target_blocks });
        }
        Ok(quotes)
    }
}

/// Integer arithmetic mean in sat/kwu, rounded down.
pub fn mean_fee_rate(quotes: &[FeeRate]) -> Option<FeeRate> {
    if quotes.is_empty() {
        return None;
    }

    let sum: u128 = quotes.iter().map(|q| u128::from(q.to_sat_per_kwu())).sum();
    let mean = sum / quotes.len() as u128;
    u64::try_from(mean).ok().map(FeeRate::from_sat_per_kwu)
}

/// Query `oracle` and fold the quotes with `aggregate`.
pub async fn estimate_fee_rate<O>(oracle: &O, target_blocks: u16, aggregate: FeeAggregator) -> Result<FeeRate, FeeError>
where
    O: FeeOracle + ?Sized,
{
    let quotes = oracle.estimate_fee_rates(target_blocks).await?;
    if quotes.is_empty() {
        return Err(FeeError::NoEstimates { target_blocks });
    }
    aggregate(&quotes).ok_or(FeeError::Aggregation)
}
