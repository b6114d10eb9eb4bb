//! Chain and estimation data types shared by the tracker, sampler and
//! estimator.

use std::fmt;
use std::str::FromStr;

use alloy_primitives::{Address, B256, U256};

use super::error::GasPriceError;
use super::provider::ProviderError;

/// Content hash identifying a block. Used as the coalescing and cache key.
pub type ChainHead = B256;

/// A fee value in wei per gas.
pub type Fee = U256;

/// The subset of a block header the estimator needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub hash: ChainHead,
    pub parent_hash: ChainHead,
    pub number: u64,
    /// `None` for blocks produced before the fee-market upgrade.
    pub base_fee_per_gas: Option<Fee>,
    /// Fee recipient of the block.
    pub miner: Address,
}

impl Header {
    pub fn base_fee(&self) -> Fee {
        self.base_fee_per_gas.unwrap_or(U256::ZERO)
    }
}

/// Fee fields of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxFees {
    Legacy {
        gas_price: Fee,
    },
    Dynamic {
        max_fee_per_gas: Fee,
        max_priority_fee_per_gas: Fee,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub hash: B256,
    pub from: Address,
    pub fees: TxFees,
}

impl Transaction {
    /// Tip actually paid to the block producer on top of `base_fee`.
    ///
    /// Fails when the transaction's fee cap cannot cover the base fee, which
    /// can only happen for a block the provider reported incorrectly.
    pub fn effective_tip(&self, base_fee: Fee) -> Result<Fee, ProviderError> {
        let cap = match self.fees {
            TxFees::Legacy { gas_price } => gas_price,
            TxFees::Dynamic {
                max_fee_per_gas, ..
            } => max_fee_per_gas,
        };
        let headroom = cap
            .checked_sub(base_fee)
            .ok_or_else(|| ProviderError::FormatError {
                message: format!(
                    "transaction {} fee cap {} is below base fee {}",
                    self.hash, cap, base_fee
                ),
            })?;

        Ok(match self.fees {
            TxFees::Legacy { .. } => headroom,
            TxFees::Dynamic {
                max_priority_fee_per_gas,
                ..
            } => headroom.min(max_priority_fee_per_gas),
        })
    }

    /// Base fee plus effective tip.
    pub fn effective_fee(&self, base_fee: Fee) -> Result<Fee, ProviderError> {
        Ok(base_fee + self.effective_tip(base_fee)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Transaction>,
}

/// The lowest qualifying fees of one block, paired with its header so the
/// estimator can walk to the parent without another fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeSample {
    pub header: Header,
    /// Ascending.
    pub fees: Vec<Fee>,
}

/// One percentile bucket `[start, end)` over the sorted fee pool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Target {
    pub start: f64,
    pub end: f64,
}

impl Target {
    pub const fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn validate(&self) -> Result<(), GasPriceError> {
        let valid = self.start.is_finite()
            && self.end.is_finite()
            && self.start >= 0.0
            && self.end > self.start
            && self.end <= 1.0;
        if valid {
            Ok(())
        } else {
            Err(GasPriceError::InvalidConfiguration(format!(
                "target {self} must satisfy 0 <= start < end <= 1"
            )))
        }
    }

    /// Index range of this bucket in a sorted pool of `len` values. A bucket
    /// that truncates to nothing is widened to exactly one element.
    pub fn bounds(&self, len: usize) -> (usize, usize) {
        let start = (self.start * len as f64) as usize;
        let end = (self.end * len as f64) as usize;
        if end <= start {
            (start, start + 1)
        } else {
            (start, end)
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.start, self.end)
    }
}

impl FromStr for Target {
    type Err = GasPriceError;

    /// Parses `start:end`, e.g. `0.3:0.6`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || GasPriceError::InvalidConfiguration(format!("cannot parse target '{s}'"));
        let (start, end) = s.split_once(':').ok_or_else(invalid)?;
        let target = Target {
            start: start.trim().parse().map_err(|_| invalid())?,
            end: end.trim().parse().map_err(|_| invalid())?,
        };
        target.validate()?;
        Ok(target)
    }
}
