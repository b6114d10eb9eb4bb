//! Gas price estimation core.
//!
//! Tracks the chain head, samples the cheapest qualifying fees of recent
//! blocks and aggregates them into percentile-based fee levels. Each layer
//! coalesces concurrent requests for the same key into one upstream fetch.

pub mod coalesce;
pub mod error;
pub mod estimator;
pub mod heap;
pub mod provider;
pub mod sampler;
pub mod tracker;
pub mod types;

#[cfg(test)]
mod tests;

pub use coalesce::{Coalescer, ResultCache};
pub use error::GasPriceError;
pub use estimator::{aggregate, Estimator, EstimatorConfig, FeeEstimates};
pub use heap::{EmptyQueue, MinQueue};
pub use provider::{ChainProvider, HeaderStream, ProviderError};
pub use sampler::{lowest_fees, MinimumSampler, Sampler};
pub use tracker::{HeadSubscription, HeadTracker, PollingTracker, SubscribedTracker};
pub use types::*;
