use thiserror::Error;

use super::provider::ProviderError;

/// Errors produced by the tracker, sampler and estimator.
///
/// Cloneable so a single in-flight failure can be delivered to every waiter.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GasPriceError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("no sample to estimate")]
    NoSample,

    #[error("upstream fetch failed: {0}")]
    Upstream(#[from] ProviderError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("fetch task failed: {0}")]
    FetchFailed(String),
}
