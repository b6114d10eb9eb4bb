//! Command-line and environment configuration.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::Duration;

use alloy_primitives::U256;
use clap::Parser;

use crate::error::AppError;
use crate::gasprice::{EstimatorConfig, Target};

#[derive(Debug, Clone, Parser)]
#[command(name = "gas-price-estimator", about = "Percentile gas price estimates from recent blocks")]
pub struct Config {
    /// JSON-RPC endpoint of the chain node.
    #[arg(long, env = "GAS_PROVIDER_URL")]
    pub provider: String,

    /// Address the HTTP server listens on.
    #[arg(long, env = "GAS_ADDR", default_value = "0.0.0.0:8080")]
    pub addr: SocketAddr,

    /// Lowest fees kept per block.
    #[arg(long, env = "GAS_SAMPLE_SIZE", default_value_t = 7)]
    pub sample_size: usize,

    /// Fees below this floor (wei) are ignored.
    #[arg(long, env = "GAS_MIN_FEE", default_value = "100000000")]
    pub min_fee: U256,

    /// Most recent blocks excluded from sampling.
    #[arg(long, env = "GAS_SKIP", default_value_t = 2)]
    pub skip: usize,

    /// Blocks sampled below the skipped ones.
    #[arg(long, env = "GAS_HISTORY", default_value_t = 5)]
    pub history: usize,

    /// Percentile buckets as `start:end` pairs.
    #[arg(
        long,
        env = "GAS_TARGETS",
        value_delimiter = ',',
        default_value = "0:0.3,0.3:0.6,0.6:1"
    )]
    pub targets: Vec<Target>,

    /// Response field names, one per target.
    #[arg(long, env = "GAS_NAMES", value_delimiter = ',', default_value = "low,medium,high")]
    pub names: Vec<String>,

    /// Blocks kept in the fee sample cache.
    #[arg(long, env = "GAS_CACHE_SIZE", default_value_t = 128)]
    pub cache_size: usize,

    #[arg(long, env = "GAS_POLL_INTERVAL_MS", default_value_t = 5_000)]
    pub poll_interval_ms: u64,

    /// Upper bound for a single provider call.
    #[arg(long, env = "GAS_FETCH_TIMEOUT_SECS", default_value_t = 60)]
    pub fetch_timeout_secs: u64,

    /// Upper bound for a full estimate walk.
    #[arg(long, env = "GAS_ESTIMATE_TIMEOUT_SECS", default_value_t = 300)]
    pub estimate_timeout_secs: u64,

    /// How long an HTTP request waits for an estimate.
    #[arg(long, env = "GAS_REQUEST_TIMEOUT_SECS", default_value_t = 10)]
    pub request_timeout_secs: u64,
}

impl Config {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.sample_size == 0 {
            return Err(AppError::Config("sample size must be positive".into()));
        }
        if self.history == 0 {
            return Err(AppError::Config("history must be positive".into()));
        }
        if self.cache_size == 0 {
            return Err(AppError::Config("cache size must be positive".into()));
        }
        if self.targets.is_empty() {
            return Err(AppError::Config("at least one target is required".into()));
        }
        for target in &self.targets {
            target.validate()?;
        }
        if self.targets.len() != self.names.len() {
            return Err(AppError::Config(format!(
                "{} targets but {} names",
                self.targets.len(),
                self.names.len()
            )));
        }
        Ok(())
    }

    pub fn cache_capacity(&self) -> Result<NonZeroUsize, AppError> {
        NonZeroUsize::new(self.cache_size)
            .ok_or_else(|| AppError::Config("cache size must be positive".into()))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn estimator(&self) -> EstimatorConfig {
        EstimatorConfig {
            skip: self.skip,
            history: self.history,
            targets: self.targets.clone(),
            timeout: Duration::from_secs(self.estimate_timeout_secs),
        }
    }
}
