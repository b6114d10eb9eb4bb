//! Percentile fee estimation over the most recent blocks.
//!
//! For a head `H`, the estimator skips the `skip` most recent blocks
//! starting at `H`, then pools the fee samples of the next `history` blocks
//! and averages one sorted-pool bucket per [`Target`].
//!
//! Estimates are coalesced per head. Only an estimate whose head is still
//! the latest requested head is kept; an older one is handed to its own
//! waiters and then dropped.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{U256, U512};
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::coalesce::{Coalescer, ResultCache};
use super::error::GasPriceError;
use super::sampler::Sampler;
use super::tracker::HeadTracker;
use super::types::{ChainHead, Fee, Target};

/// What the serving layer needs from an estimator.
#[async_trait]
pub trait FeeEstimates: Send + Sync {
    /// One fee per configured target, in target order.
    async fn fee_levels(&self, cancel: &CancellationToken) -> Result<Vec<Fee>, GasPriceError>;
}

#[derive(Debug, Clone)]
pub struct EstimatorConfig {
    pub skip: usize,
    pub history: usize,
    pub targets: Vec<Target>,
    /// Upper bound for one full walk over `skip + history` blocks.
    pub timeout: Duration,
}

/// Latest requested head and, once computed, its estimate.
#[derive(Default)]
struct LatestEstimate {
    head: Option<ChainHead>,
    fees: Option<Vec<Fee>>,
}

impl ResultCache<ChainHead, Vec<Fee>> for LatestEstimate {
    fn lookup(&mut self, head: &ChainHead) -> Option<Vec<Fee>> {
        match self.head {
            Some(last) if last == *head => self.fees.clone(),
            _ => None,
        }
    }

    fn begin(&mut self, head: &ChainHead) {
        if self.head != Some(*head) {
            self.head = Some(*head);
            self.fees = None;
        }
    }

    fn store(&mut self, head: &ChainHead, fees: &Vec<Fee>) {
        if self.head == Some(*head) {
            self.fees = Some(fees.clone());
        } else {
            debug!(%head, "head moved during estimation, discarding estimate");
        }
    }
}

pub struct Estimator {
    tracker: Arc<dyn HeadTracker>,
    sampler: Arc<dyn Sampler>,
    skip: usize,
    history: usize,
    targets: Arc<[Target]>,
    estimates: Coalescer<ChainHead, Vec<Fee>, LatestEstimate>,
}

impl Estimator {
    /// Fails with `InvalidConfiguration` if any target is out of bounds.
    pub fn new(
        tracker: Arc<dyn HeadTracker>,
        sampler: Arc<dyn Sampler>,
        config: EstimatorConfig,
    ) -> Result<Self, GasPriceError> {
        for target in &config.targets {
            target.validate()?;
        }

        Ok(Self {
            tracker,
            sampler,
            skip: config.skip,
            history: config.history,
            targets: config.targets.into(),
            estimates: Coalescer::new(LatestEstimate::default(), config.timeout),
        })
    }

    /// Recomputes on every head change until `shutdown` is cancelled.
    pub fn listen(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let estimator = Arc::clone(self);
        let mut subscription = self.tracker.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = subscription.changed() => {
                        if !changed {
                            break;
                        }
                        match estimator.estimate(&shutdown).await {
                            Ok(fees) => debug!(?fees, "estimate refreshed"),
                            Err(GasPriceError::Cancelled) => break,
                            Err(error) => warn!(%error, "could not refresh estimate"),
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
            subscription.unsubscribe();
            info!("estimator stopped listening for head changes");
        })
    }

    /// Estimate for the tracker's current head.
    pub async fn estimate(&self, cancel: &CancellationToken) -> Result<Vec<Fee>, GasPriceError> {
        let head = self.tracker.current_head(cancel).await?;
        self.estimate_at(head, cancel).await
    }

    /// Estimate for `head`, computed at most once however many callers ask.
    pub async fn estimate_at(
        &self,
        head: ChainHead,
        cancel: &CancellationToken,
    ) -> Result<Vec<Fee>, GasPriceError> {
        let walk = Walk {
            sampler: Arc::clone(&self.sampler),
            skip: self.skip,
            history: self.history,
            targets: Arc::clone(&self.targets),
        };
        self.estimates
            .get_or_fetch(head, cancel, move || walk.run(head))
            .await
    }

    /// The published head/estimate pair, if any.
    pub fn last_estimate(&self) -> Option<(ChainHead, Vec<Fee>)> {
        self.estimates
            .with_cache(|latest| latest.head.zip(latest.fees.clone()))
    }
}

#[async_trait]
impl FeeEstimates for Estimator {
    async fn fee_levels(&self, cancel: &CancellationToken) -> Result<Vec<Fee>, GasPriceError> {
        self.estimate(cancel).await
    }
}

struct Walk {
    sampler: Arc<dyn Sampler>,
    skip: usize,
    history: usize,
    targets: Arc<[Target]>,
}

impl Walk {
    async fn run(self, head: ChainHead) -> Result<Vec<Fee>, GasPriceError> {
        // Bounded by the coalescer's timeout rather than by any caller.
        let uncancelled = CancellationToken::new();
        let mut tip = head;

        for _ in 0..self.skip {
            let sample = self.sampler.sample(tip, &uncancelled).await?;
            tip = sample.header.parent_hash;
        }

        let mut pool = Vec::new();
        for _ in 0..self.history {
            let sample = self.sampler.sample(tip, &uncancelled).await?;
            pool.extend(sample.fees);
            tip = sample.header.parent_hash;
        }

        aggregate(pool, &self.targets)
    }
}

/// Sorts `pool` and returns the truncating mean of each target's bucket.
pub fn aggregate(mut pool: Vec<Fee>, targets: &[Target]) -> Result<Vec<Fee>, GasPriceError> {
    if pool.is_empty() {
        return Err(GasPriceError::NoSample);
    }
    pool.sort_unstable();

    let estimates = targets
        .iter()
        .map(|target| {
            let (start, end) = target.bounds(pool.len());
            let bucket = &pool[start..end];
            // Summed in 512 bits; the mean of 256-bit fees always fits back.
            let sum = bucket.iter().fold(U512::ZERO, |acc, fee| acc + U512::from(*fee));
            U256::saturating_from(sum / U512::from(bucket.len()))
        })
        .collect();
    Ok(estimates)
}
