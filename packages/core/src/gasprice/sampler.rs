//! Per-block fee sampling.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::coalesce::Coalescer;
use super::error::GasPriceError;
use super::heap::MinQueue;
use super::provider::{ChainProvider, ProviderError};
use super::types::{Block, ChainHead, Fee, FeeSample};

#[async_trait]
pub trait Sampler: Send + Sync {
    async fn sample(
        &self,
        hash: ChainHead,
        cancel: &CancellationToken,
    ) -> Result<FeeSample, GasPriceError>;
}

/// Samples the `size` lowest qualifying fees of each block, caching one
/// sample per block hash.
pub struct MinimumSampler {
    provider: Arc<dyn ChainProvider>,
    size: usize,
    min_fee: Fee,
    samples: Coalescer<ChainHead, FeeSample, LruCache<ChainHead, FeeSample>>,
}

impl MinimumSampler {
    pub fn new(
        provider: Arc<dyn ChainProvider>,
        size: usize,
        min_fee: Fee,
        cache_size: NonZeroUsize,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            size,
            min_fee,
            samples: Coalescer::new(LruCache::new(cache_size), fetch_timeout),
        }
    }

    pub fn is_cached(&self, hash: &ChainHead) -> bool {
        self.samples.with_cache(|cache| cache.contains(hash))
    }
}

#[async_trait]
impl Sampler for MinimumSampler {
    async fn sample(
        &self,
        hash: ChainHead,
        cancel: &CancellationToken,
    ) -> Result<FeeSample, GasPriceError> {
        let provider = Arc::clone(&self.provider);
        let (size, min_fee) = (self.size, self.min_fee);
        self.samples
            .get_or_fetch(hash, cancel, move || fetch_sample(provider, hash, size, min_fee))
            .await
    }
}

async fn fetch_sample(
    provider: Arc<dyn ChainProvider>,
    hash: ChainHead,
    size: usize,
    min_fee: Fee,
) -> Result<FeeSample, GasPriceError> {
    let block = provider.block_by_hash(hash).await?;
    Ok(lowest_fees(block, size, min_fee)?)
}

/// Keeps the `size` lowest effective fees of `block` that are at least
/// `min_fee`, ignoring transactions sent by the block's own fee recipient.
pub fn lowest_fees(block: Block, size: usize, min_fee: Fee) -> Result<FeeSample, ProviderError> {
    let base_fee = block.header.base_fee();
    let miner = block.header.miner;
    let mut candidates = MinQueue::with_capacity(block.transactions.len());

    for tx in &block.transactions {
        let fee = tx.effective_fee(base_fee)?;
        if fee < min_fee {
            continue;
        }
        if tx.from == miner {
            trace!(tx = %tx.hash, "skipping fee recipient's own transaction");
            continue;
        }
        candidates.push(fee);
    }

    Ok(FeeSample {
        header: block.header,
        fees: candidates.take_lowest(size),
    })
}
