//! End-to-end scenarios over the mock provider: tracker, sampler and
//! estimator wired together the way the binary wires them.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::U256;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use super::*;
use crate::services::mock_provider::{block, chain, legacy_tx, MockChainProvider};

fn fees(values: &[u64]) -> Vec<Fee> {
    values.iter().map(|v| U256::from(*v)).collect()
}

struct Stack {
    mock: Arc<MockChainProvider>,
    sampler: Arc<MinimumSampler>,
    estimator: Arc<Estimator>,
    shutdown: CancellationToken,
}

fn stack(mock: MockChainProvider, skip: usize, history: usize, targets: &[(f64, f64)]) -> Stack {
    let mock = Arc::new(mock);
    let shutdown = CancellationToken::new();
    let tracker = PollingTracker::spawn(
        mock.clone(),
        Duration::from_millis(100),
        Duration::from_secs(1),
        shutdown.clone(),
    );
    let sampler = Arc::new(MinimumSampler::new(
        mock.clone(),
        3,
        U256::from(10),
        NonZeroUsize::new(16).unwrap(),
        Duration::from_secs(1),
    ));
    let estimator = Arc::new(
        Estimator::new(
            tracker,
            sampler.clone(),
            EstimatorConfig {
                skip,
                history,
                targets: targets.iter().map(|&(s, e)| Target::new(s, e)).collect(),
                timeout: Duration::from_secs(10),
            },
        )
        .unwrap(),
    );
    Stack {
        mock,
        sampler,
        estimator,
        shutdown,
    }
}

async fn wait_for_estimate(estimator: &Estimator, head: ChainHead) -> Vec<Fee> {
    timeout(Duration::from_secs(5), async {
        loop {
            if let Some((last, fees)) = estimator.last_estimate() {
                if last == head {
                    return fees;
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("estimate for head")
}

#[tokio::test(start_paused = true)]
async fn estimates_follow_the_chain_head() {
    // Fees below 10 are under the floor; each block keeps its 3 lowest.
    let blocks = chain(&[&[5, 40, 30, 20, 50], &[10, 60, 70, 80], &[35, 25, 45, 15]]);
    let stack = stack(
        MockChainProvider::new().with_chain(blocks[..2].to_vec()),
        0,
        2,
        &[(0.0, 0.5), (0.5, 1.0)],
    );
    let listener = stack.estimator.listen(stack.shutdown.clone());

    // Head is block 2: pool [20,30,40] + [10,60,70] -> [10,20,30,40,60,70].
    let first = wait_for_estimate(&stack.estimator, blocks[1].header.hash).await;
    assert_eq!(first, fees(&[20, 56]));

    // Block 3 arrives: pool [15,25,35] + [10,60,70] -> [10,15,25,35,60,70].
    stack.mock.add_block(blocks[2].clone());
    stack.mock.set_head(blocks[2].header.hash);
    let second = wait_for_estimate(&stack.estimator, blocks[2].header.hash).await;
    assert_eq!(second, fees(&[16, 55]));

    stack.shutdown.cancel();
    listener.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn new_head_reuses_cached_samples() {
    let blocks = chain(&[&[20, 30], &[40, 50], &[60, 70]]);
    let mock = MockChainProvider::new().with_chain(blocks[..2].to_vec());
    let stack = stack(mock, 0, 2, &[(0.0, 1.0)]);
    let cancel = CancellationToken::new();

    let first = stack.estimator.estimate(&cancel).await.unwrap();
    assert_eq!(first, fees(&[35]));
    assert_eq!(stack.mock.block_calls(), 2);

    // Extend the chain; only the new block needs fetching.
    stack.mock.add_block(blocks[2].clone());
    stack.mock.set_head(blocks[2].header.hash);
    let second = stack
        .estimator
        .estimate_at(blocks[2].header.hash, &cancel)
        .await
        .unwrap();
    assert_eq!(second, fees(&[55]));
    assert_eq!(stack.mock.block_calls(), 3);
    assert!(stack.sampler.is_cached(&blocks[0].header.hash));

    stack.shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn skip_excludes_recent_blocks_from_the_pool() {
    let blocks = chain(&[&[20], &[40], &[1_000], &[2_000]]);
    let stack = stack(
        MockChainProvider::new().with_chain(blocks.clone()),
        2,
        2,
        &[(0.0, 1.0)],
    );

    let estimate = stack
        .estimator
        .estimate(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(estimate, fees(&[30]));

    stack.shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn fee_recipient_transactions_never_reach_the_pool() {
    let mut head = block(1, ChainHead::ZERO, &[100]);
    head.transactions
        .push(legacy_tx(head.header.miner, 20));
    let stack = stack(MockChainProvider::new().with_chain(vec![head]), 0, 1, &[(0.0, 1.0)]);

    let estimate = stack
        .estimator
        .estimate(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(estimate, fees(&[100]));

    stack.shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn upstream_failure_reaches_caller_and_then_heals() {
    let blocks = chain(&[&[20], &[40]]);
    let stack = stack(
        MockChainProvider::new().with_chain(blocks.clone()),
        0,
        2,
        &[(0.0, 1.0)],
    );
    let cancel = CancellationToken::new();
    let head = blocks[1].header.hash;

    stack.mock.fail_next_blocks(1);
    assert!(matches!(
        stack.estimator.estimate_at(head, &cancel).await,
        Err(GasPriceError::Upstream(ProviderError::NetworkError { .. }))
    ));
    assert_eq!(stack.estimator.last_estimate(), None);

    let estimate = stack.estimator.estimate_at(head, &cancel).await.unwrap();
    assert_eq!(estimate, fees(&[30]));

    stack.shutdown.cancel();
}
