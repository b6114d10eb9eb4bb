//! Mock chain-data provider for testing
//!
//! Implements `ChainProvider` over an in-memory chain so tests can exercise
//! the trackers, sampler and estimator without a live node. Supports
//! injected latency and failures, counts every call, and can push headers
//! through mock subscriptions.
//!
//! Gated behind `#[cfg(test)]`; never compiled into production builds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use parking_lot::Mutex;

use crate::gasprice::{
    provider::{ChainProvider, HeaderStream, ProviderError},
    types::{Block, ChainHead, Header, Transaction, TxFees},
};

/// Fee recipient of every block built by [`block`].
pub const MINER: Address = Address::repeat_byte(0xaa);

/// Sender of every transaction built by [`block`].
pub const SENDER: Address = Address::repeat_byte(0x11);

/// Deterministic block hash for index `n`; `hash(0)` is the zero hash.
pub fn hash(n: u64) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[24..].copy_from_slice(&n.to_be_bytes());
    B256::from(bytes)
}

pub fn legacy_tx(from: Address, gas_price: u64) -> Transaction {
    Transaction {
        hash: B256::repeat_byte(0x77),
        from,
        fees: TxFees::Legacy {
            gas_price: U256::from(gas_price),
        },
    }
}

/// Block `number` with zero base fee and one legacy transaction per fee.
pub fn block(number: u64, parent_hash: B256, fees: &[u64]) -> Block {
    Block {
        header: Header {
            hash: hash(number),
            parent_hash,
            number,
            base_fee_per_gas: Some(U256::ZERO),
            miner: MINER,
        },
        transactions: fees.iter().map(|fee| legacy_tx(SENDER, *fee)).collect(),
    }
}

/// Linked chain, oldest first; block `i` has number and hash index `i + 1`.
pub fn chain(fee_lists: &[&[u64]]) -> Vec<Block> {
    fee_lists
        .iter()
        .enumerate()
        .map(|(i, fees)| block(i as u64 + 1, hash(i as u64), fees))
        .collect()
}

type HeadSender = mpsc::UnboundedSender<Result<Header, ProviderError>>;

#[derive(Default)]
struct MockState {
    blocks: HashMap<ChainHead, Block>,
    head: Option<ChainHead>,
    error: Option<ProviderError>,
    header_failures: usize,
    block_failures: usize,
    streams: Vec<HeadSender>,
}

/// A configurable mock implementation of `ChainProvider`.
///
/// # Example
/// ```rust,ignore
/// let mock = MockChainProvider::new()
///     .with_chain(chain(&[&[10, 20], &[30]]))
///     .with_latency(Duration::from_millis(50));
/// ```
pub struct MockChainProvider {
    state: Mutex<MockState>,
    latency: Duration,
    supports_subscriptions: bool,
    header_calls: Arc<AtomicUsize>,
    block_calls: Arc<AtomicUsize>,
    subscribe_calls: Arc<AtomicUsize>,
}

impl MockChainProvider {
    /// Create a new mock with an empty chain, no latency and no push support.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            latency: Duration::ZERO,
            supports_subscriptions: false,
            header_calls: Arc::new(AtomicUsize::new(0)),
            block_calls: Arc::new(AtomicUsize::new(0)),
            subscribe_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Add `blocks` and make the last one the head.
    pub fn with_chain(self, blocks: Vec<Block>) -> Self {
        {
            let mut state = self.state.lock();
            state.head = blocks.last().map(|b| b.header.hash).or(state.head);
            for block in blocks {
                state.blocks.insert(block.header.hash, block);
            }
        }
        self
    }

    /// Delay every fetch by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Accept `subscribe_new_heads` calls.
    pub fn with_subscriptions(mut self) -> Self {
        self.supports_subscriptions = true;
        self
    }

    /// Fail every header and block fetch with `error`.
    pub fn with_error(self, error: ProviderError) -> Self {
        self.state.lock().error = Some(error);
        self
    }

    /// Fail the next `n` header fetches with a network error.
    pub fn failing_times(self, n: usize) -> Self {
        self.state.lock().header_failures = n;
        self
    }

    /// Fail the next `n` block fetches with a network error.
    pub fn fail_next_blocks(&self, n: usize) {
        self.state.lock().block_failures = n;
    }

    pub fn add_block(&self, block: Block) {
        self.state.lock().blocks.insert(block.header.hash, block);
    }

    pub fn set_head(&self, head: ChainHead) {
        self.state.lock().head = Some(head);
    }

    /// Send `header` to every open subscription and make it the head.
    pub fn push_head(&self, header: Header) {
        let mut state = self.state.lock();
        state.head = Some(header.hash);
        state
            .streams
            .retain(|stream| stream.unbounded_send(Ok(header.clone())).is_ok());
    }

    /// End every open subscription, optionally with a final error.
    pub fn break_subscriptions(&self, error: Option<ProviderError>) {
        let streams = std::mem::take(&mut self.state.lock().streams);
        if let Some(error) = error {
            for stream in &streams {
                let _ = stream.unbounded_send(Err(error.clone()));
            }
        }
    }

    pub fn header_calls(&self) -> usize {
        self.header_calls.load(Ordering::SeqCst)
    }

    pub fn block_calls(&self) -> usize {
        self.block_calls.load(Ordering::SeqCst)
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn injected_failure(
        &self,
        pending: impl FnOnce(&mut MockState) -> &mut usize,
    ) -> Option<ProviderError> {
        let mut state = self.state.lock();
        let left = pending(&mut *state);
        if *left > 0 {
            *left -= 1;
            return Some(ProviderError::NetworkError {
                message: "injected failure".into(),
            });
        }
        state.error.clone()
    }
}

impl Default for MockChainProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChainProvider for MockChainProvider {
    async fn latest_header(&self) -> Result<Header, ProviderError> {
        self.header_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if let Some(error) = self.injected_failure(|state| &mut state.header_failures) {
            return Err(error);
        }

        let state = self.state.lock();
        state
            .head
            .and_then(|head| state.blocks.get(&head))
            .map(|block| block.header.clone())
            .ok_or_else(|| ProviderError::FormatError {
                message: "mock has no head".into(),
            })
    }

    async fn block_by_hash(&self, hash: ChainHead) -> Result<Block, ProviderError> {
        self.block_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if let Some(error) = self.injected_failure(|state| &mut state.block_failures) {
            return Err(error);
        }

        self.state
            .lock()
            .blocks
            .get(&hash)
            .cloned()
            .ok_or(ProviderError::BlockNotFound(hash))
    }

    async fn subscribe_new_heads(&self) -> Result<HeaderStream, ProviderError> {
        if !self.supports_subscriptions {
            self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
            return Err(ProviderError::SubscriptionsUnsupported);
        }

        let (sender, receiver) = mpsc::unbounded();
        self.state.lock().streams.push(sender);
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        Ok(receiver.boxed())
    }

    fn provider_name(&self) -> &str {
        "MockChain"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_links_parents() {
        let blocks = chain(&[&[1], &[2], &[3]]);
        assert_eq!(blocks[0].header.parent_hash, B256::ZERO);
        assert_eq!(blocks[1].header.parent_hash, blocks[0].header.hash);
        assert_eq!(blocks[2].header.parent_hash, blocks[1].header.hash);
        assert_eq!(blocks[2].header.number, 3);
    }

    #[tokio::test]
    async fn serves_head_and_blocks() {
        let blocks = chain(&[&[10], &[20, 30]]);
        let mock = MockChainProvider::new().with_chain(blocks.clone());

        let head = mock.latest_header().await.unwrap();
        assert_eq!(head, blocks[1].header);

        let block = mock.block_by_hash(blocks[0].header.hash).await.unwrap();
        assert_eq!(block, blocks[0]);
        assert_eq!(mock.header_calls(), 1);
        assert_eq!(mock.block_calls(), 1);
    }

    #[tokio::test]
    async fn unknown_block_is_not_found() {
        let mock = MockChainProvider::new();
        let result = mock.block_by_hash(hash(5)).await;
        assert_eq!(result, Err(ProviderError::BlockNotFound(hash(5))));
    }

    #[tokio::test]
    async fn injected_failures_run_out() {
        let mock = MockChainProvider::new()
            .with_chain(chain(&[&[10]]))
            .failing_times(2);

        assert!(mock.latest_header().await.is_err());
        assert!(mock.latest_header().await.is_err());
        assert!(mock.latest_header().await.is_ok());
        assert_eq!(mock.header_calls(), 3);

        mock.fail_next_blocks(1);
        assert!(mock.block_by_hash(hash(1)).await.is_err());
        assert!(mock.block_by_hash(hash(1)).await.is_ok());
    }

    #[tokio::test]
    async fn subscriptions_are_unsupported_by_default() {
        let mock = MockChainProvider::new();
        assert!(matches!(
            mock.subscribe_new_heads().await,
            Err(ProviderError::SubscriptionsUnsupported)
        ));
    }

    #[tokio::test]
    async fn pushed_headers_reach_subscribers() {
        let blocks = chain(&[&[10], &[20]]);
        let mock = MockChainProvider::new()
            .with_chain(blocks.clone())
            .with_subscriptions();
        let mut stream = mock.subscribe_new_heads().await.unwrap();

        mock.push_head(blocks[0].header.clone());
        assert_eq!(stream.next().await, Some(Ok(blocks[0].header.clone())));

        mock.break_subscriptions(Some(ProviderError::SubscriptionClosed));
        assert_eq!(stream.next().await, Some(Err(ProviderError::SubscriptionClosed)));
        assert_eq!(stream.next().await, None);
    }

    #[test]
    fn provider_name_is_mock_chain() {
        assert_eq!(MockChainProvider::new().provider_name(), "MockChain");
    }
}
