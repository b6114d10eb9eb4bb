//! Chain-data provider abstraction.
//!
//! The tracker and sampler only ever talk to the chain through
//! [`ChainProvider`], so the JSON-RPC client and the test mock are
//! interchangeable.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use super::types::{Block, ChainHead, Header};

/// Stream of pushed headers. Ends, or yields an error, when the underlying
/// subscription breaks.
pub type HeaderStream = BoxStream<'static, Result<Header, ProviderError>>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("network error: {message}")]
    NetworkError { message: String },

    #[error("rpc error {code}: {message}")]
    RpcError { code: i64, message: String },

    #[error("malformed response: {message}")]
    FormatError { message: String },

    #[error("block {0} not found")]
    BlockNotFound(ChainHead),

    #[error("provider does not support push subscriptions")]
    SubscriptionsUnsupported,

    #[error("subscription closed")]
    SubscriptionClosed,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait ChainProvider: Send + Sync {
    /// Header of the current chain head.
    async fn latest_header(&self) -> Result<Header, ProviderError>;

    /// Full block, transactions included.
    async fn block_by_hash(&self, hash: ChainHead) -> Result<Block, ProviderError>;

    /// Push stream of new heads. Providers without push support keep the
    /// default, which makes callers fall back to polling.
    async fn subscribe_new_heads(&self) -> Result<HeaderStream, ProviderError> {
        Err(ProviderError::SubscriptionsUnsupported)
    }

    fn provider_name(&self) -> &str;
}
