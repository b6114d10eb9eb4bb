//! Chain-data provider implementations.

use std::sync::Arc;
use std::time::Duration;

use crate::gasprice::{ChainProvider, ProviderError};

pub mod rpc;
pub mod ws;

#[cfg(test)]
pub mod mock_provider;

pub use rpc::JsonRpcProvider;
pub use ws::WsProvider;

/// Picks the transport from the URL scheme: `ws://` and `wss://` get the
/// WebSocket provider, which can push new heads; anything else is HTTP.
pub async fn connect(url: &str, request_timeout: Duration) -> Result<Arc<dyn ChainProvider>, ProviderError> {
    if url.starts_with("ws://") || url.starts_with("wss://") {
        Ok(Arc::new(WsProvider::connect(url, request_timeout).await?))
    } else {
        Ok(Arc::new(JsonRpcProvider::new(url, request_timeout)?))
    }
}
