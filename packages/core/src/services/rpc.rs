//! JSON-RPC chain-data provider.
//!
//! Talks to an Ethereum-compatible node over HTTP. Plain HTTP cannot carry
//! push notifications, so this provider keeps the default
//! `subscribe_new_heads` and startup falls back to polling. The wire types
//! and response parsing here are shared with the WebSocket transport.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy_primitives::{Address, B256, U256, U64};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::gasprice::{
    provider::{ChainProvider, ProviderError},
    types::{Block, ChainHead, Header, Transaction, TxFees},
};

const JSON_RPC_VERSION: &str = "2.0";

pub struct JsonRpcProvider {
    http: Client,
    url: String,
    next_id: AtomicU64,
}

impl JsonRpcProvider {
    /// Every request is bounded by `request_timeout`.
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ProviderError::NetworkError {
                message: format!("could not build HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            url: url.into(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<R: DeserializeOwned>(&self, method: &str, params: Value) -> Result<R, ProviderError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = request_body(id, method, params);
        debug!(method, id, "json-rpc request");

        let response = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(network_error)?;
        let body: Value = response.json().await.map_err(network_error)?;
        parse_response(body)
    }
}

pub(super) fn request_body(id: u64, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": JSON_RPC_VERSION,
        "id": id,
        "method": method,
        "params": params,
    })
}

fn network_error(error: reqwest::Error) -> ProviderError {
    ProviderError::NetworkError {
        message: error.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

pub(super) fn parse_response<R: DeserializeOwned>(mut body: Value) -> Result<R, ProviderError> {
    if let Some(error) = body.get_mut("error").filter(|e| !e.is_null()) {
        let error: RpcErrorObject =
            serde_json::from_value(error.take()).map_err(|e| ProviderError::FormatError {
                message: format!("bad error object: {e}"),
            })?;
        return Err(ProviderError::RpcError {
            code: error.code,
            message: error.message,
        });
    }

    let result = body
        .get_mut("result")
        .ok_or_else(|| ProviderError::FormatError {
            message: "response has neither result nor error".into(),
        })?
        .take();
    serde_json::from_value(result).map_err(|e| ProviderError::FormatError {
        message: e.to_string(),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct RpcHeader {
    hash: B256,
    parent_hash: B256,
    number: U64,
    #[serde(default)]
    base_fee_per_gas: Option<U256>,
    miner: Address,
}

impl From<RpcHeader> for Header {
    fn from(header: RpcHeader) -> Self {
        Header {
            hash: header.hash,
            parent_hash: header.parent_hash,
            number: header.number.to::<u64>(),
            base_fee_per_gas: header.base_fee_per_gas,
            miner: header.miner,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcTransaction {
    hash: B256,
    from: Address,
    #[serde(default)]
    gas_price: Option<U256>,
    #[serde(default)]
    max_fee_per_gas: Option<U256>,
    #[serde(default)]
    max_priority_fee_per_gas: Option<U256>,
}

impl TryFrom<RpcTransaction> for Transaction {
    type Error = ProviderError;

    fn try_from(tx: RpcTransaction) -> Result<Self, Self::Error> {
        let fees = match (tx.max_fee_per_gas, tx.max_priority_fee_per_gas, tx.gas_price) {
            (Some(max_fee_per_gas), Some(max_priority_fee_per_gas), _) => TxFees::Dynamic {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            },
            (_, _, Some(gas_price)) => TxFees::Legacy { gas_price },
            _ => {
                return Err(ProviderError::FormatError {
                    message: format!("transaction {} has no fee fields", tx.hash),
                })
            }
        };
        Ok(Transaction {
            hash: tx.hash,
            from: tx.from,
            fees,
        })
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct RpcBlock {
    #[serde(flatten)]
    header: RpcHeader,
    #[serde(default)]
    transactions: Vec<RpcTransaction>,
}

impl TryFrom<RpcBlock> for Block {
    type Error = ProviderError;

    fn try_from(block: RpcBlock) -> Result<Self, Self::Error> {
        Ok(Block {
            header: block.header.into(),
            transactions: block
                .transactions
                .into_iter()
                .map(Transaction::try_from)
                .collect::<Result<_, _>>()?,
        })
    }
}

pub(super) fn latest_header_params() -> Value {
    json!(["latest", false])
}

pub(super) fn block_params(hash: ChainHead) -> Value {
    json!([hash, true])
}

pub(super) fn into_latest_header(header: Option<RpcHeader>) -> Result<Header, ProviderError> {
    header
        .map(Header::from)
        .ok_or_else(|| ProviderError::FormatError {
            message: "node returned no latest block".into(),
        })
}

pub(super) fn into_block(hash: ChainHead, block: Option<RpcBlock>) -> Result<Block, ProviderError> {
    block.ok_or(ProviderError::BlockNotFound(hash))?.try_into()
}

#[async_trait]
impl ChainProvider for JsonRpcProvider {
    #[instrument(skip(self))]
    async fn latest_header(&self) -> Result<Header, ProviderError> {
        let header = self
            .call("eth_getBlockByNumber", latest_header_params())
            .await?;
        into_latest_header(header)
    }

    #[instrument(skip(self))]
    async fn block_by_hash(&self, hash: ChainHead) -> Result<Block, ProviderError> {
        let block = self.call("eth_getBlockByHash", block_params(hash)).await?;
        into_block(hash, block)
    }

    fn provider_name(&self) -> &str {
        "JsonRpc"
    }
}
