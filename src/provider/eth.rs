//! Ethereum JSON-RPC client
//!
//! Speaks plain JSON-RPC 2.0 over HTTP to Geth, Erigon, Anvil or any hosted
//! provider. Optional bearer token for authenticated endpoints.

use super::client::{ChainClient, FeeSample, LogEntry, TxEntry};
use super::error::ProviderError;
use crate::chain::{Address, Block, ChainId, parse_hex_u128, parse_hex_u64};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

const HTTP_TIMEOUT_SECS: u64 = 30;

pub struct EthRpcClient {
    chain: ChainId,
    url: String,
    auth_token: Option<String>,
    client: reqwest::Client,
    next_id: AtomicU64,
}

/// JSON-RPC request structure
#[derive(Serialize)]
struct JsonRpcRequest<T> {
    jsonrpc: &'static str,
    method: &'static str,
    params: T,
    id: u64,
}

/// JSON-RPC response structure
#[derive(Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// Block header (transactions as hashes)
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RpcBlockHeader {
    number: String,
    hash: String,
    parent_hash: String,
    timestamp: String,
    #[serde(default)]
    base_fee_per_gas: Option<String>,
}

/// Block with full transaction objects
#[derive(Deserialize, Debug)]
struct RpcBlockWithTxs {
    transactions: Vec<RpcTransaction>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RpcTransaction {
    hash: String,
    #[serde(default)]
    transaction_index: Option<String>,
    from: Option<String>,
    to: Option<String>,
    value: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RpcLog {
    address: String,
    topics: Vec<String>,
    data: String,
    transaction_hash: Option<String>,
    log_index: Option<String>,
    block_hash: Option<String>,
    #[serde(default)]
    removed: bool,
}

/// `eth_syncing` returns `false` or a progress object
#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum SyncingStatus {
    NotSyncing(bool),
    Syncing(serde_json::Value),
}

impl EthRpcClient {
    pub fn new(chain: ChainId, url: &str, auth_token: Option<String>) -> Result<Self, ProviderError> {
        info!(chain = %chain, url, "Initializing JSON-RPC client");

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|e| {
                ProviderError::RpcConnection(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            chain,
            url: url.to_string(),
            auth_token,
            client,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn chain(&self) -> ChainId {
        self.chain
    }

    /// Make a JSON-RPC call. `Ok(None)` when the node returns a null result.
    async fn rpc_call<T, R>(&self, method: &'static str, params: T) -> Result<Option<R>, ProviderError>
    where
        T: Serialize,
        R: for<'de> Deserialize<'de>,
    {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };

        let mut builder = self.client.post(&self.url).json(&request);
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ProviderError::RpcConnection(format!("HTTP request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(ProviderError::RpcConnection(format!(
                "HTTP status {}",
                response.status()
            )));
        }

        let rpc_response: JsonRpcResponse<R> = response.json().await.map_err(|e| {
            ProviderError::InvalidResponse(format!("Failed to parse response: {}", e))
        })?;

        if let Some(error) = rpc_response.error {
            return Err(ProviderError::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        debug!(method, "RPC call ok");
        Ok(rpc_response.result)
    }

    async fn rpc_required<T, R>(&self, method: &'static str, params: T) -> Result<R, ProviderError>
    where
        T: Serialize,
        R: for<'de> Deserialize<'de>,
    {
        self.rpc_call(method, params)
            .await?
            .ok_or_else(|| ProviderError::InvalidResponse(format!("No result for {}", method)))
    }

    async fn latest_header(&self) -> Result<Option<RpcBlockHeader>, ProviderError> {
        self.rpc_call("eth_getBlockByNumber", ("latest", false)).await
    }
}

#[async_trait]
impl ChainClient for EthRpcClient {
    fn endpoint(&self) -> &str {
        &self.url
    }

    async fn head_height(&self) -> Result<u64, ProviderError> {
        let result: String = self.rpc_required("eth_blockNumber", ()).await?;
        Ok(parse_hex_u64(&result)?)
    }

    async fn block_by_height(&self, height: u64) -> Result<Option<Block>, ProviderError> {
        let height_hex = format!("0x{:x}", height);
        let header: Option<RpcBlockHeader> = self
            .rpc_call("eth_getBlockByNumber", (height_hex, false))
            .await?;

        let Some(header) = header else {
            return Ok(None);
        };
        let number = parse_hex_u64(&header.number)?;
        if number != height {
            return Err(ProviderError::InvalidResponse(format!(
                "Asked for block {} but node returned {}",
                height, number
            )));
        }
        let timestamp = parse_hex_u64(&header.timestamp)? as i64;
        Ok(Some(Block::new(
            self.chain,
            number,
            &header.hash,
            &header.parent_hash,
            timestamp,
        )))
    }

    async fn logs_in_block(
        &self,
        block_hash: &str,
        addresses: &[Address],
    ) -> Result<Vec<LogEntry>, ProviderError> {
        if addresses.is_empty() {
            return Ok(Vec::new());
        }
        let filter = json!({
            "blockHash": block_hash,
            "address": addresses.iter().map(|a| a.as_str()).collect::<Vec<_>>(),
        });
        let logs: Vec<RpcLog> = self.rpc_required("eth_getLogs", [filter]).await?;

        logs.into_iter()
            .map(|log| {
                let log_index = log
                    .log_index
                    .as_deref()
                    .ok_or_else(|| ProviderError::InvalidResponse("log without index".into()))
                    .and_then(|idx| Ok(parse_hex_u64(idx)?))?;
                Ok(LogEntry {
                    address: log.address.to_lowercase(),
                    topics: log.topics.iter().map(|t| t.to_lowercase()).collect(),
                    data: log.data,
                    tx_hash: log
                        .transaction_hash
                        .map(|h| h.to_lowercase())
                        .ok_or_else(|| ProviderError::InvalidResponse("log without tx".into()))?,
                    log_index,
                    block_hash: log
                        .block_hash
                        .map(|h| h.to_lowercase())
                        .unwrap_or_else(|| block_hash.to_lowercase()),
                    removed: log.removed,
                })
            })
            .collect()
    }

    async fn transactions_in_block(&self, block_hash: &str) -> Result<Vec<TxEntry>, ProviderError> {
        let block: RpcBlockWithTxs = self
            .rpc_required("eth_getBlockByHash", (block_hash, true))
            .await?;

        block
            .transactions
            .into_iter()
            .map(|tx| {
                let index = match tx.transaction_index.as_deref() {
                    Some(idx) => parse_hex_u64(idx)?,
                    None => {
                        return Err(ProviderError::InvalidResponse(format!(
                            "tx {} without index",
                            tx.hash
                        )));
                    }
                };
                Ok(TxEntry {
                    hash: tx.hash.to_lowercase(),
                    index,
                    from: tx.from.map(|a| a.to_lowercase()),
                    to: tx.to.map(|a| a.to_lowercase()),
                    value: tx.value,
                })
            })
            .collect()
    }

    async fn is_synced(&self) -> Result<bool, ProviderError> {
        let syncing: SyncingStatus = self.rpc_required("eth_syncing", ()).await?;
        Ok(matches!(syncing, SyncingStatus::NotSyncing(false)))
    }

    async fn fee_sample(&self) -> Result<FeeSample, ProviderError> {
        let base_fee = match self.latest_header().await? {
            Some(header) => header
                .base_fee_per_gas
                .as_deref()
                .map(parse_hex_u128)
                .transpose()?,
            None => None,
        };

        // Pre-London nodes reject eth_maxPriorityFeePerGas
        let max_priority_fee = if base_fee.is_some() {
            let tip: Option<String> = self.rpc_call("eth_maxPriorityFeePerGas", ()).await?;
            tip.as_deref().map(parse_hex_u128).transpose()?
        } else {
            None
        };

        let gas_price: Option<String> = self.rpc_call("eth_gasPrice", ()).await?;
        let gas_price = gas_price.as_deref().map(parse_hex_u128).transpose()?;

        Ok(FeeSample {
            base_fee,
            max_priority_fee,
            gas_price,
        })
    }
}
