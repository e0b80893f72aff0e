use super::error::ProviderError;
use crate::chain::{Address, Block};
use async_trait::async_trait;

/// One node endpoint serving one chain
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn endpoint(&self) -> &str;

    /// Latest block height known to the node
    async fn head_height(&self) -> Result<u64, ProviderError>;

    /// Block header at `height`, `None` if the node does not have it yet
    async fn block_by_height(&self, height: u64) -> Result<Option<Block>, ProviderError>;

    /// Logs emitted in block `block_hash` by any of `addresses`
    async fn logs_in_block(
        &self,
        block_hash: &str,
        addresses: &[Address],
    ) -> Result<Vec<LogEntry>, ProviderError>;

    /// Full transactions of block `block_hash`
    async fn transactions_in_block(&self, block_hash: &str) -> Result<Vec<TxEntry>, ProviderError>;

    /// `true` when the node reports it is not syncing
    async fn is_synced(&self) -> Result<bool, ProviderError>;

    async fn fee_sample(&self) -> Result<FeeSample, ProviderError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub tx_hash: String,
    pub log_index: u64,
    pub block_hash: String,
    /// Set by nodes for logs dropped by a reorg
    pub removed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxEntry {
    pub hash: String,
    pub index: u64,
    pub from: Option<String>,
    pub to: Option<String>,
    /// Hex quantity in wei
    pub value: String,
}

/// Fee data as reported by a node. Pre-London chains only have `gas_price`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeeSample {
    pub base_fee: Option<u128>,
    pub max_priority_fee: Option<u128>,
    pub gas_price: Option<u128>,
}
