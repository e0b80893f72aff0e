//! Scripted in-memory chain for tests and local runs
//!
//! Blocks get deterministic hashes derived from (height, fork tag), so a test
//! can build a canonical chain, attach logs, then fork it from any height.

use super::client::{ChainClient, FeeSample, LogEntry, TxEntry};
use super::error::ProviderError;
use crate::chain::{Address, Block, ChainId, normalize_hex};
use crate::extractor::ERC20_TRANSFER_TOPIC;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Default)]
struct MockState {
    blocks: BTreeMap<u64, Block>,
    logs: HashMap<String, Vec<LogEntry>>,
    txs: HashMap<String, Vec<TxEntry>>,
    reported_head: Option<u64>,
    offline: bool,
    synced: bool,
    fee: FeeSample,
    latency: Option<Duration>,
}

pub struct MockChainClient {
    chain: ChainId,
    endpoint: String,
    state: Mutex<MockState>,
    calls: AtomicU64,
}

/// Deterministic block hash for (height, fork tag)
pub fn mock_block_hash(height: u64, fork: u64) -> String {
    format!("0x{:048x}{:08x}{:08x}", 0xb10c_u64, fork, height)
}

impl MockChainClient {
    pub fn new(chain: ChainId, endpoint: &str) -> Self {
        Self {
            chain,
            endpoint: endpoint.to_string(),
            state: Mutex::new(MockState {
                synced: true,
                ..Default::default()
            }),
            calls: AtomicU64::new(0),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }

    /// Append `count` blocks starting at `from` on fork 0
    pub fn push_canonical_chain(&self, from: u64, count: u64) {
        self.extend_fork(from, count, 0);
    }

    /// Extend the current tip by `count` blocks on the tip's fork tag
    pub fn extend(&self, count: u64) {
        let (next, fork) = self.with_state(|s| match s.blocks.last_key_value() {
            Some((h, b)) => (h + 1, fork_of(&b.hash)),
            None => (0, 0),
        });
        self.extend_fork(next, count, fork);
    }

    /// Replace every block from `height` up to the current tip with blocks of
    /// fork `fork`, dropping logs and transactions of the replaced blocks.
    pub fn reorg_from(&self, height: u64, fork: u64) {
        let tip = self.with_state(|s| {
            let tip = s.blocks.last_key_value().map(|(h, _)| *h);
            let replaced: Vec<Block> = s.blocks.range(height..).map(|(_, b)| b.clone()).collect();
            for block in replaced {
                s.logs.remove(&block.hash);
                s.txs.remove(&block.hash);
                s.blocks.remove(&block.height);
            }
            tip
        });
        if let Some(tip) = tip
            && tip >= height
        {
            self.extend_fork(height, tip - height + 1, fork);
        }
    }

    fn extend_fork(&self, from: u64, count: u64, fork: u64) {
        self.with_state(|s| {
            for height in from..from + count {
                let parent_hash = match height.checked_sub(1).and_then(|p| s.blocks.get(&p)) {
                    Some(parent) => parent.hash.clone(),
                    None => mock_block_hash(height.saturating_sub(1), 0),
                };
                let block = Block::new(
                    self.chain,
                    height,
                    &mock_block_hash(height, fork),
                    &parent_hash,
                    1_700_000_000 + height as i64 * 12,
                );
                s.blocks.insert(height, block);
            }
        });
    }

    pub fn block_at(&self, height: u64) -> Option<Block> {
        self.with_state(|s| s.blocks.get(&height).cloned())
    }

    pub fn tip(&self) -> Option<u64> {
        self.with_state(|s| s.blocks.last_key_value().map(|(h, _)| *h))
    }

    /// Attach a log to the block currently at `height`
    pub fn add_log(&self, height: u64, mut log: LogEntry) {
        self.with_state(|s| {
            if let Some(block) = s.blocks.get(&height) {
                log.block_hash = block.hash.clone();
                s.logs.entry(block.hash.clone()).or_default().push(log);
            }
        });
    }

    pub fn add_tx(&self, height: u64, tx: TxEntry) {
        self.with_state(|s| {
            if let Some(block) = s.blocks.get(&height) {
                s.txs.entry(block.hash.clone()).or_default().push(tx);
            }
        });
    }

    /// Override the reported head; `None` reports the tip
    pub fn set_reported_head(&self, head: Option<u64>) {
        self.with_state(|s| s.reported_head = head);
    }

    pub fn set_offline(&self, offline: bool) {
        self.with_state(|s| s.offline = offline);
    }

    pub fn set_synced(&self, synced: bool) {
        self.with_state(|s| s.synced = synced);
    }

    pub fn set_fee(&self, fee: FeeSample) {
        self.with_state(|s| s.fee = fee);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.with_state(|s| s.latency = Some(latency));
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    async fn enter(&self) -> Result<(), ProviderError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let (offline, latency) = self.with_state(|s| (s.offline, s.latency));
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if offline {
            return Err(ProviderError::RpcConnection(format!(
                "{} is offline",
                self.endpoint
            )));
        }
        Ok(())
    }

    fn head(state: &MockState) -> Option<u64> {
        state
            .reported_head
            .or_else(|| state.blocks.last_key_value().map(|(h, _)| *h))
    }
}

fn fork_of(hash: &str) -> u64 {
    let body = hash.trim_start_matches("0x");
    if body.len() < 16 {
        return 0;
    }
    u64::from_str_radix(&body[body.len() - 16..body.len() - 8], 16).unwrap_or(0)
}

#[async_trait]
impl ChainClient for MockChainClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn head_height(&self) -> Result<u64, ProviderError> {
        self.enter().await?;
        self.with_state(|s| Self::head(s))
            .ok_or_else(|| ProviderError::InvalidResponse("empty chain".to_string()))
    }

    async fn block_by_height(&self, height: u64) -> Result<Option<Block>, ProviderError> {
        self.enter().await?;
        Ok(self.with_state(|s| {
            let head = Self::head(s)?;
            if height > head {
                return None;
            }
            s.blocks.get(&height).cloned()
        }))
    }

    async fn logs_in_block(
        &self,
        block_hash: &str,
        addresses: &[Address],
    ) -> Result<Vec<LogEntry>, ProviderError> {
        self.enter().await?;
        let block_hash = normalize_hex(block_hash);
        Ok(self.with_state(|s| {
            s.logs
                .get(&block_hash)
                .map(|logs| {
                    logs.iter()
                        .filter(|log| {
                            addresses
                                .iter()
                                .any(|a| a.as_str().eq_ignore_ascii_case(&log.address))
                        })
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        }))
    }

    async fn transactions_in_block(&self, block_hash: &str) -> Result<Vec<TxEntry>, ProviderError> {
        self.enter().await?;
        let block_hash = normalize_hex(block_hash);
        Ok(self.with_state(|s| s.txs.get(&block_hash).cloned().unwrap_or_default()))
    }

    async fn is_synced(&self) -> Result<bool, ProviderError> {
        self.enter().await?;
        Ok(self.with_state(|s| s.synced))
    }

    async fn fee_sample(&self) -> Result<FeeSample, ProviderError> {
        self.enter().await?;
        Ok(self.with_state(|s| s.fee))
    }
}

/// ERC20 `Transfer` log as a node would return it
pub fn erc20_transfer_log(
    token: &Address,
    from: &Address,
    to: &Address,
    amount: u128,
    tx_hash: &str,
    log_index: u64,
) -> LogEntry {
    LogEntry {
        address: token.to_string(),
        topics: vec![
            ERC20_TRANSFER_TOPIC.to_string(),
            address_topic(from),
            address_topic(to),
        ],
        data: format!("0x{:064x}", amount),
        tx_hash: normalize_hex(tx_hash),
        log_index,
        block_hash: String::new(),
        removed: false,
    }
}

pub fn address_topic(address: &Address) -> String {
    format!("0x{:0>64}", address.as_str().trim_start_matches("0x"))
}
