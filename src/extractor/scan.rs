use super::decode::{decode_log, decode_native, kind_for_topic, native_log_index};
use super::error::ExtractError;
use super::targets::{ChainTargets, TargetCatalog};
use super::{EventKind, EventPayload, RawEvent};
use crate::chain::{Address, Block};
use crate::provider::{Failover, LogEntry, TxEntry};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExtractOutcome {
    /// Ordered by log index, native transfers last
    pub events: Vec<RawEvent>,
    pub decode_failures: usize,
}

pub struct EventExtractor {
    catalog: Arc<TargetCatalog>,
}

impl EventExtractor {
    pub fn new(catalog: Arc<TargetCatalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &Arc<TargetCatalog> {
        &self.catalog
    }

    /// Fetch and decode the tracked events of one canonical block
    pub async fn extract(
        &self,
        failover: &Failover,
        block: &Block,
    ) -> Result<ExtractOutcome, ExtractError> {
        let targets = self.catalog.targets_for(block.chain);
        if targets.is_empty() {
            return Ok(ExtractOutcome::default());
        }

        let addresses = Arc::new(targets.contract_addresses());
        let logs = if addresses.is_empty() {
            Vec::new()
        } else {
            let hash = block.hash.clone();
            failover
                .call("eth_getLogs", move |client| {
                    let hash = hash.clone();
                    let addresses = addresses.clone();
                    async move { client.logs_in_block(&hash, &addresses).await }
                })
                .await?
        };

        let txs = if targets.has_native() {
            let hash = block.hash.clone();
            failover
                .call("eth_getBlockByHash", move |client| {
                    let hash = hash.clone();
                    async move { client.transactions_in_block(&hash).await }
                })
                .await?
        } else {
            Vec::new()
        };

        Ok(extract_from(block, &logs, &txs, &targets))
    }
}

/// Match and decode fetched logs and transactions against `targets`
pub fn extract_from(
    block: &Block,
    logs: &[LogEntry],
    txs: &[TxEntry],
    targets: &ChainTargets,
) -> ExtractOutcome {
    let mut outcome = ExtractOutcome::default();
    let mut seen = HashSet::new();

    for log in logs {
        if log.removed || !log.block_hash.eq_ignore_ascii_case(&block.hash) {
            debug!(
                chain = %block.chain,
                height = block.height,
                tx = %log.tx_hash,
                "Skipping log not on this block"
            );
            continue;
        }
        let Ok(address) = Address::parse(&log.address) else {
            continue;
        };
        let Some(target) = targets.contract(&address) else {
            continue;
        };
        let Some(kind) = log.topics.first().and_then(|t| kind_for_topic(t)) else {
            continue;
        };
        if !target.watches(kind) {
            continue;
        }

        match decode_log(kind, log) {
            Ok(payload) => {
                let event = RawEvent {
                    chain: block.chain,
                    block_height: block.height,
                    block_hash: block.hash.clone(),
                    tx_hash: log.tx_hash.to_lowercase(),
                    log_index: log.log_index,
                    address: target.address.clone(),
                    contract_kind: target.kind,
                    token: target.token.clone(),
                    payload,
                };
                if seen.insert(event.key()) {
                    outcome.events.push(event);
                }
            }
            Err(e) => {
                warn!(
                    chain = %block.chain,
                    height = block.height,
                    tx = %log.tx_hash,
                    log_index = log.log_index,
                    kind = %kind,
                    error = %e,
                    "Failed to decode tracked log, skipping"
                );
                outcome.decode_failures += 1;
            }
        }
    }

    for tx in txs {
        let payload = match decode_native(tx) {
            Ok(Some(payload)) => payload,
            Ok(None) => continue,
            Err(e) => {
                warn!(
                    chain = %block.chain,
                    height = block.height,
                    tx = %tx.hash,
                    error = %e,
                    "Failed to decode transaction, skipping"
                );
                outcome.decode_failures += 1;
                continue;
            }
        };
        let EventPayload::NativeTransfer { to, .. } = &payload else {
            continue;
        };
        let Some(target) = targets.native_account(to) else {
            continue;
        };
        if !target.watches(EventKind::NativeTransfer) {
            continue;
        }

        let event = RawEvent {
            chain: block.chain,
            block_height: block.height,
            block_hash: block.hash.clone(),
            tx_hash: tx.hash.to_lowercase(),
            log_index: native_log_index(tx.index),
            address: target.address.clone(),
            contract_kind: target.kind,
            token: target.token.clone(),
            payload,
        };
        if seen.insert(event.key()) {
            outcome.events.push(event);
        }
    }

    outcome.events.sort_by_key(|e| e.log_index);
    outcome
}
