use super::window::BlockWindow;
use super::{ChainMessage, RevertedRange, TrackerError};
use crate::chain::{Block, BlockRef, ChainId};
use crate::config::{BackoffConfig, ChainConfig, EngineConfig};
use crate::provider::{Failover, ProviderError};
use backoff::backoff::Backoff;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub max_reorg_depth: u64,
    pub max_blocks_per_poll: u64,
    pub poll_interval: Duration,
    pub backoff: BackoffConfig,
}

impl TrackerConfig {
    pub fn from_config(chain: &ChainConfig, engine: &EngineConfig) -> Self {
        Self {
            max_reorg_depth: chain.max_reorg_depth,
            max_blocks_per_poll: chain.max_blocks_per_poll,
            poll_interval: engine.poll_interval(),
            backoff: engine.backoff.clone(),
        }
    }
}

/// Polls the chain's providers and emits the canonical block stream
pub struct ChainHeadTracker {
    chain: ChainId,
    failover: Failover,
    config: TrackerConfig,
    window: BlockWindow,
}

impl ChainHeadTracker {
    pub fn new(failover: Failover, config: TrackerConfig) -> Self {
        let window = BlockWindow::new(config.max_reorg_depth as usize + 1);
        Self {
            chain: failover.chain(),
            failover,
            config,
            window,
        }
    }

    pub fn chain(&self) -> ChainId {
        self.chain
    }

    /// Seed the window with persisted recent blocks
    pub fn seed(&mut self, refs: Vec<BlockRef>) {
        self.window.seed(refs);
    }

    /// Restart the window at `block`, discarding older history
    pub fn reset_base(&mut self, block: &Block) {
        self.window = BlockWindow::new(self.config.max_reorg_depth as usize + 1);
        self.window.push(block.block_ref());
    }

    pub fn tip(&self) -> Option<&BlockRef> {
        self.window.tip()
    }

    pub fn window(&self) -> &BlockWindow {
        &self.window
    }

    pub async fn query_head(&self) -> Result<u64, TrackerError> {
        Ok(self.failover.head().await?)
    }

    pub async fn fetch_block(&self, height: u64) -> Result<Block, TrackerError> {
        let block = self
            .failover
            .call("eth_getBlockByNumber", move |client| async move {
                client
                    .block_by_height(height)
                    .await?
                    .ok_or(ProviderError::BlockNotFound(height))
            })
            .await?;
        Ok(block)
    }

    /// One poll cycle. Returns `true` if the chain is still ahead of us.
    pub async fn poll_once(&mut self, out: &mut Vec<ChainMessage>) -> Result<bool, TrackerError> {
        let head = self.query_head().await?;
        self.advance(head, true, out).await?;
        Ok(self.window.tip().is_some_and(|tip| tip.height < head))
    }

    /// Accept blocks up to `target`, at most `max_blocks_per_poll` per call.
    ///
    /// Messages are pushed as soon as the window changes, so on error `out`
    /// still holds everything accepted before the failure.
    pub async fn advance(
        &mut self,
        target: u64,
        live: bool,
        out: &mut Vec<ChainMessage>,
    ) -> Result<(), TrackerError> {
        let Some(tip) = self.window.tip().cloned() else {
            let block = self.fetch_block(target).await?;
            info!(chain = %self.chain, height = block.height, "Tracking from block");
            self.window.push(block.block_ref());
            out.push(ChainMessage::BlockAccepted { block, live });
            return Ok(());
        };

        if target <= tip.height {
            if target < tip.height {
                debug!(
                    chain = %self.chain,
                    reported = target,
                    accepted = tip.height,
                    "Reported head behind accepted tip, provider lagging"
                );
            }
            return Ok(());
        }

        let end = target.min(tip.height + self.config.max_blocks_per_poll);
        let mut height = tip.height + 1;
        while height <= end {
            let block = self.fetch_block(height).await?;
            let parent_ok = self
                .window
                .tip()
                .is_none_or(|parent| block.extends(parent));

            if !parent_ok {
                let (range, branch) = self.resolve_reorg(&block).await?;
                warn!(
                    chain = %self.chain,
                    from = range.from_height,
                    to = range.to_height,
                    fork_point = %range.fork_point,
                    "Reorg detected"
                );
                out.push(ChainMessage::BlocksReverted(range));
                for ancestor in branch {
                    self.window.push(ancestor.block_ref());
                    out.push(ChainMessage::BlockAccepted {
                        block: ancestor,
                        live,
                    });
                }
            }

            self.window.push(block.block_ref());
            out.push(ChainMessage::BlockAccepted { block, live });
            height += 1;
        }
        Ok(())
    }

    /// Walk back from `child`'s parent until a fetched ancestor matches the
    /// accepted hash at its height. Returns the orphaned range and the new
    /// branch between the fork point and `child`, oldest first.
    async fn resolve_reorg(
        &mut self,
        child: &Block,
    ) -> Result<(RevertedRange, Vec<Block>), TrackerError> {
        let tip = self
            .window
            .tip()
            .cloned()
            .ok_or(TrackerError::InconsistentBranch {
                height: child.height,
            })?;
        let too_deep = TrackerError::ReorgTooDeep {
            chain: self.chain,
            max_depth: self.config.max_reorg_depth,
            tip: tip.height,
        };

        let mut expected = child.parent_hash.clone();
        let mut height = tip.height;
        let mut branch = Vec::new();

        loop {
            match self.window.hash_at(height) {
                Some(accepted) if accepted == expected => break,
                Some(_) => {}
                None => return Err(too_deep),
            }

            let orphaned = tip.height - height + 1;
            if orphaned > self.config.max_reorg_depth || height == 0 {
                return Err(too_deep);
            }

            let ancestor = self.fetch_block(height).await?;
            if ancestor.hash != expected {
                return Err(TrackerError::InconsistentBranch { height });
            }
            expected = ancestor.parent_hash.clone();
            branch.push(ancestor);
            height -= 1;
        }

        self.window.truncate_above(height);
        branch.reverse();
        let range = RevertedRange {
            chain: self.chain,
            from_height: height + 1,
            to_height: tip.height,
            fork_point: BlockRef {
                height,
                hash: expected,
            },
        };
        Ok((range, branch))
    }

    /// Live loop: poll, forward messages, back off while every provider fails.
    /// Stops on shutdown, on a fatal error (after sending `Halted`) or when the
    /// receiver is dropped.
    pub async fn run(mut self, tx: mpsc::Sender<ChainMessage>, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = self.config.backoff.build();
        let mut attempt: u32 = 0;
        info!(
            chain = %self.chain,
            tip = ?self.window.tip().map(|t| t.height),
            "Chain head tracker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let mut out = Vec::new();
            let result = self.poll_once(&mut out).await;
            for message in out {
                if tx.send(message).await.is_err() {
                    debug!(chain = %self.chain, "Message receiver dropped, tracker stopping");
                    return;
                }
            }

            let delay = match result {
                Ok(behind) => {
                    if attempt > 0 {
                        info!(chain = %self.chain, attempts = attempt, "Chain available again");
                    }
                    attempt = 0;
                    backoff.reset();
                    if behind {
                        Duration::ZERO
                    } else {
                        self.config.poll_interval
                    }
                }
                Err(e) if e.is_transient() => {
                    attempt = attempt.saturating_add(1);
                    let delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
                    warn!(
                        chain = %self.chain,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Chain poll failed"
                    );
                    if matches!(e, TrackerError::Provider(_))
                        && tx
                            .send(ChainMessage::Unavailable {
                                attempt,
                                retry_in: delay,
                            })
                            .await
                            .is_err()
                    {
                        return;
                    }
                    delay
                }
                Err(e) => {
                    error!(chain = %self.chain, error = %e, "Chain halted");
                    let _ = tx
                        .send(ChainMessage::Halted {
                            reason: e.to_string(),
                        })
                        .await;
                    return;
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(chain = %self.chain, "Chain head tracker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MockChainClient, ProviderRegistry};
    use std::sync::Arc;

    fn config(max_reorg_depth: u64, max_blocks_per_poll: u64) -> TrackerConfig {
        TrackerConfig {
            max_reorg_depth,
            max_blocks_per_poll,
            poll_interval: Duration::from_millis(10),
            backoff: BackoffConfig {
                initial_ms: 10,
                max_ms: 40,
                multiplier: 2.0,
                randomization_factor: 0.0,
            },
        }
    }

    fn setup(cfg: TrackerConfig) -> (Arc<MockChainClient>, ChainHeadTracker) {
        let registry = Arc::new(ProviderRegistry::new());
        let client = Arc::new(MockChainClient::new(ChainId(1), "mock://node"));
        registry.register(ChainId(1), client.clone());
        let failover = Failover::new(ChainId(1), registry, Duration::from_secs(1));
        (client, ChainHeadTracker::new(failover, cfg))
    }

    fn heights(messages: &[ChainMessage]) -> Vec<u64> {
        messages
            .iter()
            .filter_map(|m| match m {
                ChainMessage::BlockAccepted { block, .. } => Some(block.height),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_emits_blocks_in_height_order() {
        let (client, mut tracker) = setup(config(10, 100));
        client.push_canonical_chain(0, 10);
        tracker.seed(vec![client.block_at(4).unwrap().block_ref()]);

        let mut out = Vec::new();
        let behind = tracker.poll_once(&mut out).await.unwrap();
        assert!(!behind);
        assert_eq!(heights(&out), vec![5, 6, 7, 8, 9]);
        assert!(out
            .iter()
            .all(|m| matches!(m, ChainMessage::BlockAccepted { live: true, .. })));
    }

    #[tokio::test]
    async fn test_batch_capped_per_poll() {
        let (client, mut tracker) = setup(config(10, 3));
        client.push_canonical_chain(0, 20);
        tracker.seed(vec![client.block_at(0).unwrap().block_ref()]);

        let mut out = Vec::new();
        assert!(tracker.poll_once(&mut out).await.unwrap());
        assert_eq!(heights(&out), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_lagging_head_is_not_a_rollback() {
        let (client, mut tracker) = setup(config(10, 100));
        client.push_canonical_chain(0, 10);
        tracker.seed(vec![client.block_at(9).unwrap().block_ref()]);
        client.set_reported_head(Some(6));

        let mut out = Vec::new();
        tracker.poll_once(&mut out).await.unwrap();
        assert!(out.is_empty());
        assert_eq!(tracker.tip().map(|t| t.height), Some(9));
    }

    #[tokio::test]
    async fn test_reorg_reverts_orphaned_range_then_replays_branch() {
        let (client, mut tracker) = setup(config(10, 100));
        client.push_canonical_chain(0, 53);
        let refs = (45..=52).map(|h| client.block_at(h).unwrap().block_ref()).collect();
        tracker.seed(refs);

        client.reorg_from(50, 1);
        client.extend(1);

        let mut out = Vec::new();
        tracker.poll_once(&mut out).await.unwrap();

        match &out[0] {
            ChainMessage::BlocksReverted(range) => {
                assert_eq!(range.from_height, 50);
                assert_eq!(range.to_height, 52);
                assert_eq!(range.fork_point, client.block_at(49).unwrap().block_ref());
            }
            other => panic!("expected revert, got {:?}", other),
        }
        assert_eq!(heights(&out), vec![50, 51, 52, 53]);
        assert_eq!(
            tracker.tip().cloned(),
            Some(client.block_at(53).unwrap().block_ref())
        );
    }

    #[tokio::test]
    async fn test_reorg_deeper_than_limit_is_fatal() {
        let (client, mut tracker) = setup(config(2, 100));
        client.push_canonical_chain(0, 56);
        let refs = (53..=55).map(|h| client.block_at(h).unwrap().block_ref()).collect();
        tracker.seed(refs);

        client.reorg_from(52, 1);
        client.extend(1);

        let mut out = Vec::new();
        let err = tracker.poll_once(&mut out).await.unwrap_err();
        assert!(matches!(err, TrackerError::ReorgTooDeep { max_depth: 2, .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_run_backs_off_while_unavailable_then_recovers() {
        let (client, mut tracker) = setup(config(10, 100));
        client.push_canonical_chain(0, 5);
        tracker.seed(vec![client.block_at(4).unwrap().block_ref()]);
        client.set_offline(true);

        let (tx, mut rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(tracker.run(tx, shutdown_rx));

        let mut delays = Vec::new();
        while delays.len() < 3 {
            match rx.recv().await.unwrap() {
                ChainMessage::Unavailable { attempt, retry_in } => {
                    assert_eq!(attempt as usize, delays.len() + 1);
                    delays.push(retry_in);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(delays[0] < delays[1] && delays[1] < delays[2]);

        client.extend(1);
        client.set_offline(false);
        loop {
            match rx.recv().await.unwrap() {
                ChainMessage::BlockAccepted { block, .. } => {
                    assert_eq!(block.height, 5);
                    break;
                }
                ChainMessage::Unavailable { .. } => continue,
                other => panic!("unexpected {:?}", other),
            }
        }

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
