use super::WorkerError;
use super::backfill::BackfillController;
use super::lease::LeaseKeeper;
use super::pipeline::BlockPipeline;
use crate::chain::ChainId;
use crate::config::{BackoffConfig, ChainConfig, EngineConfig};
use crate::notify::{EngineEvent, EventBus};
use crate::provider::Failover;
use crate::status::{ChainPhase, StatusBoard};
use crate::store::Store;
use crate::tracker::{ChainHeadTracker, ChainMessage, TrackerConfig, TrackerError};
use backoff::backoff::Backoff;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// How a worker ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    Shutdown,
    Halted(String),
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub holder: String,
    pub lease_ttl: Duration,
    pub backfill_depth: u64,
    pub health_check_interval: Duration,
    pub channel_capacity: usize,
    pub backoff: BackoffConfig,
    pub tracker: TrackerConfig,
}

impl WorkerSettings {
    pub fn from_config(chain: &ChainConfig, engine: &EngineConfig) -> Self {
        Self {
            holder: engine.instance_name.clone(),
            lease_ttl: engine.lease_ttl(),
            backfill_depth: chain.backfill_depth.unwrap_or(engine.backfill_depth),
            health_check_interval: engine.health_check_interval(),
            channel_capacity: engine.channel_capacity,
            backoff: engine.backoff.clone(),
            tracker: TrackerConfig::from_config(chain, engine),
        }
    }
}

/// Owns one chain: lease, backfill, live tracking and the block pipeline
pub struct ChainWorker {
    chain: ChainId,
    settings: WorkerSettings,
    store: Arc<dyn Store>,
    pipeline: BlockPipeline,
    bus: EventBus,
    board: Arc<StatusBoard>,
}

impl ChainWorker {
    pub fn new(
        settings: WorkerSettings,
        pipeline: BlockPipeline,
        bus: EventBus,
        board: Arc<StatusBoard>,
    ) -> Self {
        Self {
            chain: pipeline.chain(),
            store: pipeline.store().clone(),
            settings,
            pipeline,
            bus,
            board,
        }
    }

    pub fn chain(&self) -> ChainId {
        self.chain
    }

    fn failover(&self) -> &Failover {
        self.pipeline.failover()
    }

    /// Run until shutdown or until the chain halts. A lost lease goes back
    /// to waiting for it.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> WorkerExit {
        let chain = self.chain;
        let retry = self.settings.backoff.build().initial_interval;

        loop {
            self.board.set_phase(chain, ChainPhase::WaitingForLease);
            let acquired = LeaseKeeper::acquire(
                self.store.clone(),
                chain,
                &self.settings.holder,
                self.settings.lease_ttl,
                self.settings.lease_ttl / 3,
                &mut shutdown,
            )
            .await;
            let mut keeper = match acquired {
                Ok(Some(keeper)) => keeper,
                Ok(None) => break,
                Err(e) => {
                    warn!(%chain, error = %e, "Lease acquisition failed");
                    if wait(retry, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            match self.run_leased(&mut keeper, &mut shutdown).await {
                Ok(()) => {
                    keeper.release().await;
                    break;
                }
                Err(e) if e.is_lease_lost() => {
                    warn!(%chain, "Chain lease lost, stopping writes and waiting for it");
                }
                Err(e) => {
                    let reason = match e {
                        WorkerError::Halted { reason, .. } => reason,
                        other => other.to_string(),
                    };
                    error!(%chain, reason, "Chain halted");
                    self.board.halt(chain, &reason);
                    self.bus.publish(EngineEvent::ChainHalted {
                        chain,
                        reason: reason.clone(),
                    });
                    keeper.release().await;
                    return WorkerExit::Halted(reason);
                }
            }
        }

        self.board.set_phase(chain, ChainPhase::Stopped);
        info!(%chain, "Chain worker stopped");
        WorkerExit::Shutdown
    }

    async fn run_leased(
        &self,
        keeper: &mut LeaseKeeper,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), WorkerError> {
        let chain = self.chain;
        let mut tracker = ChainHeadTracker::new(self.failover().clone(), self.settings.tracker.clone());
        let backfill = BackfillController::new(self.settings.backfill_depth);
        let mut backoff = self.settings.backoff.build();
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            self.board.set_phase(chain, ChainPhase::Backfilling);
            match backfill.run(&mut tracker, &self.pipeline, keeper, shutdown).await {
                Ok(Some(report)) => {
                    debug!(%chain, blocks = report.blocks, reverts = report.reverts, "Backfill report");
                    if let Some(tip) = tracker.tip() {
                        self.board.block_processed(chain, tip.height);
                    }
                    break;
                }
                Ok(None) => return Ok(()),
                Err(e) if e.is_transient() => {
                    attempt = attempt.saturating_add(1);
                    let delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
                    self.unavailable(attempt, delay, &e);
                    if wait(delay, shutdown).await {
                        return Ok(());
                    }
                }
                Err(e) => return Err(e),
            }
        }

        self.board.set_phase(chain, ChainPhase::Live);
        let (tx, mut rx) = mpsc::channel(self.settings.channel_capacity.max(1));
        let (stop_tx, stop_rx) = watch::channel(false);
        let tracker_task = tokio::spawn(tracker.run(tx, stop_rx));
        let mut health = tokio::time::interval(self.settings.health_check_interval);
        let mut renew = tokio::time::interval((self.settings.lease_ttl / 3).max(Duration::from_millis(1)));

        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break Ok(());
                    }
                }
                message = rx.recv() => {
                    let Some(message) = message else {
                        break Err(WorkerError::Halted {
                            chain,
                            reason: "chain head tracker stopped".to_string(),
                        });
                    };
                    match self.handle(message, keeper, shutdown).await {
                        Ok(true) => {}
                        Ok(false) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                }
                _ = renew.tick() => {
                    if let Err(e) = keeper.renew_if_due().await {
                        break Err(e.into());
                    }
                }
                _ = health.tick() => {
                    let answered = self.failover().probe_all().await;
                    debug!(%chain, answered, "Provider health probe");
                }
            }
        };

        let _ = stop_tx.send(true);
        drop(rx);
        if let Err(e) = tracker_task.await {
            warn!(%chain, error = %e, "Chain head tracker task failed");
        }
        result
    }

    /// Handle one tracker message. Blocks are retried with backoff while the
    /// failure is transient; shutdown is honoured between attempts.
    /// `Ok(false)` if shutdown interrupted the retries and the block was not
    /// committed; the caller must not take another message.
    async fn handle(
        &self,
        message: ChainMessage,
        keeper: &mut LeaseKeeper,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<bool, WorkerError> {
        let chain = self.chain;
        match &message {
            ChainMessage::Unavailable { attempt, retry_in } => {
                self.board.set_phase(chain, ChainPhase::Unavailable);
                self.bus.publish(EngineEvent::ChainUnavailable {
                    chain,
                    attempt: *attempt,
                    retry_in_ms: retry_in.as_millis() as u64,
                });
                return Ok(true);
            }
            ChainMessage::Halted { reason } => {
                return Err(WorkerError::Halted {
                    chain,
                    reason: reason.clone(),
                });
            }
            ChainMessage::BlockAccepted { .. } | ChainMessage::BlocksReverted(_) => {}
        }

        let mut backoff = self.settings.backoff.build();
        let mut attempt: u32 = 0;
        loop {
            keeper.renew_if_due().await?;
            match self.pipeline.apply(keeper.lease(), &message).await {
                Ok(()) => break,
                Err(e) if e.is_transient() => {
                    attempt = attempt.saturating_add(1);
                    let delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
                    self.unavailable(attempt, delay, &e);
                    if wait(delay, shutdown).await {
                        info!(%chain, "Shutdown while retrying, block left for the next run");
                        return Ok(false);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        match message {
            ChainMessage::BlockAccepted { block, .. } => self.board.block_processed(chain, block.height),
            ChainMessage::BlocksReverted(range) => {
                self.board.block_processed(chain, range.fork_point.height)
            }
            _ => {}
        }
        Ok(true)
    }

    fn unavailable(&self, attempt: u32, delay: Duration, error: &WorkerError) {
        warn!(
            chain = %self.chain,
            attempt,
            retry_in_ms = delay.as_millis() as u64,
            error = %error,
            "Chain processing failed, backing off"
        );
        let provider_failure = matches!(
            error,
            WorkerError::Extract(_) | WorkerError::Tracker(TrackerError::Provider(_))
        );
        if provider_failure {
            self.board.set_phase(self.chain, ChainPhase::Unavailable);
            self.bus.publish(EngineEvent::ChainUnavailable {
                chain: self.chain,
                attempt,
                retry_in_ms: delay.as_millis() as u64,
            });
        }
    }
}

/// Sleep for `delay`. `true` if shutdown was requested meanwhile.
async fn wait(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Address;
    use crate::config::ReconciliationConfig;
    use crate::extractor::{EventExtractor, TargetCatalog};
    use crate::provider::mock::erc20_transfer_log;
    use crate::provider::{MockChainClient, ProviderRegistry};
    use crate::reconcile::Reconciler;
    use crate::store::MemoryStore;
    use crate::transfer::{TransferStateMachine, TransferStatus};

    const TOKEN: &str = "0x6b175474e89094c44da98b954eedeac495271d0f";
    const SHOP: &str = "0x2222222222222222222222222222222222222222";
    const ALICE: &str = "0x1111111111111111111111111111111111111111";

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    fn settings() -> WorkerSettings {
        WorkerSettings {
            holder: "worker-test".to_string(),
            lease_ttl: Duration::from_secs(3),
            backfill_depth: 100,
            health_check_interval: Duration::from_millis(50),
            channel_capacity: 16,
            backoff: BackoffConfig {
                initial_ms: 10,
                max_ms: 50,
                ..Default::default()
            },
            tracker: TrackerConfig {
                max_reorg_depth: 8,
                max_blocks_per_poll: 10,
                poll_interval: Duration::from_millis(10),
                backoff: BackoffConfig {
                    initial_ms: 10,
                    max_ms: 50,
                    ..Default::default()
                },
            },
        }
    }

    async fn wait_for_watermark(store: &MemoryStore, height: u64) {
        for _ in 0..500 {
            let mark = store.watermark(ChainId(1)).await.unwrap();
            if mark.is_some_and(|m| m.height >= height) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("watermark never reached {height}");
    }

    #[tokio::test]
    async fn test_worker_catches_up_and_releases_lease_on_shutdown() {
        let registry = Arc::new(ProviderRegistry::new());
        let client = Arc::new(MockChainClient::new(ChainId(1), "mock://node"));
        client.push_canonical_chain(0, 30);
        client.add_log(
            5,
            erc20_transfer_log(&addr(TOKEN), &addr(ALICE), &addr(SHOP), 9, "0xaa", 0),
        );
        registry.register(ChainId(1), client.clone());
        let failover = Failover::new(ChainId(1), registry, Duration::from_secs(1));

        let catalog = Arc::new(
            TargetCatalog::from_yaml(&format!(
                "targets:\n  - chain_id: 1\n    address: \"{TOKEN}\"\n    kind: erc20\n"
            ))
            .unwrap(),
        );
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new(64);
        let board = Arc::new(StatusBoard::new());
        let pipeline = BlockPipeline::new(
            store.clone(),
            failover,
            EventExtractor::new(catalog),
            TransferStateMachine::new(3),
            Reconciler::new(ReconciliationConfig::default()),
            bus.clone(),
        );
        let worker = ChainWorker::new(settings(), pipeline, bus, board.clone());

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(stop_rx));

        wait_for_watermark(&store, 29).await;
        client.extend(5);
        wait_for_watermark(&store, 34).await;
        assert_eq!(board.get(ChainId(1)).phase, ChainPhase::Live);

        stop_tx.send(true).unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, WorkerExit::Shutdown);
        assert_eq!(board.get(ChainId(1)).phase, ChainPhase::Stopped);

        let transfers = store.transfers().await;
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].status, TransferStatus::Confirmed);

        let again = store
            .acquire_lease(ChainId(1), "other", Duration::from_secs(3))
            .await
            .unwrap();
        assert!(again.is_some());
    }

    #[tokio::test]
    async fn test_shutdown_during_retry_leaves_block_uncommitted() {
        let registry = Arc::new(ProviderRegistry::new());
        let client = Arc::new(MockChainClient::new(ChainId(1), "mock://node"));
        client.push_canonical_chain(0, 10);
        registry.register(ChainId(1), client.clone());
        let failover = Failover::new(ChainId(1), registry, Duration::from_millis(200));

        let catalog = Arc::new(
            TargetCatalog::from_yaml(&format!(
                "targets:\n  - chain_id: 1\n    address: \"{TOKEN}\"\n    kind: erc20\n"
            ))
            .unwrap(),
        );
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new(64);
        let pipeline = BlockPipeline::new(
            store.clone(),
            failover,
            EventExtractor::new(catalog),
            TransferStateMachine::new(3),
            Reconciler::new(ReconciliationConfig::default()),
            bus.clone(),
        );
        let worker = ChainWorker::new(settings(), pipeline, bus, Arc::new(StatusBoard::new()));

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let mut keeper = LeaseKeeper::acquire(
            store.clone(),
            ChainId(1),
            "worker-test",
            Duration::from_secs(3),
            Duration::from_millis(10),
            &mut stop_rx,
        )
        .await
        .unwrap()
        .unwrap();

        let block = client.block_at(5).unwrap();
        client.set_offline(true);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            stop_tx.send(true).unwrap();
        });

        let message = ChainMessage::BlockAccepted { block, live: true };
        let handled = tokio::time::timeout(
            Duration::from_secs(5),
            worker.handle(message, &mut keeper, &mut stop_rx),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(!handled);
        assert_eq!(store.watermark(ChainId(1)).await.unwrap(), None);
        assert!(*stop_rx.borrow());
    }

    #[tokio::test]
    async fn test_deep_reorg_halts_chain() {
        let registry = Arc::new(ProviderRegistry::new());
        let client = Arc::new(MockChainClient::new(ChainId(1), "mock://node"));
        client.push_canonical_chain(0, 40);
        registry.register(ChainId(1), client.clone());
        let failover = Failover::new(ChainId(1), registry, Duration::from_secs(1));

        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new(64);
        let mut events = bus.subscribe();
        let board = Arc::new(StatusBoard::new());
        let pipeline = BlockPipeline::new(
            store.clone(),
            failover,
            EventExtractor::new(Arc::new(TargetCatalog::empty())),
            TransferStateMachine::new(3),
            Reconciler::new(ReconciliationConfig::default()),
            bus.clone(),
        );
        let worker = ChainWorker::new(settings(), pipeline, bus, board.clone());

        let (_stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(stop_rx));
        wait_for_watermark(&store, 39).await;

        // Fork 20 blocks below the tip, deeper than the 8-block window
        client.reorg_from(20, 1);
        client.extend(1);

        let exit = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(exit, WorkerExit::Halted(_)));
        assert!(board.is_halted(ChainId(1)));

        let mut halted = false;
        while let Ok(event) = events.try_recv() {
            halted |= matches!(event, EngineEvent::ChainHalted { .. });
        }
        assert!(halted);
    }
}
