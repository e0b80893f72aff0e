//! Block pipeline
//!
//! extract → classify → confirm → reconcile → one `commit_block`.
//! Notifications are published only after the commit succeeded. A lost route
//! claim or a concurrently changed transfer re-plans the block from fresh
//! store state, up to [`MAX_COMMIT_ATTEMPTS`] times.

use super::WorkerError;
use crate::chain::{Block, ChainId};
use crate::extractor::{EventExtractor, RawEvent, RawEventKey};
use crate::notify::{EngineEvent, EventBus};
use crate::provider::Failover;
use crate::reconcile::{MatchKey, ReconcilePlan, Reconciler};
use crate::store::{CommitBatch, Lease, Store, TransferWrite};
use crate::tracker::{ChainMessage, RevertedRange};
use crate::transfer::{Transfer, TransferStateMachine, TransferStatus, classify};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const MAX_COMMIT_ATTEMPTS: u32 = 3;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BlockOutcome {
    pub height: u64,
    pub raw_events: usize,
    pub decode_failures: usize,
    pub new_transfers: usize,
    pub confirmed: usize,
    pub settlements: usize,
    pub deposits: usize,
}

pub struct BlockPipeline {
    chain: ChainId,
    store: Arc<dyn Store>,
    failover: Failover,
    extractor: EventExtractor,
    machine: TransferStateMachine,
    reconciler: Reconciler,
    bus: EventBus,
}

impl BlockPipeline {
    pub fn new(
        store: Arc<dyn Store>,
        failover: Failover,
        extractor: EventExtractor,
        machine: TransferStateMachine,
        reconciler: Reconciler,
        bus: EventBus,
    ) -> Self {
        Self {
            chain: failover.chain(),
            store,
            failover,
            extractor,
            machine,
            reconciler,
            bus,
        }
    }

    pub fn chain(&self) -> ChainId {
        self.chain
    }

    pub fn failover(&self) -> &Failover {
        &self.failover
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Apply a block stream message. Control messages (`Unavailable`,
    /// `Halted`) belong to the worker and are ignored here.
    pub async fn apply(&self, lease: &Lease, message: &ChainMessage) -> Result<(), WorkerError> {
        match message {
            ChainMessage::BlockAccepted { block, .. } => {
                self.process_block(lease, block).await?;
            }
            ChainMessage::BlocksReverted(range) => {
                self.process_revert(lease, range).await?;
            }
            ChainMessage::Unavailable { .. } | ChainMessage::Halted { .. } => {}
        }
        Ok(())
    }

    /// Process one canonical block and advance the watermark to it. The
    /// block must be the child of the watermark or a replay of a processed one.
    pub async fn process_block(&self, lease: &Lease, block: &Block) -> Result<BlockOutcome, WorkerError> {
        self.process(lease, block, false).await
    }

    /// Process the first block of a backfill that starts past the watermark
    pub async fn process_base(&self, lease: &Lease, block: &Block) -> Result<BlockOutcome, WorkerError> {
        self.process(lease, block, true).await
    }

    async fn process(&self, lease: &Lease, block: &Block, base: bool) -> Result<BlockOutcome, WorkerError> {
        let extracted = self.extractor.extract(&self.failover, block).await?;
        let keys: Vec<RawEventKey> = extracted.events.iter().map(RawEvent::key).collect();
        let existing = self.store.existing_raw_events(&keys).await?;
        let fresh: Vec<RawEvent> = extracted
            .events
            .into_iter()
            .filter(|e| !existing.contains(&e.key()))
            .collect();
        if !existing.is_empty() {
            debug!(
                chain = %self.chain,
                height = block.height,
                skipped = existing.len(),
                "Raw events already recorded"
            );
        }

        let executed_at = block_time(block);
        let new_transfers: Vec<Transfer> = fresh
            .iter()
            .filter_map(|event| match classify(event, executed_at) {
                Ok(transfer) => Some(transfer),
                Err(e) => {
                    warn!(
                        chain = %self.chain,
                        height = block.height,
                        tx = %event.tx_hash,
                        log_index = event.log_index,
                        error = %e,
                        "Dropping raw event"
                    );
                    None
                }
            })
            .collect();

        let mut attempt = 0;
        loop {
            attempt += 1;
            let (writes, confirmed) = self.confirm(block.height, &new_transfers).await?;
            let plan = self.plan(&confirmed).await?;
            let outcome = BlockOutcome {
                height: block.height,
                raw_events: fresh.len(),
                decode_failures: extracted.decode_failures,
                new_transfers: new_transfers.len(),
                confirmed: confirmed.len(),
                settlements: plan.claims.len(),
                deposits: plan.deposits.len(),
            };
            let events = plan.events();

            let mut batch = if base {
                CommitBatch::base(lease.clone(), block)
            } else {
                CommitBatch::block(lease.clone(), block)
            };
            batch.raw_events = fresh.clone();
            batch.transfers = writes;
            let batch = batch.with_plan(plan);

            match self.store.commit_block(batch).await {
                Ok(()) => {
                    for event in events {
                        self.bus.publish(event);
                    }
                    if outcome.raw_events > 0 || outcome.confirmed > 0 {
                        info!(
                            chain = %self.chain,
                            height = block.height,
                            raw_events = outcome.raw_events,
                            confirmed = outcome.confirmed,
                            settlements = outcome.settlements,
                            deposits = outcome.deposits,
                            "Block committed"
                        );
                    } else {
                        debug!(chain = %self.chain, height = block.height, "Block committed");
                    }
                    return Ok(outcome);
                }
                Err(e) if e.is_conflict() && attempt < MAX_COMMIT_ATTEMPTS => {
                    warn!(
                        chain = %self.chain,
                        height = block.height,
                        attempt,
                        error = %e,
                        "Commit conflict, re-planning block"
                    );
                }
                Err(e) if e.is_conflict() => {
                    return Err(WorkerError::CommitConflict {
                        chain: self.chain,
                        height: block.height,
                        attempts: attempt,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Revert pending transfers of the orphaned range and move the watermark
    /// back to the fork point
    pub async fn process_revert(&self, lease: &Lease, range: &RevertedRange) -> Result<usize, WorkerError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut transfers = self
                .store
                .transfers_in_range(self.chain, range.from_height, range.to_height)
                .await?;
            let outcome = self.machine.revert_range(&mut transfers, range);
            let reverted: HashSet<_> = outcome.reverted.iter().copied().collect();

            let mut batch = CommitBatch::revert(lease.clone(), range.clone());
            batch.transfers = transfers
                .into_iter()
                .filter(|t| reverted.contains(&t.id))
                .map(|transfer| TransferWrite::Update {
                    transfer,
                    expected: TransferStatus::Pending,
                })
                .collect();

            match self.store.commit_block(batch).await {
                Ok(()) => {
                    info!(
                        chain = %self.chain,
                        from = range.from_height,
                        to = range.to_height,
                        fork_point = %range.fork_point,
                        reverted = reverted.len(),
                        kept_confirmed = outcome.kept_confirmed.len(),
                        "Reorg applied"
                    );
                    self.bus.publish(EngineEvent::BlocksReverted {
                        chain: self.chain,
                        from_height: range.from_height,
                        to_height: range.to_height,
                    });
                    return Ok(reverted.len());
                }
                Err(e) if e.is_conflict() && attempt < MAX_COMMIT_ATTEMPTS => {
                    warn!(chain = %self.chain, attempt, error = %e, "Revert conflict, retrying");
                }
                Err(e) if e.is_conflict() => {
                    return Err(WorkerError::CommitConflict {
                        chain: self.chain,
                        height: range.fork_point.height,
                        attempts: attempt,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Stored pending transfers plus the block's new ones, confirmed against
    /// `head`. Returns the writes for the batch and every transfer that
    /// became confirmed.
    async fn confirm(
        &self,
        head: u64,
        new_transfers: &[Transfer],
    ) -> Result<(Vec<TransferWrite>, Vec<Transfer>), WorkerError> {
        let mut pending = self.store.pending_transfers(self.chain).await?;
        let stored = pending.len();
        pending.extend(new_transfers.iter().cloned());

        let confirmed_ids: HashSet<_> = self
            .machine
            .confirm_due(&mut pending, head, Utc::now())
            .into_iter()
            .collect();

        let mut writes = Vec::with_capacity(new_transfers.len() + confirmed_ids.len());
        let mut confirmed = Vec::with_capacity(confirmed_ids.len());
        for (index, transfer) in pending.into_iter().enumerate() {
            let is_confirmed = confirmed_ids.contains(&transfer.id);
            if is_confirmed {
                confirmed.push(transfer.clone());
            }
            if index >= stored {
                writes.push(TransferWrite::Insert(transfer));
            } else if is_confirmed {
                writes.push(TransferWrite::Update {
                    transfer,
                    expected: TransferStatus::Pending,
                });
            }
        }
        Ok((writes, confirmed))
    }

    async fn plan(&self, confirmed: &[Transfer]) -> Result<ReconcilePlan, WorkerError> {
        if confirmed.is_empty() {
            return Ok(ReconcilePlan::default());
        }
        let keys: Vec<MatchKey> = confirmed
            .iter()
            .filter_map(MatchKey::for_transfer)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut ctx = self.store.match_context(self.chain, &keys).await?;
        Ok(self.reconciler.plan(confirmed, &mut ctx)?)
    }
}

fn block_time(block: &Block) -> DateTime<Utc> {
    DateTime::from_timestamp(block.timestamp, 0).unwrap_or_else(Utc::now)
}
