//! Startup backfill
//!
//! `resume = max(watermark, head - depth)`. A watermark inside the window
//! resumes from the persisted recent blocks, so a reorg that happened while
//! the worker was down is detected against them like a live one. Otherwise the
//! tracker restarts at `head - depth`. Replay goes through the same pipeline
//! as live blocks; already recorded events are skipped, so replaying a
//! processed range changes nothing.

use super::WorkerError;
use super::lease::LeaseKeeper;
use super::pipeline::BlockPipeline;
use crate::tracker::{ChainHeadTracker, ChainMessage};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub resume_from: u64,
    pub head: u64,
    pub blocks: u64,
    pub reverts: u64,
}

pub struct BackfillController {
    depth: u64,
}

impl BackfillController {
    pub fn new(depth: u64) -> Self {
        Self { depth }
    }

    pub fn resume_height(watermark: Option<u64>, head: u64, depth: u64) -> u64 {
        let floor = head.saturating_sub(depth);
        watermark.map_or(floor, |height| height.max(floor))
    }

    /// Bring the chain up to the current head. `None` if shutdown was
    /// requested before the replay finished.
    pub async fn run(
        &self,
        tracker: &mut ChainHeadTracker,
        pipeline: &BlockPipeline,
        keeper: &mut LeaseKeeper,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<Option<BackfillReport>, WorkerError> {
        let chain = pipeline.chain();
        let store = pipeline.store();
        let head = tracker.query_head().await?;
        let watermark = store.watermark(chain).await?;
        let floor = head.saturating_sub(self.depth);
        let resume_from = Self::resume_height(watermark.as_ref().map(|w| w.height), head, self.depth);
        let mut report = BackfillReport {
            resume_from,
            head,
            ..Default::default()
        };

        match &watermark {
            Some(mark) if mark.height >= floor => {
                let recent = store
                    .recent_blocks(chain, tracker.window().capacity())
                    .await?;
                tracker.seed(recent);
                if tracker.tip() != Some(mark) {
                    warn!(%chain, watermark = %mark, "Recent blocks do not end at watermark, reseeding");
                    tracker.seed(vec![mark.clone()]);
                }
            }
            _ => {
                if let Some(mark) = &watermark {
                    warn!(
                        %chain,
                        watermark = mark.height,
                        resume_from,
                        "Watermark older than backfill depth, skipping ahead"
                    );
                }
                keeper.renew_if_due().await?;
                let block = tracker.fetch_block(resume_from).await?;
                tracker.reset_base(&block);
                pipeline.process_base(keeper.lease(), &block).await?;
                report.blocks += 1;
            }
        }

        info!(%chain, resume_from, head, "Backfill started");

        while tracker.tip().is_some_and(|tip| tip.height < head) {
            if *shutdown.borrow() {
                info!(%chain, processed = report.blocks, "Backfill interrupted by shutdown");
                return Ok(None);
            }
            keeper.renew_if_due().await?;

            let mut out = Vec::new();
            let advanced = tracker.advance(head, false, &mut out).await;
            for message in &out {
                pipeline.apply(keeper.lease(), message).await?;
                match message {
                    ChainMessage::BlockAccepted { .. } => report.blocks += 1,
                    ChainMessage::BlocksReverted(_) => report.reverts += 1,
                    _ => {}
                }
            }
            advanced?;
        }

        info!(
            %chain,
            resume_from,
            head,
            blocks = report.blocks,
            reverts = report.reverts,
            "Backfill complete"
        );
        Ok(Some(report))
    }
}
