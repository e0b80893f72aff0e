//! Per-chain worker
//!
//! ```text
//! lease ──► backfill ──► ChainHeadTracker ──mpsc──► BlockPipeline ──► Store::commit_block
//!                                                        │
//!                                                        └──► EventBus (after commit)
//! ```
//!
//! One worker per chain. Every block is extracted, classified, confirmed and
//! reconciled, then committed in one atomic batch fenced by the chain lease.

pub mod backfill;
pub mod chain_worker;
pub mod lease;
pub mod pipeline;

pub use backfill::{BackfillController, BackfillReport};
pub use chain_worker::{ChainWorker, WorkerExit};
pub use lease::LeaseKeeper;
pub use pipeline::{BlockOutcome, BlockPipeline};

use crate::chain::ChainId;
use crate::extractor::ExtractError;
use crate::reconcile::ReconcileError;
use crate::store::StoreError;
use crate::tracker::TrackerError;
use crate::transfer::TransferError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("Extraction failed: {0}")]
    Extract(#[from] ExtractError),

    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Chain {chain} halted: {reason}")]
    Halted { chain: ChainId, reason: String },

    #[error("Block {height} on chain {chain} still conflicting after {attempts} commit attempts")]
    CommitConflict {
        chain: ChainId,
        height: u64,
        attempts: u32,
    },
}

impl WorkerError {
    /// Transient errors are retried with backoff; everything else halts the chain
    pub fn is_transient(&self) -> bool {
        match self {
            WorkerError::Extract(_) => true,
            WorkerError::Tracker(e) => e.is_transient(),
            WorkerError::Store(StoreError::Database(_)) => true,
            WorkerError::CommitConflict { .. } => true,
            _ => false,
        }
    }

    pub fn is_lease_lost(&self) -> bool {
        matches!(self, WorkerError::Store(StoreError::LeaseLost { .. }))
    }
}
