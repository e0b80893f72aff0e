//! Chain Head Tracker
//!
//! One tracker per chain turns provider polling into an ordered stream of
//! [`ChainMessage`]s. Delivered heights strictly increase except right after
//! a `BlocksReverted`, which rewinds the stream to the fork point.
//!
//! ```text
//! poll head ──► fetch [last+1 ..= min(head, last+cap)] ──► parent check
//!                                                            │ mismatch
//!                                                            ▼
//!                             walk back to fork point (≤ max_reorg_depth)
//!                                                            │
//!                    BlocksReverted{fork+1..=tip} + new branch as BlockAccepted
//! ```

pub mod head;
pub mod window;

pub use head::{ChainHeadTracker, TrackerConfig};
pub use window::BlockWindow;

use crate::chain::{Block, BlockRef, ChainId};
use crate::provider::ProviderError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevertedRange {
    pub chain: ChainId,
    pub from_height: u64,
    pub to_height: u64,
    /// Last block shared by the old and new branch
    pub fork_point: BlockRef,
}

impl RevertedRange {
    pub fn contains(&self, height: u64) -> bool {
        (self.from_height..=self.to_height).contains(&height)
    }

    pub fn depth(&self) -> u64 {
        self.to_height - self.from_height + 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainMessage {
    /// Next canonical block. `live` is false during backfill replay.
    BlockAccepted { block: Block, live: bool },
    BlocksReverted(RevertedRange),
    /// Every provider failed; the tracker retries after `retry_in`
    Unavailable { attempt: u32, retry_in: Duration },
    /// Unrecoverable; the tracker has stopped
    Halted { reason: String },
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Reorg on chain {chain} deeper than {max_depth} blocks below accepted tip {tip}")]
    ReorgTooDeep { chain: ChainId, max_depth: u64, tip: u64 },

    #[error("Canonical branch changed while resolving reorg at height {height}")]
    InconsistentBranch { height: u64 },
}

impl TrackerError {
    /// Transient errors are retried with backoff; the rest halt the chain
    pub fn is_transient(&self) -> bool {
        !matches!(self, TrackerError::ReorgTooDeep { .. })
    }
}
