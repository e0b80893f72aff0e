//! Persistence
//!
//! The [`Store`] trait is the only way pipeline state reaches disk. Chain
//! workers write through [`Store::commit_block`]: one call per block, applied
//! atomically and fenced by the chain lease, so a worker that lost its lease
//! can never write. Each batch must link onto the stored watermark (see
//! [`WatermarkLink`]), so blocks land in chain order. Route claims inside a
//! commit are compare-and-swap; a lost claim fails the whole batch with
//! [`StoreError::ClaimConflict`].
//!
//! Two implementations: [`MemoryStore`] for tests and local runs, and
//! [`PgStore`] on PostgreSQL.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::chain::{Block, BlockRef, ChainId, TokenRef};
use crate::extractor::{RawEvent, RawEventKey};
use crate::reconcile::{
    Deposit, DepositTracker, MatchContext, MatchKey, OrderId, PaymentOrder, ReconcilePlan, Route,
    RouteClaim, RouteId,
};
use crate::tracker::RevertedRange;
use crate::transfer::{Transfer, TransferId, TransferStatus};
use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Block refs kept per chain below the watermark for reorg resolution on restart
pub const RECENT_BLOCK_RETENTION: u64 = 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Lease for chain {chain} is not held by this worker")]
    LeaseLost { chain: ChainId },

    #[error("Route {route_id} was claimed concurrently")]
    ClaimConflict { route_id: RouteId },

    #[error("Transfer {id} changed concurrently")]
    TransferConflict { id: TransferId },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Batch at height {height} does not link onto watermark {watermark:?} of chain {chain}")]
    WatermarkMismatch {
        chain: ChainId,
        height: u64,
        watermark: Option<u64>,
    },
}

impl StoreError {
    /// Conflicts are resolved by re-planning the batch
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::ClaimConflict { .. } | StoreError::TransferConflict { .. }
        )
    }
}

/// Exclusive right to process one chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub chain: ChainId,
    pub token: Uuid,
    pub holder: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferWrite {
    Insert(Transfer),
    /// Compare-and-swap on the stored status
    Update {
        transfer: Transfer,
        expected: TransferStatus,
    },
}

impl TransferWrite {
    pub fn transfer(&self) -> &Transfer {
        match self {
            TransferWrite::Insert(transfer) | TransferWrite::Update { transfer, .. } => transfer,
        }
    }
}

/// How a batch's watermark relates to the stored one
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatermarkLink {
    /// Child of the stored watermark. A block at or below the watermark is a
    /// replay and must match the hash recorded at its height.
    Extends { parent_hash: String },
    /// Backfill base, ahead of a stale or missing watermark
    Rebase,
    /// Fork point of a revert, at or below the stored watermark
    Rewind,
}

/// Everything one block (or one revert) changes, applied atomically
#[derive(Debug, Clone)]
pub struct CommitBatch {
    pub lease: Lease,
    /// Watermark after the batch: the processed block, or the fork point of a revert
    pub watermark: BlockRef,
    pub link: WatermarkLink,
    pub revert: Option<RevertedRange>,
    pub raw_events: Vec<RawEvent>,
    pub transfers: Vec<TransferWrite>,
    pub claims: Vec<RouteClaim>,
    pub deposits: Vec<Deposit>,
}

impl CommitBatch {
    pub fn new(lease: Lease, watermark: BlockRef, link: WatermarkLink) -> Self {
        Self {
            lease,
            watermark,
            link,
            revert: None,
            raw_events: Vec::new(),
            transfers: Vec::new(),
            claims: Vec::new(),
            deposits: Vec::new(),
        }
    }

    /// Next canonical block
    pub fn block(lease: Lease, block: &Block) -> Self {
        Self::new(
            lease,
            block.block_ref(),
            WatermarkLink::Extends {
                parent_hash: block.parent_hash.clone(),
            },
        )
    }

    /// First block of a backfill that skips ahead of the watermark
    pub fn base(lease: Lease, block: &Block) -> Self {
        Self::new(lease, block.block_ref(), WatermarkLink::Rebase)
    }

    pub fn revert(lease: Lease, range: RevertedRange) -> Self {
        let mut batch = Self::new(lease, range.fork_point.clone(), WatermarkLink::Rewind);
        batch.revert = Some(range);
        batch
    }

    /// Check the batch against the stored watermark. `recorded` is the hash
    /// processed at the batch height, if still retained. `Ok(false)` for a
    /// replay, which must leave the watermark alone.
    pub fn advances(
        &self,
        current: Option<&BlockRef>,
        recorded: Option<&str>,
    ) -> Result<bool, StoreError> {
        let target = &self.watermark;
        let mismatch = || StoreError::WatermarkMismatch {
            chain: self.chain(),
            height: target.height,
            watermark: current.map(|c| c.height),
        };
        match (&self.link, current) {
            (WatermarkLink::Extends { .. } | WatermarkLink::Rebase, None) => Ok(true),
            (WatermarkLink::Extends { parent_hash }, Some(cur)) => {
                if target.height == cur.height + 1 && *parent_hash == cur.hash {
                    Ok(true)
                } else if target.height <= cur.height && recorded == Some(target.hash.as_str()) {
                    Ok(false)
                } else {
                    Err(mismatch())
                }
            }
            (WatermarkLink::Rebase, Some(cur)) if target.height > cur.height => Ok(true),
            (WatermarkLink::Rewind, Some(cur))
                if target.height <= cur.height
                    && recorded.is_none_or(|hash| hash == target.hash) =>
            {
                Ok(true)
            }
            _ => Err(mismatch()),
        }
    }

    pub fn chain(&self) -> ChainId {
        self.lease.chain
    }

    pub fn with_plan(mut self, plan: ReconcilePlan) -> Self {
        self.claims = plan.claims;
        self.deposits = plan.deposits;
        self
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    // === Leases ===

    /// Take the chain lease if free or expired. `None` while someone else holds it.
    async fn acquire_lease(
        &self,
        chain: ChainId,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, StoreError>;

    /// Extend a held lease; `LeaseLost` if another holder took over
    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> Result<(), StoreError>;

    async fn release_lease(&self, lease: &Lease) -> Result<(), StoreError>;

    // === Chain progress ===

    async fn watermark(&self, chain: ChainId) -> Result<Option<BlockRef>, StoreError>;

    /// Most recent processed block refs, highest last
    async fn recent_blocks(&self, chain: ChainId, limit: usize) -> Result<Vec<BlockRef>, StoreError>;

    /// Subset of `keys` already recorded (orphaned events excluded)
    async fn existing_raw_events(
        &self,
        keys: &[RawEventKey],
    ) -> Result<HashSet<RawEventKey>, StoreError>;

    async fn orphaned_events(&self, chain: ChainId) -> Result<Vec<RawEvent>, StoreError>;

    // === Transfers ===

    /// Pending blockchain transfers of `chain`
    async fn pending_transfers(&self, chain: ChainId) -> Result<Vec<Transfer>, StoreError>;

    /// Blockchain transfers of `chain` whose origin block is in `from..=to`
    async fn transfers_in_range(
        &self,
        chain: ChainId,
        from: u64,
        to: u64,
    ) -> Result<Vec<Transfer>, StoreError>;

    async fn transfer(&self, id: TransferId) -> Result<Option<Transfer>, StoreError>;

    async fn transfer_by_dedupe_key(&self, key: &str) -> Result<Option<Transfer>, StoreError>;

    /// Confirmed transfers into `key` for `token` that settled no route, oldest first
    async fn unmatched_confirmed(
        &self,
        key: &MatchKey,
        token: &TokenRef,
    ) -> Result<Vec<Transfer>, StoreError>;

    // === Reconciliation ===

    /// Open routes for `keys` with their orders, plus the chain's deposit trackers
    async fn match_context(&self, chain: ChainId, keys: &[MatchKey]) -> Result<MatchContext, StoreError>;

    /// Apply one block's changes. Fails as a whole.
    async fn commit_block(&self, batch: CommitBatch) -> Result<(), StoreError>;

    /// Apply transfers and a plan outside any chain lease (Raiden, internal
    /// bookings, rescans after a route opens). Same atomicity as a block commit.
    async fn commit_reconciliation(
        &self,
        transfers: Vec<TransferWrite>,
        plan: &ReconcilePlan,
    ) -> Result<(), StoreError>;

    // === Orders, routes, trackers ===

    async fn insert_order(&self, order: &PaymentOrder) -> Result<(), StoreError>;

    async fn order(&self, id: OrderId) -> Result<Option<PaymentOrder>, StoreError>;

    /// OPEN -> EXPIRED. `false` if the order was not open.
    async fn expire_order(&self, id: OrderId) -> Result<bool, StoreError>;

    async fn insert_route(&self, route: &Route) -> Result<(), StoreError>;

    async fn route(&self, id: RouteId) -> Result<Option<Route>, StoreError>;

    async fn routes_for_order(&self, order_id: OrderId) -> Result<Vec<Route>, StoreError>;

    async fn insert_deposit_tracker(&self, tracker: &DepositTracker) -> Result<(), StoreError>;

    async fn deposits_for_transfer(&self, transfer_id: TransferId) -> Result<Vec<Deposit>, StoreError>;
}
