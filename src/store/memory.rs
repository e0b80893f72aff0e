//! In-memory store
//!
//! One `tokio::sync::Mutex` over all tables. Commits validate every lease,
//! status and claim precondition before touching anything, so a failed commit
//! leaves no trace.

use super::{CommitBatch, Lease, RECENT_BLOCK_RETENTION, Store, StoreError, TransferWrite};
use crate::chain::{BlockRef, ChainId, TokenRef};
use crate::extractor::{RawEvent, RawEventKey};
use crate::reconcile::{
    Deposit, DepositId, DepositTracker, MatchContext, MatchKey, OrderId, OrderStatus,
    PaymentOrder, ReconcilePlan, Route, RouteClaim, RouteId, RouteStatus, TrackerId,
};
use crate::transfer::{Transfer, TransferId, TransferStatus};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

struct LeaseRecord {
    lease: Lease,
    expires_at: Instant,
}

#[derive(Default)]
struct MemoryState {
    leases: HashMap<ChainId, LeaseRecord>,
    watermarks: HashMap<ChainId, BlockRef>,
    recent: HashMap<ChainId, BTreeMap<u64, BlockRef>>,
    raw_events: HashMap<RawEventKey, RawEvent>,
    orphans: Vec<RawEvent>,
    transfers: HashMap<TransferId, Transfer>,
    dedupe: HashMap<String, TransferId>,
    orders: HashMap<OrderId, PaymentOrder>,
    routes: HashMap<RouteId, Route>,
    trackers: HashMap<TrackerId, DepositTracker>,
    deposits: HashMap<DepositId, Deposit>,
}

impl MemoryState {
    fn check_lease(&self, lease: &Lease) -> Result<(), StoreError> {
        match self.leases.get(&lease.chain) {
            Some(record) if record.lease.token == lease.token && record.expires_at > Instant::now() => {
                Ok(())
            }
            _ => Err(StoreError::LeaseLost { chain: lease.chain }),
        }
    }

    fn check_transfers(&self, writes: &[TransferWrite]) -> Result<(), StoreError> {
        for write in writes {
            if let TransferWrite::Update { transfer, expected } = write {
                let current = self
                    .transfers
                    .get(&transfer.id)
                    .map(|t| t.status)
                    .ok_or_else(|| StoreError::NotFound {
                        entity: "transfer",
                        id: transfer.id.to_string(),
                    })?;
                if current != *expected {
                    return Err(StoreError::TransferConflict { id: transfer.id });
                }
            }
        }
        Ok(())
    }

    fn check_claims(&self, claims: &[RouteClaim]) -> Result<(), StoreError> {
        for claim in claims {
            let route_open = self
                .routes
                .get(&claim.route_id)
                .is_some_and(|r| r.status == RouteStatus::Open && r.consumed_by.is_none());
            let order_open = self
                .orders
                .get(&claim.order_id)
                .is_some_and(|o| o.status == OrderStatus::Open);
            if !route_open || !order_open || self.is_claimed(claim.transfer_id) {
                return Err(StoreError::ClaimConflict {
                    route_id: claim.route_id,
                });
            }
        }
        Ok(())
    }

    fn write_transfers(&mut self, writes: Vec<TransferWrite>) {
        for write in writes {
            match write {
                TransferWrite::Insert(transfer) => {
                    let key = transfer.dedupe_key();
                    if self.dedupe.contains_key(&key) {
                        debug!(transfer_id = %transfer.id, key, "Transfer already recorded");
                        continue;
                    }
                    self.dedupe.insert(key, transfer.id);
                    self.transfers.insert(transfer.id, transfer);
                }
                TransferWrite::Update { transfer, .. } => {
                    self.transfers.insert(transfer.id, transfer);
                }
            }
        }
    }

    fn write_plan(&mut self, claims: &[RouteClaim], deposits: &[Deposit]) {
        for claim in claims {
            if let Some(route) = self.routes.get_mut(&claim.route_id) {
                route.status = RouteStatus::Consumed;
                route.consumed_by = Some(claim.transfer_id);
            }
            if let Some(order) = self.orders.get_mut(&claim.order_id) {
                order.apply_payment(claim.amount);
            }
        }
        for deposit in deposits {
            let duplicate = self
                .deposits
                .values()
                .any(|d| d.tracker_id == deposit.tracker_id && d.transfer_id == deposit.transfer_id);
            if !duplicate {
                self.deposits.insert(deposit.id, deposit.clone());
            }
        }
    }

    fn apply_revert(&mut self, chain: ChainId, from: u64, to: u64) {
        let orphaned: Vec<RawEventKey> = self
            .raw_events
            .values()
            .filter(|e| e.chain == chain && (from..=to).contains(&e.block_height))
            .map(|e| e.key())
            .collect();
        for key in orphaned {
            if let Some(event) = self.raw_events.remove(&key) {
                self.orphans.push(event);
            }
        }
        if let Some(recent) = self.recent.get_mut(&chain) {
            recent.retain(|height, _| *height < from);
        }
    }

    fn is_claimed(&self, transfer_id: TransferId) -> bool {
        self.routes
            .values()
            .any(|r| r.consumed_by == Some(transfer_id))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All raw events currently recorded for `chain`, by height then log index
    pub async fn raw_events(&self, chain: ChainId) -> Vec<RawEvent> {
        let state = self.state.lock().await;
        let mut events: Vec<RawEvent> = state
            .raw_events
            .values()
            .filter(|e| e.chain == chain)
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.block_height, e.log_index));
        events
    }

    pub async fn transfers(&self) -> Vec<Transfer> {
        let state = self.state.lock().await;
        let mut transfers: Vec<Transfer> = state.transfers.values().cloned().collect();
        transfers.sort_by_key(|t| (t.created_at, t.id));
        transfers
    }

    /// Force the chain lease to expire, as if the holder had stalled
    pub async fn expire_lease(&self, chain: ChainId) {
        let mut state = self.state.lock().await;
        if let Some(record) = state.leases.get_mut(&chain) {
            record.expires_at = Instant::now();
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn acquire_lease(
        &self,
        chain: ChainId,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, StoreError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        if let Some(record) = state.leases.get(&chain)
            && record.expires_at > now
        {
            return Ok(None);
        }
        let lease = Lease {
            chain,
            token: Uuid::new_v4(),
            holder: holder.to_string(),
        };
        state.leases.insert(
            chain,
            LeaseRecord {
                lease: lease.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(Some(lease))
    }

    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        match state.leases.get_mut(&lease.chain) {
            Some(record) if record.lease.token == lease.token => {
                record.expires_at = Instant::now() + ttl;
                Ok(())
            }
            _ => Err(StoreError::LeaseLost { chain: lease.chain }),
        }
    }

    async fn release_lease(&self, lease: &Lease) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state
            .leases
            .get(&lease.chain)
            .is_some_and(|r| r.lease.token == lease.token)
        {
            state.leases.remove(&lease.chain);
        }
        Ok(())
    }

    async fn watermark(&self, chain: ChainId) -> Result<Option<BlockRef>, StoreError> {
        Ok(self.state.lock().await.watermarks.get(&chain).cloned())
    }

    async fn recent_blocks(&self, chain: ChainId, limit: usize) -> Result<Vec<BlockRef>, StoreError> {
        let state = self.state.lock().await;
        let Some(recent) = state.recent.get(&chain) else {
            return Ok(Vec::new());
        };
        let mut refs: Vec<BlockRef> = recent.values().rev().take(limit).cloned().collect();
        refs.reverse();
        Ok(refs)
    }

    async fn existing_raw_events(
        &self,
        keys: &[RawEventKey],
    ) -> Result<HashSet<RawEventKey>, StoreError> {
        let state = self.state.lock().await;
        Ok(keys
            .iter()
            .filter(|k| state.raw_events.contains_key(k))
            .cloned()
            .collect())
    }

    async fn orphaned_events(&self, chain: ChainId) -> Result<Vec<RawEvent>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .orphans
            .iter()
            .filter(|e| e.chain == chain)
            .cloned()
            .collect())
    }

    async fn pending_transfers(&self, chain: ChainId) -> Result<Vec<Transfer>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .transfers
            .values()
            .filter(|t| {
                t.status == TransferStatus::Pending
                    && t.chain() == chain
                    && t.origin_height().is_some()
            })
            .cloned()
            .collect())
    }

    async fn transfers_in_range(
        &self,
        chain: ChainId,
        from: u64,
        to: u64,
    ) -> Result<Vec<Transfer>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .transfers
            .values()
            .filter(|t| {
                t.chain() == chain
                    && t.origin_height().is_some_and(|h| (from..=to).contains(&h))
            })
            .cloned()
            .collect())
    }

    async fn transfer(&self, id: TransferId) -> Result<Option<Transfer>, StoreError> {
        Ok(self.state.lock().await.transfers.get(&id).cloned())
    }

    async fn transfer_by_dedupe_key(&self, key: &str) -> Result<Option<Transfer>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .dedupe
            .get(key)
            .and_then(|id| state.transfers.get(id))
            .cloned())
    }

    async fn unmatched_confirmed(
        &self,
        key: &MatchKey,
        token: &TokenRef,
    ) -> Result<Vec<Transfer>, StoreError> {
        let state = self.state.lock().await;
        let mut transfers: Vec<Transfer> = state
            .transfers
            .values()
            .filter(|t| {
                t.status == TransferStatus::Confirmed
                    && t.token == *token
                    && MatchKey::for_transfer(t).as_ref() == Some(key)
                    && !state.is_claimed(t.id)
            })
            .cloned()
            .collect();
        transfers.sort_by_key(|t| (t.created_at, t.id));
        Ok(transfers)
    }

    async fn match_context(&self, chain: ChainId, keys: &[MatchKey]) -> Result<MatchContext, StoreError> {
        let state = self.state.lock().await;
        let keys: HashSet<&MatchKey> = keys.iter().collect();
        let routes: Vec<Route> = state
            .routes
            .values()
            .filter(|r| r.status == RouteStatus::Open && keys.contains(&r.destination.match_key()))
            .cloned()
            .collect();
        let orders = routes
            .iter()
            .filter_map(|r| state.orders.get(&r.order_id))
            .map(|o| (o.id, o.clone()))
            .collect();
        let trackers = state
            .trackers
            .values()
            .filter(|t| t.chain == chain)
            .cloned()
            .collect();
        Ok(MatchContext {
            orders,
            routes,
            trackers,
            deposited: HashSet::new(),
        })
    }

    async fn commit_block(&self, batch: CommitBatch) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let chain = batch.chain();

        state.check_lease(&batch.lease)?;
        state.check_transfers(&batch.transfers)?;
        state.check_claims(&batch.claims)?;
        let recorded = state
            .recent
            .get(&chain)
            .and_then(|recent| recent.get(&batch.watermark.height))
            .map(|block| block.hash.as_str());
        let advance = batch.advances(state.watermarks.get(&chain), recorded)?;

        if let Some(range) = &batch.revert {
            state.apply_revert(chain, range.from_height, range.to_height);
        }
        for event in batch.raw_events {
            state.raw_events.entry(event.key()).or_insert(event);
        }
        state.write_transfers(batch.transfers);
        state.write_plan(&batch.claims, &batch.deposits);

        if !advance {
            debug!(%chain, height = batch.watermark.height, "Replayed block, watermark unchanged");
            return Ok(());
        }
        let watermark = batch.watermark;
        let recent = state.recent.entry(chain).or_default();
        recent.insert(watermark.height, watermark.clone());
        let floor = watermark.height.saturating_sub(RECENT_BLOCK_RETENTION);
        recent.retain(|height, _| *height >= floor);
        state.watermarks.insert(chain, watermark);
        Ok(())
    }

    async fn commit_reconciliation(
        &self,
        transfers: Vec<TransferWrite>,
        plan: &ReconcilePlan,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check_transfers(&transfers)?;
        state.check_claims(&plan.claims)?;
        state.write_transfers(transfers);
        state.write_plan(&plan.claims, &plan.deposits);
        Ok(())
    }

    async fn insert_order(&self, order: &PaymentOrder) -> Result<(), StoreError> {
        self.state.lock().await.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn order(&self, id: OrderId) -> Result<Option<PaymentOrder>, StoreError> {
        Ok(self.state.lock().await.orders.get(&id).cloned())
    }

    async fn expire_order(&self, id: OrderId) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.orders.get_mut(&id) {
            Some(order) if order.status == OrderStatus::Open => {
                order.status = OrderStatus::Expired;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound {
                entity: "order",
                id: id.to_string(),
            }),
        }
    }

    async fn insert_route(&self, route: &Route) -> Result<(), StoreError> {
        self.state.lock().await.routes.insert(route.id, route.clone());
        Ok(())
    }

    async fn route(&self, id: RouteId) -> Result<Option<Route>, StoreError> {
        Ok(self.state.lock().await.routes.get(&id).cloned())
    }

    async fn routes_for_order(&self, order_id: OrderId) -> Result<Vec<Route>, StoreError> {
        let state = self.state.lock().await;
        let mut routes: Vec<Route> = state
            .routes
            .values()
            .filter(|r| r.order_id == order_id)
            .cloned()
            .collect();
        routes.sort_by_key(|r| (r.created_at, r.id));
        Ok(routes)
    }

    async fn insert_deposit_tracker(&self, tracker: &DepositTracker) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .trackers
            .insert(tracker.id, tracker.clone());
        Ok(())
    }

    async fn deposits_for_transfer(&self, transfer_id: TransferId) -> Result<Vec<Deposit>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .deposits
            .values()
            .filter(|d| d.transfer_id == transfer_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Address, Block, TokenAmount};
    use crate::config::AmountPolicy;
    use crate::extractor::{ContractKind, EventPayload};
    use crate::reconcile::RouteDestination;
    use crate::tracker::RevertedRange;
    use chrono::Utc;

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    fn block(height: u64) -> Block {
        Block::new(
            ChainId(1),
            height,
            &format!("0x{:x}", height),
            &format!("0x{:x}", height.saturating_sub(1)),
            1_700_000_000,
        )
    }

    fn event(height: u64, log_index: u64) -> RawEvent {
        RawEvent {
            chain: ChainId(1),
            block_height: height,
            block_hash: format!("0x{:x}", height),
            tx_hash: format!("0xt{}", height),
            log_index,
            address: addr("0x6b175474e89094c44da98b954eedeac495271d0f"),
            contract_kind: ContractKind::Erc20,
            token: TokenRef::Native { chain: ChainId(1) },
            payload: EventPayload::Erc20Transfer {
                from: addr("0x1111111111111111111111111111111111111111"),
                to: addr("0x2222222222222222222222222222222222222222"),
                value: TokenAmount(1),
            },
        }
    }

    async fn leased(store: &MemoryStore) -> Lease {
        store
            .acquire_lease(ChainId(1), "test", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_lease_is_exclusive_and_fences_commits() {
        let store = MemoryStore::new();
        let lease = leased(&store).await;
        assert!(store
            .acquire_lease(ChainId(1), "other", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());

        store.expire_lease(ChainId(1)).await;
        let taken = store
            .acquire_lease(ChainId(1), "other", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_ne!(taken.token, lease.token);

        let err = store
            .commit_block(CommitBatch::base(lease.clone(), &block(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LeaseLost { .. }));
        assert!(store.renew_lease(&lease, Duration::from_secs(1)).await.is_err());
        assert_eq!(store.watermark(ChainId(1)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_revert_moves_events_to_orphans_and_regresses_watermark() {
        let store = MemoryStore::new();
        let lease = leased(&store).await;
        for height in 48..=52 {
            let mut batch = CommitBatch::block(lease.clone(), &block(height));
            batch.raw_events.push(event(height, 0));
            store.commit_block(batch).await.unwrap();
        }

        let revert = CommitBatch::revert(
            lease.clone(),
            RevertedRange {
                chain: ChainId(1),
                from_height: 50,
                to_height: 52,
                fork_point: block(49).block_ref(),
            },
        );
        store.commit_block(revert).await.unwrap();

        assert_eq!(store.watermark(ChainId(1)).await.unwrap().map(|w| w.height), Some(49));
        assert_eq!(store.raw_events(ChainId(1)).await.len(), 2);
        assert_eq!(store.orphaned_events(ChainId(1)).await.unwrap().len(), 3);
        let recent = store.recent_blocks(ChainId(1), 10).await.unwrap();
        assert_eq!(recent.last().map(|b| b.height), Some(49));

        // Orphaned keys can be observed again on the new branch
        let existing = store.existing_raw_events(&[event(50, 0).key()]).await.unwrap();
        assert!(existing.is_empty());
    }

    #[tokio::test]
    async fn test_commit_must_link_onto_watermark() {
        let store = MemoryStore::new();
        let lease = leased(&store).await;
        store.commit_block(CommitBatch::base(lease.clone(), &block(10))).await.unwrap();

        let gap = store
            .commit_block(CommitBatch::block(lease.clone(), &block(12)))
            .await
            .unwrap_err();
        assert!(matches!(
            gap,
            StoreError::WatermarkMismatch { height: 12, watermark: Some(10), .. }
        ));

        let mut stranger = block(11);
        stranger.parent_hash = "0xdead".to_string();
        let mut batch = CommitBatch::block(lease.clone(), &stranger);
        batch.raw_events.push(event(11, 0));
        let err = store.commit_block(batch).await.unwrap_err();
        assert!(matches!(err, StoreError::WatermarkMismatch { .. }));
        assert!(store.raw_events(ChainId(1)).await.is_empty());

        store.commit_block(CommitBatch::block(lease.clone(), &block(11))).await.unwrap();

        // Replaying a processed block is accepted and leaves the watermark alone
        store.commit_block(CommitBatch::block(lease.clone(), &block(10))).await.unwrap();
        assert_eq!(store.watermark(ChainId(1)).await.unwrap(), Some(block(11).block_ref()));

        let ahead = CommitBatch::revert(
            lease.clone(),
            RevertedRange {
                chain: ChainId(1),
                from_height: 21,
                to_height: 22,
                fork_point: block(20).block_ref(),
            },
        );
        let err = store.commit_block(ahead).await.unwrap_err();
        assert!(matches!(err, StoreError::WatermarkMismatch { .. }));

        let stale = store
            .commit_block(CommitBatch::base(lease.clone(), &block(5)))
            .await
            .unwrap_err();
        assert!(matches!(stale, StoreError::WatermarkMismatch { .. }));
    }

    #[tokio::test]
    async fn test_claim_cas_rejects_consumed_route() {
        let store = MemoryStore::new();
        let token = TokenRef::Native { chain: ChainId(1) };
        let order = PaymentOrder::new(TokenAmount(10), token.clone(), "r".into());
        let route = Route {
            id: RouteId::new(),
            order_id: order.id,
            destination: RouteDestination::Blockchain {
                chain: ChainId(1),
                address: addr("0x2222222222222222222222222222222222222222"),
            },
            token,
            policy: AmountPolicy::AtLeast,
            window: None,
            status: RouteStatus::Open,
            consumed_by: None,
            created_at: Utc::now(),
        };
        store.insert_order(&order).await.unwrap();
        store.insert_route(&route).await.unwrap();

        let claim = |transfer_id| RouteClaim {
            route_id: route.id,
            order_id: order.id,
            transfer_id,
            chain: ChainId(1),
            amount: TokenAmount(10),
            confirmed_at_height: None,
        };
        let first = ReconcilePlan {
            claims: vec![claim(TransferId::new())],
            deposits: Vec::new(),
        };
        store.commit_reconciliation(Vec::new(), &first).await.unwrap();

        let second = ReconcilePlan {
            claims: vec![claim(TransferId::new())],
            deposits: Vec::new(),
        };
        let err = store
            .commit_reconciliation(Vec::new(), &second)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let stored = store.order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Paid);
        assert_eq!(stored.total_paid, TokenAmount(10));
    }
}
