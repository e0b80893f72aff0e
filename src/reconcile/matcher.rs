//! Route and deposit matching
//!
//! Planning is pure: it works on a [`MatchContext`] snapshot loaded from the
//! store and returns a [`ReconcilePlan`]. The store applies the plan inside
//! the block commit, where each route claim is a compare-and-swap.

use super::error::ReconcileError;
use super::types::{
    Deposit, DepositId, DepositTracker, MatchKey, OpenRouteRequest, OrderId, PaymentOrder, Route,
    RouteDestination, RouteId, RouteStatus,
};
use crate::chain::{ChainId, TokenAmount};
use crate::config::{AmountPolicy, ReconciliationConfig, TieBreak};
use crate::notify::EngineEvent;
use crate::transfer::{Transfer, TransferId, TransferStatus};
use chrono::Utc;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Open routes, their orders and the deposit trackers relevant to a batch
#[derive(Debug, Default, Clone)]
pub struct MatchContext {
    pub orders: HashMap<OrderId, PaymentOrder>,
    pub routes: Vec<Route>,
    pub trackers: Vec<DepositTracker>,
    /// Transfers that already produced a deposit
    pub deposited: HashSet<TransferId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteClaim {
    pub route_id: RouteId,
    pub order_id: OrderId,
    pub transfer_id: TransferId,
    pub chain: ChainId,
    pub amount: TokenAmount,
    pub confirmed_at_height: Option<u64>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub claims: Vec<RouteClaim>,
    pub deposits: Vec<Deposit>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.claims.is_empty() && self.deposits.is_empty()
    }

    /// Notifications to publish once the plan is committed
    pub fn events(&self) -> Vec<EngineEvent> {
        let settlements = self.claims.iter().map(|claim| EngineEvent::Settlement {
            order_id: claim.order_id,
            route_id: claim.route_id,
            transfer_id: claim.transfer_id,
            chain: claim.chain,
            confirmed_at_height: claim.confirmed_at_height,
        });
        let deposits = self.deposits.iter().map(|deposit| EngineEvent::DepositRecorded {
            deposit_id: deposit.id,
            transfer_id: deposit.transfer_id,
            external_ref: deposit.external_ref.clone(),
            chain: deposit.chain,
        });
        settlements.chain(deposits).collect()
    }

    /// Every route and every transfer appears in at most one claim
    pub fn validate(&self) -> Result<(), ReconcileError> {
        let mut routes = HashSet::new();
        let mut transfers = HashSet::new();
        for claim in &self.claims {
            if !routes.insert(claim.route_id) || !transfers.insert(claim.transfer_id) {
                return Err(ReconcileError::DuplicateRouteConsumption {
                    route_id: claim.route_id,
                    transfer_id: claim.transfer_id,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Reconciler {
    config: ReconciliationConfig,
}

impl Reconciler {
    pub fn new(config: ReconciliationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ReconciliationConfig {
        &self.config
    }

    /// Validate a route request against its order and build the route
    pub fn build_route(
        &self,
        order: &PaymentOrder,
        request: OpenRouteRequest,
    ) -> Result<Route, ReconcileError> {
        if !order.is_open() {
            return Err(ReconcileError::OrderNotOpen {
                id: order.id,
                status: order.status,
            });
        }
        if request.token != order.token {
            return Err(ReconcileError::TokenMismatch {
                order: order.token.clone(),
                route: request.token,
            });
        }
        let destination = request.destination.into_destination();
        if destination.chain() != request.token.chain() {
            return Err(ReconcileError::InvalidRoute(format!(
                "destination chain {} differs from token chain {}",
                destination.chain(),
                request.token.chain()
            )));
        }
        if let Some(window) = request.payment_window {
            if matches!(destination, RouteDestination::Raiden { .. }) {
                return Err(ReconcileError::InvalidRoute(
                    "payment windows apply to blockchain routes only".to_string(),
                ));
            }
            if window.start_height > window.expiration_height {
                return Err(ReconcileError::InvalidRoute(format!(
                    "window starts at {} after expiration {}",
                    window.start_height, window.expiration_height
                )));
            }
        }

        Ok(Route {
            id: RouteId::new(),
            order_id: order.id,
            destination,
            token: request.token,
            policy: request
                .amount_policy
                .unwrap_or(self.config.default_amount_policy),
            window: request.payment_window,
            status: RouteStatus::Open,
            consumed_by: None,
            created_at: Utc::now(),
        })
    }

    /// Match confirmed transfers, oldest first, against `ctx`.
    /// Claimed routes and paid orders are updated in `ctx` as the plan grows.
    pub fn plan(
        &self,
        transfers: &[Transfer],
        ctx: &mut MatchContext,
    ) -> Result<ReconcilePlan, ReconcileError> {
        let mut plan = ReconcilePlan::default();
        let mut confirmed: Vec<&Transfer> = transfers
            .iter()
            .filter(|t| t.status == TransferStatus::Confirmed)
            .collect();
        confirmed.sort_by_key(|t| (t.created_at, t.id));

        for transfer in confirmed {
            if let Some(key) = MatchKey::for_transfer(transfer)
                && let Some(index) = self.select_route(transfer, &key, ctx)
            {
                let route = &mut ctx.routes[index];
                route.status = RouteStatus::Consumed;
                route.consumed_by = Some(transfer.id);
                let claim = RouteClaim {
                    route_id: route.id,
                    order_id: route.order_id,
                    transfer_id: transfer.id,
                    chain: route.destination.chain(),
                    amount: transfer.amount,
                    confirmed_at_height: transfer.confirmed_at_height(),
                };
                if let Some(order) = ctx.orders.get_mut(&claim.order_id) {
                    order.apply_payment(transfer.amount);
                }
                debug!(
                    transfer_id = %claim.transfer_id,
                    route_id = %claim.route_id,
                    order_id = %claim.order_id,
                    "Transfer matched route"
                );
                plan.claims.push(claim);
            }

            if ctx.deposited.contains(&transfer.id) {
                continue;
            }
            if let Some(tracker) = ctx.trackers.iter().find(|t| t.matches(transfer)) {
                ctx.deposited.insert(transfer.id);
                plan.deposits.push(Deposit {
                    id: DepositId::new(),
                    tracker_id: tracker.id,
                    external_ref: tracker.external_ref.clone(),
                    transfer_id: transfer.id,
                    chain: tracker.chain,
                    height: transfer.origin_height(),
                    created_at: Utc::now(),
                });
            }
        }

        plan.validate()?;
        Ok(plan)
    }

    /// Partial fills only relax `AtLeast`; an `Exact` route takes the due amount or nothing
    fn accepts_amount(&self, policy: AmountPolicy, amount: TokenAmount, due: TokenAmount) -> bool {
        if amount.is_zero() {
            return false;
        }
        match policy {
            AmountPolicy::Exact => amount == due,
            AmountPolicy::AtLeast => amount >= due || self.config.allow_partial_fills,
        }
    }

    fn select_route(&self, transfer: &Transfer, key: &MatchKey, ctx: &MatchContext) -> Option<usize> {
        let origin_height = transfer.origin_height();
        let candidates = ctx.routes.iter().enumerate().filter_map(|(index, route)| {
            if !route.is_open()
                || route.token != transfer.token
                || route.destination.match_key() != *key
                || !route.accepts_height(origin_height)
            {
                return None;
            }
            let order = ctx.orders.get(&route.order_id).filter(|o| o.is_open())?;
            let due = order.due();
            self.accepts_amount(route.policy, transfer.amount, due)
                .then_some((index, route, due))
        });

        candidates
            .min_by(|(_, a, a_due), (_, b, b_due)| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| self.tie_break(transfer.amount, (*a, *a_due), (*b, *b_due)))
            })
            .map(|(index, _, _)| index)
    }

    fn tie_break(
        &self,
        amount: TokenAmount,
        (a, a_due): (&Route, TokenAmount),
        (b, b_due): (&Route, TokenAmount),
    ) -> Ordering {
        match self.config.tie_break {
            TieBreak::OldestId => a.id.cmp(&b.id),
            TieBreak::ClosestAmount => distance(amount, a_due)
                .cmp(&distance(amount, b_due))
                .then_with(|| a.id.cmp(&b.id)),
        }
    }
}

fn distance(a: TokenAmount, b: TokenAmount) -> u128 {
    a.raw().abs_diff(b.raw())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Address, TokenRef};
    use crate::extractor::EventKind;
    use crate::reconcile::{OrderStatus, PaymentWindow, RouteTarget};
    use crate::transfer::{BlockchainOrigin, Confirmation};
    use chrono::Duration;

    const SHOP: &str = "0x2222222222222222222222222222222222222222";
    const ALICE: &str = "0x1111111111111111111111111111111111111111";

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    fn token() -> TokenRef {
        TokenRef::Erc20 {
            chain: ChainId(1),
            address: addr("0x6b175474e89094c44da98b954eedeac495271d0f"),
        }
    }

    fn confirmed(amount: u128, height: u64) -> Transfer {
        let mut t = Transfer::blockchain(
            BlockchainOrigin {
                chain: ChainId(1),
                block_height: height,
                block_hash: format!("0x{:x}", height),
                tx_hash: format!("0xt{}", height),
                log_index: 0,
                event_kind: EventKind::Erc20Transfer,
                contract: addr("0x6b175474e89094c44da98b954eedeac495271d0f"),
            },
            token(),
            addr(ALICE),
            addr(SHOP),
            TokenAmount(amount),
            Utc::now(),
        );
        t.confirm(Confirmation::at_height(Utc::now(), height + 5))
            .unwrap();
        t
    }

    fn open_route(
        reconciler: &Reconciler,
        ctx: &mut MatchContext,
        amount: u128,
        policy: Option<AmountPolicy>,
        window: Option<PaymentWindow>,
    ) -> (OrderId, RouteId) {
        let order = PaymentOrder::new(TokenAmount(amount), token(), "ref".into());
        let route = reconciler
            .build_route(
                &order,
                OpenRouteRequest {
                    order_id: order.id,
                    destination: RouteTarget::Blockchain {
                        chain: ChainId(1),
                        address: addr(SHOP),
                    },
                    token: token(),
                    amount_policy: policy,
                    payment_window: window,
                },
            )
            .unwrap();
        let ids = (order.id, route.id);
        ctx.orders.insert(order.id, order);
        ctx.routes.push(route);
        ids
    }

    #[test]
    fn test_exact_and_at_least_policies() {
        let reconciler = Reconciler::new(ReconciliationConfig::default());
        let mut ctx = MatchContext::default();
        let (_, exact) = open_route(&reconciler, &mut ctx, 100, Some(AmountPolicy::Exact), None);

        let plan = reconciler.plan(&[confirmed(101, 10)], &mut ctx).unwrap();
        assert!(plan.claims.is_empty());

        let plan = reconciler.plan(&[confirmed(100, 11)], &mut ctx).unwrap();
        assert_eq!(plan.claims.len(), 1);
        assert_eq!(plan.claims[0].route_id, exact);

        let (order, _) = open_route(&reconciler, &mut ctx, 50, None, None);
        let plan = reconciler.plan(&[confirmed(70, 12)], &mut ctx).unwrap();
        assert_eq!(plan.claims.len(), 1);
        assert_eq!(ctx.orders[&order].status, OrderStatus::Paid);
        assert_eq!(ctx.orders[&order].total_paid, TokenAmount(70));
    }

    #[test]
    fn test_route_consumed_at_most_once() {
        let reconciler = Reconciler::new(ReconciliationConfig::default());
        let mut ctx = MatchContext::default();
        open_route(&reconciler, &mut ctx, 100, None, None);

        let plan = reconciler
            .plan(&[confirmed(100, 10), confirmed(100, 11)], &mut ctx)
            .unwrap();
        assert_eq!(plan.claims.len(), 1);
        assert!(plan.validate().is_ok());
        assert_eq!(plan.events().len(), 1);
    }

    #[test]
    fn test_partial_fills_accumulate() {
        let reconciler = Reconciler::new(ReconciliationConfig {
            allow_partial_fills: true,
            ..Default::default()
        });
        let mut ctx = MatchContext::default();
        let (order, _) = open_route(&reconciler, &mut ctx, 100, None, None);
        open_route_for(&reconciler, &mut ctx, order);

        let plan = reconciler
            .plan(&[confirmed(40, 10), confirmed(60, 11)], &mut ctx)
            .unwrap();
        assert_eq!(plan.claims.len(), 2);
        assert_eq!(ctx.orders[&order].status, OrderStatus::Paid);
    }

    #[test]
    fn test_partial_fills_never_relax_exact() {
        let reconciler = Reconciler::new(ReconciliationConfig {
            allow_partial_fills: true,
            ..Default::default()
        });
        let mut ctx = MatchContext::default();
        let (order, exact) = open_route(&reconciler, &mut ctx, 100, Some(AmountPolicy::Exact), None);

        let plan = reconciler.plan(&[confirmed(40, 10)], &mut ctx).unwrap();
        assert!(plan.claims.is_empty());
        assert_eq!(ctx.orders[&order].status, OrderStatus::Open);
        assert_eq!(ctx.orders[&order].total_paid, TokenAmount::ZERO);

        let plan = reconciler.plan(&[confirmed(100, 11)], &mut ctx).unwrap();
        assert_eq!(plan.claims.len(), 1);
        assert_eq!(plan.claims[0].route_id, exact);
        assert_eq!(ctx.orders[&order].status, OrderStatus::Paid);
    }

    fn open_route_for(reconciler: &Reconciler, ctx: &mut MatchContext, order_id: OrderId) {
        let order = ctx.orders[&order_id].clone();
        let route = reconciler
            .build_route(
                &order,
                OpenRouteRequest {
                    order_id,
                    destination: RouteTarget::Blockchain {
                        chain: ChainId(1),
                        address: addr(SHOP),
                    },
                    token: token(),
                    amount_policy: None,
                    payment_window: None,
                },
            )
            .unwrap();
        ctx.routes.push(route);
    }

    #[test]
    fn test_window_and_oldest_first() {
        let reconciler = Reconciler::new(ReconciliationConfig::default());
        let mut ctx = MatchContext::default();
        let window = PaymentWindow {
            start_height: 100,
            expiration_height: 200,
        };
        let (_, windowed) = open_route(&reconciler, &mut ctx, 10, None, Some(window));
        let (_, newer) = open_route(&reconciler, &mut ctx, 10, None, None);
        let (_, older) = open_route(&reconciler, &mut ctx, 10, None, None);
        let base = ctx.routes[1].created_at;
        ctx.routes[0].created_at = base - Duration::seconds(10);
        ctx.routes[2].created_at = base - Duration::seconds(5);

        // Outside the window: oldest windowless route wins
        let plan = reconciler.plan(&[confirmed(10, 50)], &mut ctx).unwrap();
        assert_eq!(plan.claims[0].route_id, older);

        let plan = reconciler.plan(&[confirmed(10, 150)], &mut ctx).unwrap();
        assert_eq!(plan.claims[0].route_id, windowed);

        let plan = reconciler.plan(&[confirmed(10, 300)], &mut ctx).unwrap();
        assert_eq!(plan.claims[0].route_id, newer);
    }

    #[test]
    fn test_closest_amount_tie_break() {
        let reconciler = Reconciler::new(ReconciliationConfig {
            tie_break: TieBreak::ClosestAmount,
            ..Default::default()
        });
        let mut ctx = MatchContext::default();
        open_route(&reconciler, &mut ctx, 10, None, None);
        let (_, close) = open_route(&reconciler, &mut ctx, 95, None, None);
        let created = ctx.routes[0].created_at;
        ctx.routes[1].created_at = created;

        let plan = reconciler.plan(&[confirmed(100, 10)], &mut ctx).unwrap();
        assert_eq!(plan.claims[0].route_id, close);
    }

    #[test]
    fn test_deposit_tracker_records_once() {
        let reconciler = Reconciler::new(ReconciliationConfig::default());
        let mut ctx = MatchContext::default();
        ctx.trackers
            .push(DepositTracker::new("user-7".into(), ChainId(1), addr(SHOP), None));

        let transfer = confirmed(5, 10);
        let plan = reconciler.plan(std::slice::from_ref(&transfer), &mut ctx).unwrap();
        assert_eq!(plan.deposits.len(), 1);
        assert_eq!(plan.deposits[0].external_ref, "user-7");
        assert!(matches!(
            plan.events()[0],
            EngineEvent::DepositRecorded { ref external_ref, .. } if external_ref == "user-7"
        ));

        let again = reconciler.plan(&[transfer], &mut ctx).unwrap();
        assert!(again.deposits.is_empty());
    }

    #[test]
    fn test_duplicate_claims_rejected() {
        let claim = RouteClaim {
            route_id: RouteId::new(),
            order_id: OrderId::new(),
            transfer_id: TransferId::new(),
            chain: ChainId(1),
            amount: TokenAmount(1),
            confirmed_at_height: Some(1),
        };
        let plan = ReconcilePlan {
            claims: vec![claim.clone(), claim],
            deposits: Vec::new(),
        };
        let err = plan.validate().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_build_route_validation() {
        let reconciler = Reconciler::new(ReconciliationConfig::default());
        let order = PaymentOrder::new(TokenAmount(10), token(), "r".into());
        let raiden_with_window = reconciler.build_route(
            &order,
            OpenRouteRequest {
                order_id: order.id,
                destination: RouteTarget::Raiden {
                    chain: ChainId(1),
                    node: addr(SHOP),
                },
                token: token(),
                amount_policy: None,
                payment_window: Some(PaymentWindow {
                    start_height: 1,
                    expiration_height: 2,
                }),
            },
        );
        assert!(matches!(raiden_with_window, Err(ReconcileError::InvalidRoute(_))));

        let wrong_token = reconciler.build_route(
            &order,
            OpenRouteRequest {
                order_id: order.id,
                destination: RouteTarget::Blockchain {
                    chain: ChainId(1),
                    address: addr(SHOP),
                },
                token: TokenRef::Native { chain: ChainId(1) },
                amount_policy: None,
                payment_window: None,
            },
        );
        assert!(matches!(wrong_token, Err(ReconcileError::TokenMismatch { .. })));

        let route = reconciler
            .build_route(
                &order,
                OpenRouteRequest {
                    order_id: order.id,
                    destination: RouteTarget::Raiden {
                        chain: ChainId(1),
                        node: addr(SHOP),
                    },
                    token: token(),
                    amount_policy: None,
                    payment_window: None,
                },
            )
            .unwrap();
        assert_eq!(route.policy, AmountPolicy::AtLeast);
        assert!(matches!(route.destination, RouteDestination::Raiden { identifier, .. } if identifier >= 1 << 48));
    }
}
