use crate::chain::{Address, ChainId, TokenAmount, TokenRef};
use crate::config::AmountPolicy;
use crate::ids::ulid_id;
use crate::transfer::{Party, Transfer, TransferId, TransferKind};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

ulid_id!(
    /// Payment order identifier
    OrderId
);
ulid_id!(
    /// Route identifier
    RouteId
);
ulid_id!(
    /// Recorded deposit identifier
    DepositId
);
ulid_id!(
    /// Deposit tracker identifier
    TrackerId
);

/// Smallest Raiden payment identifier handed out for routes (2^48)
pub const RAIDEN_IDENTIFIER_MIN: u64 = 1 << 48;
/// Largest identifier still exact in a JavaScript number (2^53 - 1)
pub const RAIDEN_IDENTIFIER_MAX: u64 = (1 << 53) - 1;

/// Random identifier above any millisecond timestamp a node would generate
pub fn new_raiden_identifier() -> u64 {
    rand::thread_rng().gen_range(RAIDEN_IDENTIFIER_MIN..=RAIDEN_IDENTIFIER_MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum OrderStatus {
    Open = 0,
    Paid = 10,
    Expired = -10,
}

impl OrderStatus {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(OrderStatus::Open),
            10 => Some(OrderStatus::Paid),
            -10 => Some(OrderStatus::Expired),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Open => "OPEN",
            OrderStatus::Paid => "PAID",
            OrderStatus::Expired => "EXPIRED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentOrder {
    pub id: OrderId,
    pub amount: TokenAmount,
    pub token: TokenRef,
    /// Free-text correlation key supplied by the caller
    pub reference: String,
    pub status: OrderStatus,
    pub total_paid: TokenAmount,
    pub created_at: DateTime<Utc>,
}

impl PaymentOrder {
    pub fn new(amount: TokenAmount, token: TokenRef, reference: String) -> Self {
        Self {
            id: OrderId::new(),
            amount,
            token,
            reference,
            status: OrderStatus::Open,
            total_paid: TokenAmount::ZERO,
            created_at: Utc::now(),
        }
    }

    /// Amount still owed
    pub fn due(&self) -> TokenAmount {
        self.amount.saturating_sub(self.total_paid)
    }

    pub fn is_open(&self) -> bool {
        self.status == OrderStatus::Open
    }

    /// Book a payment; the order becomes PAID once fully covered
    pub fn apply_payment(&mut self, amount: TokenAmount) {
        self.total_paid = self
            .total_paid
            .checked_add(amount)
            .unwrap_or(TokenAmount(u128::MAX));
        if self.total_paid >= self.amount {
            self.status = OrderStatus::Paid;
        }
    }
}

/// Lookup key shared by a route destination and the transfers that pay it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchKey(String);

impl MatchKey {
    pub fn blockchain(chain: ChainId, address: &Address) -> Self {
        Self(format!("chain:{}:{}", chain, address))
    }

    pub fn raiden(chain: ChainId, node: &Address, identifier: u64) -> Self {
        Self(format!("raiden:{}:{}:{}", chain, node, identifier))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key of the destination a transfer paid into, if it can pay a route
    pub fn for_transfer(transfer: &Transfer) -> Option<Self> {
        match &transfer.kind {
            TransferKind::Blockchain { origin, .. } => match &transfer.receiver {
                Party::Address(receiver) => Some(Self::blockchain(origin.chain, receiver)),
                Party::Account(_) => None,
            },
            TransferKind::Raiden { origin, .. } => match &transfer.receiver {
                Party::Address(receiver) if *receiver == origin.node => {
                    Some(Self::raiden(origin.chain, &origin.node, origin.identifier))
                }
                _ => None,
            },
            TransferKind::Internal { .. } => None,
        }
    }
}

impl fmt::Display for MatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RouteDestination {
    Blockchain {
        chain: ChainId,
        address: Address,
    },
    Raiden {
        chain: ChainId,
        node: Address,
        identifier: u64,
    },
}

impl RouteDestination {
    pub fn chain(&self) -> ChainId {
        match self {
            RouteDestination::Blockchain { chain, .. } | RouteDestination::Raiden { chain, .. } => {
                *chain
            }
        }
    }

    pub fn match_key(&self) -> MatchKey {
        match self {
            RouteDestination::Blockchain { chain, address } => MatchKey::blockchain(*chain, address),
            RouteDestination::Raiden {
                chain,
                node,
                identifier,
            } => MatchKey::raiden(*chain, node, *identifier),
        }
    }
}

/// Destination requested by the caller. Raiden identifiers are assigned on open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RouteTarget {
    Blockchain { chain: ChainId, address: Address },
    Raiden { chain: ChainId, node: Address },
}

impl RouteTarget {
    pub fn into_destination(self) -> RouteDestination {
        match self {
            RouteTarget::Blockchain { chain, address } => {
                RouteDestination::Blockchain { chain, address }
            }
            RouteTarget::Raiden { chain, node } => RouteDestination::Raiden {
                chain,
                node,
                identifier: new_raiden_identifier(),
            },
        }
    }
}

/// Block heights during which a blockchain route accepts payments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentWindow {
    pub start_height: u64,
    pub expiration_height: u64,
}

impl PaymentWindow {
    pub fn contains(&self, height: u64) -> bool {
        (self.start_height..=self.expiration_height).contains(&height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum RouteStatus {
    Open = 0,
    Consumed = 10,
}

impl RouteStatus {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(RouteStatus::Open),
            10 => Some(RouteStatus::Consumed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RouteStatus::Open => "OPEN",
            RouteStatus::Consumed => "CONSUMED",
        }
    }
}

impl fmt::Display for RouteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub id: RouteId,
    pub order_id: OrderId,
    pub destination: RouteDestination,
    pub token: TokenRef,
    pub policy: AmountPolicy,
    pub window: Option<PaymentWindow>,
    pub status: RouteStatus,
    pub consumed_by: Option<TransferId>,
    pub created_at: DateTime<Utc>,
}

impl Route {
    pub fn is_open(&self) -> bool {
        self.status == RouteStatus::Open
    }

    /// Whether a payment included at `height` falls inside the window.
    /// Transfers without a block height only match windowless routes.
    pub fn accepts_height(&self, height: Option<u64>) -> bool {
        match (self.window, height) {
            (None, _) => true,
            (Some(window), Some(height)) => window.contains(height),
            (Some(_), None) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenRouteRequest {
    pub order_id: OrderId,
    pub destination: RouteTarget,
    pub token: TokenRef,
    #[serde(default)]
    pub amount_policy: Option<AmountPolicy>,
    #[serde(default)]
    pub payment_window: Option<PaymentWindow>,
}

/// Funding destination watched on behalf of an external party
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositTracker {
    pub id: TrackerId,
    pub external_ref: String,
    pub chain: ChainId,
    pub address: Address,
    /// Restrict to one token; any token when absent
    pub token: Option<TokenRef>,
    pub created_at: DateTime<Utc>,
}

impl DepositTracker {
    pub fn new(external_ref: String, chain: ChainId, address: Address, token: Option<TokenRef>) -> Self {
        Self {
            id: TrackerId::new(),
            external_ref,
            chain,
            address,
            token,
            created_at: Utc::now(),
        }
    }

    pub fn matches(&self, transfer: &Transfer) -> bool {
        let TransferKind::Blockchain { origin, .. } = &transfer.kind else {
            return false;
        };
        origin.chain == self.chain
            && transfer.receiver.address() == Some(&self.address)
            && self.token.as_ref().is_none_or(|t| *t == transfer.token)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    pub id: DepositId,
    pub tracker_id: TrackerId,
    pub external_ref: String,
    pub transfer_id: TransferId,
    pub chain: ChainId,
    pub height: Option<u64>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raiden_identifier_range() {
        for _ in 0..1000 {
            let id = new_raiden_identifier();
            assert!((RAIDEN_IDENTIFIER_MIN..=RAIDEN_IDENTIFIER_MAX).contains(&id));
        }
        assert_eq!(RAIDEN_IDENTIFIER_MAX, 9_007_199_254_740_991);
    }

    #[test]
    fn test_order_payment_accumulates() {
        let mut order = PaymentOrder::new(
            TokenAmount(100),
            TokenRef::Native { chain: ChainId(1) },
            "inv-1".into(),
        );
        order.apply_payment(TokenAmount(60));
        assert_eq!(order.status, OrderStatus::Open);
        assert_eq!(order.due(), TokenAmount(40));
        order.apply_payment(TokenAmount(50));
        assert_eq!(order.status, OrderStatus::Paid);
        assert_eq!(order.due(), TokenAmount::ZERO);
    }

    #[test]
    fn test_match_key_is_case_insensitive() {
        let upper = Address::parse("0xABCDEFabcdef0000000000000000000000000001").unwrap();
        let lower = Address::parse("0xabcdefabcdef0000000000000000000000000001").unwrap();
        assert_eq!(
            MatchKey::blockchain(ChainId(1), &upper),
            MatchKey::blockchain(ChainId(1), &lower)
        );
        let dest = RouteDestination::Blockchain {
            chain: ChainId(1),
            address: upper,
        };
        assert_eq!(dest.match_key().as_str(), format!("chain:1:{}", lower));
    }

    #[test]
    fn test_payment_window() {
        let window = PaymentWindow {
            start_height: 10,
            expiration_height: 20,
        };
        assert!(window.contains(10) && window.contains(20));
        assert!(!window.contains(21));
        assert!(RouteStatus::from_id(RouteStatus::Consumed.id()) == Some(RouteStatus::Consumed));
        assert_eq!(OrderStatus::from_id(-10), Some(OrderStatus::Expired));
    }
}
