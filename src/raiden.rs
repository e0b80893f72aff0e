//! Raiden payment ingestion
//!
//! A Raiden node reports channel payments through its REST API
//! (`GET /api/v1/payments/{token}`). Successful ones become confirmed Raiden
//! transfers and are reconciled right away; the node's report is final, so
//! there is no confirmation depth.
//!
//! ```text
//! node ──poll──► PaymentEvent ──► RaidenPayment ──► Transfer(CONFIRMED) ──► Settler
//! ```

use crate::chain::{Address, ChainId, TokenAmount, TokenRef};
use crate::config::RaidenNodeConfig;
use crate::settle::{SettleError, Settler};
use crate::store::{Store, StoreError};
use crate::transfer::{RaidenDirection, RaidenOrigin, Transfer};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const API_BASE_PATH: &str = "/api/v1";
const HTTP_TIMEOUT_SECS: u64 = 30;

pub const EVENT_PAYMENT_RECEIVED: &str = "EventPaymentReceivedSuccess";
pub const EVENT_PAYMENT_SENT: &str = "EventPaymentSentSuccess";

#[derive(Debug, Error)]
pub enum RaidenError {
    #[error("Raiden node request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Raiden node {url} answered HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("Malformed payment event: {0}")]
    Decode(String),

    #[error("Payment amount must be greater than zero")]
    ZeroAmount,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Settlement failed: {0}")]
    Settle(#[from] SettleError),
}

/// One entry of the node's payment history
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PaymentEvent {
    pub event: String,
    #[serde(deserialize_with = "number_or_string")]
    pub identifier: u128,
    #[serde(deserialize_with = "number_or_string")]
    pub amount: u128,
    #[serde(default)]
    pub initiator: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    pub log_time: String,
    #[serde(default)]
    pub token_address: Option<String>,
}

/// The node serializes identifiers and amounts as numbers or decimal strings
fn number_or_string<'de, D>(deserializer: D) -> Result<u128, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n as u128),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Node log times are naive ISO-8601 in UTC; offsets are accepted too
fn parse_log_time(s: &str) -> Result<DateTime<Utc>, RaidenError> {
    if let Ok(time) = DateTime::parse_from_rfc3339(s) {
        return Ok(time.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| RaidenError::Decode(format!("log_time {s:?}: {e}")))
}

/// A successful channel payment seen by one of our nodes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaidenPayment {
    pub chain: ChainId,
    pub node: Address,
    pub token: TokenRef,
    pub identifier: u64,
    pub amount: TokenAmount,
    pub partner: Address,
    pub direction: RaidenDirection,
    pub log_time: DateTime<Utc>,
}

impl RaidenPayment {
    /// `None` for events that are not successful payments
    pub fn from_event(
        chain: ChainId,
        node: &Address,
        token: &TokenRef,
        event: &PaymentEvent,
    ) -> Result<Option<Self>, RaidenError> {
        let (direction, partner) = match event.event.as_str() {
            EVENT_PAYMENT_RECEIVED => (RaidenDirection::Received, event.initiator.as_deref()),
            EVENT_PAYMENT_SENT => (RaidenDirection::Sent, event.target.as_deref()),
            _ => return Ok(None),
        };
        let partner = partner
            .ok_or_else(|| RaidenError::Decode(format!("{} without partner address", event.event)))?;
        let partner = Address::parse(partner).map_err(|e| RaidenError::Decode(e.to_string()))?;
        let identifier = u64::try_from(event.identifier)
            .map_err(|_| RaidenError::Decode(format!("identifier {} out of range", event.identifier)))?;

        Ok(Some(Self {
            chain,
            node: node.clone(),
            token: token.clone(),
            identifier,
            amount: TokenAmount(event.amount),
            partner,
            direction,
            log_time: parse_log_time(&event.log_time)?,
        }))
    }

    pub fn into_transfer(self) -> Result<Transfer, RaidenError> {
        if self.amount.is_zero() {
            return Err(RaidenError::ZeroAmount);
        }
        let (sender, receiver) = match self.direction {
            RaidenDirection::Received => (self.partner.clone(), self.node.clone()),
            RaidenDirection::Sent => (self.node.clone(), self.partner.clone()),
        };
        let origin = RaidenOrigin {
            chain: self.chain,
            node: self.node,
            identifier: self.identifier,
            partner: self.partner,
            direction: self.direction,
            log_time: self.log_time,
        };
        Ok(Transfer::raiden(origin, self.token, sender, receiver, self.amount))
    }
}

/// Record a payment and reconcile it. `None` if it was already recorded.
pub async fn ingest_payment(
    store: &dyn Store,
    settler: &Settler,
    payment: RaidenPayment,
) -> Result<Option<Transfer>, RaidenError> {
    let chain = payment.chain;
    let transfer = payment.into_transfer()?;
    let key = transfer.dedupe_key();
    if store.transfer_by_dedupe_key(&key).await?.is_some() {
        debug!(%chain, key, "Raiden payment already recorded");
        return Ok(None);
    }
    settler.settle(chain, vec![transfer.clone()], Vec::new()).await?;
    info!(
        %chain,
        transfer_id = %transfer.id,
        amount = %transfer.amount,
        "Raiden payment recorded"
    );
    Ok(Some(transfer))
}

/// Source of a node's payment history
#[async_trait]
pub trait PaymentFeed: Send + Sync {
    fn endpoint(&self) -> &str;

    /// Payment events for `token`, skipping the first `offset`
    async fn payments(&self, token: &Address, offset: usize) -> Result<Vec<PaymentEvent>, RaidenError>;
}

pub struct RaidenClient {
    url: String,
    client: reqwest::Client,
}

impl RaidenClient {
    pub fn new(url: &str) -> Result<Self, RaidenError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl PaymentFeed for RaidenClient {
    fn endpoint(&self) -> &str {
        &self.url
    }

    async fn payments(&self, token: &Address, offset: usize) -> Result<Vec<PaymentEvent>, RaidenError> {
        let url = format!("{}{}/payments/{}", self.url, API_BASE_PATH, token);
        let response = self
            .client
            .get(&url)
            .query(&[("offset", offset)])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RaidenError::Status {
                url,
                status: response.status().as_u16(),
            });
        }
        Ok(response.json().await?)
    }
}

/// Polls one node for new payments on each configured token
pub struct RaidenPoller {
    chain: ChainId,
    node: Address,
    tokens: Vec<Address>,
    interval: Duration,
    feed: Arc<dyn PaymentFeed>,
    store: Arc<dyn Store>,
    settler: Settler,
    offsets: HashMap<Address, usize>,
}

impl RaidenPoller {
    pub fn new(
        chain: ChainId,
        node: Address,
        tokens: Vec<Address>,
        interval: Duration,
        feed: Arc<dyn PaymentFeed>,
        store: Arc<dyn Store>,
        settler: Settler,
    ) -> Self {
        Self {
            chain,
            node,
            tokens,
            interval,
            feed,
            store,
            settler,
            offsets: HashMap::new(),
        }
    }

    pub fn from_config(
        config: &RaidenNodeConfig,
        store: Arc<dyn Store>,
        settler: Settler,
    ) -> Result<Self, RaidenError> {
        let parse = |s: &str| Address::parse(s).map_err(|e| RaidenError::Decode(e.to_string()));
        let node = parse(&config.address)?;
        let tokens = config
            .tokens
            .iter()
            .map(|t| parse(t))
            .collect::<Result<Vec<_>, _>>()?;
        let feed = Arc::new(RaidenClient::new(&config.url)?);
        Ok(Self::new(
            ChainId(config.chain_id),
            node,
            tokens,
            Duration::from_millis(config.poll_interval_ms),
            feed,
            store,
            settler,
        ))
    }

    /// Fetch and ingest everything new. Returns the number of transfers recorded.
    pub async fn poll_once(&mut self) -> Result<usize, RaidenError> {
        let mut recorded = 0;
        for token_address in self.tokens.clone() {
            let offset = self.offsets.get(&token_address).copied().unwrap_or(0);
            let events = self.feed.payments(&token_address, offset).await?;
            let token = TokenRef::Erc20 {
                chain: self.chain,
                address: token_address.clone(),
            };

            for (index, event) in events.iter().enumerate() {
                let payment = match RaidenPayment::from_event(self.chain, &self.node, &token, event) {
                    Ok(Some(payment)) => payment,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(chain = %self.chain, node = %self.node, error = %e, "Skipping payment event");
                        continue;
                    }
                };
                match ingest_payment(self.store.as_ref(), &self.settler, payment).await {
                    Ok(Some(_)) => recorded += 1,
                    Ok(None) => {}
                    Err(RaidenError::ZeroAmount) => {
                        debug!(chain = %self.chain, "Ignoring zero-amount payment");
                    }
                    Err(e) => {
                        // Resume at the failed event next poll
                        self.offsets.insert(token_address, offset + index);
                        return Err(e);
                    }
                }
            }
            self.offsets.insert(token_address, offset + events.len());
        }
        Ok(recorded)
    }

    pub fn spawn(mut self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(chain = %self.chain, node = %self.node, endpoint = self.feed.endpoint(), "Raiden poller started");
            loop {
                if *shutdown.borrow() {
                    break;
                }
                if let Err(e) = self.poll_once().await {
                    warn!(chain = %self.chain, node = %self.node, error = %e, "Raiden poll failed");
                }
                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            info!(chain = %self.chain, node = %self.node, "Raiden poller stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconciliationConfig;
    use crate::notify::{EngineEvent, EventBus};
    use crate::reconcile::{OpenRouteRequest, PaymentOrder, Reconciler, RouteTarget};
    use crate::store::MemoryStore;
    use crate::transfer::TransferStatus;
    use std::sync::Mutex;

    const NODE: &str = "0x3333333333333333333333333333333333333333";
    const PARTNER: &str = "0x4444444444444444444444444444444444444444";
    const TOKEN: &str = "0x6b175474e89094c44da98b954eedeac495271d0f";

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    fn token() -> TokenRef {
        TokenRef::Erc20 {
            chain: ChainId(1),
            address: addr(TOKEN),
        }
    }

    fn received(identifier: u64, amount: u128) -> PaymentEvent {
        serde_json::from_value(serde_json::json!({
            "event": EVENT_PAYMENT_RECEIVED,
            "identifier": identifier.to_string(),
            "amount": amount.to_string(),
            "initiator": PARTNER,
            "log_time": "2024-03-01T10:15:30.250",
            "token_address": TOKEN,
        }))
        .unwrap()
    }

    struct StaticFeed {
        events: Mutex<Vec<PaymentEvent>>,
        offsets: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl PaymentFeed for StaticFeed {
        fn endpoint(&self) -> &str {
            "static://node"
        }

        async fn payments(&self, _token: &Address, offset: usize) -> Result<Vec<PaymentEvent>, RaidenError> {
            self.offsets.lock().unwrap().push(offset);
            Ok(self.events.lock().unwrap().iter().skip(offset).cloned().collect())
        }
    }

    #[test]
    fn test_parses_payment_events() {
        let event: PaymentEvent = serde_json::from_str(
            r#"{"event":"EventPaymentSentSuccess","identifier":42,"amount":"1000000000000000000000",
                "target":"0x4444444444444444444444444444444444444444","log_time":"2024-03-01T10:15:30"}"#,
        )
        .unwrap();
        let payment = RaidenPayment::from_event(ChainId(1), &addr(NODE), &token(), &event)
            .unwrap()
            .unwrap();
        assert_eq!(payment.direction, RaidenDirection::Sent);
        assert_eq!(payment.identifier, 42);
        assert_eq!(payment.amount, TokenAmount(1_000_000_000_000_000_000_000));
        assert_eq!(payment.partner, addr(PARTNER));

        let transfer = payment.into_transfer().unwrap();
        assert_eq!(transfer.status, TransferStatus::Confirmed);
        assert_eq!(transfer.sender.address(), Some(&addr(NODE)));
    }

    #[test]
    fn test_ignores_other_events() {
        let mut event = received(1, 5);
        event.event = "EventPaymentSentFailed".to_string();
        let parsed = RaidenPayment::from_event(ChainId(1), &addr(NODE), &token(), &event).unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn test_log_time_formats() {
        let naive = parse_log_time("2024-03-01T10:15:30.250").unwrap();
        let offset = parse_log_time("2024-03-01T12:15:30.250+02:00").unwrap();
        assert_eq!(naive, offset);
        assert!(parse_log_time("yesterday").is_err());
    }

    #[tokio::test]
    async fn test_poller_settles_route_and_skips_duplicates() {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new(16);
        let mut events = bus.subscribe();
        let reconciler = Reconciler::new(ReconciliationConfig::default());
        let settler = Settler::new(store.clone(), reconciler, bus);

        let order = PaymentOrder::new(TokenAmount(500), token(), "inv-7".into());
        store.insert_order(&order).await.unwrap();
        let route = reconciler
            .build_route(
                &order,
                OpenRouteRequest {
                    order_id: order.id,
                    destination: RouteTarget::Raiden {
                        chain: ChainId(1),
                        node: addr(NODE),
                    },
                    token: token(),
                    amount_policy: None,
                    payment_window: None,
                },
            )
            .unwrap();
        store.insert_route(&route).await.unwrap();
        let identifier = match &route.destination {
            crate::reconcile::RouteDestination::Raiden { identifier, .. } => *identifier,
            other => panic!("unexpected destination {other:?}"),
        };

        let feed = Arc::new(StaticFeed {
            events: Mutex::new(vec![received(identifier, 500)]),
            offsets: Mutex::new(Vec::new()),
        });
        let mut poller = RaidenPoller::new(
            ChainId(1),
            addr(NODE),
            vec![addr(TOKEN)],
            Duration::from_secs(1),
            feed.clone(),
            store.clone(),
            settler.clone(),
        );

        assert_eq!(poller.poll_once().await.unwrap(), 1);
        assert_eq!(poller.poll_once().await.unwrap(), 0);
        assert_eq!(*feed.offsets.lock().unwrap(), vec![0, 1]);

        let event = events.try_recv().unwrap();
        assert!(matches!(event, EngineEvent::Settlement { route_id, confirmed_at_height: None, .. } if route_id == route.id));

        // A restarted poller starts from offset 0; the dedupe key keeps it idempotent
        let mut restarted = RaidenPoller::new(
            ChainId(1),
            addr(NODE),
            vec![addr(TOKEN)],
            Duration::from_secs(1),
            feed,
            store.clone(),
            settler,
        );
        assert_eq!(restarted.poll_once().await.unwrap(), 0);
        assert_eq!(store.transfers().await.len(), 1);
    }
}
