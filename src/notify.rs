//! Outbound engine events
//!
//! Every component publishes through one [`EventBus`] (a tokio broadcast
//! channel). Sinks subscribe independently: the log sink writes each event as a
//! structured log line, the webhook sink POSTs it as JSON to an operations
//! endpoint. Events carry identifiers only, never transaction payloads.
//!
//! Delivery is at most once. A subscriber that falls more than the bus
//! capacity behind skips the oldest events and logs how many it lost; the
//! store remains the record of every settlement. The capacity is
//! `notifications.broadcast_capacity`.

use crate::chain::ChainId;
use crate::reconcile::{DepositId, OrderId, RouteId};
use crate::transfer::TransferId;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_CAPACITY: usize = 1024;
const WEBHOOK_MAX_RETRIES: u32 = 3;
const WEBHOOK_RETRY_DELAY_MS: u64 = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    Settlement {
        order_id: OrderId,
        route_id: RouteId,
        transfer_id: TransferId,
        chain: ChainId,
        /// Absent for off-chain (Raiden) payments
        confirmed_at_height: Option<u64>,
    },
    BlocksReverted {
        chain: ChainId,
        from_height: u64,
        to_height: u64,
    },
    DepositRecorded {
        deposit_id: DepositId,
        transfer_id: TransferId,
        external_ref: String,
        chain: ChainId,
    },
    ChainUnavailable {
        chain: ChainId,
        attempt: u32,
        retry_in_ms: u64,
    },
    ChainHalted {
        chain: ChainId,
        reason: String,
    },
    ProviderOnline {
        chain: ChainId,
        endpoint: String,
    },
    ProviderOffline {
        chain: ChainId,
        endpoint: String,
    },
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::Settlement { .. } => "settlement",
            EngineEvent::BlocksReverted { .. } => "blocks_reverted",
            EngineEvent::DepositRecorded { .. } => "deposit_recorded",
            EngineEvent::ChainUnavailable { .. } => "chain_unavailable",
            EngineEvent::ChainHalted { .. } => "chain_halted",
            EngineEvent::ProviderOnline { .. } => "provider_online",
            EngineEvent::ProviderOffline { .. } => "provider_offline",
        }
    }
}

/// Cloneable publisher handle
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishing never blocks. With no subscribers the event is dropped.
    pub fn publish(&self, event: EngineEvent) {
        if self.tx.send(event).is_err() {
            debug!("No event subscribers");
        }
    }

    /// A receiver that lags by more than the capacity gets `RecvError::Lagged`
    /// and resumes at the oldest event still buffered.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Log every event until the bus closes. Events skipped while lagging are
/// counted in a warning and not replayed.
pub fn spawn_log_sink(bus: &EventBus) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let body = serde_json::to_string(&event).unwrap_or_default();
                    info!(target: "EVENTS", event = event.name(), %body, "Engine event");
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target: "EVENTS", skipped, "Log sink lagged behind event bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// POSTs engine events as JSON to an operations endpoint
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// Delivery is best effort: failures are retried a few times and then logged.
    pub async fn deliver(&self, event: &EngineEvent) -> bool {
        for attempt in 0..WEBHOOK_MAX_RETRIES {
            match self.client.post(&self.url).json(event).send().await {
                Ok(resp) if resp.status().is_success() => return true,
                Ok(resp) => warn!(
                    event = event.name(),
                    status = %resp.status(),
                    "Webhook attempt {}/{} rejected",
                    attempt + 1,
                    WEBHOOK_MAX_RETRIES
                ),
                Err(e) => warn!(
                    event = event.name(),
                    error = %e,
                    "Webhook attempt {}/{} failed",
                    attempt + 1,
                    WEBHOOK_MAX_RETRIES
                ),
            }
            if attempt + 1 < WEBHOOK_MAX_RETRIES {
                tokio::time::sleep(Duration::from_millis(
                    WEBHOOK_RETRY_DELAY_MS * (attempt as u64 + 1),
                ))
                .await;
            }
        }
        warn!(event = event.name(), url = %self.url, "Webhook delivery abandoned");
        false
    }

    /// Deliver bus events in order. Retries block the sink, so a slow endpoint
    /// can make it lag and skip events; skipped events are not posted.
    pub fn spawn(self, bus: &EventBus) -> JoinHandle<()> {
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        self.deliver(&event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Webhook sink lagged behind event bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bus_fans_out_to_all_subscribers() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(EngineEvent::ChainHalted {
            chain: ChainId(1),
            reason: "reorg too deep".to_string(),
        });

        assert_eq!(a.recv().await.unwrap().name(), "chain_halted");
        assert_eq!(b.recv().await.unwrap().name(), "chain_halted");
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new(8);
        bus.publish(EngineEvent::ProviderOnline {
            chain: ChainId(1),
            endpoint: "http://localhost:8545".to_string(),
        });
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_oldest_and_resumes() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for height in 0..4u64 {
            bus.publish(EngineEvent::ChainHalted {
                chain: ChainId(1),
                reason: format!("halt {height}"),
            });
        }

        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(skipped)) => assert_eq!(skipped, 2),
            other => panic!("expected lag, got {other:?}"),
        }
        let next = rx.recv().await.unwrap();
        assert_eq!(
            next,
            EngineEvent::ChainHalted { chain: ChainId(1), reason: "halt 2".to_string() }
        );
    }

    #[test]
    fn test_event_json_shape() {
        let event = EngineEvent::BlocksReverted {
            chain: ChainId(1),
            from_height: 50,
            to_height: 52,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "blocks_reverted");
        assert_eq!(json["chain"], 1);
        assert_eq!(json["from_height"], 50);
    }
}
