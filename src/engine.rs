//! Engine facade
//!
//! Wires the store, provider registry, target catalog and event bus together,
//! runs one [`ChainWorker`] per configured chain and exposes the operations
//! callers use: orders and routes, deposit trackers, internal bookings,
//! Raiden payments, target reloads and the status snapshot.

use crate::chain::{Address, ChainId, TokenAmount, TokenRef};
use crate::config::{AppConfig, ConfigError};
use crate::extractor::{EventExtractor, TargetCatalog};
use crate::notify::{DEFAULT_CAPACITY, EngineEvent, EventBus, WebhookNotifier, spawn_log_sink};
use crate::provider::{ChainClient, EthRpcClient, Failover, ProviderError, ProviderId, ProviderRegistry};
use crate::raiden::{self, RaidenError, RaidenPayment, RaidenPoller};
use crate::reconcile::{
    DepositTracker, OpenRouteRequest, OrderId, PaymentOrder, ReconcileError, Reconciler, Route,
};
use crate::settle::{SettleError, Settler};
use crate::status::{ChainStatus, EngineStatus, StatusBoard};
use crate::store::{MemoryStore, PgStore, Store, StoreError};
use crate::transfer::{Transfer, TransferError, TransferStateMachine};
use crate::worker::{BlockPipeline, ChainWorker, WorkerExit};
use crate::worker::chain_worker::WorkerSettings;
use chrono::Utc;
use futures::future::join_all;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const PG_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("{0}")]
    Reconcile(#[from] ReconcileError),

    #[error("{0}")]
    Transfer(#[from] TransferError),

    #[error("{0}")]
    Settle(#[from] SettleError),

    #[error("Raiden error: {0}")]
    Raiden(#[from] RaidenError),

    #[error("Chain {0} is not configured")]
    UnknownChain(ChainId),

    #[error("Webhook client error: {0}")]
    Webhook(#[from] reqwest::Error),
}

#[derive(Default)]
struct Tasks {
    workers: Vec<(ChainId, JoinHandle<WorkerExit>)>,
    background: Vec<JoinHandle<()>>,
}

pub struct Engine {
    config: AppConfig,
    store: Arc<dyn Store>,
    registry: Arc<ProviderRegistry>,
    catalog: Arc<TargetCatalog>,
    bus: EventBus,
    board: Arc<StatusBoard>,
    reconciler: Reconciler,
    settler: Settler,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Tasks>,
}

impl Engine {
    /// Engine over an existing store and catalog, with no providers registered
    pub fn new(config: AppConfig, store: Arc<dyn Store>, catalog: Arc<TargetCatalog>) -> Self {
        let capacity = config.notifications.broadcast_capacity.unwrap_or(DEFAULT_CAPACITY);
        let bus = EventBus::new(capacity);
        let registry = Arc::new(ProviderRegistry::new().with_events(bus.clone()));
        for chain in &config.chains {
            let policy = chain.health.unwrap_or(config.engine.health);
            registry.configure_chain(chain.chain(), policy, chain.is_scaling_network);
        }
        let reconciler = Reconciler::new(config.engine.reconciliation);
        let settler = Settler::new(store.clone(), reconciler, bus.clone());
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            store,
            registry,
            catalog,
            bus,
            board: Arc::new(StatusBoard::new()),
            reconciler,
            settler,
            shutdown_tx,
            tasks: Mutex::new(Tasks::default()),
        }
    }

    /// Store from `postgres_url` (in-memory when unset), catalog from
    /// `targets_path`, one JSON-RPC client per configured provider
    pub async fn build(config: AppConfig) -> Result<Self, EngineError> {
        let store: Arc<dyn Store> = match &config.postgres_url {
            Some(url) => {
                let store = PgStore::connect(url, PG_MAX_CONNECTIONS).await?;
                store.init_schema().await?;
                Arc::new(store)
            }
            None => {
                warn!("No postgres_url configured, state is kept in memory only");
                Arc::new(MemoryStore::new())
            }
        };
        let catalog = Arc::new(TargetCatalog::from_file(&config.targets_path)?);
        info!(targets = catalog.len(), path = %config.targets_path, "Target catalog loaded");

        let engine = Self::new(config, store, catalog);
        for chain in &engine.config.chains {
            for provider in &chain.providers {
                let client = EthRpcClient::new(chain.chain(), &provider.url, provider.auth_token.clone())?;
                engine.register_provider(chain.chain(), Arc::new(client));
            }
        }
        Ok(engine)
    }

    pub fn register_provider(&self, chain: ChainId, client: Arc<dyn ChainClient>) -> ProviderId {
        self.registry.register(chain, client)
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.bus.subscribe()
    }

    /// Start notification sinks, Raiden pollers and one worker per chain.
    /// Returns the number of chain workers started.
    pub fn spawn_workers(&self) -> Result<usize, EngineError> {
        let mut background = Vec::new();
        if self.config.notifications.log_events {
            background.push(spawn_log_sink(&self.bus));
        }
        if let Some(url) = &self.config.notifications.webhook_url {
            background.push(WebhookNotifier::new(url.as_str())?.spawn(&self.bus));
        }
        for node in &self.config.raiden {
            let poller = RaidenPoller::from_config(node, self.store.clone(), self.settler.clone())?;
            background.push(poller.spawn(self.shutdown_tx.subscribe()));
        }

        let mut workers = Vec::with_capacity(self.config.chains.len());
        for chain in &self.config.chains {
            let id = chain.chain();
            let failover = Failover::new(id, self.registry.clone(), self.config.engine.provider_timeout());
            let pipeline = BlockPipeline::new(
                self.store.clone(),
                failover,
                EventExtractor::new(self.catalog.clone()),
                TransferStateMachine::new(chain.confirmation_depth),
                self.reconciler,
                self.bus.clone(),
            );
            let worker = ChainWorker::new(
                WorkerSettings::from_config(chain, &self.config.engine),
                pipeline,
                self.bus.clone(),
                self.board.clone(),
            );
            info!(chain = %id, name = %chain.name, "Starting chain worker");
            workers.push((id, tokio::spawn(worker.run(self.shutdown_tx.subscribe()))));
        }

        let started = workers.len();
        let mut tasks = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        tasks.workers.extend(workers);
        tasks.background.extend(background);
        Ok(started)
    }

    /// Signal every worker to stop after its current block and wait for them
    pub async fn shutdown(&self) -> Vec<(ChainId, WorkerExit)> {
        self.shutdown_tx.send_replace(true);
        let tasks = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *tasks)
        };

        let (chains, handles): (Vec<_>, Vec<_>) = tasks.workers.into_iter().unzip();
        let exits: Vec<(ChainId, WorkerExit)> = chains
            .into_iter()
            .zip(join_all(handles).await)
            .map(|(chain, joined)| match joined {
                Ok(exit) => (chain, exit),
                Err(e) => {
                    warn!(%chain, error = %e, "Chain worker task failed");
                    (chain, WorkerExit::Halted(e.to_string()))
                }
            })
            .collect();
        for handle in tasks.background {
            handle.abort();
        }
        info!(workers = exits.len(), "Engine stopped");
        exits
    }

    // === Orders and routes ===

    pub async fn create_order(
        &self,
        amount: TokenAmount,
        token: TokenRef,
        reference: String,
    ) -> Result<PaymentOrder, EngineError> {
        if amount.is_zero() {
            return Err(ReconcileError::InvalidAmount.into());
        }
        self.ensure_chain(token.chain())?;
        let order = PaymentOrder::new(amount, token, reference);
        self.store.insert_order(&order).await?;
        info!(order_id = %order.id, amount = %order.amount, token = %order.token, "Order created");
        Ok(order)
    }

    pub async fn order(&self, id: OrderId) -> Result<Option<PaymentOrder>, EngineError> {
        Ok(self.store.order(id).await?)
    }

    pub async fn routes_for_order(&self, id: OrderId) -> Result<Vec<Route>, EngineError> {
        Ok(self.store.routes_for_order(id).await?)
    }

    /// OPEN -> EXPIRED. Open routes of an expired order no longer settle.
    pub async fn expire_order(&self, id: OrderId) -> Result<bool, EngineError> {
        let expired = self.store.expire_order(id).await?;
        if expired {
            info!(order_id = %id, "Order expired");
        }
        Ok(expired)
    }

    /// Open a route and re-scan confirmed transfers that already paid into
    /// its destination, oldest first
    pub async fn open_route(&self, request: OpenRouteRequest) -> Result<Route, EngineError> {
        let order = self
            .store
            .order(request.order_id)
            .await?
            .ok_or(ReconcileError::OrderNotFound(request.order_id))?;
        let route = self.reconciler.build_route(&order, request)?;
        let chain = route.destination.chain();
        self.ensure_chain(chain)?;
        self.store.insert_route(&route).await?;
        info!(
            route_id = %route.id,
            order_id = %route.order_id,
            key = %route.destination.match_key(),
            "Route opened"
        );

        let earlier = self
            .store
            .unmatched_confirmed(&route.destination.match_key(), &route.token)
            .await?;
        if !earlier.is_empty() {
            info!(route_id = %route.id, transfers = earlier.len(), "Re-scanning unmatched transfers");
            self.settler.settle(chain, Vec::new(), earlier).await?;
        }

        Ok(self.store.route(route.id).await?.unwrap_or(route))
    }

    // === Deposits and off-chain transfers ===

    pub async fn register_deposit_tracker(
        &self,
        external_ref: String,
        chain: ChainId,
        address: Address,
        token: Option<TokenRef>,
    ) -> Result<DepositTracker, EngineError> {
        self.ensure_chain(chain)?;
        let tracker = DepositTracker::new(external_ref, chain, address, token);
        self.store.insert_deposit_tracker(&tracker).await?;
        info!(tracker_id = %tracker.id, %chain, address = %tracker.address, "Deposit tracker registered");
        Ok(tracker)
    }

    /// Book a ledger transfer between internal accounts; confirmed immediately
    pub async fn record_internal_transfer(
        &self,
        sender: String,
        receiver: String,
        token: TokenRef,
        amount: TokenAmount,
        memo: Option<String>,
    ) -> Result<Transfer, EngineError> {
        let transfer = Transfer::internal(sender, receiver, token, amount, memo)?;
        self.settler
            .settle(transfer.chain(), vec![transfer.clone()], Vec::new())
            .await?;
        info!(transfer_id = %transfer.id, amount = %transfer.amount, "Internal transfer recorded");
        Ok(transfer)
    }

    /// `None` if the payment was already recorded
    pub async fn ingest_raiden_payment(
        &self,
        payment: RaidenPayment,
    ) -> Result<Option<Transfer>, EngineError> {
        self.ensure_chain(payment.chain)?;
        Ok(raiden::ingest_payment(self.store.as_ref(), &self.settler, payment).await?)
    }

    // === Targets and status ===

    /// Re-read the target catalog; running workers pick it up on their next block
    pub fn reload_targets(&self) -> Result<usize, EngineError> {
        Ok(self.catalog.reload_from_file(&self.config.targets_path)?)
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        let mut chains = Vec::with_capacity(self.config.chains.len());
        for chain in &self.config.chains {
            let id = chain.chain();
            let progress = self.board.get(id);
            chains.push(ChainStatus {
                chain: id,
                name: chain.name.clone(),
                head: self.registry.best_head(id),
                watermark: self.store.watermark(id).await?,
                phase: progress.phase,
                halted: self.board.is_halted(id),
                halted_reason: progress.halted_reason,
                providers: self.registry.snapshot(id),
            });
        }
        Ok(EngineStatus {
            instance: self.config.engine.instance_name.clone(),
            generated_at: Utc::now(),
            chains,
        })
    }

    fn ensure_chain(&self, chain: ChainId) -> Result<(), EngineError> {
        if self.config.chains.iter().any(|c| c.chain() == chain) {
            Ok(())
        } else {
            Err(EngineError::UnknownChain(chain))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::{OrderStatus, RouteTarget};
    use crate::transfer::TransferStatus;

    const CONFIG: &str = r#"
log_level: info
log_dir: logs
log_file: indexer.log
use_json: false
rotation: never
targets_path: config/targets.yaml
chains:
  - chain_id: 1
    name: ethereum
    confirmation_depth: 3
    providers:
      - url: http://localhost:8545
"#;

    const SHOP: &str = "0x2222222222222222222222222222222222222222";

    fn engine() -> (Engine, Arc<MemoryStore>) {
        let config = AppConfig::from_yaml(CONFIG).unwrap();
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new(config, store.clone(), Arc::new(TargetCatalog::empty()));
        (engine, store)
    }

    fn native() -> TokenRef {
        TokenRef::Native { chain: ChainId(1) }
    }

    #[tokio::test]
    async fn test_create_order_rejects_zero_and_unknown_chain() {
        let (engine, _) = engine();
        let zero = engine.create_order(TokenAmount::ZERO, native(), "a".into()).await;
        assert!(matches!(zero, Err(EngineError::Reconcile(ReconcileError::InvalidAmount))));

        let unknown = engine
            .create_order(TokenAmount(1), TokenRef::Native { chain: ChainId(99) }, "b".into())
            .await;
        assert!(matches!(unknown, Err(EngineError::UnknownChain(ChainId(99)))));
    }

    #[tokio::test]
    async fn test_open_route_on_missing_order() {
        let (engine, _) = engine();
        let result = engine
            .open_route(OpenRouteRequest {
                order_id: OrderId::new(),
                destination: RouteTarget::Blockchain {
                    chain: ChainId(1),
                    address: Address::parse(SHOP).unwrap(),
                },
                token: native(),
                amount_policy: None,
                payment_window: None,
            })
            .await;
        assert!(matches!(result, Err(EngineError::Reconcile(ReconcileError::OrderNotFound(_)))));
    }

    #[tokio::test]
    async fn test_expired_order_accepts_no_routes() {
        let (engine, _) = engine();
        let order = engine.create_order(TokenAmount(10), native(), "inv".into()).await.unwrap();
        assert!(engine.expire_order(order.id).await.unwrap());
        assert!(!engine.expire_order(order.id).await.unwrap());
        assert_eq!(engine.order(order.id).await.unwrap().unwrap().status, OrderStatus::Expired);

        let result = engine
            .open_route(OpenRouteRequest {
                order_id: order.id,
                destination: RouteTarget::Blockchain {
                    chain: ChainId(1),
                    address: Address::parse(SHOP).unwrap(),
                },
                token: native(),
                amount_policy: None,
                payment_window: None,
            })
            .await;
        assert!(matches!(result, Err(EngineError::Reconcile(ReconcileError::OrderNotOpen { .. }))));
    }

    #[tokio::test]
    async fn test_internal_transfer_is_confirmed() {
        let (engine, store) = engine();
        let transfer = engine
            .record_internal_transfer("treasury".into(), "ops".into(), native(), TokenAmount(5), None)
            .await
            .unwrap();
        assert_eq!(transfer.status, TransferStatus::Confirmed);
        assert_eq!(store.transfers().await.len(), 1);

        let zero = engine
            .record_internal_transfer("a".into(), "b".into(), native(), TokenAmount::ZERO, None)
            .await;
        assert!(matches!(zero, Err(EngineError::Transfer(TransferError::InvalidAmount))));
    }

    #[tokio::test]
    async fn test_status_lists_configured_chains() {
        let (engine, _) = engine();
        let status = engine.status().await.unwrap();
        assert_eq!(status.instance, "payment-indexer");
        assert_eq!(status.chains.len(), 1);
        assert_eq!(status.chains[0].name, "ethereum");
        assert!(status.chains[0].watermark.is_none());
        assert!(!status.chains[0].halted);
        assert!(status.chains[0].providers.is_empty());
    }

    #[test]
    fn test_reload_targets_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("targets.yaml");
        std::fs::write(&path, "targets: []\n").unwrap();

        let mut config = AppConfig::from_yaml(CONFIG).unwrap();
        config.targets_path = path.to_string_lossy().into_owned();
        let catalog = Arc::new(TargetCatalog::from_file(&path).unwrap());
        let engine = Engine::new(config, Arc::new(MemoryStore::new()), catalog.clone());
        assert_eq!(catalog.len(), 0);

        std::fs::write(
            &path,
            format!("targets:\n  - chain_id: 1\n    address: \"{SHOP}\"\n    kind: native\n"),
        )
        .unwrap();
        assert_eq!(engine.reload_targets().unwrap(), 1);
        assert_eq!(catalog.len(), 1);

        std::fs::write(&path, "targets: [ {").unwrap();
        assert!(engine.reload_targets().is_err());
        assert_eq!(catalog.len(), 1);
    }
}
