//! payment_indexer - Multi-chain payment indexer
//!
//! Follows the canonical chain of every configured network, turns tracked
//! contract events into transfers, confirms them at depth, survives reorgs and
//! settles payment orders against them.
//!
//! # Modules
//!
//! - [`chain`] - Chain ids, blocks, addresses, token amounts
//! - [`config`] - YAML configuration
//! - [`provider`] - Node clients, provider registry, failover
//! - [`tracker`] - Chain head tracking and reorg detection
//! - [`extractor`] - Tracked targets and raw event extraction
//! - [`transfer`] - Transfer model, classification, confirmation state machine
//! - [`reconcile`] - Orders, routes, deposit trackers, matching
//! - [`store`] - Persistence (`MemoryStore`, `PgStore`)
//! - [`worker`] - Per-chain lease, backfill and block pipeline
//! - [`settle`] - Reconciliation outside block commits
//! - [`raiden`] - Raiden node payment ingestion
//! - [`notify`] - Engine events and their sinks
//! - [`status`] - Status snapshot
//! - [`engine`] - Facade wiring everything together

// Core types - must be first!
pub mod chain;
pub mod ids;

pub mod config;
pub mod logging;

// Chain access
pub mod extractor;
pub mod provider;
pub mod tracker;

// Payment domain
pub mod raiden;
pub mod reconcile;
pub mod settle;
pub mod transfer;

// Runtime
pub mod engine;
pub mod notify;
pub mod status;
pub mod store;
pub mod worker;

// Convenient re-exports at crate root
pub use chain::{Address, Block, BlockRef, ChainId, TokenAmount, TokenRef};
pub use config::AppConfig;
pub use engine::{Engine, EngineError};
pub use notify::{EngineEvent, EventBus};
pub use reconcile::{OpenRouteRequest, OrderId, PaymentOrder, Route, RouteId, RouteTarget};
pub use status::{ChainStatus, EngineStatus};
pub use store::{MemoryStore, PgStore, Store, StoreError};
pub use transfer::{Transfer, TransferId, TransferStatus};
pub use worker::{ChainWorker, WorkerExit};
