//! Node providers
//!
//! Every call to a chain node flows through the [`ChainClient`] seam. The
//! [`ProviderRegistry`] owns the configured endpoints per chain and their
//! health; [`Failover`] walks the registry's candidate order with a per-call
//! timeout and reports each outcome back.

pub mod client;
pub mod error;
pub mod eth;
pub mod failover;
pub mod gas;
#[cfg(any(test, feature = "mock-chain"))]
pub mod mock;
pub mod registry;

pub use client::{ChainClient, FeeSample, LogEntry, TxEntry};
pub use error::ProviderError;
pub use eth::EthRpcClient;
pub use failover::Failover;
pub use gas::{GasPriceHistory, recommended_fee};
#[cfg(any(test, feature = "mock-chain"))]
pub use mock::MockChainClient;
pub use registry::{
    CallOutcome, HealthPolicy, HealthStatus, ProviderHandle, ProviderId, ProviderRegistry,
    ProviderStatus,
};
