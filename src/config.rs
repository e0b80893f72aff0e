use crate::chain::ChainId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    #[serde(default)]
    pub engine: EngineConfig,
    pub chains: Vec<ChainConfig>,
    /// Tracked target catalog (YAML), reloadable at runtime
    pub targets_path: String,
    /// PostgreSQL connection URL; the in-memory store is used when absent
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub raiden: Vec<RaidenNodeConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    /// Identifies this process in lease ownership records
    pub instance_name: String,
    pub poll_interval_ms: u64,
    pub health_check_interval_ms: u64,
    pub provider_timeout_ms: u64,
    pub backfill_depth: u64,
    pub lease_ttl_ms: u64,
    pub channel_capacity: usize,
    pub backoff: BackoffConfig,
    pub health: HealthConfig,
    pub reconciliation: ReconciliationConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instance_name: "payment-indexer".to_string(),
            poll_interval_ms: 2_000,
            health_check_interval_ms: 30_000,
            provider_timeout_ms: 10_000,
            backfill_depth: 5_000,
            lease_ttl_ms: 30_000,
            channel_capacity: 256,
            backoff: BackoffConfig::default(),
            health: HealthConfig::default(),
            reconciliation: ReconciliationConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

/// Exponential backoff applied while a chain is unavailable
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub randomization_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            max_ms: 60_000,
            multiplier: 2.0,
            randomization_factor: 0.2,
        }
    }
}

impl BackoffConfig {
    /// Never gives up: `max_elapsed_time` is unset so the chain keeps retrying.
    pub fn build(&self) -> backoff::ExponentialBackoff {
        backoff::ExponentialBackoff {
            current_interval: Duration::from_millis(self.initial_ms),
            initial_interval: Duration::from_millis(self.initial_ms),
            multiplier: self.multiplier,
            randomization_factor: self.randomization_factor,
            max_interval: Duration::from_millis(self.max_ms),
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// Provider health thresholds
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    pub window_size: usize,
    pub failure_threshold: u32,
    pub recovery_threshold: u32,
    pub max_head_lag: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            failure_threshold: 3,
            recovery_threshold: 2,
            max_head_lag: 10,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AmountPolicy {
    #[default]
    Exact,
    AtLeast,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Lowest route id (ULID order) wins
    #[default]
    OldestId,
    /// Route whose outstanding amount is closest to the transfer amount wins
    ClosestAmount,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub default_amount_policy: AmountPolicy,
    pub allow_partial_fills: bool,
    pub tie_break: TieBreak,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            default_amount_policy: AmountPolicy::AtLeast,
            allow_partial_fills: false,
            tie_break: TieBreak::OldestId,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    #[serde(default = "default_confirmation_depth")]
    pub confirmation_depth: u64,
    #[serde(default = "default_max_reorg_depth")]
    pub max_reorg_depth: u64,
    #[serde(default = "default_max_blocks_per_poll")]
    pub max_blocks_per_poll: u64,
    /// Rollups and sidechains: no sync-status probes
    #[serde(default)]
    pub is_scaling_network: bool,
    /// Overrides `engine.backfill_depth` for this chain
    #[serde(default)]
    pub backfill_depth: Option<u64>,
    /// Overrides `engine.health` for this chain
    #[serde(default)]
    pub health: Option<HealthConfig>,
    pub providers: Vec<ProviderConfig>,
}

fn default_confirmation_depth() -> u64 {
    12
}

fn default_max_reorg_depth() -> u64 {
    64
}

fn default_max_blocks_per_poll() -> u64 {
    100
}

impl ChainConfig {
    pub fn chain(&self) -> ChainId {
        ChainId(self.chain_id)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProviderConfig {
    pub url: String,
    /// Sent as `Authorization: Bearer <token>`
    #[serde(default)]
    pub auth_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct NotificationConfig {
    /// Log every engine event at info level
    pub log_events: bool,
    /// POST every engine event as JSON to this URL
    pub webhook_url: Option<String>,
    pub broadcast_capacity: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RaidenNodeConfig {
    pub chain_id: u64,
    /// Node REST API base, e.g. `http://localhost:5001`
    pub url: String,
    /// On-chain address of the node's account
    pub address: String,
    pub tokens: Vec<String>,
    #[serde(default = "default_raiden_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_raiden_poll_interval_ms() -> u64 {
    5_000
}

impl AppConfig {
    pub fn load(env: &str) -> Result<Self, ConfigError> {
        Self::from_file(&format!("config/{}.yaml", env))
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chains.is_empty() {
            return Err(ConfigError::Invalid("No chains configured".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for chain in &self.chains {
            if !seen.insert(chain.chain_id) {
                return Err(ConfigError::Invalid(format!(
                    "Chain {} configured twice",
                    chain.chain_id
                )));
            }
            if chain.providers.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "Chain {} ({}) has no providers",
                    chain.name, chain.chain_id
                )));
            }
            if chain.confirmation_depth == 0 {
                return Err(ConfigError::Invalid(format!(
                    "Chain {}: confirmation_depth must be at least 1",
                    chain.name
                )));
            }
            if chain.max_blocks_per_poll == 0 {
                return Err(ConfigError::Invalid(format!(
                    "Chain {}: max_blocks_per_poll must be at least 1",
                    chain.name
                )));
            }
            let backfill = chain.backfill_depth.unwrap_or(self.engine.backfill_depth);
            if backfill < chain.confirmation_depth {
                return Err(ConfigError::Invalid(format!(
                    "Chain {}: backfill depth {} is below confirmation depth {}",
                    chain.name, backfill, chain.confirmation_depth
                )));
            }
        }
        if self.engine.health.window_size == 0 {
            return Err(ConfigError::Invalid(
                "engine.health.window_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
log_level: info
log_dir: ./logs
log_file: indexer.log
use_json: false
rotation: daily
targets_path: config/targets.yaml
engine:
  backfill_depth: 100
  reconciliation:
    tie_break: closest_amount
chains:
  - chain_id: 1
    name: mainnet
    confirmation_depth: 5
    providers:
      - url: http://localhost:8545
      - url: https://rpc.example.org
        auth_token: secret
  - chain_id: 137
    name: polygon
    is_scaling_network: true
    providers:
      - url: http://localhost:8546
"#;

    #[test]
    fn test_parse_sample_config() {
        let config = AppConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.chains.len(), 2);
        assert_eq!(config.chains[0].confirmation_depth, 5);
        assert_eq!(config.chains[0].providers[1].auth_token.as_deref(), Some("secret"));
        assert_eq!(config.chains[1].confirmation_depth, 12);
        assert!(config.chains[1].is_scaling_network);
        assert_eq!(config.engine.backfill_depth, 100);
        assert_eq!(config.engine.health, HealthConfig::default());
        assert_eq!(config.engine.reconciliation.tie_break, TieBreak::ClosestAmount);
        assert_eq!(
            config.engine.reconciliation.default_amount_policy,
            AmountPolicy::AtLeast
        );
        assert!(config.postgres_url.is_none());
    }

    #[test]
    fn test_chain_without_providers_rejected() {
        let yaml = SAMPLE.replace(
            "    providers:\n      - url: http://localhost:8546\n",
            "    providers: []\n",
        );
        let err = AppConfig::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("has no providers"));
    }

    #[test]
    fn test_backfill_shallower_than_confirmation_rejected() {
        let yaml = SAMPLE.replace("backfill_depth: 100", "backfill_depth: 3");
        let err = AppConfig::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_backoff_build_never_expires() {
        let backoff = BackoffConfig::default().build();
        assert!(backoff.max_elapsed_time.is_none());
        assert_eq!(backoff.initial_interval, Duration::from_millis(500));
    }
}
