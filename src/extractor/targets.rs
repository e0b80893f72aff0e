//! Tracked target catalog
//!
//! Operator-curated allow-list of contracts and accounts. Nothing is tracked
//! unless it appears here. The catalog lives behind an [`ArcSwap`] so a reload
//! swaps the whole snapshot at once; workers read a consistent view per block.

use super::{ContractKind, EventKind};
use crate::chain::{Address, ChainId, TokenRef};
use crate::config::ConfigError;
use arc_swap::ArcSwap;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    targets: Vec<TargetEntry>,
}

#[derive(Debug, Deserialize)]
struct TargetEntry {
    chain_id: u64,
    address: Address,
    kind: ContractKind,
    #[serde(default)]
    events: Vec<EventKind>,
    /// ERC20 token served by a token network contract
    #[serde(default)]
    token: Option<Address>,
    #[serde(default)]
    label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedTarget {
    pub chain: ChainId,
    pub address: Address,
    pub kind: ContractKind,
    pub events: Vec<EventKind>,
    /// Token whose movements this target reports
    pub token: TokenRef,
    pub label: Option<String>,
}

impl TrackedTarget {
    pub fn watches(&self, kind: EventKind) -> bool {
        self.events.contains(&kind)
    }
}

impl TryFrom<TargetEntry> for TrackedTarget {
    type Error = ConfigError;

    fn try_from(entry: TargetEntry) -> Result<Self, Self::Error> {
        let chain = ChainId(entry.chain_id);
        let token = match entry.kind {
            ContractKind::Erc20 => TokenRef::Erc20 {
                chain,
                address: entry.address.clone(),
            },
            ContractKind::Native => TokenRef::Native { chain },
            ContractKind::TokenNetwork => TokenRef::Erc20 {
                chain,
                address: entry.token.clone().ok_or_else(|| {
                    ConfigError::Invalid(format!(
                        "token_network target {} on chain {} needs a token",
                        entry.address, chain
                    ))
                })?,
            },
        };

        let events = if entry.events.is_empty() {
            entry.kind.default_events().to_vec()
        } else {
            entry.events
        };
        if let Some(bad) = events
            .iter()
            .find(|e| !entry.kind.default_events().contains(*e))
        {
            return Err(ConfigError::Invalid(format!(
                "{} target {} cannot emit {}",
                entry.kind, entry.address, bad
            )));
        }

        Ok(Self {
            chain,
            address: entry.address,
            kind: entry.kind,
            events,
            token,
            label: entry.label,
        })
    }
}

/// Targets of one chain, split by how they are scanned
#[derive(Debug, Default)]
pub struct ChainTargets {
    contracts: HashMap<Address, TrackedTarget>,
    accounts: HashMap<Address, TrackedTarget>,
}

impl ChainTargets {
    pub fn contract(&self, address: &Address) -> Option<&TrackedTarget> {
        self.contracts.get(address)
    }

    pub fn native_account(&self, address: &Address) -> Option<&TrackedTarget> {
        self.accounts.get(address)
    }

    /// Sorted so that `eth_getLogs` requests are stable across calls
    pub fn contract_addresses(&self) -> Vec<Address> {
        let mut addresses: Vec<Address> = self.contracts.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn has_native(&self) -> bool {
        !self.accounts.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty() && self.accounts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.contracts.len() + self.accounts.len()
    }
}

#[derive(Debug, Default)]
struct CatalogSnapshot {
    chains: HashMap<ChainId, Arc<ChainTargets>>,
}

impl CatalogSnapshot {
    fn build(targets: Vec<TrackedTarget>) -> Result<Self, ConfigError> {
        let mut chains: HashMap<ChainId, ChainTargets> = HashMap::new();
        for target in targets {
            let entry = chains.entry(target.chain).or_default();
            let slot = match target.kind {
                ContractKind::Native => &mut entry.accounts,
                _ => &mut entry.contracts,
            };
            if slot.contains_key(&target.address) {
                return Err(ConfigError::Invalid(format!(
                    "Target {} listed twice on chain {}",
                    target.address, target.chain
                )));
            }
            slot.insert(target.address.clone(), target);
        }
        Ok(Self {
            chains: chains
                .into_iter()
                .map(|(chain, targets)| (chain, Arc::new(targets)))
                .collect(),
        })
    }

    fn total(&self) -> usize {
        self.chains.values().map(|t| t.len()).sum()
    }
}

pub struct TargetCatalog {
    snapshot: ArcSwap<CatalogSnapshot>,
}

impl TargetCatalog {
    pub fn empty() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(CatalogSnapshot::default()),
        }
    }

    pub fn from_targets(targets: Vec<TrackedTarget>) -> Result<Self, ConfigError> {
        Ok(Self {
            snapshot: ArcSwap::from_pointee(CatalogSnapshot::build(targets)?),
        })
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Self::from_targets(parse_targets(content)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_yaml(&read_catalog(path.as_ref())?)
    }

    /// Current targets for `chain`. Empty when the chain tracks nothing.
    pub fn targets_for(&self, chain: ChainId) -> Arc<ChainTargets> {
        self.snapshot
            .load()
            .chains
            .get(&chain)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().total()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the catalog with `targets`. The old catalog stays on error.
    pub fn replace(&self, targets: Vec<TrackedTarget>) -> Result<usize, ConfigError> {
        let snapshot = CatalogSnapshot::build(targets)?;
        let total = snapshot.total();
        self.snapshot.store(Arc::new(snapshot));
        Ok(total)
    }

    /// Reload from disk, keeping the current catalog if the file is invalid
    pub fn reload_from_file(&self, path: impl AsRef<Path>) -> Result<usize, ConfigError> {
        let path = path.as_ref();
        let result = read_catalog(path)
            .and_then(|content| parse_targets(&content))
            .and_then(|targets| self.replace(targets));
        match &result {
            Ok(total) => info!(path = %path.display(), targets = total, "Target catalog reloaded"),
            Err(e) => error!(
                path = %path.display(),
                error = %e,
                "Invalid target catalog, keeping old configuration"
            ),
        }
        result
    }
}

fn read_catalog(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn parse_targets(content: &str) -> Result<Vec<TrackedTarget>, ConfigError> {
    let file: CatalogFile = serde_yaml::from_str(content)?;
    file.targets
        .into_iter()
        .map(TrackedTarget::try_from)
        .collect()
}
