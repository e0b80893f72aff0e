//! Provider Registry
//!
//! Configured node endpoints per chain and their liveness. Health is derived
//! from call outcomes, explicit sync probes and head lag against the chain's
//! other providers. Peer count is never consulted.
//!
//! ```text
//!            N consecutive failures | unsynced | head lag > max
//!  HEALTHY ───────────────────────────────────────────────────► DEGRADED
//!     ▲                                                            │
//!     └──────── M consecutive successes, synced, not lagging ──────┘
//! ```
//!
//! State sits in `DashMap`s so reports from concurrent workers and probes
//! never need an outer lock. No map guard is held across another map access.

use super::client::ChainClient;
use super::gas::GasPriceHistory;
use super::FeeSample;
use crate::chain::ChainId;
use crate::config::HealthConfig;
use crate::notify::{EngineEvent, EventBus};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ProviderId(pub u32);

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success { observed_head: Option<u64> },
    Failure,
}

pub type HealthPolicy = HealthConfig;

#[derive(Clone)]
pub struct ProviderHandle {
    pub id: ProviderId,
    pub chain: ChainId,
    pub endpoint: String,
    pub client: Arc<dyn ChainClient>,
}

impl fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("id", &self.id)
            .field("chain", &self.chain)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Point-in-time view of one provider
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub id: ProviderId,
    pub endpoint: String,
    pub status: HealthStatus,
    pub last_head: Option<u64>,
    pub synced: Option<bool>,
    pub gas_fee_wei: Option<String>,
    pub gas_fee_gwei: Option<Decimal>,
    pub success_ratio: f64,
    pub consecutive_failures: u32,
}

struct ProviderState {
    handle: ProviderHandle,
    status: HealthStatus,
    window: VecDeque<bool>,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_outcome_ok: Option<bool>,
    last_success: Option<Instant>,
    last_failure: Option<Instant>,
    last_head: Option<u64>,
    synced: Option<bool>,
    gas_fee: Option<u128>,
}

impl ProviderState {
    fn new(handle: ProviderHandle) -> Self {
        Self {
            handle,
            status: HealthStatus::Healthy,
            window: VecDeque::new(),
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_outcome_ok: None,
            last_success: None,
            last_failure: None,
            last_head: None,
            synced: None,
            gas_fee: None,
        }
    }

    fn record(&mut self, ok: bool, window_size: usize) {
        if self.window.len() >= window_size {
            self.window.pop_front();
        }
        self.window.push_back(ok);
        self.last_outcome_ok = Some(ok);
        if ok {
            self.consecutive_failures = 0;
            self.consecutive_successes = self.consecutive_successes.saturating_add(1);
            self.last_success = Some(Instant::now());
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.last_failure = Some(Instant::now());
        }
    }

    fn success_ratio(&self) -> f64 {
        if self.window.is_empty() {
            return 1.0;
        }
        let ok = self.window.iter().filter(|ok| **ok).count();
        ok as f64 / self.window.len() as f64
    }

    fn is_lagging(&self, best_head: u64, max_lag: u64) -> bool {
        self.last_head
            .is_some_and(|head| best_head.saturating_sub(head) > max_lag)
    }

    fn evaluate(&self, best_head: u64, policy: &HealthPolicy) -> HealthStatus {
        let lagging = self.is_lagging(best_head, policy.max_head_lag);
        let unsynced = self.synced == Some(false);
        match self.status {
            HealthStatus::Healthy
                if self.consecutive_failures >= policy.failure_threshold
                    || lagging
                    || unsynced =>
            {
                HealthStatus::Degraded
            }
            HealthStatus::Degraded
                if self.consecutive_successes >= policy.recovery_threshold
                    && !lagging
                    && !unsynced =>
            {
                HealthStatus::Healthy
            }
            current => current,
        }
    }
}

struct ChainEntry {
    providers: Vec<ProviderId>,
    policy: HealthPolicy,
    scaling: bool,
    cursor: AtomicUsize,
    gas_history: GasPriceHistory,
}

impl ChainEntry {
    fn new(policy: HealthPolicy, scaling: bool) -> Self {
        Self {
            providers: Vec::new(),
            policy,
            scaling,
            cursor: AtomicUsize::new(0),
            gas_history: GasPriceHistory::default(),
        }
    }
}

pub struct ProviderRegistry {
    providers: DashMap<ProviderId, ProviderState>,
    chains: DashMap<ChainId, ChainEntry>,
    next_id: AtomicU32,
    events: Option<EventBus>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: DashMap::new(),
            chains: DashMap::new(),
            next_id: AtomicU32::new(1),
            events: None,
        }
    }

    /// Publish provider-online / provider-offline transitions on `bus`
    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    /// Set the health policy of `chain`. Must precede `register` to take effect
    /// for the chain's first provider; later calls update the policy in place.
    pub fn configure_chain(&self, chain: ChainId, policy: HealthPolicy, is_scaling_network: bool) {
        self.chains
            .entry(chain)
            .and_modify(|entry| {
                entry.policy = policy;
                entry.scaling = is_scaling_network;
            })
            .or_insert_with(|| ChainEntry::new(policy, is_scaling_network));
    }

    pub fn register(&self, chain: ChainId, client: Arc<dyn ChainClient>) -> ProviderId {
        let id = ProviderId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let endpoint = client.endpoint().to_string();
        let handle = ProviderHandle {
            id,
            chain,
            endpoint: endpoint.clone(),
            client,
        };
        self.providers.insert(id, ProviderState::new(handle));
        self.chains
            .entry(chain)
            .or_insert_with(|| ChainEntry::new(HealthPolicy::default(), false))
            .providers
            .push(id);
        info!(chain = %chain, provider = %id, %endpoint, "Provider registered");
        id
    }

    pub fn is_scaling_network(&self, chain: ChainId) -> bool {
        self.chains.get(&chain).is_some_and(|entry| entry.scaling)
    }

    fn chain_providers(&self, chain: ChainId) -> Vec<ProviderId> {
        self.chains
            .get(&chain)
            .map(|entry| entry.providers.clone())
            .unwrap_or_default()
    }

    pub fn handles(&self, chain: ChainId) -> Vec<ProviderHandle> {
        self.chain_providers(chain)
            .into_iter()
            .filter_map(|id| self.providers.get(&id).map(|st| st.handle.clone()))
            .collect()
    }

    /// Healthy providers in call order: those whose last call succeeded first,
    /// rotated round-robin per call, then those whose last call failed, most
    /// recently successful first.
    pub fn list_healthy(&self, chain: ChainId) -> Vec<ProviderHandle> {
        let (ids, turn) = match self.chains.get(&chain) {
            Some(entry) => (
                entry.providers.clone(),
                entry.cursor.fetch_add(1, Ordering::Relaxed),
            ),
            None => return Vec::new(),
        };

        let mut fresh = Vec::new();
        let mut stale = Vec::new();
        for id in ids {
            let Some(st) = self.providers.get(&id) else {
                continue;
            };
            if st.status != HealthStatus::Healthy {
                continue;
            }
            if st.last_outcome_ok == Some(false) {
                stale.push((st.last_success, st.handle.clone()));
            } else {
                fresh.push(st.handle.clone());
            }
        }

        if !fresh.is_empty() {
            let len = fresh.len();
            fresh.rotate_left(turn % len);
        }
        stale.sort_by(|a, b| b.0.cmp(&a.0));
        fresh.extend(stale.into_iter().map(|(_, handle)| handle));
        fresh
    }

    /// Healthy providers, then degraded ones as recovery probes (least
    /// recently failed first). The failover order for every node call.
    pub fn list_candidates(&self, chain: ChainId) -> Vec<ProviderHandle> {
        let mut candidates = self.list_healthy(chain);
        let mut degraded: Vec<(Option<Instant>, ProviderHandle)> = self
            .chain_providers(chain)
            .into_iter()
            .filter_map(|id| {
                self.providers
                    .get(&id)
                    .filter(|st| st.status == HealthStatus::Degraded)
                    .map(|st| (st.last_failure, st.handle.clone()))
            })
            .collect();
        degraded.sort_by(|a, b| a.0.cmp(&b.0));
        candidates.extend(degraded.into_iter().map(|(_, handle)| handle));
        candidates
    }

    pub fn report_outcome(&self, provider: ProviderId, outcome: CallOutcome) {
        let Some(chain) = self.provider_chain(provider) else {
            return;
        };
        let window_size = self.policy(chain).window_size;
        if let Some(mut st) = self.providers.get_mut(&provider) {
            match outcome {
                CallOutcome::Success { observed_head } => {
                    st.record(true, window_size);
                    if let Some(head) = observed_head {
                        st.last_head = Some(head);
                    }
                }
                CallOutcome::Failure => st.record(false, window_size),
            }
        }
        self.reevaluate(chain);
    }

    /// Explicit sync probe result. Ignored on scaling networks.
    pub fn report_sync_status(&self, provider: ProviderId, synced: bool) {
        let Some(chain) = self.provider_chain(provider) else {
            return;
        };
        if self.is_scaling_network(chain) {
            return;
        }
        if let Some(mut st) = self.providers.get_mut(&provider) {
            st.synced = Some(synced);
        }
        self.reevaluate(chain);
    }

    /// Record a fee sample and store the resulting estimate
    pub fn report_gas_fee(&self, provider: ProviderId, sample: FeeSample) -> Option<u128> {
        let chain = self.provider_chain(provider)?;
        let estimate = self
            .chains
            .get_mut(&chain)
            .and_then(|mut entry| entry.gas_history.estimate(&sample));
        if let Some(mut st) = self.providers.get_mut(&provider) {
            st.gas_fee = estimate.or(st.gas_fee);
        }
        estimate
    }

    /// Highest head reported by any of the chain's providers
    pub fn best_head(&self, chain: ChainId) -> Option<u64> {
        self.chain_providers(chain)
            .into_iter()
            .filter_map(|id| self.providers.get(&id).and_then(|st| st.last_head))
            .max()
    }

    pub fn status_of(&self, provider: ProviderId) -> Option<HealthStatus> {
        self.providers.get(&provider).map(|st| st.status)
    }

    pub fn snapshot(&self, chain: ChainId) -> Vec<ProviderStatus> {
        self.chain_providers(chain)
            .into_iter()
            .filter_map(|id| {
                self.providers.get(&id).map(|st| ProviderStatus {
                    id,
                    endpoint: st.handle.endpoint.clone(),
                    status: st.status,
                    last_head: st.last_head,
                    synced: st.synced,
                    gas_fee_wei: st.gas_fee.map(|fee| fee.to_string()),
                    gas_fee_gwei: st.gas_fee.and_then(wei_to_gwei),
                    success_ratio: st.success_ratio(),
                    consecutive_failures: st.consecutive_failures,
                })
            })
            .collect()
    }

    fn provider_chain(&self, provider: ProviderId) -> Option<ChainId> {
        self.providers.get(&provider).map(|st| st.handle.chain)
    }

    fn policy(&self, chain: ChainId) -> HealthPolicy {
        self.chains
            .get(&chain)
            .map(|entry| entry.policy)
            .unwrap_or_default()
    }

    /// Re-derive health for every provider of `chain`; lag is relative, so one
    /// provider's new head can degrade another.
    fn reevaluate(&self, chain: ChainId) {
        let policy = self.policy(chain);
        let best_head = self.best_head(chain).unwrap_or(0);
        let mut transitions = Vec::new();

        for id in self.chain_providers(chain) {
            let Some(mut st) = self.providers.get_mut(&id) else {
                continue;
            };
            let next = st.evaluate(best_head, &policy);
            if next != st.status {
                st.status = next;
                if next == HealthStatus::Healthy {
                    st.consecutive_successes = 0;
                }
                transitions.push((next, st.handle.endpoint.clone(), st.last_head));
            }
        }

        for (status, endpoint, last_head) in transitions {
            match status {
                HealthStatus::Healthy => {
                    info!(chain = %chain, %endpoint, "Provider back online");
                    self.publish(EngineEvent::ProviderOnline { chain, endpoint });
                }
                HealthStatus::Degraded => {
                    warn!(chain = %chain, %endpoint, ?last_head, best_head, "Provider degraded");
                    self.publish(EngineEvent::ProviderOffline { chain, endpoint });
                }
            }
        }
    }

    fn publish(&self, event: EngineEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Wei to gwei with 9 decimal places
fn wei_to_gwei(wei: u128) -> Option<Decimal> {
    let wei = i128::try_from(wei).ok()?;
    Decimal::try_from_i128_with_scale(wei, 9).ok()
}
