use super::client::ChainClient;
use super::error::ProviderError;
use super::registry::{CallOutcome, ProviderRegistry};
use crate::chain::ChainId;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Runs one logical node call against the chain's candidates in order.
///
/// Each attempt is bounded by `timeout`; a timeout counts as a failure of that
/// provider. Every outcome is reported to the registry.
#[derive(Clone)]
pub struct Failover {
    chain: ChainId,
    registry: Arc<ProviderRegistry>,
    timeout: Duration,
}

impl Failover {
    pub fn new(chain: ChainId, registry: Arc<ProviderRegistry>, timeout: Duration) -> Self {
        Self {
            chain,
            registry,
            timeout,
        }
    }

    pub fn chain(&self) -> ChainId {
        self.chain
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Head height from the first provider that answers
    pub async fn head(&self) -> Result<u64, ProviderError> {
        self.run("eth_blockNumber", |client| async move { client.head_height().await }, |head| {
            Some(*head)
        })
        .await
    }

    pub async fn call<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, ProviderError>
    where
        F: Fn(Arc<dyn ChainClient>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        self.run(op, f, |_| None).await
    }

    /// Probe every provider of the chain, degraded ones included: head,
    /// sync status (skipped on scaling networks) and a gas fee sample.
    /// Returns the number of providers that answered the head probe.
    pub async fn probe_all(&self) -> usize {
        let scaling = self.registry.is_scaling_network(self.chain);
        let mut answered = 0;
        for handle in self.registry.handles(self.chain) {
            let client = handle.client.clone();
            match tokio::time::timeout(self.timeout, client.head_height()).await {
                Ok(Ok(head)) => {
                    answered += 1;
                    self.registry.report_outcome(
                        handle.id,
                        CallOutcome::Success {
                            observed_head: Some(head),
                        },
                    );
                }
                Ok(Err(e)) => {
                    debug!(chain = %self.chain, endpoint = %handle.endpoint, error = %e, "Head probe failed");
                    self.registry.report_outcome(handle.id, CallOutcome::Failure);
                    continue;
                }
                Err(_) => {
                    debug!(chain = %self.chain, endpoint = %handle.endpoint, "Head probe timed out");
                    self.registry.report_outcome(handle.id, CallOutcome::Failure);
                    continue;
                }
            }

            if !scaling
                && let Ok(Ok(synced)) = tokio::time::timeout(self.timeout, client.is_synced()).await
            {
                self.registry.report_sync_status(handle.id, synced);
            }
            if let Ok(Ok(sample)) = tokio::time::timeout(self.timeout, client.fee_sample()).await {
                self.registry.report_gas_fee(handle.id, sample);
            }
        }
        answered
    }

    async fn run<T, F, Fut, O>(&self, op: &'static str, f: F, observe: O) -> Result<T, ProviderError>
    where
        F: Fn(Arc<dyn ChainClient>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
        O: Fn(&T) -> Option<u64>,
    {
        let candidates = self.registry.list_candidates(self.chain);
        let mut last_error = String::from("no providers registered");

        for handle in &candidates {
            let result = match tokio::time::timeout(self.timeout, f(handle.client.clone())).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(self.timeout.as_millis() as u64)),
            };

            match result {
                Ok(value) => {
                    self.registry.report_outcome(
                        handle.id,
                        CallOutcome::Success {
                            observed_head: observe(&value),
                        },
                    );
                    debug!(chain = %self.chain, provider = %handle.id, op, "Call succeeded");
                    return Ok(value);
                }
                Err(e) => {
                    warn!(
                        chain = %self.chain,
                        endpoint = %handle.endpoint,
                        op,
                        error = %e,
                        "Provider call failed, trying next candidate"
                    );
                    self.registry.report_outcome(handle.id, CallOutcome::Failure);
                    last_error = e.to_string();
                }
            }
        }

        Err(ProviderError::Unavailable {
            chain: self.chain,
            attempts: candidates.len(),
            last: last_error,
        })
    }
}
