use crate::chain::ChainId;
use crate::store::{Lease, Store, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Holds a chain lease and renews it at a third of its TTL
pub struct LeaseKeeper {
    store: Arc<dyn Store>,
    lease: Lease,
    ttl: Duration,
    renewed_at: Instant,
}

impl LeaseKeeper {
    /// Block until the lease is ours. Retries every `retry` while another
    /// holder owns it. `None` if shutdown was requested first.
    pub async fn acquire(
        store: Arc<dyn Store>,
        chain: ChainId,
        holder: &str,
        ttl: Duration,
        retry: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<Self>, StoreError> {
        let mut logged = false;
        loop {
            if *shutdown.borrow() {
                return Ok(None);
            }
            if let Some(lease) = store.acquire_lease(chain, holder, ttl).await? {
                info!(%chain, holder, token = %lease.token, "Chain lease acquired");
                return Ok(Some(Self {
                    store,
                    lease,
                    ttl,
                    renewed_at: Instant::now(),
                }));
            }
            if !logged {
                info!(%chain, "Chain lease held elsewhere, waiting");
                logged = true;
            }
            tokio::select! {
                _ = tokio::time::sleep(retry) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    pub fn chain(&self) -> ChainId {
        self.lease.chain
    }

    fn renew_due(&self) -> bool {
        self.renewed_at.elapsed() >= self.ttl / 3
    }

    /// Renew if a third of the TTL has passed. `LeaseLost` means another
    /// worker took over and this one must stop writing.
    pub async fn renew_if_due(&mut self) -> Result<(), StoreError> {
        if !self.renew_due() {
            return Ok(());
        }
        self.store.renew_lease(&self.lease, self.ttl).await?;
        self.renewed_at = Instant::now();
        debug!(chain = %self.lease.chain, "Chain lease renewed");
        Ok(())
    }

    pub async fn release(self) {
        if let Err(e) = self.store.release_lease(&self.lease).await {
            warn!(chain = %self.lease.chain, error = %e, "Failed to release chain lease");
        } else {
            info!(chain = %self.lease.chain, "Chain lease released");
        }
    }
}
