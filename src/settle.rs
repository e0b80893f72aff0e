//! Reconciliation outside block commits
//!
//! Raiden payments, internal bookings and route rescans settle through
//! [`Store::commit_reconciliation`] instead of a block batch. Same rules as the
//! block pipeline: plan from a fresh snapshot, commit atomically, publish only
//! after the commit, re-plan on a lost claim.

use crate::chain::ChainId;
use crate::notify::EventBus;
use crate::reconcile::{MatchKey, ReconcileError, ReconcilePlan, Reconciler};
use crate::store::{Store, StoreError, TransferWrite};
use crate::transfer::Transfer;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

const MAX_SETTLE_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum SettleError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("Settlement still conflicting after {attempts} attempts")]
    Conflict { attempts: u32 },
}

#[derive(Clone)]
pub struct Settler {
    store: Arc<dyn Store>,
    reconciler: Reconciler,
    bus: EventBus,
}

impl Settler {
    pub fn new(store: Arc<dyn Store>, reconciler: Reconciler, bus: EventBus) -> Self {
        Self {
            store,
            reconciler,
            bus,
        }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Record `new` transfers and match them, together with already stored
    /// `existing` ones, against the open routes and trackers of `chain`
    pub async fn settle(
        &self,
        chain: ChainId,
        new: Vec<Transfer>,
        existing: Vec<Transfer>,
    ) -> Result<ReconcilePlan, SettleError> {
        let candidates: Vec<Transfer> = new.iter().chain(existing.iter()).cloned().collect();
        let keys: Vec<MatchKey> = candidates
            .iter()
            .filter_map(MatchKey::for_transfer)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut ctx = self.store.match_context(chain, &keys).await?;
            let mut plan = self.reconciler.plan(&candidates, &mut ctx)?;
            // Stored transfers already went through deposit matching when recorded
            plan.deposits.retain(|d| !existing.iter().any(|t| t.id == d.transfer_id));
            plan.validate()?;
            let writes = new.iter().cloned().map(TransferWrite::Insert).collect();

            match self.store.commit_reconciliation(writes, &plan).await {
                Ok(()) => {
                    if !plan.is_empty() {
                        info!(
                            %chain,
                            settlements = plan.claims.len(),
                            deposits = plan.deposits.len(),
                            "Reconciliation committed"
                        );
                    }
                    for event in plan.events() {
                        self.bus.publish(event);
                    }
                    return Ok(plan);
                }
                Err(e) if e.is_conflict() && attempt < MAX_SETTLE_ATTEMPTS => {
                    warn!(%chain, attempt, error = %e, "Reconciliation conflict, re-planning");
                }
                Err(e) if e.is_conflict() => return Err(SettleError::Conflict { attempts: attempt }),
                Err(e) => return Err(e.into()),
            }
        }
    }
}
