//! Transfer status and confirmation rules
//!
//! ```text
//! PENDING ──(origin + depth <= head)──► CONFIRMED
//!    │
//!    └──(origin block reverted)───────► REVERTED
//! ```
//!
//! Both targets are terminal. Status ids are stored as SMALLINT.

use super::types::{Confirmation, Transfer, TransferId};
use crate::tracker::RevertedRange;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum TransferStatus {
    Pending = 0,
    Confirmed = 10,
    Reverted = -10,
}

impl TransferStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransferStatus::Pending)
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(TransferStatus::Pending),
            10 => Some(TransferStatus::Confirmed),
            -10 => Some(TransferStatus::Reverted),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "PENDING",
            TransferStatus::Confirmed => "CONFIRMED",
            TransferStatus::Reverted => "REVERTED",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<i16> for TransferStatus {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        TransferStatus::from_id(value).ok_or(())
    }
}

/// `true` once a block at `origin_height` is `depth` blocks below `head`
#[inline]
pub fn is_due(origin_height: u64, head: u64, depth: u64) -> bool {
    origin_height
        .checked_add(depth)
        .is_some_and(|required| required <= head)
}

/// Advances blockchain transfers of one chain as the processed head moves
#[derive(Debug, Clone, Copy)]
pub struct TransferStateMachine {
    confirmation_depth: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RevertOutcome {
    pub reverted: Vec<TransferId>,
    /// Confirmed transfers inside the range; final, left untouched
    pub kept_confirmed: Vec<TransferId>,
}

impl TransferStateMachine {
    pub fn new(confirmation_depth: u64) -> Self {
        Self { confirmation_depth }
    }

    pub fn confirmation_depth(&self) -> u64 {
        self.confirmation_depth
    }

    /// Confirm every pending transfer deep enough under `head`.
    /// Returns the ids that changed.
    pub fn confirm_due(
        &self,
        transfers: &mut [Transfer],
        head: u64,
        now: DateTime<Utc>,
    ) -> Vec<TransferId> {
        let mut confirmed = Vec::new();
        for transfer in transfers.iter_mut() {
            if transfer.status != TransferStatus::Pending {
                continue;
            }
            let Some(origin) = transfer.origin_height() else {
                continue;
            };
            if !is_due(origin, head, self.confirmation_depth) {
                continue;
            }
            match transfer.confirm(Confirmation::at_height(now, head)) {
                Ok(()) => confirmed.push(transfer.id),
                Err(e) => warn!(transfer_id = %transfer.id, error = %e, "Cannot confirm transfer"),
            }
        }
        confirmed
    }

    /// Revert pending transfers whose origin block lies in `range`
    pub fn revert_range(&self, transfers: &mut [Transfer], range: &RevertedRange) -> RevertOutcome {
        let mut outcome = RevertOutcome::default();
        for transfer in transfers.iter_mut() {
            let Some(origin) = transfer.origin_height() else {
                continue;
            };
            if transfer.chain() != range.chain || !range.contains(origin) {
                continue;
            }
            match transfer.status {
                TransferStatus::Pending => match transfer.revert() {
                    Ok(()) => outcome.reverted.push(transfer.id),
                    Err(e) => warn!(transfer_id = %transfer.id, error = %e, "Cannot revert transfer"),
                },
                TransferStatus::Confirmed => {
                    warn!(
                        transfer_id = %transfer.id,
                        chain = %range.chain,
                        origin_height = origin,
                        "Reorg covers a confirmed transfer, keeping it"
                    );
                    outcome.kept_confirmed.push(transfer.id);
                }
                TransferStatus::Reverted => {}
            }
        }
        outcome
    }
}
