//! Engine status
//!
//! Workers publish their phase and progress to a shared [`StatusBoard`]; the
//! engine combines it with provider snapshots and persisted watermarks.

use crate::chain::{BlockRef, ChainId};
use crate::provider::ProviderStatus;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainPhase {
    Starting,
    WaitingForLease,
    Backfilling,
    Live,
    Unavailable,
    Halted,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainProgress {
    pub phase: ChainPhase,
    pub last_block: Option<u64>,
    pub halted_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Default for ChainProgress {
    fn default() -> Self {
        Self {
            phase: ChainPhase::Starting,
            last_block: None,
            halted_reason: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
pub struct StatusBoard {
    chains: DashMap<ChainId, ChainProgress>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// A halted chain stays halted
    pub fn set_phase(&self, chain: ChainId, phase: ChainPhase) {
        let mut entry = self.chains.entry(chain).or_default();
        if entry.phase == ChainPhase::Halted {
            return;
        }
        entry.phase = phase;
        entry.updated_at = Utc::now();
    }

    pub fn block_processed(&self, chain: ChainId, height: u64) {
        let mut entry = self.chains.entry(chain).or_default();
        entry.last_block = Some(height);
        if matches!(entry.phase, ChainPhase::Unavailable) {
            entry.phase = ChainPhase::Live;
        }
        entry.updated_at = Utc::now();
    }

    pub fn halt(&self, chain: ChainId, reason: &str) {
        let mut entry = self.chains.entry(chain).or_default();
        entry.phase = ChainPhase::Halted;
        entry.halted_reason = Some(reason.to_string());
        entry.updated_at = Utc::now();
    }

    pub fn get(&self, chain: ChainId) -> ChainProgress {
        self.chains
            .get(&chain)
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    pub fn is_halted(&self, chain: ChainId) -> bool {
        self.chains
            .get(&chain)
            .is_some_and(|p| p.phase == ChainPhase::Halted)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainStatus {
    pub chain: ChainId,
    pub name: String,
    /// Best head reported by any provider
    pub head: Option<u64>,
    pub watermark: Option<BlockRef>,
    pub phase: ChainPhase,
    pub halted: bool,
    pub halted_reason: Option<String>,
    pub providers: Vec<ProviderStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub instance: String,
    pub generated_at: DateTime<Utc>,
    pub chains: Vec<ChainStatus>,
}
