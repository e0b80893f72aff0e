//! Event Extractor
//!
//! Turns a canonical block into typed [`RawEvent`]s for the chain's tracked
//! targets. Logs are fetched per block hash and filtered by the target catalog;
//! native value transfers are only scanned when the chain has native targets.
//!
//! ```text
//! Block ──► eth_getLogs{blockHash, address[]} ──► decode ──► RawEvent
//!       └─► transactions (native targets only) ──────────┘
//! ```

pub mod decode;
pub mod error;
pub mod scan;
pub mod targets;

pub use decode::{
    CHANNEL_NEW_DEPOSIT_TOPIC, CHANNEL_WITHDRAW_TOPIC, ERC20_TRANSFER_TOPIC, event_topic,
};
pub use error::{DecodeError, ExtractError};
pub use scan::{EventExtractor, ExtractOutcome};
pub use targets::{ChainTargets, TargetCatalog, TrackedTarget};

use crate::chain::{Address, ChainId, TokenAmount, TokenRef};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Log index slot used for native value transfers: tx index with this bit set
pub const NATIVE_LOG_INDEX_FLAG: u64 = 1 << 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractKind {
    Erc20,
    TokenNetwork,
    Native,
}

impl ContractKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractKind::Erc20 => "erc20",
            ContractKind::TokenNetwork => "token_network",
            ContractKind::Native => "native",
        }
    }

    /// Event kinds watched for this contract kind when the catalog omits them
    pub fn default_events(&self) -> &'static [EventKind] {
        match self {
            ContractKind::Erc20 => &[EventKind::Erc20Transfer],
            ContractKind::TokenNetwork => &[EventKind::ChannelDeposit, EventKind::ChannelWithdraw],
            ContractKind::Native => &[EventKind::NativeTransfer],
        }
    }
}

impl fmt::Display for ContractKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Erc20Transfer,
    ChannelDeposit,
    ChannelWithdraw,
    NativeTransfer,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Erc20Transfer => "erc20_transfer",
            EventKind::ChannelDeposit => "channel_deposit",
            EventKind::ChannelWithdraw => "channel_withdraw",
            EventKind::NativeTransfer => "native_transfer",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded event body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    Erc20Transfer {
        from: Address,
        to: Address,
        value: TokenAmount,
    },
    ChannelDeposit {
        channel_id: String,
        participant: Address,
        total_deposit: TokenAmount,
    },
    ChannelWithdraw {
        channel_id: String,
        participant: Address,
        total_withdraw: TokenAmount,
    },
    NativeTransfer {
        from: Address,
        to: Address,
        value: TokenAmount,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Erc20Transfer { .. } => EventKind::Erc20Transfer,
            EventPayload::ChannelDeposit { .. } => EventKind::ChannelDeposit,
            EventPayload::ChannelWithdraw { .. } => EventKind::ChannelWithdraw,
            EventPayload::NativeTransfer { .. } => EventKind::NativeTransfer,
        }
    }
}

/// Unique key of a raw event: (chain, tx hash, log index)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawEventKey {
    pub chain: ChainId,
    pub tx_hash: String,
    pub log_index: u64,
}

impl fmt::Display for RawEventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.chain, self.tx_hash, self.log_index)
    }
}

/// A tracked on-chain event, immutable once recorded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub chain: ChainId,
    pub block_height: u64,
    pub block_hash: String,
    pub tx_hash: String,
    pub log_index: u64,
    /// Emitting contract, or the receiving account for native transfers
    pub address: Address,
    pub contract_kind: ContractKind,
    pub token: TokenRef,
    pub payload: EventPayload,
}

impl RawEvent {
    pub fn key(&self) -> RawEventKey {
        RawEventKey {
            chain: self.chain,
            tx_hash: self.tx_hash.clone(),
            log_index: self.log_index,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}
