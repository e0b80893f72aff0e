//! Transfer data model
//!
//! A [`Transfer`] is a common record plus one of three origin variants. Each
//! variant holds at most one [`Execution`] and at most one [`Confirmation`];
//! `CONFIRMED` is only reachable through [`Transfer::confirm`], which attaches
//! the confirmation.

use super::error::TransferError;
use super::state::TransferStatus;
use crate::chain::{Address, ChainId, TokenAmount, TokenRef};
use crate::extractor::EventKind;
use crate::ids::ulid_id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

ulid_id!(
    /// Transfer identifier
    TransferId
);

/// Sender or receiver of a transfer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    /// On-chain account or contract
    Address(Address),
    /// Internal ledger account
    Account(String),
}

impl Party {
    pub fn address(&self) -> Option<&Address> {
        match self {
            Party::Address(address) => Some(address),
            Party::Account(_) => None,
        }
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Party::Address(address) => write!(f, "{}", address),
            Party::Account(name) => write!(f, "account:{}", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    pub executed_at: DateTime<Utc>,
    /// Block that included the transfer, for on-chain transfers
    pub height: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub confirmed_at: DateTime<Utc>,
    /// Processed head at confirmation time, for on-chain transfers
    pub height: Option<u64>,
}

impl Confirmation {
    pub fn now() -> Self {
        Self {
            confirmed_at: Utc::now(),
            height: None,
        }
    }

    pub fn at_height(confirmed_at: DateTime<Utc>, height: u64) -> Self {
        Self {
            confirmed_at,
            height: Some(height),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockchainOrigin {
    pub chain: ChainId,
    pub block_height: u64,
    pub block_hash: String,
    pub tx_hash: String,
    pub log_index: u64,
    pub event_kind: EventKind,
    /// Tracked target that reported the movement
    pub contract: Address,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RaidenDirection {
    Received,
    Sent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaidenOrigin {
    pub chain: ChainId,
    /// Our node that reported the payment
    pub node: Address,
    pub identifier: u64,
    pub partner: Address,
    pub direction: RaidenDirection,
    pub log_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransferKind {
    Internal {
        memo: Option<String>,
        execution: Option<Execution>,
        confirmation: Option<Confirmation>,
    },
    Blockchain {
        origin: BlockchainOrigin,
        execution: Option<Execution>,
        confirmation: Option<Confirmation>,
    },
    Raiden {
        origin: RaidenOrigin,
        execution: Option<Execution>,
        confirmation: Option<Confirmation>,
    },
}

impl TransferKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferKind::Internal { .. } => "internal",
            TransferKind::Blockchain { .. } => "blockchain",
            TransferKind::Raiden { .. } => "raiden",
        }
    }

    pub fn execution(&self) -> Option<&Execution> {
        match self {
            TransferKind::Internal { execution, .. }
            | TransferKind::Blockchain { execution, .. }
            | TransferKind::Raiden { execution, .. } => execution.as_ref(),
        }
    }

    pub fn confirmation(&self) -> Option<&Confirmation> {
        match self {
            TransferKind::Internal { confirmation, .. }
            | TransferKind::Blockchain { confirmation, .. }
            | TransferKind::Raiden { confirmation, .. } => confirmation.as_ref(),
        }
    }

    fn confirmation_slot(&mut self) -> &mut Option<Confirmation> {
        match self {
            TransferKind::Internal { confirmation, .. }
            | TransferKind::Blockchain { confirmation, .. }
            | TransferKind::Raiden { confirmation, .. } => confirmation,
        }
    }

    fn execution_slot(&mut self) -> &mut Option<Execution> {
        match self {
            TransferKind::Internal { execution, .. }
            | TransferKind::Blockchain { execution, .. }
            | TransferKind::Raiden { execution, .. } => execution,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub amount: TokenAmount,
    pub token: TokenRef,
    pub sender: Party,
    pub receiver: Party,
    pub status: TransferStatus,
    pub created_at: DateTime<Utc>,
    pub kind: TransferKind,
}

impl Transfer {
    /// Ledger-only transfer, executed and confirmed on creation
    pub fn internal(
        sender: String,
        receiver: String,
        token: TokenRef,
        amount: TokenAmount,
        memo: Option<String>,
    ) -> Result<Self, TransferError> {
        if amount.is_zero() {
            return Err(TransferError::InvalidAmount);
        }
        let now = Utc::now();
        Ok(Self {
            id: TransferId::new(),
            amount,
            token,
            sender: Party::Account(sender),
            receiver: Party::Account(receiver),
            status: TransferStatus::Confirmed,
            created_at: now,
            kind: TransferKind::Internal {
                memo,
                execution: Some(Execution {
                    executed_at: now,
                    height: None,
                }),
                confirmation: Some(Confirmation {
                    confirmed_at: now,
                    height: None,
                }),
            },
        })
    }

    /// On-chain transfer observed in a block, pending until deep enough
    pub fn blockchain(
        origin: BlockchainOrigin,
        token: TokenRef,
        sender: Address,
        receiver: Address,
        amount: TokenAmount,
        executed_at: DateTime<Utc>,
    ) -> Self {
        let execution = Execution {
            executed_at,
            height: Some(origin.block_height),
        };
        Self {
            id: TransferId::new(),
            amount,
            token,
            sender: Party::Address(sender),
            receiver: Party::Address(receiver),
            status: TransferStatus::Pending,
            created_at: Utc::now(),
            kind: TransferKind::Blockchain {
                origin,
                execution: Some(execution),
                confirmation: None,
            },
        }
    }

    /// Channel payment reported as successful by the node
    pub fn raiden(
        origin: RaidenOrigin,
        token: TokenRef,
        sender: Address,
        receiver: Address,
        amount: TokenAmount,
    ) -> Self {
        let execution = Execution {
            executed_at: origin.log_time,
            height: None,
        };
        Self {
            id: TransferId::new(),
            amount,
            token,
            sender: Party::Address(sender),
            receiver: Party::Address(receiver),
            status: TransferStatus::Confirmed,
            created_at: Utc::now(),
            kind: TransferKind::Raiden {
                origin,
                execution: Some(execution),
                confirmation: Some(Confirmation::now()),
            },
        }
    }

    pub fn chain(&self) -> ChainId {
        self.token.chain()
    }

    /// Height of the block that carried the transfer; on-chain only
    pub fn origin_height(&self) -> Option<u64> {
        match &self.kind {
            TransferKind::Blockchain { origin, .. } => Some(origin.block_height),
            _ => None,
        }
    }

    pub fn confirmed_at_height(&self) -> Option<u64> {
        self.kind.confirmation().and_then(|c| c.height)
    }

    /// Identity of the underlying movement: two transfers with the same key
    /// describe the same thing. On-chain keys include the block hash, so a
    /// transaction re-mined on a new branch is a new transfer.
    pub fn dedupe_key(&self) -> String {
        match &self.kind {
            TransferKind::Internal { .. } => format!("internal:{}", self.id),
            TransferKind::Blockchain { origin, .. } => format!(
                "chain:{}:{}:{}:{}",
                origin.chain, origin.block_hash, origin.tx_hash, origin.log_index
            ),
            TransferKind::Raiden { origin, .. } => format!(
                "raiden:{}:{}:{}",
                origin.node,
                origin.identifier,
                origin.log_time.timestamp_millis()
            ),
        }
    }

    /// PENDING -> CONFIRMED, attaching the confirmation record
    pub fn confirm(&mut self, confirmation: Confirmation) -> Result<(), TransferError> {
        if self.status != TransferStatus::Pending {
            return Err(TransferError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: TransferStatus::Confirmed,
            });
        }
        let slot = self.kind.confirmation_slot();
        if slot.is_some() {
            return Err(TransferError::AlreadyConfirmed(self.id));
        }
        *slot = Some(confirmation);
        self.status = TransferStatus::Confirmed;
        Ok(())
    }

    /// PENDING -> REVERTED
    pub fn revert(&mut self) -> Result<(), TransferError> {
        if self.status != TransferStatus::Pending {
            return Err(TransferError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: TransferStatus::Reverted,
            });
        }
        self.status = TransferStatus::Reverted;
        Ok(())
    }

    pub fn attach_execution(&mut self, execution: Execution) -> Result<(), TransferError> {
        let slot = self.kind.execution_slot();
        if slot.is_some() {
            return Err(TransferError::AlreadyExecuted(self.id));
        }
        *slot = Some(execution);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    fn onchain() -> Transfer {
        Transfer::blockchain(
            BlockchainOrigin {
                chain: ChainId(1),
                block_height: 10,
                block_hash: "0xb".to_string(),
                tx_hash: "0xaa".to_string(),
                log_index: 3,
                event_kind: EventKind::Erc20Transfer,
                contract: addr("0x6b175474e89094c44da98b954eedeac495271d0f"),
            },
            TokenRef::Native { chain: ChainId(1) },
            addr("0x1111111111111111111111111111111111111111"),
            addr("0x2222222222222222222222222222222222222222"),
            TokenAmount(5),
            Utc::now(),
        )
    }

    #[test]
    fn test_internal_is_confirmed_at_creation() {
        let t = Transfer::internal(
            "alice".into(),
            "bob".into(),
            TokenRef::Native { chain: ChainId(1) },
            TokenAmount(10),
            Some("rent".into()),
        )
        .unwrap();
        assert_eq!(t.status, TransferStatus::Confirmed);
        assert!(t.kind.execution().is_some());
        assert!(t.kind.confirmation().is_some());
        assert!(t.origin_height().is_none());

        let zero = Transfer::internal(
            "alice".into(),
            "bob".into(),
            TokenRef::Native { chain: ChainId(1) },
            TokenAmount::ZERO,
            None,
        );
        assert_eq!(zero.unwrap_err(), TransferError::InvalidAmount);
    }

    #[test]
    fn test_single_confirmation_and_terminal_states() {
        let mut t = onchain();
        assert_eq!(t.status, TransferStatus::Pending);
        assert_eq!(t.origin_height(), Some(10));
        assert_eq!(t.kind.execution().and_then(|e| e.height), Some(10));

        t.confirm(Confirmation::at_height(Utc::now(), 22)).unwrap();
        assert_eq!(t.confirmed_at_height(), Some(22));
        assert!(matches!(
            t.confirm(Confirmation::now()),
            Err(TransferError::InvalidTransition { .. })
        ));
        assert!(t.revert().is_err());

        let mut r = onchain();
        r.revert().unwrap();
        assert!(r.confirm(Confirmation::now()).is_err());
        assert!(r.kind.confirmation().is_none());
    }

    #[test]
    fn test_execution_attached_once() {
        let mut t = onchain();
        let err = t
            .attach_execution(Execution {
                executed_at: Utc::now(),
                height: None,
            })
            .unwrap_err();
        assert_eq!(err, TransferError::AlreadyExecuted(t.id));
    }

    #[test]
    fn test_dedupe_key_and_serde() {
        let t = onchain();
        assert_eq!(t.dedupe_key(), "chain:1:0xb:0xaa:3");

        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json["kind"]["type"], "blockchain");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["amount"], "5");
        let back: Transfer = serde_json::from_value(json).unwrap();
        assert_eq!(back, t);
    }
}
