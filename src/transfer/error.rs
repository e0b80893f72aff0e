//! Transfer Error Types

use super::state::TransferStatus;
use super::types::TransferId;
use crate::extractor::{ContractKind, EventKind};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// No classifier entry for this (contract kind, event kind) pair
    #[error("Unmapped event kind {event} for {contract} target")]
    UnmappedEventKind {
        contract: ContractKind,
        event: EventKind,
    },

    #[error("Transfer {id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        id: TransferId,
        from: TransferStatus,
        to: TransferStatus,
    },

    #[error("Transfer {0} already carries a confirmation")]
    AlreadyConfirmed(TransferId),

    #[error("Transfer {0} already carries an execution")]
    AlreadyExecuted(TransferId),

    #[error("Amount must be greater than zero")]
    InvalidAmount,
}

impl TransferError {
    /// Diagnostic code for logs and API responses
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::UnmappedEventKind { .. } => "UNMAPPED_EVENT_KIND",
            TransferError::InvalidTransition { .. } => "INVALID_TRANSITION",
            TransferError::AlreadyConfirmed(_) => "ALREADY_CONFIRMED",
            TransferError::AlreadyExecuted(_) => "ALREADY_EXECUTED",
            TransferError::InvalidAmount => "INVALID_AMOUNT",
        }
    }
}
