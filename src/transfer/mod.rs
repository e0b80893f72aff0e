//! Transfers
//!
//! Domain transfers derived from raw chain events, Raiden node reports and
//! internal ledger bookings.
//!
//! # State Machine
//!
//! ```text
//! PENDING → CONFIRMED   (origin block buried under confirmation_depth blocks)
//!    ↓
//! REVERTED              (origin block orphaned by a reorg)
//! ```
//!
//! # Invariants
//!
//! 1. Confirmed and reverted transfers never change status again
//! 2. A confirmation record is attached exactly when the status becomes CONFIRMED
//! 3. Transfers are never deleted

pub mod classifier;
pub mod error;
pub mod state;
pub mod types;

pub use classifier::classify;
pub use error::TransferError;
pub use state::{RevertOutcome, TransferStateMachine, TransferStatus, is_due};
pub use types::{
    BlockchainOrigin, Confirmation, Execution, Party, RaidenDirection, RaidenOrigin, Transfer,
    TransferId, TransferKind,
};
