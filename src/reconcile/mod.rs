//! Reconciliation
//!
//! Matches confirmed transfers to open routes of payment orders and to
//! registered deposit trackers.
//!
//! ```text
//! Transfer(CONFIRMED) ──► MatchKey(receiver) ──► open routes, same token, in window
//!                                                    │ oldest first, then tie-break
//!                                                    ▼
//!                              claim route (CAS open → consumed) ──► Settlement
//! ```

pub mod error;
pub mod matcher;
pub mod types;

pub use error::ReconcileError;
pub use matcher::{MatchContext, ReconcilePlan, Reconciler, RouteClaim};
pub use types::{
    Deposit, DepositId, DepositTracker, MatchKey, OpenRouteRequest, OrderId, OrderStatus,
    PaymentOrder, PaymentWindow, RAIDEN_IDENTIFIER_MAX, RAIDEN_IDENTIFIER_MIN, Route,
    RouteDestination, RouteId, RouteStatus, RouteTarget, TrackerId, new_raiden_identifier,
};
