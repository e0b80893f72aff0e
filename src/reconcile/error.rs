use super::types::{OrderId, OrderStatus, RouteId};
use crate::chain::TokenRef;
use crate::transfer::TransferId;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// A plan claimed one route twice or settled one transfer twice. Fatal.
    #[error("Duplicate route consumption: route {route_id}, transfer {transfer_id}")]
    DuplicateRouteConsumption {
        route_id: RouteId,
        transfer_id: TransferId,
    },

    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    #[error("Order {id} is {status}, routes can only be opened on open orders")]
    OrderNotOpen { id: OrderId, status: OrderStatus },

    #[error("Route token {route} does not match order token {order}")]
    TokenMismatch { order: TokenRef, route: TokenRef },

    #[error("Invalid route: {0}")]
    InvalidRoute(String),

    #[error("Amount must be greater than zero")]
    InvalidAmount,
}

impl ReconcileError {
    /// Invariant violations halt the chain; everything else is a caller error
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReconcileError::DuplicateRouteConsumption { .. })
    }
}
