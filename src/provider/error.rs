use crate::chain::{ChainDataError, ChainId};
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum ProviderError {
    #[error("RPC connection failed: {0}")]
    RpcConnection(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Call timed out after {0} ms")]
    Timeout(u64),

    #[error("Block not found at height {0}")]
    BlockNotFound(u64),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("All {attempts} providers for chain {chain} failed: {last}")]
    Unavailable {
        chain: ChainId,
        attempts: usize,
        last: String,
    },
}

impl From<ChainDataError> for ProviderError {
    fn from(e: ChainDataError) -> Self {
        ProviderError::InvalidResponse(e.to_string())
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::RpcConnection(e.to_string())
    }
}
