use crate::chain::ChainDataError;
use crate::provider::ProviderError;
use thiserror::Error;

/// A log that matched a target but could not be decoded. Skipped, never fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Expected {expected} topics, got {actual}")]
    TopicCount { expected: usize, actual: usize },

    #[error("Data too short: expected {expected} bytes, got {actual}")]
    ShortData { expected: usize, actual: usize },

    #[error("Amount overflow: {0}")]
    AmountOverflow(String),

    #[error("Malformed field: {0}")]
    Malformed(String),
}

impl From<ChainDataError> for DecodeError {
    fn from(e: ChainDataError) -> Self {
        match e {
            ChainDataError::Overflow(v) => DecodeError::AmountOverflow(v),
            other => DecodeError::Malformed(other.to_string()),
        }
    }
}

/// Extraction only fails when no provider could serve the block's logs or
/// transactions; the caller retries the whole block.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
}
