//! Chain Primitives
//!
//! Identifiers, block references, addresses and token amounts shared by every
//! stage of the indexing pipeline. Hashes and addresses are normalized to
//! lowercase `0x`-prefixed hex on construction so that comparisons never depend
//! on the casing a provider happened to return.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChainDataError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid hex quantity: {0}")]
    InvalidQuantity(String),

    #[error("Quantity exceeds 128 bits: {0}")]
    Overflow(String),
}

/// EVM chain id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(pub u64);

impl ChainId {
    #[inline]
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ChainId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Block as seen on the canonical chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub chain: ChainId,
    pub height: u64,
    pub hash: String,
    pub parent_hash: String,
    pub timestamp: i64,
}

impl Block {
    pub fn new(
        chain: ChainId,
        height: u64,
        hash: &str,
        parent_hash: &str,
        timestamp: i64,
    ) -> Self {
        Self {
            chain,
            height,
            hash: normalize_hex(hash),
            parent_hash: normalize_hex(parent_hash),
            timestamp,
        }
    }

    pub fn block_ref(&self) -> BlockRef {
        BlockRef {
            height: self.height,
            hash: self.hash.clone(),
        }
    }

    /// True if this block sits directly on top of `parent`
    pub fn extends(&self, parent: &BlockRef) -> bool {
        self.height == parent.height + 1 && self.parent_hash == parent.hash
    }
}

/// (height, hash) pair identifying an accepted block
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    pub height: u64,
    pub hash: String,
}

impl BlockRef {
    pub fn new(height: u64, hash: &str) -> Self {
        Self {
            height,
            hash: normalize_hex(hash),
        }
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.height, short_hash(&self.hash))
    }
}

/// 20-byte account or contract address, stored lowercase
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn parse(s: &str) -> Result<Self, ChainDataError> {
        let body = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .ok_or_else(|| ChainDataError::InvalidAddress(s.to_string()))?;
        if body.len() != 40 || !body.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ChainDataError::InvalidAddress(s.to_string()));
        }
        Ok(Self(format!("0x{}", body.to_lowercase())))
    }

    /// Extract an address from a 32-byte left-padded log topic
    pub fn from_topic(topic: &str) -> Result<Self, ChainDataError> {
        let body = topic.trim_start_matches("0x");
        match body.get(24..) {
            Some(tail) if body.len() == 64 => Self::parse(&format!("0x{tail}")),
            _ => Err(ChainDataError::InvalidAddress(topic.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = ChainDataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Address::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Token identity: the chain's native coin or an ERC20 contract
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TokenRef {
    Native { chain: ChainId },
    Erc20 { chain: ChainId, address: Address },
}

impl TokenRef {
    pub fn chain(&self) -> ChainId {
        match self {
            TokenRef::Native { chain } | TokenRef::Erc20 { chain, .. } => *chain,
        }
    }
}

impl fmt::Display for TokenRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenRef::Native { chain } => write!(f, "{}:native", chain),
            TokenRef::Erc20 { chain, address } => write!(f, "{}:{}", chain, address),
        }
    }
}

/// Amount in the token's base units (wei for ETH)
///
/// Serialized as a decimal string: JSON numbers cannot carry 128 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TokenAmount(pub u128);

impl TokenAmount {
    pub const ZERO: TokenAmount = TokenAmount(0);

    #[inline]
    pub fn raw(&self) -> u128 {
        self.0
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn saturating_sub(self, other: TokenAmount) -> TokenAmount {
        TokenAmount(self.0.saturating_sub(other.0))
    }

    pub fn checked_add(self, other: TokenAmount) -> Option<TokenAmount> {
        self.0.checked_add(other.0).map(TokenAmount)
    }

    /// Parse a `0x` hex quantity (JSON-RPC encoding)
    pub fn from_hex(s: &str) -> Result<Self, ChainDataError> {
        parse_hex_u128(s).map(TokenAmount)
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u128> for TokenAmount {
    fn from(value: u128) -> Self {
        Self(value)
    }
}

impl FromStr for TokenAmount {
    type Err = ChainDataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u128>()
            .map(TokenAmount)
            .map_err(|_| ChainDataError::InvalidQuantity(s.to_string()))
    }
}

impl Serialize for TokenAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Number(u64),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Text(s) => s.parse().map_err(serde::de::Error::custom),
            Repr::Number(n) => Ok(TokenAmount(n as u128)),
        }
    }
}

/// Lowercase a hex string and make sure it carries the `0x` prefix
pub fn normalize_hex(s: &str) -> String {
    let body = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    format!("0x{}", body.to_lowercase())
}

pub fn short_hash(hash: &str) -> &str {
    let end = hash.len().min(10);
    hash.get(..end).unwrap_or(hash)
}

pub fn parse_hex_u64(s: &str) -> Result<u64, ChainDataError> {
    let body = s.trim_start_matches("0x");
    if body.is_empty() {
        return Err(ChainDataError::InvalidQuantity(s.to_string()));
    }
    u64::from_str_radix(body, 16).map_err(|_| ChainDataError::InvalidQuantity(s.to_string()))
}

pub fn parse_hex_u128(s: &str) -> Result<u128, ChainDataError> {
    let body = s.trim_start_matches("0x").trim_start_matches('0');
    if body.is_empty() {
        return Ok(0);
    }
    if body.len() > 32 {
        return Err(ChainDataError::Overflow(s.to_string()));
    }
    u128::from_str_radix(body, 16).map_err(|_| ChainDataError::InvalidQuantity(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_normalized_lowercase() {
        let a = Address::parse("0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045").unwrap();
        let b = Address::parse("0xD8DA6BF26964AF9D7EED9E03E53415D37AA96045").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "0xd8da6bf26964af9d7eed9e03e53415d37aa96045");
    }

    #[test]
    fn test_address_rejects_bad_input() {
        assert!(Address::parse("d8dA6BF26964aF9D7eEd9e03E53415D37aA96045").is_err());
        assert!(Address::parse("0x1234").is_err());
        assert!(Address::parse("0xzz dA6BF26964aF9D7eEd9e03E53415D37aA960").is_err());
    }

    #[test]
    fn test_address_from_topic() {
        let topic = "0x000000000000000000000000d8da6bf26964af9d7eed9e03e53415d37aa96045";
        let addr = Address::from_topic(topic).unwrap();
        assert_eq!(addr.as_str(), "0xd8da6bf26964af9d7eed9e03e53415d37aa96045");
        assert!(Address::from_topic("0x1234").is_err());
    }

    #[test]
    fn test_block_extends_parent() {
        let parent = BlockRef::new(9, "0xAA");
        let child = Block::new(ChainId(1), 10, "0xbb", "0xaa", 0);
        assert!(child.extends(&parent));

        let orphan = Block::new(ChainId(1), 10, "0xbb", "0xcc", 0);
        assert!(!orphan.extends(&parent));
    }

    #[test]
    fn test_hex_quantities() {
        assert_eq!(parse_hex_u64("0x10").unwrap(), 16);
        assert!(parse_hex_u64("0x").is_err());
        assert_eq!(parse_hex_u128("0x0").unwrap(), 0);
        assert_eq!(
            parse_hex_u128("0x0000000000000000000000000000000000000000000000000de0b6b3a7640000")
                .unwrap(),
            1_000_000_000_000_000_000
        );
        assert!(matches!(
            parse_hex_u128("0x1000000000000000000000000000000000"),
            Err(ChainDataError::Overflow(_))
        ));
    }

    #[test]
    fn test_token_amount_serde_as_string() {
        let amount = TokenAmount(340_282_366_920_938_463_463_374_607_431_768_211_455);
        let json = serde_json::to_string(&amount).unwrap();
        assert_eq!(json, "\"340282366920938463463374607431768211455\"");
        let back: TokenAmount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, amount);

        let from_number: TokenAmount = serde_json::from_str("42").unwrap();
        assert_eq!(from_number, TokenAmount(42));
    }
}
