//! Log and transaction decoding
//!
//! Topic hashes are keccak-256 of the canonical event signatures. Amounts are
//! ABI `uint256` words; anything above 128 bits is rejected as an overflow
//! rather than truncated.

use super::error::DecodeError;
use super::{EventKind, EventPayload, NATIVE_LOG_INDEX_FLAG};
use crate::chain::{Address, TokenAmount, parse_hex_u128};
use crate::provider::{LogEntry, TxEntry};
use tiny_keccak::{Hasher, Keccak};

pub const ERC20_TRANSFER_SIGNATURE: &str = "Transfer(address,address,uint256)";
pub const CHANNEL_NEW_DEPOSIT_SIGNATURE: &str = "ChannelNewDeposit(uint256,address,uint256)";
pub const CHANNEL_WITHDRAW_SIGNATURE: &str = "ChannelWithdraw(uint256,address,uint256)";

pub const ERC20_TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";
pub const CHANNEL_NEW_DEPOSIT_TOPIC: &str =
    "0x2b55547a3b586ab51f65ee9ce4927fa6d25191388299988e89e059a02f9dd445";
pub const CHANNEL_WITHDRAW_TOPIC: &str =
    "0x98ed0357b86b313fa9f968de5c9d2bcf591432355b34aa1ab7e3e9e92f428408";

/// keccak-256 of an event signature as a `0x` topic string
pub fn event_topic(signature: &str) -> String {
    let mut hasher = Keccak::v256();
    let mut output = [0u8; 32];
    hasher.update(signature.as_bytes());
    hasher.finalize(&mut output);
    format!("0x{}", hex::encode(output))
}

/// Topic0 for an event kind, `None` for native transfers (no log)
pub fn topic_for(kind: EventKind) -> Option<&'static str> {
    match kind {
        EventKind::Erc20Transfer => Some(ERC20_TRANSFER_TOPIC),
        EventKind::ChannelDeposit => Some(CHANNEL_NEW_DEPOSIT_TOPIC),
        EventKind::ChannelWithdraw => Some(CHANNEL_WITHDRAW_TOPIC),
        EventKind::NativeTransfer => None,
    }
}

pub fn kind_for_topic(topic0: &str) -> Option<EventKind> {
    let topic0 = topic0.to_lowercase();
    [
        EventKind::Erc20Transfer,
        EventKind::ChannelDeposit,
        EventKind::ChannelWithdraw,
    ]
    .into_iter()
    .find(|kind| topic_for(*kind) == Some(topic0.as_str()))
}

/// Decode a log already matched to `kind` by its topic0
pub fn decode_log(kind: EventKind, log: &LogEntry) -> Result<EventPayload, DecodeError> {
    match kind {
        EventKind::Erc20Transfer => {
            expect_topics(log, 3)?;
            Ok(EventPayload::Erc20Transfer {
                from: Address::from_topic(&log.topics[1])?,
                to: Address::from_topic(&log.topics[2])?,
                value: word_amount(&log.data, 0)?,
            })
        }
        EventKind::ChannelDeposit => {
            expect_topics(log, 3)?;
            Ok(EventPayload::ChannelDeposit {
                channel_id: log.topics[1].to_lowercase(),
                participant: Address::from_topic(&log.topics[2])?,
                total_deposit: word_amount(&log.data, 0)?,
            })
        }
        EventKind::ChannelWithdraw => {
            expect_topics(log, 3)?;
            Ok(EventPayload::ChannelWithdraw {
                channel_id: log.topics[1].to_lowercase(),
                participant: Address::from_topic(&log.topics[2])?,
                total_withdraw: word_amount(&log.data, 0)?,
            })
        }
        EventKind::NativeTransfer => Err(DecodeError::Malformed(
            "native transfers are not carried by logs".to_string(),
        )),
    }
}

/// Decode a plain value transfer. `None` when it moves no value or has no recipient.
pub fn decode_native(tx: &TxEntry) -> Result<Option<EventPayload>, DecodeError> {
    let Some(to) = tx.to.as_deref() else {
        return Ok(None);
    };
    let value = TokenAmount(parse_hex_u128(&tx.value)?);
    if value.is_zero() {
        return Ok(None);
    }
    let from = tx
        .from
        .as_deref()
        .ok_or_else(|| DecodeError::Malformed(format!("tx {} has no sender", tx.hash)))?;
    Ok(Some(EventPayload::NativeTransfer {
        from: Address::parse(from)?,
        to: Address::parse(to)?,
        value,
    }))
}

pub fn native_log_index(tx_index: u64) -> u64 {
    tx_index | NATIVE_LOG_INDEX_FLAG
}

fn expect_topics(log: &LogEntry, expected: usize) -> Result<(), DecodeError> {
    if log.topics.len() != expected {
        return Err(DecodeError::TopicCount {
            expected,
            actual: log.topics.len(),
        });
    }
    Ok(())
}

/// Read the `index`-th 32-byte word of ABI data as an amount
fn word_amount(data: &str, index: usize) -> Result<TokenAmount, DecodeError> {
    let body = data.trim_start_matches("0x");
    let start = index * 64;
    let end = start + 64;
    if body.len() < end {
        return Err(DecodeError::ShortData {
            expected: end / 2,
            actual: body.len() / 2,
        });
    }
    let word = body
        .get(start..end)
        .filter(|word| word.is_ascii())
        .ok_or_else(|| DecodeError::Malformed(format!("non-hex data word {index}")))?;
    Ok(TokenAmount(parse_hex_u128(word)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic_of(addr: &str) -> String {
        format!("0x{:0>64}", addr.trim_start_matches("0x"))
    }

    fn transfer_log(topics: Vec<String>, data: &str) -> LogEntry {
        LogEntry {
            address: "0x6b175474e89094c44da98b954eedeac495271d0f".to_string(),
            topics,
            data: data.to_string(),
            tx_hash: "0xabc".to_string(),
            log_index: 3,
            block_hash: "0xb1".to_string(),
            removed: false,
        }
    }

    #[test]
    fn test_topic_constants_match_signatures() {
        assert_eq!(event_topic(ERC20_TRANSFER_SIGNATURE), ERC20_TRANSFER_TOPIC);
        assert_eq!(
            event_topic(CHANNEL_NEW_DEPOSIT_SIGNATURE),
            CHANNEL_NEW_DEPOSIT_TOPIC
        );
        assert_eq!(event_topic(CHANNEL_WITHDRAW_SIGNATURE), CHANNEL_WITHDRAW_TOPIC);
    }

    #[test]
    fn test_kind_for_topic_case_insensitive() {
        assert_eq!(
            kind_for_topic(&ERC20_TRANSFER_TOPIC.to_uppercase().replace("0X", "0x")),
            Some(EventKind::Erc20Transfer)
        );
        assert_eq!(kind_for_topic("0x1234"), None);
    }

    #[test]
    fn test_decode_erc20_transfer() {
        let log = transfer_log(
            vec![
                ERC20_TRANSFER_TOPIC.to_string(),
                topic_of("0x1111111111111111111111111111111111111111"),
                topic_of("0x2222222222222222222222222222222222222222"),
            ],
            "0x00000000000000000000000000000000000000000000000000000000000003e8",
        );
        let payload = decode_log(EventKind::Erc20Transfer, &log).unwrap();
        assert_eq!(
            payload,
            EventPayload::Erc20Transfer {
                from: Address::parse("0x1111111111111111111111111111111111111111").unwrap(),
                to: Address::parse("0x2222222222222222222222222222222222222222").unwrap(),
                value: TokenAmount(1000),
            }
        );
    }

    #[test]
    fn test_decode_rejects_nft_style_transfer() {
        // ERC721 shares the Transfer topic but indexes the token id
        let log = transfer_log(
            vec![
                ERC20_TRANSFER_TOPIC.to_string(),
                topic_of("0x1111111111111111111111111111111111111111"),
                topic_of("0x2222222222222222222222222222222222222222"),
                topic_of("0x01"),
            ],
            "0x",
        );
        assert_eq!(
            decode_log(EventKind::Erc20Transfer, &log),
            Err(DecodeError::TopicCount {
                expected: 3,
                actual: 4
            })
        );
    }

    #[test]
    fn test_decode_short_data_and_overflow() {
        let topics = vec![
            ERC20_TRANSFER_TOPIC.to_string(),
            topic_of("0x1111111111111111111111111111111111111111"),
            topic_of("0x2222222222222222222222222222222222222222"),
        ];
        let short = transfer_log(topics.clone(), "0x03e8");
        assert!(matches!(
            decode_log(EventKind::Erc20Transfer, &short),
            Err(DecodeError::ShortData { .. })
        ));

        let huge = transfer_log(
            topics,
            "0x0000000000000000000000000000000100000000000000000000000000000000",
        );
        assert!(matches!(
            decode_log(EventKind::Erc20Transfer, &huge),
            Err(DecodeError::AmountOverflow(_))
        ));
    }

    #[test]
    fn test_decode_multibyte_data_is_malformed() {
        let topics = vec![
            ERC20_TRANSFER_TOPIC.to_string(),
            topic_of("0x1111111111111111111111111111111111111111"),
            topic_of("0x2222222222222222222222222222222222222222"),
        ];
        let garbled = transfer_log(topics.clone(), &format!("0x{}", "é".repeat(40)));
        assert!(matches!(
            decode_log(EventKind::Erc20Transfer, &garbled),
            Err(DecodeError::Malformed(_))
        ));

        let mut bad_topic = transfer_log(topics, &format!("0x{:064x}", 5));
        bad_topic.topics[2] = format!("0x{}", "é".repeat(32));
        assert!(decode_log(EventKind::Erc20Transfer, &bad_topic).is_err());
    }

    #[test]
    fn test_decode_channel_deposit() {
        let log = transfer_log(
            vec![
                CHANNEL_NEW_DEPOSIT_TOPIC.to_string(),
                topic_of("0x07"),
                topic_of("0x3333333333333333333333333333333333333333"),
            ],
            "0x0000000000000000000000000000000000000000000000000000000000000064",
        );
        match decode_log(EventKind::ChannelDeposit, &log).unwrap() {
            EventPayload::ChannelDeposit {
                participant,
                total_deposit,
                ..
            } => {
                assert_eq!(
                    participant.as_str(),
                    "0x3333333333333333333333333333333333333333"
                );
                assert_eq!(total_deposit, TokenAmount(100));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_decode_native_skips_zero_value_and_contract_creation() {
        let mut tx = TxEntry {
            hash: "0xt1".to_string(),
            index: 4,
            from: Some("0x1111111111111111111111111111111111111111".to_string()),
            to: Some("0x2222222222222222222222222222222222222222".to_string()),
            value: "0x0".to_string(),
        };
        assert_eq!(decode_native(&tx).unwrap(), None);

        tx.value = "0xde0b6b3a7640000".to_string();
        assert!(matches!(
            decode_native(&tx).unwrap(),
            Some(EventPayload::NativeTransfer { value, .. }) if value == TokenAmount(1_000_000_000_000_000_000)
        ));

        tx.to = None;
        assert_eq!(decode_native(&tx).unwrap(), None);
    }

    #[test]
    fn test_native_log_index_never_collides_with_logs() {
        assert_ne!(native_log_index(3), 3);
        assert_eq!(native_log_index(3) & !NATIVE_LOG_INDEX_FLAG, 3);
    }
}
