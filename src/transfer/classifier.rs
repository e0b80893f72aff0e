//! Raw event → Transfer classification
//!
//! A fixed table from (contract kind, event kind) to a leg extractor. Pairs
//! missing from the table are reported as `UnmappedEventKind` and dropped by
//! the caller.

use super::error::TransferError;
use super::types::{BlockchainOrigin, Transfer};
use crate::chain::{Address, TokenAmount};
use crate::extractor::{ContractKind, EventKind, EventPayload, RawEvent};
use chrono::{DateTime, Utc};

/// Who paid whom, and how much
#[derive(Debug, Clone, PartialEq, Eq)]
struct Legs {
    sender: Address,
    receiver: Address,
    amount: TokenAmount,
}

type LegsFn = fn(&RawEvent) -> Option<Legs>;

const CLASSIFICATION_TABLE: &[(ContractKind, EventKind, LegsFn)] = &[
    (ContractKind::Erc20, EventKind::Erc20Transfer, erc20_transfer),
    (ContractKind::Native, EventKind::NativeTransfer, native_transfer),
    (ContractKind::TokenNetwork, EventKind::ChannelDeposit, channel_deposit),
    (ContractKind::TokenNetwork, EventKind::ChannelWithdraw, channel_withdraw),
];

fn erc20_transfer(event: &RawEvent) -> Option<Legs> {
    match &event.payload {
        EventPayload::Erc20Transfer { from, to, value } => Some(Legs {
            sender: from.clone(),
            receiver: to.clone(),
            amount: *value,
        }),
        _ => None,
    }
}

fn native_transfer(event: &RawEvent) -> Option<Legs> {
    match &event.payload {
        EventPayload::NativeTransfer { from, to, value } => Some(Legs {
            sender: from.clone(),
            receiver: to.clone(),
            amount: *value,
        }),
        _ => None,
    }
}

/// Participant funds the channel: participant → token network
fn channel_deposit(event: &RawEvent) -> Option<Legs> {
    match &event.payload {
        EventPayload::ChannelDeposit {
            participant,
            total_deposit,
            ..
        } => Some(Legs {
            sender: participant.clone(),
            receiver: event.address.clone(),
            amount: *total_deposit,
        }),
        _ => None,
    }
}

/// Participant withdraws: token network → participant
fn channel_withdraw(event: &RawEvent) -> Option<Legs> {
    match &event.payload {
        EventPayload::ChannelWithdraw {
            participant,
            total_withdraw,
            ..
        } => Some(Legs {
            sender: event.address.clone(),
            receiver: participant.clone(),
            amount: *total_withdraw,
        }),
        _ => None,
    }
}

/// Build the pending blockchain transfer for `event`
pub fn classify(event: &RawEvent, executed_at: DateTime<Utc>) -> Result<Transfer, TransferError> {
    let kind = event.kind();
    let unmapped = TransferError::UnmappedEventKind {
        contract: event.contract_kind,
        event: kind,
    };
    let legs_fn = CLASSIFICATION_TABLE
        .iter()
        .find(|(contract, event_kind, _)| *contract == event.contract_kind && *event_kind == kind)
        .map(|(_, _, f)| *f)
        .ok_or_else(|| unmapped.clone())?;
    let legs = legs_fn(event).ok_or(unmapped)?;

    let origin = BlockchainOrigin {
        chain: event.chain,
        block_height: event.block_height,
        block_hash: event.block_hash.clone(),
        tx_hash: event.tx_hash.clone(),
        log_index: event.log_index,
        event_kind: kind,
        contract: event.address.clone(),
    };
    Ok(Transfer::blockchain(
        origin,
        event.token.clone(),
        legs.sender,
        legs.receiver,
        legs.amount,
        executed_at,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainId, TokenRef};
    use crate::transfer::{Party, TransferKind, TransferStatus};

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    const NETWORK: &str = "0x3333333333333333333333333333333333333333";
    const USER: &str = "0x1111111111111111111111111111111111111111";
    const TOKEN: &str = "0x6b175474e89094c44da98b954eedeac495271d0f";

    fn event(contract_kind: ContractKind, payload: EventPayload) -> RawEvent {
        RawEvent {
            chain: ChainId(5),
            block_height: 77,
            block_hash: "0xb77".to_string(),
            tx_hash: "0xaa".to_string(),
            log_index: 1,
            address: addr(NETWORK),
            contract_kind,
            token: TokenRef::Erc20 {
                chain: ChainId(5),
                address: addr(TOKEN),
            },
            payload,
        }
    }

    #[test]
    fn test_channel_deposit_moves_into_network() {
        let e = event(
            ContractKind::TokenNetwork,
            EventPayload::ChannelDeposit {
                channel_id: "0x01".into(),
                participant: addr(USER),
                total_deposit: TokenAmount(900),
            },
        );
        let t = classify(&e, Utc::now()).unwrap();
        assert_eq!(t.sender, Party::Address(addr(USER)));
        assert_eq!(t.receiver, Party::Address(addr(NETWORK)));
        assert_eq!(t.amount, TokenAmount(900));
        assert_eq!(t.status, TransferStatus::Pending);
        assert!(matches!(
            t.kind,
            TransferKind::Blockchain { ref origin, .. } if origin.event_kind == EventKind::ChannelDeposit
        ));
    }

    #[test]
    fn test_channel_withdraw_moves_out_of_network() {
        let e = event(
            ContractKind::TokenNetwork,
            EventPayload::ChannelWithdraw {
                channel_id: "0x01".into(),
                participant: addr(USER),
                total_withdraw: TokenAmount(300),
            },
        );
        let t = classify(&e, Utc::now()).unwrap();
        assert_eq!(t.sender, Party::Address(addr(NETWORK)));
        assert_eq!(t.receiver, Party::Address(addr(USER)));
    }

    #[test]
    fn test_unmapped_pair_is_rejected() {
        let e = event(
            ContractKind::Erc20,
            EventPayload::ChannelDeposit {
                channel_id: "0x01".into(),
                participant: addr(USER),
                total_deposit: TokenAmount(1),
            },
        );
        assert_eq!(
            classify(&e, Utc::now()).unwrap_err(),
            TransferError::UnmappedEventKind {
                contract: ContractKind::Erc20,
                event: EventKind::ChannelDeposit,
            }
        );
    }
}
