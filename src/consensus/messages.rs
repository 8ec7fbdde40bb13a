//! Consensus wire messages.
//!
//! Three message kinds circulate among the coordinators of a height, each on
//! its own gossip channel: proposals carrying a full candidate unit, prevotes,
//! and precommits carrying the sender's approval signature. Precommit
//! signatures over the decided value are what ends up embedded in the
//! committed TrustME unit.

use serde::{Deserialize, Serialize};

use crate::identity::Address;
use crate::ledger::unit::{CoordinatorApproval, Unit, UnitId};
use crate::Hash;

/// Errors from message encoding and decoding.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
}

/// Kind of a consensus message; doubles as its gossip channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Proposal,
    Prevote,
    Precommit,
}

impl MessageKind {
    pub const ALL: [MessageKind; 3] = [
        MessageKind::Proposal,
        MessageKind::Prevote,
        MessageKind::Precommit,
    ];

    /// Gossip channel this kind travels on.
    pub fn channel(self) -> &'static str {
        match self {
            MessageKind::Proposal => "proposal",
            MessageKind::Prevote => "prevote",
            MessageKind::Precommit => "precommit",
        }
    }
}

/// A proposed value: the candidate unit plus its advertised content hash.
///
/// The hash is redundant with the unit body and is cross-checked on receipt;
/// votes refer to the value by this hash alone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedProposal {
    pub unit: Unit,
    pub idv: UnitId,
}

impl SignedProposal {
    pub fn new(unit: Unit) -> Self {
        let idv = unit.id();
        SignedProposal { unit, idv }
    }

    /// Whether the advertised hash matches the unit body.
    pub fn is_consistent(&self) -> bool {
        self.unit.id() == self.idv
    }
}

/// A consensus message as it travels between coordinators.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusMessage {
    Proposal {
        address: Address,
        height: u64,
        phase: u32,
        value: SignedProposal,
        /// Highest phase at which the sender saw this value gather a prevote
        /// quorum, if any.
        valid_phase: Option<u32>,
    },
    Prevote {
        address: Address,
        height: u64,
        phase: u32,
        /// `None` is the nil prevote.
        idv: Option<UnitId>,
    },
    Precommit {
        address: Address,
        height: u64,
        phase: u32,
        idv: Option<UnitId>,
        /// Signature over the precommit payload, reusable as TrustME evidence.
        approval: CoordinatorApproval,
    },
}

impl ConsensusMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ConsensusMessage::Proposal { .. } => MessageKind::Proposal,
            ConsensusMessage::Prevote { .. } => MessageKind::Prevote,
            ConsensusMessage::Precommit { .. } => MessageKind::Precommit,
        }
    }

    pub fn sender(&self) -> Address {
        match self {
            ConsensusMessage::Proposal { address, .. }
            | ConsensusMessage::Prevote { address, .. }
            | ConsensusMessage::Precommit { address, .. } => *address,
        }
    }

    pub fn height(&self) -> u64 {
        match self {
            ConsensusMessage::Proposal { height, .. }
            | ConsensusMessage::Prevote { height, .. }
            | ConsensusMessage::Precommit { height, .. } => *height,
        }
    }

    pub fn phase(&self) -> u32 {
        match self {
            ConsensusMessage::Proposal { phase, .. }
            | ConsensusMessage::Prevote { phase, .. }
            | ConsensusMessage::Precommit { phase, .. } => *phase,
        }
    }
}

/// Payload a coordinator signs when precommitting.
///
/// Length-prefixed concatenation, so a nil vote and an empty hash can never
/// collide with a real value.
pub fn precommit_payload(height: u64, phase: u32, idv: Option<&UnitId>) -> Hash {
    let idv_bytes: &[u8] = match idv {
        Some(id) => &id.0,
        None => &[],
    };
    crate::hash_concat(&[
        b"arbor.precommit",
        &height.to_le_bytes(),
        &phase.to_le_bytes(),
        idv_bytes,
    ])
}

/// Encode a message for the wire.
pub fn encode_message(message: &ConsensusMessage) -> Result<Vec<u8>, MessageError> {
    crate::serialize(message).map_err(|e| MessageError::Encode(e.to_string()))
}

/// Decode a message from the wire. Oversized payloads are rejected.
pub fn decode_message(bytes: &[u8]) -> Result<ConsensusMessage, MessageError> {
    crate::deserialize(bytes).map_err(|e| MessageError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{LocalIdentity, Signature, Signer};
    use crate::ledger::unit::{Author, Definition, Message, PowType, Unit};
    use std::collections::BTreeMap;

    fn sample_unit() -> Unit {
        let identity = LocalIdentity::from_seed([1u8; 32]);
        Unit {
            version: Unit::VERSION,
            parent_units: vec![UnitId([3u8; 32])],
            authors: vec![Author {
                address: identity.address(),
                definition: Some(Definition {
                    public_key: identity.public_key_bytes(),
                }),
                authentifiers: BTreeMap::from([("r".to_string(), identity.sign(b"x"))]),
            }],
            messages: vec![Message::Text("candidate".into())],
            round_index: 1,
            pow_type: PowType::TrustMe,
            timestamp: 42,
            trustme: None,
        }
    }

    #[test]
    fn roundtrip_all_kinds() {
        let proposal = ConsensusMessage::Proposal {
            address: Address([1u8; 32]),
            height: 7,
            phase: 2,
            value: SignedProposal::new(sample_unit()),
            valid_phase: Some(1),
        };
        let prevote = ConsensusMessage::Prevote {
            address: Address([2u8; 32]),
            height: 7,
            phase: 2,
            idv: None,
        };
        let precommit = ConsensusMessage::Precommit {
            address: Address([3u8; 32]),
            height: 7,
            phase: 2,
            idv: Some(UnitId([9u8; 32])),
            approval: CoordinatorApproval {
                address: Address([3u8; 32]),
                signature: Signature(vec![1, 2, 3]),
            },
        };

        for message in [proposal, prevote, precommit] {
            let bytes = encode_message(&message).unwrap();
            let decoded = decode_message(&bytes).unwrap();
            assert_eq!(decoded, message);
            assert_eq!(decoded.height(), 7);
            assert_eq!(decoded.phase(), 2);
        }
    }

    #[test]
    fn kind_maps_to_channel() {
        assert_eq!(MessageKind::Proposal.channel(), "proposal");
        assert_eq!(MessageKind::Prevote.channel(), "prevote");
        assert_eq!(MessageKind::Precommit.channel(), "precommit");
    }

    #[test]
    fn proposal_consistency_check() {
        let good = SignedProposal::new(sample_unit());
        assert!(good.is_consistent());

        let mut bad = good.clone();
        bad.idv = UnitId([0u8; 32]);
        assert!(!bad.is_consistent());
    }

    #[test]
    fn precommit_payload_separates_nil_from_values() {
        let idv = UnitId([5u8; 32]);
        let with_value = precommit_payload(1, 0, Some(&idv));
        let nil = precommit_payload(1, 0, None);
        assert_ne!(with_value, nil);
        assert_ne!(precommit_payload(1, 0, None), precommit_payload(1, 1, None));
        assert_ne!(precommit_payload(1, 0, None), precommit_payload(2, 0, None));
        assert_eq!(with_value, precommit_payload(1, 0, Some(&idv)));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_message(&[0xFF; 3]).is_err());
    }
}
