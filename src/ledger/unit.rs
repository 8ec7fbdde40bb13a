//! Ledger units: the immutable DAG records.
//!
//! A unit carries its parent references, one or more authors (address plus
//! the definition and signatures authorizing it), and typed message payloads.
//! The unit id is a domain-separated content hash covering everything except
//! the authentifier signatures, so the id can be signed.
//!
//! TrustME units additionally embed the evidence of the BFT decision that
//! produced them: the decided proposal id, the deciding phase, and the
//! precommit signatures of the approving coordinators.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::{Address, Signature};
use crate::Hash;

/// Errors from unit structure checks.
#[derive(Clone, Debug, thiserror::Error)]
pub enum UnitError {
    #[error("unit has no authors")]
    NoAuthors,
    #[error("unit has no messages")]
    NoMessages,
    #[error("too many parents: {0}")]
    TooManyParents(usize),
    #[error("parent references are not sorted and unique")]
    ParentsNotNormalized,
    #[error("authors are not sorted by address and unique")]
    AuthorsNotNormalized,
    #[error("author {0} carries no authentifiers")]
    MissingAuthentifier(Address),
    #[error("message {index}: {reason}")]
    BadMessage { index: usize, reason: String },
}

/// Content-addressed unit identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitId(pub Hash);

impl UnitId {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &hex::encode(self.0)[..8])
    }
}

impl fmt::Debug for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnitId({})", &hex::encode(self.0)[..8])
    }
}

/// How a unit entered the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowType {
    /// Mined by the external proof-of-work subsystem.
    Pow,
    /// Produced by BFT consensus; anchors main-chain stability.
    TrustMe,
    /// Round reward unit (storage shape only).
    Coinbase,
}

impl PowType {
    /// Stable one-byte tag used in storage index keys.
    pub fn as_u8(self) -> u8 {
        match self {
            PowType::Pow => 1,
            PowType::TrustMe => 2,
            PowType::Coinbase => 3,
        }
    }
}

/// Sequence classification assigned by upstream validation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sequence {
    #[default]
    Good,
    TempBad,
    FinalBad,
}

/// Address definition: the key material an address commits to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    pub public_key: [u8; 32],
}

impl Definition {
    /// The address this definition hashes to. Stored definitions must match
    /// their author's address.
    pub fn address(&self) -> Address {
        Address(crate::hash_domain("arbor.address", &self.public_key))
    }
}

/// A unit author.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub address: Address,
    /// Present on the address's first use.
    pub definition: Option<Definition>,
    /// Signature per signing path ("r" for a single-key definition).
    pub authentifiers: BTreeMap<String, Signature>,
}

/// A transferable output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub address: Address,
    pub amount: u64,
}

/// Where a payment input draws its value from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Input {
    /// Spend a prior output.
    Transfer {
        unit: UnitId,
        message_index: u32,
        output_index: u32,
    },
    /// Mint value (genesis and asset issuance).
    Issue {
        amount: u64,
        serial_number: u64,
        /// Issuing address; defaults to the single author when absent.
        address: Option<Address>,
    },
}

/// Commitment that a private input is spent at most once.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendProof {
    pub spend_proof: Hash,
    /// Proving address; defaults to the single author when absent.
    pub address: Option<Address>,
}

/// A payment: inputs consumed, outputs created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentPayload {
    /// None for the base currency.
    pub asset: Option<UnitId>,
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    pub spend_proofs: Vec<SpendProof>,
}

/// Per-feed value in a data-feed message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataFeedValue {
    Text(String),
    Number(i64),
}

/// Poll definition (storage shape only).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPayload {
    pub question: String,
    pub choices: Vec<String>,
}

/// Vote referencing a poll unit (storage shape only).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VotePayload {
    pub poll_unit: UnitId,
    pub choice: String,
}

/// Attestation of facts about an address (storage shape only).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationPayload {
    pub address: Address,
    pub profile: BTreeMap<String, String>,
}

/// Asset definition (storage shape only).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetPayload {
    pub cap: Option<u64>,
    pub is_private: bool,
    pub is_transferrable: bool,
    pub auto_destroy: bool,
    pub fixed_denominations: bool,
}

/// A typed message payload carried by a unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Payment(PaymentPayload),
    DataFeed(BTreeMap<String, DataFeedValue>),
    Text(String),
    Poll(PollPayload),
    Vote(VotePayload),
    Attestation(AttestationPayload),
    Asset(AssetPayload),
}

impl Message {
    /// Application tag stored alongside the payload.
    pub fn app(&self) -> &'static str {
        match self {
            Message::Payment(_) => "payment",
            Message::DataFeed(_) => "data_feed",
            Message::Text(_) => "text",
            Message::Poll(_) => "poll",
            Message::Vote(_) => "vote",
            Message::Attestation(_) => "attestation",
            Message::Asset(_) => "asset",
        }
    }
}

/// One coordinator's precommit approval, as embedded in TrustME evidence.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorApproval {
    pub address: Address,
    pub signature: Signature,
}

/// Evidence of the BFT decision embedded in a committed TrustME unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustMeEvidence {
    /// Content hash of the decided proposal unit.
    pub decided: UnitId,
    /// Phase at which the decision quorum formed.
    pub phase: u32,
    /// Precommit signatures of the approving coordinators.
    pub approvals: Vec<CoordinatorApproval>,
}

/// An immutable ledger unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub version: u32,
    /// Sorted, unique parent ids. Empty only for the genesis unit.
    pub parent_units: Vec<UnitId>,
    /// Sorted by address, unique.
    pub authors: Vec<Author>,
    pub messages: Vec<Message>,
    pub round_index: u64,
    pub pow_type: PowType,
    /// Milliseconds since the UNIX epoch.
    pub timestamp: u64,
    /// Present on committed TrustME units only.
    pub trustme: Option<TrustMeEvidence>,
}

impl Unit {
    pub const VERSION: u32 = 1;

    /// Content hash over everything except authentifier signatures.
    ///
    /// Every field is fed to the hasher length-prefixed, so no two distinct
    /// units can collide by field-boundary ambiguity. Authentifiers are
    /// excluded so authors can sign the id itself.
    pub fn content_hash(&self) -> Hash {
        let mut h = ContentHasher::new("arbor.unit.id");
        h.u32(self.version);
        h.len(self.parent_units.len());
        for parent in &self.parent_units {
            h.raw(&parent.0);
        }
        h.len(self.authors.len());
        for author in &self.authors {
            h.raw(&author.address.0);
            match &author.definition {
                Some(def) => {
                    h.u8(1);
                    h.raw(&def.public_key);
                }
                None => h.u8(0),
            }
        }
        h.len(self.messages.len());
        for message in &self.messages {
            hash_message(&mut h, message);
        }
        h.u64(self.round_index);
        h.u8(self.pow_type.as_u8());
        h.u64(self.timestamp);
        match &self.trustme {
            Some(evidence) => {
                h.u8(1);
                h.raw(&evidence.decided.0);
                h.u32(evidence.phase);
                h.len(evidence.approvals.len());
                for approval in &evidence.approvals {
                    h.raw(&approval.address.0);
                    h.bytes(&approval.signature.0);
                }
            }
            None => h.u8(0),
        }
        h.finish()
    }

    pub fn id(&self) -> UnitId {
        UnitId(self.content_hash())
    }

    pub fn is_genesis(&self) -> bool {
        self.parent_units.is_empty()
    }

    pub fn author_addresses(&self) -> Vec<Address> {
        self.authors.iter().map(|a| a.address).collect()
    }

    /// Structural checks every unit must pass before it reaches the writer.
    /// Cryptographic and graph validation happen upstream.
    pub fn check_structure(&self) -> Result<(), UnitError> {
        if self.authors.is_empty() {
            return Err(UnitError::NoAuthors);
        }
        if self.messages.is_empty() {
            return Err(UnitError::NoMessages);
        }
        if self.parent_units.len() > crate::constants::MAX_PARENTS {
            return Err(UnitError::TooManyParents(self.parent_units.len()));
        }
        if !is_sorted_unique(&self.parent_units) {
            return Err(UnitError::ParentsNotNormalized);
        }
        let addresses: Vec<Address> = self.author_addresses();
        if !is_sorted_unique(&addresses) {
            return Err(UnitError::AuthorsNotNormalized);
        }
        if !self.is_genesis() {
            for author in &self.authors {
                if author.authentifiers.is_empty() {
                    return Err(UnitError::MissingAuthentifier(author.address));
                }
            }
        }
        for (index, message) in self.messages.iter().enumerate() {
            if let Message::Payment(payment) = message {
                if payment.outputs.is_empty() {
                    return Err(UnitError::BadMessage {
                        index,
                        reason: "payment has no outputs".into(),
                    });
                }
                if payment.outputs.iter().any(|o| o.amount == 0) {
                    return Err(UnitError::BadMessage {
                        index,
                        reason: "zero-amount output".into(),
                    });
                }
                if payment.inputs.is_empty() {
                    return Err(UnitError::BadMessage {
                        index,
                        reason: "payment has no inputs".into(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn is_sorted_unique<T: Ord>(items: &[T]) -> bool {
    items.windows(2).all(|w| w[0] < w[1])
}

/// Incremental length-prefixed hasher for unit content.
struct ContentHasher {
    inner: blake3::Hasher,
}

impl ContentHasher {
    fn new(domain: &str) -> Self {
        ContentHasher {
            inner: blake3::Hasher::new_derive_key(domain),
        }
    }

    fn raw(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn bytes(&mut self, bytes: &[u8]) {
        self.len(bytes.len());
        self.inner.update(bytes);
    }

    fn str(&mut self, s: &str) {
        self.bytes(s.as_bytes());
    }

    fn len(&mut self, n: usize) {
        self.inner.update(&(n as u64).to_le_bytes());
    }

    fn u8(&mut self, v: u8) {
        self.inner.update(&[v]);
    }

    fn u32(&mut self, v: u32) {
        self.inner.update(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.inner.update(&v.to_le_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.inner.update(&v.to_le_bytes());
    }

    fn finish(self) -> Hash {
        *self.inner.finalize().as_bytes()
    }
}

fn hash_message(h: &mut ContentHasher, message: &Message) {
    h.str(message.app());
    match message {
        Message::Payment(payment) => {
            match &payment.asset {
                Some(asset) => {
                    h.u8(1);
                    h.raw(&asset.0);
                }
                None => h.u8(0),
            }
            h.len(payment.inputs.len());
            for input in &payment.inputs {
                match input {
                    Input::Transfer {
                        unit,
                        message_index,
                        output_index,
                    } => {
                        h.u8(0);
                        h.raw(&unit.0);
                        h.u32(*message_index);
                        h.u32(*output_index);
                    }
                    Input::Issue {
                        amount,
                        serial_number,
                        address,
                    } => {
                        h.u8(1);
                        h.u64(*amount);
                        h.u64(*serial_number);
                        hash_opt_address(h, address);
                    }
                }
            }
            h.len(payment.outputs.len());
            for output in &payment.outputs {
                h.raw(&output.address.0);
                h.u64(output.amount);
            }
            h.len(payment.spend_proofs.len());
            for proof in &payment.spend_proofs {
                h.raw(&proof.spend_proof);
                hash_opt_address(h, &proof.address);
            }
        }
        Message::DataFeed(feeds) => {
            h.len(feeds.len());
            for (name, value) in feeds {
                h.str(name);
                match value {
                    DataFeedValue::Text(s) => {
                        h.u8(0);
                        h.str(s);
                    }
                    DataFeedValue::Number(n) => {
                        h.u8(1);
                        h.i64(*n);
                    }
                }
            }
        }
        Message::Text(text) => h.str(text),
        Message::Poll(poll) => {
            h.str(&poll.question);
            h.len(poll.choices.len());
            for choice in &poll.choices {
                h.str(choice);
            }
        }
        Message::Vote(vote) => {
            h.raw(&vote.poll_unit.0);
            h.str(&vote.choice);
        }
        Message::Attestation(attestation) => {
            h.raw(&attestation.address.0);
            h.len(attestation.profile.len());
            for (key, value) in &attestation.profile {
                h.str(key);
                h.str(value);
            }
        }
        Message::Asset(asset) => {
            match asset.cap {
                Some(cap) => {
                    h.u8(1);
                    h.u64(cap);
                }
                None => h.u8(0),
            }
            h.u8(asset.is_private as u8);
            h.u8(asset.is_transferrable as u8);
            h.u8(asset.auto_destroy as u8);
            h.u8(asset.fixed_denominations as u8);
        }
    }
}

fn hash_opt_address(h: &mut ContentHasher, address: &Option<Address>) {
    match address {
        Some(addr) => {
            h.u8(1);
            h.raw(&addr.0);
        }
        None => h.u8(0),
    }
}
