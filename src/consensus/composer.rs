//! Composing and validating TrustME proposals.
//!
//! The proposer of a phase composes a candidate unit on top of the current
//! free tips; every coordinator validates received candidates against its own
//! ledger view. Validation distinguishes hard rejection from conditions that
//! can resolve on their own (missing parents, a round the validator has not
//! reached), which are retried while the proposal sits in its slot. When a
//! coordinator's own proposal wins, it turns the candidate into the final
//! TrustME unit by embedding the decision evidence and re-signing.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::consensus::messages::SignedProposal;
use crate::consensus::state::Decision;
use crate::identity::{verify_signature, Signer};
use crate::ledger::storage::{LedgerStore, StorageError};
use crate::ledger::unit::{
    DataFeedValue, Definition, Message, PowType, TrustMeEvidence, Unit,
};

/// Errors from proposal composition.
#[derive(Debug, thiserror::Error)]
pub enum ComposerError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("cannot compose: {0}")]
    Compose(String),
}

/// Outcome of validating a received proposal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProposalCheck {
    Ok,
    /// Hard rejection; the proposal can never become valid here.
    Invalid(String),
    /// Not decidable yet; retried while the proposal stays in its slot.
    NeedsWaiting(String),
}

/// Builds and checks the units consensus runs on.
#[async_trait]
pub trait ProposalComposer: Send + Sync {
    /// Compose a fresh candidate on top of the current tips.
    async fn compose_candidate(&self) -> Result<Unit, ComposerError>;

    /// Turn a decided proposal of ours into the final TrustME unit.
    async fn compose_decision(&self, decision: &Decision) -> Result<Unit, ComposerError>;

    /// Validate a received proposal against the local ledger.
    async fn validate_proposal(&self, value: &SignedProposal)
        -> Result<ProposalCheck, ComposerError>;
}

/// The production composer, working directly on the ledger store.
pub struct TrustMeComposer<S: LedgerStore + ?Sized> {
    store: Arc<S>,
    identity: Arc<dyn Signer>,
}

impl<S: LedgerStore + ?Sized> TrustMeComposer<S> {
    pub fn new(store: Arc<S>, identity: Arc<dyn Signer>) -> Self {
        TrustMeComposer { store, identity }
    }

    fn current_round(&self) -> Result<u64, ComposerError> {
        Ok(self
            .store
            .latest_round()?
            .ok_or_else(|| ComposerError::Compose("no round records".into()))?
            .round_index)
    }

    fn sign_unit(&self, unit: &mut Unit) {
        let signature = self.identity.sign(&unit.content_hash());
        if let Some(author) = unit.authors.first_mut() {
            author.authentifiers = BTreeMap::from([("r".to_string(), signature)]);
        }
    }
}

#[async_trait]
impl<S: LedgerStore + ?Sized> ProposalComposer for TrustMeComposer<S> {
    async fn compose_candidate(&self) -> Result<Unit, ComposerError> {
        let meta = self
            .store
            .chain_meta()?
            .ok_or_else(|| ComposerError::Compose("ledger has no genesis".into()))?;

        // Consecutive anchors chain through parent links: the previous
        // anchor is always a parent, and free tips are capped first so it
        // survives the limit.
        let last_stable = self
            .store
            .unit_at_mci(meta.last_stable_mci)?
            .ok_or_else(|| ComposerError::Compose("stability point has no unit".into()))?;
        let mut parents = self.store.free_units()?;
        parents.truncate(crate::constants::MAX_PARENTS - 1);
        parents.push(last_stable);
        parents.sort();
        parents.dedup();

        let address = self.identity.address();
        let definition = if self.store.get_definition(&address)?.is_none() {
            Some(Definition {
                public_key: self.identity.public_key_bytes(),
            })
        } else {
            None
        };

        let mut unit = Unit {
            version: Unit::VERSION,
            parent_units: parents,
            authors: vec![crate::ledger::unit::Author {
                address,
                definition,
                authentifiers: BTreeMap::new(),
            }],
            messages: vec![Message::DataFeed(BTreeMap::from([(
                "timestamp".to_string(),
                DataFeedValue::Number(crate::now_ms() as i64),
            )]))],
            round_index: self.current_round()?,
            pow_type: PowType::TrustMe,
            timestamp: crate::now_ms(),
            trustme: None,
        };
        self.sign_unit(&mut unit);
        Ok(unit)
    }

    async fn compose_decision(&self, decision: &Decision) -> Result<Unit, ComposerError> {
        let mut unit = decision.value.unit.clone();
        let own = self.identity.address();
        if unit.authors.first().map(|a| a.address) != Some(own) {
            return Err(ComposerError::Compose(
                "decided proposal was authored by someone else".into(),
            ));
        }
        unit.trustme = Some(TrustMeEvidence {
            decided: decision.value.idv,
            phase: decision.phase,
            approvals: decision.approvals.clone(),
        });
        // The evidence changed the content hash; the old signature is void.
        self.sign_unit(&mut unit);
        Ok(unit)
    }

    async fn validate_proposal(
        &self,
        value: &SignedProposal,
    ) -> Result<ProposalCheck, ComposerError> {
        if !value.is_consistent() {
            return Ok(ProposalCheck::Invalid(
                "advertised hash does not match the unit".into(),
            ));
        }
        let unit = &value.unit;
        if unit.pow_type != PowType::TrustMe {
            return Ok(ProposalCheck::Invalid("candidate is not a TrustME unit".into()));
        }
        if unit.trustme.is_some() {
            return Ok(ProposalCheck::Invalid(
                "candidate already carries decision evidence".into(),
            ));
        }
        if let Err(err) = unit.check_structure() {
            return Ok(ProposalCheck::Invalid(err.to_string()));
        }
        if unit.authors.len() != 1 {
            return Ok(ProposalCheck::Invalid(
                "TrustME candidate must have a single author".into(),
            ));
        }
        if self.store.has_unit(&value.idv)? {
            return Ok(ProposalCheck::Invalid("unit is already in the ledger".into()));
        }

        let author = &unit.authors[0];
        let public_key = match &author.definition {
            Some(definition) => {
                if definition.address() != author.address {
                    return Ok(ProposalCheck::Invalid(
                        "definition does not hash to the author address".into(),
                    ));
                }
                definition.public_key
            }
            None => match self.store.get_definition(&author.address)? {
                Some(definition) => definition.public_key,
                None => {
                    return Ok(ProposalCheck::Invalid(
                        "author definition is unknown".into(),
                    ))
                }
            },
        };
        let Some(signature) = author.authentifiers.get("r") else {
            return Ok(ProposalCheck::Invalid("author signature is missing".into()));
        };
        if !verify_signature(&public_key, &unit.content_hash(), signature) {
            return Ok(ProposalCheck::Invalid("author signature is invalid".into()));
        }

        let current_round = self.current_round()?;
        if unit.round_index > current_round {
            return Ok(ProposalCheck::NeedsWaiting(format!(
                "candidate is for round {}, local round is {current_round}",
                unit.round_index
            )));
        }
        if unit.round_index < current_round {
            return Ok(ProposalCheck::Invalid(format!(
                "candidate is for stale round {}",
                unit.round_index
            )));
        }

        for parent in &unit.parent_units {
            if !self.store.has_unit(parent)? {
                return Ok(ProposalCheck::NeedsWaiting(format!(
                    "parent {parent} is not known yet"
                )));
            }
        }
        Ok(ProposalCheck::Ok)
    }
}
