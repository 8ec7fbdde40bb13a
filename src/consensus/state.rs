//! Consensus bookkeeping.
//!
//! Pure in-memory state: per-height records of proposals and votes, the
//! engine's own height/phase/step cursor, and the lock registers. Recording
//! follows first-vote-final semantics: one proposal per phase slot and one
//! vote per coordinator, kind and phase; repeats are dropped. Whether a vote
//! counts as approving is fixed at the moment it is recorded, against the
//! proposal stored in the slot at that time.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::consensus::messages::{ConsensusMessage, SignedProposal};
use crate::constants::{
    BFT_QUORUM, MAX_HEIGHTS_IN_CACHE, MAX_PENDING_GOSSIP_PER_HEIGHT, PROPOSER_ROTATION_OFFSET,
    WEAK_QUORUM,
};
use crate::identity::Address;
use crate::ledger::unit::{CoordinatorApproval, UnitId};

pub type Phase = u32;

/// Where the engine is inside a phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Propose,
    Prevote,
    Precommit,
}

/// Validation status of a stored proposal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Validity {
    /// Not decidable yet (e.g. parents still missing); re-checked later.
    Pending,
    Valid,
    Invalid,
}

/// Vote buckets a quorum can be asked about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tally {
    Approved,
    Opposed,
    Any,
}

/// The proposal slot of one phase. At most one proposal is ever stored.
#[derive(Clone, Debug)]
pub struct ProposalSlot {
    pub value: SignedProposal,
    pub sender: Address,
    pub valid_phase: Option<Phase>,
    pub validity: Validity,
}

/// Proposal and vote bookkeeping for one (height, phase).
#[derive(Clone, Debug, Default)]
pub struct PhaseRecord {
    pub proposal: Option<ProposalSlot>,
    pub prevote_approved: Vec<Address>,
    pub prevote_opposed: Vec<Address>,
    pub precommit_approved: Vec<CoordinatorApproval>,
    pub precommit_opposed: Vec<Address>,
    /// Every coordinator that sent anything at this phase, for phase skipping.
    pub senders: BTreeSet<Address>,
    prevote_senders: BTreeSet<Address>,
    precommit_senders: BTreeSet<Address>,
    pub prevote_timer_armed: bool,
    pub precommit_timer_armed: bool,
}

impl PhaseRecord {
    pub fn prevote_count(&self, tally: Tally) -> usize {
        match tally {
            Tally::Approved => self.prevote_approved.len(),
            Tally::Opposed => self.prevote_opposed.len(),
            Tally::Any => self.prevote_approved.len() + self.prevote_opposed.len(),
        }
    }

    pub fn precommit_count(&self, tally: Tally) -> usize {
        match tally {
            Tally::Approved => self.precommit_approved.len(),
            Tally::Opposed => self.precommit_opposed.len(),
            Tally::Any => self.precommit_approved.len() + self.precommit_opposed.len(),
        }
    }

    pub fn has_prevote_quorum(&self, tally: Tally) -> bool {
        self.prevote_count(tally) >= BFT_QUORUM
    }

    pub fn has_precommit_quorum(&self, tally: Tally) -> bool {
        self.precommit_count(tally) >= BFT_QUORUM
    }

    fn slot_matches(&self, idv: &UnitId) -> bool {
        self.proposal
            .as_ref()
            .is_some_and(|slot| slot.value.idv == *idv)
    }
}

/// A decision reached at some phase of a height.
#[derive(Clone, Debug)]
pub struct Decision {
    pub phase: Phase,
    pub value: SignedProposal,
    pub proposer: Address,
    pub approvals: Vec<CoordinatorApproval>,
}

/// Everything the engine tracks about one height.
#[derive(Clone, Debug)]
pub struct HeightRecord {
    pub height: u64,
    pub round_index: u64,
    pub witnesses: Arc<Vec<Address>>,
    pub phases: BTreeMap<Phase, PhaseRecord>,
    pub decision: Option<Decision>,
}

impl HeightRecord {
    pub fn new(height: u64, round_index: u64, witnesses: Arc<Vec<Address>>) -> Self {
        HeightRecord {
            height,
            round_index,
            witnesses,
            phases: BTreeMap::new(),
            decision: None,
        }
    }

    pub fn phase(&self, phase: Phase) -> Option<&PhaseRecord> {
        self.phases.get(&phase)
    }

    pub fn phase_mut(&mut self, phase: Phase) -> &mut PhaseRecord {
        self.phases.entry(phase).or_default()
    }

    pub fn is_witness(&self, address: &Address) -> bool {
        self.witnesses.contains(address)
    }

    /// Store a proposal if the slot is empty. Returns whether it was stored.
    pub fn record_proposal(
        &mut self,
        phase: Phase,
        sender: Address,
        value: SignedProposal,
        valid_phase: Option<Phase>,
        validity: Validity,
    ) -> bool {
        let record = self.phase_mut(phase);
        record.senders.insert(sender);
        if record.proposal.is_some() {
            return false;
        }
        record.proposal = Some(ProposalSlot {
            value,
            sender,
            valid_phase,
            validity,
        });
        true
    }

    /// Record a prevote. The first vote per coordinator is final; it counts
    /// as approving only when it names the proposal already in the slot.
    pub fn record_prevote(&mut self, phase: Phase, sender: Address, idv: Option<UnitId>) -> bool {
        let record = self.phase_mut(phase);
        record.senders.insert(sender);
        if !record.prevote_senders.insert(sender) {
            return false;
        }
        let approves = matches!(&idv, Some(id) if record.slot_matches(id));
        if approves {
            record.prevote_approved.push(sender);
        } else {
            record.prevote_opposed.push(sender);
        }
        true
    }

    /// Record a precommit. Approval additionally requires the embedded
    /// signature record to name the sender and to have verified (`sig_ok`).
    pub fn record_precommit(
        &mut self,
        phase: Phase,
        sender: Address,
        idv: Option<UnitId>,
        approval: CoordinatorApproval,
        sig_ok: bool,
    ) -> bool {
        let record = self.phase_mut(phase);
        record.senders.insert(sender);
        if !record.precommit_senders.insert(sender) {
            return false;
        }
        let approves = sig_ok
            && approval.address == sender
            && matches!(&idv, Some(id) if record.slot_matches(id));
        if approves {
            record.precommit_approved.push(approval);
        } else {
            record.precommit_opposed.push(sender);
        }
        true
    }

    /// Lowest phase above `current` where a weak quorum of coordinators is
    /// already active, if any.
    pub fn skip_target(&self, current: Phase) -> Option<Phase> {
        self.phases
            .iter()
            .find(|(phase, record)| **phase > current && record.senders.len() >= WEAK_QUORUM)
            .map(|(phase, _)| *phase)
    }

    /// Lowest phase holding a valid proposal backed by a precommit quorum.
    pub fn decidable_phase(&self) -> Option<Phase> {
        self.phases
            .iter()
            .find(|(_, record)| {
                record
                    .proposal
                    .as_ref()
                    .is_some_and(|slot| slot.validity == Validity::Valid)
                    && record.has_precommit_quorum(Tally::Approved)
            })
            .map(|(phase, _)| *phase)
    }

    /// Phases whose proposal is still awaiting validation.
    pub fn pending_proposal_phases(&self) -> Vec<Phase> {
        self.phases
            .iter()
            .filter(|(_, record)| {
                record
                    .proposal
                    .as_ref()
                    .is_some_and(|slot| slot.validity == Validity::Pending)
            })
            .map(|(phase, _)| *phase)
            .collect()
    }
}

/// Coordinator responsible for proposing at (height, phase).
pub fn proposer_for(witnesses: &[Address], height: u64, phase: Phase) -> Address {
    let index = (height + PROPOSER_ROTATION_OFFSET).abs_diff(phase as u64) % witnesses.len() as u64;
    witnesses[index as usize]
}

/// The engine's mutable consensus state.
pub struct ConsensusState {
    pub height: u64,
    pub phase: Phase,
    pub step: Step,
    pub locked_value: Option<SignedProposal>,
    pub locked_phase: Option<Phase>,
    pub valid_value: Option<SignedProposal>,
    pub valid_phase: Option<Phase>,
    pub heights: BTreeMap<u64, HeightRecord>,
    /// Gossip for future heights, replayed when those heights start.
    pending_gossip: BTreeMap<u64, Vec<ConsensusMessage>>,
}

impl ConsensusState {
    pub fn new() -> Self {
        ConsensusState {
            height: 0,
            phase: 0,
            step: Step::Propose,
            locked_value: None,
            locked_phase: None,
            valid_value: None,
            valid_phase: None,
            heights: BTreeMap::new(),
            pending_gossip: BTreeMap::new(),
        }
    }

    pub fn current(&self) -> Option<&HeightRecord> {
        self.heights.get(&self.height)
    }

    pub fn current_mut(&mut self) -> Option<&mut HeightRecord> {
        self.heights.get_mut(&self.height)
    }

    /// Clear the lock registers. Only height advancement does this.
    pub fn reset_locks(&mut self) {
        self.locked_value = None;
        self.locked_phase = None;
        self.valid_value = None;
        self.valid_phase = None;
    }

    /// Buffer gossip addressed to a future height. Returns whether it was
    /// kept: heights too far ahead and overfull buffers drop the message.
    pub fn buffer_future(&mut self, message: ConsensusMessage) -> bool {
        let height = message.height();
        if height <= self.height || height > self.height + MAX_HEIGHTS_IN_CACHE {
            return false;
        }
        let buffered = self.pending_gossip.entry(height).or_default();
        if buffered.len() >= MAX_PENDING_GOSSIP_PER_HEIGHT {
            return false;
        }
        buffered.push(message);
        true
    }

    /// Take the buffered gossip for a height, if any.
    pub fn take_buffered(&mut self, height: u64) -> Vec<ConsensusMessage> {
        self.pending_gossip.remove(&height).unwrap_or_default()
    }

    /// Drop records of heights that fell out of the retention window, plus
    /// stale buffered gossip.
    pub fn shrink(&mut self) {
        let floor = self.height.saturating_sub(MAX_HEIGHTS_IN_CACHE);
        self.heights.retain(|&h, _| h >= floor);
        let height = self.height;
        self.pending_gossip
            .retain(|&h, _| h > height && h <= height + MAX_HEIGHTS_IN_CACHE);
    }
}

impl Default for ConsensusState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{LocalIdentity, Signature, Signer};
    use crate::ledger::unit::{Author, Definition, Message, PowType, Unit};

    fn addr(n: u8) -> Address {
        Address([n; 32])
    }

    fn witnesses() -> Arc<Vec<Address>> {
        Arc::new((1..=10).map(addr).collect())
    }

    fn proposal(seed: u8) -> SignedProposal {
        let identity = LocalIdentity::from_seed([seed; 32]);
        let unit = Unit {
            version: Unit::VERSION,
            parent_units: vec![UnitId([seed; 32])],
            authors: vec![Author {
                address: identity.address(),
                definition: Some(Definition {
                    public_key: identity.public_key_bytes(),
                }),
                authentifiers: std::collections::BTreeMap::from([(
                    "r".to_string(),
                    identity.sign(b"x"),
                )]),
            }],
            messages: vec![Message::Text("p".into())],
            round_index: 1,
            pow_type: PowType::TrustMe,
            timestamp: seed as u64,
            trustme: None,
        };
        SignedProposal::new(unit)
    }

    fn approval_by(n: u8) -> CoordinatorApproval {
        CoordinatorApproval {
            address: addr(n),
            signature: Signature(vec![n; 64]),
        }
    }

    #[test]
    fn proposal_slot_is_single_use() {
        let mut record = HeightRecord::new(1, 1, witnesses());
        assert!(record.record_proposal(0, addr(1), proposal(1), None, Validity::Valid));
        assert!(!record.record_proposal(0, addr(2), proposal(2), None, Validity::Valid));
        let slot = record.phase(0).unwrap().proposal.as_ref().unwrap();
        assert_eq!(slot.sender, addr(1));
    }

    #[test]
    fn prevote_counts_approval_only_with_matching_slot() {
        let mut record = HeightRecord::new(1, 1, witnesses());
        let value = proposal(1);
        record.record_proposal(0, addr(1), value.clone(), None, Validity::Valid);

        assert!(record.record_prevote(0, addr(2), Some(value.idv)));
        assert!(record.record_prevote(0, addr(3), Some(UnitId([9u8; 32]))));
        assert!(record.record_prevote(0, addr(4), None));

        let phase = record.phase(0).unwrap();
        assert_eq!(phase.prevote_count(Tally::Approved), 1);
        assert_eq!(phase.prevote_count(Tally::Opposed), 2);
        assert_eq!(phase.prevote_count(Tally::Any), 3);
    }

    #[test]
    fn prevote_before_proposal_is_opposed() {
        let mut record = HeightRecord::new(1, 1, witnesses());
        let value = proposal(1);
        // The vote names the right value but arrives before the proposal.
        assert!(record.record_prevote(0, addr(2), Some(value.idv)));
        record.record_proposal(0, addr(1), value, None, Validity::Valid);

        let phase = record.phase(0).unwrap();
        assert_eq!(phase.prevote_count(Tally::Approved), 0);
        assert_eq!(phase.prevote_count(Tally::Opposed), 1);
    }

    #[test]
    fn first_vote_is_final() {
        let mut record = HeightRecord::new(1, 1, witnesses());
        let value = proposal(1);
        record.record_proposal(0, addr(1), value.clone(), None, Validity::Valid);

        assert!(record.record_prevote(0, addr(2), None));
        // Same coordinator tries to flip to approval.
        assert!(!record.record_prevote(0, addr(2), Some(value.idv)));

        let phase = record.phase(0).unwrap();
        assert_eq!(phase.prevote_count(Tally::Approved), 0);
        assert_eq!(phase.prevote_count(Tally::Opposed), 1);
    }

    #[test]
    fn precommit_requires_matching_signature_record() {
        let mut record = HeightRecord::new(1, 1, witnesses());
        let value = proposal(1);
        record.record_proposal(0, addr(1), value.clone(), None, Validity::Valid);

        // Approval record naming someone else does not count as approving.
        assert!(record.record_precommit(0, addr(2), Some(value.idv), approval_by(3), true));
        // Failed signature verification opposes too.
        assert!(record.record_precommit(0, addr(3), Some(value.idv), approval_by(3), false));
        // Clean approval.
        assert!(record.record_precommit(0, addr(4), Some(value.idv), approval_by(4), true));
        // Nil precommit.
        assert!(record.record_precommit(0, addr(5), None, approval_by(5), true));

        let phase = record.phase(0).unwrap();
        assert_eq!(phase.precommit_count(Tally::Approved), 1);
        assert_eq!(phase.precommit_count(Tally::Opposed), 3);
        assert_eq!(phase.precommit_approved[0].address, addr(4));
    }

    #[test]
    fn quorum_thresholds() {
        let mut record = HeightRecord::new(1, 1, witnesses());
        let value = proposal(1);
        record.record_proposal(0, addr(1), value.clone(), None, Validity::Valid);
        for n in 1..=6 {
            record.record_prevote(0, addr(n), Some(value.idv));
        }
        assert!(!record.phase(0).unwrap().has_prevote_quorum(Tally::Approved));
        record.record_prevote(0, addr(7), Some(value.idv));
        assert!(record.phase(0).unwrap().has_prevote_quorum(Tally::Approved));
    }

    #[test]
    fn skip_target_needs_weak_quorum_in_one_phase() {
        let mut record = HeightRecord::new(1, 1, witnesses());
        // Three distinct senders at phase 2, one at phase 3: no skip yet.
        for n in 1..=3 {
            record.record_prevote(2, addr(n), None);
        }
        record.record_prevote(3, addr(4), None);
        assert_eq!(record.skip_target(0), None);

        // A fourth sender at phase 2 completes the weak quorum there.
        record.record_precommit(2, addr(9), None, approval_by(9), true);
        assert_eq!(record.skip_target(0), Some(2));
        // Phases at or below the current one are not skip targets.
        assert_eq!(record.skip_target(2), None);
    }

    #[test]
    fn decidable_phase_requires_valid_proposal_and_quorum() {
        let mut record = HeightRecord::new(1, 1, witnesses());
        let value = proposal(1);
        record.record_proposal(0, addr(1), value.clone(), None, Validity::Pending);
        for n in 1..=7 {
            record.record_precommit(0, addr(n), Some(value.idv), approval_by(n), true);
        }
        // Quorum is there but the proposal has not validated yet.
        assert_eq!(record.decidable_phase(), None);
        assert_eq!(record.pending_proposal_phases(), vec![0]);

        record.phase_mut(0).proposal.as_mut().unwrap().validity = Validity::Valid;
        assert_eq!(record.decidable_phase(), Some(0));
    }

    #[test]
    fn proposer_rotates_through_witnesses() {
        let set = witnesses();
        let first = proposer_for(&set, 1, 0);
        let second = proposer_for(&set, 1, 1);
        assert_ne!(first, second);
        // Same (height, phase) always maps to the same coordinator.
        assert_eq!(first, proposer_for(&set, 1, 0));
        // Ten consecutive phases cover the whole committee.
        let mut seen: BTreeSet<Address> = BTreeSet::new();
        for phase in 0..10 {
            seen.insert(proposer_for(&set, 5, phase));
        }
        assert_eq!(seen.len(), 10);
    }

    #[test]
    fn future_gossip_buffering_limits() {
        let mut state = ConsensusState::new();
        state.height = 5;

        let msg = |height: u64| ConsensusMessage::Prevote {
            address: addr(1),
            height,
            phase: 0,
            idv: None,
        };
        assert!(!state.buffer_future(msg(5)));
        assert!(state.buffer_future(msg(6)));
        assert!(!state.buffer_future(msg(5 + MAX_HEIGHTS_IN_CACHE + 1)));

        for _ in 0..MAX_PENDING_GOSSIP_PER_HEIGHT {
            state.buffer_future(msg(7));
        }
        assert!(!state.buffer_future(msg(7)));
        assert_eq!(state.take_buffered(7).len(), MAX_PENDING_GOSSIP_PER_HEIGHT);
        assert!(state.take_buffered(7).is_empty());
        assert_eq!(state.take_buffered(6).len(), 1);
    }

    #[test]
    fn shrink_keeps_a_window_of_recent_heights() {
        let mut state = ConsensusState::new();
        for h in 1..=15 {
            state.heights.insert(h, HeightRecord::new(h, 1, witnesses()));
        }
        state.buffer_future(ConsensusMessage::Prevote {
            address: addr(1),
            height: 3,
            phase: 0,
            idv: None,
        });
        state.height = 14;
        state.shrink();
        // Heights within MAX_HEIGHTS_IN_CACHE of the current one survive.
        assert!(state.heights.contains_key(&4));
        assert!(state.heights.contains_key(&15));
        assert!(!state.heights.contains_key(&3));
        assert!(state.take_buffered(3).is_empty());
    }
}
