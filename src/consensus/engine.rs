//! Tendermint-style BFT over TrustME anchors.
//!
//! One actor task owns the whole consensus state. Everything external, peer
//! gossip, timer expirations, stability notifications and round updates,
//! arrives as an [`EngineCommand`] on the inbox; after each command the
//! engine re-evaluates its transition rules until none fire. When a quorum of
//! precommits backs a valid proposal the decided candidate is turned into the
//! final TrustME unit and handed to the ledger writer, whose stability
//! propagation is what ultimately advances the height.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::consensus::composer::{ProposalCheck, ProposalComposer};
use crate::consensus::messages::{precommit_payload, ConsensusMessage, SignedProposal};
use crate::consensus::state::{
    proposer_for, ConsensusState, Decision, HeightRecord, Phase, Step, Tally, Validity,
};
use crate::constants::{phase_timeout_ms, CACHE_SHRINK_INTERVAL_MS, ENGINE_INBOX_CAPACITY};
use crate::events::{EventBus, NodeEvent};
use crate::identity::{verify_signature, Address, Signer};
use crate::ledger::storage::{LedgerStore, StorageError};
use crate::ledger::unit::{CoordinatorApproval, UnitId};
use crate::ledger::writer::{UnitWriter, ValidationState};
use crate::round::{RoundError, RoundOracle};

/// Errors the engine cannot absorb as protocol behavior.
#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("engine channels closed")]
    ChannelClosed,
    #[error("ledger has no genesis unit")]
    NoGenesis,
}

/// Which phase timer fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutKind {
    Propose,
    Prevote,
    Precommit,
}

/// Inputs to the engine task. Every external trigger becomes one of these.
#[derive(Debug)]
pub enum EngineCommand {
    /// A consensus message from a peer.
    Gossip(ConsensusMessage),
    /// The main-chain stability point advanced to `mci`.
    MciStable { mci: u64 },
    /// The round table gained rows up to this round.
    RoundAdvanced { round_index: u64 },
    /// A phase timer armed earlier fired.
    Timeout {
        height: u64,
        phase: Phase,
        kind: TimeoutKind,
    },
    /// Periodic cache eviction.
    Shrink,
}

/// The consensus actor. Constructed once per node and consumed by [`run`].
///
/// [`run`]: ConsensusEngine::run
pub struct ConsensusEngine<S, C>
where
    S: LedgerStore + ?Sized,
    C: ProposalComposer,
{
    identity: Arc<dyn Signer>,
    store: Arc<S>,
    writer: Arc<UnitWriter<S>>,
    composer: C,
    oracle: RoundOracle<S>,
    state: ConsensusState,
    inbox: mpsc::Receiver<EngineCommand>,
    inbox_tx: mpsc::Sender<EngineCommand>,
    outgoing: mpsc::Sender<ConsensusMessage>,
    events: EventBus,
    ready: watch::Receiver<bool>,
    shutdown: CancellationToken,
    /// A phase start deferred because round data was not electable yet.
    pending_start: Option<(u64, Phase)>,
}

impl<S, C> ConsensusEngine<S, C>
where
    S: LedgerStore + ?Sized,
    C: ProposalComposer,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<S>,
        writer: Arc<UnitWriter<S>>,
        composer: C,
        oracle: RoundOracle<S>,
        identity: Arc<dyn Signer>,
        events: EventBus,
        outgoing: mpsc::Sender<ConsensusMessage>,
        ready: watch::Receiver<bool>,
        shutdown: CancellationToken,
    ) -> (Self, mpsc::Sender<EngineCommand>) {
        let (inbox_tx, inbox) = mpsc::channel(ENGINE_INBOX_CAPACITY);
        let engine = ConsensusEngine {
            identity,
            store,
            writer,
            composer,
            oracle,
            state: ConsensusState::new(),
            inbox,
            inbox_tx: inbox_tx.clone(),
            outgoing,
            events,
            ready,
            shutdown,
            pending_start: None,
        };
        (engine, inbox_tx)
    }

    /// Drive the engine until shutdown. Waits for the readiness gate, then
    /// picks up consensus at the height following the current stability point.
    pub async fn run(mut self) -> Result<(), ConsensusError> {
        let shutdown = self.shutdown.clone();
        loop {
            if *self.ready.borrow() {
                break;
            }
            let changed = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                changed = self.ready.changed() => changed,
            };
            if changed.is_err() {
                return Ok(());
            }
        }

        let meta = self.store.chain_meta()?.ok_or(ConsensusError::NoGenesis)?;
        info!(
            last_stable_mci = meta.last_stable_mci,
            address = %self.identity.address(),
            "consensus engine starting"
        );
        self.start_phase(meta.last_stable_mci + 1, 0).await?;
        self.run_upon_rules().await?;

        let mut shrink = tokio::time::interval(Duration::from_millis(CACHE_SHRINK_INTERVAL_MS));
        shrink.tick().await;
        loop {
            let command = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = shrink.tick() => EngineCommand::Shrink,
                received = self.inbox.recv() => match received {
                    Some(command) => command,
                    None => return Ok(()),
                },
            };
            self.handle_command(command).await?;
        }
    }

    async fn handle_command(&mut self, command: EngineCommand) -> Result<(), ConsensusError> {
        if let Some((height, phase)) = self.pending_start.take() {
            self.start_phase(height, phase).await?;
        }
        match command {
            EngineCommand::Gossip(message) => self.handle_gossip(message),
            EngineCommand::MciStable { mci } => {
                debug!(mci, "stability point advanced");
                self.start_phase(mci + 1, 0).await?;
            }
            EngineCommand::RoundAdvanced { round_index } => {
                debug!(round_index, "round table advanced");
            }
            EngineCommand::Timeout {
                height,
                phase,
                kind,
            } => self.handle_timeout(height, phase, kind).await?,
            EngineCommand::Shrink => {
                self.state.shrink();
                self.oracle.shrink_cache();
            }
        }
        self.run_upon_rules().await
    }

    /// Enter (height, phase). Requests for positions at or behind the current
    /// one are ignored, so stale timers and replayed events are harmless.
    async fn start_phase(&mut self, height: u64, phase: Phase) -> Result<(), ConsensusError> {
        if self.state.height > 0 && (height, phase) <= (self.state.height, self.state.phase) {
            return Ok(());
        }
        let (round_index, witnesses) = match self.oracle.current_witnesses() {
            Ok(resolved) => resolved,
            Err(RoundError::NotReady {
                round_index,
                have,
                need,
            }) => {
                debug!(
                    height,
                    phase, round_index, have, need, "round not electable yet, phase start deferred"
                );
                self.pending_start = Some((height, phase));
                return Ok(());
            }
            Err(err) => {
                error!(height, phase, %err, "witness resolution failed, abandoning this height");
                return Ok(());
            }
        };
        self.pending_start = None;

        let advancing = height > self.state.height;
        if advancing {
            // Locks never survive a height; they do survive phase changes.
            self.state.reset_locks();
        }
        self.state.height = height;
        self.state.phase = phase;
        self.state.step = Step::Propose;
        self.state
            .heights
            .entry(height)
            .or_insert_with(|| HeightRecord::new(height, round_index, witnesses.clone()));
        if advancing {
            for message in self.state.take_buffered(height) {
                self.record_message(message);
            }
        }

        let own = self.identity.address();
        if !witnesses.contains(&own) {
            debug!(height, round_index, "not in the witness set, observing only");
            return Ok(());
        }
        let proposer = proposer_for(&witnesses, height, phase);
        if proposer == own {
            self.propose(height, phase).await
        } else {
            debug!(height, phase, proposer = %proposer, "waiting for the proposer");
            self.arm_timer(height, phase, TimeoutKind::Propose);
            Ok(())
        }
    }

    /// Propose at (height, phase): re-propose the valid value when one is
    /// registered, otherwise compose a fresh candidate. The own proposal and
    /// prevote are recorded before anything is broadcast.
    async fn propose(&mut self, height: u64, phase: Phase) -> Result<(), ConsensusError> {
        let (value, claimed_phase) = match self.state.valid_value.clone() {
            Some(value) => (value, self.state.valid_phase),
            None => match self.composer.compose_candidate().await {
                Ok(unit) => (SignedProposal::new(unit), None),
                Err(err) => {
                    error!(height, phase, %err, "candidate composition failed, abandoning this height");
                    return Ok(());
                }
            },
        };
        match self.composer.validate_proposal(&value).await {
            Ok(ProposalCheck::Ok) => {}
            Ok(ProposalCheck::Invalid(reason)) | Ok(ProposalCheck::NeedsWaiting(reason)) => {
                error!(height, phase, %reason, "own candidate did not validate, abandoning this height");
                return Ok(());
            }
            Err(err) => {
                error!(height, phase, %err, "own candidate validation errored, abandoning this height");
                return Ok(());
            }
        }

        let own = self.identity.address();
        let idv = value.idv;
        let Some(record) = self.state.heights.get_mut(&height) else {
            return Ok(());
        };
        record.record_proposal(phase, own, value.clone(), claimed_phase, Validity::Valid);
        record.record_prevote(phase, own, Some(idv));
        self.state.step = Step::Prevote;
        info!(height, phase, unit = %idv, "proposing");
        self.broadcast(ConsensusMessage::Proposal {
            address: own,
            height,
            phase,
            value,
            valid_phase: claimed_phase,
        })
        .await?;
        self.broadcast(ConsensusMessage::Prevote {
            address: own,
            height,
            phase,
            idv: Some(idv),
        })
        .await
    }

    fn handle_gossip(&mut self, message: ConsensusMessage) {
        let height = message.height();
        if height < self.state.height {
            debug!(
                height,
                current = self.state.height,
                "stale consensus message dropped"
            );
            return;
        }
        if height > self.state.height || !self.state.heights.contains_key(&height) {
            self.state.buffer_future(message);
            return;
        }
        self.record_message(message);
    }

    /// Tally a message for a height whose record exists. Buffered messages
    /// pass through here on replay, so quorums only ever count tallied votes.
    fn record_message(&mut self, message: ConsensusMessage) {
        let height = message.height();
        let sender = message.sender();
        // Signature checking reads the store, so settle it before borrowing
        // the height record.
        let precommit_sig_ok = match &message {
            ConsensusMessage::Precommit {
                address,
                height,
                phase,
                idv,
                approval,
            } => self.verify_precommit(*address, *height, *phase, idv.as_ref(), approval),
            _ => false,
        };
        let Some(record) = self.state.heights.get_mut(&height) else {
            return;
        };
        if !record.is_witness(&sender) {
            debug!(height, sender = %sender, "message from non-witness dropped");
            return;
        }
        match message {
            ConsensusMessage::Proposal {
                address,
                height,
                phase,
                value,
                valid_phase,
            } => {
                let expected = proposer_for(&record.witnesses, height, phase);
                if address != expected {
                    debug!(height, phase, sender = %address, "proposal from wrong coordinator dropped");
                    return;
                }
                if record.record_proposal(phase, address, value, valid_phase, Validity::Pending) {
                    debug!(height, phase, "proposal stored, validation queued");
                }
            }
            ConsensusMessage::Prevote {
                address, phase, idv, ..
            } => {
                record.record_prevote(phase, address, idv);
            }
            ConsensusMessage::Precommit {
                address,
                phase,
                idv,
                approval,
                ..
            } => {
                record.record_precommit(phase, address, idv, approval, precommit_sig_ok);
            }
        }
    }

    fn verify_precommit(
        &self,
        sender: Address,
        height: u64,
        phase: Phase,
        idv: Option<&UnitId>,
        approval: &CoordinatorApproval,
    ) -> bool {
        if approval.address != sender {
            return false;
        }
        let definition = match self.store.get_definition(&sender) {
            Ok(Some(definition)) => definition,
            Ok(None) => {
                debug!(sender = %sender, "no definition on file for precommit signer");
                return false;
            }
            Err(err) => {
                warn!(sender = %sender, %err, "definition lookup failed, precommit counts as opposed");
                return false;
            }
        };
        let payload = precommit_payload(height, phase, idv);
        verify_signature(&definition.public_key, &payload, &approval.signature)
    }

    async fn handle_timeout(
        &mut self,
        height: u64,
        phase: Phase,
        kind: TimeoutKind,
    ) -> Result<(), ConsensusError> {
        if height != self.state.height || phase != self.state.phase {
            return Ok(());
        }
        if self
            .state
            .current()
            .is_some_and(|record| record.decision.is_some())
        {
            // Decided; the anchor is on its way. Timers stay quiet.
            return Ok(());
        }
        match kind {
            TimeoutKind::Propose if self.state.step == Step::Propose => {
                debug!(height, phase, "no usable proposal in time, prevoting nil");
                self.cast_prevote(None).await?;
            }
            TimeoutKind::Prevote if self.state.step == Step::Prevote => {
                debug!(height, phase, "prevote stage timed out, precommitting nil");
                self.cast_precommit(None).await?;
            }
            TimeoutKind::Precommit => {
                debug!(height, phase, "precommit stage timed out, moving to the next phase");
                self.start_phase(height, phase + 1).await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Re-evaluate the transition rules until none fire.
    async fn run_upon_rules(&mut self) -> Result<(), ConsensusError> {
        self.refresh_pending().await?;
        while self.upon_step().await? {}
        Ok(())
    }

    async fn upon_step(&mut self) -> Result<bool, ConsensusError> {
        let own = self.identity.address();
        {
            let Some(record) = self.state.current() else {
                return Ok(false);
            };
            if record.decision.is_some() || !record.is_witness(&own) {
                return Ok(false);
            }
        }
        if self.try_decide().await? {
            return Ok(true);
        }
        if self.try_skip().await? {
            return Ok(true);
        }
        if self.try_propose_step().await? {
            return Ok(true);
        }
        self.try_vote_quorums().await
    }

    /// Re-validate proposals whose earlier check came back inconclusive.
    async fn refresh_pending(&mut self) -> Result<(), ConsensusError> {
        let height = self.state.height;
        let pending: Vec<(Phase, SignedProposal)> = match self.state.heights.get(&height) {
            Some(record) => record
                .pending_proposal_phases()
                .into_iter()
                .filter_map(|phase| {
                    record
                        .phase(phase)
                        .and_then(|p| p.proposal.as_ref())
                        .map(|slot| (phase, slot.value.clone()))
                })
                .collect(),
            None => return Ok(()),
        };
        for (phase, value) in pending {
            let verdict = match self.composer.validate_proposal(&value).await {
                Ok(verdict) => verdict,
                Err(err) => {
                    warn!(height, phase, %err, "proposal validation errored, leaving it pending");
                    continue;
                }
            };
            let validity = match verdict {
                ProposalCheck::Ok => Validity::Valid,
                ProposalCheck::Invalid(reason) => {
                    debug!(height, phase, %reason, "proposal rejected");
                    Validity::Invalid
                }
                ProposalCheck::NeedsWaiting(reason) => {
                    debug!(height, phase, %reason, "proposal still waiting on local state");
                    continue;
                }
            };
            if let Some(slot) = self
                .state
                .heights
                .get_mut(&height)
                .and_then(|record| record.phases.get_mut(&phase))
                .and_then(|p| p.proposal.as_mut())
            {
                slot.validity = validity;
            }
        }
        Ok(())
    }

    /// A precommit quorum behind a valid proposal decides the height.
    async fn try_decide(&mut self) -> Result<bool, ConsensusError> {
        let height = self.state.height;
        let decision = {
            let Some(record) = self.state.heights.get(&height) else {
                return Ok(false);
            };
            let Some(phase) = record.decidable_phase() else {
                return Ok(false);
            };
            let Some(phase_record) = record.phase(phase) else {
                return Ok(false);
            };
            let Some(slot) = phase_record.proposal.as_ref() else {
                return Ok(false);
            };
            Decision {
                phase,
                value: slot.value.clone(),
                proposer: proposer_for(&record.witnesses, height, phase),
                approvals: phase_record.precommit_approved.clone(),
            }
        };
        info!(
            height,
            phase = decision.phase,
            unit = %decision.value.idv,
            approvals = decision.approvals.len(),
            "decision reached"
        );
        if let Some(record) = self.state.heights.get_mut(&height) {
            record.decision = Some(decision.clone());
        }
        self.events.emit(NodeEvent::Decision {
            height,
            phase: decision.phase,
            proposer: decision.proposer,
            unit: decision.value.idv,
            approvals: decision.approvals.len(),
        });

        // Only the author can re-sign the unit with the evidence embedded;
        // everyone else waits for the committed anchor to arrive.
        let author = decision.value.unit.authors.first().map(|a| a.address);
        if author != Some(self.identity.address()) {
            debug!(height, proposer = %decision.proposer, "awaiting the decided anchor from its author");
            return Ok(true);
        }
        self.commit_decision(height, decision).await
    }

    /// Build and commit the final anchor for a decided value of our own. A
    /// failed commit clears the decision and retries the height one phase on.
    async fn commit_decision(
        &mut self,
        height: u64,
        decision: Decision,
    ) -> Result<bool, ConsensusError> {
        let unit = match self.composer.compose_decision(&decision).await {
            Ok(unit) => unit,
            Err(err) => {
                warn!(height, %err, "could not build the final anchor, retrying next phase");
                return self.retry_after_failed_commit(height).await;
            }
        };
        let validation = match ValidationState::derived(self.store.as_ref(), &unit.parent_units) {
            Ok(validation) => validation,
            Err(err) => {
                warn!(height, %err, "could not derive the anchor graph position, retrying next phase");
                return self.retry_after_failed_commit(height).await;
            }
        };
        match self.writer.commit(unit, validation).await {
            Ok(outcome) => {
                info!(height, unit = %outcome.unit, "anchor committed");
                let next = outcome.new_mci.map_or(height + 1, |mci| mci + 1);
                self.start_phase(next, 0).await?;
                Ok(true)
            }
            Err(err) => {
                warn!(height, %err, "anchor commit failed, retrying next phase");
                self.retry_after_failed_commit(height).await
            }
        }
    }

    async fn retry_after_failed_commit(&mut self, height: u64) -> Result<bool, ConsensusError> {
        if let Some(record) = self.state.heights.get_mut(&height) {
            record.decision = None;
        }
        let next_phase = self.state.phase + 1;
        self.start_phase(height, next_phase).await?;
        // Rule evaluation resumes on the next inbox event, which keeps a
        // persistently failing commit from spinning.
        Ok(false)
    }

    /// A weak quorum already active at a later phase pulls us forward.
    async fn try_skip(&mut self) -> Result<bool, ConsensusError> {
        let target = self
            .state
            .current()
            .and_then(|record| record.skip_target(self.state.phase));
        let Some(target) = target else {
            return Ok(false);
        };
        debug!(
            height = self.state.height,
            from = self.state.phase,
            to = target,
            "weak quorum ahead, skipping forward"
        );
        self.start_phase(self.state.height, target).await?;
        Ok(true)
    }

    /// While still in the propose step, answer the stored proposal with a
    /// prevote once its validity is settled.
    async fn try_propose_step(&mut self) -> Result<bool, ConsensusError> {
        if self.state.step != Step::Propose {
            return Ok(false);
        }
        let height = self.state.height;
        let phase = self.state.phase;
        let ballot: Option<UnitId> = {
            let Some(record) = self.state.heights.get(&height) else {
                return Ok(false);
            };
            let Some(slot) = record.phase(phase).and_then(|p| p.proposal.as_ref()) else {
                return Ok(false);
            };
            let idv = slot.value.idv;
            match slot.validity {
                Validity::Pending => return Ok(false),
                Validity::Invalid => None,
                Validity::Valid => match slot.valid_phase {
                    None => {
                        let lock_ok = self
                            .state
                            .locked_value
                            .as_ref()
                            .map_or(true, |locked| locked.idv == idv);
                        if lock_ok {
                            Some(idv)
                        } else {
                            None
                        }
                    }
                    Some(claimed) if claimed < phase => {
                        let backed = record.phase(claimed).is_some_and(|p| {
                            p.has_prevote_quorum(Tally::Approved)
                                && p.proposal.as_ref().is_some_and(|s| s.value.idv == idv)
                        });
                        if !backed {
                            return Ok(false);
                        }
                        let lock_ok = self
                            .state
                            .locked_value
                            .as_ref()
                            .map_or(true, |locked| locked.idv == idv)
                            || self.state.locked_phase.is_some_and(|lp| lp <= claimed);
                        if lock_ok {
                            Some(idv)
                        } else {
                            None
                        }
                    }
                    // A valid-phase claim from the future is nonsense; the
                    // propose timer will take care of this phase.
                    Some(_) => return Ok(false),
                },
            }
        };
        self.cast_prevote(ballot).await?;
        Ok(true)
    }

    /// Prevote and precommit quorum rules: locking, nil escalation and the
    /// one-shot stage timers.
    async fn try_vote_quorums(&mut self) -> Result<bool, ConsensusError> {
        let height = self.state.height;
        let phase = self.state.phase;

        let backed: Option<SignedProposal> = self.state.heights.get(&height).and_then(|record| {
            record.phase(phase).and_then(|p| {
                if !p.has_prevote_quorum(Tally::Approved) {
                    return None;
                }
                p.proposal
                    .as_ref()
                    .filter(|slot| slot.validity == Validity::Valid)
                    .map(|slot| slot.value.clone())
            })
        });
        if let Some(value) = backed {
            if self.state.step == Step::Prevote {
                info!(height, phase, unit = %value.idv, "prevote quorum, locking");
                self.state.locked_value = Some(value.clone());
                self.state.locked_phase = Some(phase);
                self.state.valid_value = Some(value.clone());
                self.state.valid_phase = Some(phase);
                self.cast_precommit(Some(value.idv)).await?;
                return Ok(true);
            }
            if self.state.step == Step::Precommit && self.state.valid_phase != Some(phase) {
                debug!(height, phase, unit = %value.idv, "recording newer backed value");
                self.state.valid_value = Some(value);
                self.state.valid_phase = Some(phase);
                return Ok(true);
            }
        }

        if self.state.step == Step::Prevote {
            let rejected = self
                .state
                .heights
                .get(&height)
                .and_then(|record| record.phase(phase))
                .is_some_and(|p| p.has_prevote_quorum(Tally::Opposed));
            if rejected {
                debug!(height, phase, "prevote quorum against the proposal, precommitting nil");
                self.cast_precommit(None).await?;
                return Ok(true);
            }

            let arm = self
                .state
                .heights
                .get_mut(&height)
                .map(|record| record.phase_mut(phase))
                .is_some_and(|p| {
                    if p.prevote_timer_armed || !p.has_prevote_quorum(Tally::Any) {
                        false
                    } else {
                        p.prevote_timer_armed = true;
                        true
                    }
                });
            if arm {
                debug!(height, phase, "full prevote turnout, bounding the wait");
                self.arm_timer(height, phase, TimeoutKind::Prevote);
                return Ok(true);
            }
        }

        let arm = self
            .state
            .heights
            .get_mut(&height)
            .map(|record| record.phase_mut(phase))
            .is_some_and(|p| {
                if p.precommit_timer_armed || !p.has_precommit_quorum(Tally::Any) {
                    false
                } else {
                    p.precommit_timer_armed = true;
                    true
                }
            });
        if arm {
            debug!(height, phase, "full precommit turnout, bounding the wait");
            self.arm_timer(height, phase, TimeoutKind::Precommit);
            return Ok(true);
        }
        Ok(false)
    }

    async fn cast_prevote(&mut self, idv: Option<UnitId>) -> Result<(), ConsensusError> {
        let height = self.state.height;
        let phase = self.state.phase;
        let address = self.identity.address();
        if let Some(record) = self.state.heights.get_mut(&height) {
            record.record_prevote(phase, address, idv);
        }
        self.state.step = Step::Prevote;
        self.broadcast(ConsensusMessage::Prevote {
            address,
            height,
            phase,
            idv,
        })
        .await
    }

    async fn cast_precommit(&mut self, idv: Option<UnitId>) -> Result<(), ConsensusError> {
        let height = self.state.height;
        let phase = self.state.phase;
        let address = self.identity.address();
        let approval = CoordinatorApproval {
            address,
            signature: self
                .identity
                .sign(&precommit_payload(height, phase, idv.as_ref())),
        };
        if let Some(record) = self.state.heights.get_mut(&height) {
            record.record_precommit(phase, address, idv, approval.clone(), true);
        }
        self.state.step = Step::Precommit;
        self.broadcast(ConsensusMessage::Precommit {
            address,
            height,
            phase,
            idv,
            approval,
        })
        .await
    }

    async fn broadcast(&self, message: ConsensusMessage) -> Result<(), ConsensusError> {
        self.outgoing
            .send(message)
            .await
            .map_err(|_| ConsensusError::ChannelClosed)
    }

    /// Spawn a timer that reports back through the inbox. The captured
    /// (height, phase) lets the handler ignore it once the state moved on.
    fn arm_timer(&self, height: u64, phase: Phase, kind: TimeoutKind) {
        let delay = Duration::from_millis(phase_timeout_ms(phase));
        let inbox = self.inbox_tx.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = inbox
                        .send(EngineCommand::Timeout { height, phase, kind })
                        .await;
                }
            }
        });
    }
}
