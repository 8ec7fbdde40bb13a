//! Atomic unit commits.
//!
//! All units enter the ledger through `UnitWriter::commit`. The writer holds
//! a process-wide async lock (tokio's mutex queues waiters in FIFO order, so
//! concurrent commits land in arrival order), stages every write of a commit
//! into one `CommitBatch` with all fallible work done up front, then applies
//! the batch in one shot. A commit that fails at any staging step leaves the
//! ledger untouched.
//!
//! Committing a TrustME unit additionally advances the main chain and
//! publishes `MciStable` on the event bus.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::events::{EventBus, NodeEvent};
use crate::ledger::main_chain::{parent_mc_view, props_of, stabilize_anchor, MainChainError};
use crate::ledger::storage::{
    ChainMeta, CommitBatch, LedgerStore, SpendProofRecord, StorageError, UnitProps,
};
use crate::ledger::unit::{Input, Message, PowType, Sequence, Unit, UnitError, UnitId};

/// Errors from unit commits.
#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    MainChain(#[from] MainChainError),
    #[error(transparent)]
    Structure(#[from] UnitError),
    #[error("unit {0} is already in the ledger")]
    DuplicateUnit(UnitId),
    #[error("parent unit {0} is not in the ledger")]
    MissingParent(UnitId),
    #[error("transfer input spends unknown output {unit}:{message_index}:{output_index}")]
    MissingOutput {
        unit: UnitId,
        message_index: u32,
        output_index: u32,
    },
    #[error("genesis unit already recorded")]
    GenesisExists,
    #[error("malformed unit: {0}")]
    Malformed(String),
}

/// Validation results the writer records alongside a unit.
///
/// Produced by upstream validation for gossiped units and derived from the
/// parents for locally composed ones.
#[derive(Clone, Debug, Default)]
pub struct ValidationState {
    pub witnessed_level: u64,
    pub latest_included_mc_index: Option<u64>,
    pub sequence: Sequence,
}

impl ValidationState {
    /// Derive the chain view for a locally composed unit from its parents.
    pub fn derived<S: LedgerStore + ?Sized>(
        store: &S,
        parents: &[UnitId],
    ) -> Result<Self, MainChainError> {
        let staged = BTreeMap::new();
        let (witnessed_level, latest_included_mc_index) =
            parent_mc_view(store, &staged, parents)?;
        Ok(ValidationState {
            witnessed_level,
            latest_included_mc_index,
            sequence: Sequence::Good,
        })
    }
}

/// What a successful commit produced.
#[derive(Debug)]
pub struct CommitOutcome {
    pub unit: UnitId,
    pub pow_type: PowType,
    /// New stability point, set by genesis and TrustME commits.
    pub new_mci: Option<u64>,
    pub stabilized_units: Vec<UnitId>,
}

struct WriterStats {
    commits: u64,
    last_measured_units: u64,
}

/// Serializes all ledger writes behind one FIFO lock.
pub struct UnitWriter<S: LedgerStore + ?Sized> {
    store: Arc<S>,
    events: EventBus,
    stats: Mutex<WriterStats>,
}

impl<S: LedgerStore + ?Sized> UnitWriter<S> {
    pub fn new(store: Arc<S>, events: EventBus) -> Self {
        UnitWriter {
            store,
            events,
            stats: Mutex::new(WriterStats {
                commits: 0,
                last_measured_units: 0,
            }),
        }
    }

    /// Commit a unit.
    pub async fn commit(
        &self,
        unit: Unit,
        validation: ValidationState,
    ) -> Result<CommitOutcome, WriterError> {
        self.commit_with_hook(unit, validation, |_| Ok(())).await
    }

    /// Commit a unit, letting `hook` stage extra writes into the same batch
    /// just before it is applied. Hook failures abort the whole commit.
    pub async fn commit_with_hook<F>(
        &self,
        unit: Unit,
        validation: ValidationState,
        hook: F,
    ) -> Result<CommitOutcome, WriterError>
    where
        F: FnOnce(&mut CommitBatch) -> Result<(), StorageError>,
    {
        let mut stats = self.stats.lock().await;
        let outcome = self.stage_and_apply(unit, validation, hook)?;

        debug!(unit = %outcome.unit, "unit committed");
        self.events.emit(NodeEvent::UnitSaved {
            unit: outcome.unit,
            pow_type: outcome.pow_type,
        });
        if let Some(mci) = outcome.new_mci {
            info!(
                mci,
                stabilized = outcome.stabilized_units.len(),
                "main chain advanced"
            );
            self.events.emit(NodeEvent::MciStable { mci });
        }

        stats.commits += 1;
        if stats.commits % crate::constants::STATS_REFRESH_EVERY == 0 {
            // The unit is already durable; stats trouble must not fail it.
            if let Err(error) = self.refresh_stats(&mut stats) {
                warn!(%error, "ledger stats refresh failed");
            }
        }
        Ok(outcome)
    }

    fn stage_and_apply<F>(
        &self,
        unit: Unit,
        validation: ValidationState,
        hook: F,
    ) -> Result<CommitOutcome, WriterError>
    where
        F: FnOnce(&mut CommitBatch) -> Result<(), StorageError>,
    {
        unit.check_structure()?;
        let id = unit.id();
        if self.store.has_unit(&id)? {
            return Err(WriterError::DuplicateUnit(id));
        }

        let mut batch = CommitBatch::default();
        let mut staged: BTreeMap<UnitId, UnitProps> = BTreeMap::new();
        let mut new_mci = None;
        let mut stabilized_units = Vec::new();

        let chain_meta = if unit.is_genesis() {
            if self.store.chain_meta()?.is_some() {
                return Err(WriterError::GenesisExists);
            }
            staged.insert(
                id,
                UnitProps {
                    unit: id,
                    level: 0,
                    witnessed_level: 0,
                    latest_included_mc_index: None,
                    main_chain_index: Some(0),
                    is_on_main_chain: true,
                    is_stable: true,
                    is_free: true,
                    sequence: Sequence::Good,
                    round_index: unit.round_index,
                    pow_type: unit.pow_type,
                    author_addresses: unit.author_addresses(),
                    timestamp: unit.timestamp,
                },
            );
            batch.mc_entries.push((0, id));
            batch.free_added.push(id);
            new_mci = Some(0);
            ChainMeta {
                genesis_unit: Some(id),
                last_stable_mci: 0,
            }
        } else {
            let mut meta = self
                .store
                .chain_meta()?
                .ok_or_else(|| WriterError::Malformed("ledger has no genesis".into()))?;

            let mut level = 0u64;
            for parent in &unit.parent_units {
                let mut props = props_of(&*self.store, &staged, parent)
                    .map_err(WriterError::Storage)?
                    .ok_or(WriterError::MissingParent(*parent))?;
                level = level.max(props.level + 1);
                if props.is_free {
                    props.is_free = false;
                    batch.free_removed.push(*parent);
                    staged.insert(*parent, props);
                }
                batch.children.push((*parent, id));
            }

            staged.insert(
                id,
                UnitProps {
                    unit: id,
                    level,
                    witnessed_level: validation.witnessed_level,
                    latest_included_mc_index: validation.latest_included_mc_index,
                    main_chain_index: None,
                    is_on_main_chain: false,
                    is_stable: false,
                    is_free: true,
                    sequence: validation.sequence,
                    round_index: unit.round_index,
                    pow_type: unit.pow_type,
                    author_addresses: unit.author_addresses(),
                    timestamp: unit.timestamp,
                },
            );
            batch.free_added.push(id);

            if unit.pow_type == PowType::TrustMe {
                let result = stabilize_anchor(
                    &*self.store,
                    id,
                    &unit.parent_units,
                    &mut staged,
                    &mut batch,
                    meta.last_stable_mci,
                )?;
                meta.last_stable_mci = result.new_mci;
                new_mci = Some(result.new_mci);
                stabilized_units = result.stabilized_units;
            }
            meta
        };

        for (message_index, message) in unit.messages.iter().enumerate() {
            if let Message::Payment(payment) = message {
                for input in &payment.inputs {
                    let &Input::Transfer {
                        unit: source_unit,
                        message_index: source_message,
                        output_index: source_output,
                    } = input
                    else {
                        continue;
                    };
                    let source = self
                        .store
                        .get_output(&source_unit, source_message, source_output)?
                        .ok_or(WriterError::MissingOutput {
                            unit: source_unit,
                            message_index: source_message,
                            output_index: source_output,
                        })?;
                    // A single author owns every input; with several, the
                    // spent output must belong to one of them.
                    if unit.authors.len() > 1
                        && !unit.authors.iter().any(|a| a.address == source.address)
                    {
                        return Err(WriterError::Malformed(format!(
                            "transfer input spends an output of non-author {}",
                            source.address
                        )));
                    }
                    batch
                        .spent_outputs
                        .push((source_unit, source_message, source_output));
                }
                for (output_index, output) in payment.outputs.iter().enumerate() {
                    batch.outputs.push((
                        id,
                        message_index as u32,
                        output_index as u32,
                        output.clone(),
                    ));
                }
                for proof in &payment.spend_proofs {
                    let address = match proof.address {
                        Some(address) => address,
                        None if unit.authors.len() == 1 => unit.authors[0].address,
                        None => {
                            return Err(WriterError::Malformed(
                                "spend proof needs an address on a multi-author unit".into(),
                            ))
                        }
                    };
                    batch
                        .spend_proofs
                        .push((proof.spend_proof, SpendProofRecord { unit: id, address }));
                }
            }
        }
        for author in &unit.authors {
            if let Some(definition) = &author.definition {
                batch.definitions.push((author.address, definition.clone()));
            }
        }

        batch.chain_meta = Some(chain_meta);
        batch.props = staged.into_values().collect();
        let pow_type = unit.pow_type;
        batch.units.push(unit);

        hook(&mut batch)?;

        self.store.apply_commit(&batch)?;
        Ok(CommitOutcome {
            unit: id,
            pow_type,
            new_mci,
            stabilized_units,
        })
    }

    fn refresh_stats(&self, stats: &mut WriterStats) -> Result<(), StorageError> {
        let units = self.store.unit_count()?;
        if units >= stats.last_measured_units.saturating_mul(2)
            && units < crate::constants::STATS_REFRESH_MAX_UNITS
        {
            self.store.flush()?;
            let size_on_disk = self.store.size_on_disk()?;
            info!(units, size_on_disk, "ledger stats refreshed");
            stats.last_measured_units = units;
        }
        Ok(())
    }
}
