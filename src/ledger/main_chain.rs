//! Main-chain stabilization.
//!
//! Committing a TrustME unit advances the stability point: the unit itself
//! joins the main chain at `last_stable_mci + 1`, and every not-yet-stable
//! ancestor reachable through parent links becomes stable at the same index.
//! Stable good proof-of-work units enter the witness-election index as they
//! stabilize.

use std::collections::{BTreeMap, BTreeSet};

use crate::ledger::storage::{
    CommitBatch, LedgerStore, RoundPowEntry, StorageError, UnitProps,
};
use crate::ledger::unit::{PowType, Sequence, UnitId};

/// Errors from main-chain advancement.
#[derive(Debug, thiserror::Error)]
pub enum MainChainError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("ancestor unit {0} is not in the ledger")]
    MissingUnit(UnitId),
}

/// Result of one stabilization step.
#[derive(Debug)]
pub struct Stabilization {
    pub new_mci: u64,
    /// Newly stabilized ancestors, ordered by (level, unit id).
    pub stabilized_units: Vec<UnitId>,
}

/// Look up unit props, preferring entries staged by the current commit.
pub fn props_of<S: LedgerStore + ?Sized>(
    store: &S,
    staged: &BTreeMap<UnitId, UnitProps>,
    id: &UnitId,
) -> Result<Option<UnitProps>, StorageError> {
    if let Some(props) = staged.get(id) {
        return Ok(Some(props.clone()));
    }
    store.get_props(id)
}

/// Stabilize the DAG under a TrustME anchor.
///
/// `staged` must already hold the anchor's props; the anchor and every
/// not-yet-stable ancestor are mutated in place and the main-chain and
/// witness-election index entries are appended to `batch`. The walk stops at
/// already-stable units, so each call touches only the new slice of the DAG.
pub fn stabilize_anchor<S: LedgerStore + ?Sized>(
    store: &S,
    anchor_id: UnitId,
    anchor_parents: &[UnitId],
    staged: &mut BTreeMap<UnitId, UnitProps>,
    batch: &mut CommitBatch,
    last_stable_mci: u64,
) -> Result<Stabilization, MainChainError> {
    let new_mci = last_stable_mci + 1;

    let anchor_props = staged
        .get_mut(&anchor_id)
        .ok_or(MainChainError::MissingUnit(anchor_id))?;
    anchor_props.main_chain_index = Some(new_mci);
    anchor_props.is_on_main_chain = true;
    anchor_props.is_stable = true;
    batch.mc_entries.push((new_mci, anchor_id));

    // Collect the unstable ancestor closure. Already-stable units bound the
    // walk; everything beyond them stabilized at an earlier mci.
    let mut visited: BTreeSet<UnitId> = BTreeSet::new();
    let mut collected: Vec<(u64, UnitId)> = Vec::new();
    let mut stack: Vec<UnitId> = anchor_parents.to_vec();
    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        let props = props_of(store, staged, &id)?.ok_or(MainChainError::MissingUnit(id))?;
        if props.is_stable {
            continue;
        }
        collected.push((props.level, id));
        let unit = store
            .get_unit(&id)?
            .ok_or(MainChainError::MissingUnit(id))?;
        stack.extend(unit.parent_units.iter().copied());
    }
    collected.sort();

    let mut stabilized_units = Vec::with_capacity(collected.len());
    for (_, id) in collected {
        let mut props = props_of(store, staged, &id)?.ok_or(MainChainError::MissingUnit(id))?;
        props.main_chain_index = Some(new_mci);
        props.is_stable = true;
        if props.sequence == Sequence::Good && props.pow_type == PowType::Pow {
            batch.round_pow_entries.push((
                props.round_index,
                RoundPowEntry {
                    mci: new_mci,
                    unit: id,
                    authors: props.author_addresses.clone(),
                },
            ));
        }
        staged.insert(id, props);
        stabilized_units.push(id);
    }

    Ok(Stabilization {
        new_mci,
        stabilized_units,
    })
}

/// Witnessed level and latest included mci derived from a unit's parents.
///
/// The writer records these as reported by upstream validation; this helper
/// recomputes the parent maximum as a fallback for locally composed units.
pub fn parent_mc_view<S: LedgerStore + ?Sized>(
    store: &S,
    staged: &BTreeMap<UnitId, UnitProps>,
    parents: &[UnitId],
) -> Result<(u64, Option<u64>), MainChainError> {
    let mut witnessed_level = 0u64;
    let mut limci: Option<u64> = None;
    for parent in parents {
        let props = props_of(store, staged, parent)?.ok_or(MainChainError::MissingUnit(*parent))?;
        witnessed_level = witnessed_level.max(props.witnessed_level);
        let parent_limci = props.main_chain_index.or(props.latest_included_mc_index);
        limci = match (limci, parent_limci) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
    Ok((witnessed_level, limci))
}
