//! Round oracle: who the witnesses of a round are.
//!
//! Round 1 runs with the configured initial witness set. Every later round
//! elects its witnesses from the ledger: the first distinct authors of stable
//! good proof-of-work units of the previous round, in (mci, unit) order, up
//! to one less than the committee size, with the foundation address filling
//! the final seat. Until enough units of the previous round have stabilized
//! the election is not ready, which callers treat as a retryable condition.
//!
//! Witness sets are immutable once computed and cached per round; the cache
//! keeps only the most recent rounds.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::debug;

use crate::constants::{MAX_ROUNDS_IN_CACHE, TOTAL_COORDINATORS};
use crate::identity::Address;
use crate::ledger::storage::{LedgerStore, RoundRecord, StorageError};

/// Errors from witness resolution.
#[derive(Debug, thiserror::Error)]
pub enum RoundError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Not enough stable units of the previous round yet. Retryable.
    #[error("round {round_index} has {have} eligible witness authors, needs {need}")]
    NotReady {
        round_index: u64,
        have: usize,
        need: usize,
    },
    #[error("no round records in the ledger")]
    NoRounds,
    #[error("round {0} is not a valid round index")]
    UnknownRound(u64),
    #[error("initial witness set must hold {expected} distinct addresses, got {got}")]
    BadInitialSet { expected: usize, got: usize },
}

/// Resolves and caches witness sets per round.
pub struct RoundOracle<S: LedgerStore + ?Sized> {
    store: Arc<S>,
    initial_witnesses: Arc<Vec<Address>>,
    foundation: Address,
    cache: BTreeMap<u64, Arc<Vec<Address>>>,
}

impl<S: LedgerStore + ?Sized> RoundOracle<S> {
    pub fn new(
        store: Arc<S>,
        initial_witnesses: Vec<Address>,
        foundation: Address,
    ) -> Result<Self, RoundError> {
        let distinct: BTreeSet<&Address> = initial_witnesses.iter().collect();
        if initial_witnesses.len() != TOTAL_COORDINATORS || distinct.len() != TOTAL_COORDINATORS {
            return Err(RoundError::BadInitialSet {
                expected: TOTAL_COORDINATORS,
                got: distinct.len(),
            });
        }
        Ok(RoundOracle {
            store,
            initial_witnesses: Arc::new(initial_witnesses),
            foundation,
            cache: BTreeMap::new(),
        })
    }

    /// The round with the highest recorded index.
    pub fn current_round(&self) -> Result<RoundRecord, RoundError> {
        self.store.latest_round()?.ok_or(RoundError::NoRounds)
    }

    /// Witness set of the current round.
    pub fn current_witnesses(&mut self) -> Result<(u64, Arc<Vec<Address>>), RoundError> {
        let record = self.current_round()?;
        let witnesses = self.witnesses(record.round_index)?;
        Ok((record.round_index, witnesses))
    }

    /// Witness set of a round. Cached after the first successful resolution;
    /// a `NotReady` result is never cached so callers can retry.
    pub fn witnesses(&mut self, round_index: u64) -> Result<Arc<Vec<Address>>, RoundError> {
        if let Some(cached) = self.cache.get(&round_index) {
            return Ok(cached.clone());
        }
        let set = match round_index {
            0 => return Err(RoundError::UnknownRound(0)),
            1 => self.initial_witnesses.clone(),
            r => Arc::new(self.elect(r)?),
        };
        self.cache.insert(round_index, set.clone());
        Ok(set)
    }

    /// Drop cache entries older than the most recent rounds.
    pub fn shrink_cache(&mut self) {
        if let Some(&max) = self.cache.keys().next_back() {
            let keep_from = max.saturating_sub(MAX_ROUNDS_IN_CACHE - 1);
            self.cache.retain(|&round, _| round >= keep_from);
        }
    }

    fn elect(&self, round_index: u64) -> Result<Vec<Address>, RoundError> {
        let need = TOTAL_COORDINATORS - 1;
        let mut elected: Vec<Address> = Vec::with_capacity(TOTAL_COORDINATORS);
        'scan: for entry in self.store.round_pow_units(round_index - 1)? {
            for author in entry.authors {
                if author == self.foundation || elected.contains(&author) {
                    continue;
                }
                elected.push(author);
                if elected.len() == need {
                    break 'scan;
                }
            }
        }
        if elected.len() < need {
            return Err(RoundError::NotReady {
                round_index,
                have: elected.len(),
                need,
            });
        }
        elected.push(self.foundation);
        debug!(round_index, "witness set elected");
        Ok(elected)
    }
}
