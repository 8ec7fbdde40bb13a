//! Persistent storage for the unit DAG.
//!
//! Provides a `LedgerStore` trait and a sled-backed implementation persisting
//! units, their graph properties, payload indexes, the main-chain index, and
//! round records. All writes produced by a single commit go through
//! `apply_commit`, which serializes everything before touching any tree so a
//! failed commit leaves the database untouched.

use serde::{Deserialize, Serialize};

use crate::identity::Address;
use crate::ledger::unit::{Definition, Output, PowType, Sequence, Unit, UnitId};
use crate::Hash;

/// Errors from storage operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Graph and chain properties tracked per unit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnitProps {
    pub unit: UnitId,
    /// Longest-path distance from genesis.
    pub level: u64,
    pub witnessed_level: u64,
    pub latest_included_mc_index: Option<u64>,
    pub main_chain_index: Option<u64>,
    pub is_on_main_chain: bool,
    pub is_stable: bool,
    pub is_free: bool,
    pub sequence: Sequence,
    pub round_index: u64,
    pub pow_type: PowType,
    /// Denormalized from the unit so stabilization never refetches bodies.
    pub author_addresses: Vec<Address>,
    pub timestamp: u64,
}

/// Chain-wide metadata snapshot.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChainMeta {
    pub genesis_unit: Option<UnitId>,
    pub last_stable_mci: u64,
}

/// A round of the mining schedule, recorded once its anchor stabilizes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round_index: u64,
    /// Main-chain index at which this round opened.
    pub anchor_mci: u64,
}

/// A stable good proof-of-work unit indexed for witness election.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundPowEntry {
    pub mci: u64,
    pub unit: UnitId,
    pub authors: Vec<Address>,
}

/// Record behind a spend-proof commitment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpendProofRecord {
    pub unit: UnitId,
    pub address: Address,
}

/// All writes produced by committing one unit, applied atomically.
#[derive(Default)]
pub struct CommitBatch {
    pub units: Vec<Unit>,
    pub props: Vec<UnitProps>,
    /// Parent/child edges introduced by the new unit.
    pub children: Vec<(UnitId, UnitId)>,
    pub definitions: Vec<(Address, Definition)>,
    pub outputs: Vec<(UnitId, u32, u32, Output)>,
    /// Outputs consumed by this unit's transfer inputs.
    pub spent_outputs: Vec<(UnitId, u32, u32)>,
    pub spend_proofs: Vec<(Hash, SpendProofRecord)>,
    pub free_added: Vec<UnitId>,
    pub free_removed: Vec<UnitId>,
    /// Main-chain index entries assigned during stabilization.
    pub mc_entries: Vec<(u64, UnitId)>,
    /// Stable good PoW units entering the witness-election index.
    pub round_pow_entries: Vec<(u64, RoundPowEntry)>,
    pub chain_meta: Option<ChainMeta>,
}

/// Trait for persistent ledger backends.
pub trait LedgerStore: Send + Sync {
    fn get_unit(&self, id: &UnitId) -> Result<Option<Unit>, StorageError>;
    fn has_unit(&self, id: &UnitId) -> Result<bool, StorageError>;
    fn get_props(&self, id: &UnitId) -> Result<Option<UnitProps>, StorageError>;

    /// Children of a unit, in id order.
    fn children_of(&self, id: &UnitId) -> Result<Vec<UnitId>, StorageError>;

    fn get_definition(&self, address: &Address) -> Result<Option<Definition>, StorageError>;
    /// Register an address definition outside a commit (bootstrap only).
    fn put_definition(&self, address: &Address, definition: &Definition)
        -> Result<(), StorageError>;

    /// Addresses this node has ever signed as. Expected to hold one row.
    fn identity_addresses(&self) -> Result<Vec<Address>, StorageError>;
    /// Record the local signing address (no-op when already present).
    fn register_identity(&self, address: &Address) -> Result<(), StorageError>;

    fn get_output(
        &self,
        unit: &UnitId,
        message_index: u32,
        output_index: u32,
    ) -> Result<Option<Output>, StorageError>;
    fn is_output_spent(
        &self,
        unit: &UnitId,
        message_index: u32,
        output_index: u32,
    ) -> Result<bool, StorageError>;
    fn has_spend_proof(&self, proof: &Hash) -> Result<bool, StorageError>;

    /// Current free units (tips), in id order.
    fn free_units(&self) -> Result<Vec<UnitId>, StorageError>;

    fn unit_at_mci(&self, mci: u64) -> Result<Option<UnitId>, StorageError>;

    /// Stable good PoW units of a round, ordered by (mci, unit id).
    fn round_pow_units(&self, round_index: u64) -> Result<Vec<RoundPowEntry>, StorageError>;

    fn get_round(&self, round_index: u64) -> Result<Option<RoundRecord>, StorageError>;
    fn put_round(&self, record: &RoundRecord) -> Result<(), StorageError>;
    /// The round with the highest index, if any.
    fn latest_round(&self) -> Result<Option<RoundRecord>, StorageError>;

    fn chain_meta(&self) -> Result<Option<ChainMeta>, StorageError>;
    fn unit_count(&self) -> Result<u64, StorageError>;

    /// Apply all writes of one commit atomically.
    ///
    /// Serializes every value into per-tree sled batches before applying any
    /// of them, so a serialization failure cannot leave a partial commit.
    fn apply_commit(&self, batch: &CommitBatch) -> Result<(), StorageError>;

    fn flush(&self) -> Result<(), StorageError>;
    fn size_on_disk(&self) -> Result<u64, StorageError>;
}

/// Sled-backed ledger store.
pub struct SledLedgerStore {
    db: sled::Db,
    units: sled::Tree,
    unit_props: sled::Tree,
    children: sled::Tree,
    definitions: sled::Tree,
    identities: sled::Tree,
    outputs: sled::Tree,
    spent_outputs: sled::Tree,
    spend_proofs: sled::Tree,
    free_units: sled::Tree,
    mc_index: sled::Tree,
    round_pow: sled::Tree,
    rounds: sled::Tree,
    chain_meta: sled::Tree,
    unit_count: std::sync::atomic::AtomicU64,
}

impl SledLedgerStore {
    /// Open or create a sled database at the given path.
    pub fn open(path: &std::path::Path) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| StorageError::Io(e.to_string()))?;
        Self::from_db(db)
    }

    /// Open a temporary in-memory sled database (for testing).
    pub fn open_temporary() -> Result<Self, StorageError> {
        let config = sled::Config::new().temporary(true);
        let db = config.open().map_err(|e| StorageError::Io(e.to_string()))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StorageError> {
        let units = db
            .open_tree("units")
            .map_err(|e| StorageError::Io(e.to_string()))?;
        let unit_props = db
            .open_tree("unit_props")
            .map_err(|e| StorageError::Io(e.to_string()))?;
        let children = db
            .open_tree("children")
            .map_err(|e| StorageError::Io(e.to_string()))?;
        let definitions = db
            .open_tree("definitions")
            .map_err(|e| StorageError::Io(e.to_string()))?;
        let identities = db
            .open_tree("identities")
            .map_err(|e| StorageError::Io(e.to_string()))?;
        let outputs = db
            .open_tree("outputs")
            .map_err(|e| StorageError::Io(e.to_string()))?;
        let spent_outputs = db
            .open_tree("spent_outputs")
            .map_err(|e| StorageError::Io(e.to_string()))?;
        let spend_proofs = db
            .open_tree("spend_proofs")
            .map_err(|e| StorageError::Io(e.to_string()))?;
        let free_units = db
            .open_tree("free_units")
            .map_err(|e| StorageError::Io(e.to_string()))?;
        let mc_index = db
            .open_tree("mc_index")
            .map_err(|e| StorageError::Io(e.to_string()))?;
        let round_pow = db
            .open_tree("round_pow")
            .map_err(|e| StorageError::Io(e.to_string()))?;
        let rounds = db
            .open_tree("rounds")
            .map_err(|e| StorageError::Io(e.to_string()))?;
        let chain_meta = db
            .open_tree("chain_meta")
            .map_err(|e| StorageError::Io(e.to_string()))?;
        let unit_count = std::sync::atomic::AtomicU64::new(units.len() as u64);
        Ok(SledLedgerStore {
            db,
            units,
            unit_props,
            children,
            definitions,
            identities,
            outputs,
            spent_outputs,
            spend_proofs,
            free_units,
            mc_index,
            round_pow,
            rounds,
            chain_meta,
            unit_count,
        })
    }
}

fn output_key(unit: &UnitId, message_index: u32, output_index: u32) -> [u8; 40] {
    let mut key = [0u8; 40];
    key[..32].copy_from_slice(&unit.0);
    key[32..36].copy_from_slice(&message_index.to_be_bytes());
    key[36..].copy_from_slice(&output_index.to_be_bytes());
    key
}

fn child_key(parent: &UnitId, child: &UnitId) -> [u8; 64] {
    let mut key = [0u8; 64];
    key[..32].copy_from_slice(&parent.0);
    key[32..].copy_from_slice(&child.0);
    key
}

// Big-endian prefix so sled's lexicographic order matches (round, mci, unit).
fn round_pow_key(round_index: u64, entry: &RoundPowEntry) -> [u8; 48] {
    let mut key = [0u8; 48];
    key[..8].copy_from_slice(&round_index.to_be_bytes());
    key[8..16].copy_from_slice(&entry.mci.to_be_bytes());
    key[16..].copy_from_slice(&entry.unit.0);
    key
}

impl LedgerStore for SledLedgerStore {
    fn get_unit(&self, id: &UnitId) -> Result<Option<Unit>, StorageError> {
        match self
            .units
            .get(id.0)
            .map_err(|e| StorageError::Io(e.to_string()))?
        {
            Some(bytes) => {
                let unit = crate::deserialize(&bytes)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Some(unit))
            }
            None => Ok(None),
        }
    }

    fn has_unit(&self, id: &UnitId) -> Result<bool, StorageError> {
        self.units
            .contains_key(id.0)
            .map_err(|e| StorageError::Io(e.to_string()))
    }

    fn get_props(&self, id: &UnitId) -> Result<Option<UnitProps>, StorageError> {
        match self
            .unit_props
            .get(id.0)
            .map_err(|e| StorageError::Io(e.to_string()))?
        {
            Some(bytes) => {
                let props = crate::deserialize(&bytes)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Some(props))
            }
            None => Ok(None),
        }
    }

    fn children_of(&self, id: &UnitId) -> Result<Vec<UnitId>, StorageError> {
        let mut result = Vec::new();
        for entry in self.children.scan_prefix(id.0) {
            let (key, _) = entry.map_err(|e| StorageError::Io(e.to_string()))?;
            let child: Hash = key[32..]
                .try_into()
                .map_err(|_| StorageError::Serialization("invalid child key".into()))?;
            result.push(UnitId(child));
        }
        Ok(result)
    }

    fn get_definition(&self, address: &Address) -> Result<Option<Definition>, StorageError> {
        match self
            .definitions
            .get(address.0)
            .map_err(|e| StorageError::Io(e.to_string()))?
        {
            Some(bytes) => {
                let def = crate::deserialize(&bytes)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Some(def))
            }
            None => Ok(None),
        }
    }

    fn put_definition(
        &self,
        address: &Address,
        definition: &Definition,
    ) -> Result<(), StorageError> {
        let value =
            crate::serialize(definition).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.definitions
            .insert(address.0, value)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }

    fn identity_addresses(&self) -> Result<Vec<Address>, StorageError> {
        let mut result = Vec::new();
        for entry in self.identities.iter() {
            let (key, _) = entry.map_err(|e| StorageError::Io(e.to_string()))?;
            let address: Hash = key
                .as_ref()
                .try_into()
                .map_err(|_| StorageError::Serialization("invalid identity key".into()))?;
            result.push(Address(address));
        }
        Ok(result)
    }

    fn register_identity(&self, address: &Address) -> Result<(), StorageError> {
        self.identities
            .insert(address.0, &[][..])
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }

    fn get_output(
        &self,
        unit: &UnitId,
        message_index: u32,
        output_index: u32,
    ) -> Result<Option<Output>, StorageError> {
        let key = output_key(unit, message_index, output_index);
        match self
            .outputs
            .get(key)
            .map_err(|e| StorageError::Io(e.to_string()))?
        {
            Some(bytes) => {
                let output = crate::deserialize(&bytes)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Some(output))
            }
            None => Ok(None),
        }
    }

    fn is_output_spent(
        &self,
        unit: &UnitId,
        message_index: u32,
        output_index: u32,
    ) -> Result<bool, StorageError> {
        self.spent_outputs
            .contains_key(output_key(unit, message_index, output_index))
            .map_err(|e| StorageError::Io(e.to_string()))
    }

    fn has_spend_proof(&self, proof: &Hash) -> Result<bool, StorageError> {
        self.spend_proofs
            .contains_key(proof)
            .map_err(|e| StorageError::Io(e.to_string()))
    }

    fn free_units(&self) -> Result<Vec<UnitId>, StorageError> {
        let mut result = Vec::new();
        for entry in self.free_units.iter() {
            let (key, _) = entry.map_err(|e| StorageError::Io(e.to_string()))?;
            let id: Hash = key
                .as_ref()
                .try_into()
                .map_err(|_| StorageError::Serialization("invalid free unit key".into()))?;
            result.push(UnitId(id));
        }
        Ok(result)
    }

    fn unit_at_mci(&self, mci: u64) -> Result<Option<UnitId>, StorageError> {
        match self
            .mc_index
            .get(mci.to_be_bytes())
            .map_err(|e| StorageError::Io(e.to_string()))?
        {
            Some(bytes) => {
                let id: Hash = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| StorageError::Serialization("invalid mc index value".into()))?;
                Ok(Some(UnitId(id)))
            }
            None => Ok(None),
        }
    }

    fn round_pow_units(&self, round_index: u64) -> Result<Vec<RoundPowEntry>, StorageError> {
        let mut result = Vec::new();
        for entry in self.round_pow.scan_prefix(round_index.to_be_bytes()) {
            let (_, value) = entry.map_err(|e| StorageError::Io(e.to_string()))?;
            let pow_entry: RoundPowEntry = crate::deserialize(&value)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            result.push(pow_entry);
        }
        Ok(result)
    }

    fn get_round(&self, round_index: u64) -> Result<Option<RoundRecord>, StorageError> {
        match self
            .rounds
            .get(round_index.to_be_bytes())
            .map_err(|e| StorageError::Io(e.to_string()))?
        {
            Some(bytes) => {
                let record = crate::deserialize(&bytes)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn put_round(&self, record: &RoundRecord) -> Result<(), StorageError> {
        let value =
            crate::serialize(record).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.rounds
            .insert(record.round_index.to_be_bytes(), value)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }

    fn latest_round(&self) -> Result<Option<RoundRecord>, StorageError> {
        match self
            .rounds
            .last()
            .map_err(|e| StorageError::Io(e.to_string()))?
        {
            Some((_, bytes)) => {
                let record = crate::deserialize(&bytes)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn chain_meta(&self) -> Result<Option<ChainMeta>, StorageError> {
        match self
            .chain_meta
            .get(b"current")
            .map_err(|e| StorageError::Io(e.to_string()))?
        {
            Some(bytes) => {
                let meta = crate::deserialize(&bytes)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Some(meta))
            }
            None => Ok(None),
        }
    }

    fn unit_count(&self) -> Result<u64, StorageError> {
        Ok(self.unit_count.load(std::sync::atomic::Ordering::Acquire))
    }

    fn apply_commit(&self, batch: &CommitBatch) -> Result<(), StorageError> {
        let mut unit_batch = sled::Batch::default();
        for unit in &batch.units {
            let value =
                crate::serialize(unit).map_err(|e| StorageError::Serialization(e.to_string()))?;
            unit_batch.insert(&unit.id().0, value);
        }

        let mut props_batch = sled::Batch::default();
        for props in &batch.props {
            let value =
                crate::serialize(props).map_err(|e| StorageError::Serialization(e.to_string()))?;
            props_batch.insert(&props.unit.0, value);
        }

        let mut children_batch = sled::Batch::default();
        for (parent, child) in &batch.children {
            children_batch.insert(child_key(parent, child).as_ref(), &[1u8]);
        }

        let mut def_batch = sled::Batch::default();
        for (address, definition) in &batch.definitions {
            let value = crate::serialize(definition)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            def_batch.insert(&address.0, value);
        }

        let mut output_batch = sled::Batch::default();
        for &(ref unit, message_index, output_index, ref output) in &batch.outputs {
            let value =
                crate::serialize(output).map_err(|e| StorageError::Serialization(e.to_string()))?;
            output_batch.insert(output_key(unit, message_index, output_index).as_ref(), value);
        }

        let mut spent_batch = sled::Batch::default();
        for &(ref unit, message_index, output_index) in &batch.spent_outputs {
            spent_batch.insert(
                output_key(unit, message_index, output_index).as_ref(),
                &[1u8],
            );
        }

        let mut proof_batch = sled::Batch::default();
        for (proof, record) in &batch.spend_proofs {
            let value =
                crate::serialize(record).map_err(|e| StorageError::Serialization(e.to_string()))?;
            proof_batch.insert(proof.as_ref(), value);
        }

        let mut free_batch = sled::Batch::default();
        for id in &batch.free_removed {
            free_batch.remove(&id.0);
        }
        for id in &batch.free_added {
            free_batch.insert(&id.0, &[1u8]);
        }

        let mut mc_batch = sled::Batch::default();
        for &(mci, ref id) in &batch.mc_entries {
            mc_batch.insert(&mci.to_be_bytes(), &id.0);
        }

        let mut round_pow_batch = sled::Batch::default();
        for &(round_index, ref entry) in &batch.round_pow_entries {
            let value =
                crate::serialize(entry).map_err(|e| StorageError::Serialization(e.to_string()))?;
            round_pow_batch.insert(round_pow_key(round_index, entry).as_ref(), value);
        }

        let mut meta_batch = sled::Batch::default();
        if let Some(ref meta) = batch.chain_meta {
            let value =
                crate::serialize(meta).map_err(|e| StorageError::Serialization(e.to_string()))?;
            meta_batch.insert(b"current".as_ref(), value);
        }

        // Apply all batches
        self.units
            .apply_batch(unit_batch)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        self.unit_props
            .apply_batch(props_batch)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        self.children
            .apply_batch(children_batch)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        self.definitions
            .apply_batch(def_batch)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        self.outputs
            .apply_batch(output_batch)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        self.spent_outputs
            .apply_batch(spent_batch)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        self.spend_proofs
            .apply_batch(proof_batch)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        self.free_units
            .apply_batch(free_batch)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        self.mc_index
            .apply_batch(mc_batch)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        self.round_pow
            .apply_batch(round_pow_batch)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        self.chain_meta
            .apply_batch(meta_batch)
            .map_err(|e| StorageError::Io(e.to_string()))?;

        self.unit_count.fetch_add(
            batch.units.len() as u64,
            std::sync::atomic::Ordering::Release,
        );

        self.db
            .flush()
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db
            .flush()
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }

    fn size_on_disk(&self) -> Result<u64, StorageError> {
        self.db
            .size_on_disk()
            .map_err(|e| StorageError::Io(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{LocalIdentity, Signer};
    use crate::ledger::unit::{Author, Message};
    use std::collections::BTreeMap;

    fn temp_store() -> SledLedgerStore {
        SledLedgerStore::open_temporary().unwrap()
    }

    fn test_unit(seed: u8, parents: Vec<UnitId>) -> Unit {
        let id = LocalIdentity::from_seed([seed; 32]);
        Unit {
            version: Unit::VERSION,
            parent_units: parents,
            authors: vec![Author {
                address: id.address(),
                definition: Some(Definition {
                    public_key: id.public_key_bytes(),
                }),
                authentifiers: BTreeMap::from([("r".to_string(), id.sign(b"t"))]),
            }],
            messages: vec![Message::Text(format!("unit {seed}"))],
            round_index: 1,
            pow_type: PowType::Pow,
            timestamp: 1_000 + seed as u64,
            trustme: None,
        }
    }

    fn props_for(unit: &Unit) -> UnitProps {
        UnitProps {
            unit: unit.id(),
            level: 0,
            witnessed_level: 0,
            latest_included_mc_index: None,
            main_chain_index: None,
            is_on_main_chain: false,
            is_stable: false,
            is_free: true,
            sequence: Sequence::Good,
            round_index: unit.round_index,
            pow_type: unit.pow_type,
            author_addresses: unit.author_addresses(),
            timestamp: unit.timestamp,
        }
    }

    #[test]
    fn unit_commit_roundtrip() {
        let store = temp_store();
        let unit = test_unit(1, vec![]);
        let id = unit.id();

        let batch = CommitBatch {
            units: vec![unit.clone()],
            props: vec![props_for(&unit)],
            free_added: vec![id],
            ..Default::default()
        };
        store.apply_commit(&batch).unwrap();

        assert!(store.has_unit(&id).unwrap());
        let loaded = store.get_unit(&id).unwrap().unwrap();
        assert_eq!(loaded.id(), id);
        let props = store.get_props(&id).unwrap().unwrap();
        assert!(props.is_free);
        assert_eq!(store.free_units().unwrap(), vec![id]);
        assert_eq!(store.unit_count().unwrap(), 1);
    }

    #[test]
    fn missing_unit_is_none() {
        let store = temp_store();
        let id = UnitId([99u8; 32]);
        assert!(store.get_unit(&id).unwrap().is_none());
        assert!(!store.has_unit(&id).unwrap());
        assert!(store.get_props(&id).unwrap().is_none());
    }

    #[test]
    fn children_scan_by_parent() {
        let store = temp_store();
        let parent = UnitId([1u8; 32]);
        let other_parent = UnitId([2u8; 32]);
        let child_a = UnitId([10u8; 32]);
        let child_b = UnitId([11u8; 32]);

        let batch = CommitBatch {
            children: vec![
                (parent, child_b),
                (parent, child_a),
                (other_parent, child_a),
            ],
            ..Default::default()
        };
        store.apply_commit(&batch).unwrap();

        let children = store.children_of(&parent).unwrap();
        assert_eq!(children, vec![child_a, child_b]);
        assert_eq!(store.children_of(&other_parent).unwrap(), vec![child_a]);
        assert!(store.children_of(&UnitId([3u8; 32])).unwrap().is_empty());
    }

    #[test]
    fn free_units_add_and_remove() {
        let store = temp_store();
        let a = UnitId([1u8; 32]);
        let b = UnitId([2u8; 32]);

        let batch = CommitBatch {
            free_added: vec![a, b],
            ..Default::default()
        };
        store.apply_commit(&batch).unwrap();
        assert_eq!(store.free_units().unwrap(), vec![a, b]);

        let batch = CommitBatch {
            free_removed: vec![a],
            ..Default::default()
        };
        store.apply_commit(&batch).unwrap();
        assert_eq!(store.free_units().unwrap(), vec![b]);
    }

    #[test]
    fn round_pow_units_ordered_by_mci_then_unit() {
        let store = temp_store();
        let entries = vec![
            (
                2u64,
                RoundPowEntry {
                    mci: 7,
                    unit: UnitId([9u8; 32]),
                    authors: vec![Address([1u8; 32])],
                },
            ),
            (
                2u64,
                RoundPowEntry {
                    mci: 3,
                    unit: UnitId([5u8; 32]),
                    authors: vec![Address([2u8; 32])],
                },
            ),
            (
                2u64,
                RoundPowEntry {
                    mci: 3,
                    unit: UnitId([4u8; 32]),
                    authors: vec![Address([3u8; 32])],
                },
            ),
            (
                3u64,
                RoundPowEntry {
                    mci: 1,
                    unit: UnitId([1u8; 32]),
                    authors: vec![Address([4u8; 32])],
                },
            ),
        ];
        let batch = CommitBatch {
            round_pow_entries: entries,
            ..Default::default()
        };
        store.apply_commit(&batch).unwrap();

        let round2 = store.round_pow_units(2).unwrap();
        assert_eq!(round2.len(), 3);
        assert_eq!(round2[0].mci, 3);
        assert_eq!(round2[0].unit, UnitId([4u8; 32]));
        assert_eq!(round2[1].mci, 3);
        assert_eq!(round2[1].unit, UnitId([5u8; 32]));
        assert_eq!(round2[2].mci, 7);

        assert_eq!(store.round_pow_units(3).unwrap().len(), 1);
        assert!(store.round_pow_units(4).unwrap().is_empty());
    }

    #[test]
    fn round_records_and_latest() {
        let store = temp_store();
        assert!(store.latest_round().unwrap().is_none());

        store
            .put_round(&RoundRecord {
                round_index: 1,
                anchor_mci: 0,
            })
            .unwrap();
        store
            .put_round(&RoundRecord {
                round_index: 2,
                anchor_mci: 14,
            })
            .unwrap();

        assert_eq!(
            store.get_round(1).unwrap().unwrap(),
            RoundRecord {
                round_index: 1,
                anchor_mci: 0
            }
        );
        assert_eq!(store.latest_round().unwrap().unwrap().round_index, 2);
        assert!(store.get_round(3).unwrap().is_none());
    }

    #[test]
    fn chain_meta_roundtrip() {
        let store = temp_store();
        assert!(store.chain_meta().unwrap().is_none());

        let unit = test_unit(1, vec![]);
        let meta = ChainMeta {
            genesis_unit: Some(unit.id()),
            last_stable_mci: 5,
        };
        let batch = CommitBatch {
            chain_meta: Some(meta),
            ..Default::default()
        };
        store.apply_commit(&batch).unwrap();

        let loaded = store.chain_meta().unwrap().unwrap();
        assert_eq!(loaded.last_stable_mci, 5);
        assert_eq!(loaded.genesis_unit, Some(unit.id()));
    }

    #[test]
    fn definition_lookup() {
        let store = temp_store();
        let identity = LocalIdentity::from_seed([7u8; 32]);
        let def = Definition {
            public_key: identity.public_key_bytes(),
        };

        assert!(store.get_definition(&identity.address()).unwrap().is_none());
        store.put_definition(&identity.address(), &def).unwrap();
        let loaded = store.get_definition(&identity.address()).unwrap().unwrap();
        assert_eq!(loaded.public_key, def.public_key);
        assert_eq!(loaded.address(), identity.address());
    }

    #[test]
    fn identity_registration_is_idempotent() {
        let store = temp_store();
        let first = LocalIdentity::from_seed([1u8; 32]).address();
        let second = LocalIdentity::from_seed([2u8; 32]).address();

        assert!(store.identity_addresses().unwrap().is_empty());
        store.register_identity(&first).unwrap();
        store.register_identity(&first).unwrap();
        assert_eq!(store.identity_addresses().unwrap(), vec![first]);

        store.register_identity(&second).unwrap();
        assert_eq!(store.identity_addresses().unwrap().len(), 2);
    }

    #[test]
    fn output_and_spend_proof_lookup() {
        let store = temp_store();
        let unit = UnitId([1u8; 32]);
        let output = Output {
            address: Address([2u8; 32]),
            amount: 42,
        };
        let proof = [3u8; 32];

        let batch = CommitBatch {
            outputs: vec![(unit, 0, 1, output.clone())],
            spend_proofs: vec![(
                proof,
                SpendProofRecord {
                    unit,
                    address: Address([2u8; 32]),
                },
            )],
            ..Default::default()
        };
        store.apply_commit(&batch).unwrap();

        let loaded = store.get_output(&unit, 0, 1).unwrap().unwrap();
        assert_eq!(loaded, output);
        assert!(store.get_output(&unit, 0, 0).unwrap().is_none());
        assert!(store.has_spend_proof(&proof).unwrap());
        assert!(!store.has_spend_proof(&[4u8; 32]).unwrap());

        assert!(!store.is_output_spent(&unit, 0, 1).unwrap());
        let batch = CommitBatch {
            spent_outputs: vec![(unit, 0, 1)],
            ..Default::default()
        };
        store.apply_commit(&batch).unwrap();
        assert!(store.is_output_spent(&unit, 0, 1).unwrap());
        assert!(!store.is_output_spent(&unit, 0, 0).unwrap());
    }

    #[test]
    fn mc_index_lookup() {
        let store = temp_store();
        let id = UnitId([8u8; 32]);
        let batch = CommitBatch {
            mc_entries: vec![(0, id), (1, UnitId([9u8; 32]))],
            ..Default::default()
        };
        store.apply_commit(&batch).unwrap();

        assert_eq!(store.unit_at_mci(0).unwrap(), Some(id));
        assert_eq!(store.unit_at_mci(1).unwrap(), Some(UnitId([9u8; 32])));
        assert!(store.unit_at_mci(2).unwrap().is_none());
    }

    #[test]
    fn props_update_overwrites() {
        let store = temp_store();
        let unit = test_unit(1, vec![]);
        let id = unit.id();
        let mut props = props_for(&unit);

        let batch = CommitBatch {
            units: vec![unit],
            props: vec![props.clone()],
            ..Default::default()
        };
        store.apply_commit(&batch).unwrap();

        props.is_free = false;
        props.is_stable = true;
        props.main_chain_index = Some(4);
        let batch = CommitBatch {
            props: vec![props],
            ..Default::default()
        };
        store.apply_commit(&batch).unwrap();

        let loaded = store.get_props(&id).unwrap().unwrap();
        assert!(!loaded.is_free);
        assert!(loaded.is_stable);
        assert_eq!(loaded.main_chain_index, Some(4));
    }

    #[test]
    fn flush_succeeds() {
        let store = temp_store();
        store.flush().unwrap();
    }
}
