//! The node's persistent store interface.
//!
//! [`NodeStore`] is the ordered-store surface the block processor drives:
//! a header/state table with functional/reachable/active flags, block blobs
//! split into perishable and eternal parts, chain-ordered txos, a kernel
//! inclusion index, an events log, a strict unique-key set, the asset
//! registry, the shielded commitment list, the three MMR streams, and a
//! byte-keyed parameter table.
//!
//! [`MemStore`] is the complete in-memory implementation used by unit and
//! scenario tests; the production node uses RocksDB (veil-store).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use veil_core::commitment::{CompressedPoint, ScalarBytes};
use veil_core::types::{BlockHeader, ChainWork, Hash256, Height, PeerId, StateId, TxoId, MAX_HEIGHT};

/// Row id of a state record. 0 is the null row.
pub type RowId = u64;

/// State flags.
pub mod state_flags {
    /// Block data is present (or the state was applied historically).
    pub const FUNCTIONAL: u32 = 1;
    /// Functional and connected down to the active chain or genesis.
    pub const REACHABLE: u32 = 2;
    /// On the current active chain.
    pub const ACTIVE: u32 = 4;
}

/// A spent input recorded against the state that spent it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct StateInput {
    pub txo_id: TxoId,
    pub commitment: CompressedPoint,
}

/// A registered confidential asset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct AssetInfo {
    /// 1-based registry id.
    pub id: u32,
    pub owner: CompressedPoint,
    pub value: u128,
    pub metadata: Vec<u8>,
    /// Height of creation or of the last zero-crossing of `value`.
    pub lock_height: Height,
}

impl AssetInfo {
    /// The hash committed into the assets MMR at slot `id - 1`.
    pub fn registry_hash(&self) -> Hash256 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"veil.asset.info");
        hasher.update(&self.id.to_le_bytes());
        hasher.update(&self.owner.0);
        hasher.update(&self.value.to_le_bytes());
        hasher.update(&(self.metadata.len() as u64).to_le_bytes());
        hasher.update(&self.metadata);
        hasher.update(&self.lock_height.to_le_bytes());
        Hash256(hasher.finalize().into())
    }
}

/// A chain-ordered txo record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxoRecord {
    pub id: TxoId,
    /// Serialized [`veil_core::block::Output`], possibly naked.
    pub value: Vec<u8>,
    /// [`MAX_HEIGHT`] while unspent.
    pub spend_height: Height,
}

/// One entry of the events log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventRecord {
    pub height: Height,
    pub key: Vec<u8>,
    pub body: Vec<u8>,
}

/// A tip row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TipInfo {
    pub row: RowId,
    pub height: Height,
    pub chain_work: ChainWork,
}

/// Byte keys of the scalar parameter table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ParamId {
    FossilHeight = 1,
    TxoLo = 2,
    TxoHi = 3,
    ShieldedOutputs = 4,
    ShieldedInputs = 5,
    AssetsCount = 6,
    AssetsCountUsed = 7,
    CfgChecksum = 8,
    SyncData = 9,
    Treasury = 10,
    UtxoStamp = 11,
    MmrStates = 12,
    MmrShielded = 13,
    MmrAssets = 14,
}

#[derive(Error, Debug)]
pub enum StoreError {
    /// An on-disk invariant does not hold; never recovered.
    #[error("store corruption: {0}")] Corruption(&'static str),
    #[error("backend: {0}")] Backend(String),
    #[error("row not found: {0}")] RowNotFound(RowId),
}

/// The ordered-store surface consumed by the processor.
///
/// The processor is the sole mutator; implementations are not required to
/// tolerate concurrent writes.
pub trait NodeStore {
    // --- transaction hooks ---

    fn begin(&mut self) -> Result<(), StoreError>;
    fn commit(&mut self) -> Result<(), StoreError>;
    fn check_integrity(&self) -> Result<(), StoreError> {
        Ok(())
    }
    fn vacuum(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    // --- state table ---

    /// Insert a header; links to its parent if present, and adopts any
    /// orphan children waiting for it. Duplicate headers are not inserted
    /// (use [`NodeStore::state_find`] first).
    fn insert_state(&mut self, header: &BlockHeader, peer: PeerId) -> Result<RowId, StoreError>;
    fn state_find(&self, id: &StateId) -> Result<Option<RowId>, StoreError>;
    fn get_state(&self, row: RowId) -> Result<BlockHeader, StoreError>;
    fn get_prev_row(&self, row: RowId) -> Result<Option<RowId>, StoreError>;
    fn get_chain_work(&self, row: RowId) -> Result<ChainWork, StoreError>;
    fn get_state_flags(&self, row: RowId) -> Result<u32, StoreError>;
    fn set_state_functional(&mut self, row: RowId) -> Result<(), StoreError>;
    fn set_state_not_functional(&mut self, row: RowId) -> Result<(), StoreError>;
    /// Advance the active chain onto `row` (must be a child of the cursor).
    fn move_fwd(&mut self, row: RowId) -> Result<(), StoreError>;
    /// Retreat the active chain off `row` (must be the cursor).
    fn move_back(&mut self, row: RowId) -> Result<(), StoreError>;
    fn get_cursor_row(&self) -> Result<Option<RowId>, StoreError>;
    /// All childless states, ascending height.
    fn enum_tips(&self) -> Result<Vec<TipInfo>, StoreError>;
    /// Reachable states without reachable children, descending chain work.
    fn enum_functional_tips(&self) -> Result<Vec<TipInfo>, StoreError>;
    fn enum_states_at(&self, height: Height) -> Result<Vec<RowId>, StoreError>;
    fn find_active_state(&self, height: Height) -> Result<Option<RowId>, StoreError>;
    /// The active state whose txo range contains `id`.
    fn find_state_by_txo_id(&self, id: TxoId) -> Result<Option<(RowId, Height)>, StoreError>;
    /// Delete a childless state entirely. Returns the parent row.
    fn delete_state(&mut self, row: RowId) -> Result<Option<RowId>, StoreError>;

    // --- block blobs and per-state extras ---

    fn set_state_block(
        &mut self,
        row: RowId,
        perishable: &[u8],
        eternal: &[u8],
        peer: PeerId,
    ) -> Result<(), StoreError>;
    /// `(perishable, eternal, rollback)`.
    #[allow(clippy::type_complexity)]
    fn get_state_block(
        &self,
        row: RowId,
    ) -> Result<(Option<Vec<u8>>, Option<Vec<u8>>, Option<Vec<u8>>), StoreError>;
    /// Drop the perishable part and the peer attribution (fast-sync space
    /// saving; the rollback journal stays usable).
    fn del_state_block_pp(&mut self, row: RowId) -> Result<(), StoreError>;
    /// Drop the perishable part, peer attribution and rollback journal
    /// (fossilized active blocks).
    fn del_state_block_ppr(&mut self, row: RowId) -> Result<(), StoreError>;
    /// Drop everything, including the peer attribution.
    fn del_state_block_all(&mut self, row: RowId) -> Result<(), StoreError>;
    fn get_peer(&self, row: RowId) -> Result<Option<PeerId>, StoreError>;

    /// Set (or clear, with `None`) the txo count after this block, the
    /// accumulated offset, and the rollback journal.
    fn set_state_txos_extra(
        &mut self,
        row: RowId,
        txos: Option<TxoId>,
        offset: Option<ScalarBytes>,
        rollback: Option<&[u8]>,
    ) -> Result<(), StoreError>;
    fn get_state_txos(&self, row: RowId) -> Result<Option<TxoId>, StoreError>;
    fn get_state_extra(&self, row: RowId) -> Result<Option<ScalarBytes>, StoreError>;
    fn set_state_inputs(&mut self, row: RowId, inputs: &[StateInput]) -> Result<(), StoreError>;
    fn get_state_inputs(&self, row: RowId) -> Result<Vec<StateInput>, StoreError>;

    // --- txos ---

    fn txo_add(&mut self, id: TxoId, value: &[u8]) -> Result<(), StoreError>;
    fn txo_del(&mut self, id: TxoId) -> Result<(), StoreError>;
    /// Delete every txo with id ≥ `from`.
    fn txo_del_from(&mut self, from: TxoId) -> Result<(), StoreError>;
    fn txo_set_spent(&mut self, id: TxoId, height: Height) -> Result<(), StoreError>;
    fn txo_get(&self, id: TxoId) -> Result<Option<TxoRecord>, StoreError>;
    fn txo_set_value(&mut self, id: TxoId, value: &[u8]) -> Result<(), StoreError>;
    /// All txos with id ≥ `from`, ascending.
    fn enum_txos(&self, from: TxoId) -> Result<Vec<TxoRecord>, StoreError>;

    // --- kernel index ---

    fn insert_kernel(&mut self, id: &Hash256, height: Height) -> Result<(), StoreError>;
    fn delete_kernel(&mut self, id: &Hash256, height: Height) -> Result<(), StoreError>;
    /// Greatest inclusion height, if any.
    fn find_kernel(&self, id: &Hash256) -> Result<Option<Height>, StoreError>;

    // --- events log ---

    fn insert_event(&mut self, height: Height, key: &[u8], body: &[u8]) -> Result<(), StoreError>;
    fn delete_events_from(&mut self, height: Height) -> Result<(), StoreError>;
    fn find_events(&self, key: &[u8]) -> Result<Vec<EventRecord>, StoreError>;

    // --- unique-key set ---

    /// Idempotent-strict insert: `false` (and no write) if present.
    fn unique_insert(&mut self, key: &[u8], value: &[u8]) -> Result<bool, StoreError>;
    /// Delete; corruption if absent.
    fn unique_delete_strict(&mut self, key: &[u8]) -> Result<(), StoreError>;
    fn unique_find(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    // --- asset registry ---

    /// Insert with an explicit id; corruption if occupied.
    fn asset_add(&mut self, info: &AssetInfo) -> Result<(), StoreError>;
    fn asset_get(&self, id: u32) -> Result<Option<AssetInfo>, StoreError>;
    /// Remove; corruption if absent. Ids are never reused, so the registry
    /// MMR keeps the slot and no successor id needs reporting.
    fn asset_delete(&mut self, id: u32) -> Result<(), StoreError>;
    fn asset_find_by_owner(&self, owner: &CompressedPoint) -> Result<Option<u32>, StoreError>;
    fn asset_set_value(&mut self, id: u32, value: u128, lock_height: Height) -> Result<(), StoreError>;

    // --- shielded commitment list ---

    fn shielded_count(&self) -> Result<u64, StoreError>;
    fn shielded_resize(&mut self, new_count: u64) -> Result<(), StoreError>;
    fn shielded_write(&mut self, pos: u64, points: &[CompressedPoint]) -> Result<(), StoreError>;
    fn shielded_read(&self, pos: u64, count: u64) -> Result<Vec<CompressedPoint>, StoreError>;

    // --- parameters ---

    fn param_set(&mut self, id: ParamId, value: Option<&[u8]>) -> Result<(), StoreError>;
    fn param_get(&self, id: ParamId) -> Result<Option<Vec<u8>>, StoreError>;

    fn param_set_u64(&mut self, id: ParamId, value: u64) -> Result<(), StoreError> {
        self.param_set(id, Some(&value.to_le_bytes()))
    }

    fn param_get_u64(&self, id: ParamId, default: u64) -> Result<u64, StoreError> {
        match self.param_get(id)? {
            Some(bytes) if bytes.len() == 8 => {
                Ok(u64::from_le_bytes(bytes.try_into().expect("checked length")))
            }
            Some(_) => Err(StoreError::Corruption("param width")),
            None => Ok(default),
        }
    }
}

/// Helper: `MAX_HEIGHT` means unspent.
pub fn is_unspent(rec: &TxoRecord) -> bool {
    rec.spend_height == MAX_HEIGHT
}

mod mem;
pub use mem::MemStore;
