//! In-memory [`NodeStore`] used by tests and as the reference semantics.

use std::collections::{BTreeMap, HashMap};

use veil_core::commitment::{CompressedPoint, ScalarBytes};
use veil_core::types::{
    BlockHeader, ChainWork, Hash256, Height, PeerId, StateId, TxoId, GENESIS_HEIGHT, MAX_HEIGHT,
};

use super::{
    state_flags, AssetInfo, EventRecord, NodeStore, ParamId, RowId, StateInput, StoreError,
    TipInfo, TxoRecord,
};

#[derive(Clone, Debug)]
struct StateRec {
    header: BlockHeader,
    prev_row: Option<RowId>,
    flags: u32,
    peer: Option<PeerId>,
    perishable: Option<Vec<u8>>,
    eternal: Option<Vec<u8>>,
    rollback: Option<Vec<u8>>,
    txos: Option<TxoId>,
    offset: Option<ScalarBytes>,
    inputs: Vec<StateInput>,
}

/// Complete in-memory chain store. No persistence, no crash safety.
#[derive(Default)]
pub struct MemStore {
    states: Vec<Option<StateRec>>,
    cursor: Option<RowId>,
    txos: BTreeMap<TxoId, (Vec<u8>, Height)>,
    kernels: HashMap<Hash256, Vec<Height>>,
    events: Vec<EventRecord>,
    unique: HashMap<Vec<u8>, Vec<u8>>,
    assets: BTreeMap<u32, AssetInfo>,
    shielded: Vec<CompressedPoint>,
    params: HashMap<u8, Vec<u8>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn rec(&self, row: RowId) -> Result<&StateRec, StoreError> {
        self.states
            .get(row as usize - 1)
            .and_then(|r| r.as_ref())
            .ok_or(StoreError::RowNotFound(row))
    }

    fn rec_mut(&mut self, row: RowId) -> Result<&mut StateRec, StoreError> {
        self.states
            .get_mut(row as usize - 1)
            .and_then(|r| r.as_mut())
            .ok_or(StoreError::RowNotFound(row))
    }

    fn rows(&self) -> impl Iterator<Item = (RowId, &StateRec)> {
        self.states
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().map(|rec| (i as RowId + 1, rec)))
    }

    fn children(&self, row: RowId) -> Vec<RowId> {
        self.rows()
            .filter(|(_, rec)| rec.prev_row == Some(row))
            .map(|(r, _)| r)
            .collect()
    }

    /// Reachable = functional, and at genesis height or under a reachable
    /// parent. Cascades down to waiting descendants.
    fn try_make_reachable(&mut self, row: RowId) {
        let mut queue = vec![row];
        while let Some(row) = queue.pop() {
            let Ok(rec) = self.rec(row) else { continue };
            if rec.flags & state_flags::FUNCTIONAL == 0 || rec.flags & state_flags::REACHABLE != 0 {
                continue;
            }
            let base = rec.header.height == GENESIS_HEIGHT
                || rec
                    .prev_row
                    .and_then(|p| self.rec(p).ok())
                    .is_some_and(|p| p.flags & state_flags::REACHABLE != 0);
            if !base {
                continue;
            }
            self.rec_mut(row).expect("checked").flags |= state_flags::REACHABLE;
            queue.extend(self.children(row));
        }
    }

    fn clear_reachable(&mut self, row: RowId) {
        let mut queue = vec![row];
        while let Some(row) = queue.pop() {
            let Ok(rec) = self.rec(row) else { continue };
            if rec.flags & state_flags::REACHABLE == 0 {
                continue;
            }
            self.rec_mut(row).expect("checked").flags &= !state_flags::REACHABLE;
            queue.extend(self.children(row));
        }
    }
}

impl NodeStore for MemStore {
    fn begin(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    // --- state table ---

    fn insert_state(&mut self, header: &BlockHeader, peer: PeerId) -> Result<RowId, StoreError> {
        let id = header.id();
        if let Some(row) = self.state_find(&id)? {
            return Ok(row);
        }

        let prev_row = if header.height > GENESIS_HEIGHT {
            self.rows()
                .find(|(_, rec)| {
                    rec.header.height + 1 == header.height && rec.header.hash() == header.prev
                })
                .map(|(row, _)| row)
        } else {
            None
        };

        self.states.push(Some(StateRec {
            header: header.clone(),
            prev_row,
            flags: 0,
            peer: Some(peer),
            perishable: None,
            eternal: None,
            rollback: None,
            txos: None,
            offset: None,
            inputs: Vec::new(),
        }));
        let row = self.states.len() as RowId;

        // Adopt orphan children that were waiting for this header.
        let orphans: Vec<RowId> = self
            .rows()
            .filter(|(r, rec)| {
                *r != row
                    && rec.prev_row.is_none()
                    && rec.header.height == header.height + 1
                    && rec.header.prev == id.hash
            })
            .map(|(r, _)| r)
            .collect();
        for orphan in orphans {
            self.rec_mut(orphan)?.prev_row = Some(row);
        }
        Ok(row)
    }

    fn state_find(&self, id: &StateId) -> Result<Option<RowId>, StoreError> {
        Ok(self
            .rows()
            .find(|(_, rec)| rec.header.height == id.height && rec.header.hash() == id.hash)
            .map(|(row, _)| row))
    }

    fn get_state(&self, row: RowId) -> Result<BlockHeader, StoreError> {
        Ok(self.rec(row)?.header.clone())
    }

    fn get_prev_row(&self, row: RowId) -> Result<Option<RowId>, StoreError> {
        Ok(self.rec(row)?.prev_row)
    }

    fn get_chain_work(&self, row: RowId) -> Result<ChainWork, StoreError> {
        Ok(self.rec(row)?.header.chain_work)
    }

    fn get_state_flags(&self, row: RowId) -> Result<u32, StoreError> {
        Ok(self.rec(row)?.flags)
    }

    fn set_state_functional(&mut self, row: RowId) -> Result<(), StoreError> {
        self.rec_mut(row)?.flags |= state_flags::FUNCTIONAL;
        self.try_make_reachable(row);
        Ok(())
    }

    fn set_state_not_functional(&mut self, row: RowId) -> Result<(), StoreError> {
        self.rec_mut(row)?.flags &= !state_flags::FUNCTIONAL;
        self.clear_reachable(row);
        Ok(())
    }

    fn move_fwd(&mut self, row: RowId) -> Result<(), StoreError> {
        let rec = self.rec(row)?;
        if rec.prev_row != self.cursor && !(self.cursor.is_none() && rec.header.height == GENESIS_HEIGHT) {
            return Err(StoreError::Corruption("move_fwd off cursor"));
        }
        self.rec_mut(row)?.flags |= state_flags::ACTIVE;
        self.cursor = Some(row);
        Ok(())
    }

    fn move_back(&mut self, row: RowId) -> Result<(), StoreError> {
        if self.cursor != Some(row) {
            return Err(StoreError::Corruption("move_back off cursor"));
        }
        self.rec_mut(row)?.flags &= !state_flags::ACTIVE;
        self.cursor = self.rec(row)?.prev_row;
        Ok(())
    }

    fn get_cursor_row(&self) -> Result<Option<RowId>, StoreError> {
        Ok(self.cursor)
    }

    fn enum_tips(&self) -> Result<Vec<TipInfo>, StoreError> {
        let mut tips: Vec<TipInfo> = self
            .rows()
            .filter(|(row, _)| self.children(*row).is_empty())
            .map(|(row, rec)| TipInfo {
                row,
                height: rec.header.height,
                chain_work: rec.header.chain_work,
            })
            .collect();
        tips.sort_by_key(|t| t.height);
        Ok(tips)
    }

    fn enum_functional_tips(&self) -> Result<Vec<TipInfo>, StoreError> {
        let mut tips: Vec<TipInfo> = self
            .rows()
            .filter(|(row, rec)| {
                rec.flags & state_flags::REACHABLE != 0
                    && !self
                        .children(*row)
                        .iter()
                        .any(|c| self.rec(*c).is_ok_and(|r| r.flags & state_flags::REACHABLE != 0))
            })
            .map(|(row, rec)| TipInfo {
                row,
                height: rec.header.height,
                chain_work: rec.header.chain_work,
            })
            .collect();
        tips.sort_by(|a, b| b.chain_work.cmp(&a.chain_work));
        Ok(tips)
    }

    fn enum_states_at(&self, height: Height) -> Result<Vec<RowId>, StoreError> {
        Ok(self
            .rows()
            .filter(|(_, rec)| rec.header.height == height)
            .map(|(row, _)| row)
            .collect())
    }

    fn find_active_state(&self, height: Height) -> Result<Option<RowId>, StoreError> {
        Ok(self
            .rows()
            .find(|(_, rec)| {
                rec.flags & state_flags::ACTIVE != 0 && rec.header.height == height
            })
            .map(|(row, _)| row))
    }

    fn find_state_by_txo_id(&self, id: TxoId) -> Result<Option<(RowId, Height)>, StoreError> {
        let mut active: Vec<(RowId, Height, TxoId)> = self
            .rows()
            .filter(|(_, rec)| rec.flags & state_flags::ACTIVE != 0)
            .filter_map(|(row, rec)| rec.txos.map(|t| (row, rec.header.height, t)))
            .collect();
        active.sort_by_key(|(_, h, _)| *h);
        Ok(active
            .into_iter()
            .find(|(_, _, txos)| *txos > id)
            .map(|(row, h, _)| (row, h)))
    }

    fn delete_state(&mut self, row: RowId) -> Result<Option<RowId>, StoreError> {
        if !self.children(row).is_empty() {
            return Err(StoreError::Corruption("delete of non-tip state"));
        }
        let prev = self.rec(row)?.prev_row;
        if self.cursor == Some(row) {
            return Err(StoreError::Corruption("delete of cursor state"));
        }
        self.states[row as usize - 1] = None;
        Ok(prev)
    }

    // --- block blobs and extras ---

    fn set_state_block(
        &mut self,
        row: RowId,
        perishable: &[u8],
        eternal: &[u8],
        peer: PeerId,
    ) -> Result<(), StoreError> {
        let rec = self.rec_mut(row)?;
        rec.perishable = Some(perishable.to_vec());
        rec.eternal = Some(eternal.to_vec());
        rec.peer = Some(peer);
        Ok(())
    }

    fn get_state_block(
        &self,
        row: RowId,
    ) -> Result<(Option<Vec<u8>>, Option<Vec<u8>>, Option<Vec<u8>>), StoreError> {
        let rec = self.rec(row)?;
        Ok((rec.perishable.clone(), rec.eternal.clone(), rec.rollback.clone()))
    }

    fn del_state_block_pp(&mut self, row: RowId) -> Result<(), StoreError> {
        let rec = self.rec_mut(row)?;
        rec.perishable = None;
        rec.peer = None;
        Ok(())
    }

    fn del_state_block_ppr(&mut self, row: RowId) -> Result<(), StoreError> {
        let rec = self.rec_mut(row)?;
        rec.perishable = None;
        rec.rollback = None;
        rec.peer = None;
        Ok(())
    }

    fn del_state_block_all(&mut self, row: RowId) -> Result<(), StoreError> {
        let rec = self.rec_mut(row)?;
        rec.perishable = None;
        rec.eternal = None;
        rec.rollback = None;
        rec.peer = None;
        Ok(())
    }

    fn get_peer(&self, row: RowId) -> Result<Option<PeerId>, StoreError> {
        Ok(self.rec(row)?.peer)
    }

    fn set_state_txos_extra(
        &mut self,
        row: RowId,
        txos: Option<TxoId>,
        offset: Option<ScalarBytes>,
        rollback: Option<&[u8]>,
    ) -> Result<(), StoreError> {
        let rec = self.rec_mut(row)?;
        rec.txos = txos;
        rec.offset = offset;
        rec.rollback = rollback.map(|b| b.to_vec());
        Ok(())
    }

    fn get_state_txos(&self, row: RowId) -> Result<Option<TxoId>, StoreError> {
        Ok(self.rec(row)?.txos)
    }

    fn get_state_extra(&self, row: RowId) -> Result<Option<ScalarBytes>, StoreError> {
        Ok(self.rec(row)?.offset)
    }

    fn set_state_inputs(&mut self, row: RowId, inputs: &[StateInput]) -> Result<(), StoreError> {
        self.rec_mut(row)?.inputs = inputs.to_vec();
        Ok(())
    }

    fn get_state_inputs(&self, row: RowId) -> Result<Vec<StateInput>, StoreError> {
        Ok(self.rec(row)?.inputs.clone())
    }

    // --- txos ---

    fn txo_add(&mut self, id: TxoId, value: &[u8]) -> Result<(), StoreError> {
        self.txos.insert(id, (value.to_vec(), MAX_HEIGHT));
        Ok(())
    }

    fn txo_del(&mut self, id: TxoId) -> Result<(), StoreError> {
        self.txos.remove(&id);
        Ok(())
    }

    fn txo_del_from(&mut self, from: TxoId) -> Result<(), StoreError> {
        self.txos.retain(|id, _| *id < from);
        Ok(())
    }

    fn txo_set_spent(&mut self, id: TxoId, height: Height) -> Result<(), StoreError> {
        match self.txos.get_mut(&id) {
            Some((_, spent)) => {
                *spent = height;
                Ok(())
            }
            None => Err(StoreError::Corruption("txo_set_spent on missing txo")),
        }
    }

    fn txo_get(&self, id: TxoId) -> Result<Option<TxoRecord>, StoreError> {
        Ok(self.txos.get(&id).map(|(value, spent)| TxoRecord {
            id,
            value: value.clone(),
            spend_height: *spent,
        }))
    }

    fn txo_set_value(&mut self, id: TxoId, value: &[u8]) -> Result<(), StoreError> {
        match self.txos.get_mut(&id) {
            Some((v, _)) => {
                *v = value.to_vec();
                Ok(())
            }
            None => Err(StoreError::Corruption("txo_set_value on missing txo")),
        }
    }

    fn enum_txos(&self, from: TxoId) -> Result<Vec<TxoRecord>, StoreError> {
        Ok(self
            .txos
            .range(from..)
            .map(|(id, (value, spent))| TxoRecord {
                id: *id,
                value: value.clone(),
                spend_height: *spent,
            })
            .collect())
    }

    // --- kernel index ---

    fn insert_kernel(&mut self, id: &Hash256, height: Height) -> Result<(), StoreError> {
        self.kernels.entry(*id).or_default().push(height);
        Ok(())
    }

    fn delete_kernel(&mut self, id: &Hash256, height: Height) -> Result<(), StoreError> {
        let entry = self
            .kernels
            .get_mut(id)
            .ok_or(StoreError::Corruption("delete of missing kernel"))?;
        let pos = entry
            .iter()
            .position(|h| *h == height)
            .ok_or(StoreError::Corruption("delete of missing kernel height"))?;
        entry.remove(pos);
        if entry.is_empty() {
            self.kernels.remove(id);
        }
        Ok(())
    }

    fn find_kernel(&self, id: &Hash256) -> Result<Option<Height>, StoreError> {
        Ok(self.kernels.get(id).and_then(|v| v.iter().max().copied()))
    }

    // --- events log ---

    fn insert_event(&mut self, height: Height, key: &[u8], body: &[u8]) -> Result<(), StoreError> {
        self.events.push(EventRecord { height, key: key.to_vec(), body: body.to_vec() });
        Ok(())
    }

    fn delete_events_from(&mut self, height: Height) -> Result<(), StoreError> {
        self.events.retain(|e| e.height < height);
        Ok(())
    }

    fn find_events(&self, key: &[u8]) -> Result<Vec<EventRecord>, StoreError> {
        Ok(self.events.iter().filter(|e| e.key == key).cloned().collect())
    }

    // --- unique keys ---

    fn unique_insert(&mut self, key: &[u8], value: &[u8]) -> Result<bool, StoreError> {
        if self.unique.contains_key(key) {
            return Ok(false);
        }
        self.unique.insert(key.to_vec(), value.to_vec());
        Ok(true)
    }

    fn unique_delete_strict(&mut self, key: &[u8]) -> Result<(), StoreError> {
        self.unique
            .remove(key)
            .map(|_| ())
            .ok_or(StoreError::Corruption("unique key missing on delete"))
    }

    fn unique_find(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.unique.get(key).cloned())
    }

    // --- assets ---

    fn asset_add(&mut self, info: &AssetInfo) -> Result<(), StoreError> {
        if self.assets.contains_key(&info.id) {
            return Err(StoreError::Corruption("asset id occupied"));
        }
        self.assets.insert(info.id, info.clone());
        Ok(())
    }

    fn asset_get(&self, id: u32) -> Result<Option<AssetInfo>, StoreError> {
        Ok(self.assets.get(&id).cloned())
    }

    fn asset_delete(&mut self, id: u32) -> Result<(), StoreError> {
        if self.assets.remove(&id).is_none() {
            return Err(StoreError::Corruption("delete of missing asset"));
        }
        Ok(())
    }

    fn asset_find_by_owner(&self, owner: &CompressedPoint) -> Result<Option<u32>, StoreError> {
        Ok(self
            .assets
            .values()
            .find(|a| a.owner == *owner)
            .map(|a| a.id))
    }

    fn asset_set_value(&mut self, id: u32, value: u128, lock_height: Height) -> Result<(), StoreError> {
        match self.assets.get_mut(&id) {
            Some(a) => {
                a.value = value;
                a.lock_height = lock_height;
                Ok(())
            }
            None => Err(StoreError::Corruption("set_value on missing asset")),
        }
    }

    // --- shielded list ---

    fn shielded_count(&self) -> Result<u64, StoreError> {
        Ok(self.shielded.len() as u64)
    }

    fn shielded_resize(&mut self, new_count: u64) -> Result<(), StoreError> {
        self.shielded.resize(new_count as usize, CompressedPoint::ZERO);
        Ok(())
    }

    fn shielded_write(&mut self, pos: u64, points: &[CompressedPoint]) -> Result<(), StoreError> {
        let end = pos as usize + points.len();
        if end > self.shielded.len() {
            return Err(StoreError::Corruption("shielded write out of bounds"));
        }
        self.shielded[pos as usize..end].copy_from_slice(points);
        Ok(())
    }

    fn shielded_read(&self, pos: u64, count: u64) -> Result<Vec<CompressedPoint>, StoreError> {
        let end = pos as usize + count as usize;
        if end > self.shielded.len() {
            return Err(StoreError::Corruption("shielded read out of bounds"));
        }
        Ok(self.shielded[pos as usize..end].to_vec())
    }

    // --- params ---

    fn param_set(&mut self, id: ParamId, value: Option<&[u8]>) -> Result<(), StoreError> {
        match value {
            Some(v) => self.params.insert(id as u8, v.to_vec()),
            None => self.params.remove(&(id as u8)),
        };
        Ok(())
    }

    fn param_get(&self, id: ParamId) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.params.get(&(id as u8)).cloned())
    }
}
