//! RocksDB-backed persistent chain store.
//!
//! One column family per table, bincode values, big-endian keys where
//! ordered iteration matters. Mutations between [`NodeStore::begin`] and
//! [`NodeStore::commit`] are staged in a [`WriteBatch`] and mirrored into
//! an in-memory overlay so reads and scans observe the transaction's own
//! writes; `commit` applies the batch in one atomic write. A crash
//! mid-transaction therefore leaves nothing behind — the batch never
//! reached the DB.

use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use veil_chain::store::{
    state_flags, AssetInfo, EventRecord, NodeStore, ParamId, RowId, StateInput, StoreError,
    TipInfo, TxoRecord,
};
use veil_core::commitment::{CompressedPoint, ScalarBytes};
use veil_core::types::{
    BlockHeader, ChainWork, Hash256, Height, PeerId, StateId, TxoId, GENESIS_HEIGHT, MAX_HEIGHT,
};

const CF_STATES: &str = "states";
const CF_STATE_INDEX: &str = "state_index";
const CF_BLOCKS: &str = "blocks";
const CF_TXOS: &str = "txos";
const CF_KERNELS: &str = "kernels";
const CF_EVENTS: &str = "events";
const CF_UNIQUE: &str = "unique";
const CF_ASSETS: &str = "assets";
const CF_ASSET_OWNER: &str = "asset_owner";
const CF_SHIELDED: &str = "shielded";
const CF_META: &str = "meta";

const ALL_CFS: &[&str] = &[
    CF_STATES,
    CF_STATE_INDEX,
    CF_BLOCKS,
    CF_TXOS,
    CF_KERNELS,
    CF_EVENTS,
    CF_UNIQUE,
    CF_ASSETS,
    CF_ASSET_OWNER,
    CF_SHIELDED,
    CF_META,
];

const META_NEXT_ROW: &[u8] = b"next_row";
const META_CURSOR: &[u8] = b"cursor";
const META_EVENT_SEQ: &[u8] = b"event_seq";
const META_SHIELDED_COUNT: &[u8] = b"shielded_count";

const BLOB_PERISHABLE: u8 = 0;
const BLOB_ETERNAL: u8 = 1;
const BLOB_ROLLBACK: u8 = 2;

#[derive(bincode::Encode, bincode::Decode, Clone)]
struct StateRec {
    header: BlockHeader,
    prev_row: Option<RowId>,
    flags: u32,
    peer: Option<PeerId>,
    txos: Option<TxoId>,
    offset: Option<ScalarBytes>,
    inputs: Vec<StateInput>,
}

fn backend(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn enc<T: bincode::Encode>(value: &T) -> Vec<u8> {
    bincode::encode_to_vec(value, bincode::config::standard()).expect("in-memory encode")
}

fn dec<T: bincode::Decode<()>>(bytes: &[u8], what: &'static str) -> Result<T, StoreError> {
    bincode::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|_| StoreError::Corruption(what))
}

fn row_key(row: RowId) -> [u8; 8] {
    row.to_be_bytes()
}

fn index_key(height: Height, hash: &Hash256) -> Vec<u8> {
    let mut k = Vec::with_capacity(40);
    k.extend_from_slice(&height.to_be_bytes());
    k.extend_from_slice(hash.as_bytes());
    k
}

fn blob_key(row: RowId, tag: u8) -> [u8; 9] {
    let mut k = [0u8; 9];
    k[..8].copy_from_slice(&row.to_be_bytes());
    k[8] = tag;
    k
}

fn cf_handle<'a>(db: &'a DB, name: &str) -> Result<&'a rocksdb::ColumnFamily, StoreError> {
    db.cf_handle(name)
        .ok_or(StoreError::Corruption("missing column family"))
}

/// Staged value: `None` masks a DB row as deleted.
type Overlay = HashMap<&'static str, BTreeMap<Vec<u8>, Option<Vec<u8>>>>;

/// RocksDB-backed [`NodeStore`].
pub struct RocksStore {
    db: DB,
    pending: WriteBatch,
    overlay: Overlay,
}

impl RocksStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, path.as_ref(), descriptors).map_err(backend)?;
        Ok(Self { db, pending: WriteBatch::default(), overlay: Overlay::default() })
    }

    fn get_raw(&self, cf: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(staged) = self.overlay.get(cf).and_then(|m| m.get(key)) {
            return Ok(staged.clone());
        }
        self.db.get_cf(cf_handle(&self.db, cf)?, key).map_err(backend)
    }

    fn put_raw(&mut self, cf: &'static str, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let handle = cf_handle(&self.db, cf)?;
        self.pending.put_cf(handle, key, value);
        self.overlay
            .entry(cf)
            .or_default()
            .insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn del_raw(&mut self, cf: &'static str, key: &[u8]) -> Result<(), StoreError> {
        let handle = cf_handle(&self.db, cf)?;
        self.pending.delete_cf(handle, key);
        self.overlay.entry(cf).or_default().insert(key.to_vec(), None);
        Ok(())
    }

    /// Ordered scan from `from`, merging the DB with the staged overlay
    /// (staged deletions mask DB rows).
    fn scan_from(
        &self,
        cf: &'static str,
        from: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut merged: BTreeMap<Vec<u8>, Option<Vec<u8>>> = BTreeMap::new();
        let iter = self.db.iterator_cf(
            cf_handle(&self.db, cf)?,
            IteratorMode::From(from, Direction::Forward),
        );
        for item in iter {
            let (k, v) = item.map_err(backend)?;
            merged.insert(k.to_vec(), Some(v.to_vec()));
        }
        if let Some(staged) = self.overlay.get(cf) {
            for (k, v) in staged.range(from.to_vec()..) {
                merged.insert(k.clone(), v.clone());
            }
        }
        Ok(merged
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect())
    }

    fn meta_u64(&self, key: &[u8], default: u64) -> Result<u64, StoreError> {
        match self.get_raw(CF_META, key)? {
            Some(v) if v.len() == 8 => Ok(u64::from_le_bytes(v.try_into().expect("checked"))),
            Some(_) => Err(StoreError::Corruption("meta width")),
            None => Ok(default),
        }
    }

    fn set_meta_u64(&mut self, key: &[u8], value: u64) -> Result<(), StoreError> {
        self.put_raw(CF_META, key, &value.to_le_bytes())
    }

    fn rec(&self, row: RowId) -> Result<StateRec, StoreError> {
        let bytes = self
            .get_raw(CF_STATES, &row_key(row))?
            .ok_or(StoreError::RowNotFound(row))?;
        dec(&bytes, "state record")
    }

    fn put_rec(&mut self, row: RowId, rec: &StateRec) -> Result<(), StoreError> {
        self.put_raw(CF_STATES, &row_key(row), &enc(rec))
    }

    fn update_rec(
        &mut self,
        row: RowId,
        f: impl FnOnce(&mut StateRec),
    ) -> Result<(), StoreError> {
        let mut rec = self.rec(row)?;
        f(&mut rec);
        self.put_rec(row, &rec)
    }

    fn all_states(&self) -> Result<Vec<(RowId, StateRec)>, StoreError> {
        let mut out = Vec::new();
        for (k, v) in self.scan_from(CF_STATES, &[])? {
            let row = RowId::from_be_bytes(
                k.as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Corruption("state key width"))?,
            );
            out.push((row, dec(&v, "state record")?));
        }
        Ok(out)
    }

    fn children(&self, row: RowId) -> Result<Vec<RowId>, StoreError> {
        Ok(self
            .all_states()?
            .into_iter()
            .filter(|(_, rec)| rec.prev_row == Some(row))
            .map(|(r, _)| r)
            .collect())
    }

    fn try_make_reachable(&mut self, row: RowId) -> Result<(), StoreError> {
        let mut queue = vec![row];
        while let Some(row) = queue.pop() {
            let Ok(rec) = self.rec(row) else { continue };
            if rec.flags & state_flags::FUNCTIONAL == 0 || rec.flags & state_flags::REACHABLE != 0 {
                continue;
            }
            let base = rec.header.height == GENESIS_HEIGHT
                || match rec.prev_row {
                    Some(p) => self.rec(p)?.flags & state_flags::REACHABLE != 0,
                    None => false,
                };
            if !base {
                continue;
            }
            self.update_rec(row, |r| r.flags |= state_flags::REACHABLE)?;
            queue.extend(self.children(row)?);
        }
        Ok(())
    }

    fn clear_reachable(&mut self, row: RowId) -> Result<(), StoreError> {
        let mut queue = vec![row];
        while let Some(row) = queue.pop() {
            let Ok(rec) = self.rec(row) else { continue };
            if rec.flags & state_flags::REACHABLE == 0 {
                continue;
            }
            self.update_rec(row, |r| r.flags &= !state_flags::REACHABLE)?;
            queue.extend(self.children(row)?);
        }
        Ok(())
    }
}

impl NodeStore for RocksStore {
    fn begin(&mut self) -> Result<(), StoreError> {
        self.pending = WriteBatch::default();
        self.overlay.clear();
        Ok(())
    }

    /// Apply the staged batch in one atomic write.
    fn commit(&mut self) -> Result<(), StoreError> {
        let batch = std::mem::take(&mut self.pending);
        self.db.write(batch).map_err(backend)?;
        self.overlay.clear();
        self.db.flush().map_err(backend)
    }

    fn vacuum(&mut self) -> Result<(), StoreError> {
        for cf in ALL_CFS {
            self.db
                .compact_range_cf(cf_handle(&self.db, cf)?, None::<&[u8]>, None::<&[u8]>);
        }
        Ok(())
    }

    // --- state table ---

    fn insert_state(&mut self, header: &BlockHeader, peer: PeerId) -> Result<RowId, StoreError> {
        let id = header.id();
        if let Some(row) = self.state_find(&id)? {
            return Ok(row);
        }

        let prev_row = if header.height > GENESIS_HEIGHT {
            self.get_raw(CF_STATE_INDEX, &index_key(header.height - 1, &header.prev))?
                .map(|v| dec::<RowId>(&v, "index row"))
                .transpose()?
        } else {
            None
        };

        let row = self.meta_u64(META_NEXT_ROW, 1)?;
        self.set_meta_u64(META_NEXT_ROW, row + 1)?;

        self.put_rec(
            row,
            &StateRec {
                header: header.clone(),
                prev_row,
                flags: 0,
                peer: Some(peer),
                txos: None,
                offset: None,
                inputs: Vec::new(),
            },
        )?;
        self.put_raw(CF_STATE_INDEX, &index_key(header.height, &id.hash), &enc(&row))?;

        // Adopt orphans waiting on this header.
        let orphans: Vec<RowId> = self
            .all_states()?
            .into_iter()
            .filter(|(r, rec)| {
                *r != row
                    && rec.prev_row.is_none()
                    && rec.header.height == header.height + 1
                    && rec.header.prev == id.hash
            })
            .map(|(r, _)| r)
            .collect();
        for orphan in orphans {
            self.update_rec(orphan, |r| r.prev_row = Some(row))?;
        }
        Ok(row)
    }

    fn state_find(&self, id: &StateId) -> Result<Option<RowId>, StoreError> {
        self.get_raw(CF_STATE_INDEX, &index_key(id.height, &id.hash))?
            .map(|v| dec::<RowId>(&v, "index row"))
            .transpose()
    }

    fn get_state(&self, row: RowId) -> Result<BlockHeader, StoreError> {
        Ok(self.rec(row)?.header)
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
        self.update_rec(row, |r| r.flags |= state_flags::FUNCTIONAL)?;
        self.try_make_reachable(row)
    }

    fn set_state_not_functional(&mut self, row: RowId) -> Result<(), StoreError> {
        self.update_rec(row, |r| r.flags &= !state_flags::FUNCTIONAL)?;
        self.clear_reachable(row)
    }

    fn move_fwd(&mut self, row: RowId) -> Result<(), StoreError> {
        let cursor = self.get_cursor_row()?;
        let rec = self.rec(row)?;
        if rec.prev_row != cursor && !(cursor.is_none() && rec.header.height == GENESIS_HEIGHT) {
            return Err(StoreError::Corruption("move_fwd off cursor"));
        }
        self.update_rec(row, |r| r.flags |= state_flags::ACTIVE)?;
        self.set_meta_u64(META_CURSOR, row)
    }

    fn move_back(&mut self, row: RowId) -> Result<(), StoreError> {
        if self.get_cursor_row()? != Some(row) {
            return Err(StoreError::Corruption("move_back off cursor"));
        }
        let prev = self.rec(row)?.prev_row;
        self.update_rec(row, |r| r.flags &= !state_flags::ACTIVE)?;
        self.set_meta_u64(META_CURSOR, prev.unwrap_or(0))
    }

    fn get_cursor_row(&self) -> Result<Option<RowId>, StoreError> {
        let row = self.meta_u64(META_CURSOR, 0)?;
        Ok((row != 0).then_some(row))
    }

    fn enum_tips(&self) -> Result<Vec<TipInfo>, StoreError> {
        let states = self.all_states()?;
        let parents: std::collections::HashSet<RowId> =
            states.iter().filter_map(|(_, rec)| rec.prev_row).collect();
        let mut tips: Vec<TipInfo> = states
            .iter()
            .filter(|(row, _)| !parents.contains(row))
            .map(|(row, rec)| TipInfo {
                row: *row,
                height: rec.header.height,
                chain_work: rec.header.chain_work,
            })
            .collect();
        tips.sort_by_key(|t| t.height);
        Ok(tips)
    }

    fn enum_functional_tips(&self) -> Result<Vec<TipInfo>, StoreError> {
        let states = self.all_states()?;
        let reachable_parents: std::collections::HashSet<RowId> = states
            .iter()
            .filter(|(_, rec)| rec.flags & state_flags::REACHABLE != 0)
            .filter_map(|(_, rec)| rec.prev_row)
            .collect();
        let mut tips: Vec<TipInfo> = states
            .iter()
            .filter(|(row, rec)| {
                rec.flags & state_flags::REACHABLE != 0 && !reachable_parents.contains(row)
            })
            .map(|(row, rec)| TipInfo {
                row: *row,
                height: rec.header.height,
                chain_work: rec.header.chain_work,
            })
            .collect();
        tips.sort_by(|a, b| b.chain_work.cmp(&a.chain_work));
        Ok(tips)
    }

    fn enum_states_at(&self, height: Height) -> Result<Vec<RowId>, StoreError> {
        let prefix = height.to_be_bytes();
        let mut out = Vec::new();
        for (k, v) in self.scan_from(CF_STATE_INDEX, &prefix)? {
            if !k.starts_with(&prefix) {
                break;
            }
            out.push(dec::<RowId>(&v, "index row")?);
        }
        Ok(out)
    }

    fn find_active_state(&self, height: Height) -> Result<Option<RowId>, StoreError> {
        for row in self.enum_states_at(height)? {
            if self.rec(row)?.flags & state_flags::ACTIVE != 0 {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    fn find_state_by_txo_id(&self, id: TxoId) -> Result<Option<(RowId, Height)>, StoreError> {
        let mut active: Vec<(RowId, Height, TxoId)> = self
            .all_states()?
            .into_iter()
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
        if !self.children(row)?.is_empty() {
            return Err(StoreError::Corruption("delete of non-tip state"));
        }
        if self.get_cursor_row()? == Some(row) {
            return Err(StoreError::Corruption("delete of cursor state"));
        }
        let rec = self.rec(row)?;
        self.del_raw(CF_STATE_INDEX, &index_key(rec.header.height, &rec.header.hash()))?;
        self.del_raw(CF_STATES, &row_key(row))?;
        for tag in [BLOB_PERISHABLE, BLOB_ETERNAL, BLOB_ROLLBACK] {
            self.del_raw(CF_BLOCKS, &blob_key(row, tag))?;
        }
        Ok(rec.prev_row)
    }

    // --- blobs and extras ---

    fn set_state_block(
        &mut self,
        row: RowId,
        perishable: &[u8],
        eternal: &[u8],
        peer: PeerId,
    ) -> Result<(), StoreError> {
        self.put_raw(CF_BLOCKS, &blob_key(row, BLOB_PERISHABLE), perishable)?;
        self.put_raw(CF_BLOCKS, &blob_key(row, BLOB_ETERNAL), eternal)?;
        self.update_rec(row, |r| r.peer = Some(peer))
    }

    fn get_state_block(
        &self,
        row: RowId,
    ) -> Result<(Option<Vec<u8>>, Option<Vec<u8>>, Option<Vec<u8>>), StoreError> {
        Ok((
            self.get_raw(CF_BLOCKS, &blob_key(row, BLOB_PERISHABLE))?,
            self.get_raw(CF_BLOCKS, &blob_key(row, BLOB_ETERNAL))?,
            self.get_raw(CF_BLOCKS, &blob_key(row, BLOB_ROLLBACK))?,
        ))
    }

    fn del_state_block_pp(&mut self, row: RowId) -> Result<(), StoreError> {
        self.del_raw(CF_BLOCKS, &blob_key(row, BLOB_PERISHABLE))?;
        self.update_rec(row, |r| r.peer = None)
    }

    fn del_state_block_ppr(&mut self, row: RowId) -> Result<(), StoreError> {
        self.del_raw(CF_BLOCKS, &blob_key(row, BLOB_PERISHABLE))?;
        self.del_raw(CF_BLOCKS, &blob_key(row, BLOB_ROLLBACK))?;
        self.update_rec(row, |r| r.peer = None)
    }

    fn del_state_block_all(&mut self, row: RowId) -> Result<(), StoreError> {
        for tag in [BLOB_PERISHABLE, BLOB_ETERNAL, BLOB_ROLLBACK] {
            self.del_raw(CF_BLOCKS, &blob_key(row, tag))?;
        }
        self.update_rec(row, |r| r.peer = None)
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
        match rollback {
            Some(rb) => self.put_raw(CF_BLOCKS, &blob_key(row, BLOB_ROLLBACK), rb)?,
            None => self.del_raw(CF_BLOCKS, &blob_key(row, BLOB_ROLLBACK))?,
        }
        self.update_rec(row, |r| {
            r.txos = txos;
            r.offset = offset;
        })
    }

    fn get_state_txos(&self, row: RowId) -> Result<Option<TxoId>, StoreError> {
        Ok(self.rec(row)?.txos)
    }

    fn get_state_extra(&self, row: RowId) -> Result<Option<ScalarBytes>, StoreError> {
        Ok(self.rec(row)?.offset)
    }

    fn set_state_inputs(&mut self, row: RowId, inputs: &[StateInput]) -> Result<(), StoreError> {
        let inputs = inputs.to_vec();
        self.update_rec(row, move |r| r.inputs = inputs)
    }

    fn get_state_inputs(&self, row: RowId) -> Result<Vec<StateInput>, StoreError> {
        Ok(self.rec(row)?.inputs)
    }

    // --- txos ---

    fn txo_add(&mut self, id: TxoId, value: &[u8]) -> Result<(), StoreError> {
        self.put_raw(CF_TXOS, &id.to_be_bytes(), &enc(&(value.to_vec(), MAX_HEIGHT)))
    }

    fn txo_del(&mut self, id: TxoId) -> Result<(), StoreError> {
        self.del_raw(CF_TXOS, &id.to_be_bytes())
    }

    fn txo_del_from(&mut self, from: TxoId) -> Result<(), StoreError> {
        let keys: Vec<Vec<u8>> = self
            .scan_from(CF_TXOS, &from.to_be_bytes())?
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        for k in keys {
            self.del_raw(CF_TXOS, &k)?;
        }
        Ok(())
    }

    fn txo_set_spent(&mut self, id: TxoId, height: Height) -> Result<(), StoreError> {
        let bytes = self
            .get_raw(CF_TXOS, &id.to_be_bytes())?
            .ok_or(StoreError::Corruption("txo_set_spent on missing txo"))?;
        let (value, _): (Vec<u8>, Height) = dec(&bytes, "txo record")?;
        self.put_raw(CF_TXOS, &id.to_be_bytes(), &enc(&(value, height)))
    }

    fn txo_get(&self, id: TxoId) -> Result<Option<TxoRecord>, StoreError> {
        match self.get_raw(CF_TXOS, &id.to_be_bytes())? {
            Some(bytes) => {
                let (value, spend_height): (Vec<u8>, Height) = dec(&bytes, "txo record")?;
                Ok(Some(TxoRecord { id, value, spend_height }))
            }
            None => Ok(None),
        }
    }

    fn txo_set_value(&mut self, id: TxoId, value: &[u8]) -> Result<(), StoreError> {
        let bytes = self
            .get_raw(CF_TXOS, &id.to_be_bytes())?
            .ok_or(StoreError::Corruption("txo_set_value on missing txo"))?;
        let (_, spend_height): (Vec<u8>, Height) = dec(&bytes, "txo record")?;
        self.put_raw(CF_TXOS, &id.to_be_bytes(), &enc(&(value.to_vec(), spend_height)))
    }

    fn enum_txos(&self, from: TxoId) -> Result<Vec<TxoRecord>, StoreError> {
        let mut out = Vec::new();
        for (k, v) in self.scan_from(CF_TXOS, &from.to_be_bytes())? {
            let id = TxoId::from_be_bytes(
                k.as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Corruption("txo key width"))?,
            );
            let (value, spend_height): (Vec<u8>, Height) = dec(&v, "txo record")?;
            out.push(TxoRecord { id, value, spend_height });
        }
        Ok(out)
    }

    // --- kernel index ---

    fn insert_kernel(&mut self, id: &Hash256, height: Height) -> Result<(), StoreError> {
        let mut key = id.as_bytes().to_vec();
        key.extend_from_slice(&height.to_be_bytes());
        self.put_raw(CF_KERNELS, &key, &[])
    }

    fn delete_kernel(&mut self, id: &Hash256, height: Height) -> Result<(), StoreError> {
        let mut key = id.as_bytes().to_vec();
        key.extend_from_slice(&height.to_be_bytes());
        if self.get_raw(CF_KERNELS, &key)?.is_none() {
            return Err(StoreError::Corruption("delete of missing kernel"));
        }
        self.del_raw(CF_KERNELS, &key)
    }

    fn find_kernel(&self, id: &Hash256) -> Result<Option<Height>, StoreError> {
        let prefix = id.as_bytes();
        let mut best = None;
        for (k, _) in self.scan_from(CF_KERNELS, prefix)? {
            if !k.starts_with(prefix) {
                break;
            }
            let height = Height::from_be_bytes(
                k[32..]
                    .try_into()
                    .map_err(|_| StoreError::Corruption("kernel key width"))?,
            );
            best = Some(best.map_or(height, |b: Height| b.max(height)));
        }
        Ok(best)
    }

    // --- events ---

    fn insert_event(&mut self, height: Height, key: &[u8], body: &[u8]) -> Result<(), StoreError> {
        let seq = self.meta_u64(META_EVENT_SEQ, 0)?;
        self.set_meta_u64(META_EVENT_SEQ, seq + 1)?;
        let mut k = height.to_be_bytes().to_vec();
        k.extend_from_slice(&seq.to_be_bytes());
        self.put_raw(CF_EVENTS, &k, &enc(&(key.to_vec(), body.to_vec())))
    }

    fn delete_events_from(&mut self, height: Height) -> Result<(), StoreError> {
        let keys: Vec<Vec<u8>> = self
            .scan_from(CF_EVENTS, &height.to_be_bytes())?
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        for k in keys {
            self.del_raw(CF_EVENTS, &k)?;
        }
        Ok(())
    }

    fn find_events(&self, key: &[u8]) -> Result<Vec<EventRecord>, StoreError> {
        let mut out = Vec::new();
        for (k, v) in self.scan_from(CF_EVENTS, &[])? {
            let (ekey, body): (Vec<u8>, Vec<u8>) = dec(&v, "event record")?;
            if ekey != key {
                continue;
            }
            let height = Height::from_be_bytes(
                k[..8]
                    .try_into()
                    .map_err(|_| StoreError::Corruption("event key width"))?,
            );
            out.push(EventRecord { height, key: ekey, body });
        }
        Ok(out)
    }

    // --- unique keys ---

    fn unique_insert(&mut self, key: &[u8], value: &[u8]) -> Result<bool, StoreError> {
        if self.get_raw(CF_UNIQUE, key)?.is_some() {
            return Ok(false);
        }
        self.put_raw(CF_UNIQUE, key, value)?;
        Ok(true)
    }

    fn unique_delete_strict(&mut self, key: &[u8]) -> Result<(), StoreError> {
        if self.get_raw(CF_UNIQUE, key)?.is_none() {
            return Err(StoreError::Corruption("unique key missing on delete"));
        }
        self.del_raw(CF_UNIQUE, key)
    }

    fn unique_find(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.get_raw(CF_UNIQUE, key)
    }

    // --- assets ---

    fn asset_add(&mut self, info: &AssetInfo) -> Result<(), StoreError> {
        let key = info.id.to_be_bytes();
        if self.get_raw(CF_ASSETS, &key)?.is_some() {
            return Err(StoreError::Corruption("asset id occupied"));
        }
        self.put_raw(CF_ASSETS, &key, &enc(info))?;
        self.put_raw(CF_ASSET_OWNER, &info.owner.0, &enc(&info.id))
    }

    fn asset_get(&self, id: u32) -> Result<Option<AssetInfo>, StoreError> {
        self.get_raw(CF_ASSETS, &id.to_be_bytes())?
            .map(|v| dec(&v, "asset record"))
            .transpose()
    }

    fn asset_delete(&mut self, id: u32) -> Result<(), StoreError> {
        let info = self
            .asset_get(id)?
            .ok_or(StoreError::Corruption("delete of missing asset"))?;
        self.del_raw(CF_ASSETS, &id.to_be_bytes())?;
        self.del_raw(CF_ASSET_OWNER, &info.owner.0)
    }

    fn asset_find_by_owner(&self, owner: &CompressedPoint) -> Result<Option<u32>, StoreError> {
        self.get_raw(CF_ASSET_OWNER, &owner.0)?
            .map(|v| dec(&v, "asset owner index"))
            .transpose()
    }

    fn asset_set_value(&mut self, id: u32, value: u128, lock_height: Height) -> Result<(), StoreError> {
        let mut info = self
            .asset_get(id)?
            .ok_or(StoreError::Corruption("set_value on missing asset"))?;
        info.value = value;
        info.lock_height = lock_height;
        self.put_raw(CF_ASSETS, &id.to_be_bytes(), &enc(&info))
    }

    // --- shielded list ---

    fn shielded_count(&self) -> Result<u64, StoreError> {
        self.meta_u64(META_SHIELDED_COUNT, 0)
    }

    fn shielded_resize(&mut self, new_count: u64) -> Result<(), StoreError> {
        let count = self.shielded_count()?;
        if new_count > count {
            for pos in count..new_count {
                self.put_raw(CF_SHIELDED, &pos.to_be_bytes(), &[0u8; 32])?;
            }
        } else {
            for pos in new_count..count {
                self.del_raw(CF_SHIELDED, &pos.to_be_bytes())?;
            }
        }
        self.set_meta_u64(META_SHIELDED_COUNT, new_count)
    }

    fn shielded_write(&mut self, pos: u64, points: &[CompressedPoint]) -> Result<(), StoreError> {
        if pos + points.len() as u64 > self.shielded_count()? {
            return Err(StoreError::Corruption("shielded write out of bounds"));
        }
        for (i, p) in points.iter().enumerate() {
            self.put_raw(CF_SHIELDED, &(pos + i as u64).to_be_bytes(), &p.0)?;
        }
        Ok(())
    }

    fn shielded_read(&self, pos: u64, count: u64) -> Result<Vec<CompressedPoint>, StoreError> {
        if pos + count > self.shielded_count()? {
            return Err(StoreError::Corruption("shielded read out of bounds"));
        }
        let mut out = Vec::with_capacity(count as usize);
        for i in pos..pos + count {
            let bytes = self
                .get_raw(CF_SHIELDED, &i.to_be_bytes())?
                .ok_or(StoreError::Corruption("shielded gap"))?;
            out.push(CompressedPoint(
                bytes
                    .try_into()
                    .map_err(|_| StoreError::Corruption("shielded point width"))?,
            ));
        }
        Ok(out)
    }

    // --- params ---

    fn param_set(&mut self, id: ParamId, value: Option<&[u8]>) -> Result<(), StoreError> {
        let key = [b'p', id as u8];
        match value {
            Some(v) => self.put_raw(CF_META, &key, v),
            None => self.del_raw(CF_META, &key),
        }
    }

    fn param_get(&self, id: ParamId) -> Result<Option<Vec<u8>>, StoreError> {
        self.get_raw(CF_META, &[b'p', id as u8])
    }
}
