//! The UTXO commitment tree.
//!
//! An ordered multiset of unspent outputs keyed by `commitment ∥ maturity`
//! (big-endian, so identical commitments sort by earliest spendable height).
//! A leaf holds every TxoId sharing that key — duplicates are legal — in a
//! smallvec inlining the common single-id case. The tree exposes an
//! incremental merkle root with dirty-tracking, and persists to an image
//! file stamped against the database so stale images are detected after a
//! crash.

use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::path::Path;

use crate::commitment::CompressedPoint;
use crate::error::UtxoTreeError;
use crate::mmr::merkle_root;
use crate::types::{Hash256, Height, TxoId};

/// `commitment ∥ maturity_be`.
pub type UtxoKey = [u8; 40];

/// Random stamp tying an image file to a database generation.
pub type Stamp = [u8; 32];

pub fn utxo_key(commitment: &CompressedPoint, maturity: Height) -> UtxoKey {
    let mut key = [0u8; 40];
    key[..32].copy_from_slice(&commitment.0);
    key[32..].copy_from_slice(&maturity.to_be_bytes());
    key
}

fn key_maturity(key: &UtxoKey) -> Height {
    Height::from_be_bytes(key[32..].try_into().expect("8-byte suffix"))
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct UtxoLeaf {
    ids: SmallVec<[TxoId; 1]>,
}

impl UtxoLeaf {
    fn hash(&self, key: &UtxoKey) -> Hash256 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"veil.utxo.leaf");
        hasher.update(key);
        hasher.update(&(self.ids.len() as u32).to_le_bytes());
        for id in &self.ids {
            hasher.update(&id.to_le_bytes());
        }
        Hash256(hasher.finalize().into())
    }
}

/// The UTXO set with an incremental merkle commitment.
#[derive(Clone, Debug, Default)]
pub struct UtxoTree {
    leaves: BTreeMap<UtxoKey, UtxoLeaf>,
    dirty: bool,
    cached_root: Hash256,
}

impl UtxoTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct `(commitment, maturity)` leaves.
    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Total TxoIds, counting multiplicity.
    pub fn id_count(&self) -> u64 {
        self.leaves.values().map(|l| l.ids.len() as u64).sum()
    }

    /// Insert an unspent output. Duplicate keys push onto the leaf's id
    /// list; the multiplicity is capped at `u32::MAX`.
    pub fn insert(
        &mut self,
        commitment: &CompressedPoint,
        maturity: Height,
        id: TxoId,
    ) -> Result<(), UtxoTreeError> {
        let leaf = self.leaves.entry(utxo_key(commitment, maturity)).or_default();
        if leaf.ids.len() >= u32::MAX as usize {
            return Err(UtxoTreeError::CountOverflow);
        }
        leaf.ids.push(id);
        self.dirty = true;
        Ok(())
    }

    /// Spend one output with this commitment and maturity ≤ `max_maturity`.
    /// Picks the earliest-maturing leaf and pops its most recent id.
    pub fn spend(
        &mut self,
        commitment: &CompressedPoint,
        max_maturity: Height,
    ) -> Result<(TxoId, Height), UtxoTreeError> {
        let lo = utxo_key(commitment, 0);
        let hi = utxo_key(commitment, max_maturity);
        let key = match self.leaves.range(lo..=hi).next() {
            Some((key, _)) => *key,
            None => return Err(UtxoTreeError::NotFound(max_maturity)),
        };
        let maturity = key_maturity(&key);

        let leaf = self.leaves.get_mut(&key).expect("key just found");
        let id = leaf.ids.pop().expect("leaves never empty");
        if leaf.ids.is_empty() {
            self.leaves.remove(&key);
        }
        self.dirty = true;
        Ok((id, maturity))
    }

    /// Remove the most recently inserted id under an exact key (output
    /// reversal). Returns the popped id.
    pub fn remove_newest(
        &mut self,
        commitment: &CompressedPoint,
        maturity: Height,
    ) -> Result<TxoId, UtxoTreeError> {
        let key = utxo_key(commitment, maturity);
        let leaf = self
            .leaves
            .get_mut(&key)
            .ok_or(UtxoTreeError::NotFound(maturity))?;
        let id = leaf.ids.pop().expect("leaves never empty");
        if leaf.ids.is_empty() {
            self.leaves.remove(&key);
        }
        self.dirty = true;
        Ok(id)
    }

    /// The merkle root over leaf hashes. Recomputed only when dirty.
    pub fn root(&mut self) -> Hash256 {
        if self.dirty {
            let hashes: Vec<Hash256> =
                self.leaves.iter().map(|(key, leaf)| leaf.hash(key)).collect();
            self.cached_root = merkle_root(&hashes);
            self.dirty = false;
        }
        self.cached_root
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    // ------------------------------------------------------------------
    // Image persistence
    // ------------------------------------------------------------------

    /// Write the tree to `path`, stamped with `stamp`.
    pub fn save_image(&self, path: &Path, stamp: &Stamp) -> Result<(), UtxoTreeError> {
        let image = UtxoImage {
            stamp: *stamp,
            leaves: self
                .leaves
                .iter()
                .map(|(key, leaf)| (*key, leaf.ids.to_vec()))
                .collect(),
        };
        let bytes = bincode::encode_to_vec(&image, bincode::config::standard())
            .map_err(|e| UtxoTreeError::Image(e.to_string()))?;
        std::fs::write(path, bytes).map_err(|e| UtxoTreeError::Image(e.to_string()))
    }

    /// Load an image. The caller compares the returned stamp against the
    /// one recorded in the database and discards the tree on mismatch.
    pub fn load_image(path: &Path) -> Result<(Stamp, Self), UtxoTreeError> {
        let bytes = std::fs::read(path).map_err(|e| UtxoTreeError::Image(e.to_string()))?;
        let (image, _): (UtxoImage, usize) =
            bincode::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| UtxoTreeError::Image(e.to_string()))?;
        let mut tree = Self::new();
        for (key, ids) in image.leaves {
            tree.leaves.insert(key, UtxoLeaf { ids: SmallVec::from_vec(ids) });
        }
        tree.dirty = true;
        Ok((image.stamp, tree))
    }
}

#[derive(bincode::Encode, bincode::Decode)]
struct UtxoImage {
    stamp: Stamp,
    leaves: Vec<(UtxoKey, Vec<TxoId>)>,
}
