//! Merkle structures: the padded binary tree used for per-block kernel
//! commitments, and the Merkle Mountain Range accumulators over history,
//! the shielded log and the asset registry.
//!
//! Domain-separated blake3 hashing throughout: `0x00 ∥ data` for leaves,
//! `0x01 ∥ left ∥ right` for interior nodes.

use serde::{Deserialize, Serialize};

use crate::types::Hash256;

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

/// Domain-separated leaf hash.
pub fn leaf_hash(data: &Hash256) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[LEAF_PREFIX]);
    hasher.update(data.as_bytes());
    Hash256(hasher.finalize().into())
}

/// Domain-separated interior node hash.
pub fn node_hash(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[NODE_PREFIX]);
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    Hash256(hasher.finalize().into())
}

/// Merkle root of a padded binary tree (odd layers duplicate the last
/// element). [`Hash256::ZERO`] for an empty slice. Used for the per-block
/// kernel commitment.
pub fn merkle_root(leaves: &[Hash256]) -> Hash256 {
    if leaves.is_empty() {
        return Hash256::ZERO;
    }
    let mut current: Vec<Hash256> = leaves.iter().map(leaf_hash).collect();
    while current.len() > 1 {
        let mut next = Vec::with_capacity(current.len().div_ceil(2));
        let mut i = 0;
        while i < current.len() {
            let left = &current[i];
            let right = if i + 1 < current.len() { &current[i + 1] } else { left };
            next.push(node_hash(left, right));
            i += 2;
        }
        current = next;
    }
    current[0]
}

/// A Merkle Mountain Range over an in-memory leaf vector.
///
/// Appends maintain the peak stack incrementally; [`VecMmr::shrink_to`] and
/// [`VecMmr::replace`] (both rare — rollback and asset-registry rewrites)
/// rebuild the peaks from the retained leaves.
#[derive(Clone, Debug, Default, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct VecMmr {
    leaves: Vec<Hash256>,
    /// `(level, hash)` peak stack, leftmost first.
    peaks: Vec<(u32, Hash256)>,
}

impl VecMmr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_leaves(leaves: Vec<Hash256>) -> Self {
        let mut mmr = Self { leaves, peaks: Vec::new() };
        mmr.rebuild_peaks();
        mmr
    }

    pub fn count(&self) -> u64 {
        self.leaves.len() as u64
    }

    pub fn leaves(&self) -> &[Hash256] {
        &self.leaves
    }

    pub fn append(&mut self, value: Hash256) {
        self.leaves.push(value);
        self.push_peak(leaf_hash(&value));
    }

    fn push_peak(&mut self, hash: Hash256) {
        self.peaks.push((0, hash));
        while self.peaks.len() >= 2 {
            let (lv_r, h_r) = self.peaks[self.peaks.len() - 1];
            let (lv_l, h_l) = self.peaks[self.peaks.len() - 2];
            if lv_l != lv_r {
                break;
            }
            self.peaks.truncate(self.peaks.len() - 2);
            self.peaks.push((lv_l + 1, node_hash(&h_l, &h_r)));
        }
    }

    /// Truncate to the first `count` leaves (rollback).
    pub fn shrink_to(&mut self, count: u64) {
        assert!(count <= self.count());
        self.leaves.truncate(count as usize);
        self.rebuild_peaks();
    }

    /// Replace the leaf at `index` (asset registry rewrites values in place).
    pub fn replace(&mut self, index: u64, value: Hash256) {
        self.leaves[index as usize] = value;
        self.rebuild_peaks();
    }

    /// Grow with zero leaves up to `count` (asset-id slots).
    pub fn resize_to(&mut self, count: u64) {
        while self.count() < count {
            self.append(Hash256::ZERO);
        }
    }

    fn rebuild_peaks(&mut self) {
        self.peaks.clear();
        let leaves = std::mem::take(&mut self.leaves);
        for leaf in &leaves {
            self.push_peak(leaf_hash(leaf));
        }
        self.leaves = leaves;
    }

    /// The MMR root: peaks bagged right to left. [`Hash256::ZERO`] when empty.
    pub fn root(&self) -> Hash256 {
        let mut iter = self.peaks.iter().rev();
        let mut acc = match iter.next() {
            Some((_, h)) => *h,
            None => return Hash256::ZERO,
        };
        for (_, h) in iter {
            acc = node_hash(h, &acc);
        }
        acc
    }

    /// The root this MMR would have after appending `value`, without
    /// mutating. Used for the cursor's `history_next` prediction.
    pub fn predicted_root(&self, value: Hash256) -> Hash256 {
        let mut copy = Self { leaves: Vec::new(), peaks: self.peaks.clone() };
        copy.push_peak(leaf_hash(&value));
        copy.root()
    }
}
