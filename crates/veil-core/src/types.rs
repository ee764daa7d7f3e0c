//! Core chain types: heights, hashes, difficulty, block headers.
//!
//! A block header here is the spec's `SystemState`: besides the usual PoW
//! fields it commits to four accumulator roots — the history MMR of prior
//! headers, the kernel root of its own block, and (folded into `definition`)
//! the UTXO, shielded and asset roots after the block is applied.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Block height. The genesis block sits at [`GENESIS_HEIGHT`]; height 0 means
/// "before genesis" (empty chain).
pub type Height = u64;

/// Height of the first block.
pub const GENESIS_HEIGHT: Height = 1;

/// Sentinel for "no height" / "unspent".
pub const MAX_HEIGHT: Height = u64::MAX;

/// Chain-ordered output index. Treasury outputs occupy `[0, txos_treasury)`.
pub type TxoId = u64;

/// A 32-byte hash value (blake3 for ids and merkle nodes, double SHA-256 for
/// the header PoW hash).
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash.
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Network identity of a peer, as reported by the networking layer.
///
/// Opaque to the core: it is only stored next to blocks so that misbehaving
/// peers can be blamed when their data turns out invalid.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    /// The anonymous peer (locally generated or unknown origin).
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Per-block difficulty in abstract work units. Higher = harder.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Difficulty(pub u64);

impl Difficulty {
    /// The PoW target for this difficulty: the first 8 bytes of the header
    /// hash, read little-endian, must not exceed it.
    pub fn pow_target(&self) -> u64 {
        u64::MAX / self.0.max(1)
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cumulative chain work: the sum of difficulties from genesis to a state.
///
/// A u64 per-block difficulty summed over any realistic chain length cannot
/// overflow u128.
pub type ChainWork = u128;

/// An inclusive height range. `is_empty` when `min > max`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct HeightRange {
    pub min: Height,
    pub max: Height,
}

impl HeightRange {
    pub fn new(min: Height, max: Height) -> Self {
        Self { min, max }
    }

    /// The full range `[GENESIS_HEIGHT, MAX_HEIGHT]`.
    pub fn unbounded() -> Self {
        Self { min: GENESIS_HEIGHT, max: MAX_HEIGHT }
    }

    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }

    pub fn contains(&self, h: Height) -> bool {
        h >= self.min && h <= self.max
    }
}

/// Block header (the spec's `SystemState`).
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockHeader {
    /// Height of this block.
    pub height: Height,
    /// Hash of the previous block header. [`Hash256::ZERO`] is the
    /// prehistoric hash preceding genesis.
    pub prev: Hash256,
    /// Unix timestamp in seconds.
    pub timestamp: u64,
    /// Difficulty this block was mined at.
    pub difficulty: Difficulty,
    /// Proof-of-work nonce.
    pub nonce: u64,
    /// Cumulative work including this block:
    /// `chain_work = parent.chain_work + difficulty`.
    pub chain_work: ChainWork,
    /// Root of the history MMR over headers `[genesis, height - 1]`.
    pub history: Hash256,
    /// Merkle root over this block's kernel ids.
    pub kernels: Hash256,
    /// Composite hash of `history ∥ utxos ∥ shielded ∥ assets` evaluated
    /// after this block is applied.
    pub definition: Hash256,
}

impl BlockHeader {
    /// Header size in bytes when serialized for hashing.
    const HASH_SIZE: usize = 8 * 4 + 16 + 4 * 32;

    /// Compute the header hash (double SHA-256 over a fixed byte layout).
    pub fn hash(&self) -> Hash256 {
        let mut data = Vec::with_capacity(Self::HASH_SIZE);
        data.extend_from_slice(&self.height.to_le_bytes());
        data.extend_from_slice(self.prev.as_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data.extend_from_slice(&self.difficulty.0.to_le_bytes());
        data.extend_from_slice(&self.nonce.to_le_bytes());
        data.extend_from_slice(&self.chain_work.to_le_bytes());
        data.extend_from_slice(self.history.as_bytes());
        data.extend_from_slice(self.kernels.as_bytes());
        data.extend_from_slice(self.definition.as_bytes());
        let first = Sha256::digest(&data);
        Hash256(Sha256::digest(first).into())
    }

    /// Check the proof-of-work: the LE u64 prefix of the header hash must not
    /// exceed the difficulty target.
    pub fn is_valid_pow(&self) -> bool {
        let hash = self.hash();
        let prefix = u64::from_le_bytes(hash.0[0..8].try_into().expect("hash is 32 bytes"));
        prefix <= self.difficulty.pow_target()
    }

    /// Structural sanity independent of chain context: height, non-zero
    /// difficulty and PoW.
    pub fn is_valid(&self) -> bool {
        self.height >= GENESIS_HEIGHT && self.difficulty.0 > 0 && self.is_valid_pow()
    }

    pub fn id(&self) -> StateId {
        StateId { height: self.height, hash: self.hash() }
    }
}

/// Compact identity of a state: height plus header hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct StateId {
    pub height: Height,
    pub hash: Hash256,
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.height, self.hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> BlockHeader {
        BlockHeader {
            height: 1,
            prev: Hash256::ZERO,
            timestamp: 1_700_000_000,
            difficulty: Difficulty(1),
            nonce: 0,
            chain_work: 1,
            history: Hash256::ZERO,
            kernels: Hash256::ZERO,
            definition: Hash256::ZERO,
        }
    }

    // --- Hash256 / PeerId ---

    #[test]
    fn hash256_zero_detection() {
        assert!(Hash256::ZERO.is_zero());
        assert!(!Hash256([1; 32]).is_zero());
    }

    #[test]
    fn hash256_display_hex() {
        let s = format!("{}", Hash256([0xAB; 32]));
        assert_eq!(s.len(), 64);
        assert!(s.starts_with("ab"));
    }

    #[test]
    fn peer_id_zero() {
        assert!(PeerId::ZERO.is_zero());
        assert!(!PeerId([3; 32]).is_zero());
    }

    // --- Difficulty ---

    #[test]
    fn difficulty_one_accepts_anything() {
        assert_eq!(Difficulty(1).pow_target(), u64::MAX);
    }

    #[test]
    fn difficulty_zero_treated_as_one() {
        assert_eq!(Difficulty(0).pow_target(), u64::MAX);
    }

    #[test]
    fn harder_difficulty_lower_target() {
        assert!(Difficulty(1000).pow_target() < Difficulty(10).pow_target());
    }

    // --- HeightRange ---

    #[test]
    fn height_range_empty() {
        assert!(HeightRange::new(5, 4).is_empty());
        assert!(!HeightRange::new(5, 5).is_empty());
    }

    #[test]
    fn height_range_contains() {
        let r = HeightRange::new(3, 7);
        assert!(r.contains(3));
        assert!(r.contains(7));
        assert!(!r.contains(2));
        assert!(!r.contains(8));
    }

    // --- BlockHeader ---

    #[test]
    fn header_hash_deterministic() {
        let h = sample_header();
        assert_eq!(h.hash(), h.hash());
    }

    #[test]
    fn header_hash_changes_with_nonce() {
        let h1 = sample_header();
        let mut h2 = h1.clone();
        h2.nonce = 1;
        assert_ne!(h1.hash(), h2.hash());
    }

    #[test]
    fn header_hash_changes_with_definition() {
        let h1 = sample_header();
        let mut h2 = h1.clone();
        h2.definition = Hash256([7; 32]);
        assert_ne!(h1.hash(), h2.hash());
    }

    #[test]
    fn pow_difficulty_one_always_valid() {
        assert!(sample_header().is_valid_pow());
        assert!(sample_header().is_valid());
    }

    #[test]
    fn header_invalid_below_genesis() {
        let mut h = sample_header();
        h.height = 0;
        assert!(!h.is_valid());
    }

    #[test]
    fn state_id_display() {
        let id = sample_header().id();
        let s = format!("{id}");
        assert!(s.starts_with("1@"));
    }

    #[test]
    fn bincode_round_trip_header() {
        let header = sample_header();
        let encoded = bincode::encode_to_vec(&header, bincode::config::standard()).unwrap();
        let (decoded, _): (BlockHeader, usize) =
            bincode::decode_from_slice(&encoded, bincode::config::standard()).unwrap();
        assert_eq!(header, decoded);
    }
}
