//! Pedersen commitments over the Ristretto group.
//!
//! Amounts are committed as `v·H + r·G` where `G` is the Ristretto
//! basepoint, `H` a nothing-up-my-sleeve generator, and `r` the blinding
//! factor. Confidential assets replace `H` with a per-asset generator
//! derived from the asset id by hash-to-point.
//!
//! Serialized structures never carry curve types directly; they carry the
//! 32-byte wire forms [`CompressedPoint`] and [`ScalarBytes`].

use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::CompressedRistretto;
use curve25519_dalek::{RistrettoPoint, Scalar};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

use crate::types::Hash256;

/// The value-blinding generator `G`.
pub fn generator_g() -> RistrettoPoint {
    RISTRETTO_BASEPOINT_POINT
}

/// The amount generator `H`, derived by hash-to-point from a fixed tag.
pub fn generator_h() -> RistrettoPoint {
    static H: OnceLock<RistrettoPoint> = OnceLock::new();
    *H.get_or_init(|| hash_to_point(b"veil.generator.H", &[]))
}

/// The per-asset amount generator. Asset id 0 is the default (native) asset
/// and maps to [`generator_h`].
pub fn asset_generator(asset_id: u32) -> RistrettoPoint {
    if asset_id == 0 {
        return generator_h();
    }
    hash_to_point(b"veil.generator.asset", &asset_id.to_le_bytes())
}

/// Domain-separated hash-to-point.
pub fn hash_to_point(tag: &[u8], data: &[u8]) -> RistrettoPoint {
    let mut hasher = blake3::Hasher::new();
    hasher.update(tag);
    hasher.update(data);
    let mut wide = [0u8; 64];
    hasher.finalize_xof().fill(&mut wide);
    RistrettoPoint::from_uniform_bytes(&wide)
}

/// Commit `value` under `generator` with blinding `r`: `value·gen + r·G`.
pub fn commit(value: u64, blinding: &Scalar, generator: &RistrettoPoint) -> RistrettoPoint {
    generator * Scalar::from(value) + generator_g() * blinding
}

/// 32-byte compressed Ristretto point as stored on the wire and on disk.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct CompressedPoint(pub [u8; 32]);

impl CompressedPoint {
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn from_point(p: &RistrettoPoint) -> Self {
        Self(p.compress().to_bytes())
    }

    /// Decompress. `None` for byte strings that are not valid encodings.
    pub fn decompress(&self) -> Option<RistrettoPoint> {
        CompressedRistretto(self.0).decompress()
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for CompressedPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<RistrettoPoint> for CompressedPoint {
    fn from(p: RistrettoPoint) -> Self {
        Self::from_point(&p)
    }
}

/// 32-byte scalar wire form. Decoding reduces mod the group order, so any
/// byte string is accepted.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct ScalarBytes(pub [u8; 32]);

impl ScalarBytes {
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn from_scalar(s: &Scalar) -> Self {
        Self(s.to_bytes())
    }

    pub fn to_scalar(&self) -> Scalar {
        Scalar::from_bytes_mod_order(self.0)
    }
}

impl From<Scalar> for ScalarBytes {
    fn from(s: Scalar) -> Self {
        Self::from_scalar(&s)
    }
}

/// Hash a point into a [`Hash256`] (used for key derivation in maps).
pub fn point_key(tag: &[u8], p: &CompressedPoint) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(tag);
    hasher.update(&p.0);
    Hash256(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use curve25519_dalek::traits::Identity;

    fn s(v: u64) -> Scalar {
        Scalar::from(v)
    }

    // --- Generators ---

    #[test]
    fn generators_distinct() {
        assert_ne!(generator_g(), generator_h());
        assert_ne!(generator_h(), asset_generator(1));
        assert_ne!(asset_generator(1), asset_generator(2));
    }

    #[test]
    fn asset_zero_is_h() {
        assert_eq!(asset_generator(0), generator_h());
    }

    #[test]
    fn hash_to_point_deterministic() {
        assert_eq!(hash_to_point(b"t", b"x"), hash_to_point(b"t", b"x"));
        assert_ne!(hash_to_point(b"t", b"x"), hash_to_point(b"t", b"y"));
    }

    // --- Commitments ---

    #[test]
    fn commitment_is_homomorphic() {
        let h = generator_h();
        let c1 = commit(10, &s(3), &h);
        let c2 = commit(32, &s(4), &h);
        let sum = commit(42, &s(7), &h);
        assert_eq!(c1 + c2, sum);
    }

    #[test]
    fn zero_commitment_is_blinding_only() {
        let c = commit(0, &s(5), &generator_h());
        assert_eq!(c, generator_g() * s(5));
    }

    #[test]
    fn commitment_difference_cancels() {
        let h = generator_h();
        let c = commit(7, &s(9), &h);
        let neg = commit(7, &s(9), &h);
        assert_eq!(c - neg, RistrettoPoint::identity());
    }

    // --- Wire forms ---

    #[test]
    fn compressed_point_round_trip() {
        let p = commit(123, &s(456), &generator_h());
        let c = CompressedPoint::from_point(&p);
        assert_eq!(c.decompress().unwrap(), p);
    }

    #[test]
    fn compressed_point_rejects_garbage() {
        // Not every 32-byte string is a valid Ristretto encoding.
        assert!(CompressedPoint([0xFF; 32]).decompress().is_none());
    }

    #[test]
    fn scalar_bytes_round_trip() {
        let x = s(987_654_321);
        assert_eq!(ScalarBytes::from_scalar(&x).to_scalar(), x);
    }

    #[test]
    fn point_key_domain_separated() {
        let p = CompressedPoint::from_point(&generator_h());
        assert_ne!(point_key(b"a", &p), point_key(b"b", &p));
    }
}
