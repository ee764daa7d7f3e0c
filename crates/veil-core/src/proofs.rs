//! Zero-knowledge proof contracts used by confidential transactions.
//!
//! Everything here is a sigma protocol over Ristretto, made non-interactive
//! with a blake3 Fiat–Shamir [`Oracle`]:
//!
//! - [`SchnorrSig`]: proof of knowledge of a kernel's excess.
//! - [`RangeProof`]: per-bit commitments with two-branch OR-proofs plus a
//!   linear recombination check; proves the committed value is a 64-bit
//!   integer.
//! - [`SpendProof`]: one-of-many membership proof over a window of shielded
//!   pool elements. Verification emits one challenge scalar per window
//!   element — the aggregation weights consumed by the multi-sigma
//!   aggregator, which performs the pool-side multi-exponentiation later.
//! - [`AssetProof`]: the same OR machinery over asset-id-derived generators,
//!   proving a blinded generator belongs to a registered asset window.
//!
//! Batched verification folds every relation into a [`ProofBatch`] with
//! per-relation random weights; one multiscalar evaluation at flush time
//! returns the identity iff every folded relation holds.

use curve25519_dalek::traits::{Identity, VartimeMultiscalarMul};
use curve25519_dalek::{RistrettoPoint, Scalar};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::commitment::{
    asset_generator, commit, generator_g, generator_h, CompressedPoint, ScalarBytes,
};
use crate::error::ProofError;

/// Number of bits proven by a range proof.
pub const RANGE_BITS: usize = 64;

/// Fiat–Shamir transcript over blake3.
pub struct Oracle {
    hasher: blake3::Hasher,
}

impl Oracle {
    pub fn new(tag: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(tag);
        Self { hasher }
    }

    pub fn absorb(&mut self, data: &[u8]) {
        self.hasher.update(&(data.len() as u64).to_le_bytes());
        self.hasher.update(data);
    }

    pub fn absorb_point(&mut self, p: &CompressedPoint) {
        self.hasher.update(&p.0);
    }

    /// Squeeze a challenge scalar and ratchet the transcript.
    pub fn challenge(&mut self) -> Scalar {
        let mut wide = [0u8; 64];
        self.hasher.finalize_xof().fill(&mut wide);
        self.hasher.update(&wide[..32]);
        Scalar::from_bytes_mod_order_wide(&wide)
    }
}

/// Batched multiscalar accumulator. One lives per verifier thread.
///
/// Relations are folded as `Σ sᵢ·Pᵢ + g·G + h·H`; [`ProofBatch::flush`]
/// evaluates the sum and resets. The caller checks the result against the
/// identity (or keeps accumulating it across flushes, as fast-sync does).
pub struct ProofBatch {
    g_scalar: Scalar,
    h_scalar: Scalar,
    scalars: Vec<Scalar>,
    points: Vec<RistrettoPoint>,
}

impl Default for ProofBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ProofBatch {
    pub fn new() -> Self {
        Self {
            g_scalar: Scalar::ZERO,
            h_scalar: Scalar::ZERO,
            scalars: Vec::new(),
            points: Vec::new(),
        }
    }

    /// Fresh random fold weight.
    pub fn weight(&mut self) -> Scalar {
        Scalar::random(&mut OsRng)
    }

    pub fn add_g(&mut self, s: Scalar) {
        self.g_scalar += s;
    }

    pub fn add_h(&mut self, s: Scalar) {
        self.h_scalar += s;
    }

    pub fn add_point(&mut self, s: Scalar, p: RistrettoPoint) {
        self.scalars.push(s);
        self.points.push(p);
    }

    pub fn is_empty(&self) -> bool {
        self.scalars.is_empty() && self.g_scalar == Scalar::ZERO && self.h_scalar == Scalar::ZERO
    }

    /// Evaluate and clear. Identity ⇔ all folded relations hold.
    pub fn flush(&mut self) -> RistrettoPoint {
        self.scalars.push(self.g_scalar);
        self.points.push(generator_g());
        self.scalars.push(self.h_scalar);
        self.points.push(generator_h());
        let sum = RistrettoPoint::vartime_multiscalar_mul(self.scalars.iter(), self.points.iter());
        self.reset();
        sum
    }

    /// Discard accumulated state without evaluating.
    pub fn reset(&mut self) {
        self.g_scalar = Scalar::ZERO;
        self.h_scalar = Scalar::ZERO;
        self.scalars.clear();
        self.points.clear();
    }
}

/// Schnorr signature proving knowledge of the discrete log of a public key.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct SchnorrSig {
    pub nonce_pub: CompressedPoint,
    pub k: ScalarBytes,
}

impl SchnorrSig {
    pub fn sign(sk: &Scalar, msg: &[u8]) -> Self {
        let r = Scalar::random(&mut OsRng);
        let nonce_pub = CompressedPoint::from_point(&(generator_g() * r));
        let pk = CompressedPoint::from_point(&(generator_g() * sk));
        let c = Self::challenge_for(&pk, &nonce_pub, msg);
        Self { nonce_pub, k: ScalarBytes::from_scalar(&(r + c * sk)) }
    }

    fn challenge_for(pk: &CompressedPoint, nonce_pub: &CompressedPoint, msg: &[u8]) -> Scalar {
        let mut oracle = Oracle::new(b"veil.schnorr");
        oracle.absorb_point(pk);
        oracle.absorb_point(nonce_pub);
        oracle.absorb(msg);
        oracle.challenge()
    }

    /// Fold `k·G - R - c·PK == 0` into the batch.
    pub fn verify_batched(
        &self,
        pk: &CompressedPoint,
        msg: &[u8],
        batch: &mut ProofBatch,
    ) -> Result<(), ProofError> {
        let pk_pt = pk.decompress().ok_or(ProofError::InvalidPoint)?;
        let nonce = self.nonce_pub.decompress().ok_or(ProofError::InvalidPoint)?;
        let c = Self::challenge_for(pk, &self.nonce_pub, msg);
        let w = batch.weight();
        batch.add_g(w * self.k.to_scalar());
        batch.add_point(-w, nonce);
        batch.add_point(-(w * c), pk_pt);
        Ok(())
    }

    pub fn verify(&self, pk: &CompressedPoint, msg: &[u8]) -> bool {
        let mut batch = ProofBatch::new();
        if self.verify_batched(pk, msg, &mut batch).is_err() {
            return false;
        }
        batch.flush() == RistrettoPoint::identity()
    }
}

// ----------------------------------------------------------------------
// Range proof
// ----------------------------------------------------------------------

/// One bit of a range proof: a commitment to the bit and a two-branch
/// OR-proof that it opens to 0 or 1.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
struct BitProof {
    bit: CompressedPoint,
    a0: CompressedPoint,
    a1: CompressedPoint,
    c0: ScalarBytes,
    z0: ScalarBytes,
    z1: ScalarBytes,
}

/// Proof that a commitment `C = v·gen + r·G` opens to a 64-bit value.
///
/// `gen` is the amount generator: [`generator_h`] for the native asset, or
/// the blinded generator carried by an [`AssetProof`].
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct RangeProof {
    bits: Vec<BitProof>,
}

impl RangeProof {
    /// Prove `commitment = value·gen + blinding·G`.
    pub fn create(
        value: u64,
        blinding: &Scalar,
        gen: &RistrettoPoint,
        commitment: &CompressedPoint,
    ) -> Self {
        let g = generator_g();

        // Per-bit blindings summing (weighted by 2^i) to the full blinding.
        let mut blinds: Vec<Scalar> = (0..RANGE_BITS).map(|_| Scalar::random(&mut OsRng)).collect();
        let mut acc = Scalar::ZERO;
        for (i, b) in blinds.iter().enumerate().skip(1) {
            acc += Scalar::from(1u64 << i) * b;
        }
        blinds[0] = blinding - acc;

        let mut bits = Vec::with_capacity(RANGE_BITS);
        for (i, r_i) in blinds.iter().enumerate() {
            let b = (value >> i) & 1;
            let bit_pt = commit(b, r_i, gen);
            let bit = CompressedPoint::from_point(&bit_pt);

            // Simulate the false branch, run the true branch honestly.
            let nonce = Scalar::random(&mut OsRng);
            let c_sim = Scalar::random(&mut OsRng);
            let z_sim = Scalar::random(&mut OsRng);

            let (a0, a1) = if b == 0 {
                let a0 = g * nonce;
                let a1 = g * z_sim - (bit_pt - gen) * c_sim;
                (a0, a1)
            } else {
                let a0 = g * z_sim - bit_pt * c_sim;
                let a1 = g * nonce;
                (a0, a1)
            };
            let a0 = CompressedPoint::from_point(&a0);
            let a1 = CompressedPoint::from_point(&a1);

            let c = Self::bit_challenge(commitment, i, &bit, &a0, &a1);
            let (c0, z0, z1) = if b == 0 {
                let c0 = c - c_sim;
                (c0, nonce + c0 * r_i, z_sim)
            } else {
                let c1 = c - c_sim;
                (c_sim, z_sim, nonce + c1 * r_i)
            };

            bits.push(BitProof {
                bit,
                a0,
                a1,
                c0: c0.into(),
                z0: z0.into(),
                z1: z1.into(),
            });
        }

        Self { bits }
    }

    fn bit_challenge(
        commitment: &CompressedPoint,
        index: usize,
        bit: &CompressedPoint,
        a0: &CompressedPoint,
        a1: &CompressedPoint,
    ) -> Scalar {
        let mut oracle = Oracle::new(b"veil.range.bit");
        oracle.absorb_point(commitment);
        oracle.absorb(&(index as u32).to_le_bytes());
        oracle.absorb_point(bit);
        oracle.absorb_point(a0);
        oracle.absorb_point(a1);
        oracle.challenge()
    }

    /// Fold all bit relations and the linear recombination into `batch`.
    pub fn verify_batched(
        &self,
        commitment: &CompressedPoint,
        gen: &RistrettoPoint,
        batch: &mut ProofBatch,
    ) -> Result<(), ProofError> {
        if self.bits.len() != RANGE_BITS {
            return Err(ProofError::Malformed);
        }
        let c_pt = commitment.decompress().ok_or(ProofError::InvalidPoint)?;

        let w_lin = batch.weight();
        batch.add_point(-w_lin, c_pt);

        for (i, bp) in self.bits.iter().enumerate() {
            let bit_pt = bp.bit.decompress().ok_or(ProofError::InvalidPoint)?;
            let a0 = bp.a0.decompress().ok_or(ProofError::InvalidPoint)?;
            let a1 = bp.a1.decompress().ok_or(ProofError::InvalidPoint)?;

            let c = Self::bit_challenge(commitment, i, &bp.bit, &bp.a0, &bp.a1);
            let c0 = bp.c0.to_scalar();
            let c1 = c - c0;

            // Branch 0: a0 + c0·B - z0·G == 0
            let w0 = batch.weight();
            batch.add_point(w0, a0);
            batch.add_point(w0 * c0, bit_pt);
            batch.add_g(-(w0 * bp.z0.to_scalar()));

            // Branch 1: a1 + c1·(B - gen) - z1·G == 0
            let w1 = batch.weight();
            batch.add_point(w1, a1);
            batch.add_point(w1 * c1, bit_pt);
            batch.add_point(-(w1 * c1), *gen);
            batch.add_g(-(w1 * bp.z1.to_scalar()));

            // Linear part: Σ 2^i·Bᵢ == C
            batch.add_point(w_lin * Scalar::from(1u64 << i), bit_pt);
        }
        Ok(())
    }

    pub fn verify(&self, commitment: &CompressedPoint, gen: &RistrettoPoint) -> bool {
        let mut batch = ProofBatch::new();
        if self.verify_batched(commitment, gen, &mut batch).is_err() {
            return false;
        }
        batch.flush() == RistrettoPoint::identity()
    }
}

// ----------------------------------------------------------------------
// Shielded spend proof
// ----------------------------------------------------------------------

#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
struct SpendBranch {
    a: CompressedPoint,
    c: ScalarBytes,
    z: ScalarBytes,
}

/// One-of-many membership proof over a shielded pool window.
///
/// Proves that some pool element in the window satisfies
/// `Poolⱼ − spend_pk − commitment = r·G` with the prover knowing `r` —
/// i.e. `commitment` re-introduces exactly the value that was shielded
/// under `Poolⱼ`, whatever generator it was committed under. The
/// per-element challenge scalars are the weights the multi-sigma
/// aggregator applies to the pool commitment list.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct SpendProof {
    /// Window size (the anonymity set).
    pub n: u32,
    /// Nullifier key; doubles as the unique-key-set entry.
    pub spend_pk: CompressedPoint,
    branches: Vec<SpendBranch>,
}

impl SpendProof {
    /// Prove membership at `index` within `window`, where
    /// `window[index] = spend_pk + commitment + witness·G`.
    pub fn create(
        msg: &[u8],
        window: &[RistrettoPoint],
        index: usize,
        spend_pk: &CompressedPoint,
        commitment: &CompressedPoint,
        witness: &Scalar,
    ) -> Self {
        let g = generator_g();
        let n = window.len();
        assert!(index < n);
        let spend_pt = spend_pk.decompress().expect("spend_pk valid");
        let c_pt = commitment.decompress().expect("commitment valid");

        let mut sims: Vec<(Scalar, Scalar)> = Vec::with_capacity(n);
        let mut a_pts: Vec<CompressedPoint> = Vec::with_capacity(n);
        let nonce = Scalar::random(&mut OsRng);
        for (i, pool) in window.iter().enumerate() {
            if i == index {
                sims.push((Scalar::ZERO, Scalar::ZERO));
                a_pts.push(CompressedPoint::from_point(&(g * nonce)));
            } else {
                let (c_i, z_i) = (Scalar::random(&mut OsRng), Scalar::random(&mut OsRng));
                let q = pool - spend_pt - c_pt;
                a_pts.push(CompressedPoint::from_point(&(g * z_i - q * c_i)));
                sims.push((c_i, z_i));
            }
        }

        let c_total = Self::total_challenge(msg, spend_pk, commitment, &a_pts);
        let c_sum: Scalar = sims.iter().map(|(c, _)| *c).sum();
        let c_real = c_total - c_sum;
        sims[index] = (c_real, nonce + c_real * witness);

        let branches = a_pts
            .into_iter()
            .zip(sims)
            .map(|(a, (c, z))| SpendBranch { a, c: c.into(), z: z.into() })
            .collect();

        Self { n: n as u32, spend_pk: *spend_pk, branches }
    }

    fn total_challenge(
        msg: &[u8],
        spend_pk: &CompressedPoint,
        commitment: &CompressedPoint,
        a_pts: &[CompressedPoint],
    ) -> Scalar {
        let mut oracle = Oracle::new(b"veil.spend");
        oracle.absorb(msg);
        oracle.absorb_point(spend_pk);
        oracle.absorb_point(commitment);
        for a in a_pts {
            oracle.absorb_point(a);
        }
        oracle.challenge()
    }

    /// Fold everything except the pool-side multi-exponentiation into
    /// `batch`; return the per-element weights to apply to the pool window
    /// (positions `[window_end - n, window_end)`).
    pub fn verify_batched(
        &self,
        msg: &[u8],
        commitment: &CompressedPoint,
        batch: &mut ProofBatch,
    ) -> Result<Vec<Scalar>, ProofError> {
        if self.branches.len() != self.n as usize || self.n == 0 {
            return Err(ProofError::Malformed);
        }
        let spend_pt = self.spend_pk.decompress().ok_or(ProofError::InvalidPoint)?;
        let c_pt = commitment.decompress().ok_or(ProofError::InvalidPoint)?;

        let a_pts: Vec<CompressedPoint> = self.branches.iter().map(|b| b.a).collect();
        let c_total = Self::total_challenge(msg, &self.spend_pk, commitment, &a_pts);
        let c_sum: Scalar = self.branches.iter().map(|b| b.c.to_scalar()).sum();
        if c_sum != c_total {
            return Err(ProofError::ChallengeMismatch);
        }

        // Per branch: a + c·(Pool − spend_pk − C) − z·G == 0.
        // The `c·Pool` term is deferred to the aggregator via the weights.
        let mut weights = Vec::with_capacity(self.branches.len());
        let mut fixed_acc = Scalar::ZERO;
        for branch in &self.branches {
            let a = branch.a.decompress().ok_or(ProofError::InvalidPoint)?;
            let c = branch.c.to_scalar();
            let w = batch.weight();
            batch.add_point(w, a);
            batch.add_g(-(w * branch.z.to_scalar()));
            fixed_acc -= w * c;
            weights.push(w * c);
        }
        batch.add_point(fixed_acc, spend_pt);
        batch.add_point(fixed_acc, c_pt);
        Ok(weights)
    }

    /// Stand-alone verification against explicit window points.
    pub fn verify(&self, msg: &[u8], commitment: &CompressedPoint, window: &[RistrettoPoint]) -> bool {
        if window.len() != self.n as usize {
            return false;
        }
        let mut batch = ProofBatch::new();
        let weights = match self.verify_batched(msg, commitment, &mut batch) {
            Ok(w) => w,
            Err(_) => return false,
        };
        for (w, p) in weights.iter().zip(window) {
            batch.add_point(*w, *p);
        }
        batch.flush() == RistrettoPoint::identity()
    }
}

// ----------------------------------------------------------------------
// Asset membership proof
// ----------------------------------------------------------------------

#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
struct AssetBranch {
    a: CompressedPoint,
    c: ScalarBytes,
    z: ScalarBytes,
}

/// Proof that `hgen` is a blinded registered-asset generator:
/// `hgen = asset_generator(begin + j) + t·G` for some `j < n`.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct AssetProof {
    /// First asset id of the window (1-based).
    pub begin: u32,
    pub n: u32,
    /// The blinded generator actually used by the commitment.
    pub hgen: CompressedPoint,
    branches: Vec<AssetBranch>,
}

impl AssetProof {
    /// Prove for `asset_id` with generator blinding `t`
    /// (`hgen = asset_generator(asset_id) + t·G`).
    pub fn create(begin: u32, n: u32, asset_id: u32, t: &Scalar) -> Self {
        assert!(asset_id >= begin && asset_id < begin + n);
        let g = generator_g();
        let hgen_pt = asset_generator(asset_id) + g * t;
        let hgen = CompressedPoint::from_point(&hgen_pt);
        let index = (asset_id - begin) as usize;

        let mut sims: Vec<(Scalar, Scalar)> = Vec::with_capacity(n as usize);
        let mut a_pts: Vec<CompressedPoint> = Vec::with_capacity(n as usize);
        let nonce = Scalar::random(&mut OsRng);
        for i in 0..n as usize {
            if i == index {
                sims.push((Scalar::ZERO, Scalar::ZERO));
                a_pts.push(CompressedPoint::from_point(&(g * nonce)));
            } else {
                let (c_i, z_i) = (Scalar::random(&mut OsRng), Scalar::random(&mut OsRng));
                let d = hgen_pt - asset_generator(begin + i as u32);
                a_pts.push(CompressedPoint::from_point(&(g * z_i - d * c_i)));
                sims.push((c_i, z_i));
            }
        }

        let c_total = Self::total_challenge(&hgen, begin, n, &a_pts);
        let c_sum: Scalar = sims.iter().map(|(c, _)| *c).sum();
        let c_real = c_total - c_sum;
        sims[index] = (c_real, nonce + c_real * t);

        let branches = a_pts
            .into_iter()
            .zip(sims)
            .map(|(a, (c, z))| AssetBranch { a, c: c.into(), z: z.into() })
            .collect();

        Self { begin, n, hgen, branches }
    }

    fn total_challenge(hgen: &CompressedPoint, begin: u32, n: u32, a_pts: &[CompressedPoint]) -> Scalar {
        let mut oracle = Oracle::new(b"veil.asset");
        oracle.absorb_point(hgen);
        oracle.absorb(&begin.to_le_bytes());
        oracle.absorb(&n.to_le_bytes());
        for a in a_pts {
            oracle.absorb_point(a);
        }
        oracle.challenge()
    }

    /// Fold the `hgen`-side terms into `batch`; return the weights to apply
    /// to the derived generators `asset_generator(begin + i)`.
    pub fn verify_batched(&self, batch: &mut ProofBatch) -> Result<Vec<Scalar>, ProofError> {
        if self.branches.len() != self.n as usize || self.n == 0 || self.begin == 0 {
            return Err(ProofError::Malformed);
        }
        let hgen_pt = self.hgen.decompress().ok_or(ProofError::InvalidPoint)?;

        let a_pts: Vec<CompressedPoint> = self.branches.iter().map(|b| b.a).collect();
        let c_total = Self::total_challenge(&self.hgen, self.begin, self.n, &a_pts);
        let c_sum: Scalar = self.branches.iter().map(|b| b.c.to_scalar()).sum();
        if c_sum != c_total {
            return Err(ProofError::ChallengeMismatch);
        }

        // Per branch: a + c·(hgen − H_i) − z·G == 0, H_i deferred.
        let mut weights = Vec::with_capacity(self.branches.len());
        let mut hgen_acc = Scalar::ZERO;
        for branch in &self.branches {
            let a = branch.a.decompress().ok_or(ProofError::InvalidPoint)?;
            let c = branch.c.to_scalar();
            let w = batch.weight();
            batch.add_point(w, a);
            batch.add_g(-(w * branch.z.to_scalar()));
            hgen_acc += w * c;
            weights.push(-(w * c));
        }
        batch.add_point(hgen_acc, hgen_pt);
        Ok(weights)
    }

    pub fn verify(&self) -> bool {
        let mut batch = ProofBatch::new();
        let weights = match self.verify_batched(&mut batch) {
            Ok(w) => w,
            Err(_) => return false,
        };
        for (i, w) in weights.iter().enumerate() {
            batch.add_point(*w, asset_generator(self.begin + i as u32));
        }
        batch.flush() == RistrettoPoint::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitment::generator_h;

    fn s(v: u64) -> Scalar {
        Scalar::from(v)
    }

    // ------------------------------------------------------------------
    // Oracle
    // ------------------------------------------------------------------

    #[test]
    fn oracle_deterministic() {
        let mut a = Oracle::new(b"t");
        let mut b = Oracle::new(b"t");
        a.absorb(b"data");
        b.absorb(b"data");
        assert_eq!(a.challenge(), b.challenge());
    }

    #[test]
    fn oracle_ratchets() {
        let mut o = Oracle::new(b"t");
        let c1 = o.challenge();
        let c2 = o.challenge();
        assert_ne!(c1, c2);
    }

    #[test]
    fn oracle_tag_separates() {
        let mut a = Oracle::new(b"x");
        let mut b = Oracle::new(b"y");
        assert_ne!(a.challenge(), b.challenge());
    }

    // ------------------------------------------------------------------
    // Schnorr
    // ------------------------------------------------------------------

    #[test]
    fn schnorr_round_trip() {
        let sk = s(42);
        let pk = CompressedPoint::from_point(&(generator_g() * sk));
        let sig = SchnorrSig::sign(&sk, b"msg");
        assert!(sig.verify(&pk, b"msg"));
    }

    #[test]
    fn schnorr_rejects_wrong_msg() {
        let sk = s(42);
        let pk = CompressedPoint::from_point(&(generator_g() * sk));
        let sig = SchnorrSig::sign(&sk, b"msg");
        assert!(!sig.verify(&pk, b"other"));
    }

    #[test]
    fn schnorr_rejects_wrong_key() {
        let sig = SchnorrSig::sign(&s(42), b"msg");
        let other = CompressedPoint::from_point(&(generator_g() * s(43)));
        assert!(!sig.verify(&other, b"msg"));
    }

    #[test]
    fn schnorr_batch_two_good() {
        let mut batch = ProofBatch::new();
        for sk in [3u64, 4] {
            let sk = s(sk);
            let pk = CompressedPoint::from_point(&(generator_g() * sk));
            SchnorrSig::sign(&sk, b"m").verify_batched(&pk, b"m", &mut batch).unwrap();
        }
        assert_eq!(batch.flush(), RistrettoPoint::identity());
    }

    #[test]
    fn schnorr_batch_one_bad_poisons_batch() {
        let mut batch = ProofBatch::new();
        let sk = s(3);
        let pk = CompressedPoint::from_point(&(generator_g() * sk));
        SchnorrSig::sign(&sk, b"m").verify_batched(&pk, b"m", &mut batch).unwrap();
        let wrong = CompressedPoint::from_point(&(generator_g() * s(9)));
        SchnorrSig::sign(&sk, b"m").verify_batched(&wrong, b"m", &mut batch).unwrap();
        assert_ne!(batch.flush(), RistrettoPoint::identity());
    }

    // ------------------------------------------------------------------
    // Range proof
    // ------------------------------------------------------------------

    fn range_case(value: u64) {
        let h = generator_h();
        let blinding = Scalar::random(&mut OsRng);
        let c = CompressedPoint::from_point(&commit(value, &blinding, &h));
        let proof = RangeProof::create(value, &blinding, &h, &c);
        assert!(proof.verify(&c, &h), "value {value}");
    }

    #[test]
    fn range_proof_zero() {
        range_case(0);
    }

    #[test]
    fn range_proof_small() {
        range_case(42);
    }

    #[test]
    fn range_proof_max() {
        range_case(u64::MAX);
    }

    #[test]
    fn range_proof_wrong_commitment_fails() {
        let h = generator_h();
        let blinding = Scalar::random(&mut OsRng);
        let c = CompressedPoint::from_point(&commit(5, &blinding, &h));
        let proof = RangeProof::create(5, &blinding, &h, &c);
        let other = CompressedPoint::from_point(&commit(6, &blinding, &h));
        assert!(!proof.verify(&other, &h));
    }

    #[test]
    fn range_proof_batch_flush_clears() {
        let h = generator_h();
        let blinding = Scalar::random(&mut OsRng);
        let c = CompressedPoint::from_point(&commit(7, &blinding, &h));
        let proof = RangeProof::create(7, &blinding, &h, &c);

        let mut batch = ProofBatch::new();
        proof.verify_batched(&c, &h, &mut batch).unwrap();
        assert!(!batch.is_empty());
        assert_eq!(batch.flush(), RistrettoPoint::identity());
        assert!(batch.is_empty());
    }

    // ------------------------------------------------------------------
    // Spend proof
    // ------------------------------------------------------------------

    /// A pool where `window[index] = spend_pk + commitment + witness·G`.
    struct SpendCase {
        spend_pk: CompressedPoint,
        commitment: CompressedPoint,
        witness: Scalar,
        window: Vec<RistrettoPoint>,
    }

    fn spend_case(n: usize, index: usize, value: u64) -> SpendCase {
        let h = generator_h();
        let spend_pt = generator_g() * s(777);
        let spend_pk = CompressedPoint::from_point(&spend_pt);
        let pool_blind = Scalar::random(&mut OsRng);
        let out_blind = Scalar::random(&mut OsRng);
        let commitment = CompressedPoint::from_point(&commit(value, &out_blind, &h));
        let witness = pool_blind - out_blind;
        let window = (0..n)
            .map(|i| {
                if i == index {
                    spend_pt + commit(value, &pool_blind, &h)
                } else {
                    RistrettoPoint::random(&mut OsRng)
                }
            })
            .collect();
        SpendCase { spend_pk, commitment, witness, window }
    }

    #[test]
    fn spend_proof_round_trip() {
        let case = spend_case(8, 3, 100);
        let proof = SpendProof::create(
            b"krn", &case.window, 3, &case.spend_pk, &case.commitment, &case.witness,
        );
        assert!(proof.verify(b"krn", &case.commitment, &case.window));
    }

    #[test]
    fn spend_proof_rejects_wrong_window() {
        let case = spend_case(8, 3, 100);
        let proof = SpendProof::create(
            b"krn", &case.window, 3, &case.spend_pk, &case.commitment, &case.witness,
        );
        let mut other = case.window.clone();
        other[3] = RistrettoPoint::random(&mut OsRng);
        assert!(!proof.verify(b"krn", &case.commitment, &other));
    }

    #[test]
    fn spend_proof_rejects_wrong_msg() {
        let case = spend_case(4, 0, 5);
        let proof = SpendProof::create(
            b"krn", &case.window, 0, &case.spend_pk, &case.commitment, &case.witness,
        );
        assert!(!proof.verify(b"other", &case.commitment, &case.window));
    }

    #[test]
    fn spend_proof_rejects_inflated_commitment() {
        // A commitment to a different value does not satisfy the relation.
        let case = spend_case(4, 1, 5);
        let proof = SpendProof::create(
            b"krn", &case.window, 1, &case.spend_pk, &case.commitment, &case.witness,
        );
        let inflated = CompressedPoint::from_point(
            &(case.commitment.decompress().unwrap() + generator_h()),
        );
        assert!(!proof.verify(b"krn", &inflated, &case.window));
    }

    #[test]
    fn spend_proof_weights_align_with_window() {
        let case = spend_case(4, 2, 1);
        let proof = SpendProof::create(
            b"m", &case.window, 2, &case.spend_pk, &case.commitment, &case.witness,
        );
        let mut batch = ProofBatch::new();
        let weights = proof.verify_batched(b"m", &case.commitment, &mut batch).unwrap();
        assert_eq!(weights.len(), 4);
        // Applying the weights to the window closes the relation.
        for (w, p) in weights.iter().zip(&case.window) {
            batch.add_point(*w, *p);
        }
        assert_eq!(batch.flush(), RistrettoPoint::identity());
    }

    // ------------------------------------------------------------------
    // Asset proof
    // ------------------------------------------------------------------

    #[test]
    fn asset_proof_round_trip() {
        let t = Scalar::random(&mut OsRng);
        let proof = AssetProof::create(1, 8, 5, &t);
        assert!(proof.verify());
    }

    #[test]
    fn asset_proof_window_edges() {
        let t = Scalar::random(&mut OsRng);
        assert!(AssetProof::create(1, 8, 1, &t).verify());
        assert!(AssetProof::create(1, 8, 8, &t).verify());
    }

    #[test]
    fn asset_proof_tampered_hgen_fails() {
        let t = Scalar::random(&mut OsRng);
        let mut proof = AssetProof::create(1, 8, 5, &t);
        proof.hgen = CompressedPoint::from_point(&RistrettoPoint::random(&mut OsRng));
        assert!(!proof.verify());
    }

    #[test]
    fn asset_proof_begin_zero_malformed() {
        let t = Scalar::random(&mut OsRng);
        let mut proof = AssetProof::create(1, 4, 2, &t);
        proof.begin = 0;
        let mut batch = ProofBatch::new();
        assert_eq!(proof.verify_batched(&mut batch), Err(ProofError::Malformed));
    }

    #[test]
    fn asset_proof_hgen_usable_as_generator() {
        // The blinded generator can carry a range proof for an asset amount.
        let t = Scalar::random(&mut OsRng);
        let proof = AssetProof::create(1, 4, 3, &t);
        let hgen = proof.hgen.decompress().unwrap();
        let blinding = Scalar::random(&mut OsRng);
        let c = CompressedPoint::from_point(&commit(12, &blinding, &hgen));
        let rp = RangeProof::create(12, &blinding, &hgen, &c);
        assert!(rp.verify(&c, &hgen));
    }
}
