//! Block bodies and context-free verification.
//!
//! A body is stored and shipped in two parts, the way the node prunes them:
//! the *perishable* part (inputs and outputs, discarded below the TxoLo
//! horizon) and the *eternal* part (offset and kernels, kept forever).
//!
//! [`VerifyContext`] implements the parallel, context-free half of block
//! validation: each verifier thread takes the `index`-th slice of inputs,
//! outputs and kernels, folds proofs into its thread's [`ProofBatch`], and
//! accumulates a partial balance `sigma`; partials merge under the
//! multiblock mutex and the block closes when
//! `Σout − Σin − Σexcess − offset·G − subsidy·H` is the identity.

use curve25519_dalek::traits::Identity;
use curve25519_dalek::{RistrettoPoint, Scalar};
use serde::{Deserialize, Serialize};

use crate::commitment::{asset_generator, generator_g, generator_h, CompressedPoint, ScalarBytes};
use crate::error::BlockError;
use crate::kernel::{Kernel, KernelData};
use crate::proofs::{AssetProof, ProofBatch, RangeProof};
use crate::types::{Hash256, Height, TxoId, MAX_HEIGHT};

/// Where a spent input came from; linked at apply time, not on the wire.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct InputRef {
    pub txo_id: TxoId,
    pub maturity: Height,
}

impl Default for InputRef {
    fn default() -> Self {
        Self { txo_id: 0, maturity: MAX_HEIGHT }
    }
}

/// A transaction input: the commitment of the UTXO being spent.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Input {
    pub commitment: CompressedPoint,
    /// Filled by the interpreter when the input is matched to a concrete
    /// UTXO; carried so the spend can be reverted to the exact leaf.
    pub spent: InputRef,
}

impl Input {
    pub fn new(commitment: CompressedPoint) -> Self {
        Self { commitment, spent: InputRef::default() }
    }
}

/// A transaction output.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Output {
    pub commitment: CompressedPoint,
    pub coinbase: bool,
    /// Extra maturity delay requested by the sender.
    pub incubation: Height,
    /// Absent only on "naked" outputs (sparse blocks, TxoHi-stripped txos).
    pub range_proof: Option<RangeProof>,
    pub asset_proof: Option<AssetProof>,
}

impl Output {
    /// Create a native-asset output with a fresh range proof.
    pub fn create(value: u64, blinding: &Scalar, coinbase: bool, incubation: Height) -> Self {
        let commitment =
            CompressedPoint::from_point(&crate::commitment::commit(value, blinding, &generator_h()));
        let range_proof = RangeProof::create(value, blinding, &generator_h(), &commitment);
        Self { commitment, coinbase, incubation, range_proof: Some(range_proof), asset_proof: None }
    }

    /// Create a confidential-asset output under a blinded asset generator.
    pub fn create_asset(
        value: u64,
        blinding: &Scalar,
        asset_proof: AssetProof,
        incubation: Height,
    ) -> Self {
        let hgen = asset_proof.hgen.decompress().expect("own proof generator valid");
        let commitment =
            CompressedPoint::from_point(&crate::commitment::commit(value, blinding, &hgen));
        let range_proof = RangeProof::create(value, blinding, &hgen, &commitment);
        Self {
            commitment,
            coinbase: false,
            incubation,
            range_proof: Some(range_proof),
            asset_proof: Some(asset_proof),
        }
    }

    /// The earliest height at which this output (created at `height`) can be
    /// spent.
    pub fn min_maturity(&self, height: Height, coinbase_maturity: Height) -> Height {
        let base = if self.coinbase { height + coinbase_maturity } else { height };
        base + self.incubation
    }

    /// Strip proofs, keeping only what spends and rollbacks need.
    pub fn to_naked(&self) -> Self {
        Self {
            commitment: self.commitment,
            coinbase: self.coinbase,
            incubation: self.incubation,
            range_proof: None,
            asset_proof: None,
        }
    }

    pub fn is_naked(&self) -> bool {
        self.range_proof.is_none()
    }
}

/// The perishable half of a body: discarded below TxoLo.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default, bincode::Encode, bincode::Decode)]
pub struct PerishablePart {
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
}

/// The eternal half of a body: offset and kernels, kept forever.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default, bincode::Encode, bincode::Decode)]
pub struct EternalPart {
    pub offset: ScalarBytes,
    pub kernels: Vec<Kernel>,
}

/// A full block body.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct BlockBody {
    pub offset: ScalarBytes,
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    pub kernels: Vec<Kernel>,
}

impl BlockBody {
    /// Serialize into the stored (perishable, eternal) pair.
    pub fn serialize_parts(&self) -> (Vec<u8>, Vec<u8>) {
        let perishable = PerishablePart { inputs: self.inputs.clone(), outputs: self.outputs.clone() };
        let eternal = EternalPart { offset: self.offset, kernels: self.kernels.clone() };
        let cfg = bincode::config::standard();
        (
            bincode::encode_to_vec(&perishable, cfg).expect("in-memory encode"),
            bincode::encode_to_vec(&eternal, cfg).expect("in-memory encode"),
        )
    }

    pub fn from_parts(perishable: &[u8], eternal: &[u8]) -> Result<Self, BlockError> {
        let cfg = bincode::config::standard();
        let (p, _): (PerishablePart, usize) =
            bincode::decode_from_slice(perishable, cfg).map_err(|_| BlockError::Deserialization)?;
        let (e, _): (EternalPart, usize) =
            bincode::decode_from_slice(eternal, cfg).map_err(|_| BlockError::Deserialization)?;
        Ok(Self { offset: e.offset, inputs: p.inputs, outputs: p.outputs, kernels: e.kernels })
    }

    /// Merkle root over this body's kernel ids.
    pub fn kernel_commitment(&self) -> Hash256 {
        crate::kernel::kernel_commitment(&self.kernels)
    }

    /// Serialized size of both parts.
    pub fn serialized_size(&self) -> usize {
        let (p, e) = self.serialize_parts();
        p.len() + e.len()
    }
}

/// The composite state commitment recorded in each header: the root the
/// chain claims for its whole state after the block.
pub fn evaluate_definition(
    history: &Hash256,
    utxos: &Hash256,
    shielded: &Hash256,
    assets: &Hash256,
) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"veil.definition");
    hasher.update(history.as_bytes());
    hasher.update(utxos.as_bytes());
    hasher.update(shielded.as_bytes());
    hasher.update(assets.as_bytes());
    Hash256(hasher.finalize().into())
}

/// Partial context-free verification state for one verifier thread.
pub struct VerifyContext {
    pub height: Height,
    pub sigma: RistrettoPoint,
    pub fees: u64,
}

impl VerifyContext {
    pub fn new(height: Height) -> Self {
        Self { height, sigma: RistrettoPoint::identity(), fees: 0 }
    }

    /// Verify the `index`-th of `total` slices of `body`.
    ///
    /// Shielded spend proofs are *not* verified here — the shielded
    /// aggregator walks kernels with its own round-robin slicing. Asset
    /// proof generator weights go to `asset_weights`.
    pub fn validate_slice(
        &mut self,
        body: &BlockBody,
        index: usize,
        total: usize,
        allow_unsigned_outputs: bool,
        batch: &mut ProofBatch,
        asset_weights: &mut dyn FnMut(u32, Vec<Scalar>),
    ) -> Result<(), BlockError> {
        debug_assert!(index < total);

        if index == 0 {
            let mut prev: Option<Hash256> = None;
            for (i, krn) in body.kernels.iter().enumerate() {
                let id = krn.id();
                if let Some(p) = prev {
                    if id <= p {
                        return Err(BlockError::Kernel {
                            index: i,
                            source: crate::error::KernelError::Unsorted,
                        });
                    }
                }
                prev = Some(id);
            }
        }

        for (i, out) in body.outputs.iter().enumerate() {
            if i % total != index {
                continue;
            }
            let c = out
                .commitment
                .decompress()
                .ok_or(BlockError::OutputProof { index: i, source: crate::error::ProofError::InvalidPoint })?;
            self.sigma += c;

            match (&out.range_proof, &out.asset_proof) {
                (Some(rp), maybe_asset) => {
                    let gen = match maybe_asset {
                        Some(ap) => {
                            let weights = ap
                                .verify_batched(batch)
                                .map_err(|source| BlockError::OutputProof { index: i, source })?;
                            asset_weights(ap.begin, weights);
                            ap.hgen.decompress().ok_or(BlockError::OutputProof {
                                index: i,
                                source: crate::error::ProofError::InvalidPoint,
                            })?
                        }
                        None => generator_h(),
                    };
                    rp.verify_batched(&out.commitment, &gen, batch)
                        .map_err(|source| BlockError::OutputProof { index: i, source })?;
                }
                (None, _) if allow_unsigned_outputs => {}
                (None, _) => return Err(BlockError::MissingRangeProof { index: i }),
            }
        }

        for (i, inp) in body.inputs.iter().enumerate() {
            if i % total != index {
                continue;
            }
            let c = inp
                .commitment
                .decompress()
                .ok_or(BlockError::OutputProof { index: i, source: crate::error::ProofError::InvalidPoint })?;
            self.sigma -= c;
        }

        for (i, krn) in body.kernels.iter().enumerate() {
            if i % total != index {
                continue;
            }
            krn.verify_batched(self.height, batch, asset_weights)
                .map_err(|source| BlockError::Kernel { index: i, source })?;
            krn.walk(&mut |k| {
                self.fees = self.fees.saturating_add(k.fee);
                // Decompression failures here were already rejected by the
                // proof checks above; skipping keeps the walk infallible.
                if let Some(excess) = k.excess.decompress() {
                    self.sigma -= excess;
                }
                match &k.data {
                    KernelData::AssetEmit { asset_id, amount, .. } => {
                        // Emission mints (or burning returns) value under
                        // the asset generator.
                        let gen = asset_generator(*asset_id);
                        if *amount >= 0 {
                            self.sigma -= gen * Scalar::from(*amount as u64);
                        } else {
                            self.sigma += gen * Scalar::from(amount.unsigned_abs());
                        }
                    }
                    KernelData::ShieldedOutput { commitment, .. } => {
                        // Value leaving the transparent side into the pool.
                        if let Some(c) = commitment.decompress() {
                            self.sigma += c;
                        }
                    }
                    KernelData::ShieldedInput { commitment, .. } => {
                        // Withdrawn value re-entering the transparent side.
                        if let Some(c) = commitment.decompress() {
                            self.sigma -= c;
                        }
                    }
                    _ => {}
                }
            });
        }

        Ok(())
    }

    pub fn merge(&mut self, other: &VerifyContext) {
        debug_assert_eq!(self.height, other.height);
        self.sigma += other.sigma;
        self.fees = self.fees.saturating_add(other.fees);
    }

    /// Fold the offset and block subsidy in; the result is the block's final
    /// sigma (identity for a balanced block).
    pub fn close_block(&mut self, offset: &Scalar, subsidy: u64) -> RistrettoPoint {
        self.sigma -= generator_g() * offset;
        self.sigma -= generator_h() * Scalar::from(subsidy);
        self.sigma
    }

    /// Fold offset and fee for a stand-alone transaction (no emission).
    pub fn close_tx(&mut self, offset: &Scalar) -> RistrettoPoint {
        self.sigma -= generator_g() * offset;
        self.sigma += generator_h() * Scalar::from(self.fees);
        self.sigma
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelData;
    use crate::types::HeightRange;
    use rand::rngs::OsRng;

    fn s(v: u64) -> Scalar {
        Scalar::from(v)
    }

    /// A balanced single-coinbase block: output commits `subsidy`, the
    /// kernel excess absorbs the leftover blinding.
    fn coinbase_body(subsidy: u64) -> BlockBody {
        let r = Scalar::random(&mut OsRng);
        let offset = Scalar::random(&mut OsRng);
        let sk = r - offset;
        let output = Output::create(subsidy, &r, true, 0);
        let kernel = Kernel::sign(&sk, 0, HeightRange::unbounded(), KernelData::Std { relative_lock: None }, vec![]);
        BlockBody {
            offset: ScalarBytes::from_scalar(&offset),
            inputs: vec![],
            outputs: vec![output],
            kernels: vec![kernel],
        }
    }

    fn verify_full(body: &BlockBody, height: Height, subsidy: u64, allow_unsigned: bool) -> bool {
        let mut ctx = VerifyContext::new(height);
        let mut batch = ProofBatch::new();
        let mut sink = |_b: u32, _w: Vec<Scalar>| panic!("no asset proofs expected");
        if ctx.validate_slice(body, 0, 1, allow_unsigned, &mut batch, &mut sink).is_err() {
            return false;
        }
        if batch.flush() != RistrettoPoint::identity() {
            return false;
        }
        ctx.close_block(&body.offset.to_scalar(), subsidy) == RistrettoPoint::identity()
    }

    // ------------------------------------------------------------------
    // Outputs
    // ------------------------------------------------------------------

    #[test]
    fn output_min_maturity_plain() {
        let out = Output::create(5, &s(1), false, 0);
        assert_eq!(out.min_maturity(100, 240), 100);
    }

    #[test]
    fn output_min_maturity_coinbase_and_incubation() {
        let mut out = Output::create(5, &s(1), true, 7);
        assert_eq!(out.min_maturity(100, 240), 347);
        out.coinbase = false;
        assert_eq!(out.min_maturity(100, 240), 107);
    }

    #[test]
    fn naked_output_keeps_spend_identity() {
        let out = Output::create(5, &s(1), true, 3);
        let naked = out.to_naked();
        assert!(naked.is_naked());
        assert_eq!(naked.commitment, out.commitment);
        assert_eq!(naked.coinbase, out.coinbase);
        assert_eq!(naked.incubation, out.incubation);
    }

    // ------------------------------------------------------------------
    // Body parts
    // ------------------------------------------------------------------

    #[test]
    fn body_parts_round_trip() {
        let body = coinbase_body(80);
        let (p, e) = body.serialize_parts();
        let restored = BlockBody::from_parts(&p, &e).unwrap();
        assert_eq!(restored, body);
    }

    #[test]
    fn body_parts_garbage_rejected() {
        assert_eq!(
            BlockBody::from_parts(&[1, 2, 3], &[]).unwrap_err(),
            BlockError::Deserialization,
        );
    }

    #[test]
    fn eternal_part_survives_without_perishable() {
        // Sparse storage keeps only the eternal part; it must decode alone.
        let body = coinbase_body(80);
        let (_, e) = body.serialize_parts();
        let empty_p =
            bincode::encode_to_vec(PerishablePart::default(), bincode::config::standard()).unwrap();
        let restored = BlockBody::from_parts(&empty_p, &e).unwrap();
        assert_eq!(restored.kernels, body.kernels);
        assert!(restored.inputs.is_empty());
    }

    // ------------------------------------------------------------------
    // Definition
    // ------------------------------------------------------------------

    #[test]
    fn definition_sensitive_to_each_root() {
        let z = Hash256::ZERO;
        let x = Hash256([1; 32]);
        let base = evaluate_definition(&z, &z, &z, &z);
        assert_ne!(base, evaluate_definition(&x, &z, &z, &z));
        assert_ne!(base, evaluate_definition(&z, &x, &z, &z));
        assert_ne!(base, evaluate_definition(&z, &z, &x, &z));
        assert_ne!(base, evaluate_definition(&z, &z, &z, &x));
    }

    // ------------------------------------------------------------------
    // Context verification
    // ------------------------------------------------------------------

    #[test]
    fn balanced_coinbase_block_verifies() {
        let body = coinbase_body(80);
        assert!(verify_full(&body, 1, 80, false));
    }

    #[test]
    fn wrong_subsidy_fails() {
        let body = coinbase_body(80);
        assert!(!verify_full(&body, 1, 81, false));
    }

    #[test]
    fn tampered_offset_fails() {
        let mut body = coinbase_body(80);
        body.offset = ScalarBytes::from_scalar(&(body.offset.to_scalar() + s(1)));
        assert!(!verify_full(&body, 1, 80, false));
    }

    #[test]
    fn unsigned_output_rejected_when_not_allowed() {
        let mut body = coinbase_body(80);
        body.outputs[0] = body.outputs[0].to_naked();
        let mut ctx = VerifyContext::new(1);
        let mut batch = ProofBatch::new();
        let err = ctx
            .validate_slice(&body, 0, 1, false, &mut batch, &mut |_, _| {})
            .unwrap_err();
        assert!(matches!(err, BlockError::MissingRangeProof { index: 0 }));
    }

    #[test]
    fn unsigned_output_allowed_in_sparse_mode() {
        let mut body = coinbase_body(80);
        body.outputs[0] = body.outputs[0].to_naked();
        assert!(verify_full(&body, 1, 80, true));
    }

    #[test]
    fn unsorted_kernels_rejected() {
        let mut body = coinbase_body(80);
        let mut a = Kernel::sign(&s(11), 0, HeightRange::unbounded(), KernelData::Std { relative_lock: None }, vec![]);
        let mut b = Kernel::sign(&s(12), 0, HeightRange::unbounded(), KernelData::Std { relative_lock: None }, vec![]);
        if a.id() > b.id() {
            std::mem::swap(&mut a, &mut b);
        }
        body.kernels = vec![b, a];
        let mut ctx = VerifyContext::new(1);
        let mut batch = ProofBatch::new();
        let err = ctx
            .validate_slice(&body, 0, 1, true, &mut batch, &mut |_, _| {})
            .unwrap_err();
        assert!(matches!(
            err,
            BlockError::Kernel { source: crate::error::KernelError::Unsorted, .. }
        ));
    }

    #[test]
    fn sliced_verification_merges_to_same_sigma() {
        let body = coinbase_body(80);
        let subsidy = 80;

        let mut whole = VerifyContext::new(1);
        let mut batch = ProofBatch::new();
        whole.validate_slice(&body, 0, 1, false, &mut batch, &mut |_, _| {}).unwrap();
        assert_eq!(batch.flush(), RistrettoPoint::identity());
        let full_sigma = whole.close_block(&body.offset.to_scalar(), subsidy);

        let mut merged = VerifyContext::new(1);
        for index in 0..3 {
            let mut part = VerifyContext::new(1);
            let mut batch = ProofBatch::new();
            part.validate_slice(&body, index, 3, false, &mut batch, &mut |_, _| {}).unwrap();
            assert_eq!(batch.flush(), RistrettoPoint::identity());
            merged.merge(&part);
        }
        let merged_sigma = merged.close_block(&body.offset.to_scalar(), subsidy);
        assert_eq!(full_sigma, merged_sigma);
        assert_eq!(merged_sigma, RistrettoPoint::identity());
    }

    #[test]
    fn tx_close_includes_fee() {
        // A fee-paying transaction: input spends 100, output gets 90, fee 10.
        let r_in = Scalar::random(&mut OsRng);
        let r_out = Scalar::random(&mut OsRng);
        let offset = Scalar::random(&mut OsRng);
        let sk = r_out - r_in - offset;

        let input_c = CompressedPoint::from_point(&crate::commitment::commit(100, &r_in, &generator_h()));
        let output = Output::create(90, &r_out, false, 0);
        let kernel = Kernel::sign(&sk, 10, HeightRange::unbounded(), KernelData::Std { relative_lock: None }, vec![]);

        let body = BlockBody {
            offset: ScalarBytes::from_scalar(&offset),
            inputs: vec![Input::new(input_c)],
            outputs: vec![output],
            kernels: vec![kernel],
        };

        let mut ctx = VerifyContext::new(1);
        let mut batch = ProofBatch::new();
        ctx.validate_slice(&body, 0, 1, false, &mut batch, &mut |_, _| {}).unwrap();
        assert_eq!(batch.flush(), RistrettoPoint::identity());
        assert_eq!(ctx.fees, 10);
        assert_eq!(ctx.close_tx(&body.offset.to_scalar()), RistrettoPoint::identity());
    }
}
