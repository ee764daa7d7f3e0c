//! Transaction kernels.
//!
//! A kernel is the public, long-lived part of a transaction: it carries the
//! excess commitment proving balance, a fee, a validity height range, an
//! optional payload for asset and shielded-pool operations, and optionally
//! nested kernels. Kernels in a block are sorted by [`Kernel::id`]; the
//! block header commits to the merkle root over those ids.
//!
//! The id covers a kernel's identity fields and its nested ids; proofs and
//! signatures authenticate the kernel but do not contribute to the id (they
//! sign it, so they cannot be part of it).

use curve25519_dalek::Scalar;
use serde::{Deserialize, Serialize};

use crate::commitment::{generator_h, CompressedPoint};
use crate::error::KernelError;
use crate::proofs::{AssetProof, ProofBatch, RangeProof, SchnorrSig, SpendProof};
use crate::types::{Hash256, Height, HeightRange, TxoId};

/// Maximum nesting depth of kernels within kernels.
pub const MAX_KERNEL_DEPTH: u32 = 3;

/// A lock that delays a kernel until some earlier kernel has been on-chain
/// for `lock_delta` blocks.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct RelativeLock {
    /// Id of the kernel this one is locked against.
    pub kernel_id: Hash256,
    /// Minimum height distance from that kernel's inclusion height.
    pub lock_delta: Height,
}

/// Kernel payload, dispatched by subtype.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub enum KernelData {
    /// Plain value-transfer kernel.
    Std { relative_lock: Option<RelativeLock> },
    /// Register a new confidential asset owned by `owner`.
    AssetCreate { owner: CompressedPoint, metadata: Vec<u8> },
    /// Mint (positive) or burn (negative) asset value. `i64::MIN` is
    /// rejected outright: it cannot be negated.
    AssetEmit { asset_id: u32, owner: CompressedPoint, amount: i64 },
    /// Remove a fully-burned asset from the registry.
    AssetDestroy { asset_id: u32, owner: CompressedPoint },
    /// Move value into the shielded pool.
    ShieldedOutput {
        serial_pub: CompressedPoint,
        commitment: CompressedPoint,
        range_proof: RangeProof,
        asset_proof: Option<AssetProof>,
    },
    /// Spend from the shielded pool via a windowed membership proof.
    /// `commitment` re-introduces the withdrawn value on the transparent
    /// side; whatever generator the pool element was committed under
    /// cancels inside the proof relation.
    ShieldedInput {
        /// One past the last pool element covered by the proof window.
        window_end: TxoId,
        commitment: CompressedPoint,
        spend_proof: SpendProof,
    },
}

impl KernelData {
    /// Subtype tag, also the byte folded into the kernel id.
    pub fn subtype(&self) -> u8 {
        match self {
            KernelData::Std { .. } => 0,
            KernelData::AssetCreate { .. } => 1,
            KernelData::AssetEmit { .. } => 2,
            KernelData::AssetDestroy { .. } => 3,
            KernelData::ShieldedOutput { .. } => 4,
            KernelData::ShieldedInput { .. } => 5,
        }
    }
}

/// A transaction kernel.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Kernel {
    /// Excess commitment: the kernel's public key, `sk·G`.
    pub excess: CompressedPoint,
    pub fee: u64,
    /// Heights at which this kernel may be included.
    pub height_range: HeightRange,
    /// Schnorr signature over the kernel id, keyed by `excess`.
    pub signature: SchnorrSig,
    pub data: KernelData,
    pub nested: Vec<Kernel>,
}

impl Kernel {
    /// Build and sign a kernel whose excess is `sk·G`.
    pub fn sign(sk: &Scalar, fee: u64, height_range: HeightRange, data: KernelData, nested: Vec<Kernel>) -> Self {
        let excess = CompressedPoint::from_point(&(crate::commitment::generator_g() * sk));
        let mut krn = Self {
            excess,
            fee,
            height_range,
            signature: SchnorrSig::default(),
            data,
            nested,
        };
        krn.signature = SchnorrSig::sign(sk, krn.id().as_bytes());
        krn
    }

    /// The kernel id: blake3 over identity fields and nested ids.
    pub fn id(&self) -> Hash256 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"veil.kernel");
        hasher.update(&self.excess.0);
        hasher.update(&self.fee.to_le_bytes());
        hasher.update(&self.height_range.min.to_le_bytes());
        hasher.update(&self.height_range.max.to_le_bytes());
        hasher.update(&[self.data.subtype()]);
        match &self.data {
            KernelData::Std { relative_lock } => {
                if let Some(lock) = relative_lock {
                    hasher.update(lock.kernel_id.as_bytes());
                    hasher.update(&lock.lock_delta.to_le_bytes());
                }
            }
            KernelData::AssetCreate { owner, metadata } => {
                hasher.update(&owner.0);
                hasher.update(&(metadata.len() as u64).to_le_bytes());
                hasher.update(metadata);
            }
            KernelData::AssetEmit { asset_id, owner, amount } => {
                hasher.update(&asset_id.to_le_bytes());
                hasher.update(&owner.0);
                hasher.update(&amount.to_le_bytes());
            }
            KernelData::AssetDestroy { asset_id, owner } => {
                hasher.update(&asset_id.to_le_bytes());
                hasher.update(&owner.0);
            }
            KernelData::ShieldedOutput { serial_pub, commitment, .. } => {
                hasher.update(&serial_pub.0);
                hasher.update(&commitment.0);
            }
            KernelData::ShieldedInput { window_end, commitment, spend_proof } => {
                hasher.update(&window_end.to_le_bytes());
                hasher.update(&commitment.0);
                hasher.update(&spend_proof.spend_pk.0);
            }
        }
        for nested in &self.nested {
            hasher.update(nested.id().as_bytes());
        }
        Hash256(hasher.finalize().into())
    }

    /// Context-free verification, minus the shielded spend proof (amortized
    /// by the multi-sigma aggregator, which walks kernels separately).
    ///
    /// Folds the excess signature, shielded-output range proofs and asset
    /// proofs into `batch`; asset-generator weights go to `asset_weights`
    /// keyed by the window's first asset id.
    pub fn verify_batched(
        &self,
        height: Height,
        batch: &mut ProofBatch,
        asset_weights: &mut dyn FnMut(u32, Vec<Scalar>),
    ) -> Result<(), KernelError> {
        self.verify_at_depth(height, 0, batch, asset_weights)
    }

    fn verify_at_depth(
        &self,
        height: Height,
        depth: u32,
        batch: &mut ProofBatch,
        asset_weights: &mut dyn FnMut(u32, Vec<Scalar>),
    ) -> Result<(), KernelError> {
        if depth > MAX_KERNEL_DEPTH {
            return Err(KernelError::NestingTooDeep);
        }
        if self.height_range.is_empty() || !self.height_range.contains(height) {
            return Err(KernelError::InvalidHeightRange);
        }

        let id = self.id();
        self.signature
            .verify_batched(&self.excess, id.as_bytes(), batch)
            .map_err(|_| KernelError::InvalidSignature)?;

        match &self.data {
            KernelData::Std { .. } => {}
            KernelData::AssetCreate { .. } | KernelData::AssetDestroy { .. } => {}
            KernelData::AssetEmit { amount, .. } => {
                if *amount == 0 || *amount == i64::MIN {
                    return Err(KernelError::EmitOutOfRange);
                }
            }
            KernelData::ShieldedOutput { commitment, range_proof, asset_proof, .. } => {
                let gen = match asset_proof {
                    Some(p) => {
                        let weights = p.verify_batched(batch)?;
                        asset_weights(p.begin, weights);
                        p.hgen.decompress().ok_or(KernelError::Proof(crate::error::ProofError::InvalidPoint))?
                    }
                    None => generator_h(),
                };
                range_proof.verify_batched(commitment, &gen, batch)?;
            }
            KernelData::ShieldedInput { .. } => {
                // The spend proof is verified by the shielded aggregator
                // walk, not here.
            }
        }

        let mut prev_id: Option<Hash256> = None;
        for nested in &self.nested {
            let nid = nested.id();
            if let Some(prev) = prev_id {
                if nid <= prev {
                    return Err(KernelError::Unsorted);
                }
            }
            prev_id = Some(nid);
            nested.verify_at_depth(height, depth + 1, batch, asset_weights)?;
        }
        Ok(())
    }

    /// Stand-alone verification (asset-generator side evaluated inline).
    pub fn verify(&self, height: Height) -> bool {
        use curve25519_dalek::traits::Identity;
        use curve25519_dalek::RistrettoPoint;

        let mut batch = ProofBatch::new();
        let mut pending: Vec<(u32, Vec<Scalar>)> = Vec::new();
        if self
            .verify_batched(height, &mut batch, &mut |begin, w| pending.push((begin, w)))
            .is_err()
        {
            return false;
        }
        for (begin, weights) in pending {
            for (i, w) in weights.iter().enumerate() {
                batch.add_point(*w, crate::commitment::asset_generator(begin + i as u32));
            }
        }
        batch.flush() == RistrettoPoint::identity()
    }

    /// Walk this kernel and all nested kernels, depth-first.
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a Kernel)) {
        f(self);
        for nested in &self.nested {
            nested.walk(f);
        }
    }
}

/// Merkle root over the ids of a block's kernels (the header's `kernels`
/// commitment).
pub fn kernel_commitment(kernels: &[Kernel]) -> Hash256 {
    let ids: Vec<Hash256> = kernels.iter().map(Kernel::id).collect();
    crate::mmr::merkle_root(&ids)
}
