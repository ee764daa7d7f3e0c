//! Contextual block interpretation.
//!
//! Applies a validated block's inputs, outputs and kernels forward against
//! the UTXO tree, the MMR accumulators and the store's auxiliary tables, or
//! reverses them exactly using the rollback journal. A partial forward
//! failure automatically reverses the already-applied prefix, so the state
//! a caller observes is all-or-nothing.
//!
//! Anything that fails while interpreting *backward* is corruption: the
//! journal and tables must replay exactly what forward application wrote.

use std::collections::HashSet;

use veil_core::block::{BlockBody, InputRef, Output};
use veil_core::commitment::CompressedPoint;
use veil_core::kernel::{Kernel, KernelData};
use veil_core::rules::{Rules, SigmaCfg};
use veil_core::types::{Hash256, Height, TxoId, GENESIS_HEIGHT};
use veil_core::utxo_tree::UtxoTree;

use crate::error::{ApplyError, ChainError};
use crate::journal::Journal;
use crate::store::{AssetInfo, NodeStore, ParamId};

/// Unique-key prefix of a shielded output serial.
const UNIQUE_SHIELDED_OUT: u8 = 1;
/// Unique-key prefix (the disambiguation bit) of a shielded input spend key.
const UNIQUE_SHIELDED_IN: u8 = 2;

/// The three MMR accumulators.
#[derive(Default)]
pub struct Mmrs {
    pub states: veil_core::mmr::VecMmr,
    pub shielded: veil_core::mmr::VecMmr,
    pub assets: veil_core::mmr::VecMmr,
}

/// Running per-chain counters (the original's `Extra`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Extra {
    /// Total txos ever created (next TxoId), including the per-block gap.
    pub txos: TxoId,
    /// Txos occupied by the treasury, `[0, txos_treasury)`.
    pub txos_treasury: TxoId,
    pub fossil: Height,
    pub txo_lo: Height,
    pub txo_hi: Height,
    /// Shielded pool size (outputs ever inserted).
    pub shielded_outputs: u64,
}

/// Interpretation mode and per-block working state.
pub struct BlockInterpretCtx {
    pub height: Height,
    pub fwd: bool,
    /// Mempool validation: stage unique keys in `dup_keys` instead of the
    /// store, track kernel ids in `dup_ids`, skip MMR/store writes.
    pub validate_only: bool,
    /// Replay of a block validated before (rollback redo); skips contextual
    /// rule checks.
    pub already_validated: bool,
    /// Maintain the kernel-id inclusion index.
    pub save_kid: bool,
    pub update_mmrs: bool,
    /// Maintain the shielded commitment list and its counters.
    pub store_shielded_output: bool,
    pub journal: Journal,
    pub shielded_ins: u32,
    pub shielded_outs: u32,
    /// Live asset count; loaded lazily from the store.
    assets_used: Option<u32>,
    /// Registered asset high-water at block start; asset proofs may not
    /// reference past it.
    pub asset_hi: u32,
    /// Set when a shielded cap failed: retryable, not invalid.
    pub limit_exceeded: bool,
    /// Inputs resolved during forward application, aligned with the body's
    /// input order.
    pub resolved_inputs: Vec<InputRef>,
    dup_keys: Option<HashSet<Vec<u8>>>,
    dup_ids: Option<HashSet<Hash256>>,
}

impl BlockInterpretCtx {
    pub fn new(height: Height, fwd: bool) -> Self {
        Self {
            height,
            fwd,
            validate_only: false,
            already_validated: false,
            save_kid: true,
            update_mmrs: true,
            store_shielded_output: false,
            journal: Journal::new(),
            shielded_ins: 0,
            shielded_outs: 0,
            assets_used: None,
            asset_hi: 0,
            limit_exceeded: false,
            resolved_inputs: Vec::new(),
            dup_keys: None,
            dup_ids: None,
        }
    }

    /// Mempool mode: nothing durable is written.
    pub fn new_validate_only(height: Height) -> Self {
        let mut bic = Self::new(height, true);
        bic.validate_only = true;
        bic.save_kid = false;
        bic.update_mmrs = false;
        bic.dup_keys = Some(HashSet::new());
        bic.dup_ids = Some(HashSet::new());
        bic
    }

    fn ensure_assets_used<S: NodeStore>(&mut self, store: &S) -> Result<u32, ApplyError> {
        if self.assets_used.is_none() {
            self.assets_used =
                Some(store.param_get_u64(ParamId::AssetsCountUsed, 0)? as u32);
        }
        Ok(self.assets_used.expect("just set"))
    }
}

/// Mutable view over everything the interpreter touches.
pub struct StateView<'a, S: NodeStore> {
    pub store: &'a mut S,
    pub utxos: &'a mut UtxoTree,
    pub mmrs: &'a mut Mmrs,
    pub extra: &'a mut Extra,
    pub rules: &'a Rules,
}

impl<S: NodeStore> StateView<'_, S> {
    // ------------------------------------------------------------------
    // Block and tx
    // ------------------------------------------------------------------

    pub fn handle_validated_block(
        &mut self,
        body: &BlockBody,
        bic: &mut BlockInterpretCtx,
    ) -> Result<(), ApplyError> {
        // One artificial txo gap per block, so consecutive blocks never
        // share TxoIds even after cut-through.
        if !bic.fwd {
            if self.extra.txos == 0 {
                return Err(ChainError::Corruption("txo counter underflow").into());
            }
            self.extra.txos -= 1;
        }

        self.handle_validated_tx(body, bic)?;

        if bic.fwd {
            self.extra.txos += 1;
        }
        Ok(())
    }

    pub fn handle_validated_tx(
        &mut self,
        body: &BlockBody,
        bic: &mut BlockInterpretCtx,
    ) -> Result<(), ApplyError> {
        let mut done = [0usize; 3];
        let mut result = Ok(());

        if bic.fwd {
            result = self.apply_vecs_fwd(body, bic, &mut done);
            if result.is_ok() {
                return Ok(());
            }
            bic.fwd = false;
        } else {
            done = [body.inputs.len(), body.outputs.len(), body.kernels.len()];
        }

        // Reverse order: kernels, outputs, inputs. Validate-only kernels
        // wrote nothing durable, so they have nothing to revert.
        if !bic.validate_only {
            for i in (0..done[2]).rev() {
                self.handle_kernel_element(&body.kernels[i], bic)
                    .map_err(into_corruption)?;
            }
        }
        for i in (0..done[1]).rev() {
            self.handle_output(&body.outputs[i], bic).map_err(into_corruption)?;
        }
        for i in (0..done[0]).rev() {
            let spent = bic.resolved_inputs.pop().ok_or(ChainError::Corruption("resolved inputs"))?;
            self.revert_input(&body.inputs[i].commitment, spent)?;
        }

        if result.is_err() {
            bic.fwd = true;
        }
        result
    }

    fn apply_vecs_fwd(
        &mut self,
        body: &BlockBody,
        bic: &mut BlockInterpretCtx,
        done: &mut [usize; 3],
    ) -> Result<(), ApplyError> {
        for inp in &body.inputs {
            let spent = self.apply_input(&inp.commitment, bic.height)?;
            bic.resolved_inputs.push(spent);
            done[0] += 1;
        }
        for out in &body.outputs {
            self.handle_output(out, bic)?;
            done[1] += 1;
        }
        for krn in &body.kernels {
            self.handle_kernel_element(krn, bic)?;
            done[2] += 1;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inputs / outputs
    // ------------------------------------------------------------------

    /// Spend a UTXO with maturity below `height`.
    pub fn apply_input(
        &mut self,
        commitment: &CompressedPoint,
        height: Height,
    ) -> Result<InputRef, ApplyError> {
        let (txo_id, maturity) = self
            .utxos
            .spend(commitment, height - 1)
            .map_err(|_| ApplyError::Invalid)?;
        Ok(InputRef { txo_id, maturity })
    }

    /// Re-insert a spent UTXO at its recorded leaf.
    pub fn revert_input(
        &mut self,
        commitment: &CompressedPoint,
        spent: InputRef,
    ) -> Result<(), ApplyError> {
        self.utxos
            .insert(commitment, spent.maturity, spent.txo_id)
            .map_err(|_| ChainError::Corruption("input revert").into())
    }

    fn handle_output(&mut self, out: &Output, bic: &mut BlockInterpretCtx) -> Result<(), ApplyError> {
        let maturity = out.min_maturity(bic.height, self.rules.coinbase_maturity);

        if bic.fwd {
            if let Some(ap) = &out.asset_proof {
                self.validate_asset_range(ap.begin, ap.n, bic)?;
            }
            let id = self.extra.txos;
            self.utxos
                .insert(&out.commitment, maturity, id)
                .map_err(|_| ApplyError::Invalid)?;
            self.extra.txos += 1;
        } else {
            if self.extra.txos == 0 {
                return Err(ChainError::Corruption("txo counter underflow").into());
            }
            self.extra.txos -= 1;
            self.utxos
                .remove_newest(&out.commitment, maturity)
                .map_err(|_| ChainError::Corruption("output revert"))?;
        }
        Ok(())
    }

    fn validate_asset_range(
        &mut self,
        begin: u32,
        n: u32,
        bic: &mut BlockInterpretCtx,
    ) -> Result<(), ApplyError> {
        if begin == 0 || begin as u64 + n as u64 - 1 > bic.asset_hi as u64 {
            return Err(ApplyError::Invalid);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Kernels
    // ------------------------------------------------------------------

    /// Top-level kernel: duplicate-id rules and the kid index wrap the
    /// recursive dispatch.
    pub fn handle_kernel_element(
        &mut self,
        krn: &Kernel,
        bic: &mut BlockInterpretCtx,
    ) -> Result<(), ApplyError> {
        let id = krn.id();

        if bic.fwd && bic.height >= self.rules.fork2_height && !bic.already_validated {
            if self.find_visible_kernel(&id, bic)?.is_some() {
                return Err(ApplyError::Invalid);
            }
            if bic.validate_only {
                let dup = bic.dup_ids.as_mut().expect("validate-only has dup set");
                if !dup.insert(id) {
                    return Err(ApplyError::Invalid);
                }
            }
        }

        let save_kid = bic.save_kid && bic.height >= GENESIS_HEIGHT;
        if save_kid && !bic.fwd {
            self.store.delete_kernel(&id, bic.height)?;
        }

        self.handle_kernel(krn, bic)?;

        if save_kid && bic.fwd {
            self.store.insert_kernel(&id, bic.height)?;
        }
        Ok(())
    }

    /// Recursive kernel dispatch: nested kernels forward-first, reverse on
    /// the way back.
    fn handle_kernel(&mut self, krn: &Kernel, bic: &mut BlockInterpretCtx) -> Result<(), ApplyError> {
        let mut done = 0usize;
        let mut result = Ok(());

        if bic.fwd {
            for k in &krn.nested {
                if let Err(e) = self.handle_kernel(k, bic) {
                    result = Err(e);
                    break;
                }
                done += 1;
            }
        } else {
            done = krn.nested.len();
        }

        if result.is_ok() {
            result = self.dispatch_kernel(krn, bic);
            if result.is_err() && !bic.fwd {
                return result.map_err(into_corruption);
            }
        }

        // Reverse the applied nested prefix: on a forward failure (prefix
        // only), or unconditionally on the reverse path.
        if (result.is_err() || !bic.fwd) && !bic.validate_only {
            bic.fwd = false;
            for k in krn.nested[..done].iter().rev() {
                self.handle_kernel(k, bic).map_err(into_corruption)?;
            }
            if result.is_err() {
                bic.fwd = true;
            }
        }

        result
    }

    fn dispatch_kernel(&mut self, krn: &Kernel, bic: &mut BlockInterpretCtx) -> Result<(), ApplyError> {
        match &krn.data {
            KernelData::Std { relative_lock } => self.handle_std(relative_lock.as_ref(), bic),
            KernelData::AssetCreate { owner, metadata } => {
                self.handle_asset_create(owner, metadata, bic)
            }
            KernelData::AssetEmit { asset_id, owner, amount } => {
                self.handle_asset_emit(*asset_id, owner, *amount, bic)
            }
            KernelData::AssetDestroy { asset_id, owner } => {
                self.handle_asset_destroy(*asset_id, owner, bic)
            }
            KernelData::ShieldedOutput { serial_pub, commitment, asset_proof, .. } => {
                self.handle_shielded_output(serial_pub, commitment, asset_proof.as_ref(), bic)
            }
            KernelData::ShieldedInput { window_end, spend_proof, .. } => self
                .handle_shielded_input(
                    *window_end,
                    &spend_proof.spend_pk,
                    SigmaCfg { n: spend_proof.n },
                    bic,
                ),
        }
    }

    fn find_visible_kernel(
        &self,
        id: &Hash256,
        bic: &BlockInterpretCtx,
    ) -> Result<Option<Height>, ApplyError> {
        let Some(h) = self.store.find_kernel(id)? else {
            return Ok(None);
        };
        debug_assert!(h <= bic.height);
        if bic.height >= self.rules.fork2_height
            && bic.height - h > self.rules.max_kernel_validity_dh
        {
            // Past fork 2 the visibility horizon is limited.
            return Ok(None);
        }
        Ok(Some(h))
    }

    fn handle_std(
        &mut self,
        lock: Option<&veil_core::kernel::RelativeLock>,
        bic: &mut BlockInterpretCtx,
    ) -> Result<(), ApplyError> {
        if bic.fwd && !bic.already_validated {
            if let Some(lock) = lock {
                let Some(h0) = self.find_visible_kernel(&lock.kernel_id, bic)? else {
                    return Err(ApplyError::Invalid);
                };
                let unlocked_at = h0.saturating_add(lock.lock_delta);
                if unlocked_at > bic.height {
                    return Err(ApplyError::Invalid);
                }
            }
        }
        Ok(())
    }

    // --- assets ---

    fn internal_asset_add(&mut self, info: &AssetInfo) -> Result<(), ApplyError> {
        self.store.asset_add(info)?;
        if self.mmrs.assets.count() < info.id as u64 {
            self.mmrs.assets.resize_to(info.id as u64);
        }
        self.mmrs.assets.replace(info.id as u64 - 1, info.registry_hash());
        Ok(())
    }

    fn internal_asset_del(&mut self, id: u32) -> Result<(), ApplyError> {
        self.store.asset_delete(id)?;
        // Ids are never reused: the slot is zeroed, never reclaimed.
        self.mmrs.assets.replace(id as u64 - 1, Hash256::ZERO);
        Ok(())
    }

    fn handle_asset_create(
        &mut self,
        owner: &CompressedPoint,
        metadata: &[u8],
        bic: &mut BlockInterpretCtx,
    ) -> Result<(), ApplyError> {
        if !bic.already_validated {
            let used = bic.ensure_assets_used(self.store)?;
            if bic.fwd {
                if self.store.asset_find_by_owner(owner)?.is_some() {
                    return Err(ApplyError::Invalid);
                }
                if used >= self.rules.assets.max_count {
                    return Err(ApplyError::Invalid);
                }
                bic.assets_used = Some(used + 1);
            } else {
                bic.assets_used = Some(used.checked_sub(1).ok_or(ChainError::Corruption("assets used"))?);
            }
        }

        if !bic.update_mmrs {
            return Ok(());
        }
        debug_assert!(!bic.validate_only);

        if bic.fwd {
            let id = self.mmrs.assets.count() as u32 + 1;
            let info = AssetInfo {
                id,
                owner: *owner,
                value: 0,
                metadata: metadata.to_vec(),
                lock_height: bic.height,
            };
            self.internal_asset_add(&info)?;
            bic.journal.push_encoded(&id);
        } else {
            let id: u32 = bic.journal.pop_decoded()?;
            if id as u64 != self.mmrs.assets.count() {
                return Err(ChainError::Corruption("asset id on create revert").into());
            }
            self.store.asset_delete(id)?;
            self.mmrs.assets.shrink_to(id as u64 - 1);
        }
        Ok(())
    }

    fn handle_asset_emit(
        &mut self,
        asset_id: u32,
        owner: &CompressedPoint,
        amount: i64,
        bic: &mut BlockInterpretCtx,
    ) -> Result<(), ApplyError> {
        if !bic.fwd && !bic.update_mmrs {
            return Ok(());
        }

        let Some(mut info) = self.store.asset_get(asset_id)? else {
            return Err(ApplyError::Invalid);
        };
        if info.owner != *owner {
            return Err(ApplyError::Invalid);
        }
        if amount == 0 || amount == i64::MIN {
            return Err(ApplyError::Invalid);
        }

        let mut add = amount >= 0;
        let magnitude = amount.unsigned_abs() as u128;
        if !bic.fwd {
            add = !add;
        }

        let was_zero = info.value == 0;
        if add {
            info.value = info.value.checked_add(magnitude).ok_or(ApplyError::Invalid)?;
        } else {
            if info.value < magnitude {
                return Err(ApplyError::Invalid);
            }
            info.value -= magnitude;
        }

        if bic.update_mmrs {
            let is_zero = info.value == 0;
            if is_zero != was_zero {
                if bic.fwd {
                    bic.journal.push_encoded(&info.lock_height);
                    info.lock_height = bic.height;
                } else {
                    info.lock_height = bic.journal.pop_decoded()?;
                }
            }
            self.store.asset_set_value(asset_id, info.value, info.lock_height)?;
            self.mmrs.assets.replace(asset_id as u64 - 1, info.registry_hash());
        }
        Ok(())
    }

    fn handle_asset_destroy(
        &mut self,
        asset_id: u32,
        owner: &CompressedPoint,
        bic: &mut BlockInterpretCtx,
    ) -> Result<(), ApplyError> {
        if !bic.already_validated {
            bic.ensure_assets_used(self.store)?;
        }

        if bic.fwd {
            let Some(info) = self.store.asset_get(asset_id)? else {
                return Err(ApplyError::Invalid);
            };

            if !bic.already_validated {
                if info.owner != *owner {
                    return Err(ApplyError::Invalid);
                }
                if info.value != 0 {
                    return Err(ApplyError::Invalid);
                }
                if info.lock_height + self.rules.assets.lock_period > bic.height {
                    return Err(ApplyError::Invalid);
                }
                let used = bic.assets_used.expect("loaded above");
                bic.assets_used = Some(used.checked_sub(1).ok_or(ApplyError::Invalid)?);
            }

            if bic.update_mmrs {
                self.internal_asset_del(asset_id)?;
                bic.journal.push_encoded(&(info.metadata.clone(), info.lock_height));
            }
        } else {
            if bic.update_mmrs {
                let (metadata, lock_height): (Vec<u8>, Height) = bic.journal.pop_decoded()?;
                let info = AssetInfo { id: asset_id, owner: *owner, value: 0, metadata, lock_height };
                self.internal_asset_add(&info)?;
            }

            if !bic.already_validated {
                let used = bic.ensure_assets_used(self.store)?;
                bic.assets_used = Some(used + 1);
            }
        }
        Ok(())
    }

    // --- shielded pool ---

    fn handle_shielded_output(
        &mut self,
        serial_pub: &CompressedPoint,
        commitment: &CompressedPoint,
        asset_proof: Option<&veil_core::proofs::AssetProof>,
        bic: &mut BlockInterpretCtx,
    ) -> Result<(), ApplyError> {
        let key = unique_key(UNIQUE_SHIELDED_OUT, serial_pub);

        if bic.fwd {
            if bic.shielded_outs >= self.rules.shielded.max_outs {
                bic.limit_exceeded = true;
                return Err(ApplyError::LimitExceeded);
            }
            if let Some(ap) = asset_proof {
                self.validate_asset_range(ap.begin, ap.n, bic)?;
            }

            if bic.validate_only {
                self.validate_unique_no_dup(&key, bic)?;
            } else {
                let packed = bincode::encode_to_vec(
                    (bic.height, self.mmrs.shielded.count(), self.extra.shielded_outputs, commitment.0),
                    bincode::config::standard(),
                )
                .expect("in-memory encode");
                if !self.store.unique_insert(&key, &packed)? {
                    return Err(ApplyError::Invalid);
                }

                if bic.store_shielded_output {
                    // The pool element is commitment + serial key; a failed
                    // decompression contributes the identity (the kernel may
                    // not have been statically verified yet at this point).
                    let pt = commitment.decompress().unwrap_or_default()
                        + serial_pub.decompress().unwrap_or_default();
                    let n = self.extra.shielded_outputs;
                    self.store.shielded_resize(n + 1)?;
                    self.store.shielded_write(n, &[CompressedPoint::from_point(&pt)])?;
                }

                if bic.update_mmrs {
                    self.mmrs.shielded.append(shielded_out_hash(
                        serial_pub,
                        commitment,
                        self.extra.shielded_outputs,
                        bic.height,
                    ));
                }
                self.extra.shielded_outputs += 1;
            }
            bic.shielded_outs += 1;
        } else {
            debug_assert!(!bic.validate_only);
            self.store.unique_delete_strict(&key)?;

            if bic.update_mmrs {
                let count = self.mmrs.shielded.count();
                self.mmrs.shielded.shrink_to(count - 1);
            }
            if bic.store_shielded_output {
                self.store.shielded_resize(self.extra.shielded_outputs - 1)?;
            }
            bic.shielded_outs = bic.shielded_outs.wrapping_sub(1);
            self.extra.shielded_outputs -= 1;
        }

        if bic.store_shielded_output {
            self.store.param_set_u64(ParamId::ShieldedOutputs, self.extra.shielded_outputs)?;
        }
        Ok(())
    }

    fn handle_shielded_input(
        &mut self,
        window_end: TxoId,
        spend_pk: &CompressedPoint,
        cfg: SigmaCfg,
        bic: &mut BlockInterpretCtx,
    ) -> Result<(), ApplyError> {
        let key = unique_key(UNIQUE_SHIELDED_IN, spend_pk);

        if bic.fwd {
            if !bic.already_validated {
                if bic.shielded_ins >= self.rules.shielded.max_ins {
                    bic.limit_exceeded = true;
                    return Err(ApplyError::LimitExceeded);
                }
                if !self.is_shielded_in_pool(window_end, cfg) {
                    return Err(ApplyError::Invalid);
                }
            }

            if bic.validate_only {
                self.validate_unique_no_dup(&key, bic)?;
            } else {
                let packed = bincode::encode_to_vec(
                    (bic.height, self.mmrs.shielded.count()),
                    bincode::config::standard(),
                )
                .expect("in-memory encode");
                if !self.store.unique_insert(&key, &packed)? {
                    return Err(ApplyError::Invalid);
                }
                if bic.update_mmrs {
                    self.mmrs.shielded.append(shielded_in_hash(spend_pk, bic.height));
                }
            }
            bic.shielded_ins += 1;
        } else {
            debug_assert!(!bic.validate_only);
            self.store.unique_delete_strict(&key)?;
            if bic.update_mmrs {
                let count = self.mmrs.shielded.count();
                self.mmrs.shielded.shrink_to(count - 1);
            }
            bic.shielded_ins = bic.shielded_ins.wrapping_sub(1);
        }

        if bic.store_shielded_output {
            debug_assert!(bic.update_mmrs);
            let inputs = self.mmrs.shielded.count() - self.extra.shielded_outputs;
            self.store.param_set_u64(ParamId::ShieldedInputs, inputs)?;
        }
        Ok(())
    }

    /// The pool-window rule: the window must be settled, and the large
    /// config is only accepted while the pool hasn't outgrown its backlog.
    pub fn is_shielded_in_pool(&self, window_end: TxoId, cfg: SigmaCfg) -> bool {
        let r = &self.rules.shielded;
        if !r.enabled {
            return false;
        }
        if window_end > self.extra.shielded_outputs || window_end < cfg.n as u64 {
            return false;
        }
        if cfg != r.proof_min {
            if cfg != r.proof_max {
                return false;
            }
            if self.extra.shielded_outputs > window_end + r.max_window_backlog {
                return false;
            }
        }
        true
    }

    fn validate_unique_no_dup(
        &mut self,
        key: &[u8],
        bic: &mut BlockInterpretCtx,
    ) -> Result<(), ApplyError> {
        let dups = bic.dup_keys.as_mut().expect("validate-only has dup set");
        if dups.contains(key) {
            return Err(ApplyError::Invalid);
        }
        if self.store.unique_find(key)?.is_some() {
            return Err(ApplyError::Invalid);
        }
        dups.insert(key.to_vec());
        Ok(())
    }
}

fn unique_key(prefix: u8, point: &CompressedPoint) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(prefix);
    key.extend_from_slice(&point.0);
    key
}

fn shielded_out_hash(
    serial_pub: &CompressedPoint,
    commitment: &CompressedPoint,
    id: u64,
    height: Height,
) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"veil.shielded.out");
    hasher.update(&serial_pub.0);
    hasher.update(&commitment.0);
    hasher.update(&id.to_le_bytes());
    hasher.update(&height.to_le_bytes());
    Hash256(hasher.finalize().into())
}

fn shielded_in_hash(spend_pk: &CompressedPoint, height: Height) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"veil.shielded.in");
    hasher.update(&spend_pk.0);
    hasher.update(&height.to_le_bytes());
    Hash256(hasher.finalize().into())
}

/// Reverse-path failures mean the journal or tables are inconsistent.
fn into_corruption(e: ApplyError) -> ApplyError {
    match e {
        ApplyError::Fatal(f) => ApplyError::Fatal(f),
        _ => ApplyError::Fatal(ChainError::Corruption("revert failed")),
    }
}
