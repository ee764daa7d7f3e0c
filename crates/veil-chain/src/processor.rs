//! The block processor: canonical arbiter of chain validity.
//!
//! Owns the chain-state cursor, the UTXO tree and the MMR accumulators;
//! ingests headers and block bodies delivered by the networking layer;
//! selects the functional tip with the most accumulated work and atomically
//! transitions the persistent state onto it, verifying every block's
//! cryptographic and consensus constraints along the way; drives fast-sync
//! through the sparse regime below TxoLo; and prunes historical data
//! outside the configured horizons.

use curve25519_dalek::traits::Identity;
use curve25519_dalek::RistrettoPoint;
use rand::RngCore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use veil_core::block::{evaluate_definition, BlockBody, EternalPart, Output};
use veil_core::commitment::{CompressedPoint, ScalarBytes};
use veil_core::difficulty::{moving_median_timestamp, next_difficulty, HeaderSample};
use veil_core::rules::Rules;
use veil_core::types::{
    BlockHeader, ChainWork, Difficulty, Hash256, Height, PeerId, StateId, TxoId, GENESIS_HEIGHT,
    MAX_HEIGHT,
};
use veil_core::utxo_tree::UtxoTree;

use crate::congestion::{CongestionCache, TipCongestion};
use crate::error::{ApplyError, ChainError, DataStatus};
use crate::executor::Executor;
use crate::interpreter::{BlockInterpretCtx, Extra, Mmrs, StateView};
use crate::journal::Journal;
use crate::multiblock::MultiblockVerifier;
use crate::recent::RecentStates;
use crate::store::{
    is_unspent, state_flags, NodeStore, ParamId, RowId, StateInput, StoreError, TipInfo,
};

/// Retention horizons, in height offsets behind the cursor.
#[derive(Clone, Copy, Debug)]
pub struct Horizon {
    /// Inferior branches are culled once this far behind.
    pub branching: Height,
    /// What we serve to fast-syncing peers.
    pub sync_lo: Height,
    pub sync_hi: Height,
    /// What we keep for ourselves.
    pub local_lo: Height,
    pub local_hi: Height,
}

impl Horizon {
    /// Keep everything.
    pub fn infinite() -> Self {
        Self {
            branching: MAX_HEIGHT,
            sync_lo: MAX_HEIGHT,
            sync_hi: MAX_HEIGHT,
            local_lo: MAX_HEIGHT,
            local_hi: MAX_HEIGHT,
        }
    }

    /// The standard fast-sync profile, derived from the rollback bound.
    pub fn std_fast_sync(rules: &Rules) -> Self {
        let r = rules.max_rollback;
        Self {
            branching: (r / 4).max(1),
            sync_hi: r,
            sync_lo: r * 3,
            local_hi: r * 2,
            local_lo: r * 180,
        }
    }

    /// Enforce the ordering invariants; idempotent.
    pub fn normalize(&mut self, rules: &Rules) {
        self.branching = self.branching.max(1);
        self.sync_hi = self.sync_hi.max(rules.max_rollback).max(self.branching);
        self.sync_lo = self.sync_lo.max(self.sync_hi);
        // Sync.Lo must exceed Sync.Hi, at least by 1: peers generating the
        // boundary block have been observed to produce it incorrectly when
        // the two coincide.
        if self.sync_lo == self.sync_hi && self.sync_hi < MAX_HEIGHT {
            self.sync_lo += 1;
        }
        self.local_hi = self.local_hi.max(self.sync_hi);
        self.local_lo = self.local_lo.max(self.local_hi).max(self.sync_lo);
    }
}

/// Start-up options.
#[derive(Clone, Copy, Debug, Default)]
pub struct StartParams {
    pub check_integrity: bool,
    pub vacuum: bool,
}

/// Persisted fast-sync state. Zeroed target height means "not syncing".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct SyncData {
    pub h0: Height,
    pub txo_lo: Height,
    pub target_height: Height,
    pub target_row: RowId,
    /// Running aggregated sigma over the sparse blocks applied so far.
    pub sigma: CompressedPoint,
}

impl SyncData {
    pub fn is_active(&self) -> bool {
        self.target_height != 0
    }
}

/// The chain-state cursor: where the active chain currently ends.
#[derive(Clone, Debug, Default)]
pub struct Cursor {
    /// 0 when the chain is empty.
    pub row: RowId,
    pub height: Height,
    pub full: Option<BlockHeader>,
    /// Cursor header hash; [`Hash256::ZERO`] (prehistoric) when empty.
    pub id_hash: Hash256,
    /// History root over `[genesis, height - 1]`.
    pub history: Hash256,
    /// History root including the cursor itself — what the next header's
    /// `history` field must equal.
    pub history_next: Hash256,
    pub difficulty_next: Difficulty,
    pub chain_work: ChainWork,
}

/// Out-edges into the rest of the node.
pub trait ProcessorEvents {
    /// Ask the networking layer for a header (`is_block = false`) or a body.
    fn request_data(&mut self, _id: StateId, _is_block: bool, _target: StateId) {}
    /// The peer supplied provably bad data.
    fn on_peer_insane(&mut self, _peer: PeerId) {}
    /// The cursor advanced.
    fn on_new_state(&mut self) {}
    /// The cursor went backward; dependent subsystems must invalidate.
    fn on_rolled_back(&mut self) {}
    fn on_fast_sync_over(&mut self) {}
    fn on_event(&mut self, _height: Height, _key: &[u8], _body: &[u8]) {}
}

/// No-op event sink.
pub struct NullEvents;

impl ProcessorEvents for NullEvents {}

/// Processor construction options.
pub struct ProcessorConfig {
    pub rules: Rules,
    pub horizon: Horizon,
    pub start: StartParams,
    /// Path of the UTXO image file; `None` disables the image (the tree is
    /// rebuilt from the store on every start).
    pub utxo_image_path: Option<PathBuf>,
    /// 0 = one verifier per available core.
    pub verifier_threads: u32,
}

impl ProcessorConfig {
    pub fn for_tests() -> Self {
        Self {
            rules: Rules::for_tests(),
            horizon: Horizon::infinite(),
            start: StartParams::default(),
            utxo_image_path: None,
            verifier_threads: 2,
        }
    }
}

pub struct Processor<S: NodeStore> {
    store: S,
    events: Box<dyn ProcessorEvents>,
    rules: Rules,
    pub horizon: Horizon,
    executor: Arc<Executor>,
    cursor: Cursor,
    extra: Extra,
    sync_data: SyncData,
    mmrs: Mmrs,
    utxos: UtxoTree,
    utxos_unsaved: bool,
    recent: RecentStates,
    congestion: CongestionCache,
    utxo_image_path: Option<PathBuf>,
}

impl<S: NodeStore> std::fmt::Debug for Processor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor").finish_non_exhaustive()
    }
}

impl<S: NodeStore> Processor<S> {
    // ==================================================================
    // Initialization
    // ==================================================================

    pub fn initialize(
        mut store: S,
        events: Box<dyn ProcessorEvents>,
        mut config: ProcessorConfig,
    ) -> Result<Self, ChainError> {
        store.begin()?;

        if config.start.check_integrity {
            info!("DB integrity check...");
            store.check_integrity()?;
        }

        let rules = config.rules;
        let checksum = rules_checksum(&rules);
        match store.param_get(ParamId::CfgChecksum)? {
            Some(prev) if prev != checksum.as_bytes() => {
                return Err(ChainError::Corruption("incompatible data configuration"));
            }
            Some(_) => {}
            None => store.param_set(ParamId::CfgChecksum, Some(checksum.as_bytes()))?,
        }

        let mut extra = Extra {
            txos: 0,
            txos_treasury: store.param_get_u64(ParamId::Treasury, 1)?,
            fossil: store.param_get_u64(ParamId::FossilHeight, 0)?,
            txo_lo: store.param_get_u64(ParamId::TxoLo, 0)?,
            txo_hi: store.param_get_u64(ParamId::TxoHi, 0)?,
            shielded_outputs: store.param_get_u64(ParamId::ShieldedOutputs, 0)?,
        };
        let shielded_inputs = store.param_get_u64(ParamId::ShieldedInputs, 0)?;

        let sync_data = match store.param_get(ParamId::SyncData)? {
            Some(bytes) => {
                let (sd, _): (SyncData, usize) =
                    bincode::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(|_| ChainError::Corruption("sync data"))?;
                sd
            }
            None => SyncData::default(),
        };
        if sync_data.is_active() {
            info!(target_height = sync_data.target_height, "fast-sync mode");
        }

        let cursor_row = store.get_cursor_row()?;
        let cursor_height = match cursor_row {
            Some(row) => store.get_state(row)?.height,
            None => 0,
        };

        let mut mmrs = Mmrs {
            states: load_mmr(&store, ParamId::MmrStates)?,
            shielded: load_mmr(&store, ParamId::MmrShielded)?,
            assets: load_mmr(&store, ParamId::MmrAssets)?,
        };
        let expected_states = cursor_height.saturating_sub(GENESIS_HEIGHT);
        if mmrs.states.count() != expected_states {
            mmrs.states = rebuild_states_mmr(&store, cursor_height)?;
        }
        if mmrs.shielded.count() != extra.shielded_outputs + shielded_inputs {
            return Err(ChainError::Corruption("shielded mmr count"));
        }

        let da = &rules.da;
        let recent_capacity =
            (da.window_work + da.window_median0 + da.window_median1) as usize + 16;

        config.horizon.normalize(&rules);

        let executor = if config.verifier_threads == 0 {
            Arc::new(Executor::with_default_threads())
        } else {
            Arc::new(Executor::new(config.verifier_threads))
        };

        let mut p = Self {
            store,
            events,
            rules,
            horizon: config.horizon,
            executor,
            cursor: Cursor::default(),
            extra,
            sync_data,
            mmrs,
            utxos: UtxoTree::new(),
            utxos_unsaved: false,
            recent: RecentStates::new(recent_capacity),
            congestion: CongestionCache::default(),
            utxo_image_path: config.utxo_image_path,
        };

        p.init_cursor(false)?;
        p.initialize_utxos()?;

        extra = p.extra;
        extra.txos = p.get_txos_before(p.cursor.height + 1)?;
        p.extra = extra;

        p.prune_old()?;
        if config.start.vacuum {
            p.commit_db()?;
            info!("DB compacting...");
            p.store.vacuum()?;
            p.store.begin()?;
            info!("DB compacting completed");
        }

        p.try_go_up()?;
        Ok(p)
    }

    /// Open the UTXO image (discarding it on stamp or definition mismatch)
    /// or rebuild the tree from the txos table.
    fn initialize_utxos(&mut self) -> Result<(), ChainError> {
        if let Some(path) = self.utxo_image_path.clone() {
            let stored_stamp = self.store.param_get(ParamId::UtxoStamp)?;
            if let (Ok((stamp, tree)), Some(stored)) =
                (UtxoTree::load_image(&path), stored_stamp)
            {
                if self.cursor.height >= GENESIS_HEIGHT && stored == stamp {
                    info!("UTXO image found");
                    self.utxos = tree;
                    if self.test_definition() {
                        return Ok(());
                    }
                    warn!("definition mismatch, discarding UTXO image");
                } else {
                    warn!("UTXO image stamp mismatch, discarding");
                }
            }
        }

        info!("rebuilding UTXO image...");
        self.rebuild_utxo_tree()?;
        if !self.test_definition() {
            return Err(ChainError::Corruption("utxo rebuild definition mismatch"));
        }
        Ok(())
    }

    fn rebuild_utxo_tree(&mut self) -> Result<(), ChainError> {
        self.utxos = UtxoTree::new();
        self.utxos_unsaved = true;
        for rec in self.store.enum_txos(0)? {
            if !is_unspent(&rec) {
                continue;
            }
            let out = decode_output(&rec.value)?;
            let h_create = self.txo_create_height(rec.id)?;
            self.utxos
                .insert(&out.commitment, out.min_maturity(h_create, self.rules.coinbase_maturity), rec.id)
                .map_err(|_| ChainError::Corruption("utxo rebuild insert"))?;
        }
        Ok(())
    }

    fn txo_create_height(&self, id: TxoId) -> Result<Height, ChainError> {
        if id < self.extra.txos_treasury {
            return Ok(0);
        }
        let (_, height) = self
            .store
            .find_state_by_txo_id(id)?
            .ok_or(ChainError::Corruption("txo without creating state"))?;
        Ok(height)
    }

    /// Seed treasury outputs at ids `[current, current + outputs.len())`.
    /// Only valid on an empty chain.
    pub fn bootstrap_treasury(&mut self, outputs: &[Output]) -> Result<(), ChainError> {
        if self.cursor.height >= GENESIS_HEIGHT {
            return Err(ChainError::Corruption("treasury after genesis"));
        }
        for out in outputs {
            let id = self.extra.txos;
            let bytes = bincode::encode_to_vec(out, bincode::config::standard())
                .expect("in-memory encode");
            self.store.txo_add(id, &bytes)?;
            self.utxos
                .insert(&out.commitment, out.min_maturity(0, self.rules.coinbase_maturity), id)
                .map_err(|_| ChainError::Corruption("treasury insert"))?;
            self.extra.txos += 1;
        }
        self.extra.txos_treasury = self.extra.txos;
        self.utxos_unsaved = true;
        self.store.param_set_u64(ParamId::Treasury, self.extra.txos_treasury)?;
        self.events.on_new_state();
        Ok(())
    }

    // ==================================================================
    // Accessors
    // ==================================================================

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    pub fn extra(&self) -> &Extra {
        &self.extra
    }

    pub fn rules(&self) -> &Rules {
        &self.rules
    }

    pub fn sync_data(&self) -> &SyncData {
        &self.sync_data
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Shut down, releasing the store (commits nothing).
    pub fn into_store(self) -> S {
        self.store
    }

    pub fn is_fast_sync(&self) -> bool {
        self.sync_data.is_active()
    }

    /// Current UTXO commitment root.
    pub fn utxos_root(&mut self) -> Hash256 {
        self.utxos.root()
    }

    /// Total txos existing before block `h`.
    pub fn get_txos_before(&self, h: Height) -> Result<TxoId, ChainError> {
        if h <= GENESIS_HEIGHT {
            return Ok(self.extra.txos_treasury);
        }
        let row = self
            .store
            .find_active_state(h - 1)?
            .ok_or(ChainError::Corruption("no active state below height"))?;
        self.store
            .get_state_txos(row)?
            .ok_or(ChainError::Corruption("active state without txo count"))
    }

    /// Below this height, arriving data can no longer be used.
    pub fn get_lowest_return_height(&self) -> Height {
        let h0 = if self.is_fast_sync() { self.sync_data.h0 } else { self.cursor.height };
        self.extra.txo_hi.max(h0.saturating_sub(self.rules.max_rollback))
    }

    // ==================================================================
    // Cursor and definition
    // ==================================================================

    fn init_cursor(&mut self, moving_up: bool) -> Result<(), ChainError> {
        match self.store.get_cursor_row()? {
            Some(row) => {
                if moving_up {
                    debug_assert_eq!(self.cursor.row, row);
                    self.cursor.history = self.cursor.history_next;
                } else {
                    self.cursor.row = row;
                    self.cursor.full = Some(self.store.get_state(row)?);
                    self.cursor.history = self.mmrs.states.root();
                }
                let full = self
                    .cursor
                    .full
                    .clone()
                    .ok_or(ChainError::Corruption("cursor header"))?;
                self.cursor.height = full.height;
                self.cursor.id_hash = full.hash();
                self.cursor.chain_work = full.chain_work;
                self.cursor.history_next = self.mmrs.states.predicted_root(self.cursor.id_hash);
            }
            None => {
                self.mmrs.states.shrink_to(0);
                self.cursor = Cursor::default();
            }
        }
        self.cursor.difficulty_next = self.next_difficulty()?;
        Ok(())
    }

    fn header_at(&self, height: Height) -> Result<BlockHeader, ChainError> {
        if let Some((_, header)) = self.recent.get(height) {
            return Ok(header.clone());
        }
        let row = self
            .store
            .find_active_state(height)?
            .ok_or(ChainError::Corruption("active header missing"))?;
        Ok(self.store.get_state(row)?)
    }

    /// Prefetch the header window the retarget formulas read.
    fn difficulty_samples(&self) -> Result<(Height, Vec<HeaderSample>), ChainError> {
        if self.cursor.height < GENESIS_HEIGHT {
            return Ok((GENESIS_HEIGHT, Vec::new()));
        }
        let da = &self.rules.da;
        let span = (da.window_work + da.window_median0.max(da.window_median1)) as Height + 1;
        let start = self.cursor.height.saturating_sub(span - 1).max(GENESIS_HEIGHT);
        let mut samples = Vec::with_capacity((self.cursor.height - start + 1) as usize);
        for h in start..=self.cursor.height {
            let header = self.header_at(h)?;
            samples.push(HeaderSample { timestamp: header.timestamp, chain_work: header.chain_work });
        }
        Ok((start, samples))
    }

    fn next_difficulty(&self) -> Result<Difficulty, ChainError> {
        let (start, samples) = self.difficulty_samples()?;
        let get = move |h: Height| samples[(h - start) as usize];
        Ok(next_difficulty(self.cursor.height, &get, &self.rules))
    }

    fn moving_median(&self) -> Result<u64, ChainError> {
        if self.cursor.height < GENESIS_HEIGHT {
            return Ok(0);
        }
        let (start, samples) = self.difficulty_samples()?;
        let get = move |h: Height| samples[(h - start) as usize];
        Ok(moving_median_timestamp(self.cursor.height, &get, &self.rules))
    }

    /// Whether the cursor's recorded definition matches the recomputed one.
    /// Vacuously true below the sparse horizon.
    pub fn test_definition(&mut self) -> bool {
        if self.cursor.height < GENESIS_HEIGHT || self.cursor.height < self.sync_data.txo_lo {
            return true;
        }
        let Some(full) = self.cursor.full.clone() else { return true };
        let def = evaluate_definition(
            &self.cursor.history,
            &self.utxos.root(),
            &self.mmrs.shielded.root(),
            &self.mmrs.assets.root(),
        );
        full.definition == def
    }

    fn state_view(&mut self) -> StateView<'_, S> {
        StateView {
            store: &mut self.store,
            utxos: &mut self.utxos,
            mmrs: &mut self.mmrs,
            extra: &mut self.extra,
            rules: &self.rules,
        }
    }

    // ==================================================================
    // Ingestion
    // ==================================================================

    pub fn on_state(&mut self, header: &BlockHeader, peer: PeerId) -> Result<DataStatus, ChainError> {
        let id = header.id();
        if !header.is_valid() {
            warn!(%id, "header invalid");
            return Ok(DataStatus::Invalid);
        }

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        if header.timestamp > now {
            let ahead = header.timestamp - now;
            if ahead > self.rules.da.max_ahead_s {
                warn!(%id, ahead, "timestamp ahead of wall clock");
                return Ok(DataStatus::Invalid);
            }
        }

        if header.height < self.get_lowest_return_height() {
            return Ok(DataStatus::Unreachable);
        }
        if self.store.state_find(&id)?.is_some() {
            return Ok(DataStatus::Rejected);
        }

        self.store.insert_state(header, peer)?;
        info!(%id, "header accepted");
        Ok(DataStatus::Accepted)
    }

    pub fn on_block(
        &mut self,
        id: &StateId,
        perishable: &[u8],
        eternal: &[u8],
        peer: PeerId,
    ) -> Result<DataStatus, ChainError> {
        let Some(row) = self.store.state_find(id)? else {
            warn!(%id, "block unexpected");
            return Ok(DataStatus::Rejected);
        };

        let size = perishable.len() + eternal.len();
        if size > self.rules.max_body_size {
            warn!(%id, size, "block too large");
            return Ok(DataStatus::Invalid);
        }
        if self.store.get_state_flags(row)? & state_flags::FUNCTIONAL != 0 {
            debug!(%id, "block already received");
            return Ok(DataStatus::Rejected);
        }
        if id.height < self.get_lowest_return_height() {
            return Ok(DataStatus::Unreachable);
        }

        self.store.set_state_block(row, perishable, eternal, peer)?;
        self.store.set_state_functional(row)?;
        Ok(DataStatus::Accepted)
    }

    // ==================================================================
    // Fork choice
    // ==================================================================

    /// Move onto the functional tip with the most accumulated work.
    pub fn try_go_up(&mut self) -> Result<(), ChainError> {
        let start_row = self.cursor.row;
        let mut dirty = false;

        loop {
            let tips = self.store.enum_functional_tips()?;
            let Some(best) = tips.first().copied() else { break };
            debug_assert!(best.chain_work >= self.cursor.chain_work);
            if best.chain_work <= self.cursor.chain_work {
                break;
            }
            self.try_go_to(best)?;
            dirty = true;
        }

        if dirty {
            self.prune_old()?;
            if self.cursor.row != start_row {
                self.events.on_new_state();
            }
        }
        self.commit_db()?;
        Ok(())
    }

    fn try_go_to(&mut self, target: TipInfo) -> Result<(), ChainError> {
        // Resolve the path down to the common (active) ancestor.
        let mut path: Vec<RowId> = Vec::new();
        let mut row = target.row;
        let mut branch_h = 0;
        loop {
            path.push(row);
            match self.store.get_prev_row(row)? {
                None => break,
                Some(prev) => {
                    if self.store.get_state_flags(prev)? & state_flags::ACTIVE != 0 {
                        branch_h = self.store.get_state(prev)?.height;
                        break;
                    }
                    row = prev;
                }
            }
        }
        path.reverse(); // apply order, lowest first

        self.rollback_to(branch_h)?;

        let id0 = self.get_txos_before(self.sync_data.h0 + 1)?;
        let initial_sigma = if self.is_fast_sync() {
            Some(
                self.sync_data
                    .sigma
                    .decompress()
                    .unwrap_or_else(RistrettoPoint::identity),
            )
        } else {
            None
        };
        let mut mbc =
            MultiblockVerifier::new(Arc::clone(&self.executor), self.cursor.height, id0, initial_sigma);

        let mut context_fail = false;
        let mut keep_blocks = false;
        let mut idx = 0usize;
        let mut fail_h = self.cursor.height;

        while idx < path.len() {
            let row = path[idx];
            let height = self.cursor.height + 1;
            let header = self.store.get_state(row)?;
            debug_assert_eq!(header.height, height);

            match self.handle_block(row, &header, &mut mbc)? {
                true => {}
                false => {
                    context_fail = true;
                    mbc.set_failed();
                    if height == self.sync_data.txo_lo {
                        self.fast_sync_failed_on_lo(&mut mbc)?;
                    }
                    fail_h = height;
                    break;
                }
            }

            // Advance the cursor onto the applied block.
            if self.cursor.height >= GENESIS_HEIGHT {
                self.mmrs.states.append(self.cursor.id_hash);
            }
            self.store.move_fwd(row)?;
            self.cursor.row = row;
            self.cursor.full = Some(header);
            self.init_cursor(true)?;
            idx += 1;
            fail_h = height;

            if self.is_fast_sync() {
                self.store.del_state_block_pp(row)?; // save space
            }

            if mbc.in_progress().max == self.sync_data.target_height {
                if self.mbc_flush(&mut mbc)? {
                    self.on_fast_sync_over(&mut mbc, &mut context_fail)?;
                    if mbc.failed() {
                        keep_blocks = true;
                    }
                }
            }
            if mbc.failed() {
                break;
            }
        }

        if self.mbc_flush(&mut mbc)? {
            return Ok(()); // at position
        }

        if !context_fail {
            warn!("context-free verification failed");
        }

        self.rollback_to(mbc.in_progress().min - 1)?;

        if keep_blocks {
            return Ok(());
        }

        // Blame the peer and extend the deletion range over its consecutive
        // blocks above the failure point.
        let mut top_h = fail_h;
        if !mbc.pid_last.is_zero() {
            let pid = mbc.pid_last;
            self.events.on_peer_insane(pid);
            let mut j = (top_h - branch_h) as usize; // index of next path entry
            while j < path.len() {
                match self.store.get_peer(path[j])? {
                    Some(p) if p == pid => {
                        top_h += 1;
                        j += 1;
                    }
                    _ => break,
                }
            }
        }

        if top_h > self.cursor.height {
            info!(from = self.cursor.height + 1, to = top_h, "deleting blocks range");
            let top_row = path[(top_h - branch_h - 1) as usize];
            self.delete_blocks_in_range(top_row, top_h, self.cursor.height)?;
        }
        Ok(())
    }

    /// Validate a block's header in context, push it for context-free
    /// verification and interpret it. `Ok(false)` = invalid, recoverable.
    fn handle_block(
        &mut self,
        row: RowId,
        header: &BlockHeader,
        mbc: &mut MultiblockVerifier,
    ) -> Result<bool, ChainError> {
        let height = header.height;
        let (p, e, _) = self.store.get_state_block(row)?;
        let eternal = e.ok_or(ChainError::Corruption("missing eternal body"))?;
        let perishable = p.unwrap_or_default();

        let body = match BlockBody::from_parts(&perishable, &eternal) {
            Ok(b) => b,
            Err(_) => {
                warn!(height, "block deserialization failed");
                return Ok(false);
            }
        };

        let first_time = self.store.get_state_txos(row)?.is_none();
        if first_time {
            let pid = self.store.get_peer(row)?.unwrap_or(PeerId::ZERO);
            if mbc.needs_flush_before(pid, self.sync_data.txo_lo) && !self.mbc_flush(mbc)? {
                return Ok(false);
            }

            let expected_work = self.cursor.chain_work + header.difficulty.0 as ChainWork;
            if header.chain_work != expected_work {
                warn!(height, expected = %expected_work, actual = %header.chain_work, "chain work mismatch");
                return Ok(false);
            }
            if header.difficulty != self.cursor.difficulty_next {
                warn!(height, expected = %self.cursor.difficulty_next, actual = %header.difficulty, "difficulty mismatch");
                return Ok(false);
            }
            if header.timestamp <= self.moving_median()? {
                warn!(height, "timestamp inconsistent wrt median");
                return Ok(false);
            }
            if header.history != self.cursor.history_next {
                warn!(height, "history commitment mismatch");
                return Ok(false);
            }
            if body.kernel_commitment() != header.kernels {
                warn!(height, "kernel commitment mismatch");
                return Ok(false);
            }

            let sparse = height <= self.sync_data.txo_lo;
            let allow_unsigned = self.is_fast_sync() && height <= self.sync_data.target_height;
            let size = perishable.len() + eternal.len();
            mbc.push_block(
                pid,
                Arc::new(body.clone()),
                height,
                size,
                sparse,
                allow_unsigned,
                self.rules.coinbase_emission,
            );
        }

        let id0 = self.extra.txos;
        let mut bic = BlockInterpretCtx::new(height, true);
        bic.asset_hi = self.mmrs.assets.count() as u32;
        bic.already_validated = !first_time;
        bic.store_shielded_output = true;

        let applied = {
            let mut view = self.state_view();
            view.handle_validated_block(&body, &mut bic)
        };
        match applied {
            Ok(()) => {}
            Err(ApplyError::Invalid) | Err(ApplyError::LimitExceeded) => {
                debug_assert!(first_time);
                warn!(height, "block invalid in its context");
                return Ok(false);
            }
            Err(ApplyError::Fatal(e)) => return Err(e),
        }

        if first_time {
            let mut ok = true;

            if height >= self.sync_data.txo_lo {
                let def = evaluate_definition(
                    &self.cursor.history_next,
                    &self.utxos.root(),
                    &self.mmrs.shielded.root(),
                    &self.mmrs.assets.root(),
                );
                if header.definition != def {
                    warn!(height, "header definition mismatch");
                    ok = false;
                }
            }

            if height <= self.sync_data.txo_lo {
                // Sparse blocks may only spend outputs predating the window.
                if bic.resolved_inputs.iter().any(|r| r.txo_id >= mbc.id0) {
                    warn!(height, "invalid input in sparse block");
                    ok = false;
                }
            }

            if !ok {
                bic.fwd = false;
                let mut view = self.state_view();
                view.handle_validated_block(&body, &mut bic)
                    .map_err(|_| ChainError::Corruption("failed to reverse block"))?;
                return Ok(false);
            }
        }

        // Persist apply artifacts.
        let mut offs = body.offset.to_scalar();
        if height > GENESIS_HEIGHT {
            let prev = self
                .store
                .get_prev_row(row)?
                .ok_or(ChainError::Corruption("missing prev state"))?;
            let prev_offs = self
                .store
                .get_state_extra(prev)?
                .ok_or(ChainError::Corruption("missing prev offset"))?;
            offs += prev_offs.to_scalar();
        }
        self.store.set_state_txos_extra(
            row,
            Some(self.extra.txos),
            Some(ScalarBytes::from_scalar(&offs)),
            Some(bic.journal.as_bytes()),
        )?;

        let mut spent = Vec::with_capacity(body.inputs.len());
        for (inp, resolved) in body.inputs.iter().zip(&bic.resolved_inputs) {
            self.store.txo_set_spent(resolved.txo_id, height)?;
            spent.push(StateInput { txo_id: resolved.txo_id, commitment: inp.commitment });
        }
        if !spent.is_empty() {
            self.store.set_state_inputs(row, &spent)?;
        }

        for (i, out) in body.outputs.iter().enumerate() {
            let bytes = bincode::encode_to_vec(out, bincode::config::standard())
                .expect("in-memory encode");
            self.store.txo_add(id0 + i as u64, &bytes)?;
        }

        self.utxos_unsaved = true;
        self.recent.push(row, header.clone());
        Ok(true)
    }

    /// Flush the multiblock context: drain batches, run the aggregators,
    /// and in fast-sync close (or carry) the sparse sigma.
    fn mbc_flush(&mut self, mbc: &mut MultiblockVerifier) -> Result<bool, ChainError> {
        if mbc.failed() {
            return Ok(false);
        }
        if mbc.in_progress().is_empty() && !mbc.batch_dirty() {
            return Ok(true);
        }

        if mbc.batch_dirty() {
            let mut total = mbc.drain_thread_batches();
            if mbc.failed() {
                return Ok(false);
            }

            {
                let store = &self.store;
                total += mbc.msc_calculate(&mut |base, min, max| {
                    let compressed = store.shielded_read(base + min as u64, (max - min) as u64)?;
                    compressed
                        .iter()
                        .map(|c| c.decompress().ok_or(StoreError::Corruption("shielded point")))
                        .collect()
                })?;
            }
            total += mbc.mac_calculate()?;

            if total != RistrettoPoint::identity() {
                mbc.set_failed();
                return Ok(false);
            }
        } else {
            self.executor.flush(0);
            if mbc.failed() {
                return Ok(false);
            }
        }

        if self.is_fast_sync() {
            let sigma = mbc.sparse_sigma();
            if mbc.in_progress().max == self.sync_data.txo_lo {
                if sigma != RistrettoPoint::identity() {
                    mbc.set_failed();
                    self.fast_sync_failed_on_lo(mbc)?;
                    return Ok(false);
                }
                mbc.reset_sparse_sigma();
            }
            self.sync_data.sigma = CompressedPoint::from_point(&mbc.sparse_sigma());
            self.save_sync_data()?;
        }

        mbc.advance_min();
        Ok(true)
    }

    // ==================================================================
    // Fast sync
    // ==================================================================

    fn on_fast_sync_over(
        &mut self,
        mbc: &mut MultiblockVerifier,
        context_fail: &mut bool,
    ) -> Result<(), ChainError> {
        debug_assert_eq!(mbc.in_progress().max, self.sync_data.target_height);
        mbc.pid_last = PeerId::ZERO; // don't blame the last peer by default

        // Any surviving naked output means its range proof was never (and
        // can never be) verified: the sparse window was invalid.
        let mut fail_sid: Option<(RowId, Height)> = None;
        for rec in self.store.enum_txos(mbc.id0)? {
            if !is_unspent(&rec) {
                continue;
            }
            if decode_output(&rec.value)?.is_naked() {
                mbc.set_failed();
                *context_fail = true;
                fail_sid = self.store.find_state_by_txo_id(rec.id)?;
                break;
            }
        }

        if mbc.failed() {
            warn!("fast-sync failed");
            if let Some((row, _)) = fail_sid {
                mbc.pid_last = self.store.get_peer(row)?.unwrap_or(PeerId::ZERO);
            }

            if self.sync_data.txo_lo > self.sync_data.h0 {
                self.fast_sync_failed(mbc, true)?;
            } else {
                // Preserve the headers: reconstruct perishable bodies from
                // the txos before rolling each block back.
                while self.cursor.height > self.sync_data.h0 {
                    let row = self.cursor.row;
                    let height = self.cursor.height;

                    let (mut perishable, eternal) = self.reconstruct_block(row, height)?;
                    if fail_sid.map(|(_, h)| h) == Some(height) {
                        perishable.clear();
                        self.store.set_state_not_functional(row)?;
                    }

                    self.rollback_to(height - 1)?;

                    let peer = self.store.get_peer(row)?.unwrap_or(PeerId::ZERO);
                    self.store.set_state_block(row, &perishable, &eternal, peer)?;
                    self.store.set_state_txos_extra(row, None, None, None)?;
                }
                self.fast_sync_failed(mbc, false)?;
            }
        } else {
            info!("fast-sync succeeded");
            let h = self.cursor.height;
            let txo_lo = self.sync_data.txo_lo;
            self.raise_fossil(h)?;
            self.raise_txo_hi(h)?;
            self.raise_txo_lo(txo_lo)?;

            self.sync_data = SyncData::default();
            self.save_sync_data()?;
            self.events.on_fast_sync_over();
        }
        Ok(())
    }

    fn fast_sync_failed(
        &mut self,
        mbc: &mut MultiblockVerifier,
        delete_blocks: bool,
    ) -> Result<(), ChainError> {
        self.rollback_to(self.sync_data.h0)?;
        mbc.rewind_to(self.cursor.height);

        if delete_blocks {
            if let Some(target_row) = self.resolve_row(self.sync_data.target_row, self.sync_data.target_height)? {
                self.delete_blocks_in_range(target_row, self.sync_data.target_height, self.sync_data.h0)?;
            }
        }

        self.sync_data.sigma = CompressedPoint::ZERO;
        if self.sync_data.txo_lo > self.sync_data.h0 {
            info!("retrying with lower TxoLo");
            self.sync_data.txo_lo = self.sync_data.h0;
        } else {
            warn!("TxoLo already low");
        }
        self.save_sync_data()?;

        mbc.pid_last = PeerId::ZERO; // the failure is not the last peer's
        Ok(())
    }

    fn fast_sync_failed_on_lo(&mut self, mbc: &mut MultiblockVerifier) -> Result<(), ChainError> {
        warn!("fast-sync failed on the first above-TxoLo block");
        mbc.pid_last = PeerId::ZERO;
        mbc.set_failed();
        self.fast_sync_failed(mbc, true)
    }

    fn resolve_row(&self, row: RowId, height: Height) -> Result<Option<RowId>, ChainError> {
        if row == 0 {
            return Ok(None);
        }
        // The row may have been deleted already.
        match self.store.get_state(row) {
            Ok(h) if h.height == height => Ok(Some(row)),
            _ => Ok(None),
        }
    }

    /// Rebuild a block's perishable part from the txos table (outputs in
    /// naked form, inputs from the spent-inputs record).
    fn reconstruct_block(&self, row: RowId, height: Height) -> Result<(Vec<u8>, Vec<u8>), ChainError> {
        let inputs: Vec<veil_core::block::Input> = self
            .store
            .get_state_inputs(row)?
            .iter()
            .map(|si| veil_core::block::Input::new(si.commitment))
            .collect();

        let id_from = self.get_txos_before(height)?;
        let id_to = self
            .store
            .get_state_txos(row)?
            .ok_or(ChainError::Corruption("reconstruct without txo count"))?;
        debug_assert!(id_to > 0);

        let mut outputs = Vec::new();
        for rec in self.store.enum_txos(id_from)? {
            // The last id is the per-block gap, never a real output.
            if rec.id + 1 >= id_to {
                break;
            }
            outputs.push(decode_output(&rec.value)?.to_naked());
        }

        let (_, e, _) = self.store.get_state_block(row)?;
        let eternal = e.ok_or(ChainError::Corruption("reconstruct without eternal"))?;
        let perishable = bincode::encode_to_vec(
            veil_core::block::PerishablePart { inputs, outputs },
            bincode::config::standard(),
        )
        .expect("in-memory encode");
        Ok((perishable, eternal))
    }

    fn save_sync_data(&mut self) -> Result<(), ChainError> {
        if self.sync_data.is_active() {
            let bytes = bincode::encode_to_vec(self.sync_data, bincode::config::standard())
                .expect("in-memory encode");
            self.store.param_set(ParamId::SyncData, Some(&bytes))?;
        } else {
            self.store.param_set(ParamId::SyncData, None)?;
        }
        Ok(())
    }

    // ==================================================================
    // Rollback
    // ==================================================================

    /// Roll the active chain back to height `h`, restoring the UTXO tree,
    /// MMRs, asset registry and counters to their exact prior state.
    pub fn rollback_to(&mut self, h: Height) -> Result<(), ChainError> {
        debug_assert!(h <= self.cursor.height);
        if h == self.cursor.height {
            return Ok(());
        }
        if h < self.extra.fossil {
            return Err(ChainError::Corruption("rollback below fossil"));
        }

        let id0 = self.get_txos_before(h + 1)?;

        // Undo spends of outputs predating the range.
        let mut row = self.cursor.row;
        let mut height = self.cursor.height;
        while height > h {
            let inputs = self.store.get_state_inputs(row)?;
            for si in inputs {
                if si.txo_id >= id0 {
                    continue; // created and spent within the range
                }
                let (maturity, commitment) = self.input_restore_info(si.txo_id)?;
                self.utxos
                    .insert(&commitment, maturity, si.txo_id)
                    .map_err(|_| ChainError::Corruption("input rollback"))?;
                self.store.txo_set_spent(si.txo_id, MAX_HEIGHT)?;
            }
            self.store.set_state_inputs(row, &[])?;

            match self.store.get_prev_row(row)? {
                Some(prev) => {
                    row = prev;
                    height -= 1;
                }
                None => break,
            }
        }

        // Undo outputs created within the range that are still unspent.
        for rec in self.store.enum_txos(id0)? {
            if !is_unspent(&rec) {
                continue;
            }
            let out = decode_output(&rec.value)?;
            let h_create = self.txo_create_height(rec.id)?;
            self.utxos
                .remove_newest(&out.commitment, out.min_maturity(h_create, self.rules.coinbase_maturity))
                .map_err(|_| ChainError::Corruption("output rollback"))?;
        }
        self.store.txo_del_from(id0)?;
        self.store.delete_events_from(h + 1)?;

        // Kernels and shielded elements, block by block, newest first.
        while self.cursor.height > h {
            let row = self.cursor.row;
            let (_, e, rb) = self.store.get_state_block(row)?;
            let eternal_bytes = e.ok_or(ChainError::Corruption("rollback without eternal"))?;
            let (eternal, _): (EternalPart, usize) =
                bincode::decode_from_slice(&eternal_bytes, bincode::config::standard())
                    .map_err(|_| ChainError::Corruption("rollback eternal decode"))?;

            let mut bic = BlockInterpretCtx::new(self.cursor.height, false);
            bic.store_shielded_output = true;
            bic.journal = Journal::from_bytes(rb.unwrap_or_default());
            bic.shielded_ins = u32::MAX;
            bic.shielded_outs = u32::MAX;
            {
                let mut view = self.state_view();
                for krn in eternal.kernels.iter().rev() {
                    view.handle_kernel_element(krn, &mut bic)
                        .map_err(|_| ChainError::Corruption("kernel rollback"))?;
                }
            }
            if !bic.journal.is_empty() {
                return Err(ChainError::Corruption("rollback journal not drained"));
            }

            self.store.move_back(row)?;
            match self.store.get_cursor_row()? {
                Some(prev) => {
                    self.cursor.row = prev;
                    let full = self.store.get_state(prev)?;
                    self.cursor.height = full.height;
                    self.cursor.full = Some(full);
                }
                None => {
                    self.cursor.row = 0;
                    self.cursor.height = 0;
                    self.cursor.full = None;
                }
            }
        }

        self.recent.rollback_to(h);
        self.mmrs.states.shrink_to(h.saturating_sub(GENESIS_HEIGHT));
        self.extra.txos = id0;
        self.utxos_unsaved = true;

        self.init_cursor(false)?;
        if !self.test_definition() {
            return Err(ChainError::Corruption("definition mismatch after rollback"));
        }
        self.events.on_rolled_back();
        Ok(())
    }

    /// Commitment and maturity needed to restore a spent txo into the tree.
    fn input_restore_info(&self, id: TxoId) -> Result<(Height, CompressedPoint), ChainError> {
        let rec = self
            .store
            .txo_get(id)?
            .ok_or(ChainError::Corruption("spent txo missing"))?;
        let out = decode_output(&rec.value)?;
        let h_create = self.txo_create_height(id)?;
        Ok((out.min_maturity(h_create, self.rules.coinbase_maturity), out.commitment))
    }

    // ==================================================================
    // Congestion discovery and data requests
    // ==================================================================

    /// Walk every tip that could beat the cursor, decide what to request,
    /// and acquire or advance the fast-sync target.
    pub fn enum_congestions(&mut self) -> Result<(), ChainError> {
        let max_target = self.enum_congestions_internal()?;

        // Fast-sync target management.
        if let Some(ti) = max_target {
            let (t_height, t_lowest, rows_len) = {
                let t = &self.congestion.tips[ti];
                (t.height, t.lowest_height(), t.rows.len())
            };

            let sync_hi = self.horizon.sync_hi;
            let first_time = !self.is_fast_sync()
                && sync_hi
                    .checked_add(sync_hi / 2)
                    .and_then(|x| self.cursor.height.checked_add(x))
                    .is_some_and(|bound| t_height > bound);

            if first_time {
                self.sync_data.h0 = t_height - rows_len as Height;
                if t_height > self.horizon.sync_lo {
                    self.sync_data.txo_lo = t_height - self.horizon.sync_lo;
                }
                self.sync_data.txo_lo = self.sync_data.txo_lo.max(self.extra.txo_lo);
            }

            let trg_change = (self.is_fast_sync() || first_time)
                && self
                    .sync_data
                    .target_height
                    .checked_add(sync_hi)
                    .is_some_and(|bound| t_height > bound);

            if trg_change {
                let target_prev = if first_time {
                    t_height - rows_len as Height
                } else {
                    self.sync_data.target_height
                };

                self.sync_data.target_height = t_height - sync_hi;
                self.sync_data.target_row = self.congestion.tips[ti]
                    .rows
                    .get((t_height - self.sync_data.target_height) as usize)
                    .copied()
                    .ok_or(ChainError::Corruption("sync target outside walked range"))?;

                if self.sync_data.txo_lo > 0 {
                    // Ensure no stale blocks generated against an older TxoLo
                    // survive in the newly-covered range. Bounded by a sane
                    // height: anything above it cannot hold blocks anyway.
                    let h_max_sane = self.cursor.height + self.rules.max_rollback;
                    if target_prev < h_max_sane && t_lowest <= target_prev + 1 {
                        let top_h = self.sync_data.target_height.min(h_max_sane);
                        if top_h > target_prev {
                            let top_row =
                                self.congestion.tips[ti].rows[(t_height - top_h) as usize];
                            self.delete_blocks_in_range(top_row, top_h, target_prev)?;
                        }
                    }
                }
                self.save_sync_data()?;
            }

            if first_time {
                info!(target = self.sync_data.target_height, "fast-sync target acquired");
            }
        }

        // Decide requests: headers for every tip still missing them; blocks
        // only for the single best proven target.
        let mut requests: Vec<(StateId, bool, StateId)> = Vec::new();
        for (i, tip) in self.congestion.tips.iter().enumerate() {
            let is_max = max_target == Some(i);
            if !(tip.needs_hdrs || is_max) {
                continue;
            }

            let top_header = self.store.get_state(tip.rows[0])?;
            let target_id = top_header.id();

            let bottom_row = *tip.rows.back().expect("walk collects at least the tip");
            if !tip.needs_hdrs {
                if self.is_fast_sync()
                    && !tip.is_contained(self.sync_data.target_row, self.sync_data.target_height)
                {
                    continue; // irrelevant branch during fast sync
                }
                let id = self.store.get_state(bottom_row)?.id();
                requests.push((id, true, target_id));
            } else {
                let bottom = self.store.get_state(bottom_row)?;
                let id = StateId { height: bottom.height - 1, hash: bottom.prev };
                requests.push((id, false, target_id));
            }
        }

        let lowest = self.get_lowest_return_height();
        for (id, is_block, target) in requests {
            if id.height >= lowest {
                self.events.request_data(id, is_block, target);
            } else {
                warn!(%id, "state unreachable");
            }
        }
        Ok(())
    }

    /// The walk itself; returns the index of the best full-header target.
    fn enum_congestions_internal(&mut self) -> Result<Option<usize>, ChainError> {
        let mut old = std::mem::take(&mut self.congestion);
        let mut max_target: Option<usize> = None;

        for tip in self.store.enum_tips()? {
            if self.store.get_state_flags(tip.row)? & state_flags::REACHABLE != 0 {
                continue;
            }
            if tip.chain_work < self.cursor.chain_work {
                continue;
            }

            let mut entry = TipCongestion {
                height: tip.height,
                rows: Default::default(),
                needs_hdrs: false,
            };
            let mut check_cache = true;
            let mut needs_hdrs = false;
            let mut row = tip.row;
            let mut height = tip.height;

            loop {
                if check_cache {
                    if let Some(pos) = old.find(row, height) {
                        // Adopt the prior walk below this point.
                        let mut p = old.tips.remove(pos);
                        while p.height > height {
                            p.height -= 1;
                            p.rows.pop_front();
                        }
                        for r in entry.rows.iter().rev() {
                            p.rows.push_front(*r);
                            p.height += 1;
                        }
                        while let Some(&back) = p.rows.back() {
                            if self.store.get_state_flags(back)? & state_flags::REACHABLE != 0 {
                                p.rows.pop_back(); // already retrieved
                            } else {
                                break;
                            }
                        }
                        row = *p.rows.back().ok_or(ChainError::Corruption("cache walk emptied"))?;
                        height = p.lowest_height();
                        entry = p;
                        check_cache = false;
                        continue;
                    }
                    if let Some(pos) = self.congestion.find(row, height) {
                        // Another tip walked this branch within this pass.
                        let p = &self.congestion.tips[pos];
                        let dh = (p.height - height) as usize;
                        for i in dh..p.rows.len() {
                            entry.rows.push_back(p.rows[i]);
                        }
                        row = *entry.rows.back().expect("copied rows");
                        height = entry.lowest_height();
                        check_cache = false;
                        continue;
                    }
                }

                if entry.height >= height + entry.rows.len() as Height {
                    entry.rows.push_back(row);
                }

                if height == GENESIS_HEIGHT {
                    break;
                }
                match self.store.get_prev_row(row)? {
                    None => {
                        needs_hdrs = true;
                        break;
                    }
                    Some(prev) => {
                        row = prev;
                        height -= 1;
                        if self.store.get_state_flags(row)? & state_flags::REACHABLE != 0 {
                            break;
                        }
                    }
                }
            }

            entry.needs_hdrs = needs_hdrs;
            let entry_height = entry.height;
            self.congestion.tips.push(entry);
            let idx = self.congestion.tips.len() - 1;
            if !needs_hdrs
                && max_target.is_none_or(|m| self.congestion.tips[m].height < entry_height)
            {
                max_target = Some(idx);
            }
        }

        Ok(max_target)
    }

    // ==================================================================
    // Pruning
    // ==================================================================

    fn delete_block(&mut self, row: RowId) -> Result<(), ChainError> {
        self.store.del_state_block_all(row)?;
        self.store.set_state_not_functional(row)?;
        Ok(())
    }

    fn delete_blocks_in_range(
        &mut self,
        top_row: RowId,
        top_height: Height,
        h_stop: Height,
    ) -> Result<(), ChainError> {
        let mut row = top_row;
        let mut h = top_height;
        while h > h_stop {
            self.delete_block(row)?;
            match self.store.get_prev_row(row)? {
                Some(prev) => {
                    row = prev;
                    h -= 1;
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Cull stale branches and advance the three horizon watermarks.
    pub fn prune_old(&mut self) -> Result<u64, ChainError> {
        if self.is_fast_sync() {
            return Ok(0); // nothing is removed while syncing
        }

        let mut pruned = 0u64;

        if self.cursor.height > self.horizon.branching.saturating_add(GENESIS_HEIGHT - 1) {
            let h = self.cursor.height - self.horizon.branching;
            loop {
                let tips = self.store.enum_tips()?;
                let Some(tip) = tips.first().copied() else { break };
                if tip.height >= h {
                    break;
                }

                let mut progressed = false;
                let mut row = tip.row;
                loop {
                    match self.store.delete_state(row) {
                        Ok(Some(prev)) => {
                            pruned += 1;
                            progressed = true;
                            row = prev;
                        }
                        Ok(None) => {
                            pruned += 1;
                            progressed = true;
                            break;
                        }
                        Err(_) => break,
                    }
                }
                if !progressed {
                    break;
                }
            }
        }

        if exceeds(self.cursor.height, self.extra.fossil, self.rules.max_rollback) {
            pruned += self.raise_fossil(self.cursor.height - self.rules.max_rollback)?;
        }
        if exceeds(self.cursor.height, self.extra.txo_lo, self.horizon.local_lo) {
            pruned += self.raise_txo_lo(self.cursor.height - self.horizon.local_lo)?;
        }
        if exceeds(self.cursor.height, self.extra.txo_hi, self.horizon.local_hi) {
            pruned += self.raise_txo_hi(self.cursor.height - self.horizon.local_hi)?;
        }
        Ok(pruned)
    }

    /// Below Fossil, only the active chain's headers survive.
    fn raise_fossil(&mut self, target: Height) -> Result<u64, ChainError> {
        if target <= self.extra.fossil {
            return Ok(0);
        }
        let mut count = 0;
        while self.extra.fossil < target {
            self.extra.fossil += 1;
            for row in self.store.enum_states_at(self.extra.fossil)? {
                if self.store.get_state_flags(row)? & state_flags::ACTIVE != 0 {
                    self.store.del_state_block_ppr(row)?;
                } else {
                    self.delete_block(row)?;
                }
                count += 1;
            }
        }
        self.store.param_set_u64(ParamId::FossilHeight, self.extra.fossil)?;
        Ok(count)
    }

    /// Below TxoLo, spent txos are discarded and input lists compacted
    /// (treasury spends stay: the treasury is never re-playable).
    fn raise_txo_lo(&mut self, target: Height) -> Result<u64, ChainError> {
        if target <= self.extra.txo_lo {
            return Ok(0);
        }
        let mut count = 0;
        while self.extra.txo_lo < target {
            self.extra.txo_lo += 1;
            let Some(row) = self.store.find_active_state(self.extra.txo_lo)? else {
                continue;
            };
            let inputs = self.store.get_state_inputs(row)?;
            if inputs.is_empty() {
                continue;
            }
            let mut kept = Vec::with_capacity(inputs.len());
            for si in inputs {
                if si.txo_id >= self.extra.txos_treasury {
                    self.store.txo_del(si.txo_id)?;
                    count += 1;
                } else {
                    kept.push(si);
                }
            }
            self.store.set_state_inputs(row, &kept)?;
        }
        self.extra.txo_lo = target;
        self.store.param_set_u64(ParamId::TxoLo, self.extra.txo_lo)?;
        Ok(count)
    }

    /// Below TxoHi, surviving outputs are rewritten in naked form.
    fn raise_txo_hi(&mut self, target: Height) -> Result<u64, ChainError> {
        if target <= self.extra.txo_hi {
            return Ok(0);
        }
        let mut count = 0;
        while self.extra.txo_hi < target {
            self.extra.txo_hi += 1;
            let Some(row) = self.store.find_active_state(self.extra.txo_hi)? else {
                continue;
            };
            for si in self.store.get_state_inputs(row)? {
                let Some(rec) = self.store.txo_get(si.txo_id)? else { continue };
                let out = decode_output(&rec.value)?;
                if out.is_naked() {
                    continue;
                }
                let bytes = bincode::encode_to_vec(out.to_naked(), bincode::config::standard())
                    .expect("in-memory encode");
                self.store.txo_set_value(si.txo_id, &bytes)?;
                count += 1;
            }
        }
        self.store.param_set_u64(ParamId::TxoHi, self.extra.txo_hi)?;
        Ok(count)
    }

    // ==================================================================
    // Persistence
    // ==================================================================

    /// Commit the store transaction and flush the UTXO image, stamped so a
    /// crash between the two is detected on restart.
    pub fn commit_db(&mut self) -> Result<(), ChainError> {
        let flush_image = self.utxo_image_path.is_some() && self.utxos_unsaved;
        let mut stamp = [0u8; 32];
        if flush_image {
            rand::rngs::OsRng.fill_bytes(&mut stamp);
            self.store.param_set(ParamId::UtxoStamp, Some(&stamp))?;
        }

        save_mmr(&mut self.store, ParamId::MmrStates, &self.mmrs.states)?;
        save_mmr(&mut self.store, ParamId::MmrShielded, &self.mmrs.shielded)?;
        save_mmr(&mut self.store, ParamId::MmrAssets, &self.mmrs.assets)?;

        self.store.commit()?;

        if flush_image {
            let path = self.utxo_image_path.clone().expect("checked above");
            self.utxos.save_image(&path, &stamp)?;
            self.utxos_unsaved = false;
        }

        self.store.begin()?;
        Ok(())
    }

    // ==================================================================
    // Mempool support
    // ==================================================================

    /// Contextual validation of a transaction against the current tip, in
    /// validate-only mode: unique keys are staged, nothing durable is
    /// written, and the UTXO tree is restored before returning.
    ///
    /// [`ApplyError::LimitExceeded`] means the transaction is fine but over
    /// a per-block shielded cap — the mempool may retry it later.
    pub fn validate_tx_context(&mut self, body: &BlockBody) -> Result<(), ApplyError> {
        let height = self.cursor.height + 1;
        let mut bic = BlockInterpretCtx::new_validate_only(height);
        bic.asset_hi = self.mmrs.assets.count() as u32;

        let applied = {
            let mut view = self.state_view();
            view.handle_validated_tx(body, &mut bic)
        };
        applied?;

        bic.fwd = false;
        let mut view = self.state_view();
        view.handle_validated_tx(body, &mut bic)
            .map_err(|_| ChainError::Corruption("validate-only reversal"))?;
        Ok(())
    }

    // ==================================================================
    // Block generation (mining support)
    // ==================================================================

    /// Assemble the header for `body` on top of the cursor: apply the body,
    /// evaluate the next state's roots, then reverse it. The returned
    /// header still needs its nonce mined (see [`mine_header`]).
    pub fn generate_block(
        &mut self,
        body: &BlockBody,
        timestamp: u64,
    ) -> Result<(BlockHeader, Vec<u8>, Vec<u8>), ChainError> {
        let height = self.cursor.height + 1;

        let mut bic = BlockInterpretCtx::new(height, true);
        bic.asset_hi = self.mmrs.assets.count() as u32;
        bic.store_shielded_output = true;

        {
            let mut view = self.state_view();
            view.handle_validated_block(body, &mut bic)
                .map_err(|_| ChainError::Corruption("generated body does not apply"))?;
        }

        let definition = evaluate_definition(
            &self.cursor.history_next,
            &self.utxos.root(),
            &self.mmrs.shielded.root(),
            &self.mmrs.assets.root(),
        );

        let header = BlockHeader {
            height,
            prev: self.cursor.id_hash,
            timestamp: timestamp.max(self.moving_median()? + 1),
            difficulty: self.cursor.difficulty_next,
            nonce: 0,
            chain_work: self.cursor.chain_work + self.cursor.difficulty_next.0 as ChainWork,
            history: self.cursor.history_next,
            kernels: body.kernel_commitment(),
            definition,
        };

        bic.fwd = false;
        {
            let mut view = self.state_view();
            view.handle_validated_block(body, &mut bic)
                .map_err(|_| ChainError::Corruption("generated body does not reverse"))?;
        }

        let (p, e) = body.serialize_parts();
        Ok((header, p, e))
    }
}

/// Grind the nonce until the header passes its own PoW target.
pub fn mine_header(header: &mut BlockHeader, max_nonce: u64) -> bool {
    for nonce in 0..=max_nonce {
        header.nonce = nonce;
        if header.is_valid_pow() {
            return true;
        }
    }
    false
}

fn exceeds(a: Height, b: Height, margin: Height) -> bool {
    b.checked_add(margin).is_some_and(|bound| a > bound)
}

fn decode_output(bytes: &[u8]) -> Result<Output, ChainError> {
    let (out, _): (Output, usize) = bincode::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|_| ChainError::Corruption("stored output decode"))?;
    Ok(out)
}

fn rules_checksum(rules: &Rules) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"veil.rules");
    hasher.update(&rules.max_rollback.to_le_bytes());
    hasher.update(&rules.coinbase_maturity.to_le_bytes());
    hasher.update(&rules.coinbase_emission.to_le_bytes());
    hasher.update(&rules.fork2_height.to_le_bytes());
    hasher.update(&rules.max_kernel_validity_dh.to_le_bytes());
    hasher.update(&rules.da.target_s.to_le_bytes());
    hasher.update(&rules.da.window_work.to_le_bytes());
    hasher.update(&rules.da.window_median0.to_le_bytes());
    hasher.update(&rules.da.window_median1.to_le_bytes());
    hasher.update(&rules.da.difficulty0.0.to_le_bytes());
    hasher.update(&rules.shielded.proof_min.n.to_le_bytes());
    hasher.update(&rules.shielded.proof_max.n.to_le_bytes());
    hasher.update(&rules.assets.lock_period.to_le_bytes());
    Hash256(hasher.finalize().into())
}

fn load_mmr<S: NodeStore>(store: &S, id: ParamId) -> Result<veil_core::mmr::VecMmr, StoreError> {
    match store.param_get(id)? {
        Some(bytes) => {
            let (leaves, _): (Vec<Hash256>, usize) =
                bincode::decode_from_slice(&bytes, bincode::config::standard())
                    .map_err(|_| StoreError::Corruption("mmr stream decode"))?;
            Ok(veil_core::mmr::VecMmr::from_leaves(leaves))
        }
        None => Ok(veil_core::mmr::VecMmr::new()),
    }
}

fn save_mmr<S: NodeStore>(
    store: &mut S,
    id: ParamId,
    mmr: &veil_core::mmr::VecMmr,
) -> Result<(), StoreError> {
    let bytes = bincode::encode_to_vec(mmr.leaves().to_vec(), bincode::config::standard())
        .map_err(|_| StoreError::Corruption("mmr stream encode"))?;
    store.param_set(id, Some(&bytes))
}

fn rebuild_states_mmr<S: NodeStore>(
    store: &S,
    cursor_height: Height,
) -> Result<veil_core::mmr::VecMmr, ChainError> {
    let mut mmr = veil_core::mmr::VecMmr::new();
    if cursor_height >= GENESIS_HEIGHT {
        for h in GENESIS_HEIGHT..cursor_height {
            let row = store
                .find_active_state(h)?
                .ok_or(ChainError::Corruption("gap in active chain"))?;
            mmr.append(store.get_state(row)?.hash());
        }
    }
    Ok(mmr)
}
