//! Multi-block context-free verification.
//!
//! [`MultiSigmaAggregator`] amortizes the pool-side multi-exponentiation of
//! windowed membership proofs: every proof contributes a vector of challenge
//! scalars into 1024-wide chunk nodes, and one multi-exp per touched chunk
//! runs at flush time instead of one per proof.
//!
//! [`MultiblockVerifier`] schedules context-free verification of a
//! contiguous height range across the executor's workers: each block fans
//! out into one slice task per worker, partial [`VerifyContext`]s merge
//! under a mutex, and per-peer backpressure caps the bytes in flight. In
//! sparse mode (fast-sync below TxoLo) per-block balance is accumulated
//! into a running sigma instead of being checked, deferring the algebraic
//! closure of the whole range to the TxoLo boundary.

use curve25519_dalek::traits::{Identity, VartimeMultiscalarMul};
use curve25519_dalek::{RistrettoPoint, Scalar};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use veil_core::block::{BlockBody, VerifyContext};
use veil_core::commitment::generator_g;
use veil_core::kernel::KernelData;
use veil_core::proofs::ProofBatch;
use veil_core::types::{Height, HeightRange, PeerId, TxoId};

use crate::executor::{get_portion, Executor};
use crate::store::StoreError;

/// Width of one aggregation chunk.
pub const SIGMA_CHUNK: u64 = 1024;

/// Backpressure bound on serialized block bytes being verified.
pub const MAX_PENDING_BYTES: usize = 10 * 1024 * 1024;

struct SigmaNode {
    scalars: Vec<Scalar>,
    min: u32,
    max: u32,
}

/// Accumulates challenge-scalar vectors over chunk-aligned windows of an
/// indexed point list; one multi-exp per chunk at calculation time.
///
/// `add` is called from verifier threads; the node map is mutex-protected.
#[derive(Default)]
pub struct MultiSigmaAggregator {
    nodes: Mutex<BTreeMap<u64, SigmaNode>>,
}

impl MultiSigmaAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }

    /// Add `scalars` element-wise over list positions `[id0, id0 + len)`.
    pub fn add(&self, id0: u64, scalars: &[Scalar]) {
        let mut nodes = self.nodes.lock();

        let mut offset = (id0 % SIGMA_CHUNK) as u32;
        let mut base = id0 - offset as u64;
        let mut rest = scalars;

        while !rest.is_empty() {
            let portion = (rest.len() as u32).min(SIGMA_CHUNK as u32 - offset);
            let node = nodes.entry(base).or_insert_with(|| SigmaNode {
                scalars: vec![Scalar::ZERO; SIGMA_CHUNK as usize],
                min: offset,
                max: offset,
            });
            node.min = node.min.min(offset);
            node.max = node.max.max(offset + portion);
            for (dst, src) in node.scalars[offset as usize..(offset + portion) as usize]
                .iter_mut()
                .zip(rest)
            {
                *dst += src;
            }

            rest = &rest[portion as usize..];
            base += SIGMA_CHUNK;
            offset = 0;
        }
    }

    /// Evaluate every chunk and drain the node map.
    ///
    /// `prepare(base, min, max)` loads the point list slice
    /// `[base + min, base + max)` (the shielded pool from storage, or
    /// asset generators derived on the fly); the multi-exp over each slice
    /// is split across the executor's workers.
    pub fn calculate(
        &self,
        executor: &Executor,
        prepare: &mut dyn FnMut(u64, u32, u32) -> Result<Vec<RistrettoPoint>, StoreError>,
    ) -> Result<RistrettoPoint, StoreError> {
        let mut result = RistrettoPoint::identity();

        loop {
            let (base, node) = {
                let mut nodes = self.nodes.lock();
                match nodes.pop_first() {
                    Some(entry) => entry,
                    None => break,
                }
            };
            debug_assert!(node.min < node.max);

            let points = Arc::new(prepare(base, node.min, node.max)?);
            let count = (node.max - node.min) as usize;
            if points.len() != count {
                return Err(StoreError::Corruption("sigma point slice length"));
            }
            let scalars = Arc::new(node.scalars);
            let min = node.min as usize;

            let sum = Arc::new(Mutex::new(RistrettoPoint::identity()));
            let total = executor.threads();
            {
                let sum = Arc::clone(&sum);
                executor.exec_all(move |ctx| {
                    let portion = get_portion(ctx.thread_index, total, count);
                    if portion.is_empty() {
                        return;
                    }
                    let part = RistrettoPoint::vartime_multiscalar_mul(
                        scalars[min + portion.start..min + portion.end].iter(),
                        points[portion.clone()].iter(),
                    );
                    *sum.lock() += part;
                });
            }
            result += *sum.lock();
        }

        Ok(result)
    }
}

/// One block's verification fan-out: shared body, merged partial context,
/// and a completion counter so the last worker finalizes.
struct BlockJob {
    body: Arc<BlockBody>,
    height: Height,
    size: usize,
    sparse: bool,
    allow_unsigned: bool,
    subsidy: u64,
    ctx: Mutex<VerifyContext>,
    done: AtomicU32,
    total: u32,
}

struct MbState {
    size_pending: usize,
    /// Accumulated body offsets of sparse blocks (not yet folded).
    offset: Scalar,
    /// Accumulated sparse-block sigmas.
    sigma: RistrettoPoint,
}

struct MbShared {
    fail: AtomicBool,
    state: Mutex<MbState>,
    msc: MultiSigmaAggregator,
    mac: MultiSigmaAggregator,
}

/// Parallel context-free verification over a contiguous height range.
pub struct MultiblockVerifier {
    in_progress: HeightRange,
    /// Txos existing before the fast-sync window; sparse blocks may not
    /// spend anything at or past this id.
    pub id0: TxoId,
    pub pid_last: PeerId,
    batch_dirty: bool,
    shared: Arc<MbShared>,
    executor: Arc<Executor>,
}

impl MultiblockVerifier {
    /// `initial_sigma` restores the running sparse sigma persisted in
    /// `SyncData` when resuming a fast sync.
    pub fn new(
        executor: Arc<Executor>,
        cursor_height: Height,
        id0: TxoId,
        initial_sigma: Option<RistrettoPoint>,
    ) -> Self {
        Self {
            in_progress: HeightRange::new(cursor_height + 1, cursor_height),
            id0,
            pid_last: PeerId::ZERO,
            batch_dirty: false,
            shared: Arc::new(MbShared {
                fail: AtomicBool::new(false),
                state: Mutex::new(MbState {
                    size_pending: 0,
                    offset: Scalar::ZERO,
                    sigma: initial_sigma.unwrap_or_else(RistrettoPoint::identity),
                }),
                msc: MultiSigmaAggregator::new(),
                mac: MultiSigmaAggregator::new(),
            }),
            executor,
        }
    }

    pub fn in_progress(&self) -> HeightRange {
        self.in_progress
    }

    pub fn failed(&self) -> bool {
        self.shared.fail.load(Ordering::Acquire)
    }

    pub fn set_failed(&self) {
        self.shared.fail.store(true, Ordering::Release);
    }

    pub fn batch_dirty(&self) -> bool {
        self.batch_dirty
    }

    /// Whether a flush must run before a block from `pid` at the current
    /// frontier: peer changes force per-peer sequential commit, and the
    /// TxoLo boundary closes the sparse range.
    pub fn needs_flush_before(&self, pid: PeerId, txo_lo: Height) -> bool {
        !self.in_progress.is_empty()
            && (self.pid_last != pid || self.in_progress.max == txo_lo)
    }

    /// Queue one block for verification. Blocks while more than
    /// [`MAX_PENDING_BYTES`] of bodies are in flight.
    pub fn push_block(
        &mut self,
        pid: PeerId,
        body: Arc<BlockBody>,
        height: Height,
        size: usize,
        sparse: bool,
        allow_unsigned: bool,
        subsidy: u64,
    ) {
        debug_assert_eq!(height, self.in_progress.max + 1);
        if self.failed() {
            return;
        }
        self.pid_last = pid;

        loop {
            {
                let mut state = self.shared.state.lock();
                if state.size_pending <= MAX_PENDING_BYTES {
                    state.size_pending += size;
                    break;
                }
            }
            let in_flight = self.executor.flush(u32::MAX);
            self.executor.flush(in_flight.saturating_sub(1));
        }

        self.in_progress.max += 1;
        self.batch_dirty = true;

        let total = self.executor.threads();
        let job = Arc::new(BlockJob {
            body,
            height,
            size,
            sparse,
            allow_unsigned,
            subsidy,
            ctx: Mutex::new(VerifyContext::new(height)),
            done: AtomicU32::new(0),
            total,
        });

        for index in 0..total {
            let job = Arc::clone(&job);
            let shared = Arc::clone(&self.shared);
            self.executor.push_to(index, move |vctx| {
                exec_block_slice(&job, &shared, index, vctx.batch);
            });
        }
    }

    /// Wait for all tasks and drain every worker's proof batch into one sum.
    pub fn drain_thread_batches(&mut self) -> RistrettoPoint {
        self.executor.flush(0);
        self.batch_dirty = false;
        let sum = Arc::new(Mutex::new(RistrettoPoint::identity()));
        {
            let sum = Arc::clone(&sum);
            self.executor.exec_all(move |ctx| {
                if ctx.batch.is_empty() {
                    return;
                }
                let part = ctx.batch.flush();
                *sum.lock() += part;
            });
        }
        let total = *sum.lock();
        total
    }

    /// Evaluate the shielded-pool aggregation.
    pub fn msc_calculate(
        &self,
        prepare: &mut dyn FnMut(u64, u32, u32) -> Result<Vec<RistrettoPoint>, StoreError>,
    ) -> Result<RistrettoPoint, StoreError> {
        self.shared.msc.calculate(&self.executor, prepare)
    }

    /// Evaluate the asset-generator aggregation.
    pub fn mac_calculate(&self) -> Result<RistrettoPoint, StoreError> {
        self.shared.mac.calculate(&self.executor, &mut |base, min, max| {
            Ok((min..max)
                .map(|i| veil_core::commitment::asset_generator((base + i as u64) as u32))
                .collect())
        })
    }

    /// Fold accumulated sparse offsets into the running sigma and return it.
    pub fn sparse_sigma(&self) -> RistrettoPoint {
        let mut state = self.shared.state.lock();
        if state.offset != Scalar::ZERO {
            let fold = generator_g() * state.offset;
            state.sigma -= fold;
            state.offset = Scalar::ZERO;
        }
        state.sigma
    }

    /// Reset the running sigma after the TxoLo boundary check passed.
    pub fn reset_sparse_sigma(&self) {
        let mut state = self.shared.state.lock();
        state.sigma = RistrettoPoint::identity();
        state.offset = Scalar::ZERO;
    }

    /// Close the flushed range: the next block continues from `max + 1`.
    pub fn advance_min(&mut self) {
        self.in_progress.min = self.in_progress.max + 1;
    }

    /// Rewind the frontier after a rollback (fast-sync failure recovery).
    pub fn rewind_to(&mut self, cursor_height: Height) {
        self.in_progress = HeightRange::new(cursor_height + 1, cursor_height);
    }
}

impl Drop for MultiblockVerifier {
    fn drop(&mut self) {
        self.executor.flush(0);
        if self.batch_dirty {
            // Don't leak partial batch state into the next session.
            self.executor.exec_all(|ctx| ctx.batch.reset());
        }
    }
}

/// One worker's share of one block: slice verification, shielded-input
/// walk, merge, and last-one-out finalization.
fn exec_block_slice(job: &BlockJob, shared: &MbShared, index: u32, batch: &mut ProofBatch) {
    let mut ok = !shared.fail.load(Ordering::Acquire);

    let mut part = VerifyContext::new(job.height);
    if ok {
        let mac = &shared.mac;
        ok = part
            .validate_slice(
                &job.body,
                index as usize,
                job.total as usize,
                job.allow_unsigned,
                batch,
                &mut |begin, weights| mac.add(begin as u64, &weights),
            )
            .is_ok();
    }

    if ok {
        ok = verify_shielded_slice(&job.body, index, job.total, batch, &shared.msc);
    }

    let done;
    {
        let mut ctx = job.ctx.lock();
        if ok {
            ctx.merge(&part);
        }
        done = job.done.fetch_add(1, Ordering::AcqRel) + 1;

        if done == job.total {
            let mut state = shared.state.lock();
            debug_assert!(state.size_pending >= job.size);
            state.size_pending -= job.size;

            if ok && !shared.fail.load(Ordering::Acquire) {
                if job.sparse {
                    // Defer the balance: accumulate sigma and offset.
                    let partial = ctx.close_block(&Scalar::ZERO, job.subsidy);
                    state.sigma += partial;
                    state.offset += job.body.offset.to_scalar();
                } else {
                    let sigma = ctx.close_block(&job.body.offset.to_scalar(), job.subsidy);
                    if sigma != RistrettoPoint::identity() {
                        ok = false;
                    }
                }
            }
        }
    }

    if !ok {
        shared.fail.store(true, Ordering::Release);
    }
}

/// Verify shielded spend proofs round-robin across verifiers, feeding the
/// pool weights into the shielded aggregator.
fn verify_shielded_slice(
    body: &BlockBody,
    index: u32,
    total: u32,
    batch: &mut ProofBatch,
    msc: &MultiSigmaAggregator,
) -> bool {
    let mut turn = 0u32;
    let mut ok = true;

    for kernel in &body.kernels {
        kernel.walk(&mut |k| {
            if !ok {
                return;
            }
            let KernelData::ShieldedInput { window_end, commitment, spend_proof } = &k.data
            else {
                return;
            };
            let mine = turn == index;
            turn = (turn + 1) % total;
            if !mine {
                return;
            }

            let n = spend_proof.n as u64;
            if *window_end < n {
                ok = false;
                return;
            }
            match spend_proof.verify_batched(k.id().as_bytes(), commitment, batch) {
                Ok(weights) => msc.add(window_end - n, &weights),
                Err(_) => ok = false,
            }
        });
        if !ok {
            break;
        }
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use veil_core::commitment::{commit, generator_h, CompressedPoint, ScalarBytes};
    use veil_core::kernel::Kernel;
    use veil_core::proofs::SpendProof;

    // ------------------------------------------------------------------
    // MultiSigmaAggregator
    // ------------------------------------------------------------------

    #[test]
    fn aggregator_chunks_across_boundary() {
        let agg = MultiSigmaAggregator::new();
        // A window straddling the 1024 boundary lands in two nodes.
        let scalars = vec![Scalar::ONE; 8];
        agg.add(SIGMA_CHUNK - 3, &scalars);
        let nodes = agg.nodes.lock();
        assert_eq!(nodes.len(), 2);

        let first = &nodes[&0];
        assert_eq!((first.min, first.max), ((SIGMA_CHUNK - 3) as u32, SIGMA_CHUNK as u32));
        let second = &nodes[&SIGMA_CHUNK];
        assert_eq!((second.min, second.max), (0, 5));
    }

    #[test]
    fn aggregator_overlapping_adds_sum() {
        let agg = MultiSigmaAggregator::new();
        agg.add(10, &[Scalar::from(2u64), Scalar::from(3u64)]);
        agg.add(11, &[Scalar::from(5u64)]);
        let nodes = agg.nodes.lock();
        let node = &nodes[&0];
        assert_eq!(node.scalars[10], Scalar::from(2u64));
        assert_eq!(node.scalars[11], Scalar::from(8u64));
        assert_eq!((node.min, node.max), (10, 12));
    }

    #[test]
    fn aggregator_calculate_matches_direct() {
        let executor = Executor::new(3);
        let agg = MultiSigmaAggregator::new();

        let points: Vec<RistrettoPoint> =
            (0..16).map(|_| RistrettoPoint::random(&mut OsRng)).collect();
        let scalars: Vec<Scalar> = (1..=16u64).map(Scalar::from).collect();
        agg.add(0, &scalars);

        let expected = RistrettoPoint::vartime_multiscalar_mul(scalars.iter(), points.iter());

        let pts = points.clone();
        let got = agg
            .calculate(&executor, &mut |base, min, max| {
                assert_eq!(base, 0);
                Ok(pts[min as usize..max as usize].to_vec())
            })
            .unwrap();
        assert_eq!(got, expected);
        assert!(agg.is_empty());
    }

    #[test]
    fn aggregator_empty_calculates_identity() {
        let executor = Executor::new(2);
        let agg = MultiSigmaAggregator::new();
        let got = agg
            .calculate(&executor, &mut |_, _, _| panic!("no nodes to prepare"))
            .unwrap();
        assert_eq!(got, RistrettoPoint::identity());
    }

    // ------------------------------------------------------------------
    // MultiblockVerifier
    // ------------------------------------------------------------------

    fn coinbase_body(subsidy: u64) -> BlockBody {
        let r = Scalar::random(&mut OsRng);
        let offset = Scalar::random(&mut OsRng);
        let sk = r - offset;
        BlockBody {
            offset: ScalarBytes::from_scalar(&offset),
            inputs: vec![],
            outputs: vec![veil_core::block::Output::create(subsidy, &r, true, 0)],
            kernels: vec![Kernel::sign(
                &sk,
                0,
                veil_core::types::HeightRange::unbounded(),
                KernelData::Std { relative_lock: None },
                vec![],
            )],
        }
    }

    fn push_and_flush(mbc: &mut MultiblockVerifier, bodies: Vec<(BlockBody, bool)>, subsidy: u64) -> RistrettoPoint {
        let mut height = mbc.in_progress().max;
        for (body, sparse) in bodies {
            height += 1;
            let size = body.serialized_size();
            mbc.push_block(PeerId::ZERO, Arc::new(body), height, size, sparse, sparse, subsidy);
        }
        mbc.drain_thread_batches()
    }

    #[test]
    fn full_block_verifies_to_identity_batch() {
        let executor = Arc::new(Executor::new(3));
        let mut mbc = MultiblockVerifier::new(executor, 0, 0, None);
        let sum = push_and_flush(&mut mbc, vec![(coinbase_body(80), false)], 80);
        assert!(!mbc.failed());
        assert_eq!(sum, RistrettoPoint::identity());
        assert_eq!(mbc.in_progress(), HeightRange::new(1, 1));
    }

    #[test]
    fn wrong_subsidy_sets_fail() {
        let executor = Arc::new(Executor::new(2));
        let mut mbc = MultiblockVerifier::new(executor, 0, 0, None);
        let _ = push_and_flush(&mut mbc, vec![(coinbase_body(81), false)], 80);
        assert!(mbc.failed());
    }

    #[test]
    fn sparse_blocks_accumulate_then_close() {
        let executor = Arc::new(Executor::new(2));
        let mut mbc = MultiblockVerifier::new(executor, 0, 0, None);
        let bodies = vec![(coinbase_body(80), true), (coinbase_body(80), true)];
        let sum = push_and_flush(&mut mbc, bodies, 80);
        assert!(!mbc.failed());
        assert_eq!(sum, RistrettoPoint::identity());
        // The whole sparse range closes algebraically.
        assert_eq!(mbc.sparse_sigma(), RistrettoPoint::identity());
    }

    #[test]
    fn sparse_tampered_offset_caught_at_boundary_only() {
        let executor = Arc::new(Executor::new(2));
        let mut mbc = MultiblockVerifier::new(executor, 0, 0, None);
        let mut body = coinbase_body(80);
        body.offset = ScalarBytes::from_scalar(&(body.offset.to_scalar() + Scalar::ONE));
        let sum = push_and_flush(&mut mbc, vec![(body, true)], 80);
        // Per-block verification passes (sparse defers the balance)…
        assert!(!mbc.failed());
        assert_eq!(sum, RistrettoPoint::identity());
        // …but the aggregated sigma betrays the tamper.
        assert_ne!(mbc.sparse_sigma(), RistrettoPoint::identity());
    }

    #[test]
    fn peer_change_forces_flush() {
        let executor = Arc::new(Executor::new(2));
        let mut mbc = MultiblockVerifier::new(executor, 0, 0, None);
        let body = coinbase_body(80);
        let size = body.serialized_size();
        mbc.push_block(PeerId([1; 32]), Arc::new(body), 1, size, false, false, 80);

        assert!(mbc.needs_flush_before(PeerId([2; 32]), 0));
        assert!(!mbc.needs_flush_before(PeerId([1; 32]), 0));
        mbc.drain_thread_batches();
    }

    #[test]
    fn txo_lo_boundary_forces_flush() {
        let executor = Arc::new(Executor::new(2));
        let mut mbc = MultiblockVerifier::new(executor, 0, 0, None);
        let body = coinbase_body(80);
        let size = body.serialized_size();
        mbc.push_block(PeerId([1; 32]), Arc::new(body), 1, size, true, true, 80);
        // Frontier is at height 1 == TxoLo: the sparse range must close.
        assert!(mbc.needs_flush_before(PeerId([1; 32]), 1));
        mbc.drain_thread_batches();
    }

    #[test]
    fn shielded_spend_feeds_aggregator() {
        let executor = Arc::new(Executor::new(2));
        let mut mbc = MultiblockVerifier::new(Arc::clone(&executor), 0, 0, None);

        // Pool of 8 points; element 5 is spendable by our key and withdraws
        // 33 units into a fresh transparent commitment.
        let spend_pt = generator_g() * Scalar::random(&mut OsRng);
        let spend_pk = CompressedPoint::from_point(&spend_pt);
        let out_blind = Scalar::random(&mut OsRng);
        let withdrawn = CompressedPoint::from_point(&commit(33, &out_blind, &generator_h()));
        let witness = Scalar::random(&mut OsRng);
        let pool: Vec<RistrettoPoint> = (0..8)
            .map(|i| {
                if i == 5 {
                    spend_pt + withdrawn.decompress().unwrap() + generator_g() * witness
                } else {
                    RistrettoPoint::random(&mut OsRng)
                }
            })
            .collect();

        // Balanced body: the withdrawn value funds one transparent output.
        let r_out = Scalar::random(&mut OsRng);
        let offset = Scalar::random(&mut OsRng);
        let sk = r_out - out_blind - offset;
        let output = veil_core::block::Output::create(33, &r_out, false, 0);

        let mut krn = Kernel::sign(
            &sk,
            0,
            veil_core::types::HeightRange::unbounded(),
            KernelData::ShieldedInput {
                window_end: 8,
                commitment: withdrawn,
                spend_proof: SpendProof::create(b"", &pool, 5, &spend_pk, &withdrawn, &witness),
            },
            vec![],
        );
        // Re-sign with the proof bound to the final kernel id (the id does
        // not cover the proof, so it stays stable).
        let proof = SpendProof::create(krn.id().as_bytes(), &pool, 5, &spend_pk, &withdrawn, &witness);
        if let KernelData::ShieldedInput { spend_proof, .. } = &mut krn.data {
            *spend_proof = proof;
        }

        let body = BlockBody {
            offset: ScalarBytes::from_scalar(&offset),
            inputs: vec![],
            outputs: vec![output],
            kernels: vec![krn],
        };

        let size = body.serialized_size();
        mbc.push_block(PeerId::ZERO, Arc::new(body), 1, size, true, true, 0);
        let mut sum = mbc.drain_thread_batches();
        assert!(!mbc.failed());

        let pool2 = pool.clone();
        sum += mbc
            .msc_calculate(&mut |base, min, max| {
                Ok(pool2[(base + min as u64) as usize..(base + max as u64) as usize].to_vec())
            })
            .unwrap();
        assert_eq!(sum, RistrettoPoint::identity());
        // The sparse sigma closes: output − withdrawn − excess − offset·G.
        assert_eq!(mbc.sparse_sigma(), RistrettoPoint::identity());
    }
}
