//! Consensus rule parameters.
//!
//! The block-processing core never hard-codes consensus constants; it
//! consumes a [`Rules`] value. [`Rules::default`] carries production-like
//! values, [`Rules::for_tests`] shrinks every window so scenarios run in
//! milliseconds.

use crate::types::{Difficulty, Height};

/// Difficulty-adjustment parameters.
#[derive(Clone, Debug)]
pub struct DifficultyAdjustment {
    /// Target seconds between blocks.
    pub target_s: u32,
    /// Number of blocks between the two median samples.
    pub window_work: u32,
    /// Median window for the timestamp rule (timestamp must exceed the
    /// median of the last `window_median0` blocks).
    pub window_median0: u32,
    /// Median window used by the retarget samples.
    pub window_median1: u32,
    /// Dampening numerator: `dt = (dt_src·m + dt_trg·(n − m)) / n`.
    pub damp_m: u32,
    /// Dampening denominator.
    pub damp_n: u32,
    /// Difficulty of the first block and of synthetic prehistoric blocks.
    pub difficulty0: Difficulty,
    /// Reject headers whose timestamp is ahead of wall clock by more than this.
    pub max_ahead_s: u64,
}

/// Anonymity-set (one-of-many) proof configuration: the window size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SigmaCfg {
    /// Number of anonymity-set elements covered by one proof.
    pub n: u32,
}

/// Shielded-pool rules.
#[derive(Clone, Debug)]
pub struct ShieldedRules {
    pub enabled: bool,
    /// Max shielded inputs per block.
    pub max_ins: u32,
    /// Max shielded outputs per block.
    pub max_outs: u32,
    /// The small window config, always accepted.
    pub proof_min: SigmaCfg,
    /// The large window config, accepted only while the pool has not grown
    /// past `window_end + max_window_backlog`.
    pub proof_max: SigmaCfg,
    pub max_window_backlog: u64,
}

/// Confidential-asset rules.
#[derive(Clone, Debug)]
pub struct AssetRules {
    /// Maximum number of simultaneously registered assets.
    pub max_count: u32,
    /// Blocks an asset must stay untouched (value at zero) before it can be
    /// destroyed, counted from its `lock_height`.
    pub lock_period: Height,
    /// Window size of the asset membership proof.
    pub proof_cfg: SigmaCfg,
}

/// The consensus rule set consumed by the core.
#[derive(Clone, Debug)]
pub struct Rules {
    /// Maximum depth the node is ever required to roll back.
    pub max_rollback: Height,
    /// Maximum serialized size of a block body (both parts).
    pub max_body_size: usize,
    /// Coinbase outputs may not be spent for this many blocks.
    pub coinbase_maturity: Height,
    /// Emission paid to the coinbase output of each block.
    pub coinbase_emission: u64,
    /// Height of the second fork: kernel ids become unique and relative
    /// locks see only `max_kernel_validity_dh` back.
    pub fork2_height: Height,
    /// Post-fork-2 kernel visibility horizon.
    pub max_kernel_validity_dh: Height,
    pub da: DifficultyAdjustment,
    pub shielded: ShieldedRules,
    pub assets: AssetRules,
}

impl Default for Rules {
    fn default() -> Self {
        Self {
            max_rollback: 1440,
            max_body_size: 0x100000,
            coinbase_maturity: 240,
            coinbase_emission: 80 * 100_000_000,
            fork2_height: 2,
            max_kernel_validity_dh: 1440 * 30,
            da: DifficultyAdjustment {
                target_s: 60,
                window_work: 120,
                window_median0: 25,
                window_median1: 7,
                damp_m: 1,
                damp_n: 3,
                difficulty0: Difficulty(100),
                max_ahead_s: 2 * 3600,
            },
            shielded: ShieldedRules {
                enabled: true,
                max_ins: 8,
                max_outs: 4,
                proof_min: SigmaCfg { n: 256 },
                proof_max: SigmaCfg { n: 1024 },
                max_window_backlog: 4096,
            },
            assets: AssetRules {
                max_count: 1024,
                lock_period: 1440,
                proof_cfg: SigmaCfg { n: 128 },
            },
        }
    }
}

impl Rules {
    /// Small windows and trivial difficulty, for tests.
    pub fn for_tests() -> Self {
        Self {
            max_rollback: 8,
            max_body_size: 0x100000,
            coinbase_maturity: 4,
            coinbase_emission: 100,
            fork2_height: 2,
            max_kernel_validity_dh: 16,
            da: DifficultyAdjustment {
                target_s: 60,
                window_work: 8,
                window_median0: 5,
                window_median1: 3,
                damp_m: 1,
                damp_n: 3,
                difficulty0: Difficulty(1),
                max_ahead_s: 2 * 3600,
            },
            shielded: ShieldedRules {
                enabled: true,
                max_ins: 4,
                max_outs: 4,
                proof_min: SigmaCfg { n: 8 },
                proof_max: SigmaCfg { n: 16 },
                max_window_backlog: 64,
            },
            assets: AssetRules {
                max_count: 16,
                lock_period: 3,
                proof_cfg: SigmaCfg { n: 8 },
            },
        }
    }
}
