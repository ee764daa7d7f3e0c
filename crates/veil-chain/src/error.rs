//! Processor error taxonomy.
//!
//! Corruption is fatal: an on-disk invariant does not hold and the node must
//! halt. Everything block-shaped is recoverable — the offending block is
//! reversed, the peer blamed, and the processor moves to the next candidate
//! tip. [`ApplyError::LimitExceeded`] is neither: the transaction is valid
//! but over a per-block resource cap, so the mempool may retry it later.

use thiserror::Error;

use crate::store::StoreError;
use veil_core::error::{BlockError, UtxoTreeError};

#[derive(Error, Debug)]
pub enum ChainError {
    /// Inconsistent persistent state. Never recovered.
    #[error("chain data corrupt: {0}")] Corruption(&'static str),
    #[error(transparent)] Store(#[from] StoreError),
    #[error(transparent)] Block(#[from] BlockError),
    #[error("utxo image: {0}")] UtxoImage(#[from] UtxoTreeError),
}

/// Outcome of interpreting a block element in context.
#[derive(Error, Debug)]
pub enum ApplyError {
    /// The block violates a contextual rule; reverse and blame.
    #[error("invalid in context")] Invalid,
    /// Per-block shielded resource cap hit; retryable for mempool use.
    #[error("resource limit exceeded")] LimitExceeded,
    #[error(transparent)] Fatal(#[from] ChainError),
}

impl From<StoreError> for ApplyError {
    fn from(e: StoreError) -> Self {
        ApplyError::Fatal(ChainError::Store(e))
    }
}

/// Ingestion verdict for headers, blocks and the treasury.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataStatus {
    Accepted,
    /// Already known; not an error.
    Rejected,
    Invalid,
    /// Below the lowest height the node can still make use of.
    Unreachable,
}
