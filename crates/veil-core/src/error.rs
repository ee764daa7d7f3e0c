//! Error types for the Veil protocol.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProofError {
    #[error("malformed proof encoding")] Malformed,
    #[error("challenge recomposition failed")] ChallengeMismatch,
    #[error("proof relation does not hold")] RelationFailed,
    #[error("point decompression failed")] InvalidPoint,
    #[error("window out of bounds: end {end}, size {size}")] WindowOutOfBounds { end: u64, size: u64 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("invalid kernel signature")] InvalidSignature,
    #[error("kernel height range empty or inverted")] InvalidHeightRange,
    #[error("kernels not sorted by id")] Unsorted,
    #[error("nested kernel depth exceeded")] NestingTooDeep,
    #[error("emit amount out of range")] EmitOutOfRange,
    #[error("proof: {0}")] Proof(#[from] ProofError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("invalid PoW")] InvalidPoW,
    #[error("invalid prev hash")] InvalidPrevHash,
    #[error("chain work mismatch: expected {expected}, got {got}")] ChainWorkMismatch { expected: u128, got: u128 },
    #[error("difficulty mismatch: expected {expected}, got {got}")] DifficultyMismatch { expected: u64, got: u64 },
    #[error("timestamp not after moving median")] TimestampNotAfterMedian,
    #[error("timestamp ahead of wall clock by {0}s")] TimestampAhead(u64),
    #[error("kernel commitment mismatch")] KernelCommitmentMismatch,
    #[error("definition mismatch")] DefinitionMismatch,
    #[error("oversized: {size} > {max}")] OversizedBlock { size: usize, max: usize },
    #[error("balance does not close")] BalanceMismatch,
    #[error("deserialization failed")] Deserialization,
    #[error("kernel error in {index}: {source}")] Kernel { index: usize, source: KernelError },
    #[error("output {index}: missing range proof")] MissingRangeProof { index: usize },
    #[error("output {index}: {source}")] OutputProof { index: usize, source: ProofError },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UtxoTreeError {
    #[error("no spendable entry for commitment below maturity {0}")] NotFound(u64),
    #[error("leaf multiplicity overflow")] CountOverflow,
    #[error("image file: {0}")] Image(String),
    #[error("image stamp mismatch")] StampMismatch,
}

#[derive(Error, Debug)]
pub enum VeilError {
    #[error(transparent)] Proof(#[from] ProofError),
    #[error(transparent)] Kernel(#[from] KernelError),
    #[error(transparent)] Block(#[from] BlockError),
    #[error(transparent)] UtxoTree(#[from] UtxoTreeError),
}
