//! Core error types
//!
//! Every rejection the consensus engine can produce maps to one of these
//! kinds. Validation failures are reported to the caller, never retried.

use thiserror::Error;

/// Errors produced by the consensus core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Malformed transaction or block.
    #[error("invalid structure: {0}")]
    InvalidStructure(String),

    /// ECDSA verification failed.
    #[error("invalid signature")]
    InvalidSignature,

    /// Block hash does not meet the difficulty target, or the difficulty
    /// itself is malformed.
    #[error("invalid proof of work: {0}")]
    InvalidPoW(String),

    /// Recomputed merkle root differs from the header's.
    #[error("merkle root mismatch")]
    MerkleMismatch,

    /// Coinbase outputs exceed block reward plus fees.
    #[error("coinbase overflow: outputs {outputs} exceed allowed {allowed}")]
    CoinbaseOverflow { outputs: u64, allowed: u64 },

    /// Input outpoint already spent, or locked with no replacement path.
    #[error("double spend: {0}")]
    DoubleSpend(String),

    /// Referenced outpoint does not exist in the UTXO set.
    #[error("utxo not found: {0}")]
    UtxoNotFound(String),

    /// Input value does not cover outputs plus fee.
    #[error("insufficient funds: inputs {inputs} < outputs {outputs} + fee {fee}")]
    InsufficientFunds { inputs: u64, outputs: u64, fee: u64 },

    /// Sender nonce below the expected value, or duplicated.
    #[error("nonce violation: got {got}, expected at least {expected}")]
    NonceViolation { got: u64, expected: u64 },

    /// Block or transaction buffered until its parent arrives.
    #[error("orphaned pending parent")]
    OrphanPending,

    /// Reorganization crossed a checkpoint or failed replay.
    #[error("reorg rejected: {0}")]
    ReorgRejected(String),

    /// Persistence failure.
    #[error("storage error: {0}")]
    StorageError(String),

    /// Monetary arithmetic left the representable range.
    #[error("amount out of range: {0}")]
    AmountOutOfRange(String),
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::StorageError(err.to_string())
    }
}

/// Result type for consensus operations.
pub type CoreResult<T> = Result<T, CoreError>;
