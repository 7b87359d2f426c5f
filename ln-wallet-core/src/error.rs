//! Error and failure-data types shared across both state machines.
//!
//! Two tiers, mirroring the rest of the workspace: [`HeaderChainError`] and
//! [`CoinSelectionError`] are typed `thiserror` enums callers match on;
//! internal plumbing elsewhere uses `anyhow::Result` with `.context(...)`.
//! [`FailureMessage`] is neither -- it's wire data sent upstream per HTLC,
//! not a Rust error.

/// Why a header (or chunk of headers) was rejected by the header chain.
/// Any of these means the server that sent the header is misbehaving and
/// the wallet FSM disconnects; no individual datum is quarantined.
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum HeaderChainError {
    #[error("header's prevHash does not match the current tip")]
    PrevHashMismatch,
    #[error("header's bits field does not match the expected retarget target")]
    BadDifficulty,
    #[error("chunk does not start at a retarget boundary")]
    NotAtRetargetBoundary,
    #[error("chunk's first header does not chain from the checkpoint anchor")]
    AnchorMismatch,
    #[error("header height is below the earliest embedded checkpoint")]
    BelowEarliestCheckpoint,
    #[error("headers chunk is internally inconsistent (bad PoW or linkage)")]
    InvalidChunk,
}

/// Why `complete_transaction` / `spend_all` failed to produce a transaction.
/// Surfaced to the caller verbatim; no wallet state changes on this path.
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum CoinSelectionError {
    #[error("insufficient funds: have {available} sat, need {needed} sat")]
    InsufficientFunds { available: u64, needed: u64 },
    #[error("output amount {amount} sat is at or below the dust limit {dust_limit} sat")]
    AmountBelowDustLimit { amount: u64, dust_limit: u64 },
    #[error("transaction must have at least one output")]
    NoOutputs,
}

/// An HTLC-level failure, encoded as data and sent upstream per-HTLC rather
/// than raised as a Rust error. Retained in the owning FSM so repeated
/// `InFlightPayments` snapshots reproduce byte-identical failures.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum FailureMessage {
    /// Sent with the amount and block height the rejecting node observed.
    IncorrectOrUnknownPaymentDetails { amount_msat: u64, height: u32 },
    TemporaryNodeFailure,
    TrampolineFeeInsufficient,
    TrampolineExpiryTooSoon,
    PaymentTimeout,
}
