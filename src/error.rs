use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;
use crate::tracker::TrackerError;

/// Chain verification failures. Only `NotFound` is retryable; everything
/// else is a permanent rejection and must never be retried.
#[derive(Error, Debug, Clone)]
pub enum VerifyError {
    #[error("transaction not found: {0}")]
    NotFound(String),

    #[error("transaction failed on chain: {0}")]
    TransactionFailed(String),

    #[error("wrong destination: expected {expected}, got {actual}")]
    WrongDestination { expected: String, actual: String },

    #[error("sender mismatch: expected {expected}, got {actual}")]
    SenderMismatch { expected: String, actual: String },

    #[error("undecodable payload: {0}")]
    Undecodable(String),

    #[error("RPC error: {0}")]
    Rpc(String),
}

impl VerifyError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, VerifyError::NotFound(_))
    }

    /// Machine-readable code surfaced in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            VerifyError::NotFound(_) => "tx_not_found",
            VerifyError::TransactionFailed(_) => "tx_failed",
            VerifyError::WrongDestination { .. } => "wrong_destination",
            VerifyError::SenderMismatch { .. } => "sender_mismatch",
            VerifyError::Undecodable(_) => "undecodable_payload",
            VerifyError::Rpc(_) => "rpc_error",
        }
    }
}

#[derive(Error, Debug)]
pub enum SettlementError {
    #[error(transparent)]
    Verify(#[from] VerifyError),

    /// Idempotency conflict. Callers treat this as success-with-no-op.
    #[error("transaction already recorded: {0}")]
    AlreadyRecorded(String),

    #[error("purchase not found: {0}")]
    PurchaseNotFound(Uuid),

    #[error("referral bonus already processed for purchase {0}")]
    BonusAlreadyProcessed(Uuid),

    #[error("purchaser has no referrer on record for purchase {0}")]
    NoReferrer(Uuid),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("status tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("disbursement failed: {0}")]
    Disbursement(String),

    #[error("price feed error: {0}")]
    Oracle(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SettlementError>;
