use rust_decimal::Decimal;
use thiserror::Error;

/// Storage-level failures (journal I/O, encoding)
/// These are infrastructure errors, never business rule violations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt journal at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },
}

/// Errors returned by ledger, escrow and dispute operations
///
/// Everything except `Conflict` and `Store` is a domain error: the request
/// itself was invalid for the current state and retrying it unchanged will
/// fail again.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("amount {amount} outside allowed range [{min}, {max}]")]
    AmountOutOfRange {
        amount: Decimal,
        min: Decimal,
        max: Decimal,
    },

    #[error("escrow {0} already has an open dispute")]
    DuplicateDispute(String),

    #[error("dispute {0} is already resolved")]
    AlreadyResolved(String),

    #[error("escrow is disabled")]
    EscrowDisabled,

    #[error("payment failed: {0}")]
    PaymentFailed(String),

    #[error("record {0} is busy, try again later")]
    Conflict(String),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl CoreError {
    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        CoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// True when the caller's request was rejected by a business rule,
    /// false for "try again later" infrastructure failures
    pub fn is_domain(&self) -> bool {
        !matches!(self, CoreError::Conflict(_) | CoreError::Store(_))
    }
}

/// Errors from the batch replay tool (I/O and CSV parsing)
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Core(#[from] CoreError),
}

pub type Result<T> = std::result::Result<T, CoreError>;
pub type StoreResult<T> = std::result::Result<T, StoreError>;
