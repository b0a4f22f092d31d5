//! Tablet errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("engine: {0}")]
    Engine(#[from] crate::engine::Error),

    #[error("transaction limit reached ({limit})")]
    TooManyTransactions { limit: usize },

    #[error("no transaction {0} on this tablet")]
    TransactionNotFound(u64),

    #[error("transaction {id} is busy")]
    TransactionBusy { id: u64 },

    #[error("cannot switch engines with {active} open transaction(s)")]
    SwapWithOpenTransactions { active: usize },

    #[error("new engine failed probe: {0}")]
    ProbeFailed(crate::engine::Error),
}

impl Error {
    /// Stable code symbol, engine errors pass through.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Engine(engine) => engine.code(),
            Error::TooManyTransactions { .. } => "TOO_MANY_TRANSACTIONS",
            Error::TransactionNotFound(_) => "TRANSACTION_NOT_FOUND",
            Error::TransactionBusy { .. } => "TRANSACTION_ERROR",
            Error::SwapWithOpenTransactions { .. } => "TRANSACTION_ERROR",
            Error::ProbeFailed(_) => "NOT_READY",
        }
    }
}
