//! Transaction handle state.

use std::time::Instant;

use tokio::sync::OwnedSemaphorePermit;

use crate::engine::{EngineTransaction, PrepareToken};

/// Lifecycle of a handle. Terminal states are reentrant in the same
/// direction and fail when crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    /// Persisted under a token, awaiting commit/rollback-prepared.
    Prepared,
    Committed,
    RolledBack,
    /// Force-rolled-back by the transaction timeout.
    Expired,
}

impl TxState {
    pub fn terminal(&self) -> bool {
        matches!(self, TxState::Committed | TxState::RolledBack | TxState::Expired)
    }
}

/// One registered transaction. The engine half lives in `engine_tx` and
/// is taken out of the slot for the duration of each engine call so the
/// registry lock never spans an await.
pub(super) struct TransactionSlot {
    pub state: TxState,
    pub engine_tx: Option<Box<dyn EngineTransaction>>,
    pub token: Option<PrepareToken>,
    pub deadline: Option<Instant>,
    pub read_only: bool,
    /// Held while a write transaction is open on a single-writer engine.
    pub write_permit: Option<OwnedSemaphorePermit>,
    pub operations: u64,
}

impl TransactionSlot {
    pub fn expired(&self, now: Instant) -> bool {
        !self.state.terminal() && self.deadline.map(|deadline| now > deadline).unwrap_or(false)
    }
}
