//! Coordinator errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown distributed transaction \"{0}\"")]
    UnknownGtid(String),

    #[error("shard \"{0}\" is not part of this gateway")]
    UnknownShard(String),

    #[error("transaction \"{gtid}\" is not prepared on every participant")]
    NotPrepared { gtid: String },

    #[error("transaction \"{gtid}\" already aborted")]
    AlreadyAborted { gtid: String },

    #[error("commit of \"{gtid}\" incomplete: {failed:?} still unresolved")]
    CommitIncomplete { gtid: String, failed: Vec<String> },

    #[error("tablet: {0}")]
    Tablet(#[from] crate::tablet::Error),

    #[error("prepare log: {0}")]
    Log(#[from] std::io::Error),

    #[error("prepare log record: {0}")]
    LogFormat(#[from] serde_json::Error),
}
