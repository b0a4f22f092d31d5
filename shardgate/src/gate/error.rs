//! Gateway errors.
//!
//! Per-shard failures surface at the scatter boundary with the shard id
//! attached; planning errors are local and carry no shard.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("table \"{0}\" is not in the vschema")]
    TableNotFound(String),

    #[error("keyspace \"{0}\" is not in the vschema")]
    KeyspaceNotFound(String),

    #[error("insert into \"{table}\" is missing sharding key column \"{column}\"")]
    ShardingKeyRequired { table: String, column: String },

    #[error("vindex \"{vindex}\" referenced by \"{table}\" is not defined")]
    UnknownVindex { table: String, vindex: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("vschema is invalid: {0}")]
    InvalidVSchema(String),

    #[error("no tablet serves \"{keyspace}\" shard \"{shard}\"")]
    NoTablet { keyspace: String, shard: String },

    #[error("unsupported statement: {0}")]
    Unsupported(String),

    #[error("shard \"{shard}\": {source}")]
    Shard {
        shard: String,
        source: crate::tablet::Error,
    },

    #[error("shard \"{shard}\" timed out after {after:?}")]
    Timeout { shard: String, after: Duration },

    #[error("write failed on shard \"{shard}\": {reason}")]
    ShardWrite { shard: String, reason: String },

    #[error(transparent)]
    Tablet(#[from] crate::tablet::Error),

    #[error(transparent)]
    Sharding(#[from] crate::sharding::Error),

    #[error(transparent)]
    Aggregate(#[from] crate::aggregate::Error),

    #[error(transparent)]
    TwoPc(#[from] crate::twopc::Error),

    #[error(transparent)]
    Config(#[from] shardgate_config::Error),
}

impl Error {
    /// Stable code symbol for the wire error body.
    pub fn code(&self) -> &'static str {
        match self {
            Error::TableNotFound(_) => "TABLE_NOT_FOUND",
            Error::KeyspaceNotFound(_) => "KEYSPACE_NOT_FOUND",
            Error::ShardingKeyRequired { .. } => "SHARDING_KEY_REQUIRED",
            Error::UnknownVindex { .. } => "UNKNOWN_VINDEX",
            Error::Parse(_) => "SYNTAX_ERROR",
            Error::InvalidVSchema(_) => "QUERY_ERROR",
            Error::NoTablet { .. } => "CONNECTION_FAILED",
            Error::Unsupported(_) => "UNSUPPORTED",
            Error::Shard { source, .. } => source.code(),
            Error::Timeout { .. } => "TIMEOUT",
            Error::ShardWrite { .. } => "SHARD_WRITE_ERROR",
            Error::Tablet(tablet) => tablet.code(),
            Error::Sharding(_) => "QUERY_ERROR",
            Error::Aggregate(_) => "QUERY_ERROR",
            Error::TwoPc(_) => "TRANSACTION_ERROR",
            Error::Config(_) => "QUERY_ERROR",
        }
    }

    /// Shard the error is attributable to, if any.
    pub fn shard(&self) -> Option<&str> {
        match self {
            Error::Shard { shard, .. }
            | Error::Timeout { shard, .. }
            | Error::ShardWrite { shard, .. } => Some(shard),
            _ => None,
        }
    }
}
