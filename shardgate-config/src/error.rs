//! Configuration errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid key range \"{range}\": {reason}")]
    InvalidKeyRange { range: String, reason: String },

    #[error("unknown keyspace \"{0}\"")]
    UnknownKeyspace(String),

    #[error("unknown table \"{keyspace}.{table}\"")]
    UnknownTable { keyspace: String, table: String },

    #[error("table \"{keyspace}.{table}\" has no column vindexes")]
    NoPrimaryVindex { keyspace: String, table: String },

    #[error("toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
