//! Aggregation errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot merge {function} without per-shard helper columns {missing}")]
    MissingHelperColumns {
        function: &'static str,
        missing: &'static str,
    },

    #[error("column \"{0}\" is absent from the shard results")]
    MissingColumn(String),

    #[error("cannot add {0} values")]
    NotSummable(&'static str),
}
