//! Sharding errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot shard a null value")]
    NullShardingKey,

    #[error("cannot derive a sharding key from a {0} value")]
    UnsupportedKeyType(&'static str),

    #[error("vindex produced no keyspace id")]
    EmptyMapping,

    #[error("vindex requires a lookup table round trip")]
    NeedsLookup,

    #[error("keyspace id {0:#018x} is outside every shard range")]
    NoShardForKey(u64),

    #[error("range mappings overlap at {0}")]
    OverlappingRanges(i64),

    #[error("hash ring has no shards")]
    EmptyRing,

    #[error("config: {0}")]
    Config(#[from] shardgate_config::Error),

    #[error("lookup table: {0}")]
    Lookup(#[from] Box<crate::engine::Error>),
}

impl From<crate::engine::Error> for Error {
    fn from(value: crate::engine::Error) -> Self {
        Self::Lookup(Box::new(value))
    }
}
