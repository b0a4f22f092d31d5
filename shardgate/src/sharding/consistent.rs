//! Consistent-hash ring.
//!
//! Each shard owns `vnodes` tokens on a circular 64-bit space. A keyspace
//! id belongs to the shard owning the first token at or clockwise of it.
//! Adding a shard moves roughly `1/n` of the keys.

use shardgate_config::HashFunction;

use super::error::Error;
use super::hasher::digest;

pub const DEFAULT_VNODES: usize = 150;

#[derive(Debug, Clone)]
pub struct HashRing {
    /// `(token, shard index)` sorted by token.
    tokens: Vec<(u64, usize)>,
    shards: Vec<String>,
}

impl HashRing {
    /// Place `vnodes × shards.len()` tokens on the ring.
    pub fn new<S: AsRef<str>>(shards: &[S], vnodes: usize) -> Result<Self, Error> {
        if shards.is_empty() {
            return Err(Error::EmptyRing);
        }

        let mut tokens = Vec::with_capacity(shards.len() * vnodes);
        for (index, shard) in shards.iter().enumerate() {
            for replica in 0..vnodes {
                let key = format!("{}:{}", shard.as_ref(), replica);
                tokens.push((digest(HashFunction::Md5, key.as_bytes()), index));
            }
        }
        tokens.sort_unstable();

        Ok(Self {
            tokens,
            shards: shards.iter().map(|s| s.as_ref().to_string()).collect(),
        })
    }

    pub fn shards(&self) -> &[String] {
        &self.shards
    }

    /// Walk clockwise to the first token, wrapping at the end of the space.
    pub fn shard_for(&self, keyspace_id: u64) -> &str {
        let index = match self
            .tokens
            .binary_search_by(|(token, _)| token.cmp(&keyspace_id))
        {
            Ok(found) => found,
            Err(insert) if insert == self.tokens.len() => 0,
            Err(insert) => insert,
        };
        &self.shards[self.tokens[index].1]
    }
}
