//! Hash functions for hash-family vindexes.
//!
//! All of them digest the canonical byte encoding of the sharding key and
//! keep the first 8 bytes, big-endian. The choice of digest is part of the
//! vindex definition; changing it reshards the keyspace.

use std::io::Cursor;

use shardgate_config::HashFunction;
use uuid::Uuid;

use super::error::Error;
use crate::net::Datum;

/// Canonical byte encoding of a sharding key value.
///
/// Integers encode as 8 bytes big-endian, strings as UTF-8. A string that
/// parses as a UUID encodes as its 16 raw bytes so that case and hyphen
/// variants hash identically. Bytes pass through.
pub fn encode_key(value: &Datum) -> Result<Vec<u8>, Error> {
    match value {
        Datum::Null => Err(Error::NullShardingKey),
        Datum::Bigint(value) => Ok(value.to_be_bytes().to_vec()),
        Datum::Double(value) if value.fract() == 0.0 => {
            Ok((*value as i64).to_be_bytes().to_vec())
        }
        Datum::Double(_) => Err(Error::UnsupportedKeyType("fractional double")),
        Datum::Numeric(value) => {
            use rust_decimal::prelude::ToPrimitive;
            value
                .to_i64()
                .map(|v| v.to_be_bytes().to_vec())
                .ok_or(Error::UnsupportedKeyType("fractional numeric"))
        }
        Datum::Text(text) => {
            if let Ok(uuid) = text.parse::<Uuid>() {
                Ok(uuid.as_bytes().to_vec())
            } else {
                Ok(text.as_bytes().to_vec())
            }
        }
        Datum::Bytes(bytes) => Ok(bytes.clone()),
        Datum::Boolean(_) => Err(Error::UnsupportedKeyType("boolean")),
        Datum::Timestamp(_) => Err(Error::UnsupportedKeyType("timestamp")),
        Datum::Json(_) => Err(Error::UnsupportedKeyType("json")),
    }
}

/// First 8 digest bytes as a big-endian keyspace id.
pub fn digest(hasher: HashFunction, bytes: &[u8]) -> u64 {
    match hasher {
        HashFunction::Md5 => {
            let digest = md5::compute(bytes);
            u64::from_be_bytes(digest.0[..8].try_into().expect("md5 is 16 bytes"))
        }
        HashFunction::Xxhash => xxhash_rust::xxh64::xxh64(bytes, 0),
        HashFunction::Murmur3 => {
            let hash = murmur3::murmur3_x64_128(&mut Cursor::new(bytes), 0)
                .expect("in-memory cursor cannot fail");
            (hash >> 64) as u64
        }
    }
}

/// Hash a sharding key value to its keyspace id.
pub fn hash_key(hasher: HashFunction, value: &Datum) -> Result<u64, Error> {
    Ok(digest(hasher, &encode_key(value)?))
}
