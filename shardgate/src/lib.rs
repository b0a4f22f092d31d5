//! Sharded SQL gateway.
//!
//! One logical database over N independent storage shards, each running
//! its own SQL engine. Clients send ordinary SQL; the gateway parses just
//! enough to route, scatters work across shards, reassembles results, and
//! coordinates atomic cross-shard writes with two-phase commit.
//!
//! The layers, bottom up:
//!
//! - [`sharding`]: vindexes, sharding-key value to keyspace id to shard.
//! - [`engine`]: the narrow storage-engine interface and the
//!   Postgres-family / SQLite-family adapters with dialect translation.
//! - [`tablet`]: per-shard executor with transactions, deadlines and
//!   engine hot swap.
//! - [`aggregate`]: cross-shard merging of COUNT/SUM/AVG/MIN/MAX,
//!   GROUP BY, the k-way ORDER BY merge and streaming accumulation.
//! - [`twopc`]: the distributed-transaction coordinator and its durable
//!   prepare log.
//! - [`gate`]: routing, scatter-gather and the client-facing surface.
//! - [`net`]: wire value, result and envelope types.
//!
//! The sharding model itself lives in the [`shardgate_config`] crate.

pub mod aggregate;
pub mod engine;
pub mod gate;
pub mod net;
pub mod sharding;
pub mod stats;
pub mod tablet;
pub mod twopc;

pub use gate::{Gateway, GatewayOptions};
pub use shardgate_config as config;
