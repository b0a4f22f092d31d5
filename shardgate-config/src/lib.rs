//! Declarative sharding configuration for shardgate.
//!
//! The VSchema describes keyspaces, their vindexes, table bindings and
//! shard ranges. The gateway consumes it read-only; this crate owns
//! parsing (TOML/JSON), the key-range text codec, validation and a
//! fluent builder.

pub mod builder;
pub mod error;
pub mod key_range;
pub mod validate;
pub mod vschema;

pub use builder::VSchemaBuilder;
pub use error::Error;
pub use key_range::KeyRange;
pub use validate::{ValidationError, ValidationOutcome, ValidationWarning};
pub use vschema::{
    AutoIncrement, ColumnVindex, HashFunction, Keyspace, RangeMapping, Table, TableKind, VSchema,
    VindexDef, VindexType,
};
