//! Declarative sharding model.
//!
//! The VSchema tells the gateway how each keyspace is split: which vindexes
//! exist, which column of each table feeds which vindex, and which key
//! ranges the shards cover. It is ordinary configuration, loadable from
//! TOML or JSON.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::error::Error;
use super::key_range::KeyRange;

/// How a vindex turns a column value into keyspace ids.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VindexType {
    /// Digest of the canonical byte encoding of the value (default).
    #[default]
    Hash,
    /// Token ring with virtual nodes.
    ConsistentHash,
    /// Explicit `[from, to)` intervals assigned to shards.
    Range,
    /// Backed by an external lookup table, non-unique.
    Lookup,
    /// Backed by an external lookup table, unique.
    LookupUnique,
    /// Lookup table whose resolved value is then hashed.
    LookupHash,
    /// Identity: the integer value is the keyspace id.
    Numeric,
    /// md5 of the raw bytes of the value.
    BinaryMd5,
    /// Everything maps to keyspace id zero.
    Null,
}

impl VindexType {
    /// A unique vindex maps a value to at most one keyspace id.
    pub fn unique(&self) -> bool {
        matches!(
            self,
            VindexType::Hash
                | VindexType::ConsistentHash
                | VindexType::Range
                | VindexType::Numeric
                | VindexType::BinaryMd5
                | VindexType::LookupUnique
        )
    }

    /// Mapping requires a round trip to a lookup table.
    pub fn needs_lookup(&self) -> bool {
        matches!(
            self,
            VindexType::Lookup | VindexType::LookupUnique | VindexType::LookupHash
        )
    }
}

/// Hash function used by hash-family vindexes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HashFunction {
    /// First 8 bytes of the md5 digest (default).
    #[default]
    Md5,
    /// xxh64.
    Xxhash,
    /// murmur3, first 8 bytes of the x64/128 digest.
    Murmur3,
}

/// One `[from, to)` interval of a range vindex. Open bounds cover the
/// remainder of the domain on that side.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RangeMapping {
    #[serde(default)]
    pub start: Option<i64>,
    #[serde(default)]
    pub end: Option<i64>,
    pub shard: String,
}

/// A vindex declaration inside a keyspace.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct VindexDef {
    #[serde(rename = "type", default)]
    pub kind: VindexType,

    /// Hash function, hash-family vindexes only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hasher: Option<HashFunction>,

    /// Virtual nodes per shard, consistent-hash only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vnodes: Option<usize>,

    /// Intervals, range vindex only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ranges: Vec<RangeMapping>,

    /// `keyspace.table` holding the mapping, lookup vindexes only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup_table: Option<String>,

    /// Lookup table columns, `[from, to]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

impl VindexDef {
    pub fn hash() -> Self {
        Self::default()
    }

    pub fn hash_with(hasher: HashFunction) -> Self {
        Self {
            hasher: Some(hasher),
            ..Default::default()
        }
    }

    pub fn consistent_hash(vnodes: usize) -> Self {
        Self {
            kind: VindexType::ConsistentHash,
            vnodes: Some(vnodes),
            ..Default::default()
        }
    }

    pub fn range(ranges: Vec<RangeMapping>) -> Self {
        Self {
            kind: VindexType::Range,
            ranges,
            ..Default::default()
        }
    }

    pub fn lookup(table: &str, from: &str, to: &str, unique: bool) -> Self {
        Self {
            kind: if unique {
                VindexType::LookupUnique
            } else {
                VindexType::Lookup
            },
            lookup_table: Some(table.into()),
            from: Some(from.into()),
            to: Some(to.into()),
            ..Default::default()
        }
    }

    pub fn unique(&self) -> bool {
        self.kind.unique()
    }

    pub fn needs_lookup(&self) -> bool {
        self.kind.needs_lookup()
    }
}

/// Role a table plays in the keyspace.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    #[default]
    Ordinary,
    /// Backs auto-increment columns of other tables.
    Sequence,
    /// Small table copied to every shard.
    Reference,
}

/// Binds one column (or column tuple) of a table to a vindex by name.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ColumnVindex {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,
    pub name: String,
}

impl ColumnVindex {
    pub fn new(column: &str, vindex: &str) -> Self {
        Self {
            column: Some(column.into()),
            columns: vec![],
            name: vindex.into(),
        }
    }

    /// Effective column list, whichever of `column`/`columns` was used.
    pub fn column_names(&self) -> Vec<&str> {
        if let Some(column) = &self.column {
            vec![column.as_str()]
        } else {
            self.columns.iter().map(|c| c.as_str()).collect()
        }
    }

    /// The first (routing) column.
    pub fn first_column(&self) -> Option<&str> {
        self.column_names().first().copied()
    }
}

/// Auto-increment declaration for a table column.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AutoIncrement {
    pub column: String,
    /// `keyspace.table` or bare table name of a sequence table.
    pub sequence: String,
}

/// Per-table sharding configuration.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Table {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub column_vindexes: Vec<ColumnVindex>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_increment: Option<AutoIncrement>,

    #[serde(default)]
    pub kind: TableKind,
}

impl Table {
    pub fn sharded(column: &str, vindex: &str) -> Self {
        Self {
            column_vindexes: vec![ColumnVindex::new(column, vindex)],
            ..Default::default()
        }
    }

    pub fn sequence() -> Self {
        Self {
            kind: TableKind::Sequence,
            ..Default::default()
        }
    }

    pub fn reference() -> Self {
        Self {
            kind: TableKind::Reference,
            ..Default::default()
        }
    }

    /// The first column vindex routes the table.
    pub fn primary_vindex(&self) -> Option<&ColumnVindex> {
        self.column_vindexes.first()
    }
}

/// One keyspace: a logical database, possibly sharded.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Keyspace {
    #[serde(default)]
    pub sharded: bool,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub vindexes: IndexMap<String, VindexDef>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub tables: IndexMap<String, Table>,

    /// Shard names in range order. Empty means the single `"-"` shard.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shards: Vec<String>,
}

impl Keyspace {
    /// Shard names; an unsharded keyspace reports `["-"]`.
    pub fn shard_names(&self) -> Vec<String> {
        if !self.sharded || self.shards.is_empty() {
            vec!["-".into()]
        } else {
            self.shards.clone()
        }
    }

    /// Parsed, ordered shard ranges.
    pub fn key_ranges(&self) -> Result<Vec<KeyRange>, Error> {
        self.shard_names()
            .iter()
            .map(|name| name.parse())
            .collect()
    }
}

/// The whole sharding configuration: keyspace name → keyspace.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct VSchema {
    #[serde(default)]
    pub keyspaces: IndexMap<String, Keyspace>,
}

impl VSchema {
    /// Parse from JSON text.
    pub fn from_json(text: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(text)?)
    }

    /// Parse from an already-decoded JSON value.
    pub fn from_json_value(value: serde_json::Value) -> Result<Self, Error> {
        Ok(serde_json::from_value(value)?)
    }

    /// Parse from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, Error> {
        Ok(toml::from_str(text)?)
    }

    pub fn keyspace(&self, name: &str) -> Option<&Keyspace> {
        self.keyspaces.get(name)
    }

    pub fn is_sharded(&self, keyspace: &str) -> bool {
        self.keyspace(keyspace)
            .map(|ks| ks.sharded)
            .unwrap_or(false)
    }

    pub fn table(&self, keyspace: &str, table: &str) -> Option<&Table> {
        self.keyspace(keyspace)?.tables.get(table)
    }

    /// Find the keyspace holding a table. Ambiguity resolves to the first
    /// keyspace in declaration order.
    pub fn find_table(&self, table: &str) -> Option<(&str, &Keyspace, &Table)> {
        self.keyspaces
            .iter()
            .find_map(|(name, ks)| ks.tables.get(table).map(|t| (name.as_str(), ks, t)))
    }

    /// Shard names of a keyspace; unsharded reports `["-"]`.
    pub fn shards(&self, keyspace: &str) -> Result<Vec<String>, Error> {
        let ks = self
            .keyspace(keyspace)
            .ok_or_else(|| Error::UnknownKeyspace(keyspace.into()))?;
        Ok(ks.shard_names())
    }

    /// The primary vindex definition of a table, with its name.
    pub fn primary_vindex<'a>(
        &'a self,
        keyspace: &str,
        table: &str,
    ) -> Result<(&'a ColumnVindex, &'a VindexDef), Error> {
        let ks = self
            .keyspace(keyspace)
            .ok_or_else(|| Error::UnknownKeyspace(keyspace.into()))?;
        let table_def = ks.tables.get(table).ok_or_else(|| Error::UnknownTable {
            keyspace: keyspace.into(),
            table: table.into(),
        })?;
        let column_vindex =
            table_def
                .primary_vindex()
                .ok_or_else(|| Error::NoPrimaryVindex {
                    keyspace: keyspace.into(),
                    table: table.into(),
                })?;
        let vindex = ks
            .vindexes
            .get(&column_vindex.name)
            .ok_or_else(|| Error::UnknownKeyspace(column_vindex.name.clone()))?;
        Ok((column_vindex, vindex))
    }

    /// Resolve a sequence reference (`ks.table` or bare table name) to its
    /// keyspace and table.
    pub fn resolve_sequence(&self, reference: &str) -> Option<(&str, &Table)> {
        if let Some((keyspace, table)) = reference.split_once('.') {
            let found = self.table(keyspace, table)?;
            let name = self.keyspaces.get_key_value(keyspace)?.0;
            return Some((name.as_str(), found));
        }
        self.keyspaces.iter().find_map(|(name, ks)| {
            ks.tables
                .get(reference)
                .filter(|t| t.kind == TableKind::Sequence)
                .map(|t| (name.as_str(), t))
        })
    }
}
