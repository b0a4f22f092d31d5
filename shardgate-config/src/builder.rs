//! Fluent VSchema construction, mostly for tests and embedded setups.

use super::vschema::{
    AutoIncrement, ColumnVindex, Keyspace, Table, TableKind, VSchema, VindexDef,
};

/// Builds a [`VSchema`] one call at a time. Keyspaces are created on first
/// mention; later calls refine them.
#[derive(Debug, Default)]
pub struct VSchemaBuilder {
    vschema: VSchema,
}

impl VSchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn keyspace_mut(&mut self, name: &str) -> &mut Keyspace {
        self.vschema
            .keyspaces
            .entry(name.to_string())
            .or_insert_with(Keyspace::default)
    }

    /// Declare a sharded keyspace with the given shard ranges.
    pub fn sharded_keyspace<S: AsRef<str>>(mut self, name: &str, shards: &[S]) -> Self {
        let keyspace = self.keyspace_mut(name);
        keyspace.sharded = true;
        keyspace.shards = shards.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    /// Declare an unsharded keyspace (single `"-"` shard).
    pub fn unsharded_keyspace(mut self, name: &str) -> Self {
        self.keyspace_mut(name);
        self
    }

    pub fn vindex(mut self, keyspace: &str, name: &str, def: VindexDef) -> Self {
        self.keyspace_mut(keyspace)
            .vindexes
            .insert(name.to_string(), def);
        self
    }

    /// Declare an ordinary table with one column vindex per `(column, vindex)`
    /// pair, first pair primary.
    pub fn table(mut self, keyspace: &str, name: &str, vindexes: &[(&str, &str)]) -> Self {
        let table = Table {
            column_vindexes: vindexes
                .iter()
                .map(|(column, vindex)| ColumnVindex::new(column, vindex))
                .collect(),
            ..Default::default()
        };
        self.keyspace_mut(keyspace)
            .tables
            .insert(name.to_string(), table);
        self
    }

    pub fn sequence(mut self, keyspace: &str, name: &str) -> Self {
        self.keyspace_mut(keyspace)
            .tables
            .insert(name.to_string(), Table::sequence());
        self
    }

    pub fn reference_table(mut self, keyspace: &str, name: &str) -> Self {
        self.keyspace_mut(keyspace)
            .tables
            .insert(name.to_string(), Table::reference());
        self
    }

    /// Attach an auto-increment column to an existing table.
    pub fn auto_increment(
        mut self,
        keyspace: &str,
        table: &str,
        column: &str,
        sequence: &str,
    ) -> Self {
        if let Some(table) = self.keyspace_mut(keyspace).tables.get_mut(table) {
            table.auto_increment = Some(AutoIncrement {
                column: column.to_string(),
                sequence: sequence.to_string(),
            });
        }
        self
    }

    pub fn build(self) -> VSchema {
        self.vschema
    }
}

impl VSchema {
    pub fn builder() -> VSchemaBuilder {
        VSchemaBuilder::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vschema::VindexType;

    #[test]
    fn test_builder() {
        let vschema = VSchema::builder()
            .sharded_keyspace("app", &["-80", "80-"])
            .vindex("app", "user_hash", VindexDef::hash())
            .table("app", "users", &[("id", "user_hash")])
            .table("app", "orders", &[("user_id", "user_hash")])
            .unsharded_keyspace("global")
            .sequence("global", "order_seq")
            .auto_increment("app", "orders", "id", "order_seq")
            .build();

        assert!(vschema.validate().valid());
        assert_eq!(vschema.keyspaces.len(), 2);
        assert_eq!(
            vschema.table("app", "orders").unwrap().kind,
            TableKind::Ordinary
        );
        assert_eq!(
            vschema.primary_vindex("app", "users").unwrap().1.kind,
            VindexType::Hash
        );
    }

    #[test]
    fn test_builder_sequence_resolves() {
        let vschema = VSchema::builder()
            .unsharded_keyspace("global")
            .sequence("global", "seq")
            .build();
        let (keyspace, table) = vschema.resolve_sequence("seq").unwrap();
        assert_eq!(keyspace, "global");
        assert_eq!(table.kind, TableKind::Sequence);
    }
}
