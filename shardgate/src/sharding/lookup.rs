//! Lookup vindex.
//!
//! The value → keyspace-id mapping lives in a SQL table, usually in an
//! unsharded keyspace. Synchronous `map()` is impossible; the router emits
//! a lookup plan instead, and the write path maintains the table through
//! [`LookupVindex::create`] / [`LookupVindex::delete`].

use shardgate_config::VindexDef;

use super::error::Error;
use crate::engine::StorageEngine;
use crate::net::Datum;

#[derive(Debug, Clone)]
pub struct LookupVindex {
    table: String,
    from_column: String,
    to_column: String,
    unique: bool,
}

impl LookupVindex {
    pub fn from_def(def: &VindexDef) -> Option<Self> {
        let table = def.lookup_table.clone()?;
        // Strip the keyspace qualifier; the caller already picked the
        // keyspace's tablet.
        let table = table
            .rsplit_once('.')
            .map(|(_, name)| name.to_string())
            .unwrap_or(table);
        Some(Self {
            table,
            from_column: def.from.clone().unwrap_or_else(|| "from_value".into()),
            to_column: def.to.clone().unwrap_or_else(|| "keyspace_id".into()),
            unique: def.kind.unique(),
        })
    }

    pub fn unique(&self) -> bool {
        self.unique
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn to_column(&self) -> &str {
        &self.to_column
    }

    /// The SELECT that resolves a value to its keyspace ids.
    pub fn select_sql(&self) -> String {
        format!(
            "SELECT {} FROM {} WHERE {} = $1",
            self.to_column, self.table, self.from_column
        )
    }

    /// Resolve a value through the lookup table.
    pub async fn resolve(
        &self,
        engine: &dyn StorageEngine,
        value: &Datum,
    ) -> Result<Vec<u64>, Error> {
        if value.is_null() {
            return Err(Error::NullShardingKey);
        }
        let result = engine.query(&self.select_sql(), &[value.clone()]).await?;
        let ids = result
            .rows
            .iter()
            .filter_map(|row| row.get(&self.to_column))
            .filter_map(|datum| datum.as_i64())
            .map(|id| id as u64)
            .collect();
        Ok(ids)
    }

    /// Insert `(value, keyspace id)` mappings.
    pub async fn create(
        &self,
        engine: &dyn StorageEngine,
        values: &[Datum],
        ids: &[u64],
    ) -> Result<(), Error> {
        let sql = format!(
            "INSERT INTO {} ({}, {}) VALUES ($1, $2)",
            self.table, self.from_column, self.to_column
        );
        for (value, id) in values.iter().zip(ids) {
            engine
                .execute(&sql, &[value.clone(), Datum::Bigint(*id as i64)])
                .await?;
        }
        Ok(())
    }

    /// Check each `(value, keyspace id)` pair exists.
    pub async fn verify(
        &self,
        engine: &dyn StorageEngine,
        values: &[Datum],
        ids: &[u64],
    ) -> Result<Vec<bool>, Error> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = $1 AND {} = $2",
            self.to_column, self.table, self.from_column, self.to_column
        );
        let mut found = Vec::with_capacity(values.len());
        for (value, id) in values.iter().zip(ids) {
            let result = engine
                .query(&sql, &[value.clone(), Datum::Bigint(*id as i64)])
                .await?;
            found.push(!result.rows.is_empty());
        }
        Ok(found)
    }

    /// Remove `(value, keyspace id)` mappings.
    pub async fn delete(
        &self,
        engine: &dyn StorageEngine,
        values: &[Datum],
        ids: &[u64],
    ) -> Result<(), Error> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = $1 AND {} = $2",
            self.table, self.from_column, self.to_column
        );
        for (value, id) in values.iter().zip(ids) {
            engine
                .execute(&sql, &[value.clone(), Datum::Bigint(*id as i64)])
                .await?;
        }
        Ok(())
    }
}
