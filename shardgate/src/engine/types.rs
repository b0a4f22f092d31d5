//! Native → canonical type mapping.

use crate::net::DataType;

/// Map a Postgres type name to the canonical set.
pub fn from_postgres_name(native: &str) -> DataType {
    match native.to_lowercase().as_str() {
        "int2" | "smallint" | "int4" | "int" | "integer" | "serial" | "smallserial" => {
            DataType::Int
        }
        "int8" | "bigint" | "bigserial" => DataType::Bigint,
        "float4" | "real" | "float8" | "double precision" => DataType::Float,
        "numeric" | "decimal" | "money" => DataType::Numeric,
        "text" | "varchar" | "char" | "bpchar" | "character varying" | "character" | "name"
        | "citext" => DataType::Text,
        "bool" | "boolean" => DataType::Bool,
        "json" | "jsonb" => DataType::Json,
        "date" => DataType::Date,
        "time" | "timetz" | "time without time zone" | "time with time zone" => DataType::Time,
        "timestamp" | "timestamptz" | "timestamp without time zone"
        | "timestamp with time zone" => DataType::Timestamp,
        "uuid" => DataType::Uuid,
        "bytea" => DataType::Bytea,
        _ => DataType::Unknown,
    }
}

/// Map a Postgres type OID to the canonical set, common OIDs only.
pub fn from_postgres_oid(oid: u32) -> DataType {
    match oid {
        16 => DataType::Bool,
        17 => DataType::Bytea,
        20 => DataType::Bigint,
        21 | 23 => DataType::Int,
        25 | 1042 | 1043 => DataType::Text,
        114 | 3802 => DataType::Json,
        700 | 701 => DataType::Float,
        1082 => DataType::Date,
        1083 | 1266 => DataType::Time,
        1114 | 1184 => DataType::Timestamp,
        1700 => DataType::Numeric,
        2950 => DataType::Uuid,
        _ => DataType::Unknown,
    }
}

/// Map a SQLite declared type to the canonical set, by affinity.
pub fn from_sqlite_decl(decl: &str) -> DataType {
    let upper = decl.to_uppercase();
    if upper.contains("TIMESTAMP") || upper.contains("DATETIME") {
        DataType::Timestamp
    } else if upper.contains("DATE") {
        DataType::Date
    } else if upper.contains("TIME") {
        DataType::Time
    } else if upper.contains("BOOL") {
        DataType::Bool
    } else if upper.contains("INT") {
        DataType::Bigint
    } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
        DataType::Text
    } else if upper.contains("BLOB") {
        DataType::Bytea
    } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
        DataType::Float
    } else if upper.contains("NUMERIC") || upper.contains("DECIMAL") {
        DataType::Numeric
    } else if upper.contains("JSON") {
        DataType::Json
    } else if upper.contains("UUID") {
        DataType::Uuid
    } else {
        DataType::Unknown
    }
}
