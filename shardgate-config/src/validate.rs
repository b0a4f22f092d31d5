//! VSchema validation.
//!
//! Structural mistakes are tagged errors; configurations that work but
//! will behave badly (scatter-prone primary vindexes, coverage gaps) are
//! warnings.

use std::fmt::Display;

use tracing::warn;

use super::key_range::KeyRange;
use super::vschema::{TableKind, VSchema, VindexType};

/// A structural problem that makes the VSchema unusable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Sharded keyspace declares no vindexes.
    MissingVindex { keyspace: String },
    /// Lookup vindex has no lookup table.
    MissingLookupTable { keyspace: String, vindex: String },
    /// Sharded ordinary table has no column vindexes.
    MissingPrimaryVindex { keyspace: String, table: String },
    /// Table references a vindex the keyspace does not define.
    UnknownVindex {
        keyspace: String,
        table: String,
        vindex: String,
    },
    /// Auto-increment names a sequence that does not resolve.
    MissingSequence {
        keyspace: String,
        table: String,
        sequence: String,
    },
    /// Ill-formed, inverted, out-of-order or overlapping shard range.
    InvalidShardRange {
        keyspace: String,
        range: String,
        reason: String,
    },
}

impl ValidationError {
    /// Stable code tag.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingVindex { .. } => "MISSING_VINDEX",
            Self::MissingLookupTable { .. } => "MISSING_LOOKUP_TABLE",
            Self::MissingPrimaryVindex { .. } => "MISSING_PRIMARY_VINDEX",
            Self::UnknownVindex { .. } => "UNKNOWN_VINDEX",
            Self::MissingSequence { .. } => "MISSING_SEQUENCE",
            Self::InvalidShardRange { .. } => "INVALID_SHARD_RANGE",
        }
    }
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingVindex { keyspace } => {
                write!(f, "sharded keyspace \"{}\" has no vindexes", keyspace)
            }
            Self::MissingLookupTable { keyspace, vindex } => write!(
                f,
                "lookup vindex \"{}.{}\" has no lookup_table",
                keyspace, vindex
            ),
            Self::MissingPrimaryVindex { keyspace, table } => write!(
                f,
                "sharded table \"{}.{}\" has no column vindexes",
                keyspace, table
            ),
            Self::UnknownVindex {
                keyspace,
                table,
                vindex,
            } => write!(
                f,
                "table \"{}.{}\" references undefined vindex \"{}\"",
                keyspace, table, vindex
            ),
            Self::MissingSequence {
                keyspace,
                table,
                sequence,
            } => write!(
                f,
                "auto-increment on \"{}.{}\" names unknown sequence \"{}\"",
                keyspace, table, sequence
            ),
            Self::InvalidShardRange {
                keyspace,
                range,
                reason,
            } => write!(
                f,
                "keyspace \"{}\" shard range \"{}\": {}",
                keyspace, range, reason
            ),
        }
    }
}

/// A configuration that works but deserves a second look.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationWarning {
    /// Non-unique primary vindex: point lookups may scatter.
    NonUniquePrimaryVindex {
        keyspace: String,
        table: String,
        vindex: String,
    },
    /// Shard ranges do not cover the whole keyspace-id space.
    ShardRangeGap { keyspace: String, detail: String },
}

impl Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonUniquePrimaryVindex {
                keyspace,
                table,
                vindex,
            } => write!(
                f,
                "primary vindex \"{}\" of \"{}.{}\" is not unique, point queries will scatter",
                vindex, keyspace, table
            ),
            Self::ShardRangeGap { keyspace, detail } => {
                write!(f, "keyspace \"{}\" shard ranges leave a gap: {}", keyspace, detail)
            }
        }
    }
}

/// Result of validating a VSchema.
#[derive(Debug, Default)]
pub struct ValidationOutcome {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationOutcome {
    pub fn valid(&self) -> bool {
        self.errors.is_empty()
    }
}

impl VSchema {
    /// Check every invariant of the sharding model. Collects all problems
    /// rather than stopping at the first one.
    pub fn validate(&self) -> ValidationOutcome {
        let mut outcome = ValidationOutcome::default();

        for (ks_name, keyspace) in &self.keyspaces {
            if keyspace.sharded && keyspace.vindexes.is_empty() {
                outcome.errors.push(ValidationError::MissingVindex {
                    keyspace: ks_name.clone(),
                });
            }

            for (vindex_name, vindex) in &keyspace.vindexes {
                if vindex.needs_lookup() && vindex.lookup_table.is_none() {
                    outcome.errors.push(ValidationError::MissingLookupTable {
                        keyspace: ks_name.clone(),
                        vindex: vindex_name.clone(),
                    });
                }
            }

            for (table_name, table) in &keyspace.tables {
                let ordinary = table.kind == TableKind::Ordinary;

                if keyspace.sharded && ordinary && table.column_vindexes.is_empty() {
                    outcome.errors.push(ValidationError::MissingPrimaryVindex {
                        keyspace: ks_name.clone(),
                        table: table_name.clone(),
                    });
                }

                for (position, column_vindex) in table.column_vindexes.iter().enumerate() {
                    match keyspace.vindexes.get(&column_vindex.name) {
                        None => outcome.errors.push(ValidationError::UnknownVindex {
                            keyspace: ks_name.clone(),
                            table: table_name.clone(),
                            vindex: column_vindex.name.clone(),
                        }),
                        Some(vindex) => {
                            if position == 0 && ordinary && !vindex.unique() {
                                outcome.warnings.push(
                                    ValidationWarning::NonUniquePrimaryVindex {
                                        keyspace: ks_name.clone(),
                                        table: table_name.clone(),
                                        vindex: column_vindex.name.clone(),
                                    },
                                );
                            }
                        }
                    }
                }

                if let Some(auto_increment) = &table.auto_increment {
                    let resolved = self
                        .resolve_sequence(&auto_increment.sequence)
                        .map(|(_, t)| t.kind == TableKind::Sequence)
                        .unwrap_or(false);
                    if !resolved {
                        outcome.errors.push(ValidationError::MissingSequence {
                            keyspace: ks_name.clone(),
                            table: table_name.clone(),
                            sequence: auto_increment.sequence.clone(),
                        });
                    }
                }
            }

            // Consistent-hash keyspaces address shards by ring token, not
            // key range; their shard names are opaque.
            let range_addressed = keyspace.vindexes.is_empty()
                || keyspace
                    .vindexes
                    .values()
                    .any(|vindex| vindex.kind != VindexType::ConsistentHash);
            if range_addressed {
                self.check_shard_ranges(ks_name, &keyspace.shard_names(), &mut outcome);
            }
        }

        for warning in &outcome.warnings {
            warn!("{}", warning);
        }

        outcome
    }

    fn check_shard_ranges(
        &self,
        ks_name: &str,
        shard_names: &[String],
        outcome: &mut ValidationOutcome,
    ) {
        let mut ranges: Vec<KeyRange> = Vec::with_capacity(shard_names.len());
        for name in shard_names {
            match name.parse::<KeyRange>() {
                Ok(range) => ranges.push(range),
                Err(err) => {
                    outcome.errors.push(ValidationError::InvalidShardRange {
                        keyspace: ks_name.into(),
                        range: name.clone(),
                        reason: err.to_string(),
                    });
                    return;
                }
            }
        }

        for window in ranges.windows(2) {
            let (previous, next) = (&window[0], &window[1]);
            match previous.end() {
                None => {
                    outcome.errors.push(ValidationError::InvalidShardRange {
                        keyspace: ks_name.into(),
                        range: next.to_string(),
                        reason: "follows an open-ended range".into(),
                    });
                    return;
                }
                Some(end) if end > next.start() => {
                    outcome.errors.push(ValidationError::InvalidShardRange {
                        keyspace: ks_name.into(),
                        range: next.to_string(),
                        reason: format!("overlaps \"{}\"", previous),
                    });
                    return;
                }
                Some(end) if end < next.start() => {
                    outcome.warnings.push(ValidationWarning::ShardRangeGap {
                        keyspace: ks_name.into(),
                        detail: format!("between \"{}\" and \"{}\"", previous, next),
                    });
                }
                Some(_) => {}
            }
        }

        if let Some(first) = ranges.first() {
            if first.start() != 0 {
                outcome.warnings.push(ValidationWarning::ShardRangeGap {
                    keyspace: ks_name.into(),
                    detail: format!("space before \"{}\" is uncovered", first),
                });
            }
        }
        if let Some(last) = ranges.last() {
            if last.end().is_some() {
                outcome.warnings.push(ValidationWarning::ShardRangeGap {
                    keyspace: ks_name.into(),
                    detail: format!("space after \"{}\" is uncovered", last),
                });
            }
        }
    }
}
