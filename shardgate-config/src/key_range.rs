//! Shard key ranges.
//!
//! A shard covers a half-open range of 8-byte keyspace ids, written in hex
//! with a dash: `"-80"` is `[0x00.., 0x80..)`, `"80-"` is `[0x80.., end)`,
//! `"40-80"` is closed-open, and `"-"` is the whole space.

use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::Error;

/// Half-open range of keyspace ids hosted by one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyRange {
    start: u64,
    /// Exclusive upper bound. `None` means the end of the space.
    end: Option<u64>,
}

impl KeyRange {
    /// The whole keyspace-id space. This is the single shard of an
    /// unsharded keyspace.
    pub fn full() -> Self {
        Self {
            start: 0,
            end: None,
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> Option<u64> {
        self.end
    }

    /// Range covers every keyspace id.
    pub fn is_full(&self) -> bool {
        self.start == 0 && self.end.is_none()
    }

    /// Inclusion test for a keyspace id.
    pub fn contains(&self, keyspace_id: u64) -> bool {
        keyspace_id >= self.start && self.end.map(|end| keyspace_id < end).unwrap_or(true)
    }

    /// Two ranges are adjacent when one ends exactly where the other starts.
    pub fn adjacent_to(&self, next: &KeyRange) -> bool {
        self.end == Some(next.start)
    }

    fn parse_bound(hex: &str) -> Result<u64, Error> {
        if hex.len() > 16 || hex.len() % 2 != 0 {
            return Err(Error::InvalidKeyRange {
                range: hex.into(),
                reason: "bound must be an even number of hex digits, at most 16".into(),
            });
        }
        let mut value: u64 = 0;
        for c in hex.chars() {
            let digit = c.to_digit(16).ok_or_else(|| Error::InvalidKeyRange {
                range: hex.into(),
                reason: format!("'{}' is not a hex digit", c),
            })?;
            value = (value << 4) | digit as u64;
        }
        // Bounds are prefixes of the 8-byte id, left-aligned.
        Ok(value << (64 - hex.len() as u32 * 4))
    }

    fn format_bound(value: u64) -> String {
        let mut hex = format!("{:016x}", value);
        while hex.len() > 2 && hex.ends_with("00") {
            hex.truncate(hex.len() - 2);
        }
        hex
    }
}

impl FromStr for KeyRange {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let text = text.trim().to_lowercase();
        let Some((start, end)) = text.split_once('-') else {
            return Err(Error::InvalidKeyRange {
                range: text,
                reason: "missing '-' separator".into(),
            });
        };

        let start_value = if start.is_empty() {
            0
        } else {
            Self::parse_bound(start)?
        };
        let end_value = if end.is_empty() {
            None
        } else {
            Some(Self::parse_bound(end)?)
        };

        if let Some(end_value) = end_value {
            if start_value >= end_value {
                return Err(Error::InvalidKeyRange {
                    range: text,
                    reason: "start is not below end".into(),
                });
            }
        }

        Ok(Self {
            start: start_value,
            end: end_value,
        })
    }
}

impl Display for KeyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let start = if self.start == 0 {
            String::new()
        } else {
            Self::format_bound(self.start)
        };
        let end = match self.end {
            Some(end) => Self::format_bound(end),
            None => String::new(),
        };
        write!(f, "{}-{}", start, end)
    }
}

impl Serialize for KeyRange {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for KeyRange {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
