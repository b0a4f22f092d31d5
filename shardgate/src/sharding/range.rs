//! Range vindex: explicit intervals over integer keys.

use shardgate_config::RangeMapping;

use super::error::Error;
use crate::net::Datum;

/// Ordered, non-overlapping `[start, end)` intervals, each naming a shard.
/// A boundary value belongs to the interval it starts.
#[derive(Debug, Clone)]
pub struct RangeVindex {
    mappings: Vec<RangeMapping>,
}

impl RangeVindex {
    pub fn new(mut mappings: Vec<RangeMapping>) -> Result<Self, Error> {
        mappings.sort_by_key(|mapping| mapping.start.unwrap_or(i64::MIN));
        for window in mappings.windows(2) {
            let (previous, next) = (&window[0], &window[1]);
            let gap_ok = match (previous.end, next.start) {
                (Some(end), Some(start)) => end <= start,
                // An open end swallows everything after it.
                (None, _) => false,
                // An open start on a later interval overlaps by definition.
                (_, None) => false,
            };
            if !gap_ok {
                return Err(Error::OverlappingRanges(
                    next.start.unwrap_or(i64::MIN),
                ));
            }
        }
        Ok(Self { mappings })
    }

    /// Shards whose intervals intersect `[low, high]`, in interval
    /// order. Open bounds extend to the end of the domain.
    pub fn shards_for_range(&self, low: Option<i64>, high: Option<i64>) -> Vec<&str> {
        self.mappings
            .iter()
            .filter(|mapping| {
                let below = match (high, mapping.start) {
                    (Some(high), Some(start)) => high >= start,
                    _ => true,
                };
                let above = match (low, mapping.end) {
                    (Some(low), Some(end)) => low < end,
                    _ => true,
                };
                below && above
            })
            .map(|mapping| mapping.shard.as_str())
            .collect()
    }

    /// The shard whose interval contains the value, if any.
    pub fn find_shard(&self, value: &Datum) -> Result<Option<&str>, Error> {
        let value = match value {
            Datum::Null => return Err(Error::NullShardingKey),
            Datum::Bigint(value) => *value,
            Datum::Double(double) if double.fract() == 0.0 => *double as i64,
            other => {
                return Err(Error::UnsupportedKeyType(match other {
                    Datum::Text(_) => "text",
                    _ => "non-integer",
                }))
            }
        };

        for mapping in &self.mappings {
            let above_start = mapping.start.map(|start| value >= start).unwrap_or(true);
            let below_end = mapping.end.map(|end| value < end).unwrap_or(true);
            if above_start && below_end {
                return Ok(Some(&mapping.shard));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn mapping(start: Option<i64>, end: Option<i64>, shard: &str) -> RangeMapping {
        RangeMapping {
            start,
            end,
            shard: shard.into(),
        }
    }

    fn vindex() -> RangeVindex {
        RangeVindex::new(vec![
            mapping(None, Some(100), "cold"),
            mapping(Some(100), Some(1000), "warm"),
            mapping(Some(1000), None, "hot"),
        ])
        .unwrap()
    }

    #[test]
    fn test_interval_lookup() {
        let vindex = vindex();
        assert_eq!(
            vindex.find_shard(&Datum::Bigint(-5)).unwrap(),
            Some("cold")
        );
        assert_eq!(
            vindex.find_shard(&Datum::Bigint(500)).unwrap(),
            Some("warm")
        );
        assert_eq!(
            vindex.find_shard(&Datum::Bigint(99_999)).unwrap(),
            Some("hot")
        );
    }

    #[test]
    fn test_boundary_goes_up() {
        let vindex = vindex();
        assert_eq!(vindex.find_shard(&Datum::Bigint(99)).unwrap(), Some("cold"));
        assert_eq!(
            vindex.find_shard(&Datum::Bigint(100)).unwrap(),
            Some("warm")
        );
        assert_eq!(
            vindex.find_shard(&Datum::Bigint(1000)).unwrap(),
            Some("hot")
        );
    }

    #[test]
    fn test_no_match() {
        let vindex = RangeVindex::new(vec![mapping(Some(0), Some(10), "only")]).unwrap();
        assert_eq!(vindex.find_shard(&Datum::Bigint(10)).unwrap(), None);
        assert_eq!(vindex.find_shard(&Datum::Bigint(-1)).unwrap(), None);
    }

    #[test]
    fn test_overlap_rejected() {
        let result = RangeVindex::new(vec![
            mapping(Some(0), Some(100), "a"),
            mapping(Some(50), Some(150), "b"),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_null_fails() {
        assert!(vindex().find_shard(&Datum::Null).is_err());
    }
}
