use std::fmt;
use std::str::FromStr;

use derive_more::Display;
use serde::Serialize;

use crate::record::PeID;

/// Ordered, disjoint, inclusive ranges of PEs whose logs could be read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidPeRange {
    ranges: Vec<(PeID, PeID)>,
}

impl ValidPeRange {
    pub fn ranges(&self) -> &[(PeID, PeID)] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of PEs covered.
    pub fn len(&self) -> usize {
        self.ranges
            .iter()
            .map(|(first, last)| (i64::from(last.0) - i64::from(first.0)) as usize + 1)
            .sum()
    }

    pub fn contains(&self, pe: PeID) -> bool {
        self.ranges
            .iter()
            .any(|(first, last)| *first <= pe && pe <= *last)
    }

    pub fn iter(&self) -> impl Iterator<Item = PeID> + '_ {
        self.ranges
            .iter()
            .flat_map(|(first, last)| (first.0..=last.0).map(PeID))
    }
}

impl fmt::Display for ValidPeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (first, last)) in self.ranges.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            if first == last {
                write!(f, "{}", first)?;
            } else {
                write!(f, "{}-{}", first, last)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Display)]
#[display("invalid PE list {_0:?}")]
pub struct ParsePeRangeError(String);

impl std::error::Error for ParsePeRangeError {}

// Accepts the same "0-1,3" form the ranges display as. Overlapping or
// unordered input is normalized.
impl FromStr for ValidPeRange {
    type Err = ParsePeRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParsePeRangeError(s.to_owned());
        let mut parts = Vec::new();
        for part in s.split(',').map(str::trim).filter(|x| !x.is_empty()) {
            let (first, last) = match part.split_once('-') {
                Some((first, last)) => (first.trim(), last.trim()),
                None => (part, part),
            };
            let first: i32 = first.parse().map_err(|_| err())?;
            let last: i32 = last.parse().map_err(|_| err())?;
            if first < 0 || last < first {
                return Err(err());
            }
            parts.push((first, last));
        }
        parts.sort_unstable();

        let mut ranges: Vec<(PeID, PeID)> = Vec::new();
        for (first, last) in parts {
            match ranges.last_mut() {
                // Overlapping or adjacent ranges merge.
                Some((_, end)) if i64::from(first) <= i64::from(end.0) + 1 => {
                    *end = (*end).max(PeID(last));
                }
                _ => ranges.push((PeID(first), PeID(last))),
            }
        }
        Ok(ValidPeRange { ranges })
    }
}

/// Coalesces per-PE existence observations, made in increasing PE order,
/// into ranges.
#[derive(Debug, Default)]
pub struct ValidPeRangeTracker {
    ranges: Vec<(PeID, PeID)>,
    open: Option<(PeID, PeID)>,
}

impl ValidPeRangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, pe: PeID, exists: bool) {
        if !exists {
            self.ranges.extend(self.open.take());
            return;
        }
        self.open = match self.open.take() {
            Some((first, last)) if last.0.checked_add(1) == Some(pe.0) => Some((first, pe)),
            Some(range) => {
                self.ranges.push(range);
                Some((pe, pe))
            }
            None => Some((pe, pe)),
        };
    }

    pub fn finalize(mut self) -> ValidPeRange {
        self.ranges.extend(self.open.take());
        ValidPeRange {
            ranges: self.ranges,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(exists: &[bool]) -> ValidPeRange {
        let mut tracker = ValidPeRangeTracker::new();
        for (pe, exists) in exists.iter().enumerate() {
            tracker.observe(PeID(pe as i32), *exists);
        }
        tracker.finalize()
    }

    #[test]
    fn test_coalesce() {
        let range = track(&[true, true, false, true]);
        assert_eq!(range.to_string(), "0-1,3");
        assert_eq!(range.ranges(), &[(PeID(0), PeID(1)), (PeID(3), PeID(3))]);
        assert_eq!(range.len(), 3);
        assert!(range.contains(PeID(1)));
        assert!(!range.contains(PeID(2)));
        assert_eq!(
            range.iter().collect::<Vec<_>>(),
            vec![PeID(0), PeID(1), PeID(3)]
        );
    }

    #[test]
    fn test_edges() {
        assert_eq!(track(&[]).to_string(), "");
        assert!(track(&[false, false]).is_empty());
        assert_eq!(track(&[false, true, true, true]).to_string(), "1-3");
        assert_eq!(track(&[true, false, true, false, true]).to_string(), "0,2,4");
    }

    #[test]
    fn test_gap_without_false() {
        // Skipped PEs split a range even if never observed as missing.
        let mut tracker = ValidPeRangeTracker::new();
        tracker.observe(PeID(0), true);
        tracker.observe(PeID(5), true);
        tracker.observe(PeID(6), true);
        assert_eq!(tracker.finalize().to_string(), "0,5-6");
    }

    #[test]
    fn test_parse() {
        let range: ValidPeRange = "0-1,3".parse().unwrap();
        assert_eq!(range, track(&[true, true, false, true]));
        let range: ValidPeRange = "4, 2-3 ,0".parse().unwrap();
        assert_eq!(range.to_string(), "0,2-4");
        assert!("3-1".parse::<ValidPeRange>().is_err());
        assert!("a".parse::<ValidPeRange>().is_err());
        assert!("-2".parse::<ValidPeRange>().is_err());
        let range: ValidPeRange = "0-5,9,3-8".parse().unwrap();
        assert_eq!(range.to_string(), "0-9");
    }

    #[test]
    fn test_full_pe_space() {
        let range: ValidPeRange = "0-2147483647".parse().unwrap();
        assert_eq!(range.ranges(), &[(PeID(0), PeID(i32::MAX))]);
        assert_eq!(range.len(), 1 << 31);
        assert!(range.contains(PeID(i32::MAX)));
        assert_eq!(range.iter().take(2).collect::<Vec<_>>(), vec![PeID(0), PeID(1)]);

        let mut tracker = ValidPeRangeTracker::new();
        tracker.observe(PeID(i32::MAX - 1), true);
        tracker.observe(PeID(i32::MAX), true);
        assert_eq!(tracker.finalize().to_string(), "2147483646-2147483647");
    }
}
