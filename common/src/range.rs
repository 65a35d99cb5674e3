//! Numeric range/list expressions such as `"1-10, 15 20-22"`.
//!
//! The same syntax is used for run lists and for Z ranges of calibrations.
//! An empty expression, or the keyword `all`, matches every value.
use std::{fmt::Display, ops::RangeInclusive, str::FromStr};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum RangeParseError {
    #[error("Invalid number '{0}' in range expression")]
    InvalidNumber(String),
    #[error("Reversed interval '{0}': lower bound exceeds upper bound")]
    Reversed(String),
    #[error("Malformed interval '{0}'")]
    Malformed(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum NumericRange {
    /// Matches every value.
    #[default]
    All,
    /// Sorted, non-overlapping, non-adjacent inclusive intervals.
    Intervals(Vec<RangeInclusive<i64>>),
}

impl NumericRange {
    pub fn from_intervals<I: IntoIterator<Item = RangeInclusive<i64>>>(intervals: I) -> Self {
        let mut intervals: Vec<_> = intervals.into_iter().collect();
        intervals.sort_by_key(|r| *r.start());

        let mut merged: Vec<RangeInclusive<i64>> = Vec::with_capacity(intervals.len());
        for interval in intervals {
            match merged.last_mut() {
                Some(last) if *interval.start() <= last.end().saturating_add(1) => {
                    if interval.end() > last.end() {
                        *last = *last.start()..=*interval.end();
                    }
                }
                _ => merged.push(interval),
            }
        }
        Self::Intervals(merged)
    }

    pub fn contains(&self, value: i64) -> bool {
        match self {
            Self::All => true,
            Self::Intervals(intervals) => intervals.iter().any(|r| r.contains(&value)),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }

    /// Number of values in the range, `None` for the unbounded range.
    pub fn count(&self) -> Option<usize> {
        match self {
            Self::All => None,
            Self::Intervals(intervals) => Some(
                intervals
                    .iter()
                    .map(|r| (r.end() - r.start() + 1) as usize)
                    .sum(),
            ),
        }
    }

    /// Iterates the values of the range in increasing order.
    /// The unbounded range yields nothing.
    pub fn iter(&self) -> impl Iterator<Item = i64> + '_ {
        let intervals: &[RangeInclusive<i64>] = match self {
            Self::All => &[],
            Self::Intervals(intervals) => intervals.as_slice(),
        };
        intervals.iter().flat_map(|r| r.clone())
    }

    pub fn first(&self) -> Option<i64> {
        self.iter().next()
    }

    pub fn last(&self) -> Option<i64> {
        match self {
            Self::All => None,
            Self::Intervals(intervals) => intervals.last().map(|r| *r.end()),
        }
    }
}

fn parse_bound(token: &str, whole: &str) -> Result<i64, RangeParseError> {
    token
        .trim()
        .parse()
        .map_err(|_| RangeParseError::InvalidNumber(whole.to_owned()))
}

impl FromStr for NumericRange {
    type Err = RangeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }

        let intervals = trimmed
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|token| !token.is_empty())
            .map(|token| {
                // A leading '-' would be a sign, not a separator.
                match token.get(1..).and_then(|rest| rest.find('-')).map(|i| i + 1) {
                    Some(split) => {
                        let (lower, upper) = token.split_at(split);
                        let upper = upper.get(1..).unwrap_or_default();
                        if upper.is_empty() {
                            return Err(RangeParseError::Malformed(token.to_owned()));
                        }
                        let lower = parse_bound(lower, token)?;
                        let upper = parse_bound(upper, token)?;
                        if lower > upper {
                            return Err(RangeParseError::Reversed(token.to_owned()));
                        }
                        Ok(lower..=upper)
                    }
                    None => parse_bound(token, token).map(|v| v..=v),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::from_intervals(intervals))
    }
}

impl Display for NumericRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Intervals(intervals) => {
                let mut first = true;
                for interval in intervals {
                    if !first {
                        write!(f, ",")?;
                    }
                    first = false;
                    if interval.start() == interval.end() {
                        write!(f, "{}", interval.start())?;
                    } else {
                        write!(f, "{}-{}", interval.start(), interval.end())?;
                    }
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_all() {
        let range: NumericRange = "".parse().unwrap();
        assert!(range.is_all());
        assert!(range.contains(123456));
        assert_eq!(range.iter().count(), 0);
    }

    #[test]
    fn mixed_separators() {
        let range: NumericRange = "1-3, 7 9-10".parse().unwrap();
        assert_eq!(range.iter().collect::<Vec<_>>(), vec![1, 2, 3, 7, 9, 10]);
        assert!(range.contains(2));
        assert!(!range.contains(8));
        assert_eq!(range.count(), Some(6));
        assert_eq!(range.last(), Some(10));
    }

    #[test]
    fn overlapping_intervals_are_merged() {
        let range: NumericRange = "5-8,1-5,9".parse().unwrap();
        assert_eq!(range, NumericRange::Intervals(vec![1..=9]));
        assert_eq!(range.to_string(), "1-9");
    }

    #[test]
    fn single_values() {
        let range: NumericRange = "4".parse().unwrap();
        assert_eq!(range.first(), Some(4));
        assert_eq!(range.to_string(), "4");
    }

    #[test]
    fn errors() {
        assert_eq!(
            "3-1".parse::<NumericRange>(),
            Err(RangeParseError::Reversed("3-1".to_owned()))
        );
        assert_eq!(
            "a-4".parse::<NumericRange>(),
            Err(RangeParseError::InvalidNumber("a-4".to_owned()))
        );
        assert_eq!(
            "4-".parse::<NumericRange>(),
            Err(RangeParseError::Malformed("4-".to_owned()))
        );
    }
}
