//! Exit code acceptance policies for container commands
//!
//! Pre- and post-commands report an exit code which is classified by a policy:
//!
//! - `fail` (default): any non-zero exit code fails the command
//! - `ignore`: every exit code is accepted
//! - custom: comma-separated inclusive ranges, e.g. `0,2-4,-1` or `-5--1`
//!
//! Whitespace is ignored, so `0, 2 - 4` is the same as `0,2-4`. Ranges written
//! backwards (`4-2`) are normalised.

use crate::error::{Result, SalvageError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

/// How the exit code of a container command is judged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ExitCodePolicy {
    /// Only exit code 0 is accepted
    #[default]
    FailIfNonZero,

    /// Exit code is ignored
    Ignore,

    /// Exit code must fall into one of the ranges
    Custom(Vec<RangeInclusive<i64>>),
}

impl ExitCodePolicy {
    /// Check whether `exit_code` is accepted by this policy
    pub fn accepts(&self, exit_code: i64) -> bool {
        match self {
            Self::FailIfNonZero => exit_code == 0,
            Self::Ignore => true,
            Self::Custom(ranges) => ranges.iter().any(|r| r.contains(&exit_code)),
        }
    }
}

impl FromStr for ExitCodePolicy {
    type Err = SalvageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fail" => return Ok(Self::FailIfNonZero),
            "ignore" => return Ok(Self::Ignore),
            _ => {}
        }

        let value: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        let ranges = value
            .split(',')
            .map(parse_range)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::Custom(ranges))
    }
}

impl fmt::Display for ExitCodePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FailIfNonZero => write!(f, "fail"),
            Self::Ignore => write!(f, "ignore"),
            Self::Custom(ranges) => {
                let parts: Vec<String> = ranges
                    .iter()
                    .map(|r| {
                        if r.start() == r.end() {
                            r.start().to_string()
                        } else {
                            format!("{}-{}", r.start(), r.end())
                        }
                    })
                    .collect();
                write!(f, "{}", parts.join(","))
            }
        }
    }
}

/// Parse `N`, `A-B` or any of those with negative numbers
fn parse_range(part: &str) -> Result<RangeInclusive<i64>> {
    if let Some(number) = parse_number(part) {
        return Ok(number..=number);
    }

    // separator is the first '-' that directly follows a digit
    let bytes = part.as_bytes();
    let separator = (1..bytes.len())
        .find(|&i| bytes[i] == b'-' && bytes[i - 1].is_ascii_digit())
        .ok_or_else(|| SalvageError::ExitCodePolicy(part.to_string()))?;

    let start = parse_number(&part[..separator]);
    let end = parse_number(&part[separator + 1..]);
    match (start, end) {
        (Some(start), Some(end)) if start <= end => Ok(start..=end),
        (Some(start), Some(end)) => Ok(end..=start),
        _ => Err(SalvageError::ExitCodePolicy(part.to_string())),
    }
}

/// Strict `-?\d+` number parsing
fn parse_number(s: &str) -> Option<i64> {
    let digits = s.strip_prefix('-').unwrap_or(s);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_policies() {
        let fail: ExitCodePolicy = "fail".parse().unwrap();
        assert!(fail.accepts(0));
        assert!(!fail.accepts(1));
        assert!(!fail.accepts(-1));

        let ignore: ExitCodePolicy = "ignore".parse().unwrap();
        assert!(ignore.accepts(0));
        assert!(ignore.accepts(137));
        assert!(ignore.accepts(-1));
    }

    #[test]
    fn test_default_is_fail_if_non_zero() {
        assert_eq!(ExitCodePolicy::default(), ExitCodePolicy::FailIfNonZero);
    }

    #[test]
    fn test_custom_policy_scenario() {
        let policy: ExitCodePolicy = "0,2-4,-1".parse().unwrap();
        for accepted in [0, 2, 3, 4, -1] {
            assert!(policy.accepts(accepted), "{} should be accepted", accepted);
        }
        for rejected in [1, 5, -2, 255, i64::MIN, i64::MAX] {
            assert!(!policy.accepts(rejected), "{} should be rejected", rejected);
        }
    }

    #[test]
    fn test_negative_ranges() {
        let policy: ExitCodePolicy = "-5--1".parse().unwrap();
        assert_eq!(policy, ExitCodePolicy::Custom(vec![-5..=-1]));

        let policy: ExitCodePolicy = "1--1".parse().unwrap();
        assert_eq!(policy, ExitCodePolicy::Custom(vec![-1..=1]));

        let policy: ExitCodePolicy = "-2-1".parse().unwrap();
        assert_eq!(policy, ExitCodePolicy::Custom(vec![-2..=1]));
    }

    #[test]
    fn test_whitespace_and_reversed_ranges() {
        let policy: ExitCodePolicy = " 0 , 4 - 2 ".parse().unwrap();
        assert_eq!(policy, ExitCodePolicy::Custom(vec![0..=0, 2..=4]));
    }

    #[test]
    fn test_invalid_policies() {
        for invalid in ["", "abc", "1-", "-", "1,,2", "+3", "1-2-3", "1..3"] {
            assert!(
                invalid.parse::<ExitCodePolicy>().is_err(),
                "'{}' should not parse",
                invalid
            );
        }
    }

    #[test]
    fn test_display() {
        let policy: ExitCodePolicy = "0,2-4,-1".parse().unwrap();
        assert_eq!(policy.to_string(), "0,2-4,-1");
        assert_eq!(ExitCodePolicy::Ignore.to_string(), "ignore");
    }
}
